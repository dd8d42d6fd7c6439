//! The engine with its default transport against the live mock origin.
//!
//! # Design
//! The origin runs on its own thread and runtime on a random port, so the
//! engine's runtime and the server never share workers. Physical transfers
//! are counted by the origin itself (`/__stats`).

mod common;

use std::net::SocketAddr;

use common::{config, wait_until, Recorder};
use mock_server::{Item, Stats, PASSWORD, USERNAME};
use netkit_core::{
    AuthChallenge, Credential, CredentialResponder, Engine, HostConfig, HttpMethod,
    ParameterEncoding, ResponseSource,
};
use tempfile::TempDir;

fn start_origin() -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });
    addr
}

fn host(addr: SocketAddr) -> HostConfig {
    HostConfig {
        name: addr.ip().to_string(),
        port: Some(addr.port()),
        secure: false,
        ..HostConfig::default()
    }
}

fn origin_engine(dir: &TempDir, addr: SocketAddr) -> Engine {
    let mut config = config(dir);
    config.host = host(addr);
    Engine::builder(config).build().unwrap()
}

async fn stats(addr: SocketAddr) -> Stats {
    tokio::task::spawn_blocking(move || {
        let body = ureq::get(&format!("http://{addr}/__stats"))
            .call()
            .unwrap()
            .body_mut()
            .read_to_string()
            .unwrap();
        serde_json::from_str::<Stats>(&body).unwrap()
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_reads_reach_the_origin_once() {
    let addr = start_origin();
    let dir = TempDir::new().unwrap();
    let engine = origin_engine(&dir, addr);
    let (a, b) = (Recorder::new(), Recorder::new());

    engine.submit(engine.request("/items/42"), a.observer());
    engine.submit(engine.request("/items/42"), b.observer());
    a.wait_for(1).await;
    b.wait_for(1).await;

    let item: Item = a.responses()[0].json().unwrap();
    assert_eq!(item.id, "42");
    assert_eq!(a.responses(), b.responses());
    assert_eq!(stats(addr).await.hits["/items/42"], 1);

    // fresh for a minute: answered from memory
    let c = Recorder::new();
    engine.submit(engine.request("/items/42"), c.observer());
    assert_eq!(c.responses()[0].source, ResponseSource::Cache);
    assert_eq!(stats(addr).await.hits["/items/42"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_entry_is_revalidated_with_its_etag() {
    let addr = start_origin();
    let dir = TempDir::new().unwrap();
    let engine = origin_engine(&dir, addr);

    let first = Recorder::new();
    engine.submit(engine.request("/items/7?max_age=0"), first.observer());
    first.wait_for(1).await;
    assert_eq!(first.responses()[0].header("etag"), Some("\"7-v1\""));

    let second = Recorder::new();
    let id = engine.submit(engine.request("/items/7?max_age=0"), second.observer());
    assert_eq!(second.responses()[0].source, ResponseSource::StaleCache);
    wait_until(|| engine.in_flight() == 0).await;
    assert_eq!(engine.state(id), Some(netkit_core::OperationState::Completed));
    assert_eq!(second.events().len(), 1);

    assert_eq!(stats(addr).await.hits["/items/7"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_store_responses_always_travel() {
    let addr = start_origin();
    let dir = TempDir::new().unwrap();
    let engine = origin_engine(&dir, addr);

    for _ in 0..2 {
        let rec = Recorder::new();
        engine.submit(engine.request("/nocache"), rec.observer());
        rec.wait_for(1).await;
        assert_eq!(rec.responses()[0].text(), "volatile");
    }
    assert_eq!(stats(addr).await.hits["/nocache"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protected_resource_asks_for_credentials() {
    let addr = start_origin();
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.host = host(addr);
    let engine = Engine::builder(config)
        .credential_handler(|challenge: AuthChallenge, responder: CredentialResponder| {
            assert_eq!(challenge.realm.as_deref(), Some(mock_server::REALM));
            responder.resolve(Credential::basic(USERNAME, PASSWORD));
        })
        .build()
        .unwrap();
    let rec = Recorder::new();

    engine.submit(engine.request("/protected"), rec.observer());
    rec.wait_for(1).await;
    assert_eq!(rec.responses()[0].status, 200);
    assert_eq!(rec.responses()[0].text(), "welcome");
    assert_eq!(stats(addr).await.hits["/protected"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_made_offline_reach_the_origin_later() {
    let addr = start_origin();
    let dir = TempDir::new().unwrap();
    let engine = origin_engine(&dir, addr);
    engine.set_reachable(false);

    let mut create = engine.request_with_params("/items", [("title", "Buy milk")], HttpMethod::Post);
    create
        .set_encoding(ParameterEncoding::Json)
        .set_freezable(true);
    let rec = Recorder::new();
    engine.submit(create, rec.observer());
    wait_until(|| engine.frozen_count() == 1).await;
    assert!(stats(addr).await.writes.is_empty());

    engine.set_reachable(true);
    wait_until(|| engine.frozen_count() == 0 && engine.in_flight() == 0).await;
    let mut writes = Vec::new();
    for _ in 0..100 {
        writes = stats(addr).await.writes;
        if !writes.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(writes, vec!["POST /items".to_string()]);
    assert!(rec.events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_lands_in_the_named_file() {
    let addr = start_origin();
    let dir = TempDir::new().unwrap();
    let engine = origin_engine(&dir, addr);
    let target = dir.path().join("downloads").join("item-42.json");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();

    let rec = Recorder::new();
    let mut op = engine.request("/items/42");
    op.set_download_path(&target);
    engine.submit(op, rec.observer());
    rec.wait_for(1).await;

    let responses = rec.responses();
    let response = &responses[0];
    assert_eq!(response.status, 200);
    assert_eq!(response.file.as_deref(), Some(target.as_path()));
    assert!(response.body.is_empty());
    let item: Item = serde_json::from_slice(&std::fs::read(&target).unwrap()).unwrap();
    assert_eq!(item.id, "42");
    assert_eq!(std::fs::read_dir(target.parent().unwrap()).unwrap().count(), 1);
    assert!(rec.progress().iter().any(|p| p.completed > 0));

    // downloads are never cached, so a repeat travels again
    let again = Recorder::new();
    let mut op = engine.request("/items/42");
    op.set_download_path(&target);
    engine.submit(op, again.observer());
    again.wait_for(1).await;
    assert_eq!(stats(addr).await.hits["/items/42"], 2);
}
