//! Build script for netkit-ffi
//!
//! Regenerates the C header `include/netkit.h` from the `extern "C"`
//! surface. A failed generation only warns so the library still builds.

use std::env;
use std::path::PathBuf;

fn main() {
    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()));
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/types.rs");

    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("NETKIT_H".to_string()),
        cpp_compat: true,
        ..Default::default()
    };

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            let include = crate_dir.join("include");
            if let Err(err) = std::fs::create_dir_all(&include) {
                println!("cargo:warning=cannot create {}: {err}", include.display());
                return;
            }
            bindings.write_to_file(include.join("netkit.h"));
        }
        Err(err) => println!("cargo:warning=C header not generated: {err}"),
    }
}
