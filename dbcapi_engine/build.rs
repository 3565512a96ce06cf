use std::env;
use std::path::PathBuf;

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let out_dir = PathBuf::from(&crate_dir).join("include");

    std::fs::create_dir_all(&out_dir).unwrap();

    let config_path = PathBuf::from(&crate_dir).join("cbindgen.toml");
    cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_config(cbindgen::Config::from_file(&config_path).unwrap())
        .generate()
        .expect("Unable to generate bindings")
        .write_to_file(out_dir.join("dbcapi_engine.h"));

    println!("cargo:rerun-if-changed=cbindgen.toml");
    println!("cargo:rerun-if-changed=src/ffi/mod.rs");
}
