use std::env;

/// Generate C header via cbindgen (only when `gen-header` feature is active).
/// Run `cargo build --features gen-header` to regenerate `include/dpot.h`.
#[cfg(feature = "gen-header")]
fn generate_c_header(crate_dir: &str) {
    use std::path::PathBuf;

    let output_dir = PathBuf::from(crate_dir).join("include");
    std::fs::create_dir_all(&output_dir).unwrap();

    let config = cbindgen::Config::from_file(PathBuf::from(crate_dir).join("cbindgen.toml"))
        .expect("Unable to find cbindgen.toml");

    cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_config(config)
        .generate()
        .expect("Unable to generate C bindings")
        .write_to_file(output_dir.join("dpot.h"));
}

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    #[cfg(feature = "gen-header")]
    generate_c_header(&crate_dir);

    #[cfg(not(feature = "gen-header"))]
    let _ = crate_dir;
}
