fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "none" {
        let script = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("linker.ld");
        println!("cargo:rustc-link-arg=-T{}", script.display());
        println!("cargo:rerun-if-changed=linker.ld");
    }
}
