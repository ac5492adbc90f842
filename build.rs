fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    // cl-sys does not look in vcpkg installs; OPENCL_PATH points at one.
    if target_os == "windows" {
        println!("cargo:rerun-if-env-changed=OPENCL_PATH");
        if let Ok(opencl_path) = std::env::var("OPENCL_PATH") {
            println!("cargo:rustc-link-search=native={}/lib", opencl_path);
            println!("cargo:rustc-link-search=native={}\\lib", opencl_path);
        }
    }
}
