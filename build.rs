//! Build script for model-host.
//!
//! The crate builds without a native inference library: the stub engine in
//! `inference::llama_ffi` stands in for it. When `LLAMA_LIB_DIR` points at a
//! prebuilt llama.cpp, its directory is added to the link search path and
//! `libllama` is linked for engine implementations that bind to it.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LLAMA_LIB_DIR");

    if let Ok(dir) = std::env::var("LLAMA_LIB_DIR") {
        println!("cargo:rustc-link-search=native={dir}");
        println!("cargo:rustc-link-lib=dylib=llama");
    }
}
