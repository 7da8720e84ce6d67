//! Native inference engine seam.
//!
//! - [`engine`]: `NativeEngine` / `EngineFactory` traits and the registry-owned `NativeContext`
//! - [`llama_ffi`]: llama.cpp load parameters and the stub engine

pub mod engine;
pub mod llama_ffi;
