//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use model_host::config::Config;
use model_host::inference::llama_ffi::LlamaEngineFactory;
use model_host::service::ModelService;

pub const MIB: u64 = 1024 * 1024;

/// Write a sparse GGUF-tagged file of `size` bytes.
pub fn write_gguf(dir: &Path, name: &str, version: u32, size: u64) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut f = File::create(&path).unwrap();
    f.write_all(b"GGUF").unwrap();
    f.write_all(&version.to_le_bytes()).unwrap();
    f.set_len(size).unwrap();
    path
}

/// Write `size` zero bytes.
pub fn write_zeros(dir: &Path, name: &str, size: u64) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    File::create(&path).unwrap().set_len(size).unwrap();
    path
}

/// Config whose storage points at `models_dir`.
pub fn config_for(models_dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.search_dirs = vec![models_dir.to_path_buf()];
    config.storage.models_dir = models_dir.to_path_buf();
    config
}

pub fn service_for(models_dir: &Path) -> Arc<ModelService> {
    Arc::new(ModelService::new(&config_for(models_dir), Arc::new(LlamaEngineFactory)).unwrap())
}
