//! model-host: handle registry and resilient loader for native GGUF models.
//!
//! A host runtime asks for a model by path; this crate finds the artifact
//! across an ordered list of candidate locations, checks its header, loads it
//! into a native context with progressively more conservative settings, and
//! hands back an opaque handle:
//!
//!   Locator → Validator → Resilient loader → Handle registry → handle
//!
//! Two boundary adapters sit on top of [`service::ModelService`]: an HTTP API
//! ([`server`]) and a C ABI ([`ffi`]).

pub mod artifact;
pub mod config;
pub mod ffi;
pub mod inference;
pub mod loader;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod service;
