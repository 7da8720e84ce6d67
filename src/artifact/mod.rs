//! On-disk model artifacts.
//!
//! - [`locator`]: first-match search over ordered candidate paths
//! - [`validator`]: GGUF header inspection without loading the model

pub mod locator;
pub mod validator;
