//! Resilient model loading.
//!
//! - [`tiers`]: baseline parameters plus named per-tier overrides
//! - [`containment`]: scoped in-process fault containment around one attempt
//! - [`isolation`]: out-of-process pre-flight of a tier in a worker
//! - [`resilient`]: the tier ladder itself

pub mod containment;
pub mod isolation;
pub mod resilient;
pub mod tiers;
