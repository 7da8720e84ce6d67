//! GGUF artifact validation.
//!
//! Reads just enough of a model file to judge whether it is plausible:
//! size floor, the 4-byte `GGUF` tag, and the little-endian format version
//! that follows it. Nothing here loads the model.
//!
//! Size and magic problems block loading. A suspicious version is advisory;
//! the caller decides what to do with it (see [`VersionPolicy`]).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Expected format tag at offset 0.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Anything smaller than this cannot be a real model for this engine class.
pub const MIN_ARTIFACT_BYTES: u64 = 1024 * 1024;

/// Upper sanity bound for the format version.
pub const MAX_FORMAT_VERSION: u32 = 1000;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Failed to read header of {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of inspecting an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationVerdict {
    Valid,
    TooSmall,
    BadMagic,
    UnreadableHeader,
    /// Version is 0 or above the sanity bound. Advisory only.
    SuspiciousVersion,
}

impl ValidationVerdict {
    /// Whether this verdict must stop a load attempt regardless of policy.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            ValidationVerdict::TooSmall
                | ValidationVerdict::BadMagic
                | ValidationVerdict::UnreadableHeader
        )
    }
}

impl std::fmt::Display for ValidationVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationVerdict::Valid => write!(f, "valid"),
            ValidationVerdict::TooSmall => write!(f, "file too small"),
            ValidationVerdict::BadMagic => write!(f, "bad magic (not a GGUF file)"),
            ValidationVerdict::UnreadableHeader => write!(f, "unreadable header"),
            ValidationVerdict::SuspiciousVersion => write!(f, "suspicious format version"),
        }
    }
}

/// What callers do with a [`ValidationVerdict::SuspiciousVersion`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Log a warning and load anyway.
    #[default]
    Warn,
    /// Treat it like a blocking verdict.
    Reject,
}

impl VersionPolicy {
    /// Whether `verdict` stops a load under this policy.
    pub fn blocks(&self, verdict: ValidationVerdict) -> bool {
        verdict.is_blocking()
            || (*self == VersionPolicy::Reject && verdict == ValidationVerdict::SuspiciousVersion)
    }
}

/// Raw header facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub magic_ok: bool,
    pub version: u32,
    pub size_bytes: u64,
}

/// Thresholds used by [`Validator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Files below this size are rejected as implausible.
    pub min_size_bytes: u64,

    /// Versions above this are flagged as suspicious.
    pub max_version: u32,

    /// Whether a suspicious version blocks loading.
    pub suspicious_version: VersionPolicy,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: MIN_ARTIFACT_BYTES,
            max_version: MAX_FORMAT_VERSION,
            suspicious_version: VersionPolicy::Warn,
        }
    }
}

/// Read the first 8 bytes of `path`: magic and version.
pub fn read_header(path: &Path) -> Result<ArtifactHeader, HeaderError> {
    let unreadable = |source| HeaderError::Unreadable {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(unreadable)?;
    let size_bytes = file.metadata().map_err(unreadable)?.len();
    read_open_header(&mut file, size_bytes).map_err(unreadable)
}

fn read_open_header(file: &mut File, size_bytes: u64) -> std::io::Result<ArtifactHeader> {
    let mut header = [0u8; 8];
    file.read_exact(&mut header)?;

    let magic_ok = header[..4] == GGUF_MAGIC;
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    Ok(ArtifactHeader {
        magic_ok,
        version,
        size_bytes,
    })
}

/// Validates artifacts against a [`ValidationConfig`].
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Inspect `path` and return a verdict. Never fails.
    pub fn validate(&self, path: &Path) -> ValidationVerdict {
        // A file that cannot be opened is no more usable than an empty one.
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %path.display(), "Artifact cannot be opened: {e}");
                return ValidationVerdict::TooSmall;
            }
        };
        // Size comes first so short files report TooSmall whatever their header says.
        let size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => return ValidationVerdict::TooSmall,
        };
        if size < self.config.min_size_bytes {
            debug!(path = %path.display(), size, "Artifact below size floor");
            return ValidationVerdict::TooSmall;
        }

        let header = match read_open_header(&mut file, size) {
            Ok(header) => header,
            Err(source) => {
                let e = HeaderError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                };
                warn!("{e}");
                return ValidationVerdict::UnreadableHeader;
            }
        };

        if !header.magic_ok {
            return ValidationVerdict::BadMagic;
        }

        if header.version == 0 || header.version > self.config.max_version {
            warn!(
                path = %path.display(),
                version = header.version,
                "Suspicious GGUF version, file may be corrupted or incompatible"
            );
            return ValidationVerdict::SuspiciousVersion;
        }

        debug!(path = %path.display(), version = header.version, size, "Artifact header valid");
        ValidationVerdict::Valid
    }

    /// Whether `verdict` stops a load under the configured version policy.
    pub fn blocks(&self, verdict: ValidationVerdict) -> bool {
        self.config.suspicious_version.blocks(verdict)
    }
}

/// Validate with the default thresholds.
pub fn validate(path: &Path) -> ValidationVerdict {
    Validator::default().validate(path)
}
