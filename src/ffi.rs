//! C ABI boundary adapter.
//!
//! Handles cross the boundary as plain `u64` values and the service as an
//! opaque pointer. Every function returns an [`MhErrorCode`]; on failure a
//! message is kept per thread and read back with [`mh_last_error`]. No
//! panic escapes an `extern "C"` function.

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

use crate::config::{Config, ContainmentError};
use crate::inference::engine::EngineError;
use crate::inference::llama_ffi::LlamaEngineFactory;
use crate::registry::ModelHandle;
use crate::service::{ArtifactInfo, ModelService, ServiceError};

/// Result codes returned by every `mh_*` function.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MhErrorCode {
    Ok = 0,
    NullPointer = -1,
    InvalidParams = -2,
    NotFound = -3,
    InvalidArtifact = -4,
    LoadFailed = -5,
    InvalidHandle = -6,
    ContextLimit = -7,
    Internal = -99,
}

impl From<&ServiceError> for MhErrorCode {
    fn from(e: &ServiceError) -> Self {
        match e {
            ServiceError::NotFound { .. } => MhErrorCode::NotFound,
            ServiceError::InvalidArtifact { .. } => MhErrorCode::InvalidArtifact,
            ServiceError::LoadFailure(_) => MhErrorCode::LoadFailed,
            ServiceError::InvalidHandle(_) => MhErrorCode::InvalidHandle,
            ServiceError::ContextLimit { .. } => MhErrorCode::ContextLimit,
            ServiceError::InvalidRequest(_) | ServiceError::Engine(EngineError::InvalidInput(_)) => {
                MhErrorCode::InvalidParams
            }
            ServiceError::Engine(_) | ServiceError::Io(_) => MhErrorCode::Internal,
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: impl Into<String>) {
    let message = message.into().replace('\0', " ");
    let message = CString::new(message).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn fail(e: &ServiceError) -> MhErrorCode {
    set_last_error(e.to_string());
    MhErrorCode::from(e)
}

/// Run `f`, turning a panic into [`MhErrorCode::Internal`].
fn guarded(f: impl FnOnce() -> MhErrorCode) -> MhErrorCode {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(code) => code,
        Err(payload) => {
            let message = crate::loader::containment::payload_message(payload.as_ref());
            set_last_error(format!("internal panic: {message}"));
            MhErrorCode::Internal
        }
    }
}

unsafe fn read_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, MhErrorCode> {
    CStr::from_ptr(ptr).to_str().map_err(|_| {
        set_last_error(format!("invalid UTF-8 in {what}"));
        MhErrorCode::InvalidParams
    })
}

unsafe fn read_roots(roots: *const *const c_char, n_roots: usize) -> Result<Vec<PathBuf>, MhErrorCode> {
    if n_roots == 0 {
        return Ok(Vec::new());
    }
    if roots.is_null() {
        set_last_error("null search_roots with non-zero count");
        return Err(MhErrorCode::NullPointer);
    }
    let mut out = Vec::with_capacity(n_roots);
    for i in 0..n_roots {
        let root = *roots.add(i);
        if root.is_null() {
            set_last_error(format!("null search root at index {i}"));
            return Err(MhErrorCode::NullPointer);
        }
        out.push(PathBuf::from(read_str(root, "search root")?));
    }
    Ok(out)
}

fn into_c_string(value: String) -> *mut c_char {
    CString::new(value.replace('\0', " "))
        .unwrap_or_default()
        .into_raw()
}

/// Opaque service instance.
pub struct MhService {
    inner: ModelService,
}

/// Artifact header facts. Strings are owned by the library; release the
/// struct's contents with [`mh_free_artifact_info`].
#[repr(C)]
#[derive(Debug)]
pub struct MhArtifactInfo {
    pub path: *mut c_char,
    pub size_bytes: u64,
    pub format_version: u32,
    pub description: *mut c_char,
}

impl MhArtifactInfo {
    fn from_info(info: ArtifactInfo) -> Self {
        Self {
            path: into_c_string(info.path.display().to_string()),
            size_bytes: info.size_bytes,
            format_version: info.format_version,
            description: into_c_string(info.description),
        }
    }
}

/// Create a service. `config_json` may be null for defaults.
///
/// # Safety
/// `config_json` must be null or a valid NUL-terminated string; `out` must be
/// valid for writes.
#[no_mangle]
pub unsafe extern "C" fn mh_service_create(
    config_json: *const c_char,
    out: *mut *mut MhService,
) -> MhErrorCode {
    guarded(|| {
        if out.is_null() {
            set_last_error("null pointer argument");
            return MhErrorCode::NullPointer;
        }

        let config = if config_json.is_null() {
            Config::default()
        } else {
            let json = match read_str(config_json, "config_json") {
                Ok(json) => json,
                Err(code) => return code,
            };
            match serde_json::from_str::<Config>(json) {
                Ok(config) => config,
                Err(e) => {
                    set_last_error(format!("invalid config: {e}"));
                    return MhErrorCode::InvalidParams;
                }
            }
        };

        match ModelService::new(&config, Arc::new(LlamaEngineFactory)) {
            Ok(inner) => {
                *out = Box::into_raw(Box::new(MhService { inner }));
                MhErrorCode::Ok
            }
            Err(e) => {
                set_last_error(format!("service init: {e:#}"));
                if e.downcast_ref::<ContainmentError>().is_some() {
                    MhErrorCode::InvalidParams
                } else {
                    MhErrorCode::Internal
                }
            }
        }
    })
}

/// Destroy a service, releasing every context it still owns.
///
/// # Safety
/// `svc` must be null or a pointer from [`mh_service_create`] not yet destroyed.
#[no_mangle]
pub unsafe extern "C" fn mh_service_destroy(svc: *mut MhService) {
    if svc.is_null() {
        return;
    }
    let _ = guarded(|| {
        let service = Box::from_raw(svc);
        service.inner.release_all();
        MhErrorCode::Ok
    });
}

/// Locate, validate and load a model; writes the new handle to `out_handle`.
///
/// # Safety
/// `svc` must come from [`mh_service_create`]; `path` must be a valid
/// NUL-terminated string; `roots` must point to `n_roots` valid strings
/// (or be null when `n_roots` is 0); `out_handle` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn mh_context_create(
    svc: *const MhService,
    path: *const c_char,
    roots: *const *const c_char,
    n_roots: usize,
    out_handle: *mut u64,
) -> MhErrorCode {
    guarded(|| {
        if svc.is_null() || path.is_null() || out_handle.is_null() {
            set_last_error("null pointer argument");
            return MhErrorCode::NullPointer;
        }
        let service = &(*svc).inner;

        let path = match read_str(path, "path") {
            Ok(path) => PathBuf::from(path),
            Err(code) => return code,
        };
        let roots = match read_roots(roots, n_roots) {
            Ok(roots) => roots,
            Err(code) => return code,
        };

        match service.create_context(&path, &roots, None) {
            Ok(handle) => {
                *out_handle = handle.id();
                MhErrorCode::Ok
            }
            Err(e) => fail(&e),
        }
    })
}

/// Release a context. Unknown handles are ignored.
///
/// # Safety
/// `svc` must come from [`mh_service_create`].
#[no_mangle]
pub unsafe extern "C" fn mh_context_release(svc: *const MhService, handle: u64) -> MhErrorCode {
    guarded(|| {
        if svc.is_null() {
            set_last_error("null pointer argument");
            return MhErrorCode::NullPointer;
        }
        (*svc).inner.release_context(ModelHandle::new(handle));
        MhErrorCode::Ok
    })
}

/// Render `messages` (JSON array of `{role, content}`) into a prompt.
/// The result is written to `out` and must be freed with [`mh_free_string`].
///
/// # Safety
/// `svc` must come from [`mh_service_create`]; `messages` must be a valid
/// NUL-terminated string; `template` may be null; `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn mh_context_format_chat(
    svc: *const MhService,
    handle: u64,
    messages: *const c_char,
    template: *const c_char,
    out: *mut *mut c_char,
) -> MhErrorCode {
    guarded(|| {
        if svc.is_null() || messages.is_null() || out.is_null() {
            set_last_error("null pointer argument");
            return MhErrorCode::NullPointer;
        }
        let messages = match read_str(messages, "messages") {
            Ok(messages) => messages,
            Err(code) => return code,
        };
        let template = if template.is_null() {
            ""
        } else {
            match read_str(template, "template") {
                Ok(template) => template,
                Err(code) => return code,
            }
        };

        match (*svc).inner.format_chat(ModelHandle::new(handle), messages, template) {
            Ok(prompt) => {
                *out = into_c_string(prompt);
                MhErrorCode::Ok
            }
            Err(e) => fail(&e),
        }
    })
}

/// Locate an artifact and read its header without loading it.
///
/// # Safety
/// Same pointer rules as [`mh_context_create`]; `out_info` must be valid for
/// writes and is released with [`mh_free_artifact_info`].
#[no_mangle]
pub unsafe extern "C" fn mh_probe_artifact(
    svc: *const MhService,
    path: *const c_char,
    roots: *const *const c_char,
    n_roots: usize,
    out_info: *mut MhArtifactInfo,
) -> MhErrorCode {
    guarded(|| {
        if svc.is_null() || path.is_null() || out_info.is_null() {
            set_last_error("null pointer argument");
            return MhErrorCode::NullPointer;
        }
        let path = match read_str(path, "path") {
            Ok(path) => PathBuf::from(path),
            Err(code) => return code,
        };
        let roots = match read_roots(roots, n_roots) {
            Ok(roots) => roots,
            Err(code) => return code,
        };

        match (*svc).inner.probe_artifact(&path, &roots) {
            Ok(info) => {
                out_info.write(MhArtifactInfo::from_info(info));
                MhErrorCode::Ok
            }
            Err(e) => fail(&e),
        }
    })
}

/// Free a string returned by this library.
///
/// # Safety
/// `s` must be null or a string returned by this library, freed once.
#[no_mangle]
pub unsafe extern "C" fn mh_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Free the strings inside an [`MhArtifactInfo`].
///
/// # Safety
/// `info` must be null or filled by [`mh_probe_artifact`].
#[no_mangle]
pub unsafe extern "C" fn mh_free_artifact_info(info: *mut MhArtifactInfo) {
    if info.is_null() {
        return;
    }
    let info = &mut *info;
    mh_free_string(info.path);
    mh_free_string(info.description);
    info.path = ptr::null_mut();
    info.description = ptr::null_mut();
}

/// Last error message on this thread, or null. Valid until the next `mh_*`
/// call on the same thread.
#[no_mangle]
pub extern "C" fn mh_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

#[no_mangle]
pub extern "C" fn mh_clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}
