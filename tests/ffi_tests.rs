//! C ABI adapter tests.

mod common;

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use model_host::ffi::{
    mh_clear_last_error, mh_context_create, mh_context_format_chat, mh_context_release, mh_free_artifact_info,
    mh_free_string, mh_last_error, mh_probe_artifact, mh_service_create, mh_service_destroy, MhArtifactInfo,
    MhErrorCode, MhService,
};

use model_host::config::ContainmentMode;

use common::{config_for, write_gguf, write_zeros, MIB};

fn last_error() -> String {
    let ptr = mh_last_error();
    assert!(!ptr.is_null());
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn create_service(models_dir: &std::path::Path) -> *mut MhService {
    let json = CString::new(serde_json::to_string(&config_for(models_dir)).unwrap()).unwrap();
    let mut svc: *mut MhService = ptr::null_mut();
    let code = unsafe { mh_service_create(json.as_ptr(), &mut svc) };
    assert_eq!(code, MhErrorCode::Ok);
    assert!(!svc.is_null());
    svc
}

#[test]
fn test_null_arguments_are_rejected() {
    mh_clear_last_error();
    assert!(mh_last_error().is_null());

    let code = unsafe { mh_service_create(ptr::null(), ptr::null_mut()) };
    assert_eq!(code, MhErrorCode::NullPointer);
    assert!(last_error().contains("null"));

    mh_clear_last_error();
    assert!(mh_last_error().is_null());

    let mut handle = 0u64;
    let path = CString::new("m.gguf").unwrap();
    let code = unsafe { mh_context_create(ptr::null(), path.as_ptr(), ptr::null(), 0, &mut handle) };
    assert_eq!(code, MhErrorCode::NullPointer);
}

#[test]
fn test_invalid_config_json() {
    let json = CString::new("{ not json").unwrap();
    let mut svc: *mut MhService = ptr::null_mut();
    let code = unsafe { mh_service_create(json.as_ptr(), &mut svc) };
    assert_eq!(code, MhErrorCode::InvalidParams);
    assert!(svc.is_null());
    assert!(last_error().contains("invalid config"));
}

#[test]
fn test_create_format_release() {
    let dir = tempfile::tempdir().unwrap();
    write_gguf(dir.path(), "m.gguf", 3, 2 * MIB);
    let svc = create_service(dir.path());

    // Found through the search root, not the requested path.
    let requested = CString::new("/not/here/m.gguf").unwrap();
    let root = CString::new(dir.path().join("m.gguf").to_str().unwrap()).unwrap();
    let roots = [root.as_ptr()];

    let mut handle = 0u64;
    let code = unsafe { mh_context_create(svc, requested.as_ptr(), roots.as_ptr(), roots.len(), &mut handle) };
    assert_eq!(code, MhErrorCode::Ok);
    assert_eq!(handle, 1);

    let messages = CString::new(r#"[{"role":"user","content":"ping"}]"#).unwrap();
    let mut out: *mut c_char = ptr::null_mut();
    let code = unsafe { mh_context_format_chat(svc, handle, messages.as_ptr(), ptr::null(), &mut out) };
    assert_eq!(code, MhErrorCode::Ok);
    let prompt = unsafe { CStr::from_ptr(out) }.to_str().unwrap().to_string();
    assert!(prompt.contains("ping"));
    unsafe { mh_free_string(out) };

    assert_eq!(unsafe { mh_context_release(svc, handle) }, MhErrorCode::Ok);
    assert_eq!(unsafe { mh_context_release(svc, handle) }, MhErrorCode::Ok);

    let mut out: *mut c_char = ptr::null_mut();
    let code = unsafe { mh_context_format_chat(svc, handle, messages.as_ptr(), ptr::null(), &mut out) };
    assert_eq!(code, MhErrorCode::InvalidHandle);
    assert!(out.is_null());

    unsafe { mh_service_destroy(svc) };
}

#[test]
fn test_error_codes_for_missing_and_invalid_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let small = write_zeros(dir.path(), "small.gguf", 1024);
    let svc = create_service(dir.path());

    let mut handle = 0u64;
    let missing = CString::new("/missing/model.gguf").unwrap();
    let code = unsafe { mh_context_create(svc, missing.as_ptr(), ptr::null(), 0, &mut handle) };
    assert_eq!(code, MhErrorCode::NotFound);
    assert!(last_error().contains("not found"));

    let small = CString::new(small.to_str().unwrap()).unwrap();
    let code = unsafe { mh_context_create(svc, small.as_ptr(), ptr::null(), 0, &mut handle) };
    assert_eq!(code, MhErrorCode::InvalidArtifact);
    assert_eq!(handle, 0);

    unsafe { mh_service_destroy(svc) };
}

#[test]
fn test_probe_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "m.gguf", 3, 3 * MIB);
    let svc = create_service(dir.path());

    let path = CString::new(path.to_str().unwrap()).unwrap();
    let mut info = MhArtifactInfo {
        path: ptr::null_mut(),
        size_bytes: 0,
        format_version: 0,
        description: ptr::null_mut(),
    };
    let code = unsafe { mh_probe_artifact(svc, path.as_ptr(), ptr::null(), 0, &mut info) };
    assert_eq!(code, MhErrorCode::Ok);
    assert_eq!(info.size_bytes, 3 * MIB);
    assert_eq!(info.format_version, 3);
    let description = unsafe { CStr::from_ptr(info.description) }.to_str().unwrap().to_string();
    assert_eq!(description, "GGUF Model (v3)");

    unsafe { mh_free_artifact_info(&mut info) };
    assert!(info.path.is_null());
    assert!(info.description.is_null());

    unsafe { mh_service_destroy(svc) };
}

#[test]
fn test_roots_with_null_entry() {
    let dir = tempfile::tempdir().unwrap();
    let svc = create_service(dir.path());

    let requested = CString::new("m.gguf").unwrap();
    let roots: [*const c_char; 1] = [ptr::null()];
    let mut handle = 0u64;
    let code = unsafe { mh_context_create(svc, requested.as_ptr(), roots.as_ptr(), 1, &mut handle) };
    assert_eq!(code, MhErrorCode::NullPointer);

    unsafe { mh_service_destroy(svc) };
}

#[test]
fn test_subprocess_config_without_worker_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path());
    config.loader.containment.mode = ContainmentMode::Subprocess;
    let json = CString::new(serde_json::to_string(&config).unwrap()).unwrap();

    let mut svc: *mut MhService = ptr::null_mut();
    let code = unsafe { mh_service_create(json.as_ptr(), &mut svc) };
    assert_eq!(code, MhErrorCode::InvalidParams);
    assert!(svc.is_null());
    assert!(last_error().contains("worker_program"));
}

#[test]
fn test_context_limit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "m.gguf", 3, 2 * MIB);
    let mut config = config_for(dir.path());
    config.loader.max_contexts = Some(1);
    let json = CString::new(serde_json::to_string(&config).unwrap()).unwrap();
    let mut svc: *mut MhService = ptr::null_mut();
    assert_eq!(unsafe { mh_service_create(json.as_ptr(), &mut svc) }, MhErrorCode::Ok);

    let path = CString::new(path.to_str().unwrap()).unwrap();
    let mut handle = 0u64;
    let code = unsafe { mh_context_create(svc, path.as_ptr(), ptr::null(), 0, &mut handle) };
    assert_eq!(code, MhErrorCode::Ok);

    let mut second = 0u64;
    let code = unsafe { mh_context_create(svc, path.as_ptr(), ptr::null(), 0, &mut second) };
    assert_eq!(code, MhErrorCode::ContextLimit);
    assert_eq!(second, 0);
    assert!(last_error().contains("Context limit reached"));

    unsafe { mh_service_destroy(svc) };
}
