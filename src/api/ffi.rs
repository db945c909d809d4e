//! C-compatible API for host processes embedding the core.
//!
//! Strings returned by this module are owned by Rust and must be released
//! with [`retrain_free_str`]. JSON answers use one envelope:
//! `{"ok":true,"data":...}` or `{"ok":false,"code":N,"error":"..."}` where
//! `N` is a [`CoreCode`].

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::sync::OnceLock;

use serde::Serialize;
use serde_json::{json, Value};

use crate::common::config::AppCfg;
use crate::common::error::{CoreCode, CoreError, CoreResult};
use crate::common::log;

use super::service::RetrainCore;

static CORE: OnceLock<RetrainCore> = OnceLock::new();

/// ABI version to coordinate with host bindings.
#[no_mangle]
pub extern "C" fn retrain_api_version() -> u32 {
    1
}

/// Open the process-wide core. `config_path` may be null to use the
/// environment only. Returns a [`CoreCode`]; opening twice is a no-op.
#[no_mangle]
pub extern "C" fn retrain_open(config_path: *const c_char) -> u32 {
    if CORE.get().is_some() {
        return CoreCode::Ok as u32;
    }
    let opened = load_cfg(config_path).and_then(|cfg| {
        log::init(cfg.log_level);
        RetrainCore::open(cfg)
    });
    match opened {
        Ok(core) => {
            // A concurrent opener may have won; its core is kept.
            let _ = CORE.set(core);
            CoreCode::Ok as u32
        }
        Err(err) => {
            tracing::error!(error = %err, "retrain_open failed");
            err.code() as u32
        }
    }
}

/// Submit one correction given as two JSON documents. Returns a receipt.
#[no_mangle]
pub extern "C" fn retrain_submit_correction(
    features_json: *const c_char,
    label_json: *const c_char,
) -> *const c_char {
    respond(|| {
        let features = parse_json(features_json, "features")?;
        let label = parse_json(label_json, "label")?;
        core()?.submit_correction(features, label)
    })
}

/// Best model overall, or for the model named by `model` when non-null.
#[no_mangle]
pub extern "C" fn retrain_best_model(model: *const c_char) -> *const c_char {
    respond(|| {
        let model = read_opt_str(model);
        core()?.best_model(model.as_deref())
    })
}

#[no_mangle]
pub extern "C" fn retrain_version_history() -> *const c_char {
    respond(|| core()?.version_history())
}

/// Run history, optionally for one model.
#[no_mangle]
pub extern "C" fn retrain_run_history(model: *const c_char) -> *const c_char {
    respond(|| {
        let model = read_opt_str(model);
        core()?.run_history(model.as_deref())
    })
}

/// One maintenance pass; meant to be driven by the host's scheduler.
#[no_mangle]
pub extern "C" fn retrain_tick() -> *const c_char {
    respond(|| core()?.tick())
}

/// Prometheus text exposition (not JSON).
#[no_mangle]
pub extern "C" fn retrain_metrics() -> *const c_char {
    match core() {
        Ok(core) => string_to_raw(core.metrics_text()),
        Err(err) => string_to_raw(error_json(&err)),
    }
}

/// Free strings allocated by Rust.
#[no_mangle]
pub extern "C" fn retrain_free_str(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(ptr as *mut c_char);
    }
}

fn core() -> CoreResult<&'static RetrainCore> {
    CORE
        .get()
        .ok_or_else(|| CoreError::config("retrain_open has not been called"))
}

fn load_cfg(path: *const c_char) -> CoreResult<AppCfg> {
    match read_opt_str(path) {
        None => AppCfg::load(),
        Some(path) => {
            let mut cfg = AppCfg::from_file(Path::new(&path))?;
            cfg.apply_env(|key| std::env::var(key).ok())?;
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

fn read_opt_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(
        unsafe { CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned(),
    )
}

fn parse_json(ptr: *const c_char, what: &str) -> CoreResult<Value> {
    let text = read_opt_str(ptr).ok_or_else(|| CoreError::invalid(format!("{what} is null")))?;
    serde_json::from_str(&text).map_err(|e| CoreError::invalid(format!("{what} is not JSON: {e}")))
}

fn respond<T, F>(f: F) -> *const c_char
where
    T: Serialize,
    F: FnOnce() -> CoreResult<T>,
{
    string_to_raw(envelope(f()))
}

fn envelope<T: Serialize>(result: CoreResult<T>) -> String {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(data) => json!({"ok": true, "data": data}).to_string(),
            Err(err) => error_json(&CoreError::from(err)),
        },
        Err(err) => error_json(&err),
    }
}

fn error_json(err: &CoreError) -> String {
    json!({"ok": false, "code": err.code() as u32, "error": err.to_string()}).to_string()
}

fn string_to_raw(s: String) -> *const c_char {
    match CString::new(s) {
        Ok(cstring) => cstring.into_raw(),
        Err(_) => fallback_json_raw(),
    }
}

fn fallback_json_raw() -> *const c_char {
    CString::new(r#"{"ok":false}"#)
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}
