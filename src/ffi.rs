//! C FFI interface for native callers.
//!
//! Every call blocks the calling thread on a shared tokio runtime.
//! Structured inputs and outputs are JSON strings; strings returned by this
//! module must be released with `rexec_string_free`.
//! Naming convention: rexec_<action>

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::OnceLock;

use crate::connection::{new_connection, Command, Connection, ConnectionDetails};

/// Global tokio runtime driving the async core.
fn runtime() -> Option<&'static tokio::runtime::Runtime> {
    static RUNTIME: OnceLock<Option<tokio::runtime::Runtime>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("rexec-core")
                .enable_all()
                .build()
                .map_err(|e| log::error!("Failed to create tokio runtime: {}", e))
                .ok()
        })
        .as_ref()
}

/// A connected SSH or WinRM session owned by the native caller.
pub struct RexecConnection {
    inner: Box<dyn Connection>,
}

/// Opaque pointer to a RexecConnection.
pub type RexecHandle = *mut RexecConnection;

fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok() }
}

fn into_c_string(value: serde_json::Value) -> *mut c_char {
    match CString::new(value.to_string()) {
        Ok(cs) => cs.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn error_reply(message: impl std::fmt::Display) -> *mut c_char {
    into_c_string(serde_json::json!({ "ok": false, "error": message.to_string() }))
}

// ═══════════════════════════════════════════════════════════
// Connection FFI
// ═══════════════════════════════════════════════════════════

/// Connect using a JSON encoded ConnectionDetails.
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn rexec_connect(details_json: *const c_char) -> RexecHandle {
    let Some(json) = str_arg(details_json) else {
        log::error!("rexec_connect: details are null or not UTF-8");
        return std::ptr::null_mut();
    };
    let details: ConnectionDetails = match serde_json::from_str(json) {
        Ok(details) => details,
        Err(e) => {
            log::error!("rexec_connect: invalid connection details: {}", e);
            return std::ptr::null_mut();
        }
    };
    let Some(rt) = runtime() else {
        return std::ptr::null_mut();
    };

    let mut conn = new_connection(details.connection_type);
    match rt.block_on(conn.connect(&details)) {
        Ok(()) => Box::into_raw(Box::new(RexecConnection { inner: conn })),
        Err(e) => {
            log::error!("Connection to {} failed: {}", details.address, e);
            std::ptr::null_mut()
        }
    }
}

/// Run a JSON encoded Command.
/// Returns JSON: {"ok": true, "result": {"stdout", "stderr", "rc"}} or
/// {"ok": false, "error": "..."}.
/// Caller must free with rexec_string_free.
#[no_mangle]
pub extern "C" fn rexec_run_command(handle: RexecHandle, command_json: *const c_char) -> *mut c_char {
    if handle.is_null() {
        return std::ptr::null_mut();
    }
    let Some(json) = str_arg(command_json) else {
        return error_reply("command is null or not UTF-8");
    };
    let command: Command = match serde_json::from_str(json) {
        Ok(command) => command,
        Err(e) => return error_reply(format!("invalid command: {}", e)),
    };
    let Some(rt) = runtime() else {
        return error_reply("runtime unavailable");
    };

    let conn = unsafe { &mut *handle };
    match rt.block_on(conn.inner.run_command(&command)) {
        Ok(result) => into_c_string(serde_json::json!({ "ok": true, "result": result })),
        Err(e) => {
            log::error!("Command [{}] failed: {}", command.command, e);
            error_reply(e)
        }
    }
}

/// Block command execution on the connection.
/// Returns 0 on success, -1 on invalid handle.
#[no_mangle]
pub extern "C" fn rexec_suspend(handle: RexecHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let conn = unsafe { &mut *handle };
    conn.inner.suspend_connection();
    0
}

/// Returns 0 on success, -1 on invalid handle.
#[no_mangle]
pub extern "C" fn rexec_restore(handle: RexecHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let conn = unsafe { &mut *handle };
    conn.inner.restore_connection();
    0
}

/// Returns 1 if connected, 0 if not, -1 on invalid handle.
#[no_mangle]
pub extern "C" fn rexec_is_connected(handle: RexecHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let conn = unsafe { &*handle };
    i32::from(conn.inner.is_connected())
}

/// Returns 1 if suspended, 0 if not, -1 on invalid handle.
#[no_mangle]
pub extern "C" fn rexec_is_suspended(handle: RexecHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let conn = unsafe { &*handle };
    i32::from(conn.inner.is_suspended())
}

/// Disconnect and free the handle. The handle is invalid afterwards.
/// Returns 0 on success, -1 on invalid handle.
#[no_mangle]
pub extern "C" fn rexec_disconnect(handle: RexecHandle) -> i32 {
    if handle.is_null() {
        return -1;
    }
    let mut conn = unsafe { Box::from_raw(handle) };
    if let Some(rt) = runtime() {
        if let Err(e) = rt.block_on(conn.inner.disconnect()) {
            log::warn!("Disconnect failed: {}", e);
        }
    }
    0
}

// ═══════════════════════════════════════════════════════════
// Utility FFI
// ═══════════════════════════════════════════════════════════

/// Free a string allocated by Rust.
#[no_mangle]
pub extern "C" fn rexec_string_free(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            drop(CString::from_raw(s));
        }
    }
}

/// Initialize the Rust logger. Safe to call more than once.
#[no_mangle]
pub extern "C" fn rexec_init() {
    let _ = env_logger::try_init();
    log::info!("rexec core initialized");
}
