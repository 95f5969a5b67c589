//! Locating the ONNX Runtime shared library.
//!
//! `ort` is built with `load-dynamic`, so the library is resolved at runtime
//! from `ORT_DYLIB_PATH`. When that is unset we probe the usual install
//! locations once and export the first hit.

use std::path::{Path, PathBuf};
use std::sync::Once;

use tracing::{info, warn};

#[cfg(target_os = "windows")]
const LIB_NAME: &str = "onnxruntime.dll";
#[cfg(target_os = "linux")]
const LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
const LIB_NAME: &str = "libonnxruntime.so";

static CONFIGURE: Once = Once::new();

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(dir) = std::env::var("ORT_DIR") {
        paths.push(Path::new(&dir).join("lib").join(LIB_NAME));
        paths.push(Path::new(&dir).join(LIB_NAME));
    }

    paths.push(Path::new("onnxruntime/lib").join(LIB_NAME));
    paths.push(Path::new("models/onnxruntime/lib").join(LIB_NAME));

    #[cfg(unix)]
    {
        paths.push(Path::new("/usr/local/lib").join(LIB_NAME));
        paths.push(Path::new("/usr/lib").join(LIB_NAME));
        paths.push(Path::new("/opt/onnxruntime/lib").join(LIB_NAME));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push(dir.join(LIB_NAME));
            paths.push(dir.join("onnxruntime").join("lib").join(LIB_NAME));
        }
    }

    paths
}

/// Point `ORT_DYLIB_PATH` at an installed runtime if the caller has not.
///
/// Runs at most once per process, before the first session is created.
pub fn configure_runtime() {
    CONFIGURE.call_once(|| {
        if let Ok(existing) = std::env::var("ORT_DYLIB_PATH") {
            info!(path = %existing, "using ONNX Runtime from ORT_DYLIB_PATH");
            return;
        }

        match candidate_paths().into_iter().find(|p| p.exists()) {
            Some(path) => {
                // SAFETY: runs once during model loading at startup, before any
                // request or worker threads exist.
                unsafe { std::env::set_var("ORT_DYLIB_PATH", &path) };
                info!(path = %path.display(), "ONNX Runtime library located");
            }
            None => warn!(
                "ONNX Runtime library not found; set ORT_DYLIB_PATH or ORT_DIR if session creation fails"
            ),
        }
    });
}
