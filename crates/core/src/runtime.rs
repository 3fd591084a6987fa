//! Locating external programs (ffmpeg) and the ONNX Runtime shared libraries.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Directories probed for shared libraries, in priority order:
/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then the system
/// library dirs on Unix (the executable dir itself on Windows).
fn library_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }
    dirs
}

/// Directories probed for helper binaries. An explicit tool directory wins.
fn binary_search_dirs(tool_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = tool_dir {
        push_unique(&mut dirs, dir.to_path_buf());
    }
    if let Some(exe_dir) = exe_dir() {
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("bin"));
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
    }
    dirs
}

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

fn executable_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = executable_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Build a [`Command`] for `binary`, preferring a copy in `tool_dir` or next
/// to the executable and falling back to a bare `PATH` lookup.
pub fn command_for(binary: &str, tool_dir: Option<&Path>) -> Command {
    match find_binary(binary, &binary_search_dirs(tool_dir)) {
        Some(path) => {
            debug!(binary, path = %path.display(), "Resolved helper binary");
            Command::new(path)
        }
        None => Command::new(binary),
    }
}

/// Load tier for GPU runtime libraries; `None` means "do not preload".
///
///   0: CUDA runtime and BLAS
///   1: cuDNN
///   2: TensorRT
///
/// ORT's own provider libraries are excluded since they need symbols from
/// `libonnxruntime`, which the `ort` crate loads later.
fn preload_tier(file_name: &str) -> Option<u8> {
    let name = file_name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    if ["cudart", "cublas", "cufft", "curand"]
        .iter()
        .any(|p| name.starts_with(p))
    {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

fn is_shared_library(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if cfg!(windows) {
        name.ends_with(".dll")
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// Collect GPU runtime libraries from `dirs`, ordered so dependencies load
/// first. The first directory holding a given file name wins.
fn gpu_libraries(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found: Vec<(u8, String, PathBuf)> = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|e| e.path()) {
            if !is_shared_library(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if found.iter().any(|(_, n, _)| *n == name) {
                continue;
            }
            if let Some(tier) = preload_tier(&name) {
                found.push((tier, name, path));
            }
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    found.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
unsafe fn load_global(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_global(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point `ort` at a bundled ONNX Runtime and preload CUDA/cuDNN/TensorRT.
///
/// Must run at the start of `main()`, before any session is built: the
/// dynamic loader caches its search path at process start, so libraries
/// are loaded by absolute path instead.
pub fn setup_runtime_libs() {
    let dirs = library_search_dirs();

    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = dirs.iter().map(|d| d.join(ORT_LIB_NAME)).find(|p| p.is_file()) {
            env::set_var("ORT_DYLIB_PATH", path);
        }
    }

    for lib in gpu_libraries(&dirs) {
        unsafe {
            load_global(&lib);
        }
    }
}

/// Report the resolved ONNX Runtime library. Call once tracing is up.
pub fn log_runtime_lib_status() {
    match env::var("ORT_DYLIB_PATH") {
        Ok(path) if Path::new(&path).is_file() => info!(path = %path, "ONNX Runtime library"),
        Ok(path) => warn!(path = %path, "ORT_DYLIB_PATH points to a missing file"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; relying on default library search"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn library_dirs_include_system_paths() {
        let dirs = library_search_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn explicit_tool_dir_is_searched_first() {
        let tool = tempfile::tempdir().expect("temp dir should be created");
        let dirs = binary_search_dirs(Some(tool.path()));
        assert_eq!(dirs.first(), Some(&tool.path().to_path_buf()));
    }

    #[test]
    fn find_binary_prefers_first_directory() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();

        let file_name = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
        std::fs::write(first.join(file_name), b"first").unwrap();
        std::fs::write(second.join(file_name), b"second").unwrap();

        let resolved = find_binary("ffmpeg", &[first.clone(), second]).unwrap();
        assert_eq!(resolved, first.join(file_name));
    }

    #[test]
    fn missing_binary_falls_back_to_bare_name() {
        let empty = tempfile::tempdir().expect("temp dir should be created");
        assert!(find_binary("definitely-not-installed", &[empty.path().to_path_buf()]).is_none());
        let cmd = command_for("definitely-not-installed", Some(empty.path()));
        assert_eq!(cmd.get_program(), "definitely-not-installed");
    }

    #[test]
    fn preload_tiers_order_cuda_cudnn_tensorrt() {
        assert!(preload_tier("libcudart.so.12") < preload_tier("libcudnn.so.9"));
        assert!(preload_tier("cublas64_12.dll") < preload_tier("cudnn64_9.dll"));
        assert!(preload_tier("libcudnn_ops.so.9") < preload_tier("libnvinfer.so.10"));
        assert_eq!(preload_tier("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(preload_tier("libpng16.so"), None);
    }

    #[test]
    fn gpu_libraries_sorted_by_tier() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let (trt, cuda) = if cfg!(windows) {
            ("nvinfer.dll", "cudart64_12.dll")
        } else {
            ("libnvinfer.so.10", "libcudart.so.12")
        };
        std::fs::write(temp.path().join(trt), b"").unwrap();
        std::fs::write(temp.path().join(cuda), b"").unwrap();

        let libs = gpu_libraries(&[temp.path().to_path_buf()]);
        assert_eq!(libs, vec![temp.path().join(cuda), temp.path().join(trt)]);
    }
}
