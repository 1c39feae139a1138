/// Executable resolution for spawned processes
///
/// Follows the host shell's rules: bare names are searched on PATH, relative
/// paths resolve against the process working directory when one is given, and
/// on Windows the PATHEXT extensions are tried for names without one.
use crate::types::{lookup_env, HoudiniError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const DEFAULT_PATHEXT: &str = ".COM;.EXE;.BAT;.CMD";

/// Resolve `path` to an executable file.
///
/// `env` is the child's explicit environment; when it carries a PATH that PATH
/// is searched, otherwise the backend's own PATH is used.
pub fn resolve_executable(path: &str, dir: Option<&Path>, env: Option<&[String]>) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(lookup_error(path, "empty executable path"));
    }

    let candidate = Path::new(path);

    if is_bare_name(candidate) {
        let search_path = env
            .and_then(|env| lookup_env(env, "PATH"))
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default();

        for entry in std::env::split_paths(&search_path) {
            // Relative PATH entries would depend on the backend's cwd
            if entry.as_os_str().is_empty() || entry.is_relative() {
                continue;
            }
            if let Some(found) = find_executable(&entry.join(candidate), env) {
                return Ok(found);
            }
        }
        return Err(lookup_error(path, "executable file not found in PATH"));
    }

    let full = match dir {
        Some(dir) if !candidate.is_absolute() && !has_volume(candidate) => dir.join(candidate),
        _ => candidate.to_path_buf(),
    };
    // The child changes into `dir` before exec, so a relative result would
    // be looked up a second time from inside it
    let full = if full.is_relative() && dir.is_some() {
        std::env::current_dir()
            .map_err(|e| lookup_error(path, &format!("cannot read current directory: {}", e)))?
            .join(full)
    } else {
        full
    };

    find_executable(&full, env)
        .ok_or_else(|| lookup_error(path, &format!("{} is not an executable file", full.display())))
}

fn lookup_error(path: &str, reason: &str) -> HoudiniError {
    HoudiniError::Lookup {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// A name with no directory part, e.g. `sh` but not `./sh`
fn is_bare_name(path: &Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

#[cfg(windows)]
fn has_volume(path: &Path) -> bool {
    matches!(path.components().next(), Some(std::path::Component::Prefix(_)))
}

#[cfg(not(windows))]
fn has_volume(_path: &Path) -> bool {
    false
}

#[cfg(unix)]
fn find_executable(path: &Path, _env: Option<&[String]>) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).ok()?;
    if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
        Some(path.to_path_buf())
    } else {
        None
    }
}

#[cfg(windows)]
fn find_executable(path: &Path, env: Option<&[String]>) -> Option<PathBuf> {
    let pathext = env
        .and_then(|env| lookup_env(env, "PATHEXT"))
        .map(str::to_string)
        .or_else(|| std::env::var("PATHEXT").ok())
        .unwrap_or_else(|| DEFAULT_PATHEXT.to_string());
    let extensions: Vec<String> = pathext
        .split(';')
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
        .collect();

    let is_file = |p: &Path| std::fs::metadata(p).map(|m| m.is_file()).unwrap_or(false);

    let has_known_ext = path
        .extension()
        .map(|ext| {
            let ext = format!(".{}", ext.to_string_lossy().to_ascii_lowercase());
            extensions.contains(&ext)
        })
        .unwrap_or(false);
    if has_known_ext && is_file(path) {
        return Some(path.to_path_buf());
    }

    for ext in &extensions {
        let mut with_ext = path.as_os_str().to_os_string();
        with_ext.push(ext);
        let with_ext = PathBuf::from(with_ext);
        if is_file(&with_ext) {
            return Some(with_ext);
        }
    }
    None
}
