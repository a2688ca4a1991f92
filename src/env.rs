//! Process environment plumbing.
//!
//! All knobs come from a handful of environment variables; flags override
//! these at the CLI layer.

use std::path::PathBuf;

/// Root of the distri source checkout (recipes live under `pkgs/`).
pub fn distri_root() -> PathBuf {
    std::env::var_os("DISTRIROOT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration directory.
pub fn distri_cfg() -> PathBuf {
    std::env::var_os("DISTRICFG").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/etc/distri"))
}

/// The default package repository (a local path or an HTTP URL):
/// `DEFAULTREPO`, then `DEFAULTREPOROOT`, then the configured repo file,
/// then the conventional local store.
pub fn default_repo() -> String {
    if let Ok(repo) = std::env::var("DEFAULTREPO") {
        return repo;
    }
    if let Ok(root) = std::env::var("DEFAULTREPOROOT") {
        return format!("{root}/pkg");
    }
    if let Ok(repo) = std::fs::read_to_string(distri_cfg().join("repo")) {
        let repo = repo.trim();
        if !repo.is_empty() {
            return repo.to_string();
        }
    }
    "/roimg".to_string()
}

/// Set when the build re-executes itself inside the build namespace.
pub fn is_build_process() -> bool {
    std::env::var("DISTRI_BUILD_PROCESS").map(|v| v == "1").unwrap_or(false)
}

/// Where downloaded images are cached when the repo is remote.
pub fn cache_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
        return PathBuf::from(xdg).join("distri");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".cache/distri");
    }
    PathBuf::from("/var/cache/distri")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_process_flag() {
        std::env::remove_var("DISTRI_BUILD_PROCESS");
        assert!(!is_build_process());
        std::env::set_var("DISTRI_BUILD_PROCESS", "1");
        assert!(is_build_process());
        std::env::remove_var("DISTRI_BUILD_PROCESS");
    }
}
