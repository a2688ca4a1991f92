//! The build namespace.
//!
//! A build re-executes itself into a fresh user + mount namespace with
//! uid 0 mapped to the invoking user, assembles a chroot whose `/ro` is
//! an overlay FUSE mount of the resolved dependencies, binds the source
//! and destination directories, and chroots. Everything here runs in the
//! re-executed child (`DISTRI_BUILD_PROCESS=1`); the parent only
//! prepares directories and reads the dependency reply.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, chroot, getgid, getuid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Error;
use crate::fuse::{Overlay, OverlayFs};
use crate::store::Store;

/// Everything the sandbox needs to assemble the build root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub chroot_dir: PathBuf,
    pub src_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub build_dir: PathBuf,
    pub full_name: String,
    pub writable_sourcedir: bool,
    pub repo: String,
    /// Resolved glibc identifier for the `/lib64` convenience symlink.
    pub glibc: Option<String>,
}

/// Keeps the in-namespace `/ro` mount alive for the sandbox's lifetime.
pub struct SandboxGuard {
    _fuse: fuser::BackgroundSession,
}

/// Unshare into a user + mount namespace, mapping uid/gid 0 to the
/// invoking user.
pub fn enter_namespace() -> Result<(), Error> {
    let uid = getuid();
    let gid = getgid();
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)
        .map_err(|e| Error::StdIo(e.into()))?;

    std::fs::write("/proc/self/setgroups", "deny")?;
    std::fs::write("/proc/self/uid_map", format!("0 {uid} 1"))?;
    std::fs::write("/proc/self/gid_map", format!("0 {gid} 1"))?;

    // keep our mounts out of the parent namespace
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::StdIo(e.into()))?;
    Ok(())
}

/// Assemble the chroot and enter it. Must run after
/// [`enter_namespace`].
pub fn setup(cfg: &SandboxConfig) -> Result<SandboxGuard, Error> {
    let root = &cfg.chroot_dir;
    for dir in ["ro", "dev", "etc", "tmp", "dest", "build", "proc"] {
        std::fs::create_dir_all(root.join(dir))?;
    }
    let usr_src = root.join("usr/src").join(&cfg.full_name);
    std::fs::create_dir_all(&usr_src)?;

    // /ro: the overlay over all resolved dependencies
    let store = Arc::new(Store::new(cfg.repo.clone()));
    let overlay = Arc::new(Overlay::new(store, root.join("tmp/distrifuse.sock")));
    overlay.scan_packages()?;
    let session = fuser::spawn_mount2(
        OverlayFs { overlay },
        root.join("ro"),
        &[
            fuser::MountOption::RO,
            fuser::MountOption::FSName("distri".to_string()),
        ],
    )?;
    info!(root = %root.display(), "mounted /ro overlay");

    // /dev/null is the only device builds may use
    let dev_null = root.join("dev/null");
    let _ = File::create(&dev_null);
    bind(Path::new("/dev/null"), &dev_null, false)?;

    write_etc(root)?;

    bind(&cfg.src_dir, &usr_src, !cfg.writable_sourcedir)?;
    bind(&cfg.dest_dir, &root.join("dest"), false)?;
    bind(&cfg.build_dir, &root.join("build"), false)?;

    // convenience symlinks that most build systems assume
    symlink_idempotent("/ro/bin", &root.join("bin"))?;
    std::fs::create_dir_all(root.join("usr"))?;
    symlink_idempotent("/ro/share", &root.join("usr/share"))?;
    symlink_idempotent("/ro/lib", &root.join("usr/lib"))?;
    if let Some(glibc) = &cfg.glibc {
        symlink_idempotent(&format!("/ro/{glibc}/out/lib"), &root.join("lib64"))?;
    }

    chroot(root).map_err(|e| Error::StdIo(e.into()))?;
    chdir("/build").map_err(|e| Error::StdIo(e.into()))?;
    debug!("entered chroot");
    Ok(SandboxGuard { _fuse: session })
}

fn bind(source: &Path, target: &Path, readonly: bool) -> Result<(), Error> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| Error::StdIo(e.into()))?;
    if readonly {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::StdIo(e.into()))?;
    }
    Ok(())
}

fn symlink_idempotent(target: &str, link: &Path) -> Result<(), Error> {
    match std::os::unix::fs::symlink(target, link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Builds run as uid 0 inside the namespace; give tools that look up
/// users something to find.
fn write_etc(root: &Path) -> Result<(), Error> {
    let mut passwd = File::create(root.join("etc/passwd"))?;
    passwd.write_all(b"root:x:0:0:root:/root:/bin/sh\n")?;
    let mut group = File::create(root.join("etc/group"))?;
    group.write_all(b"root:x:0:\n")?;
    Ok(())
}

/// The base environment inside the sandbox.
pub fn base_env(full_name: &str, jobs: usize) -> Vec<(String, String)> {
    vec![
        ("PATH".into(), "/bin:/ro/bin".into()),
        ("HOME".into(), "/tmp".into()),
        ("TMPDIR".into(), "/tmp".into()),
        ("USER".into(), "root".into()),
        ("DISTRI_BUILD_PROCESS".into(), "1".into()),
        ("DISTRI_FULLNAME".into(), full_name.to_string()),
        ("DISTRI_JOBS".into(), jobs.to_string()),
        ("LANG".into(), "C.UTF-8".into()),
        ("SOURCE_DATE_EPOCH".into(), "0".into()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_env_marks_build_process() {
        let env = base_env("hello-amd64-2.10-3", 4);
        assert!(env.iter().any(|(k, v)| k == "DISTRI_BUILD_PROCESS" && v == "1"));
        assert!(env.iter().any(|(k, v)| k == "DISTRI_JOBS" && v == "4"));
    }
}
