//! Declarative install actions and split packages.
//!
//! After the build steps, the recipe's `install` block mutates the
//! destdir: deletions, symlinks, setuid chmods, empty directories,
//! renames, file installs and systemd units. Split packages then claim
//! files by glob; a claimed file moves into the split package's destdir
//! and is replaced by a relative symlink so the parent package keeps
//! working paths.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::Error;
use crate::meta::{InstallActions, SplitPackage};

/// Apply `actions` under `root` (the destdir joined with the prefix).
/// `pkg_dir` is the recipe directory, the source of `file` and
/// `systemd_unit` payloads.
pub fn apply(actions: &InstallActions, root: &Path, pkg_dir: &Path) -> Result<(), Error> {
    for del in &actions.deletes {
        let path = root.join(del);
        debug!(path = %path.display(), "delete");
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }

    for link in &actions.symlinks {
        let path = root.join(&link.newname);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(old = link.oldname, new = link.newname, "symlink");
        std::os::unix::fs::symlink(&link.oldname, &path)?;
    }

    for chmod in &actions.chmods {
        let path = root.join(&chmod.path);
        let mut mode = std::fs::metadata(&path)?.permissions().mode();
        if chmod.setuid {
            mode |= 0o4000;
        }
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
    }

    for dir in &actions.empty_dirs {
        std::fs::create_dir_all(root.join(dir))?;
    }

    for rename in &actions.renames {
        let to = root.join(&rename.newname);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(root.join(&rename.oldname), to)?;
    }

    for file in &actions.files {
        let to = root.join(&file.destpath);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(pkg_dir.join(&file.srcpath), to)?;
    }

    for unit in &actions.systemd_units {
        let to = root.join("out/lib/systemd/system").join(
            Path::new(unit).file_name().ok_or(Error::Recipe("bad systemd_unit path".into()))?,
        );
        std::fs::create_dir_all(to.parent().unwrap())?;
        std::fs::copy(pkg_dir.join(unit), to)?;
    }

    Ok(())
}

/// Move files matched by a split package's claims from `parent_root` to
/// `split_root`, leaving relative symlinks behind that point into the
/// split package's fully qualified directory. Returns how many files
/// were claimed.
pub fn claim(
    split: &SplitPackage,
    split_full_name: &str,
    parent_root: &Path,
    split_root: &Path,
) -> Result<usize, Error> {
    let mut moved = 0;
    for claim in &split.claims {
        let matches: Vec<PathBuf> = WalkDir::new(parent_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(parent_root).ok()?.to_path_buf();
                glob_match(&claim.glob, &rel.to_string_lossy()).then_some(rel)
            })
            .collect();

        for rel in matches {
            let dest_rel = match &claim.dir {
                Some(dir) => Path::new(dir).join(rel.file_name().unwrap()),
                None => rel.clone(),
            };
            let from = parent_root.join(&rel);
            let to = split_root.join(&dest_rel);
            std::fs::create_dir_all(to.parent().unwrap())?;
            std::fs::rename(&from, &to)?;

            // point the parent at the split package's copy
            let up = rel.components().count() - 1;
            let target = format!(
                "{}../{}/{}",
                "../".repeat(up),
                split_full_name,
                dest_rel.display()
            );
            std::os::unix::fs::symlink(&target, &from)?;
            moved += 1;
        }
    }
    info!(split = split.name, moved, "claimed files");
    Ok(moved)
}

/// `filepath.Match`-style globbing: `*` and `?` never cross `/`.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    fn segment_match(pat: &[u8], s: &[u8]) -> bool {
        match (pat.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                segment_match(&pat[1..], s)
                    || (!s.is_empty() && segment_match(pat, &s[1..]))
            }
            (Some(b'?'), Some(_)) => segment_match(&pat[1..], &s[1..]),
            (Some(p), Some(c)) if p == c => segment_match(&pat[1..], &s[1..]),
            _ => false,
        }
    }

    let pat_segs: Vec<&str> = pattern.split('/').collect();
    let path_segs: Vec<&str> = path.split('/').collect();
    if pat_segs.len() != path_segs.len() {
        return false;
    }
    pat_segs
        .iter()
        .zip(&path_segs)
        .all(|(p, s)| segment_match(p.as_bytes(), s.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Claim, InstallChmod, InstallSymlink};

    #[test]
    fn test_glob_match() {
        assert!(glob_match("out/lib/*.so*", "out/lib/libfoo.so.1"));
        assert!(glob_match("out/share/man/*", "out/share/man/man1"));
        assert!(!glob_match("out/lib/*.so*", "out/lib/sub/libfoo.so"));
        assert!(glob_match("out/bin/?", "out/bin/a"));
        assert!(!glob_match("out/bin/?", "out/bin/ab"));
    }

    #[test]
    fn test_apply_symlink_and_chmod() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("out/bin")).unwrap();
        std::fs::write(root.join("out/bin/tool"), b"#!").unwrap();

        let actions = InstallActions {
            symlinks: vec![InstallSymlink {
                oldname: "../out/bin/tool".into(),
                newname: "bin/tool".into(),
            }],
            chmods: vec![InstallChmod { setuid: true, path: "out/bin/tool".into() }],
            empty_dirs: vec!["var/lib/tool".into()],
            ..InstallActions::default()
        };
        apply(&actions, root, root).unwrap();

        assert_eq!(
            std::fs::read_link(root.join("bin/tool")).unwrap(),
            PathBuf::from("../out/bin/tool")
        );
        let mode = std::fs::metadata(root.join("out/bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o4000, 0o4000);
        assert!(root.join("var/lib/tool").is_dir());
    }

    #[test]
    fn test_claim_moves_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("parent");
        let split_root = dir.path().join("split");
        std::fs::create_dir_all(parent.join("out/lib")).unwrap();
        std::fs::write(parent.join("out/lib/libx.so.1"), b"elf").unwrap();
        std::fs::write(parent.join("out/lib/keep.a"), b"ar").unwrap();

        let split = SplitPackage {
            name: "foo-libs".into(),
            claims: vec![Claim { glob: "out/lib/*.so*".into(), dir: None }],
            runtime_deps: vec![],
        };
        let moved = claim(&split, "foo-libs-amd64-1-1", &parent, &split_root).unwrap();
        assert_eq!(moved, 1);
        assert_eq!(std::fs::read(split_root.join("out/lib/libx.so.1")).unwrap(), b"elf");
        let link = std::fs::read_link(parent.join("out/lib/libx.so.1")).unwrap();
        assert_eq!(link, PathBuf::from("../../../foo-libs-amd64-1-1/out/lib/libx.so.1"));
        assert!(parent.join("out/lib/keep.a").exists());
    }
}
