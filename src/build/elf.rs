//! ELF inspection after the build: shared-library dependency discovery,
//! build-id extraction and the debug-symbol split.

use std::path::{Path, PathBuf};
use std::process::Command;

use goblin::elf::Elf;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::Error;
use crate::resolve::{self, LibDep};

/// All ELF files under `root`, symlinks not followed.
pub fn find_elf_files(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut out = vec![];
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let mut head = [0u8; 4];
        let ok = std::fs::File::open(path)
            .and_then(|mut f| std::io::Read::read_exact(&mut f, &mut head))
            .is_ok();
        if ok && head == *b"\x7fELF" {
            out.push(path.to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

/// Run the runtime linker's trace mode over `elf` and report which
/// packages its shared libraries come from.
pub fn ldd_deps(elf: &Path) -> Result<Vec<LibDep>, Error> {
    let output = Command::new("ldd").arg(elf).output()?;
    // static binaries make ldd fail; that simply means no deps
    if !output.status.success() {
        debug!(elf = %elf.display(), "ldd failed, assuming static binary");
        return Ok(vec![]);
    }
    Ok(resolve::parse_ldd_output(&String::from_utf8_lossy(&output.stdout)))
}

/// The GNU build-id note of `elf`, as lowercase hex.
pub fn build_id(elf: &Path) -> Result<Option<String>, Error> {
    let data = std::fs::read(elf)?;
    let parsed = Elf::parse(&data).map_err(|e| Error::Elf {
        path: elf.display().to_string(),
        msg: e.to_string(),
    })?;
    if let Some(notes) = parsed.iter_note_sections(&data, Some(".note.gnu.build-id")) {
        for note in notes.flatten() {
            if note.n_type == goblin::elf::note::NT_GNU_BUILD_ID {
                return Ok(Some(hex::encode(note.desc)));
            }
        }
    }
    Ok(None)
}

/// Split `elf`'s debug info into `debug_root/.build-id/xx/rest.debug`
/// and strip the original. Files without a build-id are left alone.
pub fn split_debug(elf: &Path, debug_root: &Path) -> Result<Option<PathBuf>, Error> {
    let Some(id) = build_id(elf)? else {
        debug!(elf = %elf.display(), "no build-id, not splitting debug info");
        return Ok(None);
    };
    if id.len() < 3 {
        return Ok(None);
    }
    let (first, rest) = id.split_at(2);
    let dest = debug_root.join(".build-id").join(first).join(format!("{rest}.debug"));
    std::fs::create_dir_all(dest.parent().unwrap())?;

    let status = Command::new("objcopy")
        .arg("--only-keep-debug")
        .arg(elf)
        .arg(&dest)
        .status()?;
    if !status.success() {
        return Err(Error::ToolFailed { tool: "objcopy".into(), status });
    }
    let status = Command::new("strip").arg("-g").arg(elf).status()?;
    if !status.success() {
        // some file kinds (e.g. separate debug files) refuse to strip
        warn!(elf = %elf.display(), "strip failed");
    }
    Ok(Some(dest))
}

/// Scan every ELF under `root`: gather shared-library package deps, and
/// unless `keep_symbols`, split debug info into `debug_root`.
pub fn scan(
    root: &Path,
    debug_root: &Path,
    keep_symbols: bool,
) -> Result<Vec<String>, Error> {
    let mut pkgs: Vec<String> = vec![];
    for elf in find_elf_files(root)? {
        match ldd_deps(&elf) {
            Ok(deps) => {
                for dep in deps {
                    if !pkgs.contains(&dep.pkg) {
                        pkgs.push(dep.pkg);
                    }
                }
            }
            Err(e) => warn!(elf = %elf.display(), error = %e, "ldd scan failed"),
        }
        if !keep_symbols {
            if let Err(e) = split_debug(&elf, debug_root) {
                warn!(elf = %elf.display(), error = %e, "debug split failed");
            }
        }
    }
    Ok(pkgs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_elf_files_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out/bin")).unwrap();
        std::fs::write(dir.path().join("out/bin/tool"), b"\x7fELF\x02\x01\x01rest").unwrap();
        std::fs::write(dir.path().join("out/bin/script"), b"#!/bin/sh\n").unwrap();
        let found = find_elf_files(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("out/bin/tool"));
    }

    #[test]
    fn test_build_id_of_invalid_elf_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"\x7fELFjunk").unwrap();
        assert!(build_id(&path).is_err());
    }
}
