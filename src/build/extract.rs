//! Source extraction and patching.
//!
//! Tarballs unpack with the leading path component stripped; `.deb`
//! archives go through `ar`. Extraction lands in a temporary directory
//! that is renamed into place only after patches and extra files have
//! been applied, so a partially extracted tree is never mistaken for a
//! source directory.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::Error;

/// Extract `archive` into `src_dir` (skipped when it already exists),
/// apply `patches` with `patch -p1`, copy `extra_files` from the recipe
/// directory into the tree.
pub fn extract(
    archive: &Path,
    src_dir: &Path,
    pkg_dir: &Path,
    patches: &[String],
    extra_files: &[String],
) -> Result<(), Error> {
    if src_dir.exists() {
        debug!(src = %src_dir.display(), "source directory already extracted");
        return Ok(());
    }
    let parent = src_dir.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = tempfile::tempdir_in(parent)?;

    let name = archive.to_string_lossy();
    if name.ends_with(".deb") {
        extract_deb(archive, tmp.path())?;
    } else {
        extract_tar(archive, tmp.path())?;
    }

    for patch in patches {
        let path = pkg_dir.join(patch);
        info!(patch, "applying");
        let status = Command::new("patch")
            .arg("-p1")
            .arg("-i")
            .arg(&path)
            .current_dir(tmp.path())
            .status()?;
        if !status.success() {
            return Err(Error::ToolFailed { tool: format!("patch {patch}"), status });
        }
    }
    for extra in extra_files {
        std::fs::copy(pkg_dir.join(extra), tmp.path().join(extra))?;
    }

    std::fs::rename(tmp.into_path(), src_dir)?;
    Ok(())
}

/// Unpack a (possibly gzipped) tarball with `--strip-components=1`
/// semantics.
fn extract_tar(archive: &Path, dest: &Path) -> Result<(), Error> {
    let file = File::open(archive)?;
    let name = archive.to_string_lossy();
    let reader: Box<dyn Read> = if name.ends_with(".gz") || name.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else if name.ends_with(".xz") || name.ends_with(".bz2") || name.ends_with(".zst") {
        // the tar crate only inflates gzip; defer the rest to tar(1)
        let status = Command::new("tar")
            .arg("--strip-components=1")
            .arg("-xaf")
            .arg(archive)
            .arg("-C")
            .arg(dest)
            .status()?;
        if !status.success() {
            return Err(Error::ToolFailed { tool: "tar".into(), status });
        }
        return Ok(());
    } else {
        Box::new(file)
    };

    let mut tar = tar::Archive::new(reader);
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(stripped) = strip_first_component(&path) else { continue };
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(stripped);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(out)?;
    }
    Ok(())
}

fn strip_first_component(path: &Path) -> Option<PathBuf> {
    let mut comps = path.components();
    match comps.next() {
        Some(Component::Normal(_)) => Some(comps.as_path().to_path_buf()),
        _ => None,
    }
}

/// `.deb` is an `ar` archive holding `data.tar.*`; unpack that payload.
fn extract_deb(archive: &Path, dest: &Path) -> Result<(), Error> {
    let status = Command::new("ar")
        .arg("x")
        .arg(archive)
        .current_dir(dest)
        .status()?;
    if !status.success() {
        return Err(Error::ToolFailed { tool: "ar".into(), status });
    }
    let data = std::fs::read_dir(dest)?
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with("data.tar"))
        .ok_or(Error::Recipe("deb archive has no data.tar member".into()))?;
    let status = Command::new("tar").arg("-xaf").arg(data.path()).arg("-C").arg(dest).status()?;
    if !status.success() {
        return Err(Error::ToolFailed { tool: "tar".into(), status });
    }
    std::fs::remove_file(data.path())?;
    for member in ["control.tar.gz", "control.tar.xz", "control.tar.zst", "debian-binary"] {
        let _ = std::fs::remove_file(dest.join(member));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_tarball(dir: &Path) -> PathBuf {
        let tarball = dir.join("hello-1.0.tar.gz");
        let gz = flate2::write::GzEncoder::new(
            File::create(&tarball).unwrap(),
            flate2::Compression::default(),
        );
        let mut tar = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(6);
        tar.append_data(&mut header, "hello-1.0/main.c", &b"main()"[..]).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(0);
        tar.append_data(&mut header, "hello-1.0/sub/empty.h", std::io::empty()).unwrap();
        tar.into_inner().unwrap().finish().unwrap().flush().unwrap();
        tarball
    }

    #[test]
    fn test_extract_strips_first_component() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = make_tarball(dir.path());
        let src = dir.path().join("src/hello-1.0");
        extract(&tarball, &src, dir.path(), &[], &[]).unwrap();
        assert_eq!(std::fs::read(src.join("main.c")).unwrap(), b"main()");
        assert!(src.join("sub/empty.h").exists());
    }

    #[test]
    fn test_extract_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = make_tarball(dir.path());
        let src = dir.path().join("src/hello-1.0");
        extract(&tarball, &src, dir.path(), &[], &[]).unwrap();
        std::fs::write(src.join("marker"), b"kept").unwrap();
        extract(&tarball, &src, dir.path(), &[], &[]).unwrap();
        assert!(src.join("marker").exists());
    }

    #[test]
    fn test_extra_files_copied() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = make_tarball(dir.path());
        std::fs::write(dir.path().join("config.site"), b"site").unwrap();
        let src = dir.path().join("src/hello-1.0");
        extract(&tarball, &src, dir.path(), &[], &["config.site".to_string()]).unwrap();
        assert_eq!(std::fs::read(src.join("config.site")).unwrap(), b"site");
    }
}
