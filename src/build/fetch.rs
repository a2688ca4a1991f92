//! Source fetching and verification.
//!
//! Sources download into a per-checkout distfiles directory and must
//! match the recipe's SHA-256 before anything else happens. Two URL
//! schemes exist: plain `http(s)`, and `distri+gomod://module@version`,
//! which fetches through a Go module proxy and repacks the zip as a
//! gzipped tarball with every file's mtime pinned to the module's
//! published timestamp so the result is reproducible.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Error;

const GOPROXY: &str = "https://proxy.golang.org";

pub fn sha256_file(path: &Path) -> Result<String, Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Download `source` into `distfiles`, returning the verified local path.
/// An existing file with the right hash short-circuits the download.
pub fn fetch(source: &str, want_hash: &str, distfiles: &Path) -> Result<PathBuf, Error> {
    std::fs::create_dir_all(distfiles)?;
    let basename = source.rsplit('/').next().unwrap_or(source).to_string();
    let dest = distfiles.join(&basename);

    if dest.exists() && sha256_file(&dest)? == want_hash {
        debug!(source, "distfile already present");
        return Ok(dest);
    }

    if let Some(module) = source.strip_prefix("distri+gomod://") {
        let dest = distfiles.join(format!("{}.tar.gz", basename.replace('@', "-")));
        if dest.exists() && sha256_file(&dest)? == want_hash {
            return Ok(dest);
        }
        fetch_gomod(module, &dest)?;
        verify(&dest, source, want_hash)?;
        return Ok(dest);
    }

    info!(source, "downloading");
    let resp = ureq::get(source).call()?;
    let tmp = dest.with_extension("part");
    {
        let mut out = File::create(&tmp)?;
        io::copy(&mut resp.into_reader(), &mut out)?;
        out.sync_all()?;
    }
    std::fs::rename(&tmp, &dest)?;
    verify(&dest, source, want_hash)?;
    Ok(dest)
}

fn verify(path: &Path, source: &str, want: &str) -> Result<(), Error> {
    let got = sha256_file(path)?;
    if got != want {
        std::fs::remove_file(path)?;
        return Err(Error::HashMismatch {
            url: source.to_string(),
            got,
            want: want.to_string(),
        });
    }
    Ok(())
}

/// Fetch `module@version` via the Go module proxy and repack it as a
/// deterministic `.tar.gz`.
fn fetch_gomod(module_at_version: &str, dest: &Path) -> Result<(), Error> {
    let (module, version) = module_at_version
        .rsplit_once('@')
        .ok_or_else(|| Error::Recipe(format!("gomod source {module_at_version:?} lacks @version")))?;
    let escaped = escape_gomod(module);

    // the .info record carries the published timestamp
    let info_url = format!("{GOPROXY}/{escaped}/@v/{version}.info");
    let info = ureq::get(&info_url).call()?.into_string()?;
    let mtime = parse_info_time(&info)
        .ok_or_else(|| Error::Recipe(format!("no Time in module info from {info_url}")))?;

    let zip_url = format!("{GOPROXY}/{escaped}/@v/{version}.zip");
    info!(url = zip_url, "downloading module");
    let resp = ureq::get(&zip_url).call()?;
    let zip_tmp = dest.with_extension("zip");
    {
        let mut out = File::create(&zip_tmp)?;
        io::copy(&mut resp.into_reader(), &mut out)?;
    }

    let unpack = tempfile::tempdir_in(dest.parent().unwrap_or(Path::new(".")))?;
    let status = Command::new("unzip")
        .arg("-q")
        .arg(&zip_tmp)
        .arg("-d")
        .arg(unpack.path())
        .status()?;
    if !status.success() {
        return Err(Error::ToolFailed { tool: "unzip".into(), status });
    }
    std::fs::remove_file(&zip_tmp)?;

    let tmp = dest.with_extension("part");
    {
        let gz = GzEncoder::new(File::create(&tmp)?, Compression::default());
        let mut tar = tar::Builder::new(gz);
        append_dir_deterministic(&mut tar, unpack.path(), Path::new(""), mtime)?;
        tar.into_inner()?.finish()?.sync_all()?;
    }
    std::fs::rename(&tmp, dest)?;
    Ok(())
}

/// Append a tree with sorted entries and a fixed mtime.
fn append_dir_deterministic<W: Write>(
    tar: &mut tar::Builder<W>,
    root: &Path,
    rel: &Path,
    mtime: u64,
) -> Result<(), Error> {
    let mut entries: Vec<_> =
        std::fs::read_dir(root.join(rel))?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let rel = rel.join(entry.file_name());
        let meta = entry.metadata()?;
        if meta.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            header.set_mtime(mtime);
            tar.append_data(&mut header, &rel, io::empty())?;
            append_dir_deterministic(tar, root, &rel, mtime)?;
        } else {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(meta.len());
            header.set_mtime(mtime);
            tar.append_data(&mut header, &rel, File::open(entry.path())?)?;
        }
    }
    Ok(())
}

/// Pull the `Time` field out of a module `.info` JSON record and convert
/// it to a Unix timestamp.
fn parse_info_time(info: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(info).ok()?;
    let time = value.get("Time")?.as_str()?;
    parse_rfc3339(time)
}

fn parse_rfc3339(s: &str) -> Option<u64> {
    // 2019-04-23T07:38:54Z, fractional seconds tolerated
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;
    let time = time.strip_suffix('Z')?;
    let time = time.split('.').next()?;
    let mut time_parts = time.split(':');
    let h: u64 = time_parts.next()?.parse().ok()?;
    let m: u64 = time_parts.next()?.parse().ok()?;
    let sec: u64 = time_parts.next()?.parse().ok()?;

    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146097 + doe - 719468;
    u64::try_from(days * 86400).ok().map(|d| d + h * 3600 + m * 60 + sec)
}

/// Case-encode a module path for the proxy protocol: upper-case letters
/// become `!` followed by the lower-case letter.
fn escape_gomod(module: &str) -> String {
    let mut out = String::with_capacity(module.len());
    for c in module.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_gomod() {
        assert_eq!(escape_gomod("github.com/Azure/azure-sdk"), "github.com/!azure/azure-sdk");
        assert_eq!(escape_gomod("golang.org/x/tools"), "golang.org/x/tools");
    }

    #[test]
    fn test_parse_rfc3339() {
        assert_eq!(parse_rfc3339("1970-01-01T00:00:00Z"), Some(0));
        assert_eq!(parse_rfc3339("2020-01-01T00:00:00Z"), Some(1577836800));
        assert_eq!(parse_rfc3339("2019-04-23T07:38:54Z"), Some(1556005134));
        assert_eq!(parse_rfc3339("not a date"), None);
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
