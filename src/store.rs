//! The package store: a directory (or HTTP repository) of
//! `<identifier>.squashfs` images and their `.meta.textproto` records.
//!
//! Remote stores are read through a local cache under the user cache
//! directory, keyed by repository URL; fetches are conditional on
//! `If-Modified-Since` so a warm cache costs one round trip at most.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::Error;
use crate::meta::Meta;
use crate::pkg::PackageId;
use crate::squashfs::Reader;
use crate::{env, textproto};

pub struct Store {
    repo: String,
    remote: bool,
    cache: PathBuf,
    handles: Mutex<FxHashMap<String, Arc<Mutex<Reader<File>>>>>,
}

impl Store {
    pub fn new(repo: impl Into<String>) -> Self {
        let repo = repo.into();
        let remote = repo.starts_with("http://") || repo.starts_with("https://");
        let cache = env::cache_dir().join(sanitize(&repo));
        Self { repo, remote, cache, handles: Mutex::new(FxHashMap::default()) }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// The directory images are read from: the store itself when local,
    /// the download cache when remote.
    pub fn local_dir(&self) -> &Path {
        if self.remote {
            &self.cache
        } else {
            Path::new(&self.repo)
        }
    }

    /// All installed identifiers, sorted so that within a `(name, arch)`
    /// pair revisions ascend.
    pub fn list(&self) -> Result<Vec<PackageId>, Error> {
        let mut ids = if self.remote {
            self.list_remote()?
        } else {
            // a store that has not been written to yet is simply empty
            if !Path::new(&self.repo).exists() {
                return Ok(vec![]);
            }
            let mut ids = vec![];
            for entry in std::fs::read_dir(&self.repo)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(base) = name.strip_suffix(".squashfs") else { continue };
                match PackageId::parse(base) {
                    Ok(id) => ids.push(id),
                    Err(_) => warn!(file = name, "skipping unparseable image name"),
                }
            }
            ids
        };
        ids.sort_by(|a, b| a.revision_cmp(b));
        Ok(ids)
    }

    fn list_remote(&self) -> Result<Vec<PackageId>, Error> {
        let url = format!("{}/index.textproto", self.repo);
        let body = self.fetch_cached(&url, "index.textproto")?;
        let text = String::from_utf8(body)?;
        let msg = textproto::parse(&text, &url)?;
        let mut ids = vec![];
        for pkg in msg.strings("pkg") {
            ids.push(PackageId::parse(pkg)?);
        }
        Ok(ids)
    }

    /// Resolve a partial identifier to the newest matching identifier.
    pub fn glob(&self, partial: &PackageId) -> Result<PackageId, Error> {
        self.glob_opt(partial)?.ok_or(Error::NotFound)
    }

    pub fn glob_opt(&self, partial: &PackageId) -> Result<Option<PackageId>, Error> {
        // a `<partial>.meta.textproto` symlink shortens the search
        if !self.remote {
            let link = Path::new(&self.repo).join(format!("{partial}.meta.textproto"));
            if let Ok(target) = std::fs::read_link(&link) {
                if let Some(base) = target
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(".meta.textproto"))
                {
                    return Ok(Some(PackageId::parse(base)?));
                }
            }
        }

        let mut best: Option<PackageId> = None;
        for id in self.list()? {
            if !id.matches(partial) {
                continue;
            }
            // ties keep the earlier entry
            if best.as_ref().map(|b| b.revision_less(&id)).unwrap_or(true) {
                best = Some(id);
            }
        }
        Ok(best)
    }

    pub fn read_meta(&self, id: &PackageId) -> Result<Meta, Error> {
        let name = format!("{id}.meta.textproto");
        if self.remote {
            let url = format!("{}/{name}", self.repo);
            let body = self.fetch_cached(&url, &name)?;
            Meta::parse(&String::from_utf8(body)?, &url)
        } else {
            Meta::read_from(&Path::new(&self.repo).join(name))
        }
    }

    /// The local path of an image if it is already present, without
    /// triggering a download.
    pub fn cached_image_path(&self, id: &PackageId) -> Option<PathBuf> {
        let name = format!("{id}.squashfs");
        let path = if self.remote {
            self.cache.join(name)
        } else {
            Path::new(&self.repo).join(name)
        };
        path.exists().then_some(path)
    }

    /// The local path of an image, downloading it first when the store is
    /// remote.
    pub fn image_path(&self, id: &PackageId) -> Result<PathBuf, Error> {
        let name = format!("{id}.squashfs");
        if !self.remote {
            let path = Path::new(&self.repo).join(&name);
            if !path.exists() {
                return Err(Error::NotFound);
            }
            return Ok(path);
        }
        let cached = self.cache.join(&name);
        if cached.exists() {
            return Ok(cached);
        }
        let url = format!("{}/{name}", self.repo);
        self.download(&url, &cached)?;
        Ok(cached)
    }

    /// Open an image, sharing one backing handle per identifier across
    /// all readers.
    pub fn open_image(&self, id: &PackageId) -> Result<Arc<Mutex<Reader<File>>>, Error> {
        let key = id.to_string();
        if let Some(handle) = self.handles.lock().unwrap().get(&key) {
            return Ok(Arc::clone(handle));
        }
        let path = self.image_path(id)?;
        let file = File::open(&path)?;
        let reader = Arc::new(Mutex::new(Reader::new(file)?));
        self.handles
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::clone(&reader));
        Ok(reader)
    }

    /// Drop every cached handle; held `Arc`s keep their images open.
    pub fn close_handles(&self) {
        self.handles.lock().unwrap().clear();
    }

    /// GET `url` into the cache as `name`, honoring `If-Modified-Since`,
    /// and return the body.
    fn fetch_cached(&self, url: &str, name: &str) -> Result<Vec<u8>, Error> {
        let cached = self.cache.join(name);
        let mtime = std::fs::metadata(&cached).and_then(|m| m.modified()).ok();

        let mut req = ureq::get(url).timeout(std::time::Duration::from_secs(5));
        if let Some(mtime) = mtime {
            req = req.set("If-Modified-Since", &http_date(mtime));
        }
        match req.call() {
            Ok(resp) if resp.status() == 304 => {
                debug!(url, "not modified, using cache");
                Ok(std::fs::read(&cached)?)
            }
            Ok(resp) => {
                let mut body = vec![];
                resp.into_reader().read_to_end(&mut body)?;
                write_atomic(&cached, &body)?;
                Ok(body)
            }
            // ureq surfaces 304 as a status error
            Err(ureq::Error::Status(304, _)) => {
                debug!(url, "not modified, using cache");
                Ok(std::fs::read(&cached)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), Error> {
        debug!(url, "downloading image");
        let resp = ureq::get(url).call()?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension("tmp");
        let mut out = File::create(&tmp)?;
        io::copy(&mut resp.into_reader(), &mut out)?;
        out.sync_all()?;
        std::fs::rename(&tmp, dest)?;
        Ok(())
    }
}

fn write_atomic(dest: &Path, body: &[u8]) -> Result<(), Error> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension("tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, dest)?;
    Ok(())
}

fn sanitize(repo: &str) -> String {
    repo.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

/// RFC 7231 IMF-fixdate, which is what `If-Modified-Since` wants.
fn http_date(t: SystemTime) -> String {
    const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let secs = t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let days = secs / 86400;
    let (h, m, s) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);
    let weekday = DAYS[(days % 7) as usize];

    // civil date from day count (Gregorian), days since 1970-01-01
    let z = days as i64 + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!(
        "{weekday}, {d:02} {} {year} {h:02}:{m:02}:{s:02} GMT",
        MONTHS[(month - 1) as usize]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_http_date() {
        // 2020-01-01T00:00:00Z was a Wednesday
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1577836800);
        assert_eq!(http_date(t), "Wed, 01 Jan 2020 00:00:00 GMT");
        assert_eq!(http_date(SystemTime::UNIX_EPOCH), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("https://repo.distr1.org/distri/jackherer/pkg"),
                   "https___repo_distr1_org_distri_jackherer_pkg");
    }
}
