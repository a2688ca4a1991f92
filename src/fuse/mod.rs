//! The overlay FUSE filesystem.
//!
//! Presents every installed package image under one read-only mount
//! point: a top-level directory per package, a set of synthesized
//! *exchange directories* (`/bin`, `/lib`, `/share`, ...) whose entries
//! are versioned symlinks into the winning package, and a `ctl` symlink
//! advertising the control socket.
//!
//! A 64 bit virtual inode packs `(image_id + 1)` into the high 16 bits
//! and the image's squashfs inode reference into the low 48; the high
//! bits being zero marks an overlay-owned inode (exchange directories,
//! `ctl`, the root). Images are opened lazily: scanning records what a
//! package exports, but no file descriptor is held until one of the
//! package's inodes is first accessed.

pub mod ctl;

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::meta::Meta;
use crate::pkg::PackageId;
use crate::squashfs::{self, FileKind, Reader};
use crate::store::Store;

/// Image paths scanned into exchange directories, with the overlay-side
/// directory they feed. `/bin` additionally sources `/out/bin`, whose
/// entries stand in for the wrapper binaries the sandbox places in
/// `/bin`, so their links are rewritten to the wrapper path.
const EXCHANGE_SOURCES: &[(&str, &str)] = &[
    ("bin", "bin"),
    ("out/bin", "bin"),
    ("out/lib", "lib"),
    ("out/lib64", "lib64"),
    ("out/include", "include"),
    ("out/share", "share"),
    ("out/gopath", "gopath"),
    ("debug", "debug"),
];

/// Subtrees of `out/share` that are always materialized even when no
/// package has populated them yet.
const SHARE_SEEDS: &[&str] =
    &["aclocal", "gettext", "gir-1.0", "glib-2.0/schemas", "mime"];

pub const ROOT_INO: u64 = 1;
const IMAGE_SHIFT: u32 = 48;
const REF_MASK: u64 = (1 << IMAGE_SHIFT) - 1;

/// Attribute/entry expirations: image contents are immutable, overlay
/// inodes change on rescans.
const TTL_NEVER: Duration = Duration::from_secs(86400 * 365);
const TTL_SHORT: Duration = Duration::from_secs(1);

fn pack(image_idx: usize, iref: u64) -> u64 {
    ((image_idx as u64 + 1) << IMAGE_SHIFT) | (iref & REF_MASK)
}

fn unpack(ino: u64) -> Option<(usize, u64)> {
    let image = ino >> IMAGE_SHIFT;
    if image == 0 {
        None
    } else {
        Some(((image - 1) as usize, ino & REF_MASK))
    }
}

#[derive(Debug)]
enum VirtNode {
    Dir { children: FxHashMap<String, u64> },
    Symlink { target: String, owner: PackageId },
}

struct Mounted {
    handle: Arc<Mutex<Reader<File>>>,
    root_ref: u64,
}

struct ImageSlot {
    id: PackageId,
    meta: Meta,
    mounted: Mutex<Option<Mounted>>,
    /// squashfs dir ref in this image -> additional sources from unions
    unions: FxHashMap<u64, Vec<(usize, u64)>>,
    dircache: Mutex<FxHashMap<u64, Arc<Vec<squashfs::DirEntry>>>>,
}

struct State {
    images: Vec<ImageSlot>,
    by_pkg: FxHashMap<String, usize>,
    virt: FxHashMap<u64, VirtNode>,
    next_virt_ino: u64,
}

impl State {
    fn alloc_virt_dir(&mut self) -> u64 {
        let ino = self.next_virt_ino;
        self.next_virt_ino += 1;
        self.virt.insert(ino, VirtNode::Dir { children: FxHashMap::default() });
        ino
    }

    /// Create the directory chain for `path` below the root, returning
    /// the final directory's inode.
    fn mkdir_all(&mut self, path: &str) -> u64 {
        let mut cur = ROOT_INO;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let existing = match self.virt.get(&cur) {
                Some(VirtNode::Dir { children }) => children.get(comp).copied(),
                _ => None,
            };
            cur = match existing {
                Some(ino) => ino,
                None => {
                    let ino = self.alloc_virt_dir();
                    if let Some(VirtNode::Dir { children }) = self.virt.get_mut(&cur) {
                        children.insert(comp.to_string(), ino);
                    }
                    ino
                }
            };
        }
        cur
    }

    /// Install an exchange symlink, honoring ownership: a same-name
    /// package wins with a higher revision, a different package never
    /// overwrites.
    fn install_link(&mut self, dir_ino: u64, name: &str, target: String, owner: &PackageId) {
        let existing = match self.virt.get(&dir_ino) {
            Some(VirtNode::Dir { children }) => children.get(name).copied(),
            _ => return,
        };
        if let Some(ino) = existing {
            match self.virt.get(&ino) {
                Some(VirtNode::Symlink { owner: old, .. }) => {
                    if old.name != owner.name || !old.revision_less(owner) {
                        return;
                    }
                    self.virt.insert(
                        ino,
                        VirtNode::Symlink { target, owner: owner.clone() },
                    );
                }
                // a nested exchange directory shadows same-name files
                _ => (),
            }
            return;
        }
        let ino = self.next_virt_ino;
        self.next_virt_ino += 1;
        self.virt.insert(ino, VirtNode::Symlink { target, owner: owner.clone() });
        if let Some(VirtNode::Dir { children }) = self.virt.get_mut(&dir_ino) {
            children.insert(name.to_string(), ino);
        }
    }
}

pub struct Overlay {
    store: Arc<Store>,
    state: RwLock<State>,
    /// Target of the `ctl` symlink.
    ctl_path: PathBuf,
    scan_lock: Mutex<()>,
}

impl Overlay {
    pub fn new(store: Arc<Store>, ctl_path: impl Into<PathBuf>) -> Self {
        let mut virt = FxHashMap::default();
        virt.insert(ROOT_INO, VirtNode::Dir { children: FxHashMap::default() });
        let mut state =
            State { images: vec![], by_pkg: FxHashMap::default(), virt, next_virt_ino: 2 };
        // seed the exchange tree so it exists even on an empty store
        for (_, exchange) in EXCHANGE_SOURCES {
            state.mkdir_all(exchange);
        }
        for seed in SHARE_SEEDS {
            state.mkdir_all(&format!("share/{seed}"));
        }
        let overlay = Self {
            store,
            state: RwLock::new(state),
            ctl_path: ctl_path.into(),
            scan_lock: Mutex::new(()),
        };
        overlay.refresh_ctl_symlink();
        overlay
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn ctl_path(&self) -> &Path {
        &self.ctl_path
    }

    fn refresh_ctl_symlink(&self) {
        let target = self.ctl_path.display().to_string();
        let mut state = self.state.write().unwrap();
        let existing = match state.virt.get(&ROOT_INO) {
            Some(VirtNode::Dir { children }) => children.get("ctl").copied(),
            _ => None,
        };
        let nobody = PackageId { name: String::new(), arch: None, upstream: None, revision: None };
        match existing {
            Some(ino) => {
                state.virt.insert(ino, VirtNode::Symlink { target, owner: nobody });
            }
            None => {
                let ino = state.next_virt_ino;
                state.next_virt_ino += 1;
                state.virt.insert(ino, VirtNode::Symlink { target, owner: nobody });
                if let Some(VirtNode::Dir { children }) = state.virt.get_mut(&ROOT_INO) {
                    children.insert("ctl".to_string(), ino);
                }
            }
        }
    }

    /// Rescan the store: register new packages, synthesize exchange
    /// symlinks and resolve runtime unions. Serialized; concurrent calls
    /// converge on the same state. One package failing to decode skips
    /// that package only.
    pub fn scan_packages(&self) -> Result<(), Error> {
        let _guard = self.scan_lock.lock().unwrap();
        let ids = self.store.list()?;

        let known: HashSet<String> = {
            let state = self.state.read().unwrap();
            state.by_pkg.keys().cloned().collect()
        };

        // PackageRevisionLess order makes symlink ownership deterministic
        for id in ids {
            let key = id.to_string();
            if known.contains(&key) {
                continue;
            }
            let meta = match self.store.read_meta(&id) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(pkg = %id, error = %e, "skipping package without readable metadata");
                    continue;
                }
            };
            if let Err(e) = self.scan_one(&id, meta) {
                warn!(pkg = %id, error = %e, "skipping package that failed to scan");
            }
        }

        self.resolve_unions();
        Ok(())
    }

    fn scan_one(&self, id: &PackageId, meta: Meta) -> Result<(), Error> {
        // exchange synthesis requires the image contents; for a remote
        // store an image not yet in the cache is left to autodownload and
        // picked up by the rescan that follows it. A decode failure here
        // keeps the package out of the overlay entirely.
        let reader = match self.store.cached_image_path(id) {
            Some(path) => Some(Reader::new(File::open(path)?)?),
            None if self.store.is_remote() => None,
            None => return Err(Error::NotFound),
        };

        {
            let mut state = self.state.write().unwrap();
            let image_idx = state.images.len();
            state.images.push(ImageSlot {
                id: id.clone(),
                meta,
                mounted: Mutex::new(None),
                unions: FxHashMap::default(),
                dircache: Mutex::new(FxHashMap::default()),
            });
            state.by_pkg.insert(id.to_string(), image_idx);
            debug!(pkg = %id, image_idx, "registered package");
        }

        let Some(reader) = reader else { return Ok(()) };
        for (source, exchange) in EXCHANGE_SOURCES {
            let Ok(iref) = reader.lookup_path(source) else { continue };
            // /out/bin entries are reached through their wrappers in /bin
            let target_base =
                if *source == "out/bin" { "bin".to_string() } else { source.to_string() };
            self.scan_exchange_subtree(&reader, id, iref, exchange, &target_base, 1)?;
        }
        Ok(())
    }

    fn scan_exchange_subtree(
        &self,
        reader: &Reader<File>,
        id: &PackageId,
        dir_ref: u64,
        exchange: &str,
        source: &str,
        depth: usize,
    ) -> Result<(), Error> {
        let entries = reader.readdir(dir_ref)?;
        let dir_ino = {
            let mut state = self.state.write().unwrap();
            state.mkdir_all(exchange)
        };
        for entry in entries {
            match entry.kind {
                FileKind::Directory => {
                    self.scan_exchange_subtree(
                        reader,
                        id,
                        entry.inode_ref,
                        &format!("{exchange}/{}", entry.name),
                        &format!("{source}/{}", entry.name),
                        depth + 1,
                    )?;
                }
                FileKind::File | FileKind::Symlink => {
                    let up = "../".repeat(depth);
                    let target = format!("{up}{id}/{source}/{}", entry.name);
                    let mut state = self.state.write().unwrap();
                    state.install_link(dir_ino, &entry.name, target, id);
                }
            }
        }
        Ok(())
    }

    /// Second scan pass: resolve `runtime_union` declarations to pairs of
    /// squashfs directory references so readdir/lookup can union them.
    fn resolve_unions(&self) {
        let pairs: Vec<(usize, String, String)> = {
            let state = self.state.read().unwrap();
            state
                .images
                .iter()
                .enumerate()
                .flat_map(|(idx, slot)| {
                    slot.meta
                        .runtime_unions
                        .iter()
                        .map(move |u| (idx, u.pkg.clone(), u.dir.clone()))
                })
                .collect()
        };

        for (a_idx, b_name, dir) in pairs {
            let resolved = self.resolve_union_pair(a_idx, &b_name, &dir);
            match resolved {
                Ok(Some((a_ref, b_idx, b_ref))) => {
                    let mut state = self.state.write().unwrap();
                    state.images[a_idx].unions.entry(a_ref).or_default().push((b_idx, b_ref));
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "runtime union not resolvable"),
            }
        }
    }

    fn resolve_union_pair(
        &self,
        a_idx: usize,
        b_name: &str,
        dir: &str,
    ) -> Result<Option<(u64, usize, u64)>, Error> {
        let (a_id, b) = {
            let state = self.state.read().unwrap();
            let a_id = state.images[a_idx].id.clone();
            // the newest installed revision of the declared package
            let b = state
                .images
                .iter()
                .enumerate()
                .filter(|(_, s)| s.id.name == b_name)
                .max_by(|(_, x), (_, y)| x.id.revision_cmp(&y.id))
                .map(|(idx, s)| (idx, s.id.clone()));
            (a_id, b)
        };
        let Some((b_idx, b_id)) = b else { return Ok(None) };
        if {
            let state = self.state.read().unwrap();
            state.images[a_idx].unions.values().flatten().any(|(idx, _)| *idx == b_idx)
        } {
            return Ok(None);
        }

        let path = format!("out/{dir}");
        let (Some(a_path), Some(b_path)) =
            (self.store.cached_image_path(&a_id), self.store.cached_image_path(&b_id))
        else {
            return Ok(None);
        };
        let a_reader = Reader::new(File::open(a_path)?)?;
        let Ok(a_ref) = a_reader.lookup_path(&path) else { return Ok(None) };
        let b_reader = Reader::new(File::open(b_path)?)?;
        let Ok(b_ref) = b_reader.lookup_path(&path) else { return Ok(None) };
        Ok(Some((a_ref, b_idx, b_ref)))
    }

    fn ensure_open(&self, image_idx: usize) -> Result<(Arc<Mutex<Reader<File>>>, u64), Error> {
        let state = self.state.read().unwrap();
        let slot = state.images.get(image_idx).ok_or(Error::NotFound)?;
        let mut mounted = slot.mounted.lock().unwrap();
        if let Some(m) = mounted.as_ref() {
            return Ok((Arc::clone(&m.handle), m.root_ref));
        }
        let handle = self.store.open_image(&slot.id)?;
        let root_ref = handle.lock().unwrap().root_ref();
        *mounted = Some(Mounted { handle: Arc::clone(&handle), root_ref });
        info!(pkg = %slot.id, "mounted image");
        Ok((handle, root_ref))
    }

    fn cached_readdir(
        &self,
        image_idx: usize,
        iref: u64,
    ) -> Result<Arc<Vec<squashfs::DirEntry>>, Error> {
        {
            let state = self.state.read().unwrap();
            let slot = state.images.get(image_idx).ok_or(Error::NotFound)?;
            if let Some(cached) = slot.dircache.lock().unwrap().get(&iref) {
                return Ok(Arc::clone(cached));
            };
        }
        let (handle, _) = self.ensure_open(image_idx)?;
        let entries = Arc::new(handle.lock().unwrap().readdir(iref)?);
        let state = self.state.read().unwrap();
        let slot = state.images.get(image_idx).ok_or(Error::NotFound)?;
        slot.dircache.lock().unwrap().insert(iref, Arc::clone(&entries));
        Ok(entries)
    }

    /// Directory listing for an image-owned inode, with union sources
    /// appended owner-first and collisions skipped.
    fn image_readdir(
        &self,
        image_idx: usize,
        iref: u64,
    ) -> Result<Vec<(String, u64, FileKind)>, Error> {
        let mut out: Vec<(String, u64, FileKind)> = vec![];
        let mut seen: HashSet<String> = HashSet::new();
        for e in self.cached_readdir(image_idx, iref)?.iter() {
            seen.insert(e.name.clone());
            out.push((e.name.clone(), pack(image_idx, e.inode_ref), e.kind));
        }
        let extra: Vec<(usize, u64)> = {
            let state = self.state.read().unwrap();
            state.images[image_idx].unions.get(&iref).cloned().unwrap_or_default()
        };
        for (b_idx, b_ref) in extra {
            for e in self.cached_readdir(b_idx, b_ref)?.iter() {
                if seen.insert(e.name.clone()) {
                    out.push((e.name.clone(), pack(b_idx, e.inode_ref), e.kind));
                }
            }
        }
        Ok(out)
    }

    // -- internal operations the FUSE layer and the tests share --------

    pub fn lookup_ino(&self, parent: u64, name: &str) -> Result<u64, Error> {
        if let Some((image_idx, iref)) = unpack(parent) {
            return self
                .image_readdir(image_idx, iref)?
                .into_iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, ino, _)| ino)
                .ok_or(Error::NotFound);
        }

        // overlay-owned directory
        if parent == ROOT_INO {
            let image_idx = {
                let state = self.state.read().unwrap();
                state.by_pkg.get(name).copied()
            };
            if let Some(idx) = image_idx {
                let (_, root_ref) = self.ensure_open(idx)?;
                return Ok(pack(idx, root_ref));
            }
        }
        let state = self.state.read().unwrap();
        match state.virt.get(&parent) {
            Some(VirtNode::Dir { children }) => {
                children.get(name).copied().ok_or(Error::NotFound)
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Walk a slash-separated path from the overlay root.
    pub fn resolve_path(&self, path: &str) -> Result<u64, Error> {
        let mut cur = ROOT_INO;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            cur = self.lookup_ino(cur, comp)?;
        }
        Ok(cur)
    }

    pub fn readlink_ino(&self, ino: u64) -> Result<String, Error> {
        if let Some((image_idx, iref)) = unpack(ino) {
            let (handle, _) = self.ensure_open(image_idx)?;
            let target = handle.lock().unwrap().readlink(iref)?;
            return Ok(target.display().to_string());
        }
        let state = self.state.read().unwrap();
        match state.virt.get(&ino) {
            Some(VirtNode::Symlink { target, .. }) => Ok(target.clone()),
            _ => Err(Error::NotFound),
        }
    }

    pub fn readdir_ino(&self, ino: u64) -> Result<Vec<(String, u64, FileKind)>, Error> {
        if let Some((image_idx, iref)) = unpack(ino) {
            return self.image_readdir(image_idx, iref);
        }
        let mut out = vec![];
        {
            let state = self.state.read().unwrap();
            match state.virt.get(&ino) {
                Some(VirtNode::Dir { children }) => {
                    for (name, child) in children {
                        let kind = match state.virt.get(child) {
                            Some(VirtNode::Dir { .. }) => FileKind::Directory,
                            Some(VirtNode::Symlink { .. }) => FileKind::Symlink,
                            None => continue,
                        };
                        out.push((name.clone(), *child, kind));
                    }
                }
                _ => return Err(Error::NotFound),
            }
            if ino == ROOT_INO {
                for (pkg, _) in state.by_pkg.iter() {
                    // package roots resolve through lookup, which mounts
                    // the image; readdir advertises them with a
                    // placeholder inode the kernel does not rely on
                    out.push((pkg.clone(), ROOT_INO, FileKind::Directory));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn getattr_ino(&self, ino: u64) -> Result<(FileAttr, Duration), Error> {
        if let Some((image_idx, iref)) = unpack(ino) {
            let (handle, _) = self.ensure_open(image_idx)?;
            let info = handle.lock().unwrap().stat(iref)?;
            return Ok((file_attr(ino, &info), TTL_NEVER));
        }
        let state = self.state.read().unwrap();
        let attr = match state.virt.get(&ino) {
            Some(VirtNode::Dir { children }) => synth_attr(
                ino,
                FileType::Directory,
                0o755,
                2 + children.len() as u32,
                0,
            ),
            Some(VirtNode::Symlink { target, .. }) => {
                synth_attr(ino, FileType::Symlink, 0o777, 1, target.len() as u64)
            }
            None => return Err(Error::NotFound),
        };
        Ok((attr, TTL_SHORT))
    }

    pub fn read_ino(&self, ino: u64, offset: u64, size: usize) -> Result<Vec<u8>, Error> {
        let (image_idx, iref) = unpack(ino).ok_or(Error::NotFound)?;
        let (handle, _) = self.ensure_open(image_idx)?;
        let mut reader = handle.lock().unwrap();
        let mut fr = reader.file_reader(iref)?;
        let mut buf = vec![0u8; size];
        let n = fr.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn list_xattrs_ino(&self, ino: u64) -> Result<Vec<u8>, Error> {
        let Some((image_idx, iref)) = unpack(ino) else { return Ok(vec![]) };
        let (handle, _) = self.ensure_open(image_idx)?;
        let xattrs = handle.lock().unwrap().list_xattrs(iref)?;
        let mut out = vec![];
        for x in xattrs {
            out.extend_from_slice(x.name.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    pub fn get_xattr_ino(&self, ino: u64, name: &str) -> Result<Option<Vec<u8>>, Error> {
        let Some((image_idx, iref)) = unpack(ino) else { return Ok(None) };
        let (handle, _) = self.ensure_open(image_idx)?;
        let value = handle.lock().unwrap().get_xattr(iref, name)?;
        Ok(value)
    }

    /// `MkdirAll` control operation: pre-create an overlay directory so a
    /// build sandbox has a mountpoint for a package about to be built.
    pub fn mkdir_all(&self, dir: &str) -> u64 {
        let mut state = self.state.write().unwrap();
        state.mkdir_all(dir)
    }

    fn image_count(&self) -> usize {
        self.state.read().unwrap().images.len()
    }
}

fn synth_attr(ino: u64, kind: FileType, perm: u16, nlink: u32, size: u64) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind,
        perm,
        nlink,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn file_attr(ino: u64, info: &squashfs::FileInfo) -> FileAttr {
    let mtime = UNIX_EPOCH + Duration::from_secs(u64::from(info.mtime));
    FileAttr {
        ino,
        size: info.size,
        blocks: (info.size + 511) / 512,
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: match info.kind {
            FileKind::Directory => FileType::Directory,
            FileKind::File => FileType::RegularFile,
            FileKind::Symlink => FileType::Symlink,
        },
        perm: (info.mode & 0o7777) as u16,
        nlink: info.nlink,
        uid: info.uid,
        gid: info.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn errno(e: &Error) -> libc::c_int {
    match e {
        Error::NotFound => libc::ENOENT,
        Error::StdIo(io) => io.raw_os_error().unwrap_or(libc::EIO),
        _ => libc::EIO,
    }
}

fn fuse_kind(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::File => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
    }
}

/// The `fuser` adapter around [`Overlay`].
pub struct OverlayFs {
    pub overlay: Arc<Overlay>,
}

impl Filesystem for OverlayFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!(images = self.overlay.image_count(), "overlay ready");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .overlay
            .lookup_ino(parent, name)
            .and_then(|ino| self.overlay.getattr_ino(ino))
        {
            Ok((attr, ttl)) => reply.entry(&ttl, &attr, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.overlay.getattr_ino(ino) {
            Ok((attr, ttl)) => reply.attr(&ttl, &attr),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.overlay.readlink_ino(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.overlay.read_ino(ino, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.overlay.readdir_ino(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };
        for (i, (name, child, kind)) in
            entries.iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(*child, (i + 1) as i64, fuse_kind(*kind), name) {
                break;
            }
        }
        reply.ok();
    }

    // the kernel may cache handles; there is no per-open state
    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, fuser::consts::FOPEN_KEEP_CACHE);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.overlay.list_xattrs_ino(ino) {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() as u32 <= size {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.overlay.get_xattr_ino(ino, name) {
            Ok(Some(value)) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() as u32 <= size {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Ok(None) => reply.error(libc::ENODATA),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let files = self.overlay.image_count() as u64;
        reply.statfs(1, 0, 0, files, 0, 4096, 255, 4096);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }
}

/// Mount the overlay and serve it until unmounted. The control socket
/// server and, for remote stores, the prewarm/retry loop run on
/// background threads.
pub fn mount(overlay: Arc<Overlay>, mountpoint: &Path) -> Result<(), Error> {
    ctl::serve(Arc::clone(&overlay))?;

    if overlay.store().is_remote() {
        let warm = Arc::clone(&overlay);
        std::thread::spawn(move || loop {
            match warm.scan_packages() {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "prewarm scan failed, retrying");
                    std::thread::sleep(Duration::from_secs(10));
                }
            }
        });
    } else {
        overlay.scan_packages()?;
    }

    let options = [MountOption::RO, MountOption::FSName("distri".to_string())];
    let fs = OverlayFs { overlay };
    fuser::mount2(fs, mountpoint, &options)?;
    Ok(())
}
