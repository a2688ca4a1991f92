//! Helpers shared by the integration tests.

use std::path::{Path, PathBuf};

use distri::build::encode_image;
use distri::meta::Meta;

/// Write `files` (path, contents) and `symlinks` (target, linkpath) into
/// a fresh tree under `scratch`, then encode it as `<full>.squashfs` in
/// `store` with a matching metadata record.
pub fn install_package(
    scratch: &Path,
    store: &Path,
    full: &str,
    files: &[(&str, &[u8])],
    symlinks: &[(&str, &str)],
    meta: Meta,
) -> PathBuf {
    let tree = scratch.join(format!("tree-{full}"));
    for (path, contents) in files {
        let dest = tree.join(path);
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(dest, contents).unwrap();
    }
    for (target, link) in symlinks {
        let dest = tree.join(link);
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(target, dest).unwrap();
    }
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::create_dir_all(store).unwrap();

    // metadata goes first so readers never see an image without it
    meta.write_to(&store.join(format!("{full}.meta.textproto"))).unwrap();
    let image = store.join(format!("{full}.squashfs"));
    encode_image(&tree, &image).unwrap();
    image
}

pub fn simple_meta(version: &str) -> Meta {
    Meta { version: version.to_string(), ..Meta::default() }
}
