//! Overlay behavior, exercised against the overlay's internal operation
//! surface (the same functions the FUSE adapter calls) so the tests run
//! without mounting anything.

mod common;

use std::sync::Arc;

use test_log::test;

use distri::fuse::{ctl, Overlay, ROOT_INO};
use distri::meta::{Meta, RuntimeUnion};
use distri::squashfs::FileKind;
use distri::store::Store;

use common::{install_package, simple_meta};

fn overlay_for(store_dir: &std::path::Path, ctl: &std::path::Path) -> Arc<Overlay> {
    let store = Arc::new(Store::new(store_dir.display().to_string()));
    Arc::new(Overlay::new(store, ctl))
}

#[test]
fn test_exchange_symlink_and_revision_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    install_package(
        dir.path(),
        &store,
        "less-amd64-530-2",
        &[("out/bin/less", b"less v530")],
        &[],
        simple_meta("530-2"),
    );

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();

    let ino = overlay.resolve_path("bin/less").unwrap();
    assert_eq!(
        overlay.readlink_ino(ino).unwrap(),
        "../less-amd64-530-2/bin/less"
    );

    // a newer revision takes over after a rescan
    install_package(
        dir.path(),
        &store,
        "less-amd64-530-3",
        &[("out/bin/less", b"less v530 r3")],
        &[],
        simple_meta("530-3"),
    );
    overlay.scan_packages().unwrap();
    let ino = overlay.resolve_path("bin/less").unwrap();
    assert_eq!(
        overlay.readlink_ino(ino).unwrap(),
        "../less-amd64-530-3/bin/less"
    );
}

#[test]
fn test_shadowing_by_revision_in_one_scan() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    for full in ["foo-amd64-1-1", "foo-amd64-1-2"] {
        install_package(
            dir.path(),
            &store,
            full,
            &[("out/bin/foo", full.as_bytes())],
            &[],
            simple_meta("1"),
        );
    }

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();

    let ino = overlay.resolve_path("bin/foo").unwrap();
    assert_eq!(overlay.readlink_ino(ino).unwrap(), "../foo-amd64-1-2/bin/foo");
}

#[test]
fn test_different_packages_first_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    // scanned in identifier order: aardvark before zebra
    install_package(
        dir.path(),
        &store,
        "zebra-amd64-1-1",
        &[("out/bin/tool", b"zebra")],
        &[],
        simple_meta("1-1"),
    );
    install_package(
        dir.path(),
        &store,
        "aardvark-amd64-1-1",
        &[("out/bin/tool", b"aardvark")],
        &[],
        simple_meta("1-1"),
    );

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();

    let ino = overlay.resolve_path("bin/tool").unwrap();
    assert_eq!(
        overlay.readlink_ino(ino).unwrap(),
        "../aardvark-amd64-1-1/bin/tool"
    );
}

#[test]
fn test_package_root_and_file_reads() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    install_package(
        dir.path(),
        &store,
        "less-amd64-530-2",
        &[("out/bin/less", b"less contents")],
        &[("out/bin/less", "bin/less")],
        simple_meta("530-2"),
    );

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();

    // package roots are lazily mounted image inodes
    let pkg = overlay.lookup_ino(ROOT_INO, "less-amd64-530-2").unwrap();
    let (attr, _) = overlay.getattr_ino(pkg).unwrap();
    assert_eq!(attr.kind, fuser::FileType::Directory);

    let ino = overlay.resolve_path("less-amd64-530-2/out/bin/less").unwrap();
    assert_eq!(overlay.read_ino(ino, 0, 64).unwrap(), b"less contents");
    assert_eq!(overlay.read_ino(ino, 5, 64).unwrap(), b"contents");

    // per-package symlinks read through readlink
    let link = overlay.resolve_path("less-amd64-530-2/bin/less").unwrap();
    assert_eq!(overlay.readlink_ino(link).unwrap(), "out/bin/less");

    // nonexistent names stay nonexistent
    assert!(overlay.lookup_ino(ROOT_INO, "nope-amd64-1-1").is_err());
}

#[test]
fn test_nested_exchange_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    install_package(
        dir.path(),
        &store,
        "glib-amd64-2.58-1",
        &[("out/share/glib-2.0/schemas/org.gtk.xml", b"<schema/>")],
        &[],
        simple_meta("2.58-1"),
    );

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();

    let ino = overlay.resolve_path("share/glib-2.0/schemas/org.gtk.xml").unwrap();
    assert_eq!(
        overlay.readlink_ino(ino).unwrap(),
        "../../../glib-amd64-2.58-1/out/share/glib-2.0/schemas/org.gtk.xml"
    );
}

#[test]
fn test_runtime_union() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    install_package(
        dir.path(),
        &store,
        "fontconfig-amd64-2.13-1",
        &[("out/fonts/a.ttf", b"a"), ("out/fonts/shared.ttf", b"owner copy")],
        &[],
        Meta {
            version: "2.13-1".into(),
            runtime_unions: vec![RuntimeUnion { pkg: "extra-fonts".into(), dir: "fonts".into() }],
            ..Meta::default()
        },
    );
    install_package(
        dir.path(),
        &store,
        "extra-fonts-amd64-1-1",
        &[("out/fonts/b.ttf", b"b"), ("out/fonts/shared.ttf", b"union copy")],
        &[],
        simple_meta("1-1"),
    );

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();

    let fonts = overlay.resolve_path("fontconfig-amd64-2.13-1/out/fonts").unwrap();
    let mut names: Vec<String> =
        overlay.readdir_ino(fonts).unwrap().into_iter().map(|(n, _, _)| n).collect();
    names.sort();
    assert_eq!(names, vec!["a.ttf", "b.ttf", "shared.ttf"]);

    // collisions favor the owner
    let shared = overlay
        .resolve_path("fontconfig-amd64-2.13-1/out/fonts/shared.ttf")
        .unwrap();
    assert_eq!(overlay.read_ino(shared, 0, 64).unwrap(), b"owner copy");

    // union entries resolve into the other package
    let b = overlay.resolve_path("fontconfig-amd64-2.13-1/out/fonts/b.ttf").unwrap();
    assert_eq!(overlay.read_ino(b, 0, 64).unwrap(), b"b");
}

#[test]
fn test_rescan_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    install_package(
        dir.path(),
        &store,
        "less-amd64-530-2",
        &[("out/bin/less", b"x")],
        &[],
        simple_meta("530-2"),
    );

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();
    let before: Vec<(String, u64, FileKind)> =
        overlay.readdir_ino(ROOT_INO).unwrap();
    let bin_before = overlay.readdir_ino(overlay.resolve_path("bin").unwrap()).unwrap();

    overlay.scan_packages().unwrap();
    let after = overlay.readdir_ino(ROOT_INO).unwrap();
    let bin_after = overlay.readdir_ino(overlay.resolve_path("bin").unwrap()).unwrap();

    assert_eq!(before, after);
    assert_eq!(bin_before, bin_after);
}

#[test]
fn test_missing_meta_skips_package() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    install_package(
        dir.path(),
        &store,
        "good-amd64-1-1",
        &[("out/bin/good", b"g")],
        &[],
        simple_meta("1-1"),
    );
    install_package(
        dir.path(),
        &store,
        "broken-amd64-1-1",
        &[("out/bin/broken", b"b")],
        &[],
        simple_meta("1-1"),
    );
    std::fs::remove_file(store.join("broken-amd64-1-1.meta.textproto")).unwrap();

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();

    // the broken package is skipped, the rest of the store loads
    assert!(overlay.resolve_path("bin/good").is_ok());
    assert!(overlay.lookup_ino(ROOT_INO, "broken-amd64-1-1").is_err());
}

#[test]
fn test_ctl_socket_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    std::fs::create_dir_all(&store).unwrap();
    let socket = dir.path().join("ctl.sock");

    let overlay = overlay_for(&store, &socket);
    ctl::serve(Arc::clone(&overlay)).unwrap();

    // the ctl symlink advertises the socket without side effects
    let ctl_ino = overlay.resolve_path("ctl").unwrap();
    assert_eq!(overlay.readlink_ino(ctl_ino).unwrap(), socket.display().to_string());

    ctl::ping(&socket).unwrap();

    // MkdirAll pre-creates a mountpoint for a package about to be built
    ctl::mkdir_all(&socket, "hello-amd64-1-1").unwrap();
    let ino = overlay.resolve_path("hello-amd64-1-1").unwrap();
    let (attr, _) = overlay.getattr_ino(ino).unwrap();
    assert_eq!(attr.kind, fuser::FileType::Directory);

    // ScanPackages picks up images added after startup
    install_package(
        dir.path(),
        &store,
        "late-amd64-1-1",
        &[("out/bin/late", b"late")],
        &[],
        simple_meta("1-1"),
    );
    ctl::scan_packages(&socket).unwrap();
    assert!(overlay.resolve_path("bin/late").is_ok());
}

#[test]
fn test_listxattr_of_image_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("roimg");
    install_package(
        dir.path(),
        &store,
        "plain-amd64-1-1",
        &[("out/bin/tool", b"t")],
        &[],
        simple_meta("1-1"),
    );

    let overlay = overlay_for(&store, &dir.path().join("ctl.sock"));
    overlay.scan_packages().unwrap();
    let ino = overlay.resolve_path("plain-amd64-1-1/out/bin/tool").unwrap();
    assert!(overlay.list_xattrs_ino(ino).unwrap().is_empty());
    assert_eq!(overlay.get_xattr_ino(ino, "user.x").unwrap(), None);
}
