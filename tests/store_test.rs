//! Store enumeration, glob resolution and metadata handling.

mod common;

use distri::meta::Meta;
use distri::pkg::PackageId;
use distri::resolve;
use distri::store::Store;

use common::{install_package, simple_meta};

fn touch_image(store: &std::path::Path, full: &str, meta: Meta) {
    std::fs::create_dir_all(store).unwrap();
    meta.write_to(&store.join(format!("{full}.meta.textproto"))).unwrap();
    std::fs::write(store.join(format!("{full}.squashfs")), b"").unwrap();
}

#[test]
fn test_list_sorted_by_revision() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("roimg");
    for full in ["b-amd64-1-1", "a-amd64-1-10", "a-amd64-1-2"] {
        touch_image(&store_dir, full, simple_meta("1"));
    }
    let store = Store::new(store_dir.display().to_string());
    let ids: Vec<String> = store.list().unwrap().iter().map(|id| id.to_string()).collect();
    assert_eq!(ids, vec!["a-amd64-1-2", "a-amd64-1-10", "b-amd64-1-1"]);
}

#[test]
fn test_glob_picks_newest() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("roimg");
    for full in ["less-amd64-530-2", "less-amd64-530-3", "less-i686-530-9"] {
        touch_image(&store_dir, full, simple_meta("530"));
    }
    let store = Store::new(store_dir.display().to_string());

    let resolved = store.glob(&PackageId::parse("less-amd64").unwrap()).unwrap();
    assert_eq!(resolved.to_string(), "less-amd64-530-3");

    // fully qualified identifiers resolve to themselves
    let resolved = store.glob(&PackageId::parse("less-amd64-530-2").unwrap()).unwrap();
    assert_eq!(resolved.to_string(), "less-amd64-530-2");

    assert!(matches!(
        store.glob(&PackageId::parse("zsh").unwrap()),
        Err(distri::Error::NotFound)
    ));
}

#[test]
fn test_glob_follows_meta_symlink() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("roimg");
    touch_image(&store_dir, "less-amd64-530-3", simple_meta("530-3"));
    std::os::unix::fs::symlink(
        "less-amd64-530-3.meta.textproto",
        store_dir.join("less-amd64.meta.textproto"),
    )
    .unwrap();

    let store = Store::new(store_dir.display().to_string());
    let resolved = store.glob(&PackageId::parse("less-amd64").unwrap()).unwrap();
    assert_eq!(resolved.to_string(), "less-amd64-530-3");
}

#[test]
fn test_read_meta_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("roimg");
    let meta = Meta {
        version: "530-2".into(),
        source_pkg: "less".into(),
        input_digest: "6c62272e07bb014262b821756295c58d".into(),
        runtime_deps: vec!["ncurses-amd64-6.2-8".into()],
        runtime_unions: vec![],
    };
    touch_image(&store_dir, "less-amd64-530-2", meta.clone());

    let store = Store::new(store_dir.display().to_string());
    let read = store.read_meta(&PackageId::parse("less-amd64-530-2").unwrap()).unwrap();
    assert_eq!(read, meta);
}

#[test]
fn test_open_image_shares_handles() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("roimg");
    install_package(
        dir.path(),
        &store_dir,
        "less-amd64-530-2",
        &[("out/bin/less", b"contents")],
        &[],
        simple_meta("530-2"),
    );

    let store = Store::new(store_dir.display().to_string());
    let id = PackageId::parse("less-amd64-530-2").unwrap();
    let a = store.open_image(&id).unwrap();
    let b = store.open_image(&id).unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));

    let root = a.lock().unwrap().root_ref();
    assert!(!a.lock().unwrap().readdir(root).unwrap().is_empty());
}

#[test]
fn test_glob_and_resolve_closure() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("roimg");
    touch_image(
        &store_dir,
        "less-amd64-530-2",
        Meta {
            version: "530-2".into(),
            runtime_deps: vec!["ncurses".into()],
            ..Meta::default()
        },
    );
    touch_image(
        &store_dir,
        "ncurses-amd64-6.2-8",
        Meta {
            version: "6.2-8".into(),
            runtime_deps: vec!["glibc".into()],
            ..Meta::default()
        },
    );
    touch_image(&store_dir, "glibc-amd64-2.31-4", simple_meta("2.31-4"));

    let store = Store::new(store_dir.display().to_string());
    let closure = resolve::glob_and_resolve(&store, &["less".to_string()], None).unwrap();
    let rendered: Vec<String> = closure.iter().map(|id| id.to_string()).collect();
    assert_eq!(
        rendered,
        vec!["less-amd64-530-2", "ncurses-amd64-6.2-8", "glibc-amd64-2.31-4"]
    );

    // every runtime dep of an installed package is glob-resolvable
    for id in store.list().unwrap() {
        for dep in store.read_meta(&id).unwrap().runtime_deps {
            let partial = PackageId::parse(&dep).unwrap();
            assert!(store.glob(&partial).is_ok(), "dep {dep} of {id} must resolve");
        }
    }
}

#[test]
fn test_resolve_prunes_self_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("roimg");
    touch_image(
        &store_dir,
        "libxml-amd64-2.9-1",
        Meta {
            version: "2.9-1".into(),
            runtime_deps: vec!["libxml".into(), "zlib".into()],
            ..Meta::default()
        },
    );
    touch_image(&store_dir, "zlib-amd64-1.2-3", simple_meta("1.2-3"));

    let store = Store::new(store_dir.display().to_string());
    let closure =
        resolve::glob_and_resolve(&store, &["libxml".to_string(), "zlib".to_string()], Some("libxml"))
            .unwrap();
    let rendered: Vec<String> = closure.iter().map(|id| id.to_string()).collect();
    assert_eq!(rendered, vec!["zlib-amd64-1.2-3"]);
}
