//! Encoder/decoder round trips over real files.

use std::fs::File;
use std::io::Write;

use distri::squashfs::{Reader, Writer, Xattr};

const MTIME_2020: u32 = 1577836800; // 2020-01-01T00:00:00Z

#[test]
fn test_single_file_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.squashfs");

    let file = File::create(&path).unwrap();
    let mut writer = Writer::new(file, MTIME_2020).unwrap();
    let mut root = writer.root(MTIME_2020);
    let mut fw = root.file("hello.txt", MTIME_2020, 0o644, &[]).unwrap();
    fw.write_all(b"hi\n").unwrap();
    fw.finish().unwrap();
    root.flush().unwrap();
    let total = writer.finish().unwrap();

    // a tiny image pads out to exactly one page
    assert_eq!(total, 4096);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

    let mut rdr = Reader::new(File::open(&path).unwrap()).unwrap();
    assert_eq!(rdr.superblock().mod_time, MTIME_2020);

    let ino = rdr.lookup_path("hello.txt").unwrap();
    let info = rdr.stat(ino).unwrap();
    assert_eq!(info.size, 3);
    assert_eq!(info.mode & 0o7777, 0o644);
    assert_eq!(info.mtime, MTIME_2020);

    let mut fr = rdr.file_reader(ino).unwrap();
    assert_eq!(fr.read_all().unwrap(), b"hi\n");

    assert!(matches!(
        rdr.lookup_path("missing.txt"),
        Err(distri::Error::NotFound)
    ));
}

#[test]
fn test_tree_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let tree = dir.path().join("tree");
    std::fs::create_dir_all(tree.join("out/bin")).unwrap();
    std::fs::create_dir_all(tree.join("out/lib")).unwrap();
    std::fs::write(tree.join("out/bin/less"), b"binary contents").unwrap();
    std::fs::write(tree.join("out/lib/libless.so.1"), b"library").unwrap();
    std::os::unix::fs::symlink("libless.so.1", tree.join("out/lib/libless.so")).unwrap();

    let image = dir.path().join("x.squashfs");
    distri::build::encode_image(&tree, &image).unwrap();

    let mut rdr = Reader::new(File::open(&image).unwrap()).unwrap();
    let out = rdr.lookup_path("out").unwrap();
    let names: Vec<String> = rdr.readdir(out).unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["bin", "lib"]);

    let link = rdr.lookup_path("out/lib/libless.so").unwrap();
    assert_eq!(rdr.readlink(link).unwrap().to_str().unwrap(), "libless.so.1");

    let ino = rdr.lookup_path("out/bin/less").unwrap();
    let mut fr = rdr.file_reader(ino).unwrap();
    assert_eq!(fr.read_all().unwrap(), b"binary contents");
}

#[test]
fn test_empty_directory_reports_size_3() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.squashfs");

    let mut writer = Writer::new(File::create(&path).unwrap(), 0).unwrap();
    let mut root = writer.root(0);
    let sub = root.directory("empty", 0);
    sub.flush().unwrap();
    root.flush().unwrap();
    writer.finish().unwrap();

    let rdr = Reader::new(File::open(&path).unwrap()).unwrap();
    let ino = rdr.lookup_path("empty").unwrap();
    assert_eq!(rdr.stat(ino).unwrap().size, 3);
    assert!(rdr.readdir(ino).unwrap().is_empty());
}

#[test]
fn test_large_directory_spans_headers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("many.squashfs");

    let mut writer = Writer::new(File::create(&path).unwrap(), 0).unwrap();
    let mut root = writer.root(0);
    for i in 0..300 {
        let mut fw = root.file(&format!("file-{i:03}"), 0, 0o644, &[]).unwrap();
        fw.write_all(format!("{i}").as_bytes()).unwrap();
        fw.finish().unwrap();
    }
    root.flush().unwrap();
    writer.finish().unwrap();

    let mut rdr = Reader::new(File::open(&path).unwrap()).unwrap();
    let entries = rdr.readdir(rdr.root_ref()).unwrap();
    assert_eq!(entries.len(), 300);
    // sorted, and every entry resolvable
    assert_eq!(entries[0].name, "file-000");
    assert_eq!(entries[299].name, "file-299");
    let ino = rdr.lookup_path("file-123").unwrap();
    let mut fr = rdr.file_reader(ino).unwrap();
    assert_eq!(fr.read_all().unwrap(), b"123");
}

#[test]
fn test_multi_block_file_read_at() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.squashfs");

    // three 128 KiB blocks plus a tail
    let mut contents = Vec::with_capacity(400_000);
    for i in 0..400_000u32 {
        contents.push((i % 251) as u8);
    }

    let mut writer = Writer::new(File::create(&path).unwrap(), 0).unwrap();
    let mut root = writer.root(0);
    let mut fw = root.file("big", 0, 0o644, &[]).unwrap();
    fw.write_all(&contents).unwrap();
    fw.finish().unwrap();
    root.flush().unwrap();
    writer.finish().unwrap();

    let mut rdr = Reader::new(File::open(&path).unwrap()).unwrap();
    let ino = rdr.lookup_path("big").unwrap();
    assert_eq!(rdr.stat(ino).unwrap().size, 400_000);

    let mut fr = rdr.file_reader(ino).unwrap();
    let mut buf = vec![0u8; 1000];
    // a read spanning the first block boundary
    let n = fr.read_at(&mut buf, 131_000).unwrap();
    assert_eq!(n, 1000);
    assert_eq!(buf, contents[131_000..132_000]);
    // a short read at the tail
    let n = fr.read_at(&mut buf, 399_500).unwrap();
    assert_eq!(n, 500);
    assert_eq!(buf[..500], contents[399_500..]);
    // past the end
    assert_eq!(fr.read_at(&mut buf, 500_000).unwrap(), 0);
}

#[test]
fn test_xattrs_roundtrip_and_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("caps.squashfs");

    let mut writer = Writer::new(File::create(&path).unwrap(), 0).unwrap();
    let mut root = writer.root(0);
    let caps = vec![Xattr::new("security.capability", vec![1u8, 0, 0, 2])];
    let mut fw = root.file("ping", 0, 0o755, &caps).unwrap();
    fw.write_all(b"elf").unwrap();
    fw.finish().unwrap();
    let mut fw = root.file("plain", 0, 0o644, &[]).unwrap();
    fw.write_all(b"x").unwrap();
    fw.finish().unwrap();
    root.flush().unwrap();
    writer.finish().unwrap();

    let rdr = Reader::new(File::open(&path).unwrap()).unwrap();
    assert!(!rdr.superblock().no_xattrs_in_archive());

    let ping = rdr.lookup_path("ping").unwrap();
    assert_eq!(rdr.list_xattrs(ping).unwrap(), caps);
    assert_eq!(rdr.get_xattr(ping, "security.capability").unwrap(), Some(vec![1, 0, 0, 2]));
    assert_eq!(rdr.get_xattr(ping, "user.other").unwrap(), None);

    // a file without xattrs has an empty list
    let plain = rdr.lookup_path("plain").unwrap();
    assert!(rdr.list_xattrs(plain).unwrap().is_empty());
}

#[test]
fn test_image_without_xattrs_keeps_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.squashfs");
    let mut writer = Writer::new(File::create(&path).unwrap(), 0).unwrap();
    let root = writer.root(0);
    root.flush().unwrap();
    writer.finish().unwrap();

    let rdr = Reader::new(File::open(&path).unwrap()).unwrap();
    assert!(rdr.superblock().no_xattrs_in_archive());
}

#[test]
fn test_setuid_mode_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("suid.squashfs");
    let mut writer = Writer::new(File::create(&path).unwrap(), 0).unwrap();
    let mut root = writer.root(0);
    let mut fw = root.file("su", 0, 0o4755, &[]).unwrap();
    fw.write_all(b"elf").unwrap();
    fw.finish().unwrap();
    root.flush().unwrap();
    writer.finish().unwrap();

    let rdr = Reader::new(File::open(&path).unwrap()).unwrap();
    let ino = rdr.lookup_path("su").unwrap();
    assert_eq!(rdr.stat(ino).unwrap().mode & 0o7777, 0o4755);
}

#[test]
fn test_bad_magic_and_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("bad");
    std::fs::write(&bad, b"not a squashfs image, but long enough to hold a superblock and then some padding bytes to reach the size").unwrap();
    assert!(matches!(
        Reader::new(File::open(&bad).unwrap()),
        Err(distri::Error::BadMagic)
    ));

    let short = dir.path().join("short");
    std::fs::write(&short, b"hsqs").unwrap();
    assert!(matches!(
        Reader::new(File::open(&short).unwrap()),
        Err(distri::Error::Truncated(_))
    ));
}
