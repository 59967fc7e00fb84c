//! Archives built by `ZipBuilder` and read back through `ZipFs`.

use std::io::Read;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use zvfs_kernel::vfs::backends::zip::crypt::{RotatedPassword, validate_password};
use zvfs_kernel::vfs::backends::zip::find_toc;
use zvfs_kernel::{Filesystem, OpenFlags, VfsConfig, VfsError, ZipBuilder, ZipFs};

fn read_entry(fs: &ZipFs, path: &str) -> Vec<u8> {
    let mut chan = fs.open(path, OpenFlags::read(), 0).unwrap();
    let mut out = Vec::new();
    chan.read_to_end(&mut out).unwrap();
    out
}

fn write_tree(root: &Path, files: &[(&str, Vec<u8>)]) {
    for (name, data) in files {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }
}

fn sample_tree(rng: &mut StdRng) -> Vec<(&'static str, Vec<u8>)> {
    let mut noise = vec![0u8; 4096 + rng.gen_range(0..4096)];
    rng.fill_bytes(&mut noise);
    let text = "the quick brown fox jumps over the lazy dog\n"
        .repeat(200)
        .into_bytes();
    vec![
        ("bin/noise.dat", noise),
        ("docs/readme.txt", text),
        ("empty.txt", Vec::new()),
        ("one.byte", vec![0x2a]),
    ]
}

#[test]
fn test_deflated_and_stored_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let files = sample_tree(&mut rng);
    write_tree(src.path(), &files);

    let archive = out.path().join("tree.zip");
    ZipBuilder::new()
        .strip_prefix(src.path().to_string_lossy())
        .mkzip(&archive, src.path())
        .unwrap();

    let fs = ZipFs::new();
    fs.mount(&archive, "/tree", None).unwrap();
    for (name, data) in &files {
        let path = format!("/tree/{name}");
        assert_eq!(&read_entry(&fs, &path), data, "{name}");
        assert_eq!(fs.stat(&path).unwrap().size, data.len() as u64);
    }

    let noise = fs.info("/tree/bin/noise.dat").unwrap();
    assert_eq!(noise.compressed_size, noise.size, "random data falls back to stored");
    let text = fs.info("/tree/docs/readme.txt").unwrap();
    assert!(text.compressed_size < text.size / 4, "text is deflated");

    for info in [noise, text] {
        assert_eq!(info.offset % 4, 0, "payloads are aligned");
    }
    assert!(fs.stat("/tree/bin").unwrap().is_dir());
}

#[test]
fn test_round_trip_through_heap_read() {
    let mut rng = StdRng::seed_from_u64(99);
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let files = sample_tree(&mut rng);
    write_tree(src.path(), &files);
    let archive = out.path().join("heap.zip");
    ZipBuilder::new()
        .strip_prefix(src.path().to_string_lossy())
        .mkzip(&archive, src.path())
        .unwrap();

    let config = VfsConfig {
        use_mmap: false,
        ..VfsConfig::default()
    };
    let fs = ZipFs::with_config(config);
    fs.mount(&archive, "heap", None).unwrap();
    assert_eq!(
        read_entry(&fs, "//zipfs:/heap/docs/readme.txt"),
        files[1].1
    );
}

#[test]
fn test_encrypted_image_round_trip() {
    let mut rng = StdRng::seed_from_u64(3);
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let files = sample_tree(&mut rng);
    write_tree(src.path(), &files);

    let stub = out.path().join("stub.bin");
    std::fs::write(&stub, b"#!/bin/sh\necho not really an executable\n").unwrap();
    let image = out.path().join("app.img");
    ZipBuilder::new()
        .password(b"s3cret")
        .unwrap()
        .strip_prefix(src.path().to_string_lossy())
        .mkimg(&image, src.path(), Some(stub.as_path()))
        .unwrap();

    let bytes = std::fs::read(&image).unwrap();
    let toc = find_toc(&bytes, true).unwrap();
    assert!(toc.base_offset > 0);
    assert_eq!(toc.password.as_ref().unwrap().derive(), b"s3cret");

    let fs = ZipFs::new();
    fs.mount(&image, "/app", None).unwrap();
    for (name, data) in &files {
        assert_eq!(&read_entry(&fs, &format!("/app/{name}")), data, "{name}");
    }
    let prefix = read_entry(&fs, "/app");
    assert_eq!(prefix.len(), toc.base_offset);
    assert!(prefix.starts_with(b"#!/bin/sh\necho not really an executable\n"));
}

#[test]
fn test_password_rotation_round_trip() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..64 {
        let len = rng.gen_range(1..=255);
        let pw: Vec<u8> = (0..len).map(|_| rng.gen_range(0..0xff)).collect();
        validate_password(&pw).unwrap();
        let rotated = RotatedPassword::from_plain(&pw);
        assert_eq!(rotated.as_bytes().len(), pw.len());
        assert_eq!(rotated.derive(), pw);
        assert_eq!(RotatedPassword::from_rotated(rotated.as_bytes()).derive(), pw);
    }
    assert!(validate_password(&[b'a', 0xff]).is_err());
    assert!(validate_password(&[b'a'; 256]).is_err());
}

#[test]
fn test_busy_unmount() {
    let data = zvfs_kernel::vfs::backends::zip::encode_archive(
        &[("held.txt", b"still open".as_slice())],
        None,
    )
    .unwrap();
    let fs = ZipFs::new();
    fs.mount_data(data, "/busy").unwrap();

    let mut chan = fs.open("/busy/held.txt", OpenFlags::read(), 0).unwrap();
    assert!(matches!(fs.unmount("/busy"), Err(VfsError::Busy)));
    assert!(fs.exists("/busy/held.txt"));

    let mut buf = Vec::new();
    chan.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"still open");
    chan.close().unwrap();

    fs.unmount("/busy").unwrap();
    assert!(!fs.exists("/busy/held.txt"));
    assert!(fs.mounts().is_empty());
}
