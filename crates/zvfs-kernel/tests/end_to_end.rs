//! A ZIP archive mounted at `/zvfs` and used through the dispatching layer.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use zvfs_kernel::vfs::backends::zip::encode_archive;
use zvfs_kernel::{AccessMode, FsPath, GlobTypes, OpenFlags, Vfs, VfsError, ZipFs};

fn mounted() -> (tempfile::TempDir, Vfs, Arc<ZipFs>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("archive.zip");
    let bytes = encode_archive(
        &[
            ("lib/init.tcl", b"ok".as_slice()),
            ("lib/sub/", b"".as_slice()),
        ],
        None,
    )
    .unwrap();
    std::fs::write(&archive, bytes).unwrap();

    let vfs = Vfs::new();
    let zip = Arc::new(ZipFs::new());
    vfs.register("zipfs", zip.clone()).unwrap();
    assert_eq!(zip.mount(&archive, "/zvfs", None).unwrap(), "/zvfs");
    (dir, vfs, zip)
}

fn p(text: &str) -> FsPath {
    FsPath::from_text(text)
}

#[test]
fn test_zvfs_scenario() {
    let (_dir, vfs, _zip) = mounted();

    let file = vfs.stat(&p("/zvfs/lib/init.tcl")).unwrap();
    assert_eq!(file.size, 2);
    assert!(!file.is_dir());
    assert!(vfs.stat(&p("/zvfs/lib/sub")).unwrap().is_dir());

    let mut found = vfs.glob(&p("/zvfs/lib"), Some("*"), GlobTypes::ANY).unwrap();
    found.sort();
    assert_eq!(found, vec!["/zvfs/lib/init.tcl", "/zvfs/lib/sub"]);

    let mut chan = vfs.open(&p("/zvfs/lib/init.tcl"), OpenFlags::read(), 0).unwrap();
    assert_eq!(chan.read_to_vec().unwrap(), b"ok");
}

#[test]
fn test_paths_resolve_through_normalization() {
    let (_dir, vfs, _zip) = mounted();
    let messy = p("/zvfs/lib/sub/../init.tcl");
    assert_eq!(vfs.stat(&messy).unwrap().size, 2);
    assert_eq!(vfs.filesystem_for_path(&messy).unwrap().name, "zipfs");
    assert_eq!(vfs.path_type(&messy).unwrap(), "zip");
    assert!(vfs.list_volumes().iter().any(|v| v == "//zipfs:/"));

    vfs.set_cwd(&p("/zvfs/lib")).unwrap();
    let mut chan = vfs.open(&p("init.tcl"), OpenFlags::read(), 0).unwrap();
    let mut out = String::new();
    chan.read_to_string(&mut out).unwrap();
    assert_eq!(out, "ok");
}

#[test]
fn test_access_and_missing_entries() {
    let (_dir, vfs, _zip) = mounted();
    vfs.access(&p("/zvfs/lib/init.tcl"), AccessMode::READ).unwrap();
    assert!(vfs.access(&p("/zvfs/lib/init.tcl"), AccessMode::EXECUTE).is_err());
    assert!(vfs.access(&p("/zvfs/lib/sub"), AccessMode::WRITE).is_err());
    assert!(matches!(
        vfs.stat(&p("/zvfs/lib/nothere")),
        Err(VfsError::NotFound(_))
    ));
    assert!(vfs.open(&p("/zvfs/lib/nothere"), OpenFlags::write_truncate(), 0).is_err());
    assert!(vfs.delete_file(&p("/zvfs/lib/init.tcl")).is_err());
}

#[test]
fn test_write_overrides_entry_in_memory() {
    let (dir, vfs, _zip) = mounted();
    let before = std::fs::read(dir.path().join("archive.zip")).unwrap();

    let mut chan = vfs
        .open(&p("/zvfs/lib/init.tcl"), OpenFlags::append(), 0)
        .unwrap();
    chan.write_all(b" and more").unwrap();
    chan.close().unwrap();

    let mut chan = vfs.open(&p("/zvfs/lib/init.tcl"), OpenFlags::read(), 0).unwrap();
    assert_eq!(chan.read_to_vec().unwrap(), b"ok and more");
    assert_eq!(vfs.stat(&p("/zvfs/lib/init.tcl")).unwrap().size, 11);
    drop(chan);

    let mut chan = vfs
        .open(&p("/zvfs/lib/init.tcl"), OpenFlags::write_truncate(), 0)
        .unwrap();
    chan.write_all(b"new").unwrap();
    chan.close().unwrap();
    let mut chan = vfs.open(&p("/zvfs/lib/init.tcl"), OpenFlags::read(), 0).unwrap();
    assert_eq!(chan.read_to_vec().unwrap(), b"new");

    assert_eq!(std::fs::read(dir.path().join("archive.zip")).unwrap(), before);
}

#[test]
fn test_write_cap() {
    let (_dir, vfs, zip) = mounted();
    zip.set_max_write_size(4);
    let mut chan = vfs
        .open(&p("/zvfs/lib/init.tcl"), OpenFlags::write_truncate(), 0)
        .unwrap();
    assert!(chan.write_all(b"too long").is_err());
    drop(chan);

    zip.set_max_write_size(0);
    assert!(vfs.open(&p("/zvfs/lib/init.tcl"), OpenFlags::read_write(), 0).is_err());
}

#[test]
fn test_seek_bounds() {
    let (_dir, vfs, _zip) = mounted();
    let mut chan = vfs.open(&p("/zvfs/lib/init.tcl"), OpenFlags::read(), 0).unwrap();
    assert_eq!(chan.seek(SeekFrom::End(-1)).unwrap(), 1);
    let mut rest = Vec::new();
    chan.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"k");
    assert!(chan.seek(SeekFrom::Start(3)).is_err());
    assert!(chan.seek(SeekFrom::Current(-5)).is_err());
    assert_eq!(chan.seek(SeekFrom::Start(2)).unwrap(), 2);

    let mut dir_chan = vfs.open(&p("/zvfs/lib/sub"), OpenFlags::read(), 0).unwrap();
    assert!(dir_chan.seek(SeekFrom::Start(0)).is_err());
}

#[test]
fn test_unmount_while_open_then_after_close() {
    let (_dir, vfs, zip) = mounted();
    let path = p("/zvfs/lib/init.tcl");
    let chan = vfs.open(&path, OpenFlags::read(), 0).unwrap();

    assert!(matches!(zip.unmount("/zvfs"), Err(VfsError::Busy)));
    assert_eq!(vfs.filesystem_for_path(&path).unwrap().name, "zipfs");

    drop(chan);
    zip.unmount("/zvfs").unwrap();
    assert_eq!(vfs.filesystem_for_path(&path).unwrap().name, "native");
    assert!(vfs.stat(&path).is_err());
}
