//! Filesystem behavior over whole pathnames.

mod common;

use minos_kernel::fs::FsObject;
use minos_kernel::param::{NAME_MAX, ROOT_DIR_SECTOR, SECTOR_SIZE};
use minos_kernel::KernelError;
use rand::{Rng, RngCore};

const ROOT: u32 = ROOT_DIR_SECTOR;

#[test]
fn create_write_close_open_read_roundtrip() {
    let kernel = common::boot();
    let mut data = vec![0u8; 10_000];
    rand::thread_rng().fill_bytes(&mut data);

    kernel.fs.create("/f", data.len() as u32, ROOT).unwrap();
    {
        let file = kernel.fs.open_file("/f", ROOT).unwrap();
        assert_eq!(file.write_at(&data, 0), data.len());
    }
    let file = kernel.fs.open_file("/f", ROOT).unwrap();
    let mut out = vec![0u8; data.len()];
    assert_eq!(file.read_at(&mut out, 0), data.len());
    assert_eq!(out, data);
}

#[test]
fn random_offset_reads_match_written_content() {
    let kernel = common::boot();
    let mut rng = rand::thread_rng();
    let mut data = vec![0u8; 40_000];
    rng.fill_bytes(&mut data);

    kernel.fs.create("/blob", 0, ROOT).unwrap();
    let file = kernel.fs.open_file("/blob", ROOT).unwrap();
    assert_eq!(file.write_at(&data, 0), data.len());

    for _ in 0..50 {
        let start = rng.gen_range(0..data.len());
        let len = rng.gen_range(0..=(data.len() - start).min(2000));
        let mut out = vec![0u8; len];
        assert_eq!(file.read_at(&mut out, start as u32), len);
        assert_eq!(out, data[start..start + len]);
    }
}

#[test]
fn file_lengths_at_index_boundaries() {
    let kernel = common::boot();
    // 0 sectors, exactly the direct slots, one past them, and one past the
    // single-indirect block.
    for (name, sectors) in [
        ("/empty", 0usize),
        ("/direct", 12),
        ("/indirect", 13),
        ("/double", 141),
    ] {
        let len = sectors * SECTOR_SIZE;
        let data: Vec<u8> = (0..len).map(common::pattern).collect();
        kernel.fs.create(name, 0, ROOT).unwrap();
        let file = kernel.fs.open_file(name, ROOT).unwrap();
        assert_eq!(file.write_at(&data, 0), len, "writing {}", name);
        assert_eq!(file.len() as usize, len);
        let mut out = vec![0u8; len];
        assert_eq!(file.read_at(&mut out, 0), len, "reading {}", name);
        assert_eq!(out, data, "content of {}", name);
    }
}

#[test]
fn open_close_preserves_the_free_map() {
    let kernel = common::boot();
    kernel.fs.create("/keep", 4096, ROOT).unwrap();
    let before = kernel.fs.freemap.free_count();
    for _ in 0..10 {
        let file = kernel.fs.open_file("/keep", ROOT).unwrap();
        drop(file);
    }
    assert_eq!(kernel.fs.freemap.free_count(), before);
}

#[test]
fn removal_returns_every_sector() {
    let kernel = common::boot();
    let before = kernel.fs.freemap.free_count();
    kernel.fs.create("/victim", 20 * 512, ROOT).unwrap();
    assert!(kernel.fs.freemap.free_count() < before);
    kernel.fs.remove("/victim", ROOT, &[]).unwrap();
    assert_eq!(kernel.fs.freemap.free_count(), before);
    assert!(kernel.fs.open_file("/victim", ROOT).is_err());
}

#[test]
fn name_length_boundary() {
    let kernel = common::boot();
    let exact = "x".repeat(NAME_MAX);
    let over = "x".repeat(NAME_MAX + 1);
    kernel.fs.create(&exact, 0, ROOT).unwrap();
    assert!(kernel.fs.open_file(&exact, ROOT).is_ok());
    assert_eq!(
        kernel.fs.create(&over, 0, ROOT),
        Err(KernelError::NameTooLong)
    );
}

#[test]
fn duplicate_create_fails_and_rolls_back() {
    let kernel = common::boot();
    kernel.fs.create("/dup", 512, ROOT).unwrap();
    let free = kernel.fs.freemap.free_count();
    assert_eq!(
        kernel.fs.create("/dup", 512, ROOT),
        Err(KernelError::AlreadyExists)
    );
    assert_eq!(kernel.fs.freemap.free_count(), free);
}

#[test]
fn trailing_slash_rules() {
    let kernel = common::boot();
    assert!(kernel.fs.create("/file/", 0, ROOT).is_err());
    kernel.fs.create("/file", 0, ROOT).unwrap();
    assert!(kernel.fs.open("/file/", ROOT).is_err());
    kernel.fs.mkdir("/d", ROOT).unwrap();
    assert!(kernel.fs.open("/d", ROOT).is_ok());
}

#[test]
fn directory_tree_and_relative_paths() {
    let kernel = common::boot();
    kernel.fs.mkdir("/a", ROOT).unwrap();
    kernel.fs.mkdir("/a/b", ROOT).unwrap();
    let a = kernel.fs.chdir_lookup("/a", ROOT).unwrap();
    kernel.fs.create("inside", 0, a).unwrap();
    assert!(kernel.fs.open_file("/a/inside", ROOT).is_ok());
    assert!(kernel.fs.open_file("../a/inside", a).is_ok());
    // Resolution through a missing intermediate fails.
    assert_eq!(
        kernel.fs.open_file("/a/nope/x", ROOT).err(),
        Some(KernelError::NotFound)
    );
}

#[test]
fn readdir_skips_dot_entries() {
    let kernel = common::boot();
    kernel.fs.mkdir("/dir", ROOT).unwrap();
    kernel.fs.create("/dir/one", 0, ROOT).unwrap();
    kernel.fs.create("/dir/two", 0, ROOT).unwrap();
    let FsObject::Dir(dir) = kernel.fs.open("/dir", ROOT).unwrap() else {
        panic!("expected a directory");
    };
    let mut names = Vec::new();
    while let Some(name) = dir.read_next() {
        names.push(name);
    }
    names.sort();
    assert_eq!(names, ["one", "two"]);
}

#[test]
fn remove_directory_safety() {
    let kernel = common::boot();
    kernel.fs.mkdir("/a", ROOT).unwrap();
    kernel.fs.mkdir("/a/b", ROOT).unwrap();
    kernel.fs.create("/a/b/f", 0, ROOT).unwrap();

    // Non-empty directory refuses removal; emptied, it goes.
    assert_eq!(
        kernel.fs.remove("/a/b", ROOT, &[]),
        Err(KernelError::DirectoryNotEmpty)
    );
    kernel.fs.remove("/a/b/f", ROOT, &[]).unwrap();
    kernel.fs.remove("/a/b", ROOT, &[]).unwrap();

    // `.` and `..` are never removable.
    assert!(kernel.fs.remove("/a/.", ROOT, &[]).is_err());
    assert!(kernel.fs.remove("/a/..", ROOT, &[]).is_err());
}

#[test]
fn remove_protects_current_directories() {
    let kernel = common::boot();
    kernel.fs.mkdir("/a", ROOT).unwrap();
    kernel.fs.mkdir("/a/b", ROOT).unwrap();
    let b = kernel.fs.chdir_lookup("/a/b", ROOT).unwrap();

    // `/a` is an ancestor of the simulated process's cwd, `/a/b` is the cwd.
    assert_eq!(kernel.fs.remove("/a/b", ROOT, &[b]), Err(KernelError::InUse));
    assert_eq!(kernel.fs.remove("/a", ROOT, &[b]), Err(KernelError::InUse));
    // With no process inside, removal proceeds bottom-up.
    kernel.fs.remove("/a/b", ROOT, &[]).unwrap();
    kernel.fs.remove("/a", ROOT, &[]).unwrap();
}

#[test]
fn deny_write_blocks_writers_until_released() {
    let kernel = common::boot();
    kernel.fs.create("/exe", 0, ROOT).unwrap();
    let handle = kernel.fs.open_file("/exe", ROOT).unwrap();
    assert_eq!(handle.write_at(b"code", 0), 4);
    handle.deny_write();
    let other = kernel.fs.open_file("/exe", ROOT).unwrap();
    assert_eq!(other.write_at(b"boom", 0), 0);
    drop(handle); // releases the deny
    assert_eq!(other.write_at(b"boom", 0), 4);
}
