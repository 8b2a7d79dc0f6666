//! Concurrent filesystem behavior.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use minos_kernel::param::ROOT_DIR_SECTOR;

const ROOT: u32 = ROOT_DIR_SECTOR;

/// A reader racing a writer that grows a file from 0 to 200 KB never sees
/// bytes the writer has not finished publishing: every byte returned by a
/// read matches what was written, and reads never run past the published
/// length.
#[test]
fn concurrent_grow_and_read() {
    const TOTAL: usize = 200 * 1024;
    const CHUNK: usize = 8 * 1024;

    let kernel = common::boot();
    kernel.fs.create("/grow", 0, ROOT).unwrap();
    let writer_file = kernel.fs.open_file("/grow", ROOT).unwrap();
    let reader_file = kernel.fs.open_file("/grow", ROOT).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut offset = 0usize;
            while offset < TOTAL {
                let chunk: Vec<u8> = (offset..offset + CHUNK).map(common::pattern).collect();
                assert_eq!(writer_file.write_at(&chunk, offset as u32), CHUNK);
                offset += CHUNK;
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let reader = thread::spawn(move || {
        let mut buf = vec![0u8; TOTAL];
        let mut max_seen = 0usize;
        loop {
            let finished = done.load(Ordering::SeqCst);
            let n = reader_file.read_at(&mut buf, 0);
            assert!(n <= TOTAL);
            for (i, &byte) in buf[..n].iter().enumerate() {
                assert_eq!(byte, common::pattern(i), "torn read at offset {}", i);
            }
            assert!(n >= max_seen, "published length went backwards");
            max_seen = n;
            if finished && n == TOTAL {
                break;
            }
        }
    });

    writer.join().unwrap();
    reader.join().unwrap();
}

/// Two writers extending the same file interleave without losing sectors:
/// each byte belongs to exactly one writer's region.
#[test]
fn interleaved_appenders() {
    const REGION: usize = 16 * 1024;

    let kernel = common::boot();
    kernel.fs.create("/shared", 0, ROOT).unwrap();
    let low = kernel.fs.open_file("/shared", ROOT).unwrap();
    let high = kernel.fs.open_file("/shared", ROOT).unwrap();

    let t1 = thread::spawn(move || {
        let data = vec![0x11u8; REGION];
        assert_eq!(low.write_at(&data, 0), REGION);
    });
    let t2 = thread::spawn(move || {
        let data = vec![0x22u8; REGION];
        assert_eq!(high.write_at(&data, REGION as u32), REGION);
    });
    t1.join().unwrap();
    t2.join().unwrap();

    let check = kernel.fs.open_file("/shared", ROOT).unwrap();
    let mut buf = vec![0u8; 2 * REGION];
    assert_eq!(check.read_at(&mut buf, 0), 2 * REGION);
    assert!(buf[..REGION].iter().all(|&b| b == 0x11));
    assert!(buf[REGION..].iter().all(|&b| b == 0x22));
}
