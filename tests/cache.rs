//! Block cache behavior observed through device counters.

mod common;

use std::sync::Arc;
use std::time::Duration;

use minos_kernel::dev::MemDisk;
use minos_kernel::param::ROOT_DIR_SECTOR;
use minos_kernel::{BootConfig, Kernel};

#[test]
fn reread_after_pressure_costs_at_most_one_device_read() {
    let kernel = common::boot();
    let cache = &kernel.fs.cache;

    // 65 distinct sectors on a 64-slot rotation (the 65th slot is pinned to
    // the free map).
    for sector in 100..165 {
        cache.with_read(sector, |_| ());
    }
    let before = kernel.fs_dev.read_count();
    cache.with_read(100, |_| ());
    let delta = kernel.fs_dev.read_count() - before;
    assert!(delta <= 1, "re-read of a recent sector cost {} reads", delta);
}

#[test]
fn repeated_access_is_served_from_memory() {
    let kernel = common::boot();
    let cache = &kernel.fs.cache;
    cache.with_write(50, |data| data.fill(0x42));
    let before = kernel.fs_dev.read_count();
    for _ in 0..100 {
        cache.with_read(50, |data| assert_eq!(data[0], 0x42));
    }
    assert_eq!(kernel.fs_dev.read_count(), before);
}

#[test]
fn read_ahead_primes_the_cache() {
    let kernel = common::boot();
    let cache = &kernel.fs.cache;
    cache.read_ahead(77);
    let mut waited = 0;
    while !cache.resident_sectors().contains(&77) && waited < 2000 {
        std::thread::sleep(Duration::from_millis(5));
        waited += 5;
    }
    assert!(cache.resident_sectors().contains(&77));
}

#[test]
fn write_behind_reaches_the_device_without_explicit_flush() {
    let kernel = common::boot();
    let cache = &kernel.fs.cache;
    let writes_before = kernel.fs_dev.write_count();
    cache.with_write(60, |data| data.fill(0x77));
    // The write-behind worker runs on a 100ms cadence.
    let mut waited = 0;
    while kernel.fs_dev.write_count() == writes_before && waited < 5000 {
        std::thread::sleep(Duration::from_millis(20));
        waited += 20;
    }
    assert!(kernel.fs_dev.write_count() > writes_before);
}

#[test]
fn shutdown_flush_makes_data_durable_across_remount() {
    let fs_dev = Arc::new(MemDisk::new(2048));
    let payload: Vec<u8> = (0..3000).map(common::pattern).collect();
    {
        let kernel = Kernel::boot_with_devices(
            Arc::clone(&fs_dev),
            Arc::new(MemDisk::new(512)),
            BootConfig::default(),
        );
        kernel.fs.create("/persist", 0, ROOT_DIR_SECTOR).unwrap();
        let file = kernel.fs.open_file("/persist", ROOT_DIR_SECTOR).unwrap();
        assert_eq!(file.write_at(&payload, 0), payload.len());
        drop(file);
        kernel.shutdown();
    }

    let kernel = Kernel::boot_with_devices(
        fs_dev,
        Arc::new(MemDisk::new(512)),
        BootConfig {
            format: false,
            ..BootConfig::default()
        },
    );
    let file = kernel.fs.open_file("/persist", ROOT_DIR_SECTOR).unwrap();
    let mut out = vec![0u8; payload.len()];
    assert_eq!(file.read_at(&mut out, 0), payload.len());
    assert_eq!(out, payload);
}
