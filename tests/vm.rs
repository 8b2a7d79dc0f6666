//! Demand paging: mmap, eviction round-trips, stack growth, executable
//! sharing.

mod common;

use std::time::Duration;

use minos_kernel::param::{CODE_BASE, PAGE_SIZE, ROOT_DIR_SECTOR};
use minos_kernel::proc;

const ROOT: u32 = ROOT_DIR_SECTOR;
const MAP_BASE: usize = 0x1000_0000;

#[test]
fn mmap_dirty_writeback() {
    let kernel = common::boot();
    common::install_program(&kernel, "mapper", 64, move |ctx| {
        let fd = ctx.open("data");
        assert!(fd >= 0);
        let mapid = ctx.mmap(fd, MAP_BASE);
        assert!(mapid >= 0);
        ctx.poke(MAP_BASE + 4000, &[0xAA]);
        ctx.munmap(mapid);
        0
    });
    kernel.fs.create("data", 5000, ROOT).unwrap();

    let tid = proc::exec(&kernel, 0, "mapper").unwrap();
    assert_eq!(proc::wait(&kernel, 0, tid), 0);

    let file = kernel.fs.open_file("data", ROOT).unwrap();
    let mut byte = [0u8; 1];
    assert_eq!(file.read_at(&mut byte, 4000), 1);
    assert_eq!(byte[0], 0xAA);
    kernel.shutdown();
}

#[test]
fn mmap_rejections() {
    let kernel = common::boot();
    common::install_program(&kernel, "badmaps", 64, move |ctx| {
        ctx.create("empty", 0);
        let empty_fd = ctx.open("empty");
        let fd = ctx.open("content");

        // Zero-length file, unaligned address, null address, bad fd.
        assert_eq!(ctx.mmap(empty_fd, MAP_BASE), -1);
        assert_eq!(ctx.mmap(fd, MAP_BASE + 123), -1);
        assert_eq!(ctx.mmap(fd, 0), -1);
        assert_eq!(ctx.mmap(99, MAP_BASE), -1);

        // Overlap with an existing mapping.
        let first = ctx.mmap(fd, MAP_BASE);
        assert!(first >= 0);
        let fd2 = ctx.open("content");
        assert_eq!(ctx.mmap(fd2, MAP_BASE), -1);
        0
    });
    kernel.fs.create("content", 5000, ROOT).unwrap();

    let tid = proc::exec(&kernel, 0, "badmaps").unwrap();
    assert_eq!(proc::wait(&kernel, 0, tid), 0);
    kernel.shutdown();
}

/// With a frame pool far smaller than the working set, every page type gets
/// evicted and faulted back: mmap pages, stack (zero, then swap) pages, and
/// read-only code pages.
#[test]
fn evict_then_fault_roundtrips() {
    const FILE_PAGES: usize = 12;
    let kernel = common::boot_with_frames(4);
    common::install_program(&kernel, "churn", 128, move |ctx| {
        let sp = ctx.sp();
        // A recognizable pattern on the stack page.
        let stack_mark: Vec<u8> = (0..64).map(common::pattern).collect();
        ctx.poke(sp - 256, &stack_mark);

        let fd = ctx.open("big");
        let mapid = ctx.mmap(fd, MAP_BASE);
        assert!(mapid >= 0);

        // Touch every mapped page twice; 12 pages through 4 frames churns
        // the pool and forces evictions of clean and dirty pages alike.
        for round in 0..2 {
            for page in 0..FILE_PAGES {
                let va = MAP_BASE + page * PAGE_SIZE + 7;
                let expect = common::pattern(page * PAGE_SIZE + 7);
                assert_eq!(ctx.peek(va, 1)[0], expect, "mmap page {}", page);
                if round == 0 {
                    ctx.poke(MAP_BASE + page * PAGE_SIZE, &[0xB0 + page as u8]);
                }
            }
            // Code pages fault back in after eviction pressure.
            let code = ctx.peek(CODE_BASE, 4);
            assert_eq!(code[0], common::pattern(0));
            // The stack page survives its trips through swap.
            assert_eq!(ctx.peek(sp - 256, 64), stack_mark, "round {}", round);
        }
        ctx.munmap(mapid);
        0
    });
    kernel.fs.create("big", (FILE_PAGES * PAGE_SIZE) as u32, ROOT).unwrap();
    {
        let file = kernel.fs.open_file("big", ROOT).unwrap();
        let bytes: Vec<u8> = (0..FILE_PAGES * PAGE_SIZE).map(common::pattern).collect();
        assert_eq!(file.write_at(&bytes, 0), bytes.len());
    }

    let tid = proc::exec(&kernel, 0, "churn").unwrap();
    assert_eq!(proc::wait(&kernel, 0, tid), 0);

    // The first-round pokes were dirty mmap pages; eviction or munmap wrote
    // them back.
    let file = kernel.fs.open_file("big", ROOT).unwrap();
    for page in 0..FILE_PAGES {
        let mut byte = [0u8; 1];
        assert_eq!(file.read_at(&mut byte, (page * PAGE_SIZE) as u32), 1);
        assert_eq!(byte[0], 0xB0 + page as u8);
    }
    kernel.shutdown();
}

#[test]
fn stack_growth_heuristic_boundaries() {
    let kernel = common::boot();
    common::install_program(&kernel, "goodstack", 64, move |ctx| {
        let sp = ctx.sp() - 3 * PAGE_SIZE;
        ctx.set_sp(sp);
        // esp - 32 is a push-sized offset: the stack grows.
        ctx.poke(sp - 32, &[1]);
        // At or above the stack pointer is always fine.
        ctx.poke(sp + 64, &[2]);
        assert_eq!(ctx.peek(sp - 32, 1)[0], 1);
        0
    });
    common::install_program(&kernel, "badstack", 64, move |ctx| {
        let sp = ctx.sp() - 6 * PAGE_SIZE;
        ctx.set_sp(sp);
        // One byte past the heuristic: killed, never returns.
        ctx.poke(sp - 33, &[1]);
        0
    });

    let tid = proc::exec(&kernel, 0, "goodstack").unwrap();
    assert_eq!(proc::wait(&kernel, 0, tid), 0);
    let tid = proc::exec(&kernel, 0, "badstack").unwrap();
    assert_eq!(proc::wait(&kernel, 0, tid), -1);
    kernel.shutdown();
}

/// Four instances of one program share each code page's frame; one instance
/// exiting leaves the survivors' mappings intact.
#[test]
fn shared_executable_frames() {
    let kernel = common::boot();
    common::install_program(&kernel, "shexec", 100, move |ctx| {
        let args = common::argv(ctx);
        assert_eq!(args[0], "shexec");
        let gate = format!("gate{}", args[1]);
        // Fault the code page in, then hold until our gate file appears.
        assert_eq!(ctx.peek(CODE_BASE, 1)[0], common::pattern(0));
        loop {
            let fd = ctx.open(&gate);
            if fd >= 0 {
                ctx.close(fd);
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        42
    });

    let tids: Vec<u32> = (0..4)
        .map(|i| proc::exec(&kernel, 0, &format!("shexec {}", i)).unwrap())
        .collect();

    // Wait until every instance has its code page resident.
    let frame_of = |tid: u32| {
        kernel
            .procs
            .get(tid)
            .and_then(|p| p.pd.lookup(CODE_BASE))
            .map(|(frame, _)| frame)
    };
    let mut waited = 0;
    while tids.iter().any(|&tid| frame_of(tid).is_none()) && waited < 5000 {
        std::thread::sleep(Duration::from_millis(5));
        waited += 5;
    }

    let frames: Vec<usize> = tids.iter().map(|&tid| frame_of(tid).unwrap()).collect();
    assert!(
        frames.iter().all(|&f| f == frames[0]),
        "code page occupies more than one frame: {:?}",
        frames
    );

    let exe = kernel.fs.open_file("shexec", ROOT).unwrap();
    assert_eq!(kernel.vm.sharing.sharer_count((exe.inumber(), 0)), 4);
    drop(exe);

    // Release instance 0 and reap it; the survivors stay mapped to the
    // shared frame.
    kernel.fs.create("gate0", 1, ROOT).unwrap();
    assert_eq!(proc::wait(&kernel, 0, tids[0]), 42);
    for &tid in &tids[1..] {
        let frame = frame_of(tid);
        assert_eq!(frame, Some(frames[0]), "survivor lost its mapping");
    }

    for i in 1..4 {
        kernel.fs.create(&format!("gate{}", i), 1, ROOT).unwrap();
    }
    for &tid in &tids[1..] {
        assert_eq!(proc::wait(&kernel, 0, tid), 42);
    }
    kernel.shutdown();
}

#[test]
fn swap_slots_are_returned_at_exit() {
    let kernel = common::boot_with_frames(2);
    common::install_program(&kernel, "swapper", 64, move |ctx| {
        let sp = ctx.sp();
        // Three stack pages through two frames keeps swap busy.
        for page in 0..3usize {
            let base = sp - (page + 1) * PAGE_SIZE;
            ctx.set_sp(base);
            ctx.poke(base, &[page as u8 + 1]);
        }
        for page in 0..3usize {
            let base = sp - (page + 1) * PAGE_SIZE;
            assert_eq!(ctx.peek(base, 1)[0], page as u8 + 1);
        }
        0
    });
    let free_before = kernel.vm.swap.free_slots();
    let tid = proc::exec(&kernel, 0, "swapper").unwrap();
    assert_eq!(proc::wait(&kernel, 0, tid), 0);
    assert_eq!(kernel.vm.swap.free_slots(), free_before);
    kernel.shutdown();
}
