//! Concurrent allocation tests
//!
//! Writers racing on unallocated blocks must never produce two slots for
//! one block or leave a slot unreferenced.

use std::sync::{Arc, Barrier};
use std::thread;
use vdi_container::{
    Container, ContainerConfig, ImageFile, Intent, MemBacking, Slot, VirtualFile,
};

const BLOCK: u32 = 4096;

fn shared_dynamic(blocks: u32) -> Arc<Container<MemBacking>> {
    Arc::new(
        Container::create_dynamic(
            MemBacking::new(),
            BLOCK as u64 * blocks as u64,
            BLOCK,
            "concurrency",
            ContainerConfig::default(),
        )
        .unwrap(),
    )
}

#[test]
fn test_two_writers_same_block_get_one_slot() {
    for _ in 0..50 {
        let container = shared_dynamic(10);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let container = Arc::clone(&container);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    container
                        .translate(4 * BLOCK as u64 + 10, 1, Intent::Write)
                        .unwrap()
                })
            })
            .collect();

        let ranges: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ranges[0], ranges[1]);
        assert_eq!(container.allocated_blocks(), 1);
        assert_eq!(container.table().unwrap().lookup(4).unwrap(), Slot::Allocated(0));
    }
}

#[test]
fn test_many_writers_distinct_blocks() {
    let blocks = 64u32;
    let container = shared_dynamic(blocks);
    let threads = 8u32;
    let barrier = Arc::new(Barrier::new(threads as usize));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let container = Arc::clone(&container);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                // Every thread touches every block, in a different order.
                for i in 0..blocks {
                    let block = (i * 7 + t * 13) % blocks;
                    container
                        .translate(block as u64 * BLOCK as u64, 1, Intent::Write)
                        .unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(container.allocated_blocks(), blocks);
    let table = container.table().unwrap();
    table.validate(blocks).unwrap();
    for block in 0..blocks {
        assert!(matches!(table.lookup(block).unwrap(), Slot::Allocated(_)));
    }
}

#[test]
fn test_concurrent_readers_and_writers_through_file() {
    let blocks = 16u32;
    let container = shared_dynamic(blocks);
    let file = ImageFile::from_shared(Arc::clone(&container));

    let writers: Vec<_> = (0..4u32)
        .map(|t| {
            let file = file.clone();
            thread::spawn(move || {
                for block in (t..blocks).step_by(4) {
                    let data = vec![block as u8 + 1; BLOCK as usize];
                    file.write_at(block as u64 * BLOCK as u64, &data).unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let file = file.clone();
            thread::spawn(move || {
                let mut buf = vec![0u8; BLOCK as usize];
                for _ in 0..200 {
                    let block = rand::random::<u32>() % blocks;
                    file.read_at(block as u64 * BLOCK as u64, &mut buf).unwrap();
                    // A block is either unwritten, freshly zeroed or fully written.
                    let first = buf[0];
                    assert!(first == 0 || first == block as u8 + 1);
                }
            })
        })
        .collect();

    for h in writers.into_iter().chain(readers) {
        h.join().unwrap();
    }

    let mut buf = vec![0u8; BLOCK as usize];
    for block in 0..blocks {
        file.read_at(block as u64 * BLOCK as u64, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == block as u8 + 1));
    }
    assert_eq!(container.allocated_blocks(), blocks);
}

#[test]
fn test_sync_during_allocation() {
    let container = shared_dynamic(32);

    let writer = {
        let container = Arc::clone(&container);
        thread::spawn(move || {
            for block in 0..32u64 {
                container.translate(block * BLOCK as u64, 1, Intent::Write).unwrap();
            }
        })
    };
    let syncer = {
        let container = Arc::clone(&container);
        thread::spawn(move || {
            for _ in 0..20 {
                container.sync().unwrap();
            }
        })
    };

    writer.join().unwrap();
    syncer.join().unwrap();
    container.sync().unwrap();

    let reopened = Container::open(MemBacking::from_vec(container.backing().to_vec())).unwrap();
    assert_eq!(reopened.allocated_blocks(), 32);
    reopened.table().unwrap().validate(32).unwrap();
}
