//! Lazy block allocation on dynamic images

use vdi_container::{
    BackingStore, Container, ContainerConfig, Intent, MemBacking, PhysicalRange, Slot, VdiError,
};

const BLOCK: u32 = 4096;

fn dynamic(blocks: u32) -> Container<MemBacking> {
    Container::create_dynamic(
        MemBacking::new(),
        BLOCK as u64 * blocks as u64,
        BLOCK,
        "alloc",
        ContainerConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_first_write_gets_slot_zero_at_block_offset() {
    let container = dynamic(10);
    let block_offset = container.header().block_offset as u64;

    let range = container.translate(6 * BLOCK as u64, 1, Intent::Write).unwrap();
    assert_eq!(range, PhysicalRange::Mapped { offset: block_offset, len: 1 });
    assert_eq!(container.allocated_blocks(), 1);
    assert_eq!(container.table().unwrap().lookup(6).unwrap(), Slot::Allocated(0));
}

#[test]
fn test_slots_are_gapless_and_monotonic() {
    let container = dynamic(10);
    let order = [9u32, 2, 5, 0, 7];

    for (expected_slot, block) in order.iter().enumerate() {
        container
            .translate(*block as u64 * BLOCK as u64 + 17, 3, Intent::Write)
            .unwrap();
        assert_eq!(
            container.table().unwrap().lookup(*block).unwrap(),
            Slot::Allocated(expected_slot as u32)
        );
    }
    assert_eq!(container.allocated_blocks(), order.len() as u32);

    let expected_len = container.header().block_offset as u64 + order.len() as u64 * BLOCK as u64;
    assert_eq!(container.backing().len().unwrap(), expected_len);
}

#[test]
fn test_repeat_write_is_idempotent() {
    let container = dynamic(10);
    let first = container.translate(3 * BLOCK as u64, 8, Intent::Write).unwrap();
    let second = container.translate(3 * BLOCK as u64, 8, Intent::Write).unwrap();

    assert_eq!(first, second);
    assert_eq!(container.allocated_blocks(), 1);
}

#[test]
fn test_new_block_reads_zero_before_application_write() {
    let container = dynamic(4);
    let block_offset = container.header().block_offset as usize;

    // Leave garbage where the first slot will live.
    container
        .backing()
        .set_len(block_offset as u64 + BLOCK as u64)
        .unwrap();
    container
        .backing()
        .write_at(block_offset as u64, &vec![0xA5; BLOCK as usize])
        .unwrap();

    container.translate(BLOCK as u64, 1, Intent::Write).unwrap();

    let range = container.translate(BLOCK as u64, BLOCK as u64, Intent::Read).unwrap();
    let offset = range.offset().unwrap();
    let mut buf = vec![0xFFu8; range.len() as usize];
    container.backing().read_at(offset, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn test_read_of_unallocated_block_is_sparse() {
    let container = dynamic(4);
    let range = container.translate(100, 50, Intent::Read).unwrap();
    assert_eq!(range, PhysicalRange::Sparse { len: 50 });
    assert_eq!(container.allocated_blocks(), 0);
    assert!(!container.is_dirty());
}

#[test]
fn test_disk_size_boundary() {
    let container = dynamic(4);
    let disk_size = container.declared_size_bytes();

    assert!(container.translate(disk_size - 1, 1, Intent::Read).is_ok());
    assert!(matches!(
        container.translate(disk_size, 1, Intent::Read),
        Err(VdiError::OutOfRange { .. })
    ));
    assert!(matches!(
        container.translate(disk_size, 1, Intent::Write),
        Err(VdiError::OutOfRange { .. })
    ));
}

#[test]
fn test_every_block_allocatable_then_full() {
    let container = dynamic(3);
    for block in 0..3u64 {
        container.translate(block * BLOCK as u64, 1, Intent::Write).unwrap();
    }
    assert_eq!(container.allocated_blocks(), 3);

    // Already-mapped blocks still translate once the image is full.
    assert!(container.translate(0, 1, Intent::Write).is_ok());
}

#[test]
fn test_reopened_image_continues_after_last_slot() {
    let container = dynamic(6);
    container.translate(4 * BLOCK as u64, 1, Intent::Write).unwrap();
    container.translate(BLOCK as u64, 1, Intent::Write).unwrap();
    let backing = container.close().unwrap();

    let container = Container::open(backing).unwrap();
    container.translate(5 * BLOCK as u64, 1, Intent::Write).unwrap();
    assert_eq!(container.table().unwrap().lookup(5).unwrap(), Slot::Allocated(2));
}
