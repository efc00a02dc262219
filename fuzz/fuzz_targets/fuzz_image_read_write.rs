#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use vdi_container::{Container, ContainerConfig, ImageFile, MemBacking, VirtualFile};

const BLOCK: u32 = 512;
const BLOCKS: u32 = 16;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { offset: u16, data: Vec<u8> },
    Read { offset: u16, len: u16 },
    Sync,
}

// Random reads and writes against a shadow copy of the virtual disk
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let size = BLOCK as u64 * BLOCKS as u64;
    let container = match Container::create_dynamic(
        MemBacking::new(),
        size,
        BLOCK,
        "fuzz",
        ContainerConfig::default(),
    ) {
        Ok(c) => c,
        Err(_) => return,
    };
    let file = ImageFile::new(container);
    let mut shadow = vec![0u8; size as usize];

    for op in ops.iter().take(64) {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as u64 % size;
                let len = data.len().min((size - offset) as usize);
                file.write_at(offset, &data[..len]).unwrap();
                shadow[offset as usize..offset as usize + len].copy_from_slice(&data[..len]);
            }
            Op::Read { offset, len } => {
                let offset = *offset as u64 % size;
                let mut buf = vec![0u8; *len as usize % 2048];
                let n = file.read_at(offset, &mut buf).unwrap();
                assert_eq!(&buf[..n], &shadow[offset as usize..offset as usize + n]);
            }
            Op::Sync => file.sync().unwrap(),
        }
    }

    let backing = file.close().unwrap().unwrap();
    let reopened = Container::open(backing).unwrap();
    reopened
        .table()
        .unwrap()
        .validate(reopened.allocated_blocks())
        .unwrap();
});
