#![no_main]
use libfuzzer_sys::fuzz_target;
use vdi_container::{Container, ContainerHeader, MemBacking};

// Arbitrary bytes must never panic the header or table decoders
fuzz_target!(|input: &[u8]| {
    if let Ok(header) = ContainerHeader::parse(input) {
        assert_eq!(ContainerHeader::parse(&header.to_bytes()).ok(), Some(header));
    }

    if let Ok(container) = Container::open(MemBacking::from_vec(input.to_vec())) {
        let _ = container.sync();
    }
});
