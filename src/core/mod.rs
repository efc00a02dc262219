//! VDI container engine
//!
//! - [`error`] - Error taxonomy for every container operation
//! - [`header`] - Fixed-layout image header codec
//! - [`table`] - Block allocation table (logical block to physical slot)
//! - [`allocator`] - Append-only slot allocation and zero-fill
//! - [`translate`] - Logical-to-physical address translation
//! - [`container`] - Open, create, sync and close
//! - [`io`] - Backing store abstraction (file and memory)
//! - [`config`] - Embedder tunables
//! - [`vfs`] - Single-file view for host filesystem layers

pub mod allocator;
pub mod config;
pub mod container;
pub mod error;
pub mod header;
pub mod io;
pub mod table;
pub mod translate;
pub mod vfs;

pub use container::Container;
