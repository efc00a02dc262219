//! Single-file view of a container
//!
//! The host filesystem layer presents a container as one regular file named
//! [`IMAGE_FILE_NAME`]. This module provides the narrow capability that layer
//! consumes, [`VirtualFile`], implemented by [`ImageFile`] on top of
//! [`Container::translate`](crate::Container::translate). Directory entries,
//! permissions and mount lifecycle stay on the host side.

mod file;


pub use file::{ImageFile, VirtualFile, IMAGE_FILE_NAME};
