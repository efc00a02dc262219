//! Byte-granular I/O over a container

use crate::container::Container;
use crate::error::{Result, VdiError};
use crate::io::BackingStore;
use crate::translate::{Intent, PhysicalRange};
use std::sync::Arc;

/// Name under which the host presents the virtual disk
pub const IMAGE_FILE_NAME: &str = "image";

/// Positioned I/O on a fixed-size file
///
/// The whole contract a host filesystem layer needs to serve one file.
pub trait VirtualFile {
    /// Read into `buf` from `offset`; returns the number of bytes read,
    /// which is short only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data` at `offset`. The file never grows.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize>;

    /// File size in bytes
    fn size(&self) -> u64;
}

/// The virtual disk of a container, as a file
///
/// Cheap to clone; clones share the container.
pub struct ImageFile<B: BackingStore> {
    container: Arc<Container<B>>,
}

impl<B: BackingStore> Clone for ImageFile<B> {
    fn clone(&self) -> Self {
        ImageFile {
            container: Arc::clone(&self.container),
        }
    }
}

impl<B: BackingStore> ImageFile<B> {
    pub fn new(container: Container<B>) -> Self {
        Self::from_shared(Arc::new(container))
    }

    pub fn from_shared(container: Arc<Container<B>>) -> Self {
        ImageFile { container }
    }

    pub fn name(&self) -> &'static str {
        IMAGE_FILE_NAME
    }

    pub fn container(&self) -> &Arc<Container<B>> {
        &self.container
    }

    pub fn sync(&self) -> Result<()> {
        self.container.sync()
    }

    /// Close the underlying container if this is the last handle
    ///
    /// Returns `Ok(None)` when other clones still hold the container.
    pub fn close(self) -> Result<Option<B>> {
        match Arc::try_unwrap(self.container) {
            Ok(container) => container.close().map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl<B: BackingStore> VirtualFile for ImageFile<B> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let total = (buf.len() as u64).min(size - offset) as usize;

        let mut done = 0usize;
        while done < total {
            let pos = offset + done as u64;
            let range = self
                .container
                .translate(pos, (total - done) as u64, Intent::Read)?;
            let n = range.len() as usize;
            let out = &mut buf[done..done + n];
            match range {
                PhysicalRange::Mapped { offset, .. } => self.container.backing().read_at(offset, out)?,
                PhysicalRange::Sparse { .. } => out.fill(0),
            }
            done += n;
        }
        Ok(total)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let size = self.size();
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > size) {
            return Err(VdiError::OutOfRange {
                offset,
                len: data.len() as u64,
                limit: size,
            });
        }

        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let range = self
                .container
                .translate(pos, (data.len() - done) as u64, Intent::Write)?;
            let n = range.len() as usize;
            let physical = range
                .offset()
                .ok_or(VdiError::CorruptTable("write translated to a sparse range"))?;
            self.container
                .backing()
                .write_at(physical, &data[done..done + n])?;
            done += n;
        }
        Ok(data.len())
    }

    fn size(&self) -> u64 {
        self.container.declared_size_bytes()
    }
}
