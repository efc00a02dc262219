//! Backing-store I/O for VDI containers
//!
//! The container never touches host file primitives directly. Everything goes
//! through [`BackingStore`], a narrow random-access capability that the host
//! supplies: positioned reads and writes, the current extent, a resize hook
//! used when a dynamic image grows, and a durable flush.

use crate::error::{Result, VdiError};
#[cfg(not(unix))]
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Random-access byte store holding a container.
///
/// Methods take `&self` so a container can serve concurrent readers; impls
/// are expected to provide their own read consistency.
pub trait BackingStore {
    /// Fill `buf` from `offset`. A short read is an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current extent in bytes.
    fn len(&self) -> Result<u64>;

    /// Resize the store. Called only to grow a dynamic image.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Make previous writes durable.
    fn flush(&self) -> Result<()>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<B: BackingStore + ?Sized> BackingStore for Arc<B> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn set_len(&self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

/// Disk-backed container storage
///
/// On Unix reads and writes are positional (`pread`/`pwrite`) and run
/// concurrently. Elsewhere they share the file cursor and are serialized.
pub struct FileBacking {
    file: File,
    #[cfg(not(unix))]
    cursor: Mutex<()>,
    path: PathBuf,
}

impl FileBacking {
    /// Create (or truncate) a container file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(FileBacking::from_file(file, path.as_ref()))
    }

    /// Open an existing container file for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(FileBacking::from_file(file, path.as_ref()))
    }

    /// Open an existing container file without write access
    ///
    /// Pair with a read-only [`ContainerConfig`](crate::ContainerConfig);
    /// writes would otherwise surface as I/O errors.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;

        Ok(FileBacking::from_file(file, path.as_ref()))
    }

    fn from_file(file: File, path: &Path) -> Self {
        FileBacking {
            file,
            #[cfg(not(unix))]
            cursor: Mutex::new(()),
            path: path.to_path_buf(),
        }
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStore for FileBacking {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let _cursor = self.cursor.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _cursor = self.cursor.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        (&self.file).flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory container storage
///
/// An optional capacity limit makes `set_len` fail past a given size, which
/// models a host that cannot grow the container.
#[derive(Debug, Default)]
pub struct MemBacking {
    data: RwLock<Vec<u8>>,
    limit: Option<u64>,
}

impl MemBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemBacking {
            data: RwLock::new(data),
            limit: None,
        }
    }

    /// Refuse to grow past `limit` bytes.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner()
    }

    fn check_limit(&self, len: u64) -> Result<()> {
        match self.limit {
            Some(limit) if len > limit => Err(VdiError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("memory backing limited to {} bytes", limit),
            ))),
            _ => Ok(()),
        }
    }
}

impl BackingStore for MemBacking {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= data.len() as u64)
            .ok_or(VdiError::OutOfRange {
                offset,
                len: buf.len() as u64,
                limit: data.len() as u64,
            })?;
        buf.copy_from_slice(&data[offset as usize..end as usize]);
        Ok(())
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(src.len() as u64)
            .ok_or(VdiError::OutOfRange {
                offset,
                len: src.len() as u64,
                limit: u64::MAX,
            })?;
        self.check_limit(end)?;

        let mut data = self.data.write();
        if end > data.len() as u64 {
            data.resize(end as usize, 0);
        }
        data[offset as usize..end as usize].copy_from_slice(src);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.check_limit(len)?;
        let len = usize::try_from(len).map_err(|_| {
            VdiError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "length exceeds address space",
            ))
        })?;
        self.data.write().resize(len, 0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
