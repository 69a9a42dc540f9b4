#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{PenumbraError, Result};

/// Positioned file I/O used by file-backed pagers and the journal.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` with the bytes at `off`; reading past the end is an error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file if needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod positioned {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub fn read(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(buf, off)
    }

    pub fn write(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(buf, off)
    }
}

#[cfg(windows)]
mod positioned {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt;

    pub fn read(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(buf, off)
    }

    pub fn write(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(buf, off)
    }
}

/// [`FileIo`] over a filesystem file.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
    path: Arc<PathBuf>,
}

impl StdFileIo {
    /// Opens or creates `path` for read-write access without truncating it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        trace!(path = %path.display(), "io.open");
        Ok(Self {
            inner: Arc::new(file),
            path: Arc::new(path.to_path_buf()),
        })
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = positioned::read(&self.inner, dst, off)?;
            if read == 0 {
                return Err(PenumbraError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "positioned read reached end of file",
                )));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = positioned::write(&self.inner, src, off)?;
            if written == 0 {
                return Err(PenumbraError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "positioned write wrote zero bytes",
                )));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all()?;
        trace!(path = %self.path.display(), "io.sync_all");
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len)?;
        Ok(())
    }
}

/// In-memory [`FileIo`] used for transient scratch space and tests.
///
/// Reads past the current length fail with `UnexpectedEof`, matching
/// [`StdFileIo`].
#[derive(Clone, Default)]
pub struct MemFileIo {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }
}

fn span(off: u64, len: usize) -> Result<(usize, usize)> {
    let start = usize::try_from(off).map_err(|_| PenumbraError::Invalid("offset overflow"))?;
    let end = start
        .checked_add(len)
        .ok_or(PenumbraError::Invalid("offset overflow"))?;
    Ok((start, end))
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.inner.lock();
        let (start, end) = span(off, dst.len())?;
        if end > data.len() {
            return Err(PenumbraError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of in-memory file",
            )));
        }
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut data = self.inner.lock();
        let (start, end) = span(off, src.len())?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| PenumbraError::Invalid("length overflow"))?;
        self.inner.lock().resize(len, 0);
        Ok(())
    }
}
