//! Seekable media-file stream surface.
//!
//! [`MediaFile`] binds a bidirectional byte stream to its filesystem path so
//! higher layers can reopen, replace or truncate it while keeping a single
//! handle around. Big-endian primitives are read and written through the
//! `byteorder` extension traits on the implementing stream.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::progress::ProgressSink;

/// Chunk size for stream-to-stream copies.
const COPY_CHUNK_SIZE: usize = 0x2000;

/// A seekable, bidirectional byte source bound to a filesystem path.
#[derive(Debug)]
pub struct MediaFile {
    path: PathBuf,
    file: File,
    size: u64,
}

impl MediaFile {
    /// Open an existing file read-only.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        Self::from_parts(path, file)
    }

    /// Open an existing file for reading and writing.
    pub fn open_rw(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::from_parts(path, file)
    }

    /// Create (or truncate) a file for reading and writing.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Self::from_parts(path, file)
    }

    /// Wrap an already opened file handle.
    pub fn from_parts(path: PathBuf, file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self { path, file, size })
    }

    /// The path this stream is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebind the stream to a different path without touching the handle.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// The file size as cached at open time or the last [`refresh_size`].
    ///
    /// [`refresh_size`]: MediaFile::refresh_size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Re-read the file size from the filesystem.
    pub fn refresh_size(&mut self) -> Result<u64> {
        self.size = self.file.metadata()?.len();
        Ok(self.size)
    }

    /// Reopen the bound path for reading and writing.
    pub fn reopen_rw(&mut self) -> Result<()> {
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.size = self.file.metadata()?.len();
        Ok(())
    }

    /// Replace the underlying handle and path, e.g. after a backup swap.
    pub fn assign(&mut self, path: impl Into<PathBuf>, file: File) -> Result<()> {
        self.path = path.into();
        self.size = file.metadata()?.len();
        self.file = file;
        Ok(())
    }

    /// Truncate or extend the file to the given length.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.size = len;
        Ok(())
    }

    /// Access the raw file handle.
    pub fn inner(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Read for MediaFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for MediaFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for MediaFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Copy `count` bytes from `input` at `offset` to the current position of
/// `output`, in chunks, polling the progress sink for cancellation.
pub fn copy_range<R, W>(
    input: &mut R,
    output: &mut W,
    offset: u64,
    count: u64,
    progress: &dyn ProgressSink,
) -> Result<()>
where
    R: Read + Seek,
    W: Write,
{
    input.seek(SeekFrom::Start(offset))?;
    let mut buffer = [0u8; COPY_CHUNK_SIZE];
    let mut remaining = count;
    while remaining > 0 {
        if progress.is_aborted() {
            return Err(Error::Aborted);
        }
        let chunk = remaining.min(COPY_CHUNK_SIZE as u64) as usize;
        input.read_exact(&mut buffer[..chunk])?;
        output.write_all(&buffer[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::io::Cursor;

    #[test]
    fn test_media_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let mut file = MediaFile::create(&path).unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();
        assert_eq!(file.refresh_size().unwrap(), 11);

        file.seek(SeekFrom::Start(6)).unwrap();
        let mut buf = [0u8; 5];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_set_len_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.bin");

        let mut file = MediaFile::create(&path).unwrap();
        file.write_all(&[0u8; 100]).unwrap();
        file.set_len(10).unwrap();
        assert_eq!(file.size(), 10);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }

    #[test]
    fn test_copy_range() {
        let mut input = Cursor::new(b"0123456789".to_vec());
        let mut output = Vec::new();
        copy_range(&mut input, &mut output, 2, 5, &NoProgress).unwrap();
        assert_eq!(output, b"23456");
    }

    #[test]
    fn test_copy_range_eof() {
        let mut input = Cursor::new(b"abc".to_vec());
        let mut output = Vec::new();
        let err = copy_range(&mut input, &mut output, 0, 10, &NoProgress).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
