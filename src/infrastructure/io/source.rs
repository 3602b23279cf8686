//! Readable image inputs
//!
//! A [`ByteSource`] is a sequential reader with a known logical size:
//! a raw file, one member of a tar archive, or a decompressing wrapper
//! (see [`super::lz4`]). Sources are opened lazily and read once.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::infrastructure::io::tar::TarEntry;

/// Abstract readable input with a known size.
pub trait ByteSource: Send {
    /// Human-readable origin, e.g. `pkg.tar:boot.img`.
    fn display_name(&self) -> String;

    /// Logical number of bytes this source yields.
    fn size(&self) -> u64;

    /// Read up to `out.len()` bytes. Zero means end of stream or error;
    /// errors surface through `Result`.
    fn read(&mut self, out: &mut [u8]) -> Result<usize>;
}

impl ByteSource for Box<dyn ByteSource> {
    fn display_name(&self) -> String {
        self.as_ref().display_name()
    }

    fn size(&self) -> u64 {
        self.as_ref().size()
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        self.as_mut().read(out)
    }
}

/// Fill `out` completely or fail.
pub fn read_exact(src: &mut dyn ByteSource, out: &mut [u8]) -> Result<()> {
    let mut off = 0;
    while off < out.len() {
        let got = src.read(&mut out[off..])?;
        if got == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read from {}", src.display_name()),
            )));
        }
        off += got;
    }
    Ok(())
}

struct RawFileSource {
    path: PathBuf,
    file: File,
    size: u64,
}

impl ByteSource for RawFileSource {
    fn display_name(&self) -> String {
        self.path.display().to_string()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(out)?)
    }
}

struct TarEntrySource {
    tar_path: PathBuf,
    entry: TarEntry,
    file: File,
    remaining: u64,
}

impl ByteSource for TarEntrySource {
    fn display_name(&self) -> String {
        format!("{}:{}", self.tar_path.display(), self.entry.name)
    }

    fn size(&self) -> u64 {
        self.entry.size
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 || out.is_empty() {
            return Ok(0);
        }
        let want = (self.remaining.min(out.len() as u64)) as usize;
        let got = self.file.read(&mut out[..want])?;
        self.remaining -= got as u64;
        Ok(got)
    }
}

/// Open a plain file as a source.
pub fn open_raw_file(path: &Path) -> Result<Box<dyn ByteSource>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    Ok(Box::new(RawFileSource {
        path: path.to_path_buf(),
        file,
        size,
    }))
}

/// Open one archive member as a source, positioned at its payload.
pub fn open_tar_entry(tar_path: &Path, entry: &TarEntry) -> Result<Box<dyn ByteSource>> {
    let mut file = File::open(tar_path)?;
    file.seek(SeekFrom::Start(entry.data_offset))?;
    Ok(Box::new(TarEntrySource {
        tar_path: tar_path.to_path_buf(),
        entry: entry.clone(),
        file,
        remaining: entry.size,
    }))
}
