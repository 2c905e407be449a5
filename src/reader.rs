//! Byte sources the parser reads PE data from.
//!
//! A [`ByteSource`] is a random-access, bounds-checked view of the raw image.
//! The parser only ever borrows ranges from it; nothing is written back.

use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use memmap2::Mmap;

use crate::{Error, Result};

/// Trait for random-access byte providers (memory, files, mappings).
///
/// Implementations must return [`Error::OutOfBounds`] for any range that does not
/// lie entirely within `0..len()`. The source is released when it is dropped.
pub trait ByteSource: Send + Sync {
    /// Total number of bytes available.
    fn len(&self) -> u64;

    /// Read `len` bytes starting at `offset`.
    ///
    /// In-memory sources borrow, streaming sources return an owned buffer.
    fn read_range(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>>;

    /// Returns true if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a declared structure, reporting [`Error::TruncatedData`] when it
    /// extends past the end of the source.
    fn read_exact_at(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        let available = self.len();
        match offset.checked_add(len as u64) {
            Some(end) if end <= available => self.read_range(offset, len),
            _ => Err(Error::truncated(offset, len as u64, available)),
        }
    }
}

fn slice_range(data: &[u8], offset: u64, len: usize) -> Result<&[u8]> {
    let start = usize::try_from(offset).map_err(|_| Error::out_of_bounds(offset, len as u64))?;
    let Some(end) = start.checked_add(len) else {
        return Err(Error::out_of_bounds(offset, len as u64));
    };
    data.get(start..end)
        .ok_or(Error::out_of_bounds(offset, len as u64))
}

/// Source over a borrowed byte slice.
#[derive(Debug, Clone, Copy)]
pub struct SliceSource<'a> {
    data: &'a [u8],
}

impl<'a> SliceSource<'a> {
    /// Create a source over a borrowed slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// The underlying bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

impl ByteSource for SliceSource<'_> {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        slice_range(self.data, offset, len).map(Cow::Borrowed)
    }
}

/// Source over an owned byte buffer.
#[derive(Debug, Clone)]
pub struct VecSource {
    data: Vec<u8>,
}

impl VecSource {
    /// Create a source that owns its bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The underlying bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the buffer back.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl ByteSource for VecSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        slice_range(&self.data, offset, len).map(Cow::Borrowed)
    }
}

/// Source that seeks and reads a file on demand.
///
/// The handle sits behind a mutex so the source stays `Sync`.
#[derive(Debug)]
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    /// Open a file by path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file(File::open(path)?)
    }

    /// Wrap an already opened file. Its length is taken once, here.
    pub fn from_file(mut file: File) -> Result<Self> {
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => {}
            _ => return Err(Error::out_of_bounds(offset, len as u64)),
        }

        // A poisoned lock only means another reader panicked mid-read; every
        // read seeks first, so the handle is still usable.
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(Cow::Owned(buf))
    }
}

/// Source backed by a read-only memory mapping.
#[derive(Debug)]
pub struct MmapSource {
    map: Mmap,
}

impl MmapSource {
    /// Open a file by path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        // Mapping is read-only; callers must not truncate the file while it is mapped.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }

    /// The underlying bytes.
    pub fn data(&self) -> &[u8] {
        &self.map
    }
}

impl ByteSource for MmapSource {
    fn len(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_range(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        slice_range(&self.map, offset, len).map(Cow::Borrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_slice_source() {
        let data = [0x4D, 0x5A, 0x90, 0x00];
        let source = SliceSource::new(&data);
        assert_eq!(source.len(), 4);
        assert_eq!(&*source.read_range(0, 2).unwrap(), b"MZ");
        assert!(matches!(source.read_range(0, 2).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_vec_source() {
        let source = VecSource::new(vec![1, 2, 3, 4, 5]);
        assert_eq!(&*source.read_range(1, 3).unwrap(), &[2, 3, 4]);
        assert_eq!(source.into_inner().len(), 5);
    }

    #[test]
    fn test_read_past_end() {
        let data = [0x4D, 0x5A];
        let source = SliceSource::new(&data);
        assert!(matches!(
            source.read_range(0, 4),
            Err(Error::OutOfBounds { offset: 0, len: 4 })
        ));
        assert!(matches!(
            source.read_range(u64::MAX, 2),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            source.read_exact_at(1, 2),
            Err(Error::TruncatedData {
                offset: 1,
                len: 2,
                available: 2
            })
        ));
    }

    #[test]
    fn test_empty_source() {
        let source = VecSource::new(Vec::new());
        assert!(source.is_empty());
        assert_eq!(source.read_range(0, 0).unwrap().len(), 0);
    }

    #[test]
    fn test_file_and_mmap_sources_agree() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"MZ\x90\x00hello").unwrap();
        tmp.flush().unwrap();

        let file = FileSource::open(tmp.path()).unwrap();
        let map = MmapSource::open(tmp.path()).unwrap();
        assert_eq!(file.len(), 9);
        assert_eq!(map.len(), 9);
        assert_eq!(file.read_range(4, 5).unwrap(), map.read_range(4, 5).unwrap());
        assert!(matches!(file.read_range(8, 2), Err(Error::OutOfBounds { .. })));
    }
}
