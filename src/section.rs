//! Section headers and the section table.
//!
//! The section table maps the image's virtual layout onto file offsets. Every
//! RVA the rest of the crate dereferences goes through
//! [`SectionTable::rva_to_file_offset`].

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;

use bitflags::bitflags;
use log::{debug, warn};

use crate::reader::ByteSource;
use crate::struct_reader::{read_records, Record, StructReader};
use crate::{Error, Result};

/// Number of sections the Windows loader accepts.
pub const LOADER_MAX_SECTIONS: usize = 96;

bitflags! {
    /// Section characteristics flags (IMAGE_SCN_*).
    ///
    /// Bits 20..24 hold an alignment value rather than flags; see
    /// [`SectionCharacteristics::alignment`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionCharacteristics: u32 {
        const TYPE_NO_PAD = 0x0000_0008;
        /// Section contains executable code.
        const CODE = 0x0000_0020;
        /// Section contains initialized data.
        const INITIALIZED_DATA = 0x0000_0040;
        /// Section contains uninitialized data.
        const UNINITIALIZED_DATA = 0x0000_0080;
        const LNK_OTHER = 0x0000_0100;
        const LNK_INFO = 0x0000_0200;
        const LNK_REMOVE = 0x0000_0800;
        const LNK_COMDAT = 0x0000_1000;
        const GPREL = 0x0000_8000;
        const LNK_NRELOC_OVFL = 0x0100_0000;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_NOT_CACHED = 0x0400_0000;
        const MEM_NOT_PAGED = 0x0800_0000;
        const MEM_SHARED = 0x1000_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

impl SectionCharacteristics {
    const ALIGN_MASK: u32 = 0x00F0_0000;

    /// Alignment in bytes encoded in the IMAGE_SCN_ALIGN_* field, if any.
    pub fn alignment(&self) -> Option<u32> {
        match (self.bits() & Self::ALIGN_MASK) >> 20 {
            n @ 1..=14 => Some(1 << (n - 1)),
            _ => None,
        }
    }
}

/// The 8-byte section name field.
///
/// Names are opaque bytes, NUL-padded but not necessarily NUL-terminated,
/// and not necessarily unique or valid UTF-8.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectionName([u8; 8]);

impl SectionName {
    /// Wrap a raw 8-byte name field.
    pub fn new(raw: [u8; 8]) -> Self {
        Self(raw)
    }

    /// The name up to the first NUL.
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// The full field, padding included.
    pub fn raw(&self) -> &[u8; 8] {
        &self.0
    }

    /// Best-effort display form.
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionName({:?})", self.to_string_lossy())
    }
}

impl PartialEq<str> for SectionName {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for SectionName {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

/// Section Header (IMAGE_SECTION_HEADER).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: SectionName,
    /// Size of the section once loaded.
    pub virtual_size: u32,
    /// RVA of the section.
    pub virtual_address: u32,
    /// Size of the initialized data on disk.
    pub size_of_raw_data: u32,
    /// File offset of the raw data.
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: SectionCharacteristics,
}

impl SectionHeader {
    /// RVA range the section covers: the larger of its virtual and raw sizes.
    pub fn virtual_range(&self) -> Range<u64> {
        let start = u64::from(self.virtual_address);
        let span = self.virtual_size.max(self.size_of_raw_data);
        start..start + u64::from(span)
    }

    /// File range backing the section.
    pub fn raw_range(&self) -> Range<u64> {
        let start = u64::from(self.pointer_to_raw_data);
        start..start + u64::from(self.size_of_raw_data)
    }

    /// Check if `rva` lies in this section's virtual range.
    pub fn contains_rva(&self, rva: u32) -> bool {
        self.virtual_range().contains(&u64::from(rva))
    }

    /// Check if the section is executable.
    pub fn is_executable(&self) -> bool {
        self.characteristics
            .contains(SectionCharacteristics::MEM_EXECUTE)
    }

    /// Check if the section is readable.
    pub fn is_readable(&self) -> bool {
        self.characteristics.contains(SectionCharacteristics::MEM_READ)
    }

    /// Check if the section is writable.
    pub fn is_writable(&self) -> bool {
        self.characteristics.contains(SectionCharacteristics::MEM_WRITE)
    }
}

impl Record for SectionHeader {
    const SIZE: usize = 40;

    fn decode(r: &mut StructReader<'_>) -> Result<Self> {
        Ok(Self {
            name: SectionName(r.read_array()?),
            virtual_size: r.read_u32()?,
            virtual_address: r.read_u32()?,
            size_of_raw_data: r.read_u32()?,
            pointer_to_raw_data: r.read_u32()?,
            pointer_to_relocations: r.read_u32()?,
            pointer_to_linenumbers: r.read_u32()?,
            number_of_relocations: r.read_u16()?,
            number_of_linenumbers: r.read_u16()?,
            characteristics: SectionCharacteristics::from_bits_retain(r.read_u32()?),
        })
    }
}

/// The ordered section headers of an image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SectionTable {
    sections: Vec<SectionHeader>,
}

impl SectionTable {
    /// Create a table from headers in file order.
    pub fn new(sections: Vec<SectionHeader>) -> Self {
        Self { sections }
    }

    /// Read `count` section headers at `offset`.
    ///
    /// The count is checked against the bytes remaining in the source before
    /// anything is allocated. A count above `max_sections` that does not fit is
    /// reported as [`Error::SectionCountOverflow`]; a plausible count that does
    /// not fit is plain truncation.
    pub fn read_from<S: ByteSource + ?Sized>(
        source: &S,
        offset: u64,
        count: u16,
        max_sections: usize,
    ) -> Result<Self> {
        let available = source.len().saturating_sub(offset);
        let needed = u64::from(count) * SectionHeader::SIZE as u64;
        if needed > available {
            if usize::from(count) > max_sections {
                return Err(Error::SectionCountOverflow { count, available });
            }
            return Err(Error::truncated(offset, needed, source.len()));
        }
        if usize::from(count) > LOADER_MAX_SECTIONS {
            warn!("{count} sections exceeds the loader limit of {LOADER_MAX_SECTIONS}");
        }

        let sections = read_records(source, offset, usize::from(count))?;
        debug!("section table {offset:#x}: {count} sections");
        Ok(Self { sections })
    }

    /// Translate an RVA to a file offset.
    ///
    /// The first section whose range `[va, va + max(virtual_size, raw_size))`
    /// contains the RVA decides the result. If the RVA lands past that section's
    /// raw data (a zero-filled tail) there is no file offset and `None` is
    /// returned.
    pub fn rva_to_file_offset(&self, rva: u32) -> Option<u64> {
        let section = self.section_for_rva(rva)?;
        let delta = rva - section.virtual_address;
        if delta >= section.size_of_raw_data {
            return None;
        }
        Some(u64::from(section.pointer_to_raw_data) + u64::from(delta))
    }

    /// Translate an RVA range, requiring all `len` bytes to lie in the raw
    /// data of the section that contains `rva`.
    pub fn resolve_range(&self, rva: u32, len: u32) -> Option<u64> {
        let offset = self.rva_to_file_offset(rva)?;
        let section = self.section_for_rva(rva)?;
        if offset + u64::from(len) > section.raw_range().end {
            return None;
        }
        Some(offset)
    }

    /// Translate a file offset back to an RVA.
    pub fn file_offset_to_rva(&self, offset: u64) -> Option<u32> {
        self.sections
            .iter()
            .find(|s| s.raw_range().contains(&offset))
            .and_then(|s| {
                let rva = u64::from(s.virtual_address) + (offset - u64::from(s.pointer_to_raw_data));
                u32::try_from(rva).ok()
            })
    }

    /// First section whose RVA range contains `rva`.
    pub fn section_for_rva(&self, rva: u32) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// First section with the given name.
    pub fn by_name(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Section at `index` in file order.
    pub fn get(&self, index: usize) -> Option<&SectionHeader> {
        self.sections.get(index)
    }

    /// Iterate sections in file order.
    pub fn iter(&self) -> std::slice::Iter<'_, SectionHeader> {
        self.sections.iter()
    }

    /// All section headers.
    pub fn as_slice(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// Number of sections.
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Check if the table has no sections.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

impl<'a> IntoIterator for &'a SectionTable {
    type Item = &'a SectionHeader;
    type IntoIter = std::slice::Iter<'a, SectionHeader>;

    fn into_iter(self) -> Self::IntoIter {
        self.sections.iter()
    }
}
