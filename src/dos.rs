//! DOS header structures and parsing.

use crate::reader::ByteSource;
use crate::struct_reader::{expect_signature, read_record, Record, StructReader};
use crate::Result;

/// DOS "MZ" signature as it appears on disk.
pub const DOS_SIGNATURE: &[u8; 2] = b"MZ";

/// Offset of `e_lfanew` inside the DOS header.
pub const PE_OFFSET_FIELD: usize = 0x3C;

/// DOS Header (IMAGE_DOS_HEADER).
///
/// The first 64 bytes of every PE image. Only the magic and `e_lfanew` matter
/// to the loader; the rest describes the legacy real-mode stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosHeader {
    /// Magic number ("MZ" = 0x5A4D).
    pub e_magic: u16,
    /// Bytes on last page of file.
    pub e_cblp: u16,
    /// Pages in file.
    pub e_cp: u16,
    /// Relocations.
    pub e_crlc: u16,
    /// Size of header in paragraphs.
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    /// File address of relocation table.
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    /// File offset of the PE signature.
    pub e_lfanew: u32,
}

impl DosHeader {
    /// Locate and decode the DOS header at `offset`.
    ///
    /// The magic is checked before the length, so a short non-PE input is
    /// reported as [`crate::Error::NotAPEFile`] rather than as truncated.
    pub fn read_from<S: ByteSource + ?Sized>(source: &S, offset: u64) -> Result<Self> {
        expect_signature(source, offset, DOS_SIGNATURE, "DOS")?;
        read_record(source, offset)
    }

    /// Absolute offset of the PE signature.
    pub fn pe_offset(&self) -> u64 {
        u64::from(self.e_lfanew)
    }
}

impl Record for DosHeader {
    const SIZE: usize = 64;

    fn decode(r: &mut StructReader<'_>) -> Result<Self> {
        let e_magic = r.read_u16()?;
        let e_cblp = r.read_u16()?;
        let e_cp = r.read_u16()?;
        let e_crlc = r.read_u16()?;
        let e_cparhdr = r.read_u16()?;
        let e_minalloc = r.read_u16()?;
        let e_maxalloc = r.read_u16()?;
        let e_ss = r.read_u16()?;
        let e_sp = r.read_u16()?;
        let e_csum = r.read_u16()?;
        let e_ip = r.read_u16()?;
        let e_cs = r.read_u16()?;
        let e_lfarlc = r.read_u16()?;
        let e_ovno = r.read_u16()?;
        let mut e_res = [0u16; 4];
        for word in &mut e_res {
            *word = r.read_u16()?;
        }
        let e_oemid = r.read_u16()?;
        let e_oeminfo = r.read_u16()?;
        let mut e_res2 = [0u16; 10];
        for word in &mut e_res2 {
            *word = r.read_u16()?;
        }
        let e_lfanew = r.read_u32()?;

        Ok(Self {
            e_magic,
            e_cblp,
            e_cp,
            e_crlc,
            e_cparhdr,
            e_minalloc,
            e_maxalloc,
            e_ss,
            e_sp,
            e_csum,
            e_ip,
            e_cs,
            e_lfarlc,
            e_ovno,
            e_res,
            e_oemid,
            e_oeminfo,
            e_res2,
            e_lfanew,
        })
    }
}
