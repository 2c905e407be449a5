//! COFF file header structures and parsing.

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::reader::ByteSource;
use crate::struct_reader::{expect_signature, read_record, Record, StructReader};
use crate::Result;

/// PE signature "PE\0\0".
pub const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";

/// Target architecture of the image.
///
/// Codes outside the known set are kept as [`MachineType::Unknown`] so that
/// decoding never fails on an unfamiliar machine field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineType {
    /// Intel 386 or later.
    I386,
    /// x64 (AMD64).
    Amd64,
    /// ARM little endian.
    Arm,
    /// ARM Thumb-2 little endian.
    ArmNt,
    /// ARM64 little endian.
    Arm64,
    /// EFI byte code.
    Ebc,
    /// Intel Itanium.
    Ia64,
    RiscV32,
    RiscV64,
    /// Any other value, including 0 (machine-agnostic).
    Unknown(u16),
}

impl MachineType {
    /// Map a raw machine field. Never fails.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x014C => Self::I386,
            0x8664 => Self::Amd64,
            0x01C0 => Self::Arm,
            0x01C4 => Self::ArmNt,
            0xAA64 => Self::Arm64,
            0x0EBC => Self::Ebc,
            0x0200 => Self::Ia64,
            0x5032 => Self::RiscV32,
            0x5064 => Self::RiscV64,
            other => Self::Unknown(other),
        }
    }

    /// Raw machine field value.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::I386 => 0x014C,
            Self::Amd64 => 0x8664,
            Self::Arm => 0x01C0,
            Self::ArmNt => 0x01C4,
            Self::Arm64 => 0xAA64,
            Self::Ebc => 0x0EBC,
            Self::Ia64 => 0x0200,
            Self::RiscV32 => 0x5032,
            Self::RiscV64 => 0x5064,
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<u16> for MachineType {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

bitflags! {
    /// Characteristics flags of the COFF header (IMAGE_FILE_*).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileCharacteristics: u16 {
        /// Relocation info stripped from file.
        const RELOCS_STRIPPED = 0x0001;
        /// File is executable.
        const EXECUTABLE_IMAGE = 0x0002;
        const LINE_NUMS_STRIPPED = 0x0004;
        const LOCAL_SYMS_STRIPPED = 0x0008;
        const AGGRESSIVE_WS_TRIM = 0x0010;
        /// App can handle >2GB addresses.
        const LARGE_ADDRESS_AWARE = 0x0020;
        const BYTES_REVERSED_LO = 0x0080;
        const MACHINE_32BIT = 0x0100;
        /// Debugging info stripped from file.
        const DEBUG_STRIPPED = 0x0200;
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        const NET_RUN_FROM_SWAP = 0x0800;
        /// File is a system file.
        const SYSTEM = 0x1000;
        /// File is a DLL.
        const DLL = 0x2000;
        const UP_SYSTEM_ONLY = 0x4000;
        const BYTES_REVERSED_HI = 0x8000;
    }
}

/// COFF File Header (IMAGE_FILE_HEADER).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoffHeader {
    /// Target machine type.
    pub machine: MachineType,
    /// Number of entries in the section table.
    pub number_of_sections: u16,
    /// Link time, seconds since the Unix epoch.
    pub time_date_stamp: u32,
    /// File offset of the COFF symbol table, zero for most images.
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    /// Size of the optional header that follows.
    pub size_of_optional_header: u16,
    pub characteristics: FileCharacteristics,
}

impl CoffHeader {
    /// Decode the COFF header located right after the PE signature.
    pub fn read_from<S: ByteSource + ?Sized>(source: &S, offset: u64) -> Result<Self> {
        read_record(source, offset)
    }

    /// Link time as a UTC timestamp.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.time_date_stamp), 0)
    }

    /// Check if the image is a DLL.
    pub fn is_dll(&self) -> bool {
        self.characteristics.contains(FileCharacteristics::DLL)
    }

    /// Check if the image is marked executable.
    pub fn is_executable(&self) -> bool {
        self.characteristics
            .contains(FileCharacteristics::EXECUTABLE_IMAGE)
    }
}

impl Record for CoffHeader {
    const SIZE: usize = 20;

    fn decode(r: &mut StructReader<'_>) -> Result<Self> {
        Ok(Self {
            machine: MachineType::from_u16(r.read_u16()?),
            number_of_sections: r.read_u16()?,
            time_date_stamp: r.read_u32()?,
            pointer_to_symbol_table: r.read_u32()?,
            number_of_symbols: r.read_u32()?,
            size_of_optional_header: r.read_u16()?,
            characteristics: FileCharacteristics::from_bits_retain(r.read_u16()?),
        })
    }
}

/// Verify the PE signature at the given offset.
pub fn verify_pe_signature<S: ByteSource + ?Sized>(source: &S, offset: u64) -> Result<()> {
    expect_signature(source, offset, PE_SIGNATURE, "PE")
}
