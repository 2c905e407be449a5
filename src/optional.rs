//! Optional header structures and parsing.
//!
//! The optional header comes in two layouts selected by its magic. Both are
//! decoded from exactly `size_of_optional_header` bytes as declared by the COFF
//! header; anything past the data directories is kept verbatim in `tail`.

use bitflags::bitflags;
use log::{debug, warn};
use strum::{Display, FromRepr};

use crate::data_dir::{DataDirectory, DataDirectoryKind};
use crate::reader::ByteSource;
use crate::struct_reader::{Record, StructReader};
use crate::{Error, Result};

/// PE32 magic number.
pub const PE32_MAGIC: u16 = 0x10B;
/// PE32+ (64-bit) magic number.
pub const PE32PLUS_MAGIC: u16 = 0x20B;

/// Windows subsystem values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display)]
#[repr(u16)]
pub enum Subsystem {
    Unknown = 0,
    Native = 1,
    WindowsGui = 2,
    WindowsCui = 3,
    Os2Cui = 5,
    PosixCui = 7,
    NativeWindows = 8,
    WindowsCeGui = 9,
    EfiApplication = 10,
    EfiBootServiceDriver = 11,
    EfiRuntimeDriver = 12,
    EfiRom = 13,
    Xbox = 14,
    WindowsBootApplication = 16,
}

impl Subsystem {
    /// Look up a raw subsystem value.
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::from_repr(value)
    }
}

bitflags! {
    /// DLL characteristics flags (IMAGE_DLLCHARACTERISTICS_*).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DllCharacteristics: u16 {
        const HIGH_ENTROPY_VA = 0x0020;
        /// ASLR.
        const DYNAMIC_BASE = 0x0040;
        const FORCE_INTEGRITY = 0x0080;
        /// DEP.
        const NX_COMPAT = 0x0100;
        const NO_ISOLATION = 0x0200;
        const NO_SEH = 0x0400;
        const NO_BIND = 0x0800;
        const APPCONTAINER = 0x1000;
        const WDM_DRIVER = 0x2000;
        const GUARD_CF = 0x4000;
        const TERMINAL_SERVER_AWARE = 0x8000;
    }
}

/// PE32 Optional Header (32-bit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    /// Only present in PE32.
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: DllCharacteristics,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    /// Directory count as written in the file; may exceed `data_directories.len()`.
    pub number_of_rva_and_sizes: u32,
    pub data_directories: Vec<DataDirectory>,
    /// Bytes between the last directory and the declared end of the header.
    pub tail: Vec<u8>,
}

/// PE32+ Optional Header (64-bit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: DllCharacteristics,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directories: Vec<DataDirectory>,
    pub tail: Vec<u8>,
}

/// Combined optional header enum for PE32 and PE32+.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionalHeader {
    Pe32(OptionalHeader32),
    Pe32Plus(OptionalHeader64),
}

/// Decode the directory array and the unparsed tail that follow the fixed fields.
fn decode_directories(
    r: &mut StructReader<'_>,
    number_of_rva_and_sizes: u32,
) -> Result<(Vec<DataDirectory>, Vec<u8>)> {
    let room = r.remaining() / DataDirectory::SIZE;
    let declared = number_of_rva_and_sizes as usize;
    if declared > room {
        warn!(
            "optional header declares {declared} data directories but only has room for {room}"
        );
    }
    let count = declared.min(room);
    let directories = (0..count)
        .map(|_| DataDirectory::decode(r))
        .collect::<Result<Vec<_>>>()?;
    Ok((directories, r.tail().to_vec()))
}

impl OptionalHeader32 {
    /// Size of the fixed fields, without data directories.
    pub const BASE_SIZE: usize = 96;

    /// Decode from exactly the declared optional header bytes.
    pub fn parse(data: &[u8], offset: u64) -> Result<Self> {
        let mut r = StructReader::new(data, offset);
        let magic = r.read_u16()?;
        let major_linker_version = r.read_u8()?;
        let minor_linker_version = r.read_u8()?;
        let size_of_code = r.read_u32()?;
        let size_of_initialized_data = r.read_u32()?;
        let size_of_uninitialized_data = r.read_u32()?;
        let address_of_entry_point = r.read_u32()?;
        let base_of_code = r.read_u32()?;
        let base_of_data = r.read_u32()?;
        let image_base = r.read_u32()?;
        let section_alignment = r.read_u32()?;
        let file_alignment = r.read_u32()?;
        let major_operating_system_version = r.read_u16()?;
        let minor_operating_system_version = r.read_u16()?;
        let major_image_version = r.read_u16()?;
        let minor_image_version = r.read_u16()?;
        let major_subsystem_version = r.read_u16()?;
        let minor_subsystem_version = r.read_u16()?;
        let win32_version_value = r.read_u32()?;
        let size_of_image = r.read_u32()?;
        let size_of_headers = r.read_u32()?;
        let check_sum = r.read_u32()?;
        let subsystem = r.read_u16()?;
        let dll_characteristics = DllCharacteristics::from_bits_retain(r.read_u16()?);
        let size_of_stack_reserve = r.read_u32()?;
        let size_of_stack_commit = r.read_u32()?;
        let size_of_heap_reserve = r.read_u32()?;
        let size_of_heap_commit = r.read_u32()?;
        let loader_flags = r.read_u32()?;
        let number_of_rva_and_sizes = r.read_u32()?;
        let (data_directories, tail) = decode_directories(&mut r, number_of_rva_and_sizes)?;

        Ok(Self {
            magic,
            major_linker_version,
            minor_linker_version,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data,
            address_of_entry_point,
            base_of_code,
            base_of_data,
            image_base,
            section_alignment,
            file_alignment,
            major_operating_system_version,
            minor_operating_system_version,
            major_image_version,
            minor_image_version,
            major_subsystem_version,
            minor_subsystem_version,
            win32_version_value,
            size_of_image,
            size_of_headers,
            check_sum,
            subsystem,
            dll_characteristics,
            size_of_stack_reserve,
            size_of_stack_commit,
            size_of_heap_reserve,
            size_of_heap_commit,
            loader_flags,
            number_of_rva_and_sizes,
            data_directories,
            tail,
        })
    }
}

impl OptionalHeader64 {
    /// Size of the fixed fields, without data directories.
    pub const BASE_SIZE: usize = 112;

    /// Decode from exactly the declared optional header bytes.
    pub fn parse(data: &[u8], offset: u64) -> Result<Self> {
        let mut r = StructReader::new(data, offset);
        let magic = r.read_u16()?;
        let major_linker_version = r.read_u8()?;
        let minor_linker_version = r.read_u8()?;
        let size_of_code = r.read_u32()?;
        let size_of_initialized_data = r.read_u32()?;
        let size_of_uninitialized_data = r.read_u32()?;
        let address_of_entry_point = r.read_u32()?;
        let base_of_code = r.read_u32()?;
        let image_base = r.read_u64()?;
        let section_alignment = r.read_u32()?;
        let file_alignment = r.read_u32()?;
        let major_operating_system_version = r.read_u16()?;
        let minor_operating_system_version = r.read_u16()?;
        let major_image_version = r.read_u16()?;
        let minor_image_version = r.read_u16()?;
        let major_subsystem_version = r.read_u16()?;
        let minor_subsystem_version = r.read_u16()?;
        let win32_version_value = r.read_u32()?;
        let size_of_image = r.read_u32()?;
        let size_of_headers = r.read_u32()?;
        let check_sum = r.read_u32()?;
        let subsystem = r.read_u16()?;
        let dll_characteristics = DllCharacteristics::from_bits_retain(r.read_u16()?);
        let size_of_stack_reserve = r.read_u64()?;
        let size_of_stack_commit = r.read_u64()?;
        let size_of_heap_reserve = r.read_u64()?;
        let size_of_heap_commit = r.read_u64()?;
        let loader_flags = r.read_u32()?;
        let number_of_rva_and_sizes = r.read_u32()?;
        let (data_directories, tail) = decode_directories(&mut r, number_of_rva_and_sizes)?;

        Ok(Self {
            magic,
            major_linker_version,
            minor_linker_version,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data,
            address_of_entry_point,
            base_of_code,
            image_base,
            section_alignment,
            file_alignment,
            major_operating_system_version,
            minor_operating_system_version,
            major_image_version,
            minor_image_version,
            major_subsystem_version,
            minor_subsystem_version,
            win32_version_value,
            size_of_image,
            size_of_headers,
            check_sum,
            subsystem,
            dll_characteristics,
            size_of_stack_reserve,
            size_of_stack_commit,
            size_of_heap_reserve,
            size_of_heap_commit,
            loader_flags,
            number_of_rva_and_sizes,
            data_directories,
            tail,
        })
    }
}

impl OptionalHeader {
    /// Read the optional header at `offset`, `declared_size` bytes long.
    ///
    /// The magic is read first to pick the layout, then exactly `declared_size`
    /// bytes are fetched. Nothing beyond that boundary is touched.
    pub fn read_from<S: ByteSource + ?Sized>(
        source: &S,
        offset: u64,
        declared_size: u16,
    ) -> Result<Self> {
        let declared = usize::from(declared_size);
        if declared < 2 {
            return Err(Error::InconsistentHeaderSize {
                declared: declared_size,
                required: 2,
            });
        }

        let magic_bytes = source.read_exact_at(offset, 2)?;
        let magic = StructReader::new(&magic_bytes, offset).read_u16()?;
        let required = match magic {
            PE32_MAGIC => OptionalHeader32::BASE_SIZE,
            PE32PLUS_MAGIC => OptionalHeader64::BASE_SIZE,
            _ => return Err(Error::UnsupportedOptionalHeaderMagic(magic)),
        };
        if declared < required {
            return Err(Error::InconsistentHeaderSize {
                declared: declared_size,
                required,
            });
        }

        let data = source.read_exact_at(offset, declared)?;
        let header = match magic {
            PE32_MAGIC => Self::Pe32(OptionalHeader32::parse(&data, offset)?),
            _ => Self::Pe32Plus(OptionalHeader64::parse(&data, offset)?),
        };
        debug!(
            "optional header {:#x}: {} with {} data directories, {} tail bytes",
            offset,
            if header.is_pe32plus() { "PE32+" } else { "PE32" },
            header.data_directories().len(),
            header.tail().len()
        );
        Ok(header)
    }

    /// Optional header magic (0x10B or 0x20B).
    pub fn magic(&self) -> u16 {
        match self {
            Self::Pe32(h) => h.magic,
            Self::Pe32Plus(h) => h.magic,
        }
    }

    /// Check if this is a PE32 header.
    pub fn is_pe32(&self) -> bool {
        matches!(self, Self::Pe32(_))
    }

    /// Check if this is a PE32+ header.
    pub fn is_pe32plus(&self) -> bool {
        matches!(self, Self::Pe32Plus(_))
    }

    /// Decoded data directories, at most `number_of_rva_and_sizes`.
    pub fn data_directories(&self) -> &[DataDirectory] {
        match self {
            Self::Pe32(h) => &h.data_directories,
            Self::Pe32Plus(h) => &h.data_directories,
        }
    }

    /// Look up a well-known directory. Slots the header does not carry read as absent.
    pub fn data_directory(&self, kind: DataDirectoryKind) -> DataDirectory {
        self.data_directories()
            .get(kind.as_index())
            .copied()
            .unwrap_or(DataDirectory::ZERO)
    }

    /// Declared bytes after the data directories.
    pub fn tail(&self) -> &[u8] {
        match self {
            Self::Pe32(h) => &h.tail,
            Self::Pe32Plus(h) => &h.tail,
        }
    }

    /// Get the entry point RVA.
    pub fn address_of_entry_point(&self) -> u32 {
        match self {
            Self::Pe32(h) => h.address_of_entry_point,
            Self::Pe32Plus(h) => h.address_of_entry_point,
        }
    }

    /// Get the preferred load address.
    pub fn image_base(&self) -> u64 {
        match self {
            Self::Pe32(h) => u64::from(h.image_base),
            Self::Pe32Plus(h) => h.image_base,
        }
    }

    /// Section alignment in memory.
    pub fn section_alignment(&self) -> u32 {
        match self {
            Self::Pe32(h) => h.section_alignment,
            Self::Pe32Plus(h) => h.section_alignment,
        }
    }

    /// Alignment of raw section data in the file.
    pub fn file_alignment(&self) -> u32 {
        match self {
            Self::Pe32(h) => h.file_alignment,
            Self::Pe32Plus(h) => h.file_alignment,
        }
    }

    /// Size of the image in memory.
    pub fn size_of_image(&self) -> u32 {
        match self {
            Self::Pe32(h) => h.size_of_image,
            Self::Pe32Plus(h) => h.size_of_image,
        }
    }

    /// Combined size of all headers, rounded to the file alignment.
    pub fn size_of_headers(&self) -> u32 {
        match self {
            Self::Pe32(h) => h.size_of_headers,
            Self::Pe32Plus(h) => h.size_of_headers,
        }
    }

    /// Raw subsystem field.
    pub fn subsystem_raw(&self) -> u16 {
        match self {
            Self::Pe32(h) => h.subsystem,
            Self::Pe32Plus(h) => h.subsystem,
        }
    }

    /// Subsystem, if the value is a known one.
    pub fn subsystem(&self) -> Option<Subsystem> {
        Subsystem::from_u16(self.subsystem_raw())
    }

    /// DLL characteristics flags.
    pub fn dll_characteristics(&self) -> DllCharacteristics {
        match self {
            Self::Pe32(h) => h.dll_characteristics,
            Self::Pe32Plus(h) => h.dll_characteristics,
        }
    }
}
