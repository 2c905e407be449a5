//! Data directory structures.

use strum::{Display, EnumCount, EnumIter, FromRepr};

use crate::struct_reader::{Record, StructReader};
use crate::Result;

/// Well-known data directory slots, indexed by their position in the optional header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr, Display)]
#[repr(usize)]
pub enum DataDirectoryKind {
    /// Export table (.edata)
    Export = 0,
    /// Import table (.idata)
    Import = 1,
    /// Resource table (.rsrc)
    Resource = 2,
    /// Exception table (.pdata)
    Exception = 3,
    /// Certificate table; its "RVA" is a file offset.
    Security = 4,
    /// Base relocation table (.reloc)
    BaseReloc = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    #[strum(serialize = "TLS")]
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    #[strum(serialize = "IAT")]
    Iat = 12,
    DelayImport = 13,
    #[strum(serialize = "CLR")]
    ClrRuntime = 14,
    Reserved = 15,
}

impl DataDirectoryKind {
    /// Slot index in the data directory array.
    pub const fn as_index(self) -> usize {
        self as usize
    }

    /// Kind for a slot index, if it is one of the 16 known slots.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::from_repr(index)
    }
}

/// Number of data directory slots a conventional optional header carries.
pub const NUMBER_OF_DIRECTORY_ENTRIES: usize = DataDirectoryKind::COUNT;

/// Data Directory entry (IMAGE_DATA_DIRECTORY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDirectory {
    /// RVA of the table.
    pub virtual_address: u32,
    /// Size of the table in bytes.
    pub size: u32,
}

impl DataDirectory {
    /// An absent directory.
    pub const ZERO: Self = Self {
        virtual_address: 0,
        size: 0,
    };

    /// Create a new data directory entry.
    pub fn new(virtual_address: u32, size: u32) -> Self {
        Self {
            virtual_address,
            size,
        }
    }

    /// A directory is present unless both fields are zero.
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 || self.size != 0
    }

    /// Exclusive end RVA.
    pub fn end(&self) -> u64 {
        u64::from(self.virtual_address) + u64::from(self.size)
    }
}

impl Record for DataDirectory {
    const SIZE: usize = 8;

    fn decode(r: &mut StructReader<'_>) -> Result<Self> {
        Ok(Self {
            virtual_address: r.read_u32()?,
            size: r.read_u32()?,
        })
    }
}
