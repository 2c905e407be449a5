//! # petree
//!
//! A read-only structural parser for PE/COFF images (executables, DLLs,
//! drivers).
//!
//! Opening an image decodes the DOS header, PE signature, COFF header, the
//! PE32 or PE32+ optional header, the section table and the resource
//! directory tree in one pass. The result is an immutable model; resource
//! payloads and section data are only read when asked for.
//!
//! ## Features
//!
//! - **Pluggable sources**: open from memory, a memory-mapped file, a plain
//!   file handle, or anything implementing [`ByteSource`].
//! - **Hostile input**: every read is bounds-checked, resource trees are
//!   guarded against cycles and runaway nesting, and section counts are
//!   checked before anything is allocated.
//! - **Scoped ownership**: a [`PEImage`] owns its source and releases it
//!   exactly once, including when opening fails.
//!
//! ## Example
//!
//! ```no_run
//! use petree::{PEImage, ResourceType};
//!
//! let image = PEImage::from_path("example.exe")?;
//! println!("64-bit: {}", image.is_64bit());
//! for section in image.sections() {
//!     println!("{:8} {:#010x}", section.name, section.virtual_address);
//! }
//! if let Some(tree) = image.resource_tree() {
//!     let icons = tree.find_type(ResourceType::Icon).map_or(0, |dir| dir.len());
//!     println!("{icons} icons");
//! }
//! image.close();
//! # Ok::<(), petree::Error>(())
//! ```

pub mod coff;
pub mod data_dir;
pub mod dos;
pub mod error;
pub mod optional;
pub mod options;
pub mod pe;
pub mod reader;
pub mod resource;
pub mod section;
pub mod struct_reader;
pub mod validation;

pub use coff::{CoffHeader, FileCharacteristics, MachineType};
pub use data_dir::{DataDirectory, DataDirectoryKind};
pub use dos::DosHeader;
pub use error::{Error, Result};
pub use optional::{DllCharacteristics, OptionalHeader, OptionalHeader32, OptionalHeader64, Subsystem};
pub use options::ParseOptions;
pub use pe::{PEHeaders, PEImage};
pub use reader::{ByteSource, FileSource, MmapSource, SliceSource, VecSource};
pub use resource::{
    NodeId, ResourceDataEntry, ResourceDirectory, ResourceEntry, ResourceKey, ResourceLeaf,
    ResourceNode, ResourceTree, ResourceType,
};
pub use section::{SectionCharacteristics, SectionHeader, SectionName, SectionTable};
pub use validation::{ValidationCode, ValidationIssue, ValidationLevel, ValidationResult};
