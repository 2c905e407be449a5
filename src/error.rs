//! Error types for PE image parsing.

use thiserror::Error;

/// Result type alias for petree operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening or navigating a PE image.
///
/// Every decoding step reports the first error it encounters. There is no
/// partially decoded image: [`crate::PEImage::open`] either yields a complete
/// model or one of these.
#[derive(Error, Debug)]
pub enum Error {
    /// A signature check failed. The payload names the signature that did not match.
    #[error("not a PE file: {0} signature mismatch")]
    NotAPEFile(&'static str),

    /// A structure declared by the file extends past the end of the available bytes.
    #[error("truncated data: {len} bytes at offset {offset:#x}, only {available} bytes available")]
    TruncatedData {
        /// Offset where the structure starts.
        offset: u64,
        /// Length of the structure.
        len: u64,
        /// Total length of the source.
        available: u64,
    },

    /// The optional header magic is neither PE32 (0x10B) nor PE32+ (0x20B).
    #[error("unsupported optional header magic {0:#06x}")]
    UnsupportedOptionalHeaderMagic(u16),

    /// The COFF header declares an optional header smaller than its variant requires.
    #[error("inconsistent optional header size: declared {declared}, at least {required} required")]
    InconsistentHeaderSize {
        /// `size_of_optional_header` from the COFF header.
        declared: u16,
        /// Minimum size for the detected variant.
        required: usize,
    },

    /// The section count is implausibly large for the remaining file size.
    #[error("section count {count} cannot fit in the {available} bytes following the optional header")]
    SectionCountOverflow {
        /// `number_of_sections` from the COFF header.
        count: u16,
        /// Bytes available after the optional header.
        available: u64,
    },

    /// A resource directory refers back to a directory on its own descent path.
    #[error("cyclic resource tree: directory at resource offset {offset:#x} is its own ancestor")]
    CyclicResourceTree {
        /// Resource-relative offset of the repeated directory.
        offset: u32,
    },

    /// The resource tree nests deeper than the configured limit.
    #[error("resource tree exceeds the maximum depth of {max_depth}")]
    ResourceTreeTooDeep {
        /// The limit that was exceeded.
        max_depth: usize,
    },

    /// A reference declared as present points outside the image.
    #[error("out of bounds read: {len} bytes at offset {offset:#x}")]
    OutOfBounds {
        /// Offset (or RVA, for unresolved references) that could not be read.
        offset: u64,
        /// Requested length.
        len: u64,
    },

    /// I/O failure from a file-backed source.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn truncated(offset: u64, len: u64, available: u64) -> Self {
        Error::TruncatedData {
            offset,
            len,
            available,
        }
    }

    pub(crate) fn out_of_bounds(offset: u64, len: u64) -> Self {
        Error::OutOfBounds { offset, len }
    }
}
