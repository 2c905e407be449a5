//! Header decoding and the [`PEImage`] facade.

use std::borrow::Cow;
use std::path::Path;

use log::debug;

use crate::coff::{verify_pe_signature, CoffHeader};
use crate::data_dir::DataDirectoryKind;
use crate::dos::DosHeader;
use crate::optional::OptionalHeader;
use crate::options::ParseOptions;
use crate::reader::{ByteSource, MmapSource, SliceSource, VecSource};
use crate::resource::{ResourceDataEntry, ResourceTree};
use crate::section::{SectionHeader, SectionTable};
use crate::struct_reader::Record;
use crate::{Error, Result};

/// The decoded headers of an image, without the resource tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PEHeaders {
    pub dos_header: DosHeader,
    pub coff_header: CoffHeader,
    /// Optional header (PE32 or PE32+).
    pub optional_header: OptionalHeader,
    pub sections: SectionTable,
    /// Offset where the PE signature was found.
    pub pe_offset: u64,
}

impl PEHeaders {
    /// Decode DOS header, PE signature, COFF header, optional header and
    /// section table, in that order. The first failure is returned.
    pub fn read_from<S: ByteSource + ?Sized>(source: &S, options: &ParseOptions) -> Result<Self> {
        let dos_header = DosHeader::read_from(source, 0)?;
        let pe_offset = dos_header.pe_offset();
        verify_pe_signature(source, pe_offset)?;

        let coff_offset = pe_offset + 4;
        let coff_header = CoffHeader::read_from(source, coff_offset)?;
        debug!(
            "PE header {:#x}: machine {:?}, {} sections, optional header {} bytes",
            pe_offset,
            coff_header.machine,
            coff_header.number_of_sections,
            coff_header.size_of_optional_header
        );

        let optional_offset = coff_offset + CoffHeader::SIZE as u64;
        let optional_header =
            OptionalHeader::read_from(source, optional_offset, coff_header.size_of_optional_header)?;

        let sections_offset = optional_offset + u64::from(coff_header.size_of_optional_header);
        let sections = SectionTable::read_from(
            source,
            sections_offset,
            coff_header.number_of_sections,
            options.max_sections,
        )?;

        Ok(Self {
            dos_header,
            coff_header,
            optional_header,
            sections,
            pe_offset,
        })
    }

    /// Read headers from a byte slice.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Self::read_from(&SliceSource::new(data), &ParseOptions::default())
    }

    /// Check if this is a PE32+ image.
    pub fn is_64bit(&self) -> bool {
        self.optional_header.is_pe32plus()
    }

    /// Check if this is a DLL.
    pub fn is_dll(&self) -> bool {
        self.coff_header.is_dll()
    }

    /// Entry point RVA.
    pub fn entry_point(&self) -> u32 {
        self.optional_header.address_of_entry_point()
    }

    /// Preferred load address.
    pub fn image_base(&self) -> u64 {
        self.optional_header.image_base()
    }

    /// Translate an RVA through the section table.
    pub fn rva_to_file_offset(&self, rva: u32) -> Option<u64> {
        self.sections.rva_to_file_offset(rva)
    }
}

/// Locate and decode the resource tree, if the image declares one.
fn read_resources<S: ByteSource + ?Sized>(
    source: &S,
    headers: &PEHeaders,
    options: &ParseOptions,
) -> Result<Option<ResourceTree>> {
    let dir = headers
        .optional_header
        .data_directory(DataDirectoryKind::Resource);
    if dir.size == 0 {
        debug!("no resource directory");
        return Ok(None);
    }

    let base = headers
        .sections
        .rva_to_file_offset(dir.virtual_address)
        .ok_or(Error::out_of_bounds(
            u64::from(dir.virtual_address),
            u64::from(dir.size),
        ))?;
    ResourceTree::parse(source, base, options).map(Some)
}

/// An opened PE image.
///
/// Owns its [`ByteSource`] and the model decoded from it. The model is
/// immutable, so a `PEImage` can be shared between threads freely.
///
/// The source is released exactly once: when the image is dropped, when
/// [`PEImage::close`] consumes it, or inside [`PEImage::open`] if decoding
/// fails. [`PEImage::into_source`] hands it back instead.
#[derive(Debug)]
pub struct PEImage<S: ByteSource> {
    source: S,
    headers: PEHeaders,
    resources: Option<ResourceTree>,
}

impl<S: ByteSource> PEImage<S> {
    /// Decode headers, section table and resource tree with default options.
    pub fn open(source: S) -> Result<Self> {
        Self::open_with(source, &ParseOptions::default())
    }

    /// Decode with explicit options. On error `source` has already been dropped.
    pub fn open_with(source: S, options: &ParseOptions) -> Result<Self> {
        let headers = PEHeaders::read_from(&source, options)?;
        let resources = if options.parse_resources {
            read_resources(&source, &headers, options)?
        } else {
            None
        };
        Ok(Self {
            source,
            headers,
            resources,
        })
    }

    /// Release the image and its source.
    pub fn close(self) {
        drop(self);
    }

    /// Give up the model and take the source back.
    pub fn into_source(self) -> S {
        self.source
    }

    /// The byte source the image was decoded from.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// All decoded headers.
    pub fn headers(&self) -> &PEHeaders {
        &self.headers
    }

    /// DOS header.
    pub fn dos_header(&self) -> &DosHeader {
        &self.headers.dos_header
    }

    /// COFF file header.
    pub fn coff_header(&self) -> &CoffHeader {
        &self.headers.coff_header
    }

    /// Optional header (PE32 or PE32+).
    pub fn optional_header(&self) -> &OptionalHeader {
        &self.headers.optional_header
    }

    /// Section headers in file order.
    pub fn sections(&self) -> &SectionTable {
        &self.headers.sections
    }

    /// The resource tree, or `None` if the image has no resource directory
    /// (or it was not requested).
    pub fn resource_tree(&self) -> Option<&ResourceTree> {
        self.resources.as_ref()
    }

    /// Check if this is a PE32+ image.
    pub fn is_64bit(&self) -> bool {
        self.headers.is_64bit()
    }

    /// Check if this is a DLL.
    pub fn is_dll(&self) -> bool {
        self.headers.is_dll()
    }

    /// Entry point RVA.
    pub fn entry_point(&self) -> u32 {
        self.headers.entry_point()
    }

    /// Preferred load address.
    pub fn image_base(&self) -> u64 {
        self.headers.image_base()
    }

    /// Translate an RVA through the section table.
    pub fn rva_to_file_offset(&self, rva: u32) -> Option<u64> {
        self.headers.rva_to_file_offset(rva)
    }

    /// Read `len` bytes at an RVA. The whole range must be backed by one section's raw data.
    pub fn read_at_rva(&self, rva: u32, len: u32) -> Result<Cow<'_, [u8]>> {
        let offset = self
            .headers
            .sections
            .resolve_range(rva, len)
            .ok_or(Error::out_of_bounds(u64::from(rva), u64::from(len)))?;
        self.source.read_range(offset, len as usize)
    }

    /// Payload of a resource leaf.
    pub fn resource_data(&self, entry: &ResourceDataEntry) -> Result<Cow<'_, [u8]>> {
        self.read_at_rva(entry.data_rva, entry.size)
    }

    /// Raw bytes of a section as stored in the file.
    pub fn section_data(&self, section: &SectionHeader) -> Result<Cow<'_, [u8]>> {
        self.source.read_range(
            u64::from(section.pointer_to_raw_data),
            section.size_of_raw_data as usize,
        )
    }
}

impl PEImage<MmapSource> {
    /// Memory-map a file and open it.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(MmapSource::open(path)?)
    }
}

impl<'a> PEImage<SliceSource<'a>> {
    /// Open an image held in memory.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        Self::open(SliceSource::new(data))
    }
}

impl PEImage<VecSource> {
    /// Open an image from an owned buffer.
    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        Self::open(VecSource::new(data))
    }
}
