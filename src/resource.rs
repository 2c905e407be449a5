//! Resource directory tree.
//!
//! On disk the resource directory is a flat table of directories, entries and
//! data descriptors that point at each other through offsets relative to the
//! start of the resource directory. [`ResourceTree::parse`] turns that into an
//! arena of [`ResourceNode`]s addressed by [`NodeId`].
//!
//! The walk is defensive: an offset that reappears on the current descent path
//! is [`Error::CyclicResourceTree`], nesting beyond
//! [`ParseOptions::max_resource_depth`] is [`Error::ResourceTreeTooDeep`], and a
//! directory or leaf referenced from several places is decoded once and shared.
//!
//! # Examples
//!
//! ```no_run
//! use petree::{PEImage, ResourceKey, ResourceType};
//!
//! let image = PEImage::from_path("example.exe")?;
//! if let Some(tree) = image.resource_tree() {
//!     print!("{tree}");
//!     for leaf in tree.leaves() {
//!         let bytes = image.resource_data(leaf.data)?;
//!         println!("{} -> {} bytes", leaf.path_string(), bytes.len());
//!     }
//!     let manifest = tree.find(&[ResourceType::Manifest.into(), 1u32.into()]);
//!     println!("manifest present: {}", manifest.is_some());
//! }
//! # Ok::<(), petree::Error>(())
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use strum::{Display, FromRepr, IntoStaticStr};
use widestring::{U16Str, U16String};

use crate::options::ParseOptions;
use crate::reader::ByteSource;
use crate::struct_reader::{read_record, read_records, Record, StructReader};
use crate::{Error, Result};

/// Flag bit on both halves of a directory entry.
const HIGH_BIT: u32 = 0x8000_0000;

/// Standard resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display, IntoStaticStr)]
#[repr(u16)]
pub enum ResourceType {
    #[strum(serialize = "CURSOR")]
    Cursor = 1,
    #[strum(serialize = "BITMAP")]
    Bitmap = 2,
    #[strum(serialize = "ICON")]
    Icon = 3,
    #[strum(serialize = "MENU")]
    Menu = 4,
    #[strum(serialize = "DIALOG")]
    Dialog = 5,
    #[strum(serialize = "STRING")]
    String = 6,
    #[strum(serialize = "FONTDIR")]
    FontDir = 7,
    #[strum(serialize = "FONT")]
    Font = 8,
    #[strum(serialize = "ACCELERATOR")]
    Accelerator = 9,
    #[strum(serialize = "RCDATA")]
    RcData = 10,
    #[strum(serialize = "MESSAGETABLE")]
    MessageTable = 11,
    #[strum(serialize = "GROUP_CURSOR")]
    GroupCursor = 12,
    #[strum(serialize = "GROUP_ICON")]
    GroupIcon = 14,
    #[strum(serialize = "VERSION")]
    Version = 16,
    #[strum(serialize = "DLGINCLUDE")]
    DlgInclude = 17,
    #[strum(serialize = "PLUGPLAY")]
    PlugPlay = 19,
    #[strum(serialize = "VXD")]
    Vxd = 20,
    #[strum(serialize = "ANICURSOR")]
    AniCursor = 21,
    #[strum(serialize = "ANIICON")]
    AniIcon = 22,
    #[strum(serialize = "HTML")]
    Html = 23,
    #[strum(serialize = "MANIFEST")]
    Manifest = 24,
}

impl ResourceType {
    /// Look up a standard type by ID.
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::from_repr(value)
    }

    /// Numeric RT_* value.
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Conventional upper-case name, e.g. `GROUP_ICON`.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Key of a directory entry: a length-prefixed UTF-16 name or a numeric ID.
///
/// The derived ordering puts every name before every ID, compares names by
/// UTF-16 code unit (case-sensitive) and IDs numerically, which is the order
/// the format expects entries to be stored in.
///
/// Entries that point at the same name string share one decoded copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    Name(Arc<U16String>),
    Id(u32),
}

impl ResourceKey {
    /// Name key from a Rust string.
    pub fn name(name: &str) -> Self {
        Self::Name(Arc::new(U16String::from_str(name)))
    }

    /// Check if this is a name key.
    pub fn is_name(&self) -> bool {
        matches!(self, Self::Name(_))
    }

    /// The UTF-16 name, if this is a name key.
    pub fn as_name(&self) -> Option<&U16Str> {
        match self {
            Self::Name(name) => Some(name.as_ustr()),
            Self::Id(_) => None,
        }
    }

    /// The numeric ID, if this is an ID key.
    pub fn as_id(&self) -> Option<u32> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Name(_) => None,
        }
    }

    /// True if this is a name key equal to `name`.
    pub fn matches_name(&self, name: &str) -> bool {
        match self {
            Self::Name(own) => own.as_slice().iter().copied().eq(name.encode_utf16()),
            Self::Id(_) => false,
        }
    }

    /// Standard resource type this key denotes at the first level.
    pub fn resource_type(&self) -> Option<ResourceType> {
        self.as_id()
            .and_then(|id| u16::try_from(id).ok())
            .and_then(ResourceType::from_u16)
    }
}

impl From<&str> for ResourceKey {
    fn from(name: &str) -> Self {
        Self::name(name)
    }
}

impl From<u32> for ResourceKey {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

impl From<u16> for ResourceKey {
    fn from(id: u16) -> Self {
        Self::Id(u32::from(id))
    }
}

impl From<ResourceType> for ResourceKey {
    fn from(rt: ResourceType) -> Self {
        Self::Id(u32::from(rt.id()))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{}", name.to_string_lossy()),
            Self::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// IMAGE_RESOURCE_DIRECTORY - 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDirectoryHeader {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub number_of_named_entries: u16,
    pub number_of_id_entries: u16,
}

impl ResourceDirectoryHeader {
    /// Named plus ID entry count.
    pub fn total_entries(&self) -> usize {
        usize::from(self.number_of_named_entries) + usize::from(self.number_of_id_entries)
    }
}

impl Record for ResourceDirectoryHeader {
    const SIZE: usize = 16;

    fn decode(r: &mut StructReader<'_>) -> Result<Self> {
        Ok(Self {
            characteristics: r.read_u32()?,
            time_date_stamp: r.read_u32()?,
            major_version: r.read_u16()?,
            minor_version: r.read_u16()?,
            number_of_named_entries: r.read_u16()?,
            number_of_id_entries: r.read_u16()?,
        })
    }
}

/// IMAGE_RESOURCE_DIRECTORY_ENTRY - 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDirectoryEntry {
    /// Name offset (high bit set) or ID.
    pub name_or_id: u32,
    /// Offset to a subdirectory (high bit set) or a data entry.
    pub offset_to_data: u32,
}

impl ResourceDirectoryEntry {
    /// Check if the first field is a name offset.
    pub fn is_named(&self) -> bool {
        self.name_or_id & HIGH_BIT != 0
    }

    /// Resource-relative offset of the name string. Only meaningful if `is_named()`.
    pub fn name_offset(&self) -> u32 {
        self.name_or_id & !HIGH_BIT
    }

    /// Check if the entry points at a subdirectory.
    pub fn is_directory(&self) -> bool {
        self.offset_to_data & HIGH_BIT != 0
    }

    /// Resource-relative offset of the subdirectory or data entry.
    pub fn target_offset(&self) -> u32 {
        self.offset_to_data & !HIGH_BIT
    }
}

impl Record for ResourceDirectoryEntry {
    const SIZE: usize = 8;

    fn decode(r: &mut StructReader<'_>) -> Result<Self> {
        Ok(Self {
            name_or_id: r.read_u32()?,
            offset_to_data: r.read_u32()?,
        })
    }
}

/// IMAGE_RESOURCE_DATA_ENTRY - 16 bytes
///
/// A leaf. It locates the payload by RVA; the bytes themselves are read on
/// demand through [`crate::PEImage::resource_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDataEntry {
    /// RVA of the payload. Unlike the directory offsets this is a real RVA.
    pub data_rva: u32,
    pub size: u32,
    pub code_page: u32,
    pub reserved: u32,
}

impl Record for ResourceDataEntry {
    const SIZE: usize = 16;

    fn decode(r: &mut StructReader<'_>) -> Result<Self> {
        Ok(Self {
            data_rva: r.read_u32()?,
            size: r.read_u32()?,
            code_page: r.read_u32()?,
            reserved: r.read_u32()?,
        })
    }
}

impl fmt::Display for ResourceDataEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[rva={:#x}, size={}, code_page={}]",
            self.data_rva, self.size, self.code_page
        )
    }
}

/// Index of a node in a [`ResourceTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Position in the tree's node arena.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A child of a resource directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceNode {
    Directory(ResourceDirectory),
    Data(ResourceDataEntry),
}

impl ResourceNode {
    /// The directory, if this node is one.
    pub fn as_directory(&self) -> Option<&ResourceDirectory> {
        match self {
            Self::Directory(dir) => Some(dir),
            Self::Data(_) => None,
        }
    }

    /// The leaf descriptor, if this node is one.
    pub fn as_data(&self) -> Option<&ResourceDataEntry> {
        match self {
            Self::Data(data) => Some(data),
            Self::Directory(_) => None,
        }
    }

    /// Check if the entry points at a subdirectory.
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }
}

/// A directory entry: its key and the node it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub key: ResourceKey,
    pub node: NodeId,
}

/// A decoded resource directory.
///
/// Named entries and ID entries are kept apart, each in file order. Nothing is
/// re-sorted; [`ResourceDirectory::is_sorted`] reports whether the file got the
/// order right.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub named_entries: Vec<ResourceEntry>,
    pub id_entries: Vec<ResourceEntry>,
}

impl ResourceDirectory {
    /// Named entries, then ID entries.
    pub fn entries(&self) -> impl Iterator<Item = &ResourceEntry> {
        self.named_entries.iter().chain(self.id_entries.iter())
    }

    /// Entry at `index` in [`ResourceDirectory::entries`] order.
    pub fn entry(&self, index: usize) -> Option<&ResourceEntry> {
        match index.checked_sub(self.named_entries.len()) {
            None => self.named_entries.get(index),
            Some(id_index) => self.id_entries.get(id_index),
        }
    }

    /// Find an entry by key. Scans, so unsorted directories still resolve.
    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceEntry> {
        let candidates = if key.is_name() {
            &self.named_entries
        } else {
            &self.id_entries
        };
        candidates.iter().find(|entry| &entry.key == key)
    }

    /// Find a named entry by a Rust string.
    pub fn get_name(&self, name: &str) -> Option<&ResourceEntry> {
        self.named_entries
            .iter()
            .find(|entry| entry.key.matches_name(name))
    }

    /// Find an ID entry.
    pub fn get_id(&self, id: u32) -> Option<&ResourceEntry> {
        self.get(&ResourceKey::Id(id))
    }

    /// Number of entries, named and ID.
    pub fn len(&self) -> usize {
        self.named_entries.len() + self.id_entries.len()
    }

    /// Check if the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether names ascend (UTF-16, case-sensitive) and IDs ascend.
    pub fn is_sorted(&self) -> bool {
        let ascending = |entries: &[ResourceEntry]| entries.windows(2).all(|w| w[0].key <= w[1].key);
        ascending(self.named_entries.as_slice()) && ascending(self.id_entries.as_slice())
    }
}

/// A leaf reached from the root, with the keys along the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLeaf<'a> {
    pub path: Vec<&'a ResourceKey>,
    pub data: &'a ResourceDataEntry,
}

impl ResourceLeaf<'_> {
    /// First-level key resolved to a standard type, if it is one.
    pub fn resource_type(&self) -> Option<ResourceType> {
        self.path.first().and_then(|key| key.resource_type())
    }

    /// Keys joined with `/`.
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(|key| key.to_string())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// The resource directory of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTree {
    root: ResourceDirectory,
    nodes: Vec<ResourceNode>,
    base_offset: u64,
}

impl ResourceTree {
    /// Decode the tree whose root directory starts at file offset `base_offset`.
    pub fn parse<S: ByteSource + ?Sized>(
        source: &S,
        base_offset: u64,
        options: &ParseOptions,
    ) -> Result<Self> {
        let mut builder = TreeBuilder {
            source,
            base: base_offset,
            max_depth: options.max_resource_depth,
            nodes: Vec::new(),
            directories: HashMap::new(),
            leaves: HashMap::new(),
            names: HashMap::new(),
            name_bytes: 0,
            path: Vec::new(),
        };
        let (root, height) = builder.directory(0, 1)?;
        debug!(
            "resource tree {:#x}: {} top-level entries, {} nodes, depth {}",
            base_offset,
            root.len(),
            builder.nodes.len(),
            height
        );
        Ok(Self {
            root,
            nodes: builder.nodes,
            base_offset,
        })
    }

    /// Top-level (type) directory.
    pub fn root(&self) -> &ResourceDirectory {
        &self.root
    }

    /// File offset the resource-relative offsets are based on.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Node behind an id handed out by this tree.
    pub fn get(&self, id: NodeId) -> Option<&ResourceNode> {
        self.nodes.get(id.0)
    }

    /// Number of decoded nodes below the root. Shared subtrees count once.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Follow `path` from the root, one key per level.
    ///
    /// Returns `None` for an empty path or when any key is missing.
    pub fn find(&self, path: &[ResourceKey]) -> Option<&ResourceNode> {
        let (last, parents) = path.split_last()?;
        let mut dir = &self.root;
        for key in parents {
            dir = self.get(dir.get(key)?.node)?.as_directory()?;
        }
        self.get(dir.get(last)?.node)
    }

    /// Second-level directory for a standard resource type.
    pub fn find_type(&self, rt: ResourceType) -> Option<&ResourceDirectory> {
        self.find(&[rt.into()])?.as_directory()
    }

    /// Every directory, root first. Shared directories are visited once.
    pub fn directories(&self) -> impl Iterator<Item = &ResourceDirectory> {
        std::iter::once(&self.root).chain(self.nodes.iter().filter_map(ResourceNode::as_directory))
    }

    /// Whether every directory stores its entries in format order.
    pub fn is_sorted(&self) -> bool {
        self.directories().all(ResourceDirectory::is_sorted)
    }

    /// Depth-first walk over the leaves, in entry order.
    ///
    /// A directory reached from several parents is expanded once, under the
    /// first path that reaches it, so the walk is linear in the number of
    /// entries.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            tree: self,
            stack: vec![(&self.root, 0)],
            path: Vec::new(),
            expanded: HashSet::new(),
        }
    }

    fn fmt_directory(
        &self,
        f: &mut fmt::Formatter<'_>,
        dir: &ResourceDirectory,
        indent: usize,
        expanded: &mut HashSet<NodeId>,
    ) -> fmt::Result {
        for entry in dir.entries() {
            write!(f, "{:width$}", "", width = indent * 2)?;
            match &entry.key {
                ResourceKey::Name(name) => write!(f, "Name: {}", name.to_string_lossy())?,
                ResourceKey::Id(id) => write!(f, "ID: {id}")?,
            }
            match self.get(entry.node) {
                Some(ResourceNode::Data(data)) => writeln!(f, " {data}")?,
                Some(ResourceNode::Directory(child)) => {
                    if !expanded.insert(entry.node) {
                        writeln!(f, " (shared)")?;
                        continue;
                    }
                    writeln!(f)?;
                    self.fmt_directory(f, child, indent + 1, expanded)?;
                }
                None => writeln!(f)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for ResourceTree {
    /// One line per entry, two spaces of indentation per level. A shared
    /// directory is listed in full once and marked `(shared)` after that.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_directory(f, &self.root, 0, &mut HashSet::new())
    }
}

/// Iterator returned by [`ResourceTree::leaves`].
pub struct Leaves<'a> {
    tree: &'a ResourceTree,
    stack: Vec<(&'a ResourceDirectory, usize)>,
    path: Vec<&'a ResourceKey>,
    /// Directories already pushed onto `stack`.
    expanded: HashSet<NodeId>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = ResourceLeaf<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            let (dir, index) = *frame;
            frame.1 += 1;

            let Some(entry) = dir.entry(index) else {
                // The root frame has no key, so this pop is a no-op for it.
                self.stack.pop();
                self.path.pop();
                continue;
            };
            match self.tree.get(entry.node) {
                Some(ResourceNode::Directory(child)) => {
                    if self.expanded.insert(entry.node) {
                        self.path.push(&entry.key);
                        self.stack.push((child, 0));
                    }
                }
                Some(ResourceNode::Data(data)) => {
                    let mut path = self.path.clone();
                    path.push(&entry.key);
                    return Some(ResourceLeaf { path, data });
                }
                None => {}
            }
        }
    }
}

/// State of one [`ResourceTree::parse`] call.
struct TreeBuilder<'s, S: ?Sized> {
    source: &'s S,
    base: u64,
    max_depth: usize,
    nodes: Vec<ResourceNode>,
    /// Finished directories by offset, with the height of their subtree.
    directories: HashMap<u32, (NodeId, usize)>,
    leaves: HashMap<u32, NodeId>,
    names: HashMap<u32, Arc<U16String>>,
    /// Bytes of distinct name strings decoded so far.
    name_bytes: u64,
    /// Offsets of the directories currently being decoded, root first.
    path: Vec<u32>,
}

impl<S: ByteSource + ?Sized> TreeBuilder<'_, S> {
    fn push(&mut self, node: ResourceNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    fn too_deep(&self) -> Error {
        Error::ResourceTreeTooDeep {
            max_depth: self.max_depth,
        }
    }

    /// Decode the directory at `offset`, found at `depth` (root = 1).
    /// Returns it together with the height of its subtree in directories.
    fn directory(&mut self, offset: u32, depth: usize) -> Result<(ResourceDirectory, usize)> {
        if self.path.contains(&offset) {
            return Err(Error::CyclicResourceTree { offset });
        }
        if depth > self.max_depth {
            return Err(self.too_deep());
        }
        trace!("resource directory {offset:#x} at depth {depth}");

        let at = self.base + u64::from(offset);
        let header: ResourceDirectoryHeader = read_record(self.source, at)?;
        let raw: Vec<ResourceDirectoryEntry> = read_records(
            self.source,
            at + ResourceDirectoryHeader::SIZE as u64,
            header.total_entries(),
        )?;

        self.path.push(offset);
        let children = self.entries(offset, &header, &raw, depth);
        self.path.pop();
        let (named_entries, id_entries, child_height) = children?;

        let dir = ResourceDirectory {
            characteristics: header.characteristics,
            time_date_stamp: header.time_date_stamp,
            major_version: header.major_version,
            minor_version: header.minor_version,
            named_entries,
            id_entries,
        };
        Ok((dir, child_height + 1))
    }

    fn entries(
        &mut self,
        offset: u32,
        header: &ResourceDirectoryHeader,
        raw: &[ResourceDirectoryEntry],
        depth: usize,
    ) -> Result<(Vec<ResourceEntry>, Vec<ResourceEntry>, usize)> {
        let mut named = Vec::new();
        let mut ids = Vec::new();
        let mut height = 0;

        for (index, entry) in raw.iter().enumerate() {
            let in_named_block = index < usize::from(header.number_of_named_entries);
            if entry.is_named() != in_named_block {
                warn!(
                    "resource directory {offset:#x}: entry {index} name flag disagrees with the header's named count"
                );
            }

            let key = if entry.is_named() {
                ResourceKey::Name(self.name(entry.name_offset())?)
            } else {
                ResourceKey::Id(entry.name_or_id)
            };

            let node = if entry.is_directory() {
                let (node, h) = self.subdirectory(entry.target_offset(), depth + 1)?;
                height = height.max(h);
                node
            } else {
                self.leaf(entry.target_offset())?
            };

            if key.is_name() {
                named.push(ResourceEntry { key, node });
            } else {
                ids.push(ResourceEntry { key, node });
            }
        }
        Ok((named, ids, height))
    }

    fn subdirectory(&mut self, offset: u32, depth: usize) -> Result<(NodeId, usize)> {
        // Only finished directories are memoized, so a hit is never on the active path.
        if let Some(&(node, height)) = self.directories.get(&offset) {
            // Shared subtree: it must still fit below this deeper parent.
            if depth + height - 1 > self.max_depth {
                return Err(self.too_deep());
            }
            return Ok((node, height));
        }

        let (dir, height) = self.directory(offset, depth)?;
        let node = self.push(ResourceNode::Directory(dir));
        self.directories.insert(offset, (node, height));
        Ok((node, height))
    }

    fn leaf(&mut self, offset: u32) -> Result<NodeId> {
        if let Some(&node) = self.leaves.get(&offset) {
            return Ok(node);
        }
        let data: ResourceDataEntry = read_record(self.source, self.base + u64::from(offset))?;
        let node = self.push(ResourceNode::Data(data));
        self.leaves.insert(offset, node);
        Ok(node)
    }

    /// Read a length-prefixed UTF-16LE string, once per offset.
    ///
    /// Distinct names in a well-formed file occupy distinct bytes, so their
    /// total size never exceeds the source. Overlapping name strings that would
    /// push past that are rejected as out of bounds.
    fn name(&mut self, offset: u32) -> Result<Arc<U16String>> {
        if let Some(name) = self.names.get(&offset) {
            return Ok(Arc::clone(name));
        }

        let at = self.base + u64::from(offset);
        let prefix = self.source.read_exact_at(at, 2)?;
        let len = usize::from(StructReader::new(&prefix, at).read_u16()?);
        let bytes = self.source.read_exact_at(at + 2, len * 2)?;
        let size = 2 + len as u64 * 2;
        if self.name_bytes + size > self.source.len() {
            return Err(Error::out_of_bounds(at, size));
        }
        self.name_bytes += size;

        let mut r = StructReader::new(&bytes, at + 2);
        let units = (0..len).map(|_| r.read_u16()).collect::<Result<Vec<u16>>>()?;
        let name = Arc::new(U16String::from_vec(units));
        self.names.insert(offset, Arc::clone(&name));
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::SliceSource;

    const DIR: u32 = HIGH_BIT;

    /// Write a directory at `at` with the given (name_or_id, offset_to_data) entries.
    fn put_dir(buf: &mut Vec<u8>, at: usize, named: u16, entries: &[(u32, u32)]) {
        let end = at + 16 + entries.len() * 8;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[at + 12..at + 14].copy_from_slice(&named.to_le_bytes());
        let ids = entries.len() as u16 - named;
        buf[at + 14..at + 16].copy_from_slice(&ids.to_le_bytes());
        for (i, (name, target)) in entries.iter().enumerate() {
            let e = at + 16 + i * 8;
            buf[e..e + 4].copy_from_slice(&name.to_le_bytes());
            buf[e + 4..e + 8].copy_from_slice(&target.to_le_bytes());
        }
    }

    fn put_leaf(buf: &mut Vec<u8>, at: usize, rva: u32, size: u32) {
        if buf.len() < at + 16 {
            buf.resize(at + 16, 0);
        }
        buf[at..at + 4].copy_from_slice(&rva.to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
        buf[at + 8..at + 12].copy_from_slice(&1252u32.to_le_bytes());
    }

    fn put_name(buf: &mut Vec<u8>, at: usize, name: &str) {
        let units: Vec<u16> = name.encode_utf16().collect();
        let end = at + 2 + units.len() * 2;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[at..at + 2].copy_from_slice(&(units.len() as u16).to_le_bytes());
        for (i, unit) in units.iter().enumerate() {
            buf[at + 2 + i * 2..at + 4 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    fn parse(buf: &[u8]) -> Result<ResourceTree> {
        ResourceTree::parse(&SliceSource::new(buf), 0, &ParseOptions::default())
    }

    /// type "ICON" and type 7, each with one name-level and one language-level entry.
    fn sample() -> Vec<u8> {
        let mut buf = Vec::new();
        put_dir(&mut buf, 0x00, 1, &[(HIGH_BIT | 0x200, DIR | 0x30), (7, DIR | 0x60)]);
        put_dir(&mut buf, 0x30, 0, &[(1, DIR | 0x90)]);
        put_dir(&mut buf, 0x60, 0, &[(2, DIR | 0xC0)]);
        put_dir(&mut buf, 0x90, 0, &[(0x409, 0x100)]);
        put_dir(&mut buf, 0xC0, 0, &[(0x409, 0x110)]);
        put_leaf(&mut buf, 0x100, 0x5000, 0x40);
        put_leaf(&mut buf, 0x110, 0x5040, 0x10);
        put_name(&mut buf, 0x200, "ICON");
        buf
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(ResourceDirectoryHeader::SIZE, 16);
        assert_eq!(ResourceDirectoryEntry::SIZE, 8);
        assert_eq!(ResourceDataEntry::SIZE, 16);
    }

    #[test]
    fn test_entry_flags() {
        let entry = ResourceDirectoryEntry {
            name_or_id: 0x8000_0100,
            offset_to_data: 0x8000_0020,
        };
        assert!(entry.is_named());
        assert_eq!(entry.name_offset(), 0x100);
        assert!(entry.is_directory());
        assert_eq!(entry.target_offset(), 0x20);

        let entry = ResourceDirectoryEntry {
            name_or_id: 3,
            offset_to_data: 0x48,
        };
        assert!(!entry.is_named());
        assert!(!entry.is_directory());
    }

    #[test]
    fn test_resource_type_names() {
        assert_eq!(ResourceType::Icon.name(), "ICON");
        assert_eq!(ResourceType::GroupIcon.to_string(), "GROUP_ICON");
        assert_eq!(ResourceType::from_u16(24), Some(ResourceType::Manifest));
        assert_eq!(ResourceType::from_u16(13), None);
    }

    #[test]
    fn test_key_ordering() {
        assert!(ResourceKey::name("A") < ResourceKey::name("a"));
        assert!(ResourceKey::name("ZZZ") < ResourceKey::Id(0));
        assert!(ResourceKey::Id(2) < ResourceKey::Id(10));
        assert!(ResourceKey::from("ICON").matches_name("ICON"));
        assert!(!ResourceKey::from("ICON").matches_name("icon"));
        assert_eq!(ResourceKey::from(ResourceType::Version), ResourceKey::Id(16));
        assert_eq!(ResourceKey::Id(3).resource_type(), Some(ResourceType::Icon));
    }

    #[test]
    fn test_parse_two_top_level_entries() {
        let buf = sample();
        let tree = parse(&buf).unwrap();
        let root = tree.root();
        assert_eq!(root.len(), 2);
        assert_eq!(root.named_entries.len(), 1);
        assert_eq!(root.id_entries.len(), 1);
        assert!(root.named_entries[0].key.matches_name("ICON"));
        assert_eq!(root.id_entries[0].key, ResourceKey::Id(7));
        assert!(tree.is_sorted());

        let leaf = tree
            .find(&["ICON".into(), 1u32.into(), 0x409u32.into()])
            .and_then(ResourceNode::as_data)
            .unwrap();
        assert_eq!(leaf.data_rva, 0x5000);
        assert_eq!(leaf.size, 0x40);
        assert_eq!(leaf.code_page, 1252);

        let leaf = tree
            .find(&[7u32.into(), 2u32.into(), 0x409u32.into()])
            .and_then(ResourceNode::as_data)
            .unwrap();
        assert_eq!(leaf.size, 0x10);
    }

    #[test]
    fn test_find_misses() {
        let buf = sample();
        let tree = parse(&buf).unwrap();
        assert!(tree.find(&[]).is_none());
        assert!(tree.find(&["icon".into()]).is_none());
        assert!(tree.find(&[7u32.into(), 3u32.into()]).is_none());
        // Walking through a leaf goes nowhere.
        assert!(tree
            .find(&[7u32.into(), 2u32.into(), 0x409u32.into(), 0u32.into()])
            .is_none());
        assert!(tree.find_type(ResourceType::Icon).is_none());
        assert!(tree.find_type(ResourceType::FontDir).is_some());
    }

    #[test]
    fn test_leaves_carry_paths() {
        let buf = sample();
        let tree = parse(&buf).unwrap();
        let leaves: Vec<_> = tree.leaves().collect();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].path_string(), "ICON/#1/#1033");
        assert_eq!(leaves[1].path_string(), "#7/#2/#1033");
        assert_eq!(leaves[1].resource_type(), Some(ResourceType::FontDir));
        assert_eq!(leaves[0].resource_type(), None);
    }

    #[test]
    fn test_display_dump() {
        let buf = sample();
        let tree = parse(&buf).unwrap();
        let dump = tree.to_string();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "Name: ICON");
        assert_eq!(lines[1], "  ID: 1");
        assert_eq!(lines[2], "    ID: 1033 [rva=0x5000, size=64, code_page=1252]");
        assert_eq!(lines[3], "ID: 7");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_direct_cycle() {
        let mut buf = Vec::new();
        put_dir(&mut buf, 0, 0, &[(1, DIR)]);
        assert!(matches!(parse(&buf), Err(Error::CyclicResourceTree { offset: 0 })));
    }

    #[test]
    fn test_indirect_cycle() {
        let mut buf = Vec::new();
        put_dir(&mut buf, 0x00, 0, &[(1, DIR | 0x20)]);
        put_dir(&mut buf, 0x20, 0, &[(1, DIR | 0x40)]);
        put_dir(&mut buf, 0x40, 0, &[(1, DIR | 0x20)]);
        assert!(matches!(parse(&buf), Err(Error::CyclicResourceTree { offset: 0x20 })));
    }

    #[test]
    fn test_shared_subdirectory_is_not_a_cycle() {
        let mut buf = Vec::new();
        put_dir(&mut buf, 0x00, 0, &[(1, DIR | 0x30), (2, DIR | 0x30)]);
        put_dir(&mut buf, 0x30, 0, &[(0x409, 0x50)]);
        put_leaf(&mut buf, 0x50, 0x1000, 4);
        let tree = parse(&buf).unwrap();
        assert_eq!(tree.root().id_entries[0].node, tree.root().id_entries[1].node);
        assert_eq!(tree.node_count(), 2);
        let leaves: Vec<_> = tree.leaves().collect();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].path_string(), "#1/#1033");
        assert_eq!(tree.to_string().lines().last(), Some("ID: 2 (shared)"));
    }

    #[test]
    fn test_shared_chain_walks_linearly() {
        // 24 directories, each with two entries pointing at the next one.
        let mut buf = Vec::new();
        for level in 0..24u32 {
            let at = level * 0x20;
            let target = if level == 23 { 0x400 } else { DIR | (at + 0x20) };
            put_dir(&mut buf, at as usize, 0, &[(1, target), (2, target)]);
        }
        put_leaf(&mut buf, 0x400, 0x1000, 8);

        let tree = parse(&buf).unwrap();
        assert_eq!(tree.node_count(), 24);
        let leaves: Vec<_> = tree.leaves().collect();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].path.len(), 24);
        assert_eq!(leaves[0].data, leaves[1].data);
        assert_eq!(tree.to_string().lines().count(), 23 * 2 + 2);
    }

    #[test]
    fn test_depth_limit() {
        fn chain(levels: usize) -> Vec<u8> {
            let mut buf = Vec::new();
            for level in 0..levels {
                let at = level * 0x20;
                if level + 1 == levels {
                    put_dir(&mut buf, at, 0, &[(1, 0x1000)]);
                } else {
                    put_dir(&mut buf, at, 0, &[(1, DIR | (at as u32 + 0x20))]);
                }
            }
            put_leaf(&mut buf, 0x1000, 0x2000, 1);
            buf
        }

        assert!(parse(&chain(32)).is_ok());
        assert!(matches!(
            parse(&chain(33)),
            Err(Error::ResourceTreeTooDeep { max_depth: 32 })
        ));

        let shallow = ParseOptions::default().with_max_resource_depth(3);
        let buf = chain(4);
        assert!(matches!(
            ResourceTree::parse(&SliceSource::new(&buf), 0, &shallow),
            Err(Error::ResourceTreeTooDeep { max_depth: 3 })
        ));
    }

    #[test]
    fn test_shared_subtree_reached_deeper_respects_limit() {
        // 0x00 -> A(0x20) -> B(0x40) -> leaf, and 0x00 -> C(0x60) -> A again.
        let mut buf = Vec::new();
        put_dir(&mut buf, 0x00, 0, &[(1, DIR | 0x20), (2, DIR | 0x60)]);
        put_dir(&mut buf, 0x20, 0, &[(1, DIR | 0x40)]);
        put_dir(&mut buf, 0x40, 0, &[(1, 0x100)]);
        put_dir(&mut buf, 0x60, 0, &[(1, DIR | 0x20)]);
        put_leaf(&mut buf, 0x100, 0x1000, 1);

        let source = SliceSource::new(&buf);
        let three = ParseOptions::default().with_max_resource_depth(3);
        assert!(matches!(
            ResourceTree::parse(&source, 0, &three),
            Err(Error::ResourceTreeTooDeep { max_depth: 3 })
        ));
        let four = ParseOptions::default().with_max_resource_depth(4);
        assert!(ResourceTree::parse(&source, 0, &four).is_ok());
    }

    #[test]
    fn test_unsorted_entries_tolerated() {
        let mut buf = Vec::new();
        put_dir(&mut buf, 0x00, 0, &[(9, 0x40), (3, 0x40)]);
        put_leaf(&mut buf, 0x40, 0x1000, 1);
        let tree = parse(&buf).unwrap();
        assert!(!tree.root().is_sorted());
        assert!(!tree.is_sorted());
        assert!(tree.root().get_id(3).is_some());
        assert_eq!(tree.root().entries().next().unwrap().key, ResourceKey::Id(9));
    }

    #[test]
    fn test_flag_decides_named_or_id() {
        // Header claims no named entries, but the entry has the name flag.
        let mut buf = Vec::new();
        put_dir(&mut buf, 0x00, 0, &[(HIGH_BIT | 0x40, 0x20)]);
        put_leaf(&mut buf, 0x20, 0x1000, 1);
        put_name(&mut buf, 0x40, "X");
        let tree = parse(&buf).unwrap();
        assert_eq!(tree.root().named_entries.len(), 1);
        assert!(tree.root().get_name("X").is_some());
    }

    #[test]
    fn test_truncated_structures() {
        let buf = sample();
        assert!(matches!(parse(&buf[..8]), Err(Error::TruncatedData { .. })));
        assert!(matches!(parse(&buf[..0x20]), Err(Error::TruncatedData { .. })));
        // Name string cut short.
        assert!(matches!(parse(&buf[..0x204]), Err(Error::TruncatedData { .. })));
    }

    #[test]
    fn test_shared_name_decoded_once() {
        let entries: Vec<(u32, u32)> = (0..200).map(|_| (HIGH_BIT | 0x800, 0x700)).collect();
        let mut buf = Vec::new();
        put_dir(&mut buf, 0x00, 200, &entries);
        put_leaf(&mut buf, 0x700, 0x1000, 1);
        put_name(&mut buf, 0x800, "RESOURCE_NAME");

        let tree = parse(&buf).unwrap();
        let names: Vec<_> = tree
            .root()
            .named_entries
            .iter()
            .filter_map(|entry| match &entry.key {
                ResourceKey::Name(name) => Some(name),
                ResourceKey::Id(_) => None,
            })
            .collect();
        assert_eq!(names.len(), 200);
        assert!(names.iter().all(|name| Arc::ptr_eq(name, names[0])));
        assert!(tree.root().named_entries[199].key.matches_name("RESOURCE_NAME"));
    }

    #[test]
    fn test_overlapping_names_rejected() {
        // Name at 0x102 starts inside the name at 0x100; together they claim
        // more bytes than the whole source.
        let mut buf = vec![0u8; 0x1000];
        put_dir(&mut buf, 0x00, 2, &[(HIGH_BIT | 0x100, 0x40), (HIGH_BIT | 0x102, 0x40)]);
        put_leaf(&mut buf, 0x40, 0x1000, 1);
        buf[0x100..0x102].copy_from_slice(&0x700u16.to_le_bytes());
        buf[0x102..0x104].copy_from_slice(&0x6FFu16.to_le_bytes());
        assert!(matches!(
            parse(&buf),
            Err(Error::OutOfBounds { offset: 0x102, .. })
        ));
    }

    /// Hands back one byte too few for reads at `short_at`.
    struct ShortReadSource {
        data: Vec<u8>,
        short_at: u64,
    }

    impl ByteSource for ShortReadSource {
        fn len(&self) -> u64 {
            self.data.len() as u64
        }

        fn read_range(&self, offset: u64, len: usize) -> Result<std::borrow::Cow<'_, [u8]>> {
            let start = offset as usize;
            let end = if offset == self.short_at { start + len - 1 } else { start + len };
            Ok(std::borrow::Cow::Borrowed(&self.data[start..end]))
        }
    }

    #[test]
    fn test_short_read_is_an_error() {
        let source = ShortReadSource {
            data: sample(),
            short_at: 0x200,
        };
        assert!(matches!(
            ResourceTree::parse(&source, 0, &ParseOptions::default()),
            Err(Error::TruncatedData { offset: 0x200, .. })
        ));
    }

    #[test]
    fn test_offsets_relative_to_base() {
        let inner = sample();
        let mut buf = vec![0xEE; 0x400];
        buf.extend_from_slice(&inner);
        let tree = ResourceTree::parse(&SliceSource::new(&buf), 0x400, &ParseOptions::default()).unwrap();
        assert_eq!(tree.base_offset(), 0x400);
        assert_eq!(tree.leaves().count(), 2);
    }
}
