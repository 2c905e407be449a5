//! Fixture images for integration tests.
//!
//! [`ImageBuilder`] lays out a small but well-formed PE32 or PE32+ file: DOS
//! header, signature, COFF header, optional header with 16 data directories,
//! section table and section data. A resource section can be described as a
//! [`Res`] tree or supplied as raw bytes.

#![allow(dead_code)]

pub const FILE_ALIGNMENT: u32 = 0x200;
pub const SECTION_ALIGNMENT: u32 = 0x1000;
pub const PE_OFFSET: usize = 0x40;
pub const OPTIONAL_OFFSET: usize = PE_OFFSET + 4 + 20;

pub const CODE_CHARACTERISTICS: u32 = 0x6000_0020;
pub const DATA_CHARACTERISTICS: u32 = 0xC000_0040;
pub const RSRC_CHARACTERISTICS: u32 = 0x4000_0040;

const SUBDIRECTORY: u32 = 0x8000_0000;
const NAMED: u32 = 0x8000_0000;

/// Resource entry key in a fixture tree.
#[derive(Debug, Clone)]
pub enum Key {
    Name(&'static str),
    Id(u32),
}

/// Declarative resource tree.
#[derive(Debug, Clone)]
pub enum Res {
    Dir(Vec<(Key, Res)>),
    Leaf(Vec<u8>),
}

impl Res {
    pub fn dir(entries: Vec<(Key, Res)>) -> Self {
        Res::Dir(entries)
    }

    pub fn leaf(data: &[u8]) -> Self {
        Res::Leaf(data.to_vec())
    }

    /// `levels` nested directories, root included, ending in one leaf.
    pub fn chain(levels: usize) -> Self {
        let mut node = Res::leaf(b"bottom");
        for _ in 0..levels {
            node = Res::Dir(vec![(Key::Id(1), node)]);
        }
        node
    }
}

struct Section {
    name: [u8; 8],
    virtual_address: u32,
    virtual_size: u32,
    data: Vec<u8>,
    characteristics: u32,
}

/// Builds fixture images.
pub struct ImageBuilder {
    pe32plus: bool,
    machine: u16,
    characteristics: u16,
    entry_point: u32,
    sections: Vec<Section>,
    directories: [(u32, u32); 16],
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            pe32plus: false,
            machine: 0x014C,
            characteristics: 0x0102,
            entry_point: 0x1000,
            sections: Vec::new(),
            directories: [(0, 0); 16],
        }
    }

    pub fn pe32plus(mut self) -> Self {
        self.pe32plus = true;
        self.machine = 0x8664;
        self.characteristics = 0x0022;
        self
    }

    pub fn dll(mut self) -> Self {
        self.characteristics |= 0x2000;
        self
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    fn next_rva(&self) -> u32 {
        self.sections.last().map_or(SECTION_ALIGNMENT, |s| {
            let span = s.virtual_size.max(s.data.len() as u32);
            s.virtual_address + span.div_ceil(SECTION_ALIGNMENT).max(1) * SECTION_ALIGNMENT
        })
    }

    /// Add a section placed after the previous one.
    pub fn section(self, name: &str, data: Vec<u8>, characteristics: u32) -> Self {
        let rva = self.next_rva();
        let virtual_size = data.len() as u32;
        self.section_at(name, rva, virtual_size, data, characteristics)
    }

    /// Add a section at an explicit RVA and virtual size.
    pub fn section_at(
        mut self,
        name: &str,
        virtual_address: u32,
        virtual_size: u32,
        data: Vec<u8>,
        characteristics: u32,
    ) -> Self {
        let mut raw = [0u8; 8];
        let len = name.len().min(8);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.sections.push(Section {
            name: raw,
            virtual_address,
            virtual_size,
            data,
            characteristics,
        });
        self
    }

    pub fn directory(mut self, index: usize, rva: u32, size: u32) -> Self {
        self.directories[index] = (rva, size);
        self
    }

    /// Add a `.rsrc` section holding `tree` and point the resource directory at it.
    pub fn resources(self, tree: &Res) -> Self {
        let rva = self.next_rva();
        let bytes = encode_resources(tree, rva);
        self.raw_resources_at(rva, bytes)
    }

    /// Add a `.rsrc` section with hand-written resource bytes.
    pub fn raw_resources(self, bytes: Vec<u8>) -> Self {
        let rva = self.next_rva();
        self.raw_resources_at(rva, bytes)
    }

    fn raw_resources_at(self, rva: u32, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u32;
        self.section_at(".rsrc", rva, size, bytes, RSRC_CHARACTERISTICS)
            .directory(2, rva, size)
    }

    fn optional_size(&self) -> usize {
        if self.pe32plus {
            112 + 16 * 8
        } else {
            96 + 16 * 8
        }
    }

    /// Offset of the first section header.
    pub fn section_table_offset(&self) -> usize {
        OPTIONAL_OFFSET + self.optional_size()
    }

    pub fn build(&self) -> Vec<u8> {
        let headers_end = self.section_table_offset() + self.sections.len() * 40;
        let size_of_headers = align(headers_end as u32, FILE_ALIGNMENT);

        let mut raw_pointers = Vec::with_capacity(self.sections.len());
        let mut file_end = size_of_headers;
        for s in &self.sections {
            raw_pointers.push(file_end);
            file_end += align(s.data.len() as u32, FILE_ALIGNMENT);
        }
        let mut out = vec![0u8; file_end as usize];

        // DOS header
        out[0..2].copy_from_slice(b"MZ");
        put_u32(&mut out, 0x3C, PE_OFFSET as u32);

        // Signature and COFF header
        out[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");
        let coff = PE_OFFSET + 4;
        put_u16(&mut out, coff, self.machine);
        put_u16(&mut out, coff + 2, self.sections.len() as u16);
        put_u32(&mut out, coff + 4, 0x6000_0000);
        put_u16(&mut out, coff + 16, self.optional_size() as u16);
        put_u16(&mut out, coff + 18, self.characteristics);

        // Optional header
        let opt = OPTIONAL_OFFSET;
        let size_of_image = align(self.next_rva(), SECTION_ALIGNMENT);
        if self.pe32plus {
            put_u16(&mut out, opt, 0x20B);
            put_u32(&mut out, opt + 16, self.entry_point);
            put_u64(&mut out, opt + 24, 0x1_4000_0000);
        } else {
            put_u16(&mut out, opt, 0x10B);
            put_u32(&mut out, opt + 16, self.entry_point);
            put_u32(&mut out, opt + 28, 0x40_0000);
        }
        put_u32(&mut out, opt + 32, SECTION_ALIGNMENT);
        put_u32(&mut out, opt + 36, FILE_ALIGNMENT);
        put_u32(&mut out, opt + 56, size_of_image);
        put_u32(&mut out, opt + 60, size_of_headers);
        put_u16(&mut out, opt + 68, 3);
        let (nrva, dirs) = if self.pe32plus {
            (opt + 108, opt + 112)
        } else {
            (opt + 92, opt + 96)
        };
        put_u32(&mut out, nrva, 16);
        for (i, (rva, size)) in self.directories.iter().enumerate() {
            put_u32(&mut out, dirs + i * 8, *rva);
            put_u32(&mut out, dirs + i * 8 + 4, *size);
        }

        // Section table and data
        for (i, (s, raw)) in self.sections.iter().zip(&raw_pointers).enumerate() {
            let h = self.section_table_offset() + i * 40;
            out[h..h + 8].copy_from_slice(&s.name);
            put_u32(&mut out, h + 8, s.virtual_size);
            put_u32(&mut out, h + 12, s.virtual_address);
            put_u32(&mut out, h + 16, s.data.len() as u32);
            put_u32(&mut out, h + 20, *raw);
            put_u32(&mut out, h + 36, s.characteristics);
            let start = *raw as usize;
            out[start..start + s.data.len()].copy_from_slice(&s.data);
        }
        out
    }
}

/// Serialize `tree` as a resource section loaded at `section_rva`.
pub fn encode_resources(tree: &Res, section_rva: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    match tree {
        Res::Dir(entries) => {
            write_dir(&mut buf, entries, section_rva);
        }
        Res::Leaf(_) => panic!("resource root must be a directory"),
    }
    buf
}

fn reserve(buf: &mut Vec<u8>, len: usize) -> usize {
    let at = buf.len();
    buf.resize(at + len, 0);
    at
}

fn write_dir(buf: &mut Vec<u8>, entries: &[(Key, Res)], section_rva: u32) -> u32 {
    let named: Vec<_> = entries.iter().filter(|(k, _)| matches!(k, Key::Name(_))).collect();
    let ids: Vec<_> = entries.iter().filter(|(k, _)| matches!(k, Key::Id(_))).collect();

    let at = reserve(buf, 16 + entries.len() * 8);
    put_u16(buf, at + 12, named.len() as u16);
    put_u16(buf, at + 14, ids.len() as u16);

    for (i, (key, child)) in named.into_iter().chain(ids).enumerate() {
        let name_field = match key {
            Key::Id(id) => *id,
            Key::Name(name) => NAMED | write_name(buf, name),
        };
        let target = match child {
            Res::Dir(children) => SUBDIRECTORY | write_dir(buf, children, section_rva),
            Res::Leaf(data) => write_leaf(buf, data, section_rva),
        };
        let e = at + 16 + i * 8;
        put_u32(buf, e, name_field);
        put_u32(buf, e + 4, target);
    }
    at as u32
}

fn write_name(buf: &mut Vec<u8>, name: &str) -> u32 {
    let units: Vec<u16> = name.encode_utf16().collect();
    let at = reserve(buf, 2 + units.len() * 2);
    put_u16(buf, at, units.len() as u16);
    for (i, unit) in units.iter().enumerate() {
        put_u16(buf, at + 2 + i * 2, *unit);
    }
    at as u32
}

fn write_leaf(buf: &mut Vec<u8>, data: &[u8], section_rva: u32) -> u32 {
    let pad = (4 - buf.len() % 4) % 4;
    reserve(buf, pad);
    let at = reserve(buf, 16);
    let data_at = reserve(buf, data.len());
    buf[data_at..data_at + data.len()].copy_from_slice(data);
    put_u32(buf, at, section_rva + data_at as u32);
    put_u32(buf, at + 4, data.len() as u32);
    put_u32(buf, at + 8, 1252);
    at as u32
}

/// Raw directory with `(name_field, target_field)` entries, the first `named` of them named.
pub fn raw_dir(buf: &mut Vec<u8>, at: usize, named: u16, entries: &[(u32, u32)]) {
    let end = at + 16 + entries.len() * 8;
    if buf.len() < end {
        buf.resize(end, 0);
    }
    put_u16(buf, at + 12, named);
    put_u16(buf, at + 14, entries.len() as u16 - named);
    for (i, (name, target)) in entries.iter().enumerate() {
        put_u32(buf, at + 16 + i * 8, *name);
        put_u32(buf, at + 20 + i * 8, *target);
    }
}

pub fn subdir(offset: u32) -> u32 {
    SUBDIRECTORY | offset
}

pub fn align(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

pub fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// `.text` plus a resource section with type "ICON" and type 7, each with
/// one name and one language level.
pub fn sample_image() -> Vec<u8> {
    let tree = Res::dir(vec![
        (
            Key::Name("ICON"),
            Res::dir(vec![(Key::Id(1), Res::dir(vec![(Key::Id(0x409), Res::leaf(&[0xAA; 0x40]))]))]),
        ),
        (
            Key::Id(7),
            Res::dir(vec![(Key::Id(2), Res::dir(vec![(Key::Id(0x409), Res::leaf(&[0xBB; 0x10]))]))]),
        ),
    ]);
    ImageBuilder::new()
        .section(".text", vec![0xCC; 0x200], CODE_CHARACTERISTICS)
        .resources(&tree)
        .build()
}
