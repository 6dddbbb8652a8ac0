use bitflags::bitflags;
use log::debug;
use std::collections::BTreeMap;

const RES_TABLE_TYPE: u16 = 0x0002;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_TABLE_PACKAGE_TYPE: u16 = 0x0200;
const RES_TABLE_TYPE_TYPE: u16 = 0x0201;
const RES_TABLE_TYPE_SPEC_TYPE: u16 = 0x0202;

const NO_ENTRY: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

const TYPE_NULL: u8 = 0x00;
const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

bitflags! {
    /// Flags carried by a table entry header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u16 {
        /// Complex entry holding a set of name/value mappings.
        const COMPLEX = 0x0001;
        /// Declared public; libraries may reference it.
        const PUBLIC = 0x0002;
        /// Weak resource, may be overridden by strong resources.
        const WEAK = 0x0004;
        /// Compact entry with type and value encoded inline.
        const COMPACT = 0x0008;
    }
}

bitflags! {
    /// Flags carried by a type chunk header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TypeChunkFlags: u8 {
        /// Sparse entry array with inline ids, binary-searched at runtime.
        const SPARSE = 0x01;
        /// Entry offsets encoded in 16 bits.
        const OFFSET16 = 0x02;
    }
}

/// Result alias for resource table operations.
pub type TableResult<T> = Result<T, TableError>;

/// Errors surfaced by the resource table model.
#[derive(Debug)]
pub enum TableError {
    /// The table is missing the expected chunk structure.
    MalformedTable(String),
    /// A valid but unsupported encoding variant.
    Unsupported(&'static str),
    /// Duplicate definition of one resource id with differing content.
    Conflict(u32),
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::MalformedTable(msg) => write!(f, "Malformed resource table: {msg}"),
            TableError::Unsupported(what) => {
                write!(f, "Unsupported resource table encoding: {what}")
            }
            TableError::Conflict(id) => {
                write!(f, "Conflicting definitions for resource 0x{id:08x}")
            }
        }
    }
}

impl std::error::Error for TableError {}

struct TableReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TableReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        TableReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> TableResult<u8> {
        if self.pos + 1 > self.data.len() {
            return Err(TableError::MalformedTable(
                "Unexpected end of resource table".to_string(),
            ));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> TableResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(TableError::MalformedTable(
                "Unexpected end of resource table".to_string(),
            ));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> TableResult<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(TableError::MalformedTable(
                "Unexpected end of resource table".to_string(),
            ));
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    fn read_bytes(&mut self, count: usize) -> TableResult<&'a [u8]> {
        if self.pos + count > self.data.len() {
            return Err(TableError::MalformedTable(
                "Unexpected end of resource table".to_string(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn seek(&mut self, offset: usize) -> TableResult<()> {
        if offset > self.data.len() {
            return Err(TableError::MalformedTable(
                "Attempted to seek past end of table".to_string(),
            ));
        }
        self.pos = offset;
        Ok(())
    }
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }

    fn body_start(&self) -> usize {
        self.start + self.header_size as usize
    }
}

fn read_chunk_header(reader: &mut TableReader<'_>) -> TableResult<ChunkHeader> {
    let start = reader.position();
    if reader.remaining() < 8 {
        return Err(TableError::MalformedTable(
            "Truncated chunk header".to_string(),
        ));
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if chunk_size < header_size as u32 {
        return Err(TableError::MalformedTable(
            "Invalid chunk sizing in resource table".to_string(),
        ));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| TableError::MalformedTable("Chunk size overflow".to_string()))?;
    if end > reader.data.len() {
        return Err(TableError::MalformedTable(
            "Chunk extends past end of table".to_string(),
        ));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        let first = 0x8000 | ((len >> 16) as u16 & 0x7FFF);
        let second = (len & 0xFFFF) as u16;
        write_u16(buf, first);
        write_u16(buf, second);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // placeholder for chunk size
    start
}

fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> TableResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        return Err(TableError::MalformedTable(
            "String offset exceeds pool bounds".to_string(),
        ));
    }
    let (_, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        return Err(TableError::MalformedTable(
            "UTF-8 string exceeds pool bounds".to_string(),
        ));
    }
    let slice = &data[cursor..cursor + byte_len];
    let text =
        std::str::from_utf8(slice).map_err(|err| TableError::MalformedTable(err.to_string()))?;
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> TableResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len + 2 > limit {
        return Err(TableError::MalformedTable(
            "UTF-16 string exceeds pool bounds".to_string(),
        ));
    }
    let mut units = Vec::with_capacity(char_count);
    for chunk in data[cursor..cursor + byte_len].chunks_exact(2) {
        units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    String::from_utf16(&units).map_err(|err| TableError::MalformedTable(err.to_string()))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> TableResult<(usize, usize)> {
    if offset >= limit {
        return Err(TableError::MalformedTable(
            "Invalid UTF-8 length offset".to_string(),
        ));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(TableError::MalformedTable(
                "Truncated UTF-8 length".to_string(),
            ));
        }
        let second = data[offset + 1];
        let length = (((first & 0x7F) as usize) << 8) | second as usize;
        Ok((length, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> TableResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(TableError::MalformedTable(
            "Invalid UTF-16 length offset".to_string(),
        ));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(TableError::MalformedTable(
                "Truncated UTF-16 length".to_string(),
            ));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        let length = (((first & 0x7FFF) as usize) << 16) | second as usize;
        Ok((length, 4))
    }
}

/// A parsed string pool, kept as owned strings.
fn parse_string_pool(reader: &mut TableReader<'_>, header: &ChunkHeader) -> TableResult<Vec<String>> {
    let string_count = reader.read_u32()? as usize;
    let style_count = reader.read_u32()? as usize;
    let flags = reader.read_u32()?;
    let strings_start = reader.read_u32()? as usize;
    let _styles_start = reader.read_u32()?;

    let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;

    let mut offsets = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        offsets.push(reader.read_u32()? as usize);
    }
    for _ in 0..style_count {
        reader.read_u32()?;
    }

    let base = header.start + strings_start;
    let limit = header.end();
    let mut strings = Vec::with_capacity(string_count);
    for offset in offsets {
        let absolute = base + offset;
        let text = if is_utf8 {
            read_utf8_string(reader.data, absolute, limit)?
        } else {
            read_utf16_string(reader.data, absolute, limit)?
        };
        strings.push(text);
    }
    Ok(strings)
}

fn write_string_pool(strings: &[String]) -> Vec<u8> {
    let string_count = strings.len() as u32;
    let header_size = 28u16;
    let strings_start = header_size as u32 + string_count * 4;
    let mut string_data = Vec::new();
    let mut offsets = Vec::with_capacity(strings.len());
    for s in strings {
        offsets.push(string_data.len() as u32);
        write_utf16_string(&mut string_data, s);
    }
    align_to_four(&mut string_data);

    let mut chunk = Vec::new();
    write_u16(&mut chunk, RES_STRING_POOL_TYPE);
    write_u16(&mut chunk, header_size);
    write_u32(&mut chunk, 0); // chunk size placeholder
    write_u32(&mut chunk, string_count);
    write_u32(&mut chunk, 0); // style count
    write_u32(&mut chunk, 0); // flags (UTF-16)
    write_u32(&mut chunk, strings_start);
    write_u32(&mut chunk, 0); // stylesStart
    for offset in offsets {
        write_u32(&mut chunk, offset);
    }
    chunk.extend_from_slice(&string_data);
    align_to_four(&mut chunk);
    let chunk_size = chunk.len() as u32;
    chunk[4..8].copy_from_slice(&chunk_size.to_le_bytes());
    chunk
}

/// Compose a resource id from its parts.
pub fn resource_id(package_id: u8, type_id: u8, entry_id: u16) -> u32 {
    (u32::from(package_id) << 24) | (u32::from(type_id) << 16) | u32::from(entry_id)
}

/// A typed value slot in the resource table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableValue {
    /// Reference to another resource id.
    Reference(u32),
    /// Index into the table's global string pool; file-backed resources
    /// store their archive path here.
    StringRef(u32),
    Boolean(bool),
    IntDec(i32),
    IntHex(u32),
    Null,
    /// Value types the model does not interpret; kept verbatim.
    Raw { data_type: u8, data: u32 },
}

impl TableValue {
    fn decode(data_type: u8, data: u32) -> TableValue {
        match data_type {
            TYPE_NULL => TableValue::Null,
            TYPE_REFERENCE => TableValue::Reference(data),
            TYPE_STRING => TableValue::StringRef(data),
            TYPE_INT_DEC => TableValue::IntDec(data as i32),
            TYPE_INT_HEX => TableValue::IntHex(data),
            // 0 and all-ones are the two encodings aapt emits; anything else
            // is preserved raw so re-serialization is loss-free.
            TYPE_INT_BOOLEAN if data == 0 => TableValue::Boolean(false),
            TYPE_INT_BOOLEAN if data == NO_ENTRY => TableValue::Boolean(true),
            _ => TableValue::Raw { data_type, data },
        }
    }

    fn encode(&self) -> (u8, u32) {
        match self {
            TableValue::Reference(id) => (TYPE_REFERENCE, *id),
            TableValue::StringRef(idx) => (TYPE_STRING, *idx),
            TableValue::Boolean(true) => (TYPE_INT_BOOLEAN, NO_ENTRY),
            TableValue::Boolean(false) => (TYPE_INT_BOOLEAN, 0),
            TableValue::IntDec(num) => (TYPE_INT_DEC, *num as u32),
            TableValue::IntHex(value) => (TYPE_INT_HEX, *value),
            TableValue::Null => (TYPE_NULL, 0),
            TableValue::Raw { data_type, data } => (*data_type, *data),
        }
    }

    pub fn as_string_index(&self) -> Option<u32> {
        match self {
            TableValue::StringRef(idx) => Some(*idx),
            _ => None,
        }
    }
}

/// Entry payload: a single value, or a map of sub-values for complex
/// entries (styles, arrays, plurals).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryValue {
    Single(TableValue),
    Complex {
        parent: u32,
        values: Vec<(u32, TableValue)>,
    },
}

/// One non-null resource entry slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableEntry {
    pub flags: EntryFlags,
    /// Index into the owning package's key-name pool.
    pub key: u32,
    pub value: EntryValue,
}

/// Opaque configuration block of a type chunk, compared bytewise. The
/// first four bytes carry the block's own size, as in the wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigBlock(Vec<u8>);

impl ConfigBlock {
    /// The default (unqualified) configuration.
    pub fn default_config() -> Self {
        let mut bytes = vec![0u8; 28];
        bytes[..4].copy_from_slice(&28u32.to_le_bytes());
        ConfigBlock(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> TableResult<Self> {
        if bytes.len() < 4 {
            return Err(TableError::MalformedTable(
                "Configuration block shorter than its size field".to_string(),
            ));
        }
        Ok(ConfigBlock(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One configuration-qualified set of entries for a resource type.
#[derive(Clone, Debug)]
pub struct TypeChunk {
    pub config: ConfigBlock,
    /// Nullable slots indexed by local entry id. A `None` slot is an
    /// intentionally vacated id; sibling ids never shift.
    pub entries: Vec<Option<TableEntry>>,
}

impl TypeChunk {
    pub fn new(config: ConfigBlock, entry_count: usize) -> Self {
        TypeChunk {
            config,
            entries: vec![None; entry_count],
        }
    }
}

/// Spec + configuration chunks for one resource type.
#[derive(Clone, Debug)]
pub struct TypeSpec {
    pub type_id: u8,
    /// Per-entry configuration masks from the spec chunk.
    pub flags: Vec<u32>,
    pub configs: Vec<TypeChunk>,
}

impl TypeSpec {
    pub fn new(type_id: u8, entry_count: usize) -> Self {
        TypeSpec {
            type_id,
            flags: vec![0; entry_count],
            configs: Vec::new(),
        }
    }

    fn defines_entry(&self, entry_id: usize) -> bool {
        self.configs
            .iter()
            .any(|chunk| matches!(chunk.entries.get(entry_id), Some(Some(_))))
    }
}

/// One package inside the resource table.
#[derive(Clone, Debug)]
pub struct TablePackage {
    pub id: u8,
    pub name: String,
    /// Type names indexed by `type_id - 1`.
    pub type_names: Vec<String>,
    pub key_names: Vec<String>,
    pub specs: Vec<TypeSpec>,
}

impl TablePackage {
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        TablePackage {
            id,
            name: name.into(),
            type_names: Vec::new(),
            key_names: Vec::new(),
            specs: Vec::new(),
        }
    }

    pub fn intern_key(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.key_names.iter().position(|key| key == name) {
            return idx as u32;
        }
        self.key_names.push(name.to_string());
        (self.key_names.len() - 1) as u32
    }

    pub fn key_name(&self, idx: u32) -> Option<&str> {
        self.key_names.get(idx as usize).map(|s| s.as_str())
    }

    pub fn type_name(&self, type_id: u8) -> Option<&str> {
        if type_id == 0 {
            return None;
        }
        self.type_names.get(type_id as usize - 1).map(|s| s.as_str())
    }

    /// Register a type name for the given type id, growing the positional
    /// name table as needed.
    pub fn ensure_type_name(&mut self, type_id: u8, name: &str) {
        let idx = type_id as usize - 1;
        if self.type_names.len() <= idx {
            self.type_names.resize(idx + 1, String::new());
        }
        if self.type_names[idx].is_empty() {
            self.type_names[idx] = name.to_string();
        }
    }

    pub fn spec(&self, type_id: u8) -> Option<&TypeSpec> {
        self.specs.iter().find(|spec| spec.type_id == type_id)
    }

    pub fn spec_mut(&mut self, type_id: u8) -> Option<&mut TypeSpec> {
        self.specs.iter_mut().find(|spec| spec.type_id == type_id)
    }
}

/// Location of one configuration variant of a resource entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryLocation {
    pub package_index: usize,
    pub spec_index: usize,
    pub config_index: usize,
    pub entry_index: usize,
}

/// In-memory model of a compiled resource table (`resources.arsc`).
#[derive(Clone, Debug, Default)]
pub struct ResourceTable {
    strings: Vec<String>,
    string_index: BTreeMap<String, u32>,
    pub packages: Vec<TablePackage>,
}

impl ResourceTable {
    pub fn new() -> Self {
        ResourceTable::default()
    }

    pub fn string(&self, idx: u32) -> Option<&str> {
        self.strings.get(idx as usize).map(|s| s.as_str())
    }

    pub fn intern_string(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.string_index.insert(value.to_string(), idx);
        idx
    }

    /// Rewrite every pool string under `from/` to live under `to/`. Returns
    /// the number of rewritten strings. Used together with the archive-side
    /// rename so file-backed entries stay resolvable.
    pub fn rewrite_path_prefix(&mut self, from: &str, to: &str) -> usize {
        let from_prefix = format!("{}/", from.trim_end_matches('/'));
        let to_prefix = format!("{}/", to.trim_end_matches('/'));
        let mut rewritten = 0;
        for value in &mut self.strings {
            if value.starts_with(&from_prefix) {
                *value = format!("{}{}", to_prefix, &value[from_prefix.len()..]);
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            self.string_index = self
                .strings
                .iter()
                .enumerate()
                .map(|(idx, s)| (s.clone(), idx as u32))
                .collect();
        }
        rewritten
    }

    pub fn package(&self, package_id: u8) -> Option<&TablePackage> {
        self.packages.iter().find(|pkg| pkg.id == package_id)
    }

    pub fn package_mut(&mut self, package_id: u8) -> Option<&mut TablePackage> {
        self.packages.iter_mut().find(|pkg| pkg.id == package_id)
    }

    pub fn add_package(&mut self, package: TablePackage) -> usize {
        self.packages.push(package);
        self.packages.len() - 1
    }

    /// All configuration variants defining the given resource id.
    pub fn entry_locations(&self, id: u32) -> Vec<EntryLocation> {
        let package_id = (id >> 24) as u8;
        let type_id = ((id >> 16) & 0xFF) as u8;
        let entry_id = (id & 0xFFFF) as usize;
        let mut locations = Vec::new();
        for (package_index, package) in self.packages.iter().enumerate() {
            if package.id != package_id {
                continue;
            }
            for (spec_index, spec) in package.specs.iter().enumerate() {
                if spec.type_id != type_id {
                    continue;
                }
                for (config_index, chunk) in spec.configs.iter().enumerate() {
                    if matches!(chunk.entries.get(entry_id), Some(Some(_))) {
                        locations.push(EntryLocation {
                            package_index,
                            spec_index,
                            config_index,
                            entry_index: entry_id,
                        });
                    }
                }
            }
        }
        locations
    }

    pub fn entry(&self, loc: EntryLocation) -> Option<&TableEntry> {
        self.packages
            .get(loc.package_index)?
            .specs
            .get(loc.spec_index)?
            .configs
            .get(loc.config_index)?
            .entries
            .get(loc.entry_index)?
            .as_ref()
    }

    /// For file-backed entries, the archive path stored as the entry's
    /// string value.
    pub fn resolve_file_path(&self, loc: EntryLocation) -> Option<&str> {
        match &self.entry(loc)?.value {
            EntryValue::Single(value) => value.as_string_index().and_then(|idx| self.string(idx)),
            EntryValue::Complex { .. } => None,
        }
    }

    /// Vacate the entry slot without shifting sibling ids; the id space is
    /// referenced from compiled code elsewhere and must remain stable.
    pub fn nullify_entry(&mut self, loc: EntryLocation) -> bool {
        let Some(slot) = self
            .packages
            .get_mut(loc.package_index)
            .and_then(|pkg| pkg.specs.get_mut(loc.spec_index))
            .and_then(|spec| spec.configs.get_mut(loc.config_index))
            .and_then(|chunk| chunk.entries.get_mut(loc.entry_index))
        else {
            return false;
        };
        slot.take().is_some()
    }

    /// Drop the entry id from the spec's flag bitmap once no configuration
    /// still defines it, and trim trailing vacated slots. Must only run
    /// after every configuration variant of the id has been nulled;
    /// removing the id outright earlier would corrupt configurations still
    /// referencing it.
    pub fn compact_spec(&mut self, package_id: u8, type_id: u8, entry_id: u16) {
        let Some(spec) = self
            .package_mut(package_id)
            .and_then(|pkg| pkg.spec_mut(type_id))
        else {
            return;
        };
        let entry_id = entry_id as usize;
        if spec.defines_entry(entry_id) {
            return;
        }
        if let Some(flag) = spec.flags.get_mut(entry_id) {
            *flag = 0;
        }
        // Trim trailing ids that no longer exist in any configuration.
        let mut keep = spec.flags.len();
        while keep > 0 && spec.flags[keep - 1] == 0 && !spec.defines_entry(keep - 1) {
            keep -= 1;
        }
        spec.flags.truncate(keep);
        for chunk in &mut spec.configs {
            chunk.entries.truncate(keep);
        }
    }

    /// Place an entry, growing the spec and chunk to fit. Overwrites any
    /// existing definition; merge folding checks occupancy first.
    pub fn put_entry(
        &mut self,
        package_id: u8,
        type_id: u8,
        entry_id: u16,
        config: &ConfigBlock,
        entry: TableEntry,
    ) -> TableResult<()> {
        let package = self
            .package_mut(package_id)
            .ok_or_else(|| TableError::MalformedTable(format!("No package 0x{package_id:02x}")))?;
        if package.spec(type_id).is_none() {
            package.specs.push(TypeSpec::new(type_id, 0));
        }
        let spec = package
            .spec_mut(type_id)
            .ok_or_else(|| TableError::MalformedTable(format!("No type spec 0x{type_id:02x}")))?;
        let needed = entry_id as usize + 1;
        if spec.flags.len() < needed {
            spec.flags.resize(needed, 0);
        }
        if !spec.configs.iter().any(|chunk| chunk.config == *config) {
            spec.configs.push(TypeChunk::new(config.clone(), 0));
        }
        let slots = spec.flags.len();
        for chunk in &mut spec.configs {
            if chunk.entries.len() < slots {
                chunk.entries.resize(slots, None);
            }
        }
        let chunk = spec
            .configs
            .iter_mut()
            .find(|chunk| chunk.config == *config)
            .ok_or_else(|| TableError::MalformedTable("Configuration chunk vanished".to_string()))?;
        chunk.entries[entry_id as usize] = Some(entry);
        Ok(())
    }

    /// Fold another table's packages into this one.
    ///
    /// Same-id collisions with differing content raise [`TableError::Conflict`]
    /// when `validate` is set; otherwise the existing (base) definition wins.
    /// String and key references are re-interned into this table's pools.
    pub fn merge_from(&mut self, other: &ResourceTable, validate: bool) -> TableResult<()> {
        for src_package in &other.packages {
            if self.package(src_package.id).is_none() {
                self.packages
                    .push(TablePackage::new(src_package.id, src_package.name.clone()));
            }

            // Positional type-name table: extend with whatever the split
            // knows that the base does not.
            {
                let dst_package = self
                    .package_mut(src_package.id)
                    .ok_or_else(|| TableError::MalformedTable("Package vanished".to_string()))?;
                if dst_package.name.is_empty() {
                    dst_package.name = src_package.name.clone();
                }
                for (idx, name) in src_package.type_names.iter().enumerate() {
                    if !name.is_empty() {
                        dst_package.ensure_type_name(idx as u8 + 1, name);
                    }
                }
            }

            for src_spec in &src_package.specs {
                for src_chunk in &src_spec.configs {
                    for (entry_id, slot) in src_chunk.entries.iter().enumerate() {
                        let Some(src_entry) = slot else {
                            continue;
                        };
                        let remapped = self.remap_entry(src_package, other, src_entry)?;
                        let id =
                            resource_id(src_package.id, src_spec.type_id, entry_id as u16);
                        let existing = self
                            .package(src_package.id)
                            .and_then(|pkg| pkg.spec(src_spec.type_id))
                            .and_then(|spec| {
                                spec.configs
                                    .iter()
                                    .find(|chunk| chunk.config == src_chunk.config)
                            })
                            .and_then(|chunk| chunk.entries.get(entry_id))
                            .and_then(|slot| slot.as_ref());
                        if let Some(existing) = existing {
                            if validate && *existing != remapped {
                                return Err(TableError::Conflict(id));
                            }
                            debug!("keeping base definition for resource 0x{id:08x}");
                            continue;
                        }
                        self.put_entry(
                            src_package.id,
                            src_spec.type_id,
                            entry_id as u16,
                            &src_chunk.config,
                            remapped,
                        )?;
                        let spec_flag = src_spec.flags.get(entry_id).copied().unwrap_or(0);
                        if let Some(spec) = self
                            .package_mut(src_package.id)
                            .and_then(|pkg| pkg.spec_mut(src_spec.type_id))
                        {
                            if let Some(flag) = spec.flags.get_mut(entry_id) {
                                *flag |= spec_flag;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn remap_entry(
        &mut self,
        src_package: &TablePackage,
        src_table: &ResourceTable,
        entry: &TableEntry,
    ) -> TableResult<TableEntry> {
        let key_name = src_package.key_name(entry.key).ok_or_else(|| {
            TableError::MalformedTable("Entry key references missing pool string".to_string())
        })?;
        let key_owned = key_name.to_string();
        let key = self
            .package_mut(src_package.id)
            .ok_or_else(|| TableError::MalformedTable("Package vanished".to_string()))?
            .intern_key(&key_owned);
        let value = match &entry.value {
            EntryValue::Single(value) => {
                EntryValue::Single(self.remap_value(src_table, value)?)
            }
            EntryValue::Complex { parent, values } => {
                let mut remapped = Vec::with_capacity(values.len());
                for (name, value) in values {
                    remapped.push((*name, self.remap_value(src_table, value)?));
                }
                EntryValue::Complex {
                    parent: *parent,
                    values: remapped,
                }
            }
        };
        Ok(TableEntry {
            flags: entry.flags,
            key,
            value,
        })
    }

    fn remap_value(
        &mut self,
        src_table: &ResourceTable,
        value: &TableValue,
    ) -> TableResult<TableValue> {
        match value {
            TableValue::StringRef(idx) => {
                let text = src_table.string(*idx).ok_or_else(|| {
                    TableError::MalformedTable(
                        "String value references missing pool entry".to_string(),
                    )
                })?;
                let text_owned = text.to_string();
                Ok(TableValue::StringRef(self.intern_string(&text_owned)))
            }
            other => Ok(other.clone()),
        }
    }

    /// Decode a compiled resource table.
    pub fn from_bytes(bytes: &[u8]) -> TableResult<Self> {
        let mut reader = TableReader::new(bytes);
        let table_header = read_chunk_header(&mut reader)?;
        if table_header.chunk_type != RES_TABLE_TYPE {
            return Err(TableError::MalformedTable(
                "Resource table does not start with RES_TABLE_TYPE header".to_string(),
            ));
        }
        let package_count = reader.read_u32()? as usize;
        reader.seek(table_header.body_start())?;

        let mut table = ResourceTable::new();
        let table_end = table_header.end();
        while reader.position() < table_end {
            let chunk = read_chunk_header(&mut reader)?;
            match chunk.chunk_type {
                RES_STRING_POOL_TYPE => {
                    let strings = parse_string_pool(&mut reader, &chunk)?;
                    table.string_index = strings
                        .iter()
                        .enumerate()
                        .map(|(idx, s)| (s.clone(), idx as u32))
                        .collect();
                    table.strings = strings;
                }
                RES_TABLE_PACKAGE_TYPE => {
                    let package = parse_package(&mut reader, &chunk)?;
                    table.packages.push(package);
                }
                _ => {
                    debug!(
                        "skipping unknown table chunk type 0x{:04x}",
                        chunk.chunk_type
                    );
                }
            }
            reader.seek(chunk.end())?;
        }

        if table.packages.len() != package_count {
            debug!(
                "package count mismatch: header says {package_count}, parsed {}",
                table.packages.len()
            );
        }
        Ok(table)
    }

    /// Re-encode the table. Ids are never renumbered; chunk sizes and pool
    /// offsets are recomputed. Untouched tables round-trip byte-identically
    /// through serialize → parse → serialize.
    pub fn to_bytes(&self) -> TableResult<Vec<u8>> {
        let mut buf = Vec::new();
        let table_start = begin_chunk(&mut buf, RES_TABLE_TYPE, 12);
        write_u32(&mut buf, self.packages.len() as u32);
        let pool = write_string_pool(&self.strings);
        buf.extend_from_slice(&pool);
        for package in &self.packages {
            write_package(&mut buf, package)?;
        }
        finalize_chunk(&mut buf, table_start);
        Ok(buf)
    }
}

fn parse_package(reader: &mut TableReader<'_>, header: &ChunkHeader) -> TableResult<TablePackage> {
    let id = reader.read_u32()?;
    let name_bytes = reader.read_bytes(256)?;
    let name_units: Vec<u16> = name_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    let name = String::from_utf16(&name_units)
        .map_err(|err| TableError::MalformedTable(err.to_string()))?;
    // typeStrings / lastPublicType / keyStrings / lastPublicKey offsets are
    // recomputed on write; the pools are discovered by chunk order below.
    reader.seek(header.body_start())?;

    let mut package = TablePackage::new((id & 0xFF) as u8, name);
    let mut pools_seen = 0;
    let package_end = header.end();
    while reader.position() < package_end {
        let chunk = read_chunk_header(reader)?;
        match chunk.chunk_type {
            RES_STRING_POOL_TYPE => {
                let strings = parse_string_pool(reader, &chunk)?;
                match pools_seen {
                    0 => package.type_names = strings,
                    1 => package.key_names = strings,
                    _ => {
                        return Err(TableError::MalformedTable(
                            "Package carries more than two string pools".to_string(),
                        ))
                    }
                }
                pools_seen += 1;
            }
            RES_TABLE_TYPE_SPEC_TYPE => {
                let spec = parse_type_spec(reader, &chunk)?;
                package.specs.push(spec);
            }
            RES_TABLE_TYPE_TYPE => {
                let (type_id, type_chunk) = parse_type_chunk(reader, &chunk)?;
                let spec = package.spec_mut(type_id).ok_or_else(|| {
                    TableError::MalformedTable(format!(
                        "Type chunk 0x{type_id:02x} without a preceding spec"
                    ))
                })?;
                spec.configs.push(type_chunk);
            }
            _ => {
                debug!(
                    "skipping unknown package chunk type 0x{:04x}",
                    chunk.chunk_type
                );
            }
        }
        reader.seek(chunk.end())?;
    }
    Ok(package)
}

fn parse_type_spec(reader: &mut TableReader<'_>, header: &ChunkHeader) -> TableResult<TypeSpec> {
    let type_id = reader.read_u8()?;
    if type_id == 0 {
        return Err(TableError::MalformedTable(
            "Type spec with invalid type id 0".to_string(),
        ));
    }
    reader.read_u8()?; // res0
    reader.read_u16()?; // types count, informational
    let entry_count = reader.read_u32()? as usize;
    reader.seek(header.body_start())?;
    let mut flags = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        flags.push(reader.read_u32()?);
    }
    Ok(TypeSpec {
        type_id,
        flags,
        configs: Vec::new(),
    })
}

fn parse_type_chunk(
    reader: &mut TableReader<'_>,
    header: &ChunkHeader,
) -> TableResult<(u8, TypeChunk)> {
    let type_id = reader.read_u8()?;
    let flags = TypeChunkFlags::from_bits_truncate(reader.read_u8()?);
    if flags.contains(TypeChunkFlags::SPARSE) {
        return Err(TableError::Unsupported("sparse type chunks"));
    }
    if flags.contains(TypeChunkFlags::OFFSET16) {
        return Err(TableError::Unsupported("16-bit entry offsets"));
    }
    reader.read_u16()?; // reserved
    let entry_count = reader.read_u32()? as usize;
    let entries_start = reader.read_u32()? as usize;
    let config_size = reader.read_u32()? as usize;
    if config_size < 4 || 20 + config_size > header.header_size as usize {
        return Err(TableError::MalformedTable(
            "Configuration block exceeds chunk header bounds".to_string(),
        ));
    }
    let mut config_bytes = Vec::with_capacity(config_size);
    config_bytes.extend_from_slice(&(config_size as u32).to_le_bytes());
    config_bytes.extend_from_slice(reader.read_bytes(config_size - 4)?);
    let config = ConfigBlock::from_bytes(config_bytes)?;

    reader.seek(header.body_start())?;
    let mut offsets = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        offsets.push(reader.read_u32()?);
    }

    let entries_base = header.start + entries_start;
    let mut entries = Vec::with_capacity(entry_count);
    for offset in offsets {
        if offset == NO_ENTRY {
            entries.push(None);
            continue;
        }
        reader.seek(entries_base + offset as usize)?;
        entries.push(Some(parse_entry(reader)?));
    }
    Ok((type_id, TypeChunk { config, entries }))
}

fn parse_entry(reader: &mut TableReader<'_>) -> TableResult<TableEntry> {
    let _size = reader.read_u16()?;
    let raw_flags = reader.read_u16()?;
    let flags = EntryFlags::from_bits_truncate(raw_flags);
    if flags.contains(EntryFlags::COMPACT) {
        return Err(TableError::Unsupported("compact table entries"));
    }
    let key = reader.read_u32()?;
    let value = if flags.contains(EntryFlags::COMPLEX) {
        let parent = reader.read_u32()?;
        let count = reader.read_u32()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let name = reader.read_u32()?;
            values.push((name, parse_value(reader)?));
        }
        EntryValue::Complex { parent, values }
    } else {
        EntryValue::Single(parse_value(reader)?)
    };
    Ok(TableEntry {
        flags: flags.difference(EntryFlags::COMPLEX),
        key,
        value,
    })
}

fn parse_value(reader: &mut TableReader<'_>) -> TableResult<TableValue> {
    let size = reader.read_u16()?;
    if size != 8 {
        return Err(TableError::MalformedTable(
            "Resource value size must be 8".to_string(),
        ));
    }
    reader.read_u8()?; // res0
    let data_type = reader.read_u8()?;
    let data = reader.read_u32()?;
    Ok(TableValue::decode(data_type, data))
}

fn write_value(buf: &mut Vec<u8>, value: &TableValue) {
    let (data_type, data) = value.encode();
    write_u16(buf, 8);
    write_u8(buf, 0);
    write_u8(buf, data_type);
    write_u32(buf, data);
}

fn write_entry(buf: &mut Vec<u8>, entry: &TableEntry) {
    match &entry.value {
        EntryValue::Single(value) => {
            write_u16(buf, 8);
            write_u16(buf, entry.flags.bits());
            write_u32(buf, entry.key);
            write_value(buf, value);
        }
        EntryValue::Complex { parent, values } => {
            write_u16(buf, 16);
            write_u16(buf, (entry.flags | EntryFlags::COMPLEX).bits());
            write_u32(buf, entry.key);
            write_u32(buf, *parent);
            write_u32(buf, values.len() as u32);
            for (name, value) in values {
                write_u32(buf, *name);
                write_value(buf, value);
            }
        }
    }
}

fn write_package(buf: &mut Vec<u8>, package: &TablePackage) -> TableResult<()> {
    let type_pool = write_string_pool(&package.type_names);
    let key_pool = write_string_pool(&package.key_names);

    let header_size = 288u16;
    let package_start = begin_chunk(buf, RES_TABLE_PACKAGE_TYPE, header_size);
    write_u32(buf, u32::from(package.id));

    let mut name_units: Vec<u16> = package.name.encode_utf16().collect();
    if name_units.len() > 127 {
        return Err(TableError::MalformedTable(format!(
            "Package name too long: {}",
            package.name
        )));
    }
    name_units.resize(128, 0);
    for unit in name_units {
        write_u16(buf, unit);
    }

    write_u32(buf, u32::from(header_size)); // typeStrings
    write_u32(buf, package.type_names.len() as u32); // lastPublicType
    write_u32(buf, u32::from(header_size) + type_pool.len() as u32); // keyStrings
    write_u32(buf, package.key_names.len() as u32); // lastPublicKey
    write_u32(buf, 0); // typeIdOffset

    buf.extend_from_slice(&type_pool);
    buf.extend_from_slice(&key_pool);

    for spec in &package.specs {
        write_type_spec(buf, spec);
        for chunk in &spec.configs {
            write_type_chunk(buf, spec.type_id, chunk);
        }
    }
    finalize_chunk(buf, package_start);
    Ok(())
}

fn write_type_spec(buf: &mut Vec<u8>, spec: &TypeSpec) {
    let spec_start = begin_chunk(buf, RES_TABLE_TYPE_SPEC_TYPE, 16);
    write_u8(buf, spec.type_id);
    write_u8(buf, 0);
    write_u16(buf, spec.configs.len() as u16);
    write_u32(buf, spec.flags.len() as u32);
    for flag in &spec.flags {
        write_u32(buf, *flag);
    }
    finalize_chunk(buf, spec_start);
}

fn write_type_chunk(buf: &mut Vec<u8>, type_id: u8, chunk: &TypeChunk) {
    let config_bytes = chunk.config.as_bytes();
    let header_size = (20 + config_bytes.len()) as u16;
    let entry_count = chunk.entries.len();
    let entries_start = u32::from(header_size) + (entry_count as u32) * 4;

    let mut entry_data = Vec::new();
    let mut offsets = Vec::with_capacity(entry_count);
    for slot in &chunk.entries {
        match slot {
            Some(entry) => {
                offsets.push(entry_data.len() as u32);
                write_entry(&mut entry_data, entry);
            }
            None => offsets.push(NO_ENTRY),
        }
    }

    let chunk_start = begin_chunk(buf, RES_TABLE_TYPE_TYPE, header_size);
    write_u8(buf, type_id);
    write_u8(buf, 0); // flags: dense, 32-bit offsets
    write_u16(buf, 0); // reserved
    write_u32(buf, entry_count as u32);
    write_u32(buf, entries_start);
    buf.extend_from_slice(config_bytes);
    for offset in offsets {
        write_u32(buf, offset);
    }
    buf.extend_from_slice(&entry_data);
    finalize_chunk(buf, chunk_start);
}
