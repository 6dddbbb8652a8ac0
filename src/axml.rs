use crate::archive::{ArchiveEntry, EntryCompression};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

/// Namespace URI carried by every `android:` attribute.
pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";

const TYPE_NULL: u8 = 0x00;
const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_FLOAT: u8 = 0x04;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

/// Resource ids of the framework attributes the merger manipulates.
pub const ATTR_NAME: u32 = 0x0101_0003;
pub const ATTR_VALUE: u32 = 0x0101_0024;
pub const ATTR_RESOURCE: u32 = 0x0101_0025;
pub const ATTR_EXTRACT_NATIVE_LIBS: u32 = 0x0101_04ea;
pub const ATTR_IS_SPLIT_REQUIRED: u32 = 0x0101_0591;
pub const ATTR_REQUIRED_SPLIT_TYPES: u32 = 0x0101_064e;
pub const ATTR_SPLIT_TYPES: u32 = 0x0101_064f;

pub const NAME_IS_SPLIT_REQUIRED: &str = "isSplitRequired";
pub const NAME_REQUIRED_SPLIT_TYPES: &str = "requiredSplitTypes";
pub const NAME_SPLIT_TYPES: &str = "splitTypes";

/// `<meta-data>` names that mark an APK as part of a split bundle.
pub const SPLIT_MARKER_NAMES: [&str; 2] = [
    "com.android.vending.splits",
    "com.android.vending.derived.apk.id",
];

/// Result alias for binary XML operations.
pub type XmlResult<T> = Result<T, XmlError>;

/// Errors surfaced by the binary XML model.
#[derive(Debug)]
pub enum XmlError {
    /// The document is missing the expected structure.
    MalformedDocument(String),
    /// Text XML generation failure.
    Xml(String),
}

impl std::fmt::Display for XmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XmlError::MalformedDocument(msg) => write!(f, "Malformed manifest: {msg}"),
            XmlError::Xml(msg) => write!(f, "XML error: {msg}"),
        }
    }
}

impl std::error::Error for XmlError {}

impl From<quick_xml::Error> for XmlError {
    fn from(value: quick_xml::Error) -> Self {
        XmlError::Xml(value.to_string())
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
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> XmlResult<u8> {
        if self.pos + 1 > self.data.len() {
            return Err(XmlError::MalformedDocument(
                "Unexpected end of binary XML".to_string(),
            ));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> XmlResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(XmlError::MalformedDocument(
                "Unexpected end of binary XML".to_string(),
            ));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> XmlResult<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(XmlError::MalformedDocument(
                "Unexpected end of binary XML".to_string(),
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

    fn seek(&mut self, offset: usize) -> XmlResult<()> {
        if offset > self.data.len() {
            return Err(XmlError::MalformedDocument(
                "Attempted to seek past end of document".to_string(),
            ));
        }
        self.pos = offset;
        Ok(())
    }
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> XmlResult<Self> {
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let styles_start = reader.read_u32()? as usize;

        let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;

        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }

        for _ in 0..style_count {
            reader.read_u32()?; // skip style offsets
        }

        let strings_base = header.start + strings_start;
        let chunk_end = header.end();

        let mut strings = Vec::with_capacity(string_count);
        for offset in string_offsets {
            let absolute = strings_base + offset;
            let text = if is_utf8 {
                read_utf8_string(reader.data, absolute, chunk_end)?
            } else {
                read_utf16_string(reader.data, absolute, chunk_end)?
            };
            strings.push(text);
        }

        if styles_start != 0 {
            // Skip style data entirely by seeking to chunk end.
            reader.seek(chunk_end)?;
        }

        Ok(StringPool { strings })
    }

    fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(|s| s.as_str())
    }
}

struct StringPoolBuilder {
    strings: Vec<String>,
    indices: BTreeMap<String, u32>,
}

impl StringPoolBuilder {
    fn new() -> Self {
        StringPoolBuilder {
            strings: Vec::new(),
            indices: BTreeMap::new(),
        }
    }

    fn intern(&mut self, value: impl AsRef<str>) -> u32 {
        let value = value.as_ref();
        if let Some(&idx) = self.indices.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        let owned = value.to_string();
        self.strings.push(owned.clone());
        self.indices.insert(owned, idx);
        idx
    }

    fn index_of(&self, value: &str) -> Option<u32> {
        self.indices.get(value).copied()
    }

    fn to_chunk(&self) -> Vec<u8> {
        let string_count = self.strings.len() as u32;
        let header_size = 28u16;
        let strings_start = header_size as u32 + string_count * 4;
        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
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
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> XmlResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        return Err(XmlError::MalformedDocument(
            "String offset exceeds chunk bounds".to_string(),
        ));
    }
    let (char_len, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        return Err(XmlError::MalformedDocument(
            "UTF-8 string exceeds chunk bounds".to_string(),
        ));
    }
    let slice = &data[cursor..cursor + byte_len];
    let text =
        std::str::from_utf8(slice).map_err(|err| XmlError::MalformedDocument(err.to_string()))?;
    cursor += byte_len;
    if cursor >= limit {
        return Err(XmlError::MalformedDocument(
            "Missing UTF-8 terminator".to_string(),
        ));
    }
    let _ = char_len;
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> XmlResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len > limit {
        return Err(XmlError::MalformedDocument(
            "UTF-16 string exceeds chunk bounds".to_string(),
        ));
    }
    let mut units = Vec::with_capacity(char_count);
    for chunk in data[cursor..cursor + byte_len].chunks_exact(2) {
        units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    cursor += byte_len;
    if cursor + 2 > limit {
        return Err(XmlError::MalformedDocument(
            "Missing UTF-16 terminator".to_string(),
        ));
    }
    let terminator = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
    if terminator != 0 {
        return Err(XmlError::MalformedDocument(
            "UTF-16 string missing terminator".to_string(),
        ));
    }
    let text =
        String::from_utf16(&units).map_err(|err| XmlError::MalformedDocument(err.to_string()))?;
    Ok(text)
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> XmlResult<(usize, usize)> {
    if offset >= limit {
        return Err(XmlError::MalformedDocument(
            "Invalid UTF-8 length offset".to_string(),
        ));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(XmlError::MalformedDocument(
                "Truncated UTF-8 length".to_string(),
            ));
        }
        let second = data[offset + 1];
        let length = (((first & 0x7F) as usize) << 8) | second as usize;
        Ok((length, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> XmlResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(XmlError::MalformedDocument(
            "Invalid UTF-16 length offset".to_string(),
        ));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(XmlError::MalformedDocument(
                "Truncated UTF-16 length".to_string(),
            ));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        let length = (((first & 0x7FFF) as usize) << 16) | second as usize;
        Ok((length, 4))
    }
}

fn read_chunk_header(reader: &mut BinaryReader<'_>) -> XmlResult<ChunkHeader> {
    let start = reader.position();
    if reader.remaining() < 8 {
        return Err(XmlError::MalformedDocument(
            "Truncated binary XML chunk header".to_string(),
        ));
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if chunk_size < header_size as u32 {
        return Err(XmlError::MalformedDocument(
            "Invalid chunk sizing in binary XML".to_string(),
        ));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| XmlError::MalformedDocument("Chunk size overflow".to_string()))?;
    if end > reader.data.len() {
        return Err(XmlError::MalformedDocument(
            "Chunk extends past end of document".to_string(),
        ));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

#[derive(Clone, Debug)]
struct NamespaceFrame {
    prefix: Option<String>,
    uri: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct NamespaceDecl {
    prefix: String,
    uri: String,
}

fn resolve_prefix(namespaces: &[NamespaceFrame], uri: Option<&str>) -> Option<String> {
    uri.and_then(|target| {
        namespaces
            .iter()
            .rev()
            .find(|frame| frame.uri.as_deref() == Some(target))
            .and_then(|frame| frame.prefix.clone())
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
    let size_bytes = size.to_le_bytes();
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size_bytes);
}

/// Typed attribute values inside the manifest tree.
#[derive(Clone, Debug, PartialEq)]
pub enum XmlValue {
    String(String),
    Boolean(bool),
    IntDec(i32),
    IntHex(u32),
    Float(f32),
    Reference(u32),
    Null,
    /// Value types the model does not interpret; kept verbatim.
    Raw { data_type: u8, data: u32 },
}

impl XmlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            XmlValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_reference_id(&self) -> Option<u32> {
        match self {
            XmlValue::Reference(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            XmlValue::Boolean(flag) => Some(*flag),
            _ => None,
        }
    }

    /// Display text used by the readable-XML rendering.
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            XmlValue::String(text) => Cow::Borrowed(text.as_str()),
            XmlValue::Boolean(true) => Cow::Borrowed("true"),
            XmlValue::Boolean(false) => Cow::Borrowed("false"),
            XmlValue::IntDec(num) => Cow::Owned(num.to_string()),
            XmlValue::IntHex(value) => Cow::Owned(format!("0x{value:x}")),
            XmlValue::Float(value) => Cow::Owned(value.to_string()),
            XmlValue::Reference(id) => Cow::Owned(format!("@0x{id:08x}")),
            XmlValue::Null => Cow::Borrowed(""),
            XmlValue::Raw { data, .. } => Cow::Owned(format!("0x{data:x}")),
        }
    }

    fn decode(strings: &StringPool, data_type: u8, data: u32) -> XmlResult<XmlValue> {
        match data_type {
            TYPE_NULL => Ok(XmlValue::Null),
            TYPE_STRING => strings
                .get(data)
                .map(|s| XmlValue::String(s.to_string()))
                .ok_or_else(|| {
                    XmlError::MalformedDocument(
                        "String value references missing pool entry".to_string(),
                    )
                }),
            TYPE_REFERENCE => Ok(XmlValue::Reference(data)),
            TYPE_INT_BOOLEAN => Ok(XmlValue::Boolean(data != 0)),
            TYPE_INT_DEC => Ok(XmlValue::IntDec(data as i32)),
            TYPE_INT_HEX => Ok(XmlValue::IntHex(data)),
            TYPE_FLOAT => Ok(XmlValue::Float(f32::from_bits(data))),
            _ => Ok(XmlValue::Raw { data_type, data }),
        }
    }

    fn encode(&self, pool: &StringPoolBuilder) -> XmlResult<(u8, u32)> {
        match self {
            XmlValue::String(text) => {
                let idx = pool
                    .index_of(text)
                    .ok_or_else(|| XmlError::MalformedDocument("Missing string value".into()))?;
                Ok((TYPE_STRING, idx))
            }
            XmlValue::Boolean(flag) => Ok((TYPE_INT_BOOLEAN, if *flag { 0xFFFF_FFFF } else { 0 })),
            XmlValue::IntDec(num) => Ok((TYPE_INT_DEC, *num as u32)),
            XmlValue::IntHex(value) => Ok((TYPE_INT_HEX, *value)),
            XmlValue::Float(value) => Ok((TYPE_FLOAT, value.to_bits())),
            XmlValue::Reference(id) => Ok((TYPE_REFERENCE, *id)),
            XmlValue::Null => Ok((TYPE_NULL, 0)),
            XmlValue::Raw { data_type, data } => Ok((*data_type, *data)),
        }
    }
}

impl From<&str> for XmlValue {
    fn from(value: &str) -> Self {
        XmlValue::String(value.to_owned())
    }
}

impl From<String> for XmlValue {
    fn from(value: String) -> Self {
        XmlValue::String(value)
    }
}

impl From<bool> for XmlValue {
    fn from(value: bool) -> Self {
        XmlValue::Boolean(value)
    }
}

/// A single attribute attached to a manifest element.
///
/// The resource id, when present, is the stable lookup key; name and
/// namespace ordering carry no meaning for lookups.
#[derive(Clone, Debug, PartialEq)]
pub struct XmlAttribute {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub resource_id: Option<u32>,
    pub name: String,
    pub value: XmlValue,
}

impl XmlAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<XmlValue>) -> Self {
        XmlAttribute {
            namespace_prefix: None,
            namespace_uri: None,
            resource_id: None,
            name: name.into(),
            value: value.into(),
        }
    }

    /// An `android:`-namespaced attribute with its framework resource id.
    pub fn android(id: u32, name: impl Into<String>, value: impl Into<XmlValue>) -> Self {
        XmlAttribute {
            namespace_prefix: Some("android".to_string()),
            namespace_uri: Some(ANDROID_NAMESPACE_URI.to_string()),
            resource_id: Some(id),
            name: name.into(),
            value: value.into(),
        }
    }
}

/// DOM-style element node for the binary XML tree.
#[derive(Clone, Debug, PartialEq)]
pub struct XmlElement {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub tag: String,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlElement>,
    pub text: Option<String>,
}

impl XmlElement {
    pub fn new(tag: impl Into<String>) -> Self {
        XmlElement {
            namespace_prefix: None,
            namespace_uri: None,
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    /// Linear search by resource id. Attribute counts per element are small
    /// and ordering is semantically meaningless for lookup.
    pub fn find_attribute_by_id(&self, id: u32) -> Option<&XmlAttribute> {
        self.attributes
            .iter()
            .find(|attr| attr.resource_id == Some(id))
    }

    pub fn find_attribute_by_id_mut(&mut self, id: u32) -> Option<&mut XmlAttribute> {
        self.attributes
            .iter_mut()
            .find(|attr| attr.resource_id == Some(id))
    }

    /// Linear search by local name, ignoring namespaces.
    pub fn find_attribute_by_name(&self, name: &str) -> Option<&XmlAttribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn remove_attribute_by_id(&mut self, id: u32) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|attr| attr.resource_id != Some(id));
        before != self.attributes.len()
    }

    pub fn remove_attribute_by_name(&mut self, name: &str) -> bool {
        let before = self.attributes.len();
        self.attributes.retain(|attr| attr.name != name);
        before != self.attributes.len()
    }

    pub fn set_attribute(&mut self, attribute: XmlAttribute) {
        if let Some(existing) = self.attributes.iter_mut().find(|attr| {
            attr.name == attribute.name && attr.namespace_prefix == attribute.namespace_prefix
        }) {
            *existing = attribute;
        } else {
            self.attributes.push(attribute);
        }
    }

    /// Value of the attribute with the given resource id, when it is a string.
    pub fn string_value_by_id(&self, id: u32) -> Option<&str> {
        self.find_attribute_by_id(id)
            .and_then(|attr| attr.value.as_str())
    }

    pub fn append_child(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    pub fn find_child(&self, tag: &str) -> Option<&XmlElement> {
        self.children.iter().find(|child| child.tag == tag)
    }

    pub fn find_child_mut(&mut self, tag: &str) -> Option<&mut XmlElement> {
        self.children.iter_mut().find(|child| child.tag == tag)
    }

    pub fn children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |child| child.tag == tag)
    }

    pub fn remove_child_at(&mut self, index: usize) -> XmlElement {
        self.children.remove(index)
    }

    /// Indices of children matching tag whose attribute `attr_id` carries one
    /// of the given string values. Indices are returned in document order.
    pub fn children_with_attribute(
        &self,
        tag: &str,
        attr_id: u32,
        values: &[&str],
    ) -> Vec<usize> {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, child)| {
                child.tag == tag
                    && child
                        .string_value_by_id(attr_id)
                        .map(|value| values.contains(&value))
                        .unwrap_or(false)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    fn remove_attribute_recursive_by_id(&mut self, id: u32) -> usize {
        let mut removed = usize::from(self.remove_attribute_by_id(id));
        for child in &mut self.children {
            removed += child.remove_attribute_recursive_by_id(id);
        }
        removed
    }

    fn remove_attribute_recursive_by_name(&mut self, name: &str) -> usize {
        let mut removed = usize::from(self.remove_attribute_by_name(name));
        for child in &mut self.children {
            removed += child.remove_attribute_recursive_by_name(name);
        }
        removed
    }
}

fn qualified_name(prefix: Option<&str>, local: &str) -> String {
    if let Some(prefix) = prefix {
        format!("{prefix}:{local}")
    } else {
        local.to_string()
    }
}

fn collect_namespace_declarations(root: &XmlElement) -> Vec<NamespaceDecl> {
    let mut set = BTreeSet::new();
    gather_namespace_decls(root, &mut set);
    set.into_iter().collect()
}

fn gather_namespace_decls(element: &XmlElement, set: &mut BTreeSet<NamespaceDecl>) {
    if let (Some(prefix), Some(uri)) = (&element.namespace_prefix, &element.namespace_uri) {
        set.insert(NamespaceDecl {
            prefix: prefix.clone(),
            uri: uri.clone(),
        });
    }
    for attr in &element.attributes {
        if let (Some(prefix), Some(uri)) = (&attr.namespace_prefix, &attr.namespace_uri) {
            set.insert(NamespaceDecl {
                prefix: prefix.clone(),
                uri: uri.clone(),
            });
        }
    }
    for child in &element.children {
        gather_namespace_decls(child, set);
    }
}

/// Pool-index-aligned resource id mapping for attribute names. The string
/// pool must place mapped names first so that map slot `i` annotates pool
/// string `i`.
fn collect_resource_mapped_names(element: &XmlElement, out: &mut Vec<(String, u32)>) {
    for attr in &element.attributes {
        if let Some(id) = attr.resource_id {
            if !out.iter().any(|(name, _)| name == &attr.name) {
                out.push((attr.name.clone(), id));
            }
        }
    }
    for child in &element.children {
        collect_resource_mapped_names(child, out);
    }
}

fn collect_element_strings(element: &XmlElement, pool: &mut StringPoolBuilder) {
    pool.intern(&element.tag);
    if let Some(prefix) = &element.namespace_prefix {
        pool.intern(prefix);
    }
    if let Some(uri) = &element.namespace_uri {
        pool.intern(uri);
    }
    if let Some(text) = &element.text {
        pool.intern(text);
    }
    for attr in &element.attributes {
        pool.intern(&attr.name);
        if let Some(prefix) = &attr.namespace_prefix {
            pool.intern(prefix);
        }
        if let Some(uri) = &attr.namespace_uri {
            pool.intern(uri);
        }
        if let XmlValue::String(value) = &attr.value {
            pool.intern(value);
        }
    }
    for child in &element.children {
        collect_element_strings(child, pool);
    }
}

fn write_namespace_chunk(
    buf: &mut Vec<u8>,
    pool: &StringPoolBuilder,
    decl: &NamespaceDecl,
    is_start: bool,
) -> XmlResult<()> {
    let chunk_type = if is_start {
        RES_XML_START_NAMESPACE_TYPE
    } else {
        RES_XML_END_NAMESPACE_TYPE
    };
    let chunk_start = begin_chunk(buf, chunk_type, 16);
    write_u32(buf, 0);
    write_u32(buf, NO_ENTRY_INDEX);
    let prefix_idx = pool
        .index_of(&decl.prefix)
        .ok_or_else(|| XmlError::MalformedDocument("Missing namespace prefix string".into()))?;
    let uri_idx = pool
        .index_of(&decl.uri)
        .ok_or_else(|| XmlError::MalformedDocument("Missing namespace URI string".into()))?;
    write_u32(buf, prefix_idx);
    write_u32(buf, uri_idx);
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_element_recursive(
    element: &XmlElement,
    buf: &mut Vec<u8>,
    pool: &StringPoolBuilder,
) -> XmlResult<()> {
    write_start_element(buf, element, pool)?;
    if let Some(text) = &element.text {
        write_cdata(buf, text, pool)?;
    }
    for child in &element.children {
        write_element_recursive(child, buf, pool)?;
    }
    write_end_element(buf, element, pool)?;
    Ok(())
}

fn write_start_element(
    buf: &mut Vec<u8>,
    element: &XmlElement,
    pool: &StringPoolBuilder,
) -> XmlResult<()> {
    let chunk_start = begin_chunk(buf, RES_XML_START_ELEMENT_TYPE, 16);
    write_u32(buf, 0);
    write_u32(buf, NO_ENTRY_INDEX);
    let ns_idx = if let Some(uri) = &element.namespace_uri {
        pool.index_of(uri).ok_or_else(|| {
            XmlError::MalformedDocument("Missing element namespace URI string".into())
        })?
    } else {
        NO_ENTRY_INDEX
    };
    let name_idx = pool
        .index_of(&element.tag)
        .ok_or_else(|| XmlError::MalformedDocument("Missing element tag string".into()))?;
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    write_u16(buf, 20); // attributeStart
    write_u16(buf, 20); // attributeSize
    write_u16(buf, element.attributes.len() as u16);
    write_u16(buf, 0); // idIndex
    write_u16(buf, 0); // classIndex
    write_u16(buf, 0); // styleIndex
    for attr in &element.attributes {
        write_attribute(buf, attr, pool)?;
    }
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_end_element(
    buf: &mut Vec<u8>,
    element: &XmlElement,
    pool: &StringPoolBuilder,
) -> XmlResult<()> {
    let chunk_start = begin_chunk(buf, RES_XML_END_ELEMENT_TYPE, 16);
    write_u32(buf, 0);
    write_u32(buf, NO_ENTRY_INDEX);
    let ns_idx = if let Some(uri) = &element.namespace_uri {
        pool.index_of(uri).ok_or_else(|| {
            XmlError::MalformedDocument("Missing element namespace URI string".into())
        })?
    } else {
        NO_ENTRY_INDEX
    };
    let name_idx = pool
        .index_of(&element.tag)
        .ok_or_else(|| XmlError::MalformedDocument("Missing element tag string".into()))?;
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_cdata(buf: &mut Vec<u8>, text: &str, pool: &StringPoolBuilder) -> XmlResult<()> {
    let idx = pool
        .index_of(text)
        .ok_or_else(|| XmlError::MalformedDocument("Missing CDATA text string".into()))?;
    let chunk_start = begin_chunk(buf, RES_XML_CDATA_TYPE, 16);
    write_u32(buf, 0);
    write_u32(buf, NO_ENTRY_INDEX);
    write_u32(buf, idx);
    write_u16(buf, 8);
    write_u8(buf, 0);
    write_u8(buf, TYPE_STRING);
    write_u32(buf, idx);
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_attribute(
    buf: &mut Vec<u8>,
    attr: &XmlAttribute,
    pool: &StringPoolBuilder,
) -> XmlResult<()> {
    let ns_idx = if let Some(uri) = &attr.namespace_uri {
        pool.index_of(uri).ok_or_else(|| {
            XmlError::MalformedDocument("Missing attribute namespace URI string".into())
        })?
    } else {
        NO_ENTRY_INDEX
    };
    let name_idx = pool
        .index_of(&attr.name)
        .ok_or_else(|| XmlError::MalformedDocument("Missing attribute name string".into()))?;
    // Only string values carry a raw-text index; typed values keep their
    // binary encoding authoritative.
    let raw_idx = match &attr.value {
        XmlValue::String(text) => pool
            .index_of(text)
            .ok_or_else(|| XmlError::MalformedDocument("Missing raw attribute string".into()))?,
        _ => NO_ENTRY_INDEX,
    };
    let (data_type, data_value) = attr.value.encode(pool)?;
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    write_u32(buf, raw_idx);
    write_u16(buf, 8);
    write_u8(buf, 0);
    write_u8(buf, data_type);
    write_u32(buf, data_value);
    Ok(())
}

fn write_element_xml(
    element: &XmlElement,
    writer: &mut Writer<Vec<u8>>,
    namespaces: &[NamespaceDecl],
    is_root: bool,
) -> XmlResult<()> {
    let element_name = qualified_name(element.namespace_prefix.as_deref(), &element.tag);
    let mut attr_storage = Vec::new();
    if is_root {
        for decl in namespaces {
            let attr_name = if decl.prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{}", decl.prefix)
            };
            attr_storage.push((attr_name, decl.uri.clone()));
        }
    }
    for attr in &element.attributes {
        let name = qualified_name(attr.namespace_prefix.as_deref(), &attr.name);
        let value = attr.value.to_text().into_owned();
        attr_storage.push((name, value));
    }
    let mut start = BytesStart::new(element_name.as_str());
    for (key, value) in &attr_storage {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    writer.write_event(Event::Start(start))?;
    if let Some(text) = &element.text {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    for child in &element.children {
        write_element_xml(child, writer, namespaces, false)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element_name.as_str())))?;
    Ok(())
}

/// High-level representation of a compiled `AndroidManifest.xml`.
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    root: XmlElement,
}

impl Manifest {
    pub fn new() -> Self {
        Manifest {
            root: XmlElement::new("manifest"),
        }
    }

    pub fn from_root(root: XmlElement) -> Self {
        Manifest { root }
    }

    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut XmlElement {
        &mut self.root
    }

    pub fn package_name(&self) -> Option<&str> {
        self.root
            .find_attribute_by_name("package")
            .and_then(|attr| attr.value.as_str())
    }

    /// The `split` attribute split APK manifests carry on the root element.
    pub fn split_name(&self) -> Option<&str> {
        self.root
            .find_attribute_by_name("split")
            .and_then(|attr| attr.value.as_str())
    }

    pub fn application(&self) -> Option<&XmlElement> {
        self.root.find_child("application")
    }

    pub fn application_mut(&mut self) -> Option<&mut XmlElement> {
        self.root.find_child_mut("application")
    }

    /// Whether any `<activity>`/`<activity-alias>` declares a MAIN/LAUNCHER
    /// intent filter. Base modules carry the launcher; config splits do not.
    pub fn has_launchable_activity(&self) -> bool {
        let Some(application) = self.application() else {
            return false;
        };
        application
            .children
            .iter()
            .filter(|child| child.tag == "activity" || child.tag == "activity-alias")
            .any(|activity| {
                activity.children_by_tag("intent-filter").any(|filter| {
                    let has_main = filter.children_by_tag("action").any(|action| {
                        action.string_value_by_id(ATTR_NAME)
                            == Some("android.intent.action.MAIN")
                    });
                    let has_launcher = filter.children_by_tag("category").any(|category| {
                        category.string_value_by_id(ATTR_NAME)
                            == Some("android.intent.category.LAUNCHER")
                    });
                    has_main && has_launcher
                })
            })
    }

    /// Remove the attribute from every element of the tree, by resource id.
    /// Returns how many elements lost the attribute.
    pub fn remove_attribute_everywhere_by_id(&mut self, id: u32) -> usize {
        self.root.remove_attribute_recursive_by_id(id)
    }

    /// Remove the attribute from every element of the tree, by local name.
    /// Compiled attributes may carry only a literal name, so sanitization
    /// checks both forms.
    pub fn remove_attribute_everywhere_by_name(&mut self, name: &str) -> usize {
        self.root.remove_attribute_recursive_by_name(name)
    }

    /// Current `android:extractNativeLibs` value on `<application>`.
    pub fn extract_native_libs(&self) -> Option<bool> {
        self.application()?
            .find_attribute_by_id(ATTR_EXTRACT_NATIVE_LIBS)
            .and_then(|attr| attr.value.as_bool())
    }

    /// Set or clear `android:extractNativeLibs` on `<application>`. `None`
    /// removes the attribute. Without an application element this is a no-op.
    pub fn set_extract_native_libs(&mut self, value: Option<bool>) {
        let Some(application) = self.application_mut() else {
            return;
        };
        match value {
            Some(flag) => {
                application.set_attribute(XmlAttribute::android(
                    ATTR_EXTRACT_NATIVE_LIBS,
                    "extractNativeLibs",
                    flag,
                ));
            }
            None => {
                application.remove_attribute_by_id(ATTR_EXTRACT_NATIVE_LIBS);
                application.remove_attribute_by_name("extractNativeLibs");
            }
        }
    }

    /// Decode a compiled manifest.
    pub fn from_bytes(bytes: &[u8]) -> XmlResult<Self> {
        let mut reader = BinaryReader::new(bytes);
        let xml_header = read_chunk_header(&mut reader)?;
        if xml_header.chunk_type != RES_XML_TYPE {
            return Err(XmlError::MalformedDocument(
                "Binary XML does not start with RES_XML_TYPE header".to_string(),
            ));
        }

        let xml_end = xml_header.end();
        reader.seek(xml_header.start + xml_header.header_size as usize)?;

        let mut resource_map = Vec::new();
        let mut string_pool: Option<StringPool> = None;
        let mut namespaces: Vec<NamespaceFrame> = Vec::new();
        let mut element_stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        while reader.position() < xml_end {
            let chunk_header = read_chunk_header(&mut reader)?;
            let chunk_end = chunk_header.end();
            match chunk_header.chunk_type {
                RES_STRING_POOL_TYPE => {
                    string_pool = Some(StringPool::parse(&mut reader, &chunk_header)?);
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    let mut ids = Vec::new();
                    while reader.position() < chunk_end {
                        ids.push(reader.read_u32()?);
                    }
                    resource_map = ids;
                }
                RES_XML_START_NAMESPACE_TYPE => {
                    let pool = string_pool.as_ref().ok_or_else(|| {
                        XmlError::MalformedDocument(
                            "Namespace chunk encountered before string pool".to_string(),
                        )
                    })?;
                    reader.read_u32()?; // line number
                    reader.read_u32()?; // comment
                    let prefix_idx = reader.read_u32()?;
                    let uri_idx = reader.read_u32()?;
                    let prefix = pool.get(prefix_idx).map(|s| s.to_string());
                    let uri = pool.get(uri_idx).map(|s| s.to_string());
                    namespaces.push(NamespaceFrame { prefix, uri });
                }
                RES_XML_END_NAMESPACE_TYPE => {
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    namespaces.pop();
                }
                RES_XML_START_ELEMENT_TYPE => {
                    let pool = string_pool.as_ref().ok_or_else(|| {
                        XmlError::MalformedDocument(
                            "Start element encountered before string pool".to_string(),
                        )
                    })?;

                    reader.read_u32()?; // line number
                    reader.read_u32()?; // comment index
                    let ns_idx = reader.read_u32()?;
                    let name_idx = reader.read_u32()?;
                    reader.read_u16()?; // attributeStart
                    reader.read_u16()?; // attributeSize
                    let attr_count = reader.read_u16()? as usize;
                    reader.read_u16()?; // idIndex
                    reader.read_u16()?; // classIndex
                    reader.read_u16()?; // styleIndex

                    let tag_name = pool
                        .get(name_idx)
                        .ok_or_else(|| {
                            XmlError::MalformedDocument(
                                "Element references invalid string index".to_string(),
                            )
                        })?
                        .to_string();

                    let namespace_uri = pool.get(ns_idx).map(|s| s.to_string());
                    let namespace_prefix = resolve_prefix(&namespaces, namespace_uri.as_deref());
                    let mut element = XmlElement::new(tag_name);
                    element.namespace_prefix = namespace_prefix;
                    element.namespace_uri = namespace_uri;

                    let mut attributes = Vec::with_capacity(attr_count);
                    for _ in 0..attr_count {
                        let attr_ns_idx = reader.read_u32()?;
                        let attr_name_idx = reader.read_u32()?;
                        let _raw_value_idx = reader.read_u32()?;
                        let value_size = reader.read_u16()?;
                        reader.read_u8()?; // res0
                        let data_type = reader.read_u8()?;
                        let data = reader.read_u32()?;
                        if value_size != 8 {
                            return Err(XmlError::MalformedDocument(
                                "Attribute value size must be 8".to_string(),
                            ));
                        }
                        let attr_name = pool
                            .get(attr_name_idx)
                            .ok_or_else(|| {
                                XmlError::MalformedDocument(
                                    "Attribute name references invalid string index".to_string(),
                                )
                            })?
                            .to_string();
                        let attr_namespace_uri = pool.get(attr_ns_idx).map(|s| s.to_string());
                        let attr_namespace =
                            resolve_prefix(&namespaces, attr_namespace_uri.as_deref());
                        let value = XmlValue::decode(pool, data_type, data)?;
                        let resource_id = resource_map
                            .get(attr_name_idx as usize)
                            .copied()
                            .filter(|id| *id != 0);
                        attributes.push(XmlAttribute {
                            namespace_prefix: attr_namespace,
                            namespace_uri: attr_namespace_uri,
                            resource_id,
                            name: attr_name,
                            value,
                        });
                    }
                    element.attributes = attributes;
                    element_stack.push(element);
                }
                RES_XML_END_ELEMENT_TYPE => {
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    if let Some(element) = element_stack.pop() {
                        if let Some(parent) = element_stack.last_mut() {
                            parent.children.push(element);
                        } else {
                            root = Some(element);
                        }
                    } else {
                        return Err(XmlError::MalformedDocument(
                            "End element without matching start".to_string(),
                        ));
                    }
                }
                RES_XML_CDATA_TYPE => {
                    let pool = string_pool.as_ref().ok_or_else(|| {
                        XmlError::MalformedDocument(
                            "CDATA encountered before string pool".to_string(),
                        )
                    })?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    let data_idx = reader.read_u32()?;
                    let value_size = reader.read_u16()?;
                    reader.read_u8()?;
                    let data_type = reader.read_u8()?;
                    let data = reader.read_u32()?;
                    if value_size != 8 {
                        return Err(XmlError::MalformedDocument(
                            "CDATA value size must be 8".to_string(),
                        ));
                    }
                    if let Some(text) = pool.get(data_idx).map(|s| s.to_string()).or_else(|| {
                        if data_type == TYPE_STRING {
                            pool.get(data).map(|s| s.to_string())
                        } else {
                            None
                        }
                    }) {
                        if let Some(current) = element_stack.last_mut() {
                            current.text = Some(text);
                        }
                    }
                }
                _ => {
                    // Unknown chunk type; skip over it for forward compatibility.
                }
            }
            reader.seek(chunk_end)?;
        }

        if !element_stack.is_empty() {
            return Err(XmlError::MalformedDocument(
                "Unclosed XML elements at end of document".to_string(),
            ));
        }

        let root = root
            .ok_or_else(|| XmlError::MalformedDocument("AndroidManifest is empty".to_string()))?;

        Ok(Manifest { root })
    }

    /// Re-encode the tree to the compiled chunk format.
    ///
    /// The string pool places resource-mapped attribute names first so the
    /// emitted resource-map chunk aligns index-for-index; attribute ids then
    /// survive a parse of the output. Untouched trees round-trip
    /// byte-identically through serialize → parse → serialize.
    pub fn to_bytes(&self) -> XmlResult<Vec<u8>> {
        let mut mapped_names = Vec::new();
        collect_resource_mapped_names(&self.root, &mut mapped_names);

        let namespaces = collect_namespace_declarations(&self.root);
        let mut pool_builder = StringPoolBuilder::new();
        for (name, _) in &mapped_names {
            pool_builder.intern(name);
        }
        for decl in &namespaces {
            pool_builder.intern(&decl.prefix);
            pool_builder.intern(&decl.uri);
        }
        collect_element_strings(&self.root, &mut pool_builder);
        let string_chunk = pool_builder.to_chunk();

        let mut body = Vec::new();
        for decl in &namespaces {
            write_namespace_chunk(&mut body, &pool_builder, decl, true)?;
        }
        write_element_recursive(&self.root, &mut body, &pool_builder)?;
        for decl in namespaces.iter().rev() {
            write_namespace_chunk(&mut body, &pool_builder, decl, false)?;
        }

        let mut map_chunk = Vec::new();
        if !mapped_names.is_empty() {
            let map_start = begin_chunk(&mut map_chunk, RES_XML_RESOURCE_MAP_TYPE, 8);
            for (_, id) in &mapped_names {
                write_u32(&mut map_chunk, *id);
            }
            finalize_chunk(&mut map_chunk, map_start);
        }

        let mut document = Vec::new();
        let xml_start = begin_chunk(&mut document, RES_XML_TYPE, 8);
        document.extend_from_slice(&string_chunk);
        document.extend_from_slice(&map_chunk);
        document.extend_from_slice(&body);
        finalize_chunk(&mut document, xml_start);
        Ok(document)
    }

    /// Render the tree as readable XML for logs and debugging.
    pub fn to_document_string(&self) -> XmlResult<String> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        let namespaces = collect_namespace_declarations(&self.root);
        write_element_xml(&self.root, &mut writer, &namespaces, true)?;
        let bytes = writer.into_inner();
        String::from_utf8(bytes).map_err(|err| XmlError::MalformedDocument(err.to_string()))
    }

    pub fn from_archive_entry(entry: &ArchiveEntry) -> XmlResult<Self> {
        Self::from_bytes(&entry.data)
    }

    pub fn to_archive_entry(&self, template: Option<&ArchiveEntry>) -> XmlResult<ArchiveEntry> {
        let data = self.to_bytes()?;
        let mut entry = ArchiveEntry::new(data);
        if let Some(template) = template {
            entry.unix_mode = template.unix_mode;
            entry.compression = template.compression;
            entry.dos_time = template.dos_time;
        } else {
            entry.compression = Some(EntryCompression::Deflated);
        }
        Ok(entry)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_manifest() -> Manifest {
        let mut root = XmlElement::new("manifest");
        root.set_attribute(XmlAttribute::new("package", "com.example.app"));
        root.set_attribute(XmlAttribute::new("split", "config.arm64_v8a"));
        root.set_attribute(XmlAttribute::android(
            ATTR_IS_SPLIT_REQUIRED,
            NAME_IS_SPLIT_REQUIRED,
            true,
        ));
        root.set_attribute(XmlAttribute::new(NAME_SPLIT_TYPES, "density"));

        let mut application = XmlElement::new("application");
        application.set_attribute(XmlAttribute::android(
            ATTR_IS_SPLIT_REQUIRED,
            NAME_IS_SPLIT_REQUIRED,
            true,
        ));

        let mut meta = XmlElement::new("meta-data");
        meta.set_attribute(XmlAttribute::android(
            ATTR_NAME,
            "name",
            SPLIT_MARKER_NAMES[0],
        ));
        meta.set_attribute(XmlAttribute {
            namespace_prefix: Some("android".to_string()),
            namespace_uri: Some(ANDROID_NAMESPACE_URI.to_string()),
            resource_id: Some(ATTR_RESOURCE),
            name: "resource".to_string(),
            value: XmlValue::Reference(0x7f02_0000),
        });
        application.append_child(meta);

        let mut activity = XmlElement::new("activity");
        activity.set_attribute(XmlAttribute::android(
            ATTR_NAME,
            "name",
            "com.example.app.MainActivity",
        ));
        let mut filter = XmlElement::new("intent-filter");
        let mut action = XmlElement::new("action");
        action.set_attribute(XmlAttribute::android(
            ATTR_NAME,
            "name",
            "android.intent.action.MAIN",
        ));
        let mut category = XmlElement::new("category");
        category.set_attribute(XmlAttribute::android(
            ATTR_NAME,
            "name",
            "android.intent.category.LAUNCHER",
        ));
        filter.append_child(action);
        filter.append_child(category);
        activity.append_child(filter);
        application.append_child(activity);

        root.append_child(application);
        Manifest::from_root(root)
    }

    #[test]
    fn roundtrip_preserves_tree_and_ids() {
        let manifest = split_manifest();
        let bytes = manifest.to_bytes().unwrap();
        let reparsed = Manifest::from_bytes(&bytes).unwrap();
        assert_eq!(reparsed.package_name(), Some("com.example.app"));
        assert_eq!(reparsed.split_name(), Some("config.arm64_v8a"));

        let app = reparsed.application().unwrap();
        let meta = app.find_child("meta-data").unwrap();
        assert_eq!(
            meta.string_value_by_id(ATTR_NAME),
            Some(SPLIT_MARKER_NAMES[0])
        );
        assert_eq!(
            meta.find_attribute_by_id(ATTR_RESOURCE)
                .and_then(|attr| attr.value.as_reference_id()),
            Some(0x7f02_0000)
        );
        assert_eq!(
            app.find_attribute_by_id(ATTR_IS_SPLIT_REQUIRED)
                .and_then(|attr| attr.value.as_bool()),
            Some(true)
        );
    }

    #[test]
    fn roundtrip_is_byte_identical_when_untouched() {
        let manifest = split_manifest();
        let first = manifest.to_bytes().unwrap();
        let second = Manifest::from_bytes(&first).unwrap().to_bytes().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn removes_attribute_by_id_and_name_everywhere() {
        let mut manifest = split_manifest();
        let by_id = manifest.remove_attribute_everywhere_by_id(ATTR_IS_SPLIT_REQUIRED);
        assert_eq!(by_id, 2);
        let by_name = manifest.remove_attribute_everywhere_by_name(NAME_SPLIT_TYPES);
        assert_eq!(by_name, 1);
        assert!(manifest
            .root()
            .find_attribute_by_name(NAME_IS_SPLIT_REQUIRED)
            .is_none());
    }

    #[test]
    fn finds_split_marker_meta_data() {
        let manifest = split_manifest();
        let app = manifest.application().unwrap();
        let hits = app.children_with_attribute("meta-data", ATTR_NAME, &SPLIT_MARKER_NAMES);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn detects_launchable_activity() {
        let manifest = split_manifest();
        assert!(manifest.has_launchable_activity());
        let mut bare = Manifest::new();
        bare.root_mut().append_child(XmlElement::new("application"));
        assert!(!bare.has_launchable_activity());
    }

    #[test]
    fn extract_native_libs_set_and_clear() {
        let mut manifest = split_manifest();
        manifest.set_extract_native_libs(Some(false));
        assert_eq!(manifest.extract_native_libs(), Some(false));
        manifest.set_extract_native_libs(None);
        assert_eq!(manifest.extract_native_libs(), None);

        // No application element: silently a no-op.
        let mut bare = Manifest::new();
        bare.set_extract_native_libs(Some(true));
        assert_eq!(bare.extract_native_libs(), None);
    }

    #[test]
    fn renders_readable_xml() {
        let manifest = split_manifest();
        let text = manifest.to_document_string().unwrap();
        assert!(text.contains("<manifest"));
        assert!(text.contains("com.android.vending.splits"));
        assert!(text.contains("@0x7f020000"));
    }

    #[test]
    fn rejects_truncated_document() {
        let manifest = split_manifest();
        let bytes = manifest.to_bytes().unwrap();
        let err = Manifest::from_bytes(&bytes[..bytes.len() / 2]);
        assert!(err.is_err());
    }
}
