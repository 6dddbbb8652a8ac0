use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::read::ZipArchive;

/// Result alias for APK (ZIP) container operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors surfaced by the APK container model.
#[derive(Debug)]
pub enum ArchiveError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    InvalidInput(String),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io(err) => write!(f, "I/O error: {err}"),
            ArchiveError::Zip(err) => write!(f, "ZIP error: {err}"),
            ArchiveError::InvalidInput(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<io::Error> for ArchiveError {
    fn from(value: io::Error) -> Self {
        ArchiveError::Io(value)
    }
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(value: zip::result::ZipError) -> Self {
        ArchiveError::Zip(value)
    }
}

/// Compression preference for an archive entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryCompression {
    Stored,
    Deflated,
}

/// A single file entry stored in an [`Archive`].
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub data: Vec<u8>,
    pub unix_mode: Option<u32>,
    pub compression: Option<EntryCompression>,
    /// MS-DOS (time, date) pair from the source zip, preserved on rewrite.
    pub dos_time: Option<(u16, u16)>,
}

impl ArchiveEntry {
    pub fn new(data: Vec<u8>) -> Self {
        ArchiveEntry {
            data,
            unix_mode: None,
            compression: None,
            dos_time: None,
        }
    }

    pub fn with_mode(mut self, mode: Option<u32>) -> Self {
        self.unix_mode = mode;
        self
    }

    pub fn with_compression(mut self, compression: Option<EntryCompression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_dos_time(mut self, dos_time: Option<(u16, u16)>) -> Self {
        self.dos_time = dos_time;
        self
    }

    /// Uncompressed payload size.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// An in-memory representation of an APK (ZIP) container.
///
/// Entries are stored in a deterministic `BTreeMap`, so APK contents can be
/// rewritten without touching the host filesystem and without path collisions
/// on case-insensitive platforms. Entry paths are unique within one snapshot.
pub struct Archive {
    entries: BTreeMap<String, ArchiveEntry>,
}

impl Archive {
    pub fn new() -> Self {
        Archive {
            entries: BTreeMap::new(),
        }
    }

    /// Load an APK from disk into memory.
    pub fn read_file(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;
        let mut entries = BTreeMap::new();
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx)?;
            if entry.name().ends_with('/') {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            #[allow(deprecated)]
            let sanitized = entry.sanitized_name();
            let name = path_to_entry_name(&sanitized)?;
            let compression = match entry.compression() {
                zip::CompressionMethod::Stored => Some(EntryCompression::Stored),
                zip::CompressionMethod::Deflated => Some(EntryCompression::Deflated),
                _ => None,
            };
            let stamp = entry.last_modified();
            let archive_entry = ArchiveEntry::new(data)
                .with_mode(entry.unix_mode())
                .with_compression(compression)
                .with_dos_time(Some((stamp.timepart(), stamp.datepart())));
            entries.insert(name, archive_entry);
        }
        Ok(Archive { entries })
    }

    /// Serialize the current entry set to a zip file.
    ///
    /// The archive is staged to a temporary sibling path and renamed into
    /// place once fully written, so a failed write never publishes a
    /// truncated artifact.
    pub fn write_file(&self, path: impl AsRef<Path>) -> ArchiveResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let buffer = self.to_zip_bytes()?;
        let staging = staging_path(path);
        fs::write(&staging, buffer)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    /// Serialize the current entry set into an in-memory zip image.
    pub fn to_zip_bytes(&self) -> ArchiveResult<Vec<u8>> {
        let mut file_names: Vec<_> = self.entries.keys().cloned().collect();
        file_names.sort();
        let mut buffer = Vec::new();
        let mut central_records = Vec::new();

        for name in &file_names {
            let entry = &self.entries[name];
            let plan = plan_entry(name, entry);
            let record = write_local_entry(&mut buffer, name, entry, &plan)?;
            central_records.push(record);
        }

        // Directory records (deterministic order)
        let directory_names = collect_directory_names(&file_names);
        for dir in directory_names {
            let record = write_directory_entry(&mut buffer, &dir)?;
            central_records.push(record);
        }

        let central_start = buffer.len() as u32;
        for record in &central_records {
            write_central_directory_entry(&mut buffer, record);
        }
        let central_size = buffer.len() as u32 - central_start;
        write_end_of_central_directory(
            &mut buffer,
            central_records.len(),
            central_size,
            central_start,
        );
        Ok(buffer)
    }

    /// Iterate over entry names.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    /// Borrow an entry by name (e.g. `AndroidManifest.xml`).
    pub fn get(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArchiveEntry> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace an entry. Last write wins, which is what module
    /// refresh relies on.
    pub fn put(&mut self, name: impl AsRef<str>, entry: ArchiveEntry) -> ArchiveResult<()> {
        let normalized = normalize_entry_name(name.as_ref())?;
        self.entries.insert(normalized, entry);
        Ok(())
    }

    /// Insert an entry only when the path is still vacant. Returns whether
    /// the entry was inserted. Merge folding uses this for its base-wins
    /// collision policy.
    pub fn put_if_absent(
        &mut self,
        name: impl AsRef<str>,
        entry: ArchiveEntry,
    ) -> ArchiveResult<bool> {
        let normalized = normalize_entry_name(name.as_ref())?;
        if self.entries.contains_key(&normalized) {
            return Ok(false);
        }
        self.entries.insert(normalized, entry);
        Ok(true)
    }

    /// Remove an entry by name.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Remove every entry whose full path matches the pattern, returning the
    /// number of removed entries.
    pub fn remove_matching(&mut self, pattern: &Regex) -> usize {
        let before = self.entries.len();
        self.entries.retain(|name, _| !pattern.is_match(name));
        before - self.entries.len()
    }

    /// Consume the archive, yielding its entries in path order.
    pub fn into_entries(self) -> impl Iterator<Item = (String, ArchiveEntry)> {
        self.entries.into_iter()
    }

    /// Rename every entry under `from/` to sit under `to/` instead. Existing
    /// entries at the destination are overwritten.
    pub fn rename_prefix(&mut self, from: &str, to: &str) -> usize {
        let from_prefix = format!("{}/", from.trim_end_matches('/'));
        let to_prefix = format!("{}/", to.trim_end_matches('/'));
        let moved: Vec<String> = self
            .entries
            .keys()
            .filter(|name| name.starts_with(&from_prefix))
            .cloned()
            .collect();
        for name in &moved {
            if let Some(entry) = self.entries.remove(name) {
                let renamed = format!("{}{}", to_prefix, &name[from_prefix.len()..]);
                self.entries.insert(renamed, entry);
            }
        }
        moved.len()
    }
}

impl Default for Archive {
    fn default() -> Self {
        Archive::new()
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out.apk".to_string());
    name.push_str(".tmp");
    target.with_file_name(name)
}

#[derive(Clone, Copy)]
struct EntryPlan {
    compression: EntryCompression,
    alignment: Option<u32>,
}

#[derive(Clone)]
struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    compression: EntryCompression,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    dos_time: (u16, u16),
    local_header_offset: u32,
    external_attrs: u32,
    is_directory: bool,
}

fn plan_entry(name: &str, entry: &ArchiveEntry) -> EntryPlan {
    let mut plan = classify_entry(name);
    if let Some(preferred) = entry.compression {
        plan.compression = preferred;
    }
    if plan.compression != EntryCompression::Stored {
        plan.alignment = None;
    }
    plan
}

fn write_local_entry(
    buf: &mut Vec<u8>,
    name: &str,
    entry: &ArchiveEntry,
    plan: &EntryPlan,
) -> ArchiveResult<CentralDirectoryRecord> {
    let offset = buf.len() as u32;
    let extra_len = if let Some(align) = plan.alignment {
        alignment_padding(offset, name.len(), align)
    } else {
        0
    };

    let (compressed_bytes, compression_method) = match plan.compression {
        EntryCompression::Stored => (entry.data.clone(), 0u16),
        EntryCompression::Deflated => (deflate_bytes(&entry.data)?, 8u16),
    };

    let mut crc = Crc32::new();
    crc.update(&entry.data);
    let crc32 = crc.finalize();
    let (time, date) = entry.dos_time.unwrap_or((0, 0));

    write_u32(buf, 0x04034b50);
    write_u16(buf, 20);
    write_u16(buf, 0);
    write_u16(buf, compression_method);
    write_u16(buf, time);
    write_u16(buf, date);
    write_u32(buf, crc32);
    write_u32(buf, compressed_bytes.len() as u32);
    write_u32(buf, entry.data.len() as u32);
    write_u16(buf, name.as_bytes().len() as u16);
    write_u16(buf, extra_len as u16);
    buf.extend_from_slice(name.as_bytes());
    if extra_len > 0 {
        buf.extend(std::iter::repeat(0u8).take(extra_len as usize));
    }
    buf.extend_from_slice(&compressed_bytes);

    Ok(CentralDirectoryRecord {
        file_name: name.as_bytes().to_vec(),
        compression: plan.compression,
        crc32,
        compressed_size: compressed_bytes.len() as u32,
        uncompressed_size: entry.data.len() as u32,
        dos_time: (time, date),
        local_header_offset: offset,
        external_attrs: entry.unix_mode.unwrap_or(0o644) << 16,
        is_directory: false,
    })
}

fn write_directory_entry(buf: &mut Vec<u8>, name: &str) -> ArchiveResult<CentralDirectoryRecord> {
    let offset = buf.len() as u32;
    write_u32(buf, 0x04034b50);
    write_u16(buf, 10);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, 0);
    write_u32(buf, 0);
    write_u32(buf, 0);
    write_u16(buf, name.as_bytes().len() as u16);
    write_u16(buf, 0);
    buf.extend_from_slice(name.as_bytes());

    Ok(CentralDirectoryRecord {
        file_name: name.as_bytes().to_vec(),
        compression: EntryCompression::Stored,
        crc32: 0,
        compressed_size: 0,
        uncompressed_size: 0,
        dos_time: (0, 0),
        local_header_offset: offset,
        external_attrs: (0o755u32 << 16) | 0x10,
        is_directory: true,
    })
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, 0x02014b50);
    write_u16(buf, 0x031E);
    write_u16(buf, 20);
    write_u16(buf, 0);
    let method = match record.compression {
        EntryCompression::Stored => 0u16,
        EntryCompression::Deflated => 8u16,
    };
    write_u16(buf, method);
    write_u16(buf, record.dos_time.0);
    write_u16(buf, record.dos_time.1);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, if record.is_directory { 0x10 } else { 0 });
    write_u32(buf, record.external_attrs);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(
    buf: &mut Vec<u8>,
    entry_count: usize,
    central_size: u32,
    central_offset: u32,
) {
    write_u32(buf, 0x06054b50);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ArchiveResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn path_to_entry_name(path: &Path) -> ArchiveResult<String> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => components.push(part.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::InvalidInput(format!(
                    "invalid entry path component in {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(ArchiveError::InvalidInput(
                    "entry paths may not contain parent components".to_string(),
                ));
            }
        }
    }
    if components.is_empty() {
        return Err(ArchiveError::InvalidInput(
            "entry name must not be empty".to_string(),
        ));
    }
    Ok(components.join("/"))
}

fn normalize_entry_name(name: &str) -> ArchiveResult<String> {
    path_to_entry_name(Path::new(name))
}

fn collect_directory_names(file_names: &[String]) -> Vec<String> {
    let mut dirs = BTreeSet::new();
    for name in file_names {
        let mut path = PathBuf::new();
        let components: Vec<_> = Path::new(name).components().collect();
        for (idx, component) in components.iter().enumerate() {
            if idx == components.len() - 1 {
                break;
            }
            if let Component::Normal(part) = component {
                path.push(part);
                dirs.insert(format!("{}/", path.to_string_lossy()));
            }
        }
    }
    dirs.into_iter().collect()
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn alignment_padding(offset: u32, name_len: usize, alignment: u32) -> u32 {
    if alignment <= 1 {
        return 0;
    }
    let base = offset as u64 + 30 + name_len as u64;
    let align = alignment as u64;
    ((align - (base % align)) % align) as u32
}

fn classify_entry(name: &str) -> EntryPlan {
    let lower = name.to_ascii_lowercase();
    let compression = if should_store_uncompressed(&lower) {
        EntryCompression::Stored
    } else {
        EntryCompression::Deflated
    };
    let alignment = if compression == EntryCompression::Stored {
        if lower.starts_with("lib/") && lower.ends_with(".so") {
            Some(16 * 1024)
        } else {
            Some(4)
        }
    } else {
        None
    };
    EntryPlan {
        compression,
        alignment,
    }
}

fn should_store_uncompressed(name: &str) -> bool {
    if name == "resources.arsc" {
        return true;
    }
    name.ends_with(".arsc")
        || name.ends_with(".dex")
        || name.ends_with(".so")
        || matches!(
            name.rsplit('.').next(),
            Some(ext)
                if matches!(
                    ext,
                    "png"
                        | "jpg"
                        | "jpeg"
                        | "gif"
                        | "webp"
                        | "heic"
                        | "avif"
                        | "mp3"
                        | "ogg"
                        | "wav"
                        | "aac"
                        | "flac"
                        | "m4a"
                        | "mp4"
                        | "webm"
                        | "mkv"
                        | "ico"
                )
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_archive() -> Archive {
        let mut archive = Archive::new();
        archive
            .put("AndroidManifest.xml", ArchiveEntry::new(vec![1, 2, 3]))
            .unwrap();
        archive
            .put("res/layout/main.xml", ArchiveEntry::new(vec![4, 5]))
            .unwrap();
        archive
            .put("META-INF/CERT.RSA", ArchiveEntry::new(vec![6]))
            .unwrap();
        archive
            .put("META-INF/CERT.SF", ArchiveEntry::new(vec![7]))
            .unwrap();
        archive
            .put("META-INF/services/keep.txt", ArchiveEntry::new(vec![8]))
            .unwrap();
        archive
    }

    #[test]
    fn put_overwrites_and_put_if_absent_keeps_first() {
        let mut archive = Archive::new();
        archive.put("a.txt", ArchiveEntry::new(vec![1])).unwrap();
        archive.put("a.txt", ArchiveEntry::new(vec![2])).unwrap();
        assert_eq!(archive.get("a.txt").unwrap().data, vec![2]);
        let inserted = archive
            .put_if_absent("a.txt", ArchiveEntry::new(vec![3]))
            .unwrap();
        assert!(!inserted);
        assert_eq!(archive.get("a.txt").unwrap().data, vec![2]);
    }

    #[test]
    fn remove_matching_counts_removed_entries() {
        let mut archive = sample_archive();
        let pattern = Regex::new(r"^META-INF/.+\.(([MS]F)|(RSA))$").unwrap();
        let removed = archive.remove_matching(&pattern);
        assert_eq!(removed, 2);
        assert!(archive.contains("META-INF/services/keep.txt"));
        assert!(!archive.contains("META-INF/CERT.RSA"));
    }

    #[test]
    fn rename_prefix_moves_only_matching_entries() {
        let mut archive = sample_archive();
        let moved = archive.rename_prefix("res", "r");
        assert_eq!(moved, 1);
        assert!(archive.contains("r/layout/main.xml"));
        assert!(!archive.contains("res/layout/main.xml"));
        assert!(archive.contains("AndroidManifest.xml"));
    }

    #[test]
    fn rejects_escaping_entry_names() {
        let mut archive = Archive::new();
        assert!(archive.put("../evil", ArchiveEntry::new(vec![])).is_err());
        assert!(archive.put("", ArchiveEntry::new(vec![])).is_err());
    }

    #[test]
    fn zip_image_roundtrips_through_zip_reader() {
        let archive = sample_archive();
        let bytes = archive.to_zip_bytes().unwrap();
        let reader = std::io::Cursor::new(bytes);
        let mut zip = ZipArchive::new(reader).unwrap();
        let mut names = Vec::new();
        for idx in 0..zip.len() {
            let entry = zip.by_index(idx).unwrap();
            if !entry.name().ends_with('/') {
                names.push(entry.name().to_string());
            }
        }
        names.sort();
        let mut expected: Vec<_> = archive.entry_names().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(names, expected);
    }
}
