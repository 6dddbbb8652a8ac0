use crate::archive::Archive;
use crate::arsc::{ResourceTable, TableError};
use crate::axml::{Manifest, XmlError};
use crate::error::{MergeError, MergeResult};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Archive entry holding the compiled manifest.
pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";
/// Archive entry holding the compiled resource table.
pub const TABLE_ENTRY: &str = "resources.arsc";
/// Default resources root directory inside an APK.
pub const DEFAULT_RES_DIR: &str = "res";

static SIGNATURE_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^META-INF/.+\.(([MS]F)|(RSA))$").expect("signature entry pattern")
});

const SIGNATURE_STAMP_ENTRY: &str = "stamp-cert-sha256";

/// One APK's unit of work: an archive plus lazily-parsed manifest and
/// resource-table views over its `AndroidManifest.xml` / `resources.arsc`
/// entries. Mutating the views does not touch the archive until a refresh
/// re-serializes them back into entries.
pub struct ApkModule {
    name: String,
    pub(crate) archive: Archive,
    pub(crate) manifest: Option<Manifest>,
    pub(crate) table: Option<ResourceTable>,
}

impl ApkModule {
    pub fn new(name: impl Into<String>, archive: Archive) -> Self {
        ApkModule {
            name: name.into(),
            archive,
            manifest: None,
            table: None,
        }
    }

    /// Load a module from an APK file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> MergeResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let archive = Archive::read_file(path)?;
        debug!("loaded module '{name}' with {} entries", archive.len());
        Ok(ApkModule::new(name, archive))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn has_manifest(&self) -> bool {
        self.manifest.is_some() || self.archive.contains(MANIFEST_ENTRY)
    }

    pub fn has_table(&self) -> bool {
        self.table.is_some() || self.archive.contains(TABLE_ENTRY)
    }

    pub(crate) fn ensure_manifest(&mut self) -> MergeResult<()> {
        if self.manifest.is_some() {
            return Ok(());
        }
        let entry = self.archive.get(MANIFEST_ENTRY).ok_or_else(|| {
            MergeError::Manifest(XmlError::MalformedDocument(format!(
                "Module '{}' has no {MANIFEST_ENTRY}",
                self.name
            )))
        })?;
        self.manifest = Some(Manifest::from_archive_entry(entry)?);
        Ok(())
    }

    pub(crate) fn ensure_table(&mut self) -> MergeResult<()> {
        if self.table.is_some() {
            return Ok(());
        }
        let entry = self.archive.get(TABLE_ENTRY).ok_or_else(|| {
            MergeError::Table(TableError::MalformedTable(format!(
                "Module '{}' has no {TABLE_ENTRY}",
                self.name
            )))
        })?;
        self.table = Some(ResourceTable::from_bytes(&entry.data)?);
        Ok(())
    }

    /// Parse-on-first-access manifest view.
    pub fn manifest(&mut self) -> MergeResult<&Manifest> {
        self.ensure_manifest()?;
        self.manifest.as_ref().ok_or_else(|| {
            MergeError::Manifest(XmlError::MalformedDocument("Manifest view lost".to_string()))
        })
    }

    pub fn manifest_mut(&mut self) -> MergeResult<&mut Manifest> {
        self.ensure_manifest()?;
        self.manifest.as_mut().ok_or_else(|| {
            MergeError::Manifest(XmlError::MalformedDocument("Manifest view lost".to_string()))
        })
    }

    /// Parse-on-first-access resource table view.
    pub fn table(&mut self) -> MergeResult<&ResourceTable> {
        self.ensure_table()?;
        self.table.as_ref().ok_or_else(|| {
            MergeError::Table(TableError::MalformedTable("Table view lost".to_string()))
        })
    }

    pub fn table_mut(&mut self) -> MergeResult<&mut ResourceTable> {
        self.ensure_table()?;
        self.table.as_mut().ok_or_else(|| {
            MergeError::Table(TableError::MalformedTable("Table view lost".to_string()))
        })
    }

    /// Whether this module looks like the bundle's base: it carries the
    /// launcher activity, or at least a manifest without a `split` marker.
    pub fn is_base_module(&mut self) -> bool {
        if !self.has_manifest() {
            return false;
        }
        match self.manifest() {
            Ok(manifest) => {
                manifest.has_launchable_activity() || manifest.split_name().is_none()
            }
            Err(_) => false,
        }
    }

    /// Re-serialize the cached manifest view into the archive entry.
    /// Idempotent; a no-op when the manifest was never parsed.
    pub fn refresh_manifest(&mut self) -> MergeResult<()> {
        let Some(manifest) = &self.manifest else {
            return Ok(());
        };
        let entry = manifest.to_archive_entry(self.archive.get(MANIFEST_ENTRY))?;
        self.archive.put(MANIFEST_ENTRY, entry)?;
        Ok(())
    }

    /// Re-serialize the cached table view into the archive entry.
    /// Idempotent; a no-op when the table was never parsed.
    pub fn refresh_table(&mut self) -> MergeResult<()> {
        let Some(table) = &self.table else {
            return Ok(());
        };
        let data = table.to_bytes()?;
        let mut entry = crate::archive::ArchiveEntry::new(data);
        if let Some(existing) = self.archive.get(TABLE_ENTRY) {
            entry.unix_mode = existing.unix_mode;
            entry.compression = existing.compression;
            entry.dos_time = existing.dos_time;
        }
        self.archive.put(TABLE_ENTRY, entry)?;
        Ok(())
    }

    /// Rename the resources root directory (`res/` by default) across all
    /// archive entries and every file-backed resource path in the table.
    /// The two renames must stay consistent or resource lookup breaks at
    /// install time.
    pub fn set_resources_root_dir(&mut self, dir_name: &str) -> MergeResult<()> {
        if dir_name.is_empty() || dir_name == DEFAULT_RES_DIR {
            return Ok(());
        }
        let moved = self.archive.rename_prefix(DEFAULT_RES_DIR, dir_name);
        let rewritten = if self.has_table() {
            self.table_mut()?.rewrite_path_prefix(DEFAULT_RES_DIR, dir_name)
        } else {
            0
        };
        debug!("resources root rename: {moved} archive entries, {rewritten} table paths");
        Ok(())
    }

    /// Check that every file-backed resource entry resolves to an existing
    /// archive entry. A merged bundle failing this is broken input.
    pub fn validate_resources_dir(&mut self) -> MergeResult<()> {
        if !self.has_table() {
            return Ok(());
        }
        self.ensure_table()?;
        let Some(table) = &self.table else {
            return Ok(());
        };
        let mut missing = Vec::new();
        for package in &table.packages {
            for spec in &package.specs {
                for chunk in &spec.configs {
                    for slot in chunk.entries.iter().flatten() {
                        if let crate::arsc::EntryValue::Single(value) = &slot.value {
                            if let Some(path) =
                                value.as_string_index().and_then(|idx| table.string(idx))
                            {
                                if looks_like_entry_path(path) && !self.archive.contains(path) {
                                    missing.push(path.to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MergeError::Table(TableError::MalformedTable(format!(
                "File-backed resources without archive entries: {}",
                missing.join(", ")
            ))))
        }
    }

    /// Current `android:extractNativeLibs` value, `None` when the module
    /// has no manifest or the attribute is unset.
    pub fn extract_native_libs(&mut self) -> MergeResult<Option<bool>> {
        if !self.has_manifest() {
            return Ok(None);
        }
        Ok(self.manifest()?.extract_native_libs())
    }

    /// Set or clear `android:extractNativeLibs`. A module without a
    /// manifest leaves the setting unset rather than erroring.
    pub fn set_extract_native_libs(&mut self, value: Option<bool>) -> MergeResult<()> {
        if !self.has_manifest() {
            return Ok(());
        }
        self.manifest_mut()?.set_extract_native_libs(value);
        Ok(())
    }

    /// Drop signature-related entries (`META-INF/*.MF|*.SF|*.RSA` and the
    /// source stamp). Returns the number of removed entries.
    pub fn remove_signature_entries(&mut self) -> usize {
        let mut removed = self.archive.remove_matching(&SIGNATURE_ENTRY);
        if self.archive.remove(SIGNATURE_STAMP_ENTRY) {
            removed += 1;
        }
        removed
    }

    /// Write the archive out as an APK. Mutated manifest/table views must
    /// have been refreshed first; the archive is stale until then.
    pub fn write_apk(&self, path: impl AsRef<Path>) -> MergeResult<()> {
        self.archive.write_file(path)?;
        Ok(())
    }
}

/// String values that plausibly name an archive entry: a relative path with
/// at least one directory and a file extension. Plain display strings that
/// happen to contain a slash do not qualify.
fn looks_like_entry_path(value: &str) -> bool {
    if value.contains(' ') || value.starts_with('/') {
        return false;
    }
    match value.rsplit_once('/') {
        Some((_, file)) => file.contains('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveEntry;
    use crate::arsc::{
        resource_id, ConfigBlock, EntryFlags, EntryValue, TableEntry, TablePackage, TableValue,
    };
    use crate::axml::{XmlAttribute, XmlElement};

    fn module_with_resources() -> ApkModule {
        let mut manifest = Manifest::new();
        manifest
            .root_mut()
            .set_attribute(XmlAttribute::new("package", "com.example.app"));
        manifest.root_mut().append_child(XmlElement::new("application"));

        let mut table = ResourceTable::new();
        table.add_package(TablePackage::new(0x7f, "com.example.app"));
        table.package_mut(0x7f).unwrap().ensure_type_name(1, "drawable");
        let path = table.intern_string("res/drawable/icon.png");
        let key = table.package_mut(0x7f).unwrap().intern_key("icon");
        table
            .put_entry(
                0x7f,
                1,
                0,
                &ConfigBlock::default_config(),
                TableEntry {
                    flags: EntryFlags::empty(),
                    key,
                    value: EntryValue::Single(TableValue::StringRef(path)),
                },
            )
            .unwrap();

        let mut archive = Archive::new();
        archive
            .put(
                MANIFEST_ENTRY,
                ArchiveEntry::new(manifest.to_bytes().unwrap()),
            )
            .unwrap();
        archive
            .put(TABLE_ENTRY, ArchiveEntry::new(table.to_bytes().unwrap()))
            .unwrap();
        archive
            .put("res/drawable/icon.png", ArchiveEntry::new(vec![0x89, 0x50]))
            .unwrap();
        archive
            .put("META-INF/CERT.RSA", ArchiveEntry::new(vec![1]))
            .unwrap();
        ApkModule::new("base", archive)
    }

    #[test]
    fn lazy_views_parse_once_and_refresh_is_idempotent() {
        let mut module = module_with_resources();
        assert!(module.manifest.is_none());
        assert_eq!(module.manifest().unwrap().package_name(), Some("com.example.app"));
        assert!(module.manifest.is_some());

        module.refresh_manifest().unwrap();
        let first = module.archive.get(MANIFEST_ENTRY).unwrap().data.clone();
        module.refresh_manifest().unwrap();
        let second = module.archive.get(MANIFEST_ENTRY).unwrap().data.clone();
        assert_eq!(first, second);

        module.refresh_table().unwrap();
        module.refresh_table().unwrap();
    }

    #[test]
    fn resources_root_rename_keeps_archive_and_table_consistent() {
        let mut module = module_with_resources();
        module.ensure_table().unwrap();
        module.set_resources_root_dir("r").unwrap();
        assert!(module.archive.contains("r/drawable/icon.png"));
        assert!(!module.archive.contains("res/drawable/icon.png"));
        let table = module.table().unwrap();
        let loc = table.entry_locations(resource_id(0x7f, 1, 0))[0];
        assert_eq!(table.resolve_file_path(loc), Some("r/drawable/icon.png"));
        module.validate_resources_dir().unwrap();
    }

    #[test]
    fn validate_resources_dir_reports_missing_files() {
        let mut module = module_with_resources();
        module.archive.remove("res/drawable/icon.png");
        assert!(module.validate_resources_dir().is_err());
    }

    #[test]
    fn extract_native_libs_without_manifest_is_left_unset() {
        let mut module = ApkModule::new("empty", Archive::new());
        module.set_extract_native_libs(Some(true)).unwrap();
        assert_eq!(module.extract_native_libs().unwrap(), None);
    }

    #[test]
    fn signature_entries_are_removed() {
        let mut module = module_with_resources();
        let removed = module.remove_signature_entries();
        assert_eq!(removed, 1);
        assert!(!module.archive.contains("META-INF/CERT.RSA"));
    }
}
