use crate::axml::{
    ATTR_IS_SPLIT_REQUIRED, ATTR_NAME, ATTR_REQUIRED_SPLIT_TYPES, ATTR_RESOURCE, ATTR_SPLIT_TYPES,
    ATTR_VALUE, NAME_IS_SPLIT_REQUIRED, NAME_REQUIRED_SPLIT_TYPES, NAME_SPLIT_TYPES,
    SPLIT_MARKER_NAMES,
};
use crate::error::MergeResult;
use crate::module::ApkModule;
use log::{debug, info};

/// What a sanitization pass changed. A second pass over an already-clean
/// module reports all zeroes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub attributes_removed: usize,
    pub elements_removed: usize,
    pub table_entries_removed: usize,
    pub files_removed: usize,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        *self == SanitizeReport::default()
    }
}

/// Strip split-bundle metadata from a merged module: the split-type
/// attributes, `isSplitRequired`, and the split-marker `<meta-data>`
/// elements together with the resource entries and archive files they
/// reference. Finishes by refreshing the manifest and table views back
/// into the archive; nothing is written to disk here.
///
/// A module without a manifest is left untouched.
pub fn sanitize(module: &mut ApkModule) -> MergeResult<SanitizeReport> {
    let mut report = SanitizeReport::default();
    if !module.has_manifest() {
        return Ok(report);
    }

    let manifest = module.manifest_mut()?;

    // Compiled attributes may carry a resource id or only a literal name
    // depending on how they were authored; both forms are checked.
    report.attributes_removed += manifest.remove_attribute_everywhere_by_id(ATTR_REQUIRED_SPLIT_TYPES);
    report.attributes_removed += manifest.remove_attribute_everywhere_by_id(ATTR_SPLIT_TYPES);
    report.attributes_removed += manifest.remove_attribute_everywhere_by_name(NAME_REQUIRED_SPLIT_TYPES);
    report.attributes_removed += manifest.remove_attribute_everywhere_by_name(NAME_SPLIT_TYPES);
    report.attributes_removed += manifest.remove_attribute_everywhere_by_id(ATTR_IS_SPLIT_REQUIRED);
    report.attributes_removed += manifest.remove_attribute_everywhere_by_name(NAME_IS_SPLIT_REQUIRED);

    // Without an <application> element the remaining steps have nothing to
    // operate on.
    let marker_plan = match manifest.application() {
        Some(application) => {
            let indices =
                application.children_with_attribute("meta-data", ATTR_NAME, &SPLIT_MARKER_NAMES);
            let references: Vec<Option<u32>> = indices
                .iter()
                .map(|&idx| {
                    let meta = &application.children[idx];
                    meta.find_attribute_by_id(ATTR_VALUE)
                        .or_else(|| meta.find_attribute_by_id(ATTR_RESOURCE))
                        .and_then(|attr| attr.value.as_reference_id())
                })
                .collect();
            Some((indices, references))
        }
        None => None,
    };

    if let Some((indices, references)) = marker_plan {
        // The table entry is only cleaned for the first marker whose value
        // resolves to a REFERENCE; later markers are removed from the tree
        // without repeating the table work.
        if let Some(id) = references.iter().flatten().next().copied() {
            report += remove_splits_table_entry(module, id)?;
        }
        let manifest = module.manifest_mut()?;
        if let Some(application) = manifest.application_mut() {
            for &idx in indices.iter().rev() {
                let element = application.remove_child_at(idx);
                info!(
                    "Removed-element : <{}> name=\"{}\"",
                    element.tag,
                    element.string_value_by_id(ATTR_NAME).unwrap_or_default()
                );
                report.elements_removed += 1;
            }
        }
    }

    module.refresh_manifest()?;
    module.refresh_table()?;
    Ok(report)
}

/// Null every configuration variant of the referenced resource entry,
/// remove the backing archive file of each, and compact the type spec once
/// no configuration defines the id anymore. The entry slot itself is kept
/// vacant rather than destroyed; the resource id may still be referenced
/// from compiled code.
fn remove_splits_table_entry(module: &mut ApkModule, id: u32) -> MergeResult<SanitizeReport> {
    let mut report = SanitizeReport::default();
    if !module.has_table() {
        return Ok(report);
    }
    module.ensure_table()?;

    let plan: Vec<(crate::arsc::EntryLocation, Option<String>)> = {
        let table = module.table()?;
        table
            .entry_locations(id)
            .into_iter()
            .map(|loc| (loc, table.resolve_file_path(loc).map(|p| p.to_string())))
            .collect()
    };
    if plan.is_empty() {
        debug!("split marker references 0x{id:08x} but no table entry defines it");
        return Ok(report);
    }

    for (loc, path) in &plan {
        if let Some(path) = path {
            if module.archive.remove(path) {
                info!("Removed-table-entry : {path}");
                report.files_removed += 1;
            }
        }
        if module.table_mut()?.nullify_entry(*loc) {
            report.table_entries_removed += 1;
        }
    }
    let package_id = (id >> 24) as u8;
    let type_id = ((id >> 16) & 0xFF) as u8;
    let entry_id = (id & 0xFFFF) as u16;
    module.table_mut()?.compact_spec(package_id, type_id, entry_id);
    Ok(report)
}

impl std::ops::AddAssign for SanitizeReport {
    fn add_assign(&mut self, other: SanitizeReport) {
        self.attributes_removed += other.attributes_removed;
        self.elements_removed += other.elements_removed;
        self.table_entries_removed += other.table_entries_removed;
        self.files_removed += other.files_removed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, ArchiveEntry};
    use crate::arsc::{
        resource_id, ConfigBlock, EntryFlags, EntryValue, ResourceTable, TableEntry, TablePackage,
        TableValue,
    };
    use crate::axml::{Manifest, XmlAttribute, XmlElement, XmlValue};
    use crate::module::{MANIFEST_ENTRY, TABLE_ENTRY};

    const SPLITS_RESOURCE_ID: u32 = 0x7f01_0000;

    fn split_bundle_module() -> ApkModule {
        let mut manifest = Manifest::new();
        let root = manifest.root_mut();
        root.set_attribute(XmlAttribute::new("package", "com.example.app"));
        root.set_attribute(XmlAttribute::android(
            ATTR_IS_SPLIT_REQUIRED,
            NAME_IS_SPLIT_REQUIRED,
            true,
        ));
        root.set_attribute(XmlAttribute::new(NAME_REQUIRED_SPLIT_TYPES, "base"));
        root.set_attribute(XmlAttribute::new(NAME_SPLIT_TYPES, "density"));

        let mut application = XmlElement::new("application");
        application.set_attribute(XmlAttribute::android(
            ATTR_IS_SPLIT_REQUIRED,
            NAME_IS_SPLIT_REQUIRED,
            true,
        ));
        let mut splits_meta = XmlElement::new("meta-data");
        splits_meta.set_attribute(XmlAttribute::android(
            ATTR_NAME,
            "name",
            SPLIT_MARKER_NAMES[0],
        ));
        splits_meta.set_attribute(XmlAttribute {
            namespace_prefix: Some("android".to_string()),
            namespace_uri: Some(crate::axml::ANDROID_NAMESPACE_URI.to_string()),
            resource_id: Some(ATTR_RESOURCE),
            name: "resource".to_string(),
            value: XmlValue::Reference(SPLITS_RESOURCE_ID),
        });
        let mut derived_meta = XmlElement::new("meta-data");
        derived_meta.set_attribute(XmlAttribute::android(
            ATTR_NAME,
            "name",
            SPLIT_MARKER_NAMES[1],
        ));
        derived_meta.set_attribute(XmlAttribute::android(ATTR_VALUE, "value", "abcd"));
        application.append_child(splits_meta);
        application.append_child(derived_meta);
        let root = manifest.root_mut();
        root.append_child(application);

        let mut table = ResourceTable::new();
        table.add_package(TablePackage::new(0x7f, "com.example.app"));
        table.package_mut(0x7f).unwrap().ensure_type_name(1, "xml");
        let path = table.intern_string("res/xml/splits0.xml");
        let key = table.package_mut(0x7f).unwrap().intern_key("splits0");
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
            .put(MANIFEST_ENTRY, ArchiveEntry::new(manifest.to_bytes().unwrap()))
            .unwrap();
        archive
            .put(TABLE_ENTRY, ArchiveEntry::new(table.to_bytes().unwrap()))
            .unwrap();
        archive
            .put("res/xml/splits0.xml", ArchiveEntry::new(vec![3, 0, 8, 0]))
            .unwrap();
        ApkModule::new("merged", archive)
    }

    #[test]
    fn strips_split_metadata_and_referenced_resources() {
        let mut module = split_bundle_module();
        let report = sanitize(&mut module).unwrap();

        assert_eq!(report.attributes_removed, 4);
        assert_eq!(report.elements_removed, 2);
        assert_eq!(report.table_entries_removed, 1);
        assert_eq!(report.files_removed, 1);

        let manifest = module.manifest().unwrap();
        assert!(manifest
            .root()
            .find_attribute_by_name(NAME_IS_SPLIT_REQUIRED)
            .is_none());
        assert!(manifest
            .root()
            .find_attribute_by_name(NAME_SPLIT_TYPES)
            .is_none());
        let application = manifest.application().unwrap();
        assert!(application.find_child("meta-data").is_none());
        assert!(application
            .find_attribute_by_id(ATTR_IS_SPLIT_REQUIRED)
            .is_none());

        assert!(!module.archive().contains("res/xml/splits0.xml"));
        let table = module.table().unwrap();
        assert!(table.entry_locations(SPLITS_RESOURCE_ID).is_empty());
    }

    #[test]
    fn sanitized_module_round_trips_through_its_archive() {
        let mut module = split_bundle_module();
        sanitize(&mut module).unwrap();

        // The refresh must have rewritten the archive entries; reparsing
        // them shows the sanitized state.
        let manifest =
            Manifest::from_archive_entry(module.archive().get(MANIFEST_ENTRY).unwrap()).unwrap();
        assert!(manifest
            .root()
            .find_attribute_by_name(NAME_IS_SPLIT_REQUIRED)
            .is_none());
        let table =
            ResourceTable::from_bytes(&module.archive().get(TABLE_ENTRY).unwrap().data).unwrap();
        assert!(table.entry_locations(SPLITS_RESOURCE_ID).is_empty());
    }

    #[test]
    fn sanitizing_twice_is_idempotent() {
        let mut module = split_bundle_module();
        sanitize(&mut module).unwrap();
        let manifest_bytes = module.archive().get(MANIFEST_ENTRY).unwrap().data.clone();
        let table_bytes = module.archive().get(TABLE_ENTRY).unwrap().data.clone();

        let second = sanitize(&mut module).unwrap();
        assert!(second.is_clean());
        assert_eq!(
            module.archive().get(MANIFEST_ENTRY).unwrap().data,
            manifest_bytes
        );
        assert_eq!(module.archive().get(TABLE_ENTRY).unwrap().data, table_bytes);
    }

    #[test]
    fn module_without_manifest_is_a_no_op() {
        let mut module = ApkModule::new("bare", Archive::new());
        let report = sanitize(&mut module).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn marker_without_reference_still_removes_the_element() {
        let mut module = split_bundle_module();
        // Drop the resource attribute so no marker resolves to a reference.
        {
            let manifest = module.manifest_mut().unwrap();
            let application = manifest.application_mut().unwrap();
            let meta = application.find_child_mut("meta-data").unwrap();
            meta.remove_attribute_by_id(ATTR_RESOURCE);
        }
        let report = sanitize(&mut module).unwrap();
        assert_eq!(report.elements_removed, 2);
        assert_eq!(report.table_entries_removed, 0);
        // The table entry survives untouched.
        let table = module.table().unwrap();
        assert_eq!(table.entry_locations(SPLITS_RESOURCE_ID).len(), 1);
    }

    #[test]
    fn resource_id_is_not_reused_after_compaction() {
        let mut module = split_bundle_module();
        {
            let table = module.table_mut().unwrap();
            let extra_key = table.package_mut(0x7f).unwrap().intern_key("other");
            table
                .put_entry(
                    0x7f,
                    1,
                    1,
                    &ConfigBlock::default_config(),
                    TableEntry {
                        flags: EntryFlags::empty(),
                        key: extra_key,
                        value: EntryValue::Single(TableValue::IntDec(1)),
                    },
                )
                .unwrap();
        }
        sanitize(&mut module).unwrap();
        let table = module.table().unwrap();
        // entry 0 stays vacant, entry 1 keeps its id
        assert!(table.entry_locations(SPLITS_RESOURCE_ID).is_empty());
        assert_eq!(
            table.entry_locations(resource_id(0x7f, 1, 1)).len(),
            1
        );
    }
}
