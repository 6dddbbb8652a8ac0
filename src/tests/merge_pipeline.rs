use crate::archive::{Archive, ArchiveEntry};
use crate::arsc::{
    resource_id, ConfigBlock, EntryFlags, EntryValue, ResourceTable, TableEntry, TablePackage,
    TableValue,
};
use crate::axml::{
    Manifest, XmlAttribute, XmlElement, XmlValue, ATTR_IS_SPLIT_REQUIRED, ATTR_NAME,
    ATTR_RESOURCE, NAME_IS_SPLIT_REQUIRED, NAME_REQUIRED_SPLIT_TYPES, NAME_SPLIT_TYPES,
    SPLIT_MARKER_NAMES,
};
use crate::merger::{
    run_merge, start_merge, ExtractNativeLibs, MergeOptions, MessageKind, ProgressMessage,
    ProgressSink,
};
use crate::module::{ApkModule, MANIFEST_ENTRY, TABLE_ENTRY};
use std::fs;
use std::path::Path;
use std::sync::mpsc;

const SPLITS_RESOURCE_ID: u32 = 0x7f01_0000;

fn base_manifest() -> Manifest {
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
    application.append_child(splits_meta);

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

    manifest.root_mut().append_child(application);
    manifest
}

fn base_table() -> ResourceTable {
    let mut table = ResourceTable::new();
    table.add_package(TablePackage::new(0x7f, "com.example.app"));
    table.package_mut(0x7f).unwrap().ensure_type_name(1, "xml");
    table.package_mut(0x7f).unwrap().ensure_type_name(2, "drawable");
    let splits_path = table.intern_string("res/xml/splits0.xml");
    let icon_path = table.intern_string("res/drawable/icon.png");
    let splits_key = table.package_mut(0x7f).unwrap().intern_key("splits0");
    let icon_key = table.package_mut(0x7f).unwrap().intern_key("icon");
    table
        .put_entry(
            0x7f,
            1,
            0,
            &ConfigBlock::default_config(),
            TableEntry {
                flags: EntryFlags::empty(),
                key: splits_key,
                value: EntryValue::Single(TableValue::StringRef(splits_path)),
            },
        )
        .unwrap();
    table
        .put_entry(
            0x7f,
            2,
            0,
            &ConfigBlock::default_config(),
            TableEntry {
                flags: EntryFlags::empty(),
                key: icon_key,
                value: EntryValue::Single(TableValue::StringRef(icon_path)),
            },
        )
        .unwrap();
    table
}

fn split_table() -> ResourceTable {
    let mut table = ResourceTable::new();
    table.add_package(TablePackage::new(0x7f, "com.example.app"));
    table.package_mut(0x7f).unwrap().ensure_type_name(1, "xml");
    table.package_mut(0x7f).unwrap().ensure_type_name(2, "drawable");
    let path = table.intern_string("res/drawable-hdpi/icon2.png");
    let key = table.package_mut(0x7f).unwrap().intern_key("icon2");
    table
        .put_entry(
            0x7f,
            2,
            1,
            &ConfigBlock::default_config(),
            TableEntry {
                flags: EntryFlags::empty(),
                key,
                value: EntryValue::Single(TableValue::StringRef(path)),
            },
        )
        .unwrap();
    table
}

fn split_manifest() -> Manifest {
    let mut manifest = Manifest::new();
    let root = manifest.root_mut();
    root.set_attribute(XmlAttribute::new("package", "com.example.app"));
    root.set_attribute(XmlAttribute::new("split", "config.hdpi"));
    manifest.root_mut().append_child(XmlElement::new("application"));
    manifest
}

fn write_base_apk(path: &Path) {
    let mut archive = Archive::new();
    archive
        .put(
            MANIFEST_ENTRY,
            ArchiveEntry::new(base_manifest().to_bytes().unwrap()),
        )
        .unwrap();
    archive
        .put(TABLE_ENTRY, ArchiveEntry::new(base_table().to_bytes().unwrap()))
        .unwrap();
    archive
        .put("res/xml/splits0.xml", ArchiveEntry::new(vec![3, 0, 8, 0]))
        .unwrap();
    archive
        .put("res/drawable/icon.png", ArchiveEntry::new(vec![0x89, 0x50]))
        .unwrap();
    archive
        .put("classes.dex", ArchiveEntry::new(b"dex\n035".to_vec()))
        .unwrap();
    archive
        .put("META-INF/CERT.SF", ArchiveEntry::new(vec![1]))
        .unwrap();
    archive
        .put("META-INF/CERT.RSA", ArchiveEntry::new(vec![2]))
        .unwrap();
    archive.write_file(path).unwrap();
}

fn write_split_apk(path: &Path) {
    let mut archive = Archive::new();
    archive
        .put(
            MANIFEST_ENTRY,
            ArchiveEntry::new(split_manifest().to_bytes().unwrap()),
        )
        .unwrap();
    archive
        .put(
            TABLE_ENTRY,
            ArchiveEntry::new(split_table().to_bytes().unwrap()),
        )
        .unwrap();
    archive
        .put(
            "res/drawable-hdpi/icon2.png",
            ArchiveEntry::new(vec![0x89, 0x51]),
        )
        .unwrap();
    archive
        .put("META-INF/CERT.SF", ArchiveEntry::new(vec![3]))
        .unwrap();
    archive.write_file(path).unwrap();
}

fn collecting_sink() -> (ProgressSink, mpsc::Receiver<ProgressMessage>) {
    let (tx, rx) = mpsc::channel();
    (ProgressSink::new(tx), rx)
}

#[test]
fn merge_pipeline_end_to_end() {
    let workdir = tempfile::tempdir().unwrap();
    let extracted = workdir.path().join("extracted");
    fs::create_dir_all(&extracted).unwrap();
    write_base_apk(&extracted.join("base.apk"));
    write_split_apk(&extracted.join("config.hdpi.apk"));
    let output = workdir.path().join("merged.apk");

    let mut options = MergeOptions::new(&extracted, &output);
    options.validate_modules = true;
    options.clean_meta = true;
    let (sink, rx) = collecting_sink();
    run_merge(&options, &sink).unwrap();
    drop(sink);

    // Source directory is deleted only after the successful write.
    assert!(!extracted.exists());
    assert!(output.exists());

    let mut merged = ApkModule::from_file(&output).unwrap();

    // Manifest: no split attributes, no split markers, launcher intact.
    let manifest = merged.manifest().unwrap();
    assert!(manifest
        .root()
        .find_attribute_by_name(NAME_IS_SPLIT_REQUIRED)
        .is_none());
    assert!(manifest
        .root()
        .find_attribute_by_name(NAME_SPLIT_TYPES)
        .is_none());
    assert!(manifest
        .root()
        .find_attribute_by_name(NAME_REQUIRED_SPLIT_TYPES)
        .is_none());
    let application = manifest.application().unwrap();
    assert!(application.find_child("meta-data").is_none());
    assert!(manifest.has_launchable_activity());

    // Archive: no signature entries, resources from both inputs, split
    // marker file gone.
    assert!(!merged.archive().contains("META-INF/CERT.SF"));
    assert!(!merged.archive().contains("META-INF/CERT.RSA"));
    assert!(merged.archive().contains("res/drawable/icon.png"));
    assert!(merged.archive().contains("res/drawable-hdpi/icon2.png"));
    assert!(merged.archive().contains("classes.dex"));
    assert!(!merged.archive().contains("res/xml/splits0.xml"));

    // Table: union of both packages, splits entry vacated, ids stable.
    let table = merged.table().unwrap();
    assert!(table.entry_locations(SPLITS_RESOURCE_ID).is_empty());
    assert_eq!(table.entry_locations(resource_id(0x7f, 2, 0)).len(), 1);
    assert_eq!(table.entry_locations(resource_id(0x7f, 2, 1)).len(), 1);

    // Progress channel: ordered milestones, no terminal kind from run_merge
    // itself (start_merge owns the terminal message).
    let messages: Vec<ProgressMessage> = rx.iter().collect();
    assert!(messages.len() >= 5);
    assert_eq!(messages[0].msg, "Searching apk files ...");
    assert_eq!(messages[1].msg, "Found modules: 2");
    assert!(messages.iter().all(|m| m.kind == MessageKind::Success));
    assert!(messages.last().unwrap().msg.starts_with("Saved to: "));
}

#[test]
fn background_merge_terminates_with_merge_complete() {
    let workdir = tempfile::tempdir().unwrap();
    let extracted = workdir.path().join("extracted");
    fs::create_dir_all(&extracted).unwrap();
    write_base_apk(&extracted.join("base.apk"));
    write_split_apk(&extracted.join("config.hdpi.apk"));
    let output = workdir.path().join("merged.apk");

    let mut options = MergeOptions::new(&extracted, &output);
    options.validate_modules = true;
    options.clean_meta = true;
    let rx = start_merge(options);
    let messages: Vec<ProgressMessage> = rx.iter().collect();

    let terminals = messages
        .iter()
        .filter(|m| m.kind != MessageKind::Success)
        .count();
    assert_eq!(terminals, 1);
    assert_eq!(messages.last().unwrap().kind, MessageKind::MergeComplete);
    assert!(output.exists());
}

#[test]
fn validation_failure_keeps_source_and_publishes_nothing() {
    let workdir = tempfile::tempdir().unwrap();
    let extracted = workdir.path().join("extracted");
    fs::create_dir_all(&extracted).unwrap();
    write_base_apk(&extracted.join("base.apk"));

    // A split that redefines the base's icon resource with other content.
    let mut clash_table = ResourceTable::new();
    clash_table.add_package(TablePackage::new(0x7f, "com.example.app"));
    clash_table.package_mut(0x7f).unwrap().ensure_type_name(1, "xml");
    clash_table
        .package_mut(0x7f)
        .unwrap()
        .ensure_type_name(2, "drawable");
    let path = clash_table.intern_string("res/drawable/clash.png");
    let key = clash_table.package_mut(0x7f).unwrap().intern_key("icon");
    clash_table
        .put_entry(
            0x7f,
            2,
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
            ArchiveEntry::new(split_manifest().to_bytes().unwrap()),
        )
        .unwrap();
    archive
        .put(
            TABLE_ENTRY,
            ArchiveEntry::new(clash_table.to_bytes().unwrap()),
        )
        .unwrap();
    archive.write_file(&extracted.join("config.clash.apk")).unwrap();

    let output = workdir.path().join("merged.apk");
    let mut options = MergeOptions::new(&extracted, &output);
    options.validate_modules = true;
    let rx = start_merge(options);
    let messages: Vec<ProgressMessage> = rx.iter().collect();

    assert_eq!(messages.last().unwrap().kind, MessageKind::Error);
    assert!(messages.last().unwrap().msg.contains("0x7f020000"));
    // No partial artifact, inputs untouched.
    assert!(!output.exists());
    assert!(extracted.join("base.apk").exists());
}

#[test]
fn res_dir_rename_applies_to_archive_and_table() {
    let workdir = tempfile::tempdir().unwrap();
    let extracted = workdir.path().join("extracted");
    fs::create_dir_all(&extracted).unwrap();
    write_base_apk(&extracted.join("base.apk"));
    write_split_apk(&extracted.join("config.hdpi.apk"));
    let output = workdir.path().join("merged.apk");

    let mut options = MergeOptions::new(&extracted, &output);
    options.validate_modules = true;
    options.res_dir_name = Some("r".to_string());
    options.validate_res_dir = true;
    let (sink, rx) = collecting_sink();
    run_merge(&options, &sink).unwrap();
    drop(sink);
    let _: Vec<ProgressMessage> = rx.iter().collect();

    let mut merged = ApkModule::from_file(&output).unwrap();
    assert!(merged.archive().contains("r/drawable/icon.png"));
    assert!(merged.archive().contains("r/drawable-hdpi/icon2.png"));
    assert!(merged
        .archive()
        .entry_names()
        .all(|name| !name.starts_with("res/")));
    let table = merged.table().unwrap();
    let loc = table.entry_locations(resource_id(0x7f, 2, 0))[0];
    assert_eq!(table.resolve_file_path(loc), Some("r/drawable/icon.png"));
}

#[test]
fn extract_native_libs_modes() {
    for (mode, expected) in [
        (ExtractNativeLibs::Enabled, Some(true)),
        (ExtractNativeLibs::Disabled, Some(false)),
        (ExtractNativeLibs::Manifest, None),
    ] {
        let workdir = tempfile::tempdir().unwrap();
        let extracted = workdir.path().join("extracted");
        fs::create_dir_all(&extracted).unwrap();
        write_base_apk(&extracted.join("base.apk"));
        let output = workdir.path().join("merged.apk");

        let mut options = MergeOptions::new(&extracted, &output);
        options.extract_native_libs = Some(mode);
        let (sink, rx) = collecting_sink();
        run_merge(&options, &sink).unwrap();
        drop(sink);
        let _: Vec<ProgressMessage> = rx.iter().collect();

        let mut merged = ApkModule::from_file(&output).unwrap();
        assert_eq!(merged.extract_native_libs().unwrap(), expected);
    }
}
