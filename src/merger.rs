use crate::bundle::ApkBundle;
use crate::error::MergeResult;
use crate::sanitize::sanitize;
use log::info;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

/// Requested handling of `android:extractNativeLibs` on the merged APK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractNativeLibs {
    /// Keep whatever the base manifest declares (unset stays unset).
    Manifest,
    Enabled,
    Disabled,
}

impl ExtractNativeLibs {
    /// Parse the invocation-contract string form, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("manifest") {
            Some(ExtractNativeLibs::Manifest)
        } else if value.eq_ignore_ascii_case("true") {
            Some(ExtractNativeLibs::Enabled)
        } else if value.eq_ignore_ascii_case("false") {
            Some(ExtractNativeLibs::Disabled)
        } else {
            None
        }
    }
}

/// Options for one merge invocation, mirroring the embedding contract.
#[derive(Clone, Debug)]
pub struct MergeOptions {
    pub extracted_dir: PathBuf,
    pub output_file: PathBuf,
    pub validate_modules: bool,
    pub res_dir_name: Option<String>,
    pub validate_res_dir: bool,
    pub clean_meta: bool,
    pub extract_native_libs: Option<ExtractNativeLibs>,
    /// Delete the source directory after a successful write. Disabled in
    /// tests that want to inspect their inputs afterwards.
    pub delete_extracted_dir: bool,
}

impl MergeOptions {
    pub fn new(extracted_dir: impl Into<PathBuf>, output_file: impl Into<PathBuf>) -> Self {
        MergeOptions {
            extracted_dir: extracted_dir.into(),
            output_file: output_file.into(),
            validate_modules: false,
            res_dir_name: None,
            validate_res_dir: false,
            clean_meta: false,
            extract_native_libs: None,
            delete_extracted_dir: true,
        }
    }
}

/// Message kind on the progress channel. Exactly one `MergeComplete` or
/// one `Error` terminates each invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Success,
    Error,
    MergeComplete,
}

/// One progress milestone, serializable for embedders that forward the
/// channel over IPC.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressMessage {
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

/// Ordered single-producer side of the progress channel.
pub struct ProgressSink {
    tx: Sender<ProgressMessage>,
}

impl ProgressSink {
    pub fn new(tx: Sender<ProgressMessage>) -> Self {
        ProgressSink { tx }
    }

    pub fn send(&self, msg: impl Into<String>) {
        self.send_kind(msg, MessageKind::Success);
    }

    pub fn send_kind(&self, msg: impl Into<String>, kind: MessageKind) {
        let msg = msg.into();
        info!("{msg}");
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.tx.send(ProgressMessage { msg, kind });
    }
}

/// Run the merge pipeline as a background task, returning the receiving
/// end of its progress channel. One invocation is one task; all steps
/// inside it are strictly sequential and no error crosses the thread
/// boundary uncaught.
pub fn start_merge(options: MergeOptions) -> Receiver<ProgressMessage> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let sink = ProgressSink::new(tx);
        match run_merge(&options, &sink) {
            Ok(()) => sink.send_kind("Merge task complete", MessageKind::MergeComplete),
            Err(err) => sink.send_kind(format!("Error: {err}"), MessageKind::Error),
        }
    });
    rx
}

/// The synchronous pipeline: load → merge → sanitize → refresh → write →
/// cleanup. Sanitization must see the fully merged table, and refresh must
/// happen before write. The source directory is only deleted after a
/// successful write, so a failed run never destroys input data.
pub fn run_merge(options: &MergeOptions, sink: &ProgressSink) -> MergeResult<()> {
    sink.send("Searching apk files ...");
    let bundle = ApkBundle::load_directory(&options.extracted_dir, true)?;
    sink.send(format!("Found modules: {}", bundle.len()));

    let mut merged = bundle.merge_modules(options.validate_modules)?;

    if let Some(res_dir) = options.res_dir_name.as_deref() {
        if !res_dir.is_empty() {
            sink.send(format!("Renaming resources root dir: {res_dir}"));
            merged.set_resources_root_dir(res_dir)?;
        }
    }
    if options.validate_res_dir {
        sink.send("Validating resources dir ...");
        merged.validate_resources_dir()?;
    }
    if options.clean_meta {
        sink.send("Clearing META-INF ...");
        merged.remove_signature_entries();
    }

    sink.send("Sanitizing manifest ...");
    sanitize(&mut merged)?;
    merged.refresh_table()?;
    merged.refresh_manifest()?;

    if let Some(mode) = options.extract_native_libs {
        let value = match mode {
            ExtractNativeLibs::Manifest => merged.extract_native_libs()?,
            ExtractNativeLibs::Enabled => Some(true),
            ExtractNativeLibs::Disabled => Some(false),
        };
        sink.send(format!(
            "Applying: extractNativeLibs={}",
            match value {
                Some(true) => "true",
                Some(false) => "false",
                None => "null",
            }
        ));
        merged.set_extract_native_libs(value)?;
        merged.refresh_manifest()?;
    }

    sink.send("Writing apk ...");
    merged.write_apk(&options.output_file)?;

    if options.delete_extracted_dir && options.extracted_dir.exists() {
        fs::remove_dir_all(&options.extracted_dir)?;
    }
    sink.send(format!("Saved to: {}", options.output_file.display()));
    Ok(())
}
