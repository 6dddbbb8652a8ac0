use crate::archive::ArchiveError;
use crate::arsc::TableError;
use crate::axml::XmlError;
use std::io;
use std::path::PathBuf;

/// Result alias for the merge pipeline.
pub type MergeResult<T> = Result<T, MergeError>;

/// Errors crossing the merge task boundary. Each converts to the
/// human-readable text surfaced once on the progress channel.
#[derive(Debug)]
pub enum MergeError {
    /// The input directory yielded zero APK modules.
    NoModulesFound(PathBuf),
    /// Two modules define the same resource id with differing content.
    ResourceConflict(u32),
    Archive(ArchiveError),
    Manifest(XmlError),
    Table(TableError),
    Io(io::Error),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::NoModulesFound(dir) => {
                write!(f, "No apk modules found in {}", dir.display())
            }
            MergeError::ResourceConflict(id) => {
                write!(f, "Conflicting definitions for resource 0x{id:08x}")
            }
            MergeError::Archive(err) => write!(f, "{err}"),
            MergeError::Manifest(err) => write!(f, "{err}"),
            MergeError::Table(err) => write!(f, "{err}"),
            MergeError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<ArchiveError> for MergeError {
    fn from(value: ArchiveError) -> Self {
        MergeError::Archive(value)
    }
}

impl From<XmlError> for MergeError {
    fn from(value: XmlError) -> Self {
        MergeError::Manifest(value)
    }
}

impl From<TableError> for MergeError {
    fn from(value: TableError) -> Self {
        match value {
            TableError::Conflict(id) => MergeError::ResourceConflict(id),
            other => MergeError::Table(other),
        }
    }
}

impl From<io::Error> for MergeError {
    fn from(value: io::Error) -> Self {
        MergeError::Io(value)
    }
}
