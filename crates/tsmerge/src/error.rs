//! Error and Result types for tsmerge operations.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A convenience `Result` type for tsmerge operations.
pub type Result<T> = std::result::Result<T, TsmError>;

/// The error type for block, file and compaction operations.
///
/// Every variant collapses into one of three [`ErrorKind`]s, which is the
/// whole failure surface a compaction caller has to handle.
#[derive(Debug, Error)]
pub enum TsmError {
    /// An encoded block failed to decode: bad length, tag, checksum or payload.
    #[error("Corrupt block for key {key} at offset {offset}: {reason}")]
    CorruptBlock {
        /// Printable form of the owning series key (empty when unknown).
        key: String,
        /// Byte offset of the block inside its file.
        offset: u64,
        /// What failed to validate.
        reason: String,
    },

    /// A file-level structure (header, footer, index, sidecar) is damaged.
    #[error("Corrupt file {}: {reason}", path.display())]
    CorruptFile {
        /// Path of the damaged file.
        path: PathBuf,
        /// What failed to validate.
        reason: String,
    },

    /// An I/O error against a known file.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// The file being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Underlying I/O error without file context.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// The pass was aborted cooperatively before commit.
    #[error("Compaction cancelled")]
    Cancelled,
}

/// Coarse classification of [`TsmError`] for callers deciding skip-vs-abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stored data did not validate.
    CorruptBlock,
    /// Reading or writing a file failed.
    IoFailure,
    /// Cooperative abort.
    Cancelled,
}

impl TsmError {
    /// Returns the error's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CorruptBlock { .. } | Self::CorruptFile { .. } => ErrorKind::CorruptBlock,
            Self::Io { .. } | Self::IoError(_) => ErrorKind::IoFailure,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Builds a [`TsmError::CorruptBlock`] with no key or offset attached yet.
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptBlock {
            key: String::new(),
            offset: 0,
            reason: reason.into(),
        }
    }

    /// Fills in key and offset context on a block corruption error.
    pub(crate) fn at_block(self, key: impl std::fmt::Display, at: u64) -> Self {
        match self {
            Self::CorruptBlock { reason, .. } => Self::CorruptBlock {
                key: key.to_string(),
                offset: at,
                reason,
            },
            other => other,
        }
    }

    pub(crate) fn corrupt_file(path: &Path, reason: impl Into<String>) -> Self {
        Self::CorruptFile {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Attaches a file path to I/O results.
pub(crate) trait IoContext<T> {
    fn with_path(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn with_path(self, path: &Path) -> Result<T> {
        self.map_err(|source| TsmError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(TsmError::corrupt("bad tag").kind(), ErrorKind::CorruptBlock);
        assert_eq!(
            TsmError::corrupt_file(Path::new("a.tsm"), "bad magic").kind(),
            ErrorKind::CorruptBlock
        );
        assert_eq!(
            TsmError::from(io::Error::other("disk")).kind(),
            ErrorKind::IoFailure
        );
        assert_eq!(TsmError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_block_context_attached() {
        let err = TsmError::corrupt("checksum mismatch").at_block("cpu,host=a", 128);
        match err {
            TsmError::CorruptBlock { key, offset, reason } => {
                assert_eq!(key, "cpu,host=a");
                assert_eq!(offset, 128);
                assert_eq!(reason, "checksum mismatch");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_io_context() {
        let res: io::Result<()> = Err(io::Error::from(io::ErrorKind::NotFound));
        let err = res.with_path(Path::new("/tmp/x.tsm")).unwrap_err();
        assert!(err.to_string().contains("/tmp/x.tsm"));
        assert_eq!(err.kind(), ErrorKind::IoFailure);
    }
}
