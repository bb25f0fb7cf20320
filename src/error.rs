//! Top-level error type the CLI entry point reports on.
//!
//! Every component already turns its own failure mode into a typed error
//! (a malformed record, a non-monotonic timestamp, a missing class); this
//! just gives `main` one type to match `?` against on the way up, and an
//! exit code to report: success is exit 0, a fatal input/format error is
//! non-zero.

use thiserror::Error;

use crate::classfile::ClassFileError;
use crate::trace::SplitError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Trace(#[from] SplitError),
    #[error("{0}")]
    ClassFile(#[from] ClassFileError),
}
