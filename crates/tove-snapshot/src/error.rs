//! Snapshot error taxonomy.
//!
//! Record-level problems (a name that no longer resolves, an instance with
//! nothing to rebind to) are recoverable: the value decodes to Null and a
//! `Diagnostic` is recorded. Only a malformed byte stream or a misused VM
//! aborts the whole operation.

use std::fmt;

use thiserror::Error;
use tove_runtime::BufferError;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The byte stream ended mid-record.
    #[error("unexpected end of stream")]
    Eof(#[from] BufferError),

    /// The byte stream is malformed; the restore cannot continue.
    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),

    /// Snapshot/restore attempted while a call frame is live.
    #[error("vm has live call frames")]
    VmActive,

    /// Strict mode only: a named native binding was not found at read time.
    #[error("unresolved native binding: {0}")]
    Unresolved(String),

    /// Strict mode only: a native instance had no identifier, or the binder
    /// declined to reattach it.
    #[error("native instance cannot be rebound: {0:?}")]
    Unbindable(String),

    /// Strict mode only: an anonymous or instance-bound native closure has
    /// no by-name representation.
    #[error("native closure cannot be encoded by name")]
    UnencodableClosure,
}

/// A recoverable condition observed during a lenient snapshot or restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A native closure or class name was not found at read time; the value
    /// decoded to Null.
    UnresolvedNamedBinding { name: String },
    /// A native instance decoded without a backing host object.
    UnbindableInstance { ident: String },
    /// A native closure was downgraded to Null at write time.
    UnencodableClosure,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnresolvedNamedBinding { name } => {
                write!(f, "unresolved native binding: {}", name)
            }
            Diagnostic::UnbindableInstance { ident } => {
                write!(f, "native instance not rebound: {:?}", ident)
            }
            Diagnostic::UnencodableClosure => {
                write!(f, "anonymous native closure dropped to null")
            }
        }
    }
}
