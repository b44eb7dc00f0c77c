//! # retag-core
//!
//! Shared foundation of the retag media tag editing library:
//!
//! - a single [`Error`] hierarchy used by all format crates,
//! - the [`MediaFile`] stream surface (seekable, bidirectional, path-bound),
//! - the notification sink accumulating `{severity, context, message}`
//!   diagnostics,
//! - progress reporting with cooperative cancellation,
//! - backup handling for safe in-place rewrites,
//! - a generic walker over recursive container element structures.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod error;
pub mod io;
pub mod notify;
pub mod progress;
pub mod tree;

pub use error::{Error, Result};
pub use io::MediaFile;
pub use notify::{Notification, NotificationList, Severity};
pub use progress::{AbortFlag, NoProgress, ProgressSink};
pub use tree::{validate_structure, ElementStructure};
