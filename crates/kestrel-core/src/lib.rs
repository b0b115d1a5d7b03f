//! Shared plumbing for the kestrel build server.
//!
//! This crate keeps dependencies light: absolute-path handling and `file:`
//! URI conversion are implemented without a full URL parser because the
//! server only ever exchanges `file:` URIs with its client.

mod exit;
mod path;
mod sync;

pub use crate::{
    exit::exit_now,
    path::{file_uri_to_path, path_to_file_uri, AbsPathBuf, AbsPathError, UriToPathError},
    sync::{lock, wait},
};

/// Server version advertised in `build/initialize` responses.
pub const KESTREL_VERSION: &str = env!("CARGO_PKG_VERSION");
