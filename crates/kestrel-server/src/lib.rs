//! The kestrel BSP server: request handlers, the file-watch debouncer,
//! and the stdio bootstrap. The `kestrel` binary in this crate is the
//! deliverable; everything else exists to serve its handlers.

mod handlers;
mod prepare;
pub mod server;
mod watcher;

pub use crate::server::run_stdio;
