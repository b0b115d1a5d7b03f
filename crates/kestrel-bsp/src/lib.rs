//! The BSP wire layer: JSON-RPC message shapes, the `Content-Length`
//! stdio codec, the typed handler registry, and the outgoing
//! single-writer.
//!
//! Protocol semantics (which handler does what) live in the server crate;
//! this crate only knows how messages move.

pub mod codec;
mod dispatch;
mod outgoing;
mod rpc;
pub mod types;

pub use crate::{
    dispatch::{Dispatcher, Responder},
    outgoing::Outgoing,
    rpc::{error_codes, IncomingMessage, RequestId, RpcError},
};
