//! Typed records for the Bazel protobuf output kestrel consumes.
//!
//! The message definitions mirror the subset of Bazel's `analysis_v2.proto`
//! and `build.proto` schemas that `cquery`/`aquery` emit with
//! `--output proto` (and `query` with `--output streamed_proto`). They are
//! written by hand rather than generated so the build carries no codegen
//! step; unknown fields in newer Bazel versions are skipped by prost during
//! decoding.

pub mod analysis;
pub mod query;

pub use prost::Message;

/// Decode a full `aquery --output proto` container.
pub fn decode_action_graph(bytes: &[u8]) -> Result<analysis::ActionGraphContainer, prost::DecodeError> {
    analysis::ActionGraphContainer::decode(bytes)
}

/// Decode a full `cquery --output proto` result.
pub fn decode_cquery_result(bytes: &[u8]) -> Result<analysis::CqueryResult, prost::DecodeError> {
    analysis::CqueryResult::decode(bytes)
}

/// Decode a `query --output streamed_proto` stream of targets.
///
/// The stream is a sequence of length-delimited `blaze_query.Target`
/// messages.
pub fn decode_target_stream(mut bytes: &[u8]) -> Result<Vec<query::Target>, prost::DecodeError> {
    let mut targets = Vec::new();
    while !bytes.is_empty() {
        let target = query::Target::decode_length_delimited(&mut bytes)?;
        targets.push(target);
    }
    Ok(targets)
}
