//! Messages from Bazel's `analysis_v2.proto`: the post-analysis action
//! graph returned by `aquery` and the configured-target list returned by
//! `cquery`.

use crate::query;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ActionGraphContainer {
    #[prost(message, repeated, tag = "1")]
    pub artifacts: Vec<Artifact>,
    #[prost(message, repeated, tag = "2")]
    pub actions: Vec<Action>,
    #[prost(message, repeated, tag = "3")]
    pub targets: Vec<Target>,
    #[prost(message, repeated, tag = "4")]
    pub dep_set_of_files: Vec<DepSetOfFiles>,
    #[prost(message, repeated, tag = "5")]
    pub configuration: Vec<Configuration>,
    #[prost(message, repeated, tag = "6")]
    pub aspect_descriptors: Vec<AspectDescriptor>,
    #[prost(message, repeated, tag = "7")]
    pub rule_classes: Vec<RuleClass>,
    #[prost(message, repeated, tag = "8")]
    pub path_fragments: Vec<PathFragment>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Artifact {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub path_fragment_id: u32,
    #[prost(bool, tag = "3")]
    pub is_tree_artifact: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Action {
    #[prost(uint32, tag = "1")]
    pub target_id: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub aspect_descriptor_ids: Vec<u32>,
    #[prost(string, tag = "3")]
    pub action_key: String,
    #[prost(string, tag = "4")]
    pub mnemonic: String,
    #[prost(uint32, tag = "5")]
    pub configuration_id: u32,
    #[prost(string, repeated, tag = "6")]
    pub arguments: Vec<String>,
    #[prost(message, repeated, tag = "7")]
    pub environment_variables: Vec<KeyValuePair>,
    #[prost(uint32, repeated, tag = "8")]
    pub input_dep_set_ids: Vec<u32>,
    #[prost(uint32, repeated, tag = "9")]
    pub output_ids: Vec<u32>,
    #[prost(bool, tag = "10")]
    pub discovers_inputs: bool,
    #[prost(message, repeated, tag = "11")]
    pub execution_info: Vec<KeyValuePair>,
    #[prost(uint32, tag = "13")]
    pub primary_output_id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Target {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub label: String,
    #[prost(uint32, tag = "3")]
    pub rule_class_id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RuleClass {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AspectDescriptor {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub parameters: Vec<KeyValuePair>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DepSetOfFiles {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub transitive_dep_set_ids: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub direct_artifact_ids: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Configuration {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub mnemonic: String,
    #[prost(string, tag = "3")]
    pub platform_name: String,
    #[prost(string, tag = "4")]
    pub checksum: String,
    #[prost(bool, tag = "5")]
    pub is_tool: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValuePair {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// A directory entry in the deduplicated path trie `aquery` emits.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PathFragment {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub label: String,
    #[prost(uint32, tag = "3")]
    pub parent_id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CqueryResult {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<ConfiguredTarget>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConfiguredTarget {
    #[prost(message, optional, tag = "1")]
    pub target: Option<query::Target>,
    #[prost(message, optional, tag = "2")]
    pub configuration: Option<Configuration>,
}
