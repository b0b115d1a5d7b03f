//! Messages from Bazel's `build.proto` (`blaze_query`): the target records
//! embedded in cquery results and emitted by `query --output streamed_proto`.

#[derive(Clone, PartialEq, prost::Message)]
pub struct Target {
    #[prost(enumeration = "target::Discriminator", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub rule: Option<Rule>,
    #[prost(message, optional, tag = "3")]
    pub source_file: Option<SourceFile>,
    #[prost(message, optional, tag = "4")]
    pub generated_file: Option<GeneratedFile>,
}

pub mod target {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Discriminator {
        Rule = 1,
        SourceFile = 2,
        GeneratedFile = 3,
        PackageGroup = 4,
        EnvironmentGroup = 5,
    }
}

impl Target {
    pub fn discriminator(&self) -> Option<target::Discriminator> {
        target::Discriminator::try_from(self.r#type).ok()
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Rule {
    /// The rule's label, e.g. `//App:AppLib`.
    #[prost(string, tag = "1")]
    pub name: String,
    /// The rule class, e.g. `swift_library`.
    #[prost(string, tag = "2")]
    pub rule_class: String,
    #[prost(string, tag = "3")]
    pub location: String,
    #[prost(message, repeated, tag = "4")]
    pub attribute: Vec<Attribute>,
    /// Labels of all targets this rule reads, dependencies and sources alike.
    #[prost(string, repeated, tag = "5")]
    pub rule_input: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    pub rule_output: Vec<String>,
}

impl Rule {
    /// The first attribute named `name`, if present.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attribute.iter().find(|attr| attr.name == name)
    }

    /// Convenience accessor for a string-typed attribute value.
    pub fn string_attribute(&self, name: &str) -> Option<&str> {
        self.attribute(name)
            .and_then(|attr| attr.string_value.as_deref())
    }

    /// Convenience accessor for a string-list-typed attribute value.
    pub fn string_list_attribute(&self, name: &str) -> &[String] {
        self.attribute(name)
            .map(|attr| attr.string_list_value.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Attribute {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "attribute::Discriminator", tag = "2")]
    pub r#type: i32,
    #[prost(int32, optional, tag = "3")]
    pub int_value: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub string_value: Option<String>,
    #[prost(string, repeated, tag = "6")]
    pub string_list_value: Vec<String>,
    #[prost(bool, optional, tag = "13")]
    pub explicitly_specified: Option<bool>,
    #[prost(bool, optional, tag = "14")]
    pub boolean_value: Option<bool>,
}

pub mod attribute {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Discriminator {
        Integer = 1,
        String = 2,
        Label = 3,
        Output = 4,
        StringList = 5,
        LabelList = 6,
        OutputList = 7,
        DistributionSet = 8,
        License = 9,
        StringDict = 10,
        FilesetEntryList = 11,
        LabelListDict = 12,
        StringListDict = 13,
        Boolean = 14,
        Tristate = 15,
        IntegerList = 16,
        Unknown = 18,
        LabelDictUnary = 19,
        SelectorList = 20,
        LabelKeyedStringDict = 21,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SourceFile {
    /// The file's label, e.g. `//App:Lib/A.swift`.
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub location: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GeneratedFile {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub generating_rule: String,
}
