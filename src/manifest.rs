//! Manifest Parsing
//!
//! Splits a multi-document YAML stream into documents and classifies each one
//! as a Kubernetes resource, a resource list, or an opaque pass-through document.
//! Every document keeps its raw text so that untouched documents are re-emitted
//! byte for byte.

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// Marker line separating documents
pub const DOCUMENT_SEPARATOR: &str = "---";

/// Kubernetes Resource
///
/// Known fields are lifted out of the document; the full parsed body is kept
/// alongside so nothing is lost when a document has to be re-serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// `apiVersion`, empty when absent
    pub api_version: String,

    /// `kind`, empty when absent
    pub kind: String,

    /// `metadata.name`, empty when absent
    pub name: String,

    /// `metadata.namespace`
    pub namespace: Option<String>,

    /// `metadata.labels`
    pub labels: BTreeMap<String, String>,

    /// `metadata.annotations`
    pub annotations: BTreeMap<String, String>,

    body: Mapping,
    original_labels: BTreeMap<String, String>,
    original_annotations: BTreeMap<String, String>,
}

impl Resource {
    /// Build a resource from a parsed top-level mapping
    ///
    /// # Errors
    /// Returns a reason string when the mapping is not a resource
    pub fn from_mapping(body: Mapping) -> std::result::Result<Self, String> {
        let api_version = scalar_field(&body, "apiVersion");
        let kind = scalar_field(&body, "kind");
        if api_version.is_none() && kind.is_none() {
            return Err("document has neither kind nor apiVersion".to_string());
        }

        let (name, namespace, labels, annotations) = match body.get("metadata") {
            None | Some(Value::Null) => (String::new(), None, BTreeMap::new(), BTreeMap::new()),
            Some(Value::Mapping(metadata)) => (
                scalar_field(metadata, "name").unwrap_or_default(),
                scalar_field(metadata, "namespace"),
                string_map(metadata, "labels")?,
                string_map(metadata, "annotations")?,
            ),
            Some(_) => return Err("metadata is not a mapping".to_string()),
        };

        Ok(Self {
            api_version: api_version.unwrap_or_default(),
            kind: kind.unwrap_or_default(),
            name,
            namespace,
            original_labels: labels.clone(),
            original_annotations: annotations.clone(),
            labels,
            annotations,
            body,
        })
    }

    /// Labels as they were read
    pub fn original_labels(&self) -> &BTreeMap<String, String> {
        &self.original_labels
    }

    /// Annotations as they were read
    pub fn original_annotations(&self) -> &BTreeMap<String, String> {
        &self.original_annotations
    }

    /// Whether labels or annotations differ from what was read
    pub fn is_modified(&self) -> bool {
        self.labels != self.original_labels || self.annotations != self.original_annotations
    }

    /// Short `Kind/name` reference used in reports and logs
    pub fn reference(&self) -> String {
        let kind = if self.kind.is_empty() { "<unknown>" } else { &self.kind };
        match &self.namespace {
            Some(ns) => format!("{}/{} (namespace {})", kind, self.name, ns),
            None => format!("{}/{}", kind, self.name),
        }
    }

    /// Body with the current labels and annotations written into `metadata`
    ///
    /// Existing entries keep their position; new ones are appended.
    pub fn to_value(&self) -> Value {
        let mut body = self.body.clone();
        let metadata = body
            .entry(Value::from("metadata"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !metadata.is_mapping() {
            *metadata = Value::Mapping(Mapping::new());
        }
        if let Value::Mapping(metadata) = metadata {
            write_string_map(metadata, "labels", &self.labels, &self.original_labels);
            write_string_map(
                metadata,
                "annotations",
                &self.annotations,
                &self.original_annotations,
            );
        }
        Value::Mapping(body)
    }
}

/// Resource List
///
/// A `kind: List` style document whose `items` are resources
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceList {
    pub kind: String,
    pub items: Vec<Resource>,
    body: Mapping,
}

impl ResourceList {
    pub fn is_modified(&self) -> bool {
        self.items.iter().any(Resource::is_modified)
    }

    /// Body with every item re-rendered from its resource
    pub fn to_value(&self) -> Value {
        let mut body = self.body.clone();
        let items: Vec<Value> = self.items.iter().map(Resource::to_value).collect();
        body.insert(Value::from("items"), Value::Sequence(items));
        Value::Mapping(body)
    }
}

/// Classified document content
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentBody {
    Resource(Resource),
    List(ResourceList),
    /// Empty, comment-only, or not a resource; emitted unchanged
    PassThrough,
}

/// One document of a manifest stream
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Zero-based position in the stream
    pub index: usize,

    /// Separator line that preceded the document (empty for a leading document)
    pub separator: String,

    /// Raw document text
    pub text: String,

    pub body: DocumentBody,
}

impl Document {
    /// Whether the document has to be re-rendered
    pub fn is_modified(&self) -> bool {
        match &self.body {
            DocumentBody::Resource(resource) => resource.is_modified(),
            DocumentBody::List(list) => list.is_modified(),
            DocumentBody::PassThrough => false,
        }
    }

    /// Resources carried by the document
    pub fn resources(&self) -> Vec<&Resource> {
        match &self.body {
            DocumentBody::Resource(resource) => vec![resource],
            DocumentBody::List(list) => list.items.iter().collect(),
            DocumentBody::PassThrough => Vec::new(),
        }
    }
}

/// Lazy manifest parser
///
/// Yields one document per call; the source is read once and cannot be rewound.
pub struct ManifestParser<'a> {
    input: &'a str,
    pos: usize,
    index: usize,
    strict: bool,
}

impl<'a> ManifestParser<'a> {
    /// Create a parser; in strict mode non-resource documents are errors
    pub fn new(input: &'a str, strict: bool) -> Self {
        Self {
            input,
            pos: 0,
            index: 0,
            strict,
        }
    }

    fn next_line(&self, from: usize) -> &'a str {
        let rest = &self.input[from..];
        match rest.find('\n') {
            Some(end) => &rest[..=end],
            None => rest,
        }
    }

    fn classify(&self, index: usize, text: &str) -> Result<DocumentBody> {
        if is_blank_document(text) {
            return Ok(DocumentBody::PassThrough);
        }

        match classify_text(text) {
            Ok(body) => Ok(body),
            Err(reason) if self.strict => Err(Error::MalformedManifest { index, reason }),
            Err(reason) => {
                tracing::debug!("passing document {} through unchanged: {}", index, reason);
                Ok(DocumentBody::PassThrough)
            }
        }
    }
}

impl Iterator for ManifestParser<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.input.len() {
            return None;
        }

        let mut separator = "";
        let first = self.next_line(self.pos);
        if is_separator_line(first) {
            separator = first;
            self.pos += first.len();
        }

        let start = self.pos;
        while self.pos < self.input.len() {
            let line = self.next_line(self.pos);
            if is_separator_line(line) {
                break;
            }
            self.pos += line.len();
        }
        let text = &self.input[start..self.pos];

        let index = self.index;
        self.index += 1;

        Some(self.classify(index, text).map(|body| Document {
            index,
            separator: separator.to_string(),
            text: text.to_string(),
            body,
        }))
    }
}

/// Parse a whole stream into documents
///
/// # Errors
/// In strict mode, returns `MalformedManifest` for the first non-resource document
pub fn parse_manifests(input: &str, strict: bool) -> Result<Vec<Document>> {
    ManifestParser::new(input, strict).collect()
}

/// Whether a raw line (with or without its line ending) separates documents
pub fn is_separator_line(line: &str) -> bool {
    let line = line.trim_end_matches(['\n', '\r']);
    match line.strip_prefix(DOCUMENT_SEPARATOR) {
        Some(rest) => {
            rest.trim().is_empty()
                || (rest.starts_with([' ', '\t']) && rest.trim_start().starts_with('#'))
        }
        None => false,
    }
}

fn is_blank_document(text: &str) -> bool {
    text.lines().all(|line| {
        let trimmed = line.trim();
        trimmed.is_empty() || trimmed.starts_with('#') || trimmed == "..."
    })
}

fn classify_text(text: &str) -> std::result::Result<DocumentBody, String> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    let Value::Mapping(body) = value else {
        return Err("top level is not a mapping".to_string());
    };

    let kind = scalar_field(&body, "kind").unwrap_or_default();
    if kind.ends_with("List") {
        if let Some(Value::Sequence(items)) = body.get("items") {
            return classify_list(kind, items, body.clone()).map(DocumentBody::List);
        }
    }

    Resource::from_mapping(body).map(DocumentBody::Resource)
}

fn classify_list(
    kind: String,
    items: &[Value],
    body: Mapping,
) -> std::result::Result<ResourceList, String> {
    let items = items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Mapping(mapping) => Resource::from_mapping(mapping.clone())
                .map_err(|reason| format!("item {i}: {reason}")),
            _ => Err(format!("item {i} is not a mapping")),
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ResourceList { kind, items, body })
}

fn scalar_field(mapping: &Mapping, key: &str) -> Option<String> {
    mapping.get(key).and_then(scalar_to_string)
}

/// Text of a scalar value; `None` for collections
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

fn string_map(
    metadata: &Mapping,
    field: &str,
) -> std::result::Result<BTreeMap<String, String>, String> {
    match metadata.get(field) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Mapping(entries)) => entries
            .iter()
            .map(|(k, v)| match (scalar_to_string(k), scalar_to_string(v)) {
                (Some(k), Some(v)) => Ok((k, v)),
                _ => Err(format!("metadata.{field} holds a non-scalar entry")),
            })
            .collect(),
        Some(_) => Err(format!("metadata.{field} is not a mapping")),
    }
}

fn write_string_map(
    metadata: &mut Mapping,
    field: &str,
    current: &BTreeMap<String, String>,
    original: &BTreeMap<String, String>,
) {
    if current == original {
        return;
    }
    let entry = metadata
        .entry(Value::from(field))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !entry.is_mapping() {
        *entry = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(entries) = entry {
        for (key, value) in current {
            if original.get(key) == Some(value) {
                continue;
            }
            // replace in place when the key was written as a string
            entries.insert(Value::from(key.as_str()), Value::from(value.as_str()));
        }
    }
}
