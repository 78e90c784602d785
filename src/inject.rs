//! Label Injection
//!
//! Merges requested labels and annotations into parsed resources and records
//! what changed

use std::collections::BTreeMap;

use crate::config::LabelSet;
use crate::error::Result;
use crate::manifest::{Document, DocumentBody, Resource};

/// Policy for keys that already exist on a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep existing values, only add missing keys
    #[default]
    PreserveExisting,

    /// Replace existing values
    Overwrite,
}

impl MergePolicy {
    pub fn from_overwrite(overwrite: bool) -> Self {
        if overwrite {
            MergePolicy::Overwrite
        } else {
            MergePolicy::PreserveExisting
        }
    }
}

/// Which metadata field an operation touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Label,
    Annotation,
}

/// Outcome for a single requested key on a single resource
#[derive(Debug, Clone, PartialEq)]
pub enum LabelOperation {
    /// Key was missing and has been added
    Added { key: String, value: String },

    /// Key existed with another value and has been replaced
    Replaced {
        key: String,
        previous: String,
        value: String,
    },

    /// Key existed with another value and was kept
    Preserved {
        key: String,
        existing: String,
        requested: String,
    },

    /// Key already had the requested value
    Unchanged { key: String },
}

/// Operations applied to one resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReport {
    /// Index of the document the resource came from
    pub document: usize,

    /// `Kind/name` reference
    pub resource: String,

    pub operations: Vec<(MetadataField, LabelOperation)>,
}

/// Injection result
#[derive(Debug, Clone, Default)]
pub struct InjectionReport {
    /// Per-resource operations, in stream order
    pub resources: Vec<ResourceReport>,

    /// Number of keys added
    pub added: u32,

    /// Number of keys replaced
    pub replaced: u32,

    /// Number of keys kept because overwrite was off
    pub preserved: u32,

    /// Number of keys that already had the requested value
    pub unchanged: u32,

    /// Number of documents passed through without inspection
    pub passed_through: u32,
}

impl InjectionReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource's operations and update statistics
    pub fn add_resource(&mut self, report: ResourceReport) {
        for (_, operation) in &report.operations {
            match operation {
                LabelOperation::Added { .. } => self.added += 1,
                LabelOperation::Replaced { .. } => self.replaced += 1,
                LabelOperation::Preserved { .. } => self.preserved += 1,
                LabelOperation::Unchanged { .. } => self.unchanged += 1,
            }
        }
        self.resources.push(report);
    }

    pub fn add_pass_through(&mut self) {
        self.passed_through += 1;
    }

    /// Whether any resource was modified
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.replaced > 0
    }

    /// Number of resources seen
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

/// Merge requested pairs into an existing map
///
/// Returns the merged map and one operation per requested key.
pub fn merge_map(
    existing: &BTreeMap<String, String>,
    requested: &LabelSet,
    policy: MergePolicy,
) -> (BTreeMap<String, String>, Vec<LabelOperation>) {
    let mut merged = existing.clone();
    let mut operations = Vec::with_capacity(requested.len());

    for (key, value) in requested.iter() {
        let operation = match existing.get(key) {
            None => {
                merged.insert(key.to_string(), value.to_string());
                LabelOperation::Added {
                    key: key.to_string(),
                    value: value.to_string(),
                }
            }
            Some(current) if current == value => LabelOperation::Unchanged {
                key: key.to_string(),
            },
            Some(current) => match policy {
                MergePolicy::Overwrite => {
                    merged.insert(key.to_string(), value.to_string());
                    LabelOperation::Replaced {
                        key: key.to_string(),
                        previous: current.clone(),
                        value: value.to_string(),
                    }
                }
                MergePolicy::PreserveExisting => LabelOperation::Preserved {
                    key: key.to_string(),
                    existing: current.clone(),
                    requested: value.to_string(),
                },
            },
        };
        operations.push(operation);
    }

    (merged, operations)
}

/// Return a copy of the resource with the label set merged into its labels
pub fn inject_labels(resource: &Resource, labels: &LabelSet, policy: MergePolicy) -> Resource {
    let (merged, _) = merge_map(&resource.labels, labels, policy);
    let mut result = resource.clone();
    result.labels = merged;
    result
}

/// Return a copy of the resource with the set merged into its annotations
pub fn inject_annotations(
    resource: &Resource,
    annotations: &LabelSet,
    policy: MergePolicy,
) -> Resource {
    let (merged, _) = merge_map(&resource.annotations, annotations, policy);
    let mut result = resource.clone();
    result.annotations = merged;
    result
}

/// Injection options for one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InjectOptions {
    pub labels: LabelSet,
    pub annotations: LabelSet,
    pub policy: MergePolicy,

    /// Fail on documents that are not resources
    pub strict: bool,
}

impl InjectOptions {
    /// Whether there is anything to inject
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }

    /// Validate labels and annotation keys
    ///
    /// # Errors
    /// Returns the first invalid key or value
    pub fn validate(&self) -> Result<()> {
        self.labels.validate_labels()?;
        self.annotations.validate_annotations()
    }
}

/// Label Injector
///
/// Applies one set of options to every document of a stream
pub struct Injector<'a> {
    options: &'a InjectOptions,
}

impl<'a> Injector<'a> {
    pub fn new(options: &'a InjectOptions) -> Self {
        Self { options }
    }

    /// Inject into a single resource, returning the new resource and its operations
    pub fn inject_resource(
        &self,
        resource: &Resource,
    ) -> (Resource, Vec<(MetadataField, LabelOperation)>) {
        let policy = self.options.policy;
        let (labels, label_ops) = merge_map(&resource.labels, &self.options.labels, policy);
        let (annotations, annotation_ops) =
            merge_map(&resource.annotations, &self.options.annotations, policy);

        let mut result = resource.clone();
        result.labels = labels;
        result.annotations = annotations;

        let operations = label_ops
            .into_iter()
            .map(|op| (MetadataField::Label, op))
            .chain(
                annotation_ops
                    .into_iter()
                    .map(|op| (MetadataField::Annotation, op)),
            )
            .collect();

        (result, operations)
    }

    /// Inject into every resource a document carries
    pub fn inject_document(&self, document: Document, report: &mut InjectionReport) -> Document {
        let index = document.index;
        let body = match document.body {
            DocumentBody::Resource(resource) => {
                let (resource, operations) = self.inject_resource(&resource);
                report.add_resource(ResourceReport {
                    document: index,
                    resource: resource.reference(),
                    operations,
                });
                DocumentBody::Resource(resource)
            }
            DocumentBody::List(mut list) => {
                for item in list.items.iter_mut() {
                    let (injected, operations) = self.inject_resource(item);
                    report.add_resource(ResourceReport {
                        document: index,
                        resource: injected.reference(),
                        operations,
                    });
                    *item = injected;
                }
                DocumentBody::List(list)
            }
            DocumentBody::PassThrough => {
                report.add_pass_through();
                DocumentBody::PassThrough
            }
        };

        Document { body, ..document }
    }
}
