//! # labeler
//!
//! Label injection for Kubernetes manifests, wrapping kubectl, kustomize and helm
//!
//! ## Features
//! - Labels every resource a wrapped command renders or applies
//! - Preserve-existing or overwrite merge policies
//! - Lossless multi-document YAML round trips
//! - Helm post-renderer integration for install and upgrade

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod inject;
pub mod manifest;
pub mod reassemble;
pub mod runner;
pub mod similarity;
pub mod sources;

pub use config::{LabelSet, LabelerConfig};
pub use dispatch::{parse_invocation, Invocation, Plan, Tool};
pub use engine::{transform_stream, Labeler, Outcome};
pub use error::{Error, Result};
pub use inject::{InjectOptions, InjectionReport, MergePolicy};
pub use manifest::{parse_manifests, Document, Resource};
pub use runner::{ProcessRunner, ToolRunner};

/// Label every resource of a manifest stream
///
/// # Examples
///
/// ```rust
/// let labels: labeler::LabelSet = "app.kubernetes.io/part-of=sample".parse()?;
/// let input = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
///
/// let output = labeler::label_manifests(input, &labels, false)?;
/// assert!(output.contains("app.kubernetes.io/part-of: sample"));
/// # Ok::<(), labeler::Error>(())
/// ```
///
/// # Errors
/// Returns an error if a label is invalid or a document cannot be re-emitted
pub fn label_manifests(input: &str, labels: &LabelSet, overwrite: bool) -> Result<String> {
    let options = InjectOptions {
        labels: labels.clone(),
        policy: MergePolicy::from_overwrite(overwrite),
        ..Default::default()
    };
    options.validate()?;

    let (output, _) = transform_stream(input.as_bytes(), &options)?;
    Ok(output)
}
