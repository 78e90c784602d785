//! Manifest Sources
//!
//! Reads the inputs named by `-f`/`--filename` and `-k`/`--kustomize`: local
//! files and directories, standard input, and http(s) URLs.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use url::Url;

use crate::error::{Error, Result};
use crate::manifest::DOCUMENT_SEPARATOR;

/// Extensions kubectl reads when given a directory
pub const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// One `-f` or `-k` argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Local file or directory
    File(PathBuf),

    /// `-f -`
    Stdin,

    /// http(s) URL
    Url(String),

    /// Kustomization directory or remote target, rendered with `kubectl kustomize`
    Kustomization(String),
}

impl ManifestSource {
    /// Classify a flag value
    ///
    /// # Arguments
    /// - `value`: Value given to the flag
    /// - `kustomize`: Whether the flag was `-k`/`--kustomize`
    pub fn classify(value: &str, kustomize: bool) -> Self {
        if kustomize {
            return ManifestSource::Kustomization(value.to_string());
        }
        if value == "-" {
            return ManifestSource::Stdin;
        }
        match Url::parse(value) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                ManifestSource::Url(value.to_string())
            }
            _ => ManifestSource::File(PathBuf::from(value)),
        }
    }
}

/// Whether a path has a manifest extension
pub fn is_manifest_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
}

/// Files named by a `-f` path
///
/// A directory yields its manifest files in name order; subdirectories are
/// descended into only when `recursive` is set.
///
/// # Errors
/// Returns an IO error naming the path when it cannot be read
pub fn expand_path(path: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(path).map_err(|e| with_path(path, e))?;
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    collect_manifest_files(path, recursive, &mut files)?;
    Ok(files)
}

fn collect_manifest_files(dir: &Path, recursive: bool, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| with_path(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| with_path(dir, e))?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if recursive {
                collect_manifest_files(&path, recursive, files)?;
            }
        } else if is_manifest_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn with_path(path: &Path, error: std::io::Error) -> Error {
    Error::Io(std::io::Error::new(
        error.kind(),
        format!("{}: {}", path.display(), error),
    ))
}

/// Read a local file
///
/// # Errors
/// Returns an IO error naming the path
pub async fn read_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| with_path(path, e))
}

/// Read all of standard input
///
/// # Errors
/// Returns an IO error if stdin cannot be read or is not UTF-8
pub async fn read_stdin() -> Result<String> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    Ok(input)
}

/// Fetch a remote manifest
///
/// # Errors
/// Returns `Fetch` on connection failures and non-success status codes
pub async fn fetch_url(url: &str) -> Result<String> {
    let fetch_error = |source| Error::Fetch {
        url: url.to_string(),
        source,
    };

    tracing::info!("fetching manifests from {}", url);

    let client = reqwest::Client::builder()
        .user_agent(concat!("labeler/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(fetch_error)?;

    client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(fetch_error)?
        .text()
        .await
        .map_err(fetch_error)
}

/// Concatenate manifest chunks into one stream
///
/// Chunks are separated by a document separator line; a chunk lacking a final
/// newline gets one first.
pub fn join_streams<I, S>(chunks: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut stream = String::new();
    for chunk in chunks {
        let chunk = chunk.as_ref();
        if chunk.is_empty() {
            continue;
        }
        if !stream.is_empty() {
            if !stream.ends_with('\n') {
                stream.push('\n');
            }
            stream.push_str(DOCUMENT_SEPARATOR);
            stream.push('\n');
        }
        stream.push_str(chunk);
    }
    stream
}
