//! Configuration Management
//!
//! Label sets, label syntax validation and the optional labeler configuration file

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dispatch::Tool;
use crate::error::{Error, Result};

/// Convention-based configuration file names searched in order
pub const CONVENTION_CONFIG_FILES: &[&str] = &[".labeler.yaml", ".labeler.yml", ".labeler.json"];

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "LABELER_CONFIG";

/// Maximum length of a label value and of the name part of a key
const MAX_NAME_LEN: usize = 63;

/// Maximum length of a key prefix (DNS subdomain)
const MAX_PREFIX_LEN: usize = 253;

/// Label Set
///
/// Ordered key/value pairs requested on the command line or in configuration.
/// Pushing an existing key replaces its value, so the last occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    entries: Vec<(String, String)>,
}

impl LabelSet {
    /// Create an empty label set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair, replacing the value of an existing key
    pub fn push<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Add every `key=value` pair of a flag value (pairs separated by commas)
    ///
    /// # Errors
    /// Returns an error if a pair has no `=` or an empty key
    pub fn push_arg(&mut self, arg: &str) -> Result<()> {
        for pair in arg.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = parse_pair(pair)?;
            self.push(key, value);
        }
        Ok(())
    }

    /// Add a single `key=value` pair; commas stay part of the value
    ///
    /// # Errors
    /// Returns an error if there is no `=` or the key is empty
    pub fn push_pair(&mut self, pair: &str) -> Result<()> {
        let (key, value) = parse_pair(pair)?;
        self.push(key, value);
        Ok(())
    }

    /// Merge another set into this one; its values win
    pub fn extend(&mut self, other: &LabelSet) {
        for (key, value) in other.iter() {
            self.push(key, value);
        }
    }

    /// Look up a value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate every pair as a Kubernetes label
    ///
    /// # Errors
    /// Returns the first invalid key or value
    pub fn validate_labels(&self) -> Result<()> {
        for (key, value) in self.iter() {
            validate_key(key)?;
            validate_label_value(value)?;
        }
        Ok(())
    }

    /// Validate every key as a Kubernetes annotation key (values are free-form)
    ///
    /// # Errors
    /// Returns the first invalid key
    pub fn validate_annotations(&self) -> Result<()> {
        for (key, _) in self.iter() {
            validate_key(key)?;
        }
        Ok(())
    }
}

impl FromStr for LabelSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = LabelSet::new();
        set.push_arg(s)?;
        Ok(set)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = LabelSet::new();
        for (key, value) in iter {
            set.push(key, value);
        }
        set
    }
}

/// Split a single `key=value` pair
///
/// The value may itself contain `=`.
///
/// # Errors
/// Returns an error if there is no `=` or the key is empty
pub fn parse_pair(pair: &str) -> Result<(String, String)> {
    let (key, value) = pair.trim().split_once('=').ok_or_else(|| {
        Error::label_validation(format!("expected key=value, got '{}'", pair.trim()))
    })?;
    if key.is_empty() {
        return Err(Error::label_validation(format!(
            "label key cannot be empty: '{}'",
            pair.trim()
        )));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Validate a label or annotation key (`[prefix/]name`)
///
/// # Errors
/// Returns an error describing the offending part of the key
pub fn validate_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if !is_valid_dns_subdomain(prefix) {
            return Err(Error::label_validation(format!(
                "invalid key prefix '{prefix}' in '{key}' (expected a DNS subdomain of at most {MAX_PREFIX_LEN} characters)"
            )));
        }
    }

    if name.is_empty() || !is_valid_name_segment(name) {
        return Err(Error::label_validation(format!(
            "invalid key name '{name}' in '{key}' (at most {MAX_NAME_LEN} characters, alphanumeric at both ends, '-', '_' or '.' inside)"
        )));
    }

    Ok(())
}

/// Validate a label value; the empty string is allowed
///
/// # Errors
/// Returns an error if the value is too long or has invalid characters
pub fn validate_label_value(value: &str) -> Result<()> {
    if value.is_empty() || is_valid_name_segment(value) {
        Ok(())
    } else {
        Err(Error::label_validation(format!(
            "invalid label value '{value}' (at most {MAX_NAME_LEN} characters, alphanumeric at both ends, '-', '_' or '.' inside)"
        )))
    }
}

fn is_valid_name_segment(s: &str) -> bool {
    if s.len() > MAX_NAME_LEN {
        return false;
    }
    let bytes = s.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}

fn is_valid_dns_subdomain(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_PREFIX_LEN {
        return false;
    }
    s.split('.').all(|part| {
        let bytes = part.as_bytes();
        match (bytes.first(), bytes.last()) {
            (Some(first), Some(last)) => {
                is_lower_alnum(*first)
                    && is_lower_alnum(*last)
                    && bytes.iter().all(|b| is_lower_alnum(*b) || *b == b'-')
            }
            _ => false,
        }
    })
}

fn is_lower_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// Executables used for each wrapped tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
    pub kubectl: String,
    pub kustomize: String,
    pub helm: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            kustomize: "kustomize".to_string(),
            helm: "helm".to_string(),
        }
    }
}

impl ToolPaths {
    /// Executable to run for a tool
    pub fn program(&self, tool: Tool) -> &str {
        match tool {
            Tool::Kubectl => &self.kubectl,
            Tool::Kustomize => &self.kustomize,
            Tool::Helm => &self.helm,
        }
    }
}

/// Labeler Configuration
///
/// Defaults read from a configuration file; command line values take precedence
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelerConfig {
    /// Labels applied on every intercepted invocation
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations applied on every intercepted invocation
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Replace existing label values
    #[serde(default)]
    pub overwrite: bool,

    /// Fail on documents that are not Kubernetes resources
    #[serde(default)]
    pub strict: bool,

    /// Tool executables
    #[serde(default)]
    pub tools: ToolPaths,
}

impl LabelerConfig {
    /// Validate configuration
    ///
    /// # Errors
    /// - If a label key or value is invalid
    /// - If an annotation key is invalid
    /// - If a tool executable is empty
    pub fn validate(&self) -> Result<()> {
        self.label_set().validate_labels()?;
        self.annotation_set().validate_annotations()?;

        for tool in [Tool::Kubectl, Tool::Kustomize, Tool::Helm] {
            if self.tools.program(tool).trim().is_empty() {
                return Err(Error::config_validation(format!(
                    "Executable for {} cannot be empty",
                    tool.name()
                )));
            }
        }

        Ok(())
    }

    /// Configured labels as a label set
    pub fn label_set(&self) -> LabelSet {
        self.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Configured annotations as a label set
    pub fn annotation_set(&self) -> LabelSet {
        self.annotations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Load configuration from JSON file
///
/// # Errors
/// If file reading, parsing or validation fails
pub fn load_config_from_json<P: AsRef<Path>>(path: P) -> Result<LabelerConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: LabelerConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from YAML file
///
/// # Errors
/// If file reading, parsing or validation fails
pub fn load_config_from_yaml<P: AsRef<Path>>(path: P) -> Result<LabelerConfig> {
    let content = std::fs::read_to_string(path)?;
    // an empty file deserializes to unit, not to a mapping
    if content.trim().is_empty() {
        return Ok(LabelerConfig::default());
    }
    let config: LabelerConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file, detecting format by extension
///
/// # Errors
/// If file reading, parsing, or validation fails, or if the extension is unsupported
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> Result<LabelerConfig> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Configuration file not found: {}", path.display()),
        )
        .into());
    }

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => load_config_from_json(path),
        Some("yaml") | Some("yml") => load_config_from_yaml(path),
        _ => Err(Error::config_validation(
            "Configuration file must be .json, .yaml, or .yml",
        )),
    }
}

/// Search for a convention-based configuration file in the given directory
///
/// # Returns
/// The path to the first matching file, or `None` if no file is found
pub fn find_convention_config_in(dir: &Path) -> Option<PathBuf> {
    CONVENTION_CONFIG_FILES
        .iter()
        .map(|filename| dir.join(filename))
        .find(|path| path.is_file())
}

/// Resolve the configuration for this run
///
/// An explicit path wins, then `$LABELER_CONFIG`, then a convention file in
/// the current directory. Without any of those the defaults are used.
///
/// # Errors
/// If the selected file cannot be loaded
pub fn resolve_config(explicit: Option<&Path>) -> Result<LabelerConfig> {
    if let Some(path) = explicit {
        return load_config_from_file(path);
    }

    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        return load_config_from_file(PathBuf::from(path));
    }

    let cwd = std::env::current_dir()?;
    match find_convention_config_in(&cwd) {
        Some(path) => {
            tracing::debug!("using configuration file {}", path.display());
            load_config_from_file(path)
        }
        None => Ok(LabelerConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_set_last_occurrence_wins() {
        let mut set = LabelSet::new();
        set.push("app", "one");
        set.push("tier", "web");
        set.push("app", "two");

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("app"), Some("two"));
        let keys: Vec<&str> = set.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["app", "tier"]);
    }

    #[test]
    fn test_push_arg_comma_separated() {
        let set: LabelSet = "app.kubernetes.io/part-of=sample,tier=web".parse().unwrap();
        assert_eq!(set.get("app.kubernetes.io/part-of"), Some("sample"));
        assert_eq!(set.get("tier"), Some("web"));
    }

    #[test]
    fn test_push_pair_keeps_commas() {
        let mut set = LabelSet::new();
        set.push_pair("description=frontend, api and worker").unwrap();
        set.push_pair("note=a,b=c").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("description"), Some("frontend, api and worker"));
        assert_eq!(set.get("note"), Some("a,b=c"));
        assert!(set.push_pair("novalue").is_err());
    }

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("a=b").unwrap(),
            ("a".to_string(), "b".to_string())
        );
        assert_eq!(
            parse_pair("note=x=y").unwrap(),
            ("note".to_string(), "x=y".to_string())
        );
        assert_eq!(parse_pair("empty=").unwrap().1, "");

        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=value").is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("app").is_ok());
        assert!(validate_key("app.kubernetes.io/part-of").is_ok());
        assert!(validate_key("example.com/My_Label.v1").is_ok());

        assert!(validate_key("").is_err());
        assert!(validate_key("-app").is_err()); // Must start alphanumeric
        assert!(validate_key("app-").is_err()); // Must end alphanumeric
        assert!(validate_key("Example.com/app").is_err()); // Prefix must be lowercase
        assert!(validate_key("example.com/").is_err()); // No name
        assert!(validate_key(&"a".repeat(64)).is_err()); // Too long
    }

    #[test]
    fn test_validate_label_value() {
        assert!(validate_label_value("").is_ok());
        assert!(validate_label_value("sample-app").is_ok());
        assert!(validate_label_value("v1.2_3").is_ok());

        assert!(validate_label_value("has space").is_err());
        assert!(validate_label_value("trailing-").is_err());
        assert!(validate_label_value(&"v".repeat(64)).is_err());
    }

    #[test]
    fn test_annotations_allow_free_form_values() {
        let set: LabelSet = [("creator", "John Doe: ops team")].into_iter().collect();
        assert!(set.validate_annotations().is_ok());
        assert!(set.validate_labels().is_err());
    }

    #[test]
    fn test_tool_paths_default() {
        let tools = ToolPaths::default();
        assert_eq!(tools.program(Tool::Kubectl), "kubectl");
        assert_eq!(tools.program(Tool::Kustomize), "kustomize");
        assert_eq!(tools.program(Tool::Helm), "helm");
    }

    #[test]
    fn test_config_validation() {
        let mut config = LabelerConfig::default();
        assert!(config.validate().is_ok());

        config.labels.insert("bad key".to_string(), "x".to_string());
        assert!(config.validate().is_err());

        let mut config = LabelerConfig::default();
        config.tools.helm = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_valid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".labeler.yaml");
        std::fs::write(
            &path,
            "labels:\n  app.kubernetes.io/part-of: sample\noverwrite: true\ntools:\n  helm: /opt/helm\n",
        )
        .unwrap();

        let config = load_config_from_file(&path).unwrap();
        assert_eq!(config.label_set().get("app.kubernetes.io/part-of"), Some("sample"));
        assert!(config.overwrite);
        assert!(!config.strict);
        assert_eq!(config.tools.helm, "/opt/helm");
        assert_eq!(config.tools.kubectl, "kubectl");
    }

    #[test]
    fn test_load_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labeler.json");
        std::fs::write(&path, r#"{"labels":{"team":"platform"},"strict":true}"#).unwrap();

        let config = load_config_from_file(&path).unwrap();
        assert_eq!(config.label_set().get("team"), Some("platform"));
        assert!(config.strict);
    }

    #[test]
    fn test_load_empty_yaml_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".labeler.yml");
        std::fs::write(&path, "").unwrap();
        assert_eq!(load_config_from_file(&path).unwrap(), LabelerConfig::default());
    }

    #[test]
    fn test_load_config_with_invalid_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labeler.yaml");
        std::fs::write(&path, "labels:\n  team: not valid\n").unwrap();
        assert!(load_config_from_file(&path).is_err());
    }

    #[test]
    fn test_load_config_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labeler.toml");
        std::fs::write(&path, "").unwrap();
        assert!(load_config_from_file(&path).is_err());
    }

    #[test]
    fn test_load_config_not_found() {
        let path = PathBuf::from("/nonexistent/.labeler.yaml");
        assert!(load_config_from_file(&path).is_err());
    }

    #[test]
    fn test_find_convention_config_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".labeler.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".labeler.yaml"), "").unwrap();

        let found = find_convention_config_in(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), ".labeler.yaml");
    }

    #[test]
    fn test_find_convention_config_none_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_convention_config_in(dir.path()).is_none());
    }

    #[test]
    fn test_resolve_config_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.yaml");
        std::fs::write(&path, "labels:\n  env: dev\n").unwrap();

        let config = resolve_config(Some(&path)).unwrap();
        assert_eq!(config.label_set().get("env"), Some("dev"));
    }
}
