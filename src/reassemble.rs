//! Stream Reassembly
//!
//! Re-emits documents as a multi-document stream. Untouched documents are copied
//! verbatim; modified resources are patched line by line so that only label and
//! annotation entries change. Layouts the line editor does not understand (flow
//! mappings, anchors, block scalars, JSON) fall back to structured serialization.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::manifest::{Document, DocumentBody, Resource};

/// Re-serialize documents into one stream
///
/// # Errors
/// Returns `Serialization` with the document index if a document cannot be re-emitted
pub fn reassemble(documents: &[Document]) -> Result<String> {
    let mut out = String::new();
    for document in documents {
        out.push_str(&document.separator);
        out.push_str(&render_document(document)?);
    }
    Ok(out)
}

/// Render a single document's text (without its separator)
///
/// # Errors
/// Returns `Serialization` if structured serialization fails
pub fn render_document(document: &Document) -> Result<Cow<'_, str>> {
    if !document.is_modified() {
        return Ok(Cow::Borrowed(&document.text));
    }

    match &document.body {
        DocumentBody::Resource(resource) => match patch_resource_text(&document.text, resource) {
            Some(patched) => Ok(Cow::Owned(patched)),
            None => {
                tracing::debug!(
                    "document {} cannot be patched in place, re-serializing {}",
                    document.index,
                    resource.reference()
                );
                serialize_structured(document.index, &document.text, &resource.to_value())
                    .map(Cow::Owned)
            }
        },
        DocumentBody::List(list) => {
            serialize_structured(document.index, &document.text, &list.to_value()).map(Cow::Owned)
        }
        DocumentBody::PassThrough => Ok(Cow::Borrowed(&document.text)),
    }
}

/// Patch label and annotation entries into the raw text of a resource
///
/// Returns `None` when the layout cannot be edited safely or the edited text
/// does not parse back to the expected document.
fn patch_resource_text(text: &str, resource: &Resource) -> Option<String> {
    let mut editor = LineEditor::new(text);

    for (key, value) in changed_entries(&resource.labels, resource.original_labels()) {
        editor.set_entry("labels", key, value)?;
    }
    for (key, value) in changed_entries(&resource.annotations, resource.original_annotations()) {
        editor.set_entry("annotations", key, value)?;
    }

    let patched = editor.finish();
    let reparsed: Value = serde_yaml::from_str(&patched).ok()?;
    (reparsed == resource.to_value()).then_some(patched)
}

fn changed_entries<'a>(
    current: &'a BTreeMap<String, String>,
    original: &'a BTreeMap<String, String>,
) -> impl Iterator<Item = (&'a str, &'a str)> {
    current
        .iter()
        .filter(move |(key, value)| original.get(*key) != Some(*value))
        .map(|(key, value)| (key.as_str(), value.as_str()))
}

fn serialize_structured(index: usize, text: &str, value: &Value) -> Result<String> {
    let yaml = serde_yaml::to_string(value).map_err(|e| Error::Serialization {
        index,
        reason: e.to_string(),
    })?;

    // keep header comments such as helm's "# Source:" lines
    let header: String = text
        .split_inclusive('\n')
        .take_while(|line| {
            let trimmed = line.trim();
            trimmed.is_empty() || trimmed.starts_with('#')
        })
        .collect();

    Ok(header + &yaml)
}

/// Render a string as a single-line YAML scalar
///
/// Values that YAML 1.1 parsers (which kubectl and helm use) would read as
/// booleans or numbers are single-quoted.
fn render_scalar(value: &str) -> Option<String> {
    let rendered = serde_yaml::to_string(value).ok()?;
    let rendered = rendered.trim_end_matches('\n');
    if rendered.contains('\n') {
        return None;
    }
    if !rendered.starts_with(['\'', '"']) && is_yaml11_ambiguous(value) {
        return Some(format!("'{}'", value.replace('\'', "''")));
    }
    Some(rendered.to_string())
}

fn is_yaml11_ambiguous(value: &str) -> bool {
    const BOOL_WORDS: &[&str] = &["y", "yes", "n", "no", "on", "off", "true", "false"];
    if BOOL_WORDS.contains(&value.to_ascii_lowercase().as_str()) {
        return true;
    }
    value.bytes().any(|b| b.is_ascii_digit())
        && value
            .bytes()
            .all(|b| b.is_ascii_hexdigit() || b"._+-:xXoObB".contains(&b))
}

#[derive(Debug)]
struct Line {
    content: String,
    ending: &'static str,
}

/// Line-oriented editor for block-style YAML documents
struct LineEditor {
    lines: Vec<Line>,
    eol: &'static str,
}

impl LineEditor {
    fn new(text: &str) -> Self {
        let lines: Vec<Line> = text
            .split_inclusive('\n')
            .map(|piece| {
                if let Some(content) = piece.strip_suffix("\r\n") {
                    Line {
                        content: content.to_string(),
                        ending: "\r\n",
                    }
                } else if let Some(content) = piece.strip_suffix('\n') {
                    Line {
                        content: content.to_string(),
                        ending: "\n",
                    }
                } else {
                    Line {
                        content: piece.to_string(),
                        ending: "",
                    }
                }
            })
            .collect();
        let eol = if lines.iter().any(|l| l.ending == "\r\n") {
            "\r\n"
        } else {
            "\n"
        };
        Self { lines, eol }
    }

    fn finish(self) -> String {
        self.lines
            .iter()
            .flat_map(|line| [line.content.as_str(), line.ending])
            .collect()
    }

    fn is_content(&self, i: usize) -> bool {
        let trimmed = self.lines[i].content.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    }

    fn indent(&self, i: usize) -> usize {
        indent_of(&self.lines[i].content)
    }

    /// Insert a line before `at`, keeping a missing final newline missing
    fn insert(&mut self, at: usize, content: String) {
        if at == self.lines.len() {
            if let Some(last) = self.lines.last_mut() {
                if last.ending.is_empty() {
                    last.ending = self.eol;
                    self.lines.push(Line {
                        content,
                        ending: "",
                    });
                    return;
                }
            }
        }
        self.lines.insert(
            at,
            Line {
                content,
                ending: self.eol,
            },
        );
    }

    /// Index just past the last content line nested deeper than `indent`
    fn block_end(&self, start: usize, indent: usize) -> usize {
        let mut end = start + 1;
        for i in start + 1..self.lines.len() {
            if !self.is_content(i) {
                continue;
            }
            if self.indent(i) <= indent {
                break;
            }
            end = i + 1;
        }
        end
    }

    fn first_content_indent(&self, from: usize, to: usize) -> Option<usize> {
        (from..to).find(|&i| self.is_content(i)).map(|i| self.indent(i))
    }

    fn find_key(&self, from: usize, to: usize, indent: usize, key: &str) -> Option<usize> {
        (from..to).find(|&i| {
            self.is_content(i)
                && self.indent(i) == indent
                && split_key(&self.lines[i].content).is_some_and(|k| k.key == key)
        })
    }

    /// Make the mapping key at line `i` an empty block mapping
    ///
    /// Returns `None` if the key already holds an inline value other than `{}`.
    fn open_block(&mut self, i: usize) -> Option<()> {
        let parsed = split_key(&self.lines[i].content)?;
        match parsed.rest {
            "" => Some(()),
            "{}" => {
                let key_text = self.lines[i].content[..parsed.key_end].to_string();
                self.lines[i].content = format!("{key_text}:");
                Some(())
            }
            _ => None,
        }
    }

    /// Set `metadata.<field>.<key>` to `value`, creating missing blocks
    fn set_entry(&mut self, field: &str, key: &str, value: &str) -> Option<()> {
        let rendered_value = render_scalar(value)?;

        let metadata = match self.find_key(0, self.lines.len(), 0, "metadata") {
            Some(i) => i,
            None => {
                let at = (0..self.lines.len())
                    .rev()
                    .find(|&i| !self.lines[i].content.trim().is_empty())
                    .map_or(0, |i| i + 1);
                self.insert(at, "metadata:".to_string());
                at
            }
        };
        self.open_block(metadata)?;

        let metadata_end = self.block_end(metadata, 0);
        let child_indent = self
            .first_content_indent(metadata + 1, metadata_end)
            .unwrap_or(2);

        let field_line = match self.find_key(metadata + 1, metadata_end, child_indent, field) {
            Some(i) => i,
            None => {
                self.insert(metadata_end, format!("{}{}:", " ".repeat(child_indent), field));
                metadata_end
            }
        };
        self.open_block(field_line)?;

        let field_end = self.block_end(field_line, child_indent);
        let entry_indent = self
            .first_content_indent(field_line + 1, field_end)
            .unwrap_or(child_indent * 2);
        if entry_indent <= child_indent {
            return None;
        }

        for i in field_line + 1..field_end {
            if !self.is_content(i) {
                continue;
            }
            if self.indent(i) != entry_indent {
                // continuation of a multi-line value
                return None;
            }
            let parsed = split_key(&self.lines[i].content)?;
            if parsed.key != key {
                continue;
            }
            if !is_simple_scalar(parsed.rest) {
                return None;
            }
            let key_text = self.lines[i].content[..parsed.key_end].to_string();
            self.lines[i].content = format!("{key_text}: {rendered_value}");
            return Some(());
        }

        let rendered_key = render_scalar(key)?;
        self.insert(
            field_end,
            format!("{}{}: {}", " ".repeat(entry_indent), rendered_key, rendered_value),
        );
        Some(())
    }
}

/// A block mapping key parsed from one line
struct KeyLine<'a> {
    /// Unquoted key
    key: String,

    /// Byte offset just past the key text (before the colon)
    key_end: usize,

    /// Inline value with any trailing comment removed
    rest: &'a str,
}

fn indent_of(content: &str) -> usize {
    content.len() - content.trim_start_matches(' ').len()
}

fn split_key(content: &str) -> Option<KeyLine<'_>> {
    let offset = indent_of(content);
    let s = &content[offset..];

    let (key, key_len) = match s.as_bytes().first()? {
        b'"' | b'\'' => {
            let len = quoted_len(s)?;
            let key: String = serde_yaml::from_str(&s[..len]).ok()?;
            (key, len)
        }
        b'-' | b'?' | b'{' | b'[' | b'#' | b'&' | b'*' | b'!' | b'|' | b'>' => return None,
        _ => {
            let colon = plain_key_colon(s)?;
            (s[..colon].trim_end().to_string(), s[..colon].trim_end().len())
        }
    };

    let after_key = s[key_len..].trim_start_matches([' ', '\t']);
    let rest = after_key.strip_prefix(':')?;
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    let rest = rest.trim();
    let rest = if rest.starts_with('#') { "" } else { rest };

    Some(KeyLine {
        key,
        key_end: offset + key_len,
        rest,
    })
}

/// Length of a leading quoted scalar, including both quotes
fn quoted_len(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let quote = bytes[0];
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quote == b'"' => i += 2,
            b'\'' if quote == b'\'' && bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b if b == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Position of the colon ending a plain key
fn plain_key_colon(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    (0..bytes.len()).find(|&i| {
        bytes[i] == b':' && matches!(bytes.get(i + 1), None | Some(b' ') | Some(b'\t'))
    })
}

fn is_simple_scalar(rest: &str) -> bool {
    !rest.is_empty() && !rest.starts_with(['|', '>', '&', '*', '!', '[', '{'])
}
