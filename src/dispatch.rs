//! Command Dispatch
//!
//! Classifies a wrapped command line: which tool, which verb, and whether the
//! manifests it renders or applies have to be intercepted. Labeler's own flags
//! are extracted here so that the tool never sees them.

use std::fmt;
use std::path::Path;

use crate::config::LabelSet;
use crate::error::{Error, Result};
use crate::inject::{InjectOptions, MergePolicy};
use crate::similarity::closest_match;
use crate::sources::ManifestSource;

/// Marker after which no flag is interpreted
const END_OF_FLAGS: &str = "--";

/// Wrapped tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Kubectl,
    Kustomize,
    Helm,
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::Kubectl, Tool::Kustomize, Tool::Helm];

    /// Recognize a tool name or its short alias (`k`, `h`)
    pub fn from_arg(arg: &str) -> Option<Tool> {
        match arg {
            "kubectl" | "k" => Some(Tool::Kubectl),
            "kustomize" => Some(Tool::Kustomize),
            "helm" | "h" => Some(Tool::Helm),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Kubectl => "kubectl",
            Tool::Kustomize => "kustomize",
            Tool::Helm => "helm",
        }
    }

    /// Global flags that take their value as the next argument
    fn value_flags(&self) -> &'static [&'static str] {
        match self {
            Tool::Kubectl => &[
                "-n",
                "--namespace",
                "--context",
                "--kubeconfig",
                "--cluster",
                "--user",
                "-s",
                "--server",
                "--token",
                "--as",
                "--as-group",
                "--as-uid",
                "--cache-dir",
                "--certificate-authority",
                "--client-certificate",
                "--client-key",
                "--request-timeout",
                "--tls-server-name",
                "-v",
            ],
            Tool::Kustomize => &[],
            Tool::Helm => &[
                "-n",
                "--namespace",
                "--kube-context",
                "--kubeconfig",
                "--kube-apiserver",
                "--kube-as-user",
                "--kube-as-group",
                "--kube-ca-file",
                "--kube-tls-server-name",
                "--kube-token",
                "--burst-limit",
                "--qps",
                "--registry-config",
                "--repository-cache",
                "--repository-config",
            ],
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse a tool name, suggesting the closest known one on failure
///
/// # Errors
/// Returns `InvalidInvocation` for an unknown name
pub fn parse_tool(arg: &str) -> Result<Tool> {
    Tool::from_arg(arg).ok_or_else(|| {
        let names: Vec<&str> = Tool::ALL.iter().map(Tool::name).collect();
        let message = match closest_match(arg, &names) {
            Some(suggestion) => format!("unknown tool '{arg}', did you mean '{suggestion}'?"),
            None => format!(
                "unknown tool '{}', expected one of: {}",
                arg,
                names.join(", ")
            ),
        };
        Error::invalid_invocation(message)
    })
}

/// How an invocation is executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Forward arguments unmodified
    PassThrough,

    /// Run the tool, label what it prints, print the result
    Render,

    /// Read manifests locally, label them, and apply them through `-f -`
    ApplyManifests {
        sources: Vec<ManifestSource>,

        /// `-R`/`--recursive` was given
        recursive: bool,

        /// Tool arguments with the sources replaced by `-f -`
        args: Vec<String>,
    },

    /// Let helm pipe rendered manifests through labeler as a post-renderer
    HelmPostRender,
}

impl Plan {
    /// Whether manifests flow through labeler
    pub fn intercepts(&self) -> bool {
        !matches!(self, Plan::PassThrough)
    }
}

/// Classified command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,

    /// First positional argument
    pub verb: Option<String>,

    pub plan: Plan,

    /// Tool arguments with labeler flags removed
    pub args: Vec<String>,

    pub labels: LabelSet,
    pub annotations: LabelSet,
    pub overwrite: bool,
    pub strict: bool,
    pub debug: bool,
}

impl Invocation {
    /// Fold in options given before the tool name
    ///
    /// Pairs given after the tool name win over leading pairs with the same key.
    pub fn merge_leading(
        &mut self,
        labels: &LabelSet,
        annotations: &LabelSet,
        overwrite: bool,
        strict: bool,
    ) {
        let mut merged = labels.clone();
        merged.extend(&self.labels);
        self.labels = merged;

        let mut merged = annotations.clone();
        merged.extend(&self.annotations);
        self.annotations = merged;

        self.overwrite |= overwrite;
        self.strict |= strict;
    }

    /// Arguments for a helm run that uses `exe` as its post-renderer
    pub fn post_renderer_args(&self, exe: &Path, options: &InjectOptions) -> Vec<String> {
        let mut flags = Vec::new();
        for (key, value) in options.labels.iter() {
            flags.push(format!("--label={key}={value}"));
        }
        for (key, value) in options.annotations.iter() {
            flags.push(format!("--annotation={key}={value}"));
        }
        if options.policy == MergePolicy::Overwrite {
            flags.push("--overwrite".to_string());
        }
        if options.strict {
            flags.push("--strict".to_string());
        }

        let mut extra = vec![
            "--post-renderer".to_string(),
            exe.display().to_string(),
        ];
        extra.extend(
            flags
                .into_iter()
                .map(|flag| format!("--post-renderer-args={flag}")),
        );
        insert_before_end_of_flags(&self.args, extra)
    }
}

/// Classify a command line for `tool`
///
/// # Errors
/// - `InvalidInvocation` if a labeler flag lacks its value, or helm already has
///   a post-renderer
/// - `LabelValidation` if a label pair is not `key=value`
pub fn parse_invocation(tool: Tool, args: &[String]) -> Result<Invocation> {
    let verb = find_verb(tool, args);
    let plan_kind = classify(tool, verb.as_deref());
    let intercepting = plan_kind != PlanKind::PassThrough;

    let extracted = extract_labeler_flags(args, intercepting)?;

    let plan = match plan_kind {
        PlanKind::PassThrough => Plan::PassThrough,
        PlanKind::Render => Plan::Render,
        PlanKind::Apply => apply_plan(&extracted.args)?,
        PlanKind::HelmPostRender => {
            if has_flag(&extracted.args, "--post-renderer") {
                return Err(Error::invalid_invocation(
                    "--post-renderer is already set; labeler cannot chain post-renderers",
                ));
            }
            Plan::HelmPostRender
        }
    };

    Ok(Invocation {
        tool,
        verb,
        plan,
        args: extracted.args,
        labels: extracted.labels,
        annotations: extracted.annotations,
        overwrite: extracted.overwrite,
        strict: extracted.strict,
        debug: extracted.debug,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanKind {
    PassThrough,
    Render,
    Apply,
    HelmPostRender,
}

fn classify(tool: Tool, verb: Option<&str>) -> PlanKind {
    match (tool, verb) {
        (Tool::Kubectl, Some("apply" | "create" | "replace" | "diff")) => PlanKind::Apply,
        (Tool::Kubectl, Some("kustomize"))
        | (Tool::Kustomize, Some("build"))
        | (Tool::Helm, Some("template")) => PlanKind::Render,
        (Tool::Helm, Some("install" | "upgrade")) => PlanKind::HelmPostRender,
        _ => PlanKind::PassThrough,
    }
}

/// First positional argument, skipping flag values
fn find_verb(tool: Tool, args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == END_OF_FLAGS {
            return None;
        }
        if !arg.starts_with('-') || arg == "-" {
            return Some(arg.clone());
        }
        if !arg.contains('=') && takes_value(tool, arg) {
            iter.next();
        }
    }
    None
}

fn takes_value(tool: Tool, flag: &str) -> bool {
    matches!(flag, "-l" | "--label" | "--annotation" | "--l-annotation")
        || tool.value_flags().contains(&flag)
}

/// Labeler flags pulled out of a command line
#[derive(Debug, Default)]
struct Extracted {
    args: Vec<String>,
    labels: LabelSet,
    annotations: LabelSet,
    overwrite: bool,
    strict: bool,
    debug: bool,
}

fn extract_labeler_flags(args: &[String], intercepting: bool) -> Result<Extracted> {
    let mut extracted = Extracted::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == END_OF_FLAGS {
            extracted.args.push(arg.clone());
            extracted.args.extend(iter.by_ref().cloned());
            break;
        }

        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) if name.starts_with("--") => (name, Some(value)),
            _ => (arg.as_str(), None),
        };

        let field = match name {
            "--label" => Some(FlagField::Label),
            "--annotation" | "--l-annotation" => Some(FlagField::Annotation),
            "-l" if intercepting => Some(FlagField::Label),
            _ => None,
        };

        if let Some(field) = field {
            let value = match inline {
                Some(value) => value.to_string(),
                None => iter.next().cloned().ok_or_else(|| {
                    Error::invalid_invocation(format!("{name} requires a key=value argument"))
                })?,
            };
            match field {
                FlagField::Label => extracted.labels.push_arg(&value)?,
                FlagField::Annotation => extracted.annotations.push_pair(&value)?,
            }
            continue;
        }

        // -l=key=value and -lkey=value
        if intercepting && arg.starts_with("-l") && arg.len() > 2 && !arg.starts_with("--") {
            let value = arg[2..].strip_prefix('=').unwrap_or(&arg[2..]);
            extracted.labels.push_arg(value)?;
            continue;
        }

        match name {
            "--overwrite" if intercepting => {
                    extracted.overwrite = parse_bool_flag(name, inline)?;
            }
            "--l-strict" => {
                    extracted.strict = parse_bool_flag(name, inline)?;
            }
            "--l-debug" => {
                    extracted.debug = parse_bool_flag(name, inline)?;
            }
            _ => extracted.args.push(arg.clone()),
        }
    }

    Ok(extracted)
}

#[derive(Debug, Clone, Copy)]
enum FlagField {
    Label,
    Annotation,
}

fn parse_bool_flag(name: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None | Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(Error::invalid_invocation(format!(
            "{name} expects true or false, got '{other}'"
        ))),
    }
}

/// Pull `-f`/`-k`/`-R` out of kubectl arguments
///
/// Without any source the command is passed through as is.
fn apply_plan(args: &[String]) -> Result<Plan> {
    let mut sources = Vec::new();
    let mut recursive = false;
    let mut rest = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == END_OF_FLAGS {
            rest.push(arg.clone());
            rest.extend(iter.by_ref().cloned());
            break;
        }

        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (arg.as_str(), None),
        };

        let kustomize = match name {
            "-f" | "--filename" => false,
            "-k" | "--kustomize" => true,
            "-R" | "--recursive" => {
                recursive = parse_bool_flag(name, inline.as_deref())?;
                continue;
            }
            _ => {
                rest.push(arg.clone());
                continue;
            }
        };

        let value = match inline {
            Some(value) => value,
            None => iter.next().cloned().ok_or_else(|| {
                Error::invalid_invocation(format!("{name} requires an argument"))
            })?,
        };
        sources.push(ManifestSource::classify(&value, kustomize));
    }

    if sources.is_empty() {
        return Ok(Plan::PassThrough);
    }

    let args = insert_before_end_of_flags(&rest, vec!["-f".to_string(), "-".to_string()]);
    Ok(Plan::ApplyManifests {
        sources,
        recursive,
        args,
    })
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter()
        .take_while(|arg| *arg != END_OF_FLAGS)
        .any(|arg| arg == flag || arg.strip_prefix(flag).is_some_and(|r| r.starts_with('=')))
}

fn insert_before_end_of_flags(args: &[String], extra: Vec<String>) -> Vec<String> {
    let at = args
        .iter()
        .position(|arg| arg == END_OF_FLAGS)
        .unwrap_or(args.len());
    let mut result = args[..at].to_vec();
    result.extend(extra);
    result.extend_from_slice(&args[at..]);
    result
}
