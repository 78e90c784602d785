//! labeler CLI
//!
//! Wraps kubectl, kustomize and helm and labels every resource they apply or render

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use labeler::{
    config::resolve_config,
    dispatch::{parse_invocation, parse_tool},
    error::EXIT_INVALID_INVOCATION,
    inject::{InjectionReport, LabelOperation, MetadataField},
    runner::ProcessRunner,
    sources, Error, Invocation, LabelSet, Labeler, Result, Tool,
};

/// Environment variable overriding the log filter
const LOG_ENV_VAR: &str = "LABELER_LOG";

/// labeler CLI
///
/// Label injection for kubectl, kustomize and helm
#[derive(Parser)]
#[command(
    name = "labeler",
    version,
    about = "Wraps kubectl, kustomize and helm and labels every resource they apply or render",
    long_about = "Wraps kubectl, kustomize and helm. Manifests the wrapped command renders or \
    applies are intercepted and labeled before they reach the cluster or the terminal; every \
    other command is forwarded unchanged. Without a tool, manifests are read from stdin (or -f) \
    and written labeled to stdout, which is also how helm runs labeler as a post-renderer."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Label to inject (key=value, several pairs may be comma-separated)
    #[arg(short = 'l', long = "label", value_name = "KEY=VALUE")]
    labels: Vec<String>,

    /// Annotation to inject (key=value, one pair per flag; the value may contain commas)
    #[arg(long = "annotation", value_name = "KEY=VALUE")]
    annotations: Vec<String>,

    /// Replace existing label values
    #[arg(long)]
    overwrite: bool,

    /// Fail on documents that are not Kubernetes resources
    #[arg(long)]
    strict: bool,

    /// Read manifests from a file instead of stdin
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    file: Option<PathBuf>,

    /// Configuration file path (JSON/YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run kubectl, labeling manifests for apply, create, replace, diff and kustomize
    #[command(visible_alias = "k", disable_help_flag = true)]
    Kubectl {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run kustomize, labeling the output of build
    #[command(disable_help_flag = true)]
    Kustomize {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run helm, labeling template output and install/upgrade releases
    #[command(visible_alias = "h", disable_help_flag = true)]
    Helm {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    #[command(external_subcommand)]
    External(Vec<String>),
}

#[tokio::main]
async fn main() {
    let code = match Cli::try_parse() {
        Ok(cli) => run(cli).await,
        Err(e) => {
            let code = if e.use_stderr() {
                EXIT_INVALID_INVOCATION
            } else {
                0
            };
            let _ = e.print();
            code
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let invocation = tool_invocation(&cli);
    let debug = cli.debug || matches!(&invocation, Ok(Some(inv)) if inv.debug);
    init_tracing(cli.verbose, debug);

    let result = match invocation {
        Ok(invocation) => execute(&cli, invocation).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(Error::SubprocessExit { tool, code }) => {
            // the tool has already reported on stderr
            tracing::debug!("{} exited with code {}", tool, code);
            code
        }
        Err(e) => {
            display_error(&e);
            e.exit_code()
        }
    }
}

/// Initialize logging on stderr; stdout carries manifests
fn init_tracing(verbose: bool, debug: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("warn,labeler=debug")
        } else if verbose {
            EnvFilter::new("warn,labeler=info")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Classify the wrapped command line; `None` in pipe mode
///
/// Options given before the tool name apply to the tool's manifests as well.
fn tool_invocation(cli: &Cli) -> Result<Option<Invocation>> {
    let (tool, args) = match &cli.command {
        None => return Ok(None),
        Some(Commands::Kubectl { args }) => (Tool::Kubectl, args.as_slice()),
        Some(Commands::Kustomize { args }) => (Tool::Kustomize, args.as_slice()),
        Some(Commands::Helm { args }) => (Tool::Helm, args.as_slice()),
        Some(Commands::External(args)) => match args.split_first() {
            Some((name, rest)) => (parse_tool(name)?, rest),
            None => return Err(Error::invalid_invocation("missing tool name")),
        },
    };

    if cli.file.is_some() {
        return Err(Error::invalid_invocation(format!(
            "-f/--file before the tool name only applies without a tool; pass it to {tool} instead"
        )));
    }

    let mut invocation = parse_invocation(tool, args)?;
    invocation.merge_leading(
        &parse_labels(&cli.labels)?,
        &parse_annotations(&cli.annotations)?,
        cli.overwrite,
        cli.strict,
    );
    Ok(Some(invocation))
}

async fn execute(cli: &Cli, invocation: Option<Invocation>) -> Result<i32> {
    let config = resolve_config(cli.config.as_deref())?;
    let labeler = Labeler::new(ProcessRunner::new(), config);

    match invocation {
        Some(invocation) => run_tool(&labeler, &invocation, cli.verbose).await,
        None => run_pipe(&labeler, cli).await,
    }
}

/// Execute a wrapped tool invocation
async fn run_tool(
    labeler: &Labeler<ProcessRunner>,
    invocation: &Invocation,
    verbose: bool,
) -> Result<i32> {
    tracing::debug!(
        "{} {:?}: {:?}",
        invocation.tool,
        invocation.verb,
        invocation.plan
    );

    let outcome = labeler.run(invocation, &mut std::io::stdout()).await?;
    if verbose {
        if let Some(report) = &outcome.report {
            display_report(report);
        }
    }

    Ok(outcome.exit_code)
}

/// Label manifests from stdin or a file (also the helm post-renderer entry point)
async fn run_pipe(labeler: &Labeler<ProcessRunner>, cli: &Cli) -> Result<i32> {
    let labels = parse_labels(&cli.labels)?;
    let annotations = parse_annotations(&cli.annotations)?;
    let options = labeler.inject_options(&labels, &annotations, cli.overwrite, cli.strict);

    if options.is_empty() {
        return Err(Error::invalid_invocation(
            "no tool given and no labels to inject. Use labeler --help for usage",
        ));
    }

    let input = match cli.file.as_deref() {
        Some(path) if path != Path::new("-") => sources::read_file(path).await?,
        _ => {
            if std::io::stdin().is_terminal() {
                return Err(Error::invalid_invocation(
                    "no tool given and stdin is a terminal; pipe manifests in or pass -f FILE",
                ));
            }
            sources::read_stdin().await?
        }
    };

    let report = labeler.label_stream(input.as_bytes(), &options, &mut std::io::stdout())?;
    if cli.verbose {
        display_report(&report);
    }

    Ok(0)
}

/// Collect `-l` values; one value may hold several comma-separated pairs
fn parse_labels(values: &[String]) -> Result<LabelSet> {
    let mut set = LabelSet::new();
    for value in values {
        set.push_arg(value)?;
    }
    Ok(set)
}

/// Collect `--annotation` values, one pair each
fn parse_annotations(values: &[String]) -> Result<LabelSet> {
    let mut set = LabelSet::new();
    for value in values {
        set.push_pair(value)?;
    }
    Ok(set)
}

/// Display an injection report on stderr
fn display_report(report: &InjectionReport) {
    if report.has_changes() {
        eprintln!(
            "\n{} Labeled {} resources:",
            "✓".green(),
            report.resource_count()
        );
    } else {
        eprintln!("\n{} No changes required", "✓".green());
    }

    eprintln!("  Added: {}", report.added.to_string().green());
    eprintln!("  Replaced: {}", report.replaced.to_string().yellow());
    eprintln!("  Preserved: {}", report.preserved.to_string().blue());
    eprintln!("  Unchanged: {}", report.unchanged.to_string().white());
    if report.passed_through > 0 {
        eprintln!(
            "  Passed through: {}",
            report.passed_through.to_string().dimmed()
        );
    }

    for resource in &report.resources {
        let changes: Vec<_> = resource
            .operations
            .iter()
            .filter(|(_, op)| !matches!(op, LabelOperation::Unchanged { .. }))
            .collect();
        if changes.is_empty() {
            continue;
        }

        eprintln!(
            "\n  {} {}",
            format!("[{}]", resource.document).dimmed(),
            resource.resource.cyan()
        );
        for (field, operation) in changes {
            let field = match field {
                MetadataField::Label => "label",
                MetadataField::Annotation => "annotation",
            };
            match operation {
                LabelOperation::Added { key, value } => {
                    eprintln!("    {} {} {}={}", "+".green(), field, key, value);
                }
                LabelOperation::Replaced {
                    key,
                    previous,
                    value,
                } => {
                    eprintln!(
                        "    {} {} {}: {} -> {}",
                        "~".yellow(),
                        field,
                        key,
                        previous.dimmed(),
                        value
                    );
                }
                LabelOperation::Preserved {
                    key,
                    existing,
                    requested,
                } => {
                    eprintln!(
                        "    {} {} {}={} (kept, requested {})",
                        "=".blue(),
                        field,
                        key,
                        existing,
                        requested.dimmed()
                    );
                }
                LabelOperation::Unchanged { .. } => {}
            }
        }
    }
}

/// Display an error with the stage it surfaced in
fn display_error(error: &Error) {
    eprintln!(
        "{} {}",
        format!("error [{}]:", error.stage()).red().bold(),
        error
    );
    if matches!(error, Error::InvalidInvocation(_)) {
        eprintln!("Use {} for help", "labeler --help".cyan());
    }
}
