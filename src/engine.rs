//! Labeling Engine
//!
//! Executes a classified invocation: runs the wrapped tool, routes manifests
//! through the parser, injector and reassembler, and reports what changed.

use std::io::Write;

use crate::config::{LabelSet, LabelerConfig};
use crate::dispatch::{Invocation, Plan, Tool};
use crate::error::{Error, Result};
use crate::inject::{InjectOptions, InjectionReport, Injector, MergePolicy};
use crate::manifest::ManifestParser;
use crate::reassemble::reassemble;
use crate::runner::ToolRunner;
use crate::sources::{self, ManifestSource};

/// Result of one invocation
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Exit code for labeler's process
    pub exit_code: i32,

    /// Injection report when manifests were labeled by this process
    pub report: Option<InjectionReport>,
}

impl Outcome {
    fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            report: None,
        }
    }
}

/// Parse, inject and reassemble one manifest stream
///
/// # Errors
/// - `MalformedManifest` if the stream is not UTF-8, or a document is not a
///   resource in strict mode
/// - `Serialization` if a modified document cannot be re-emitted
pub fn transform_stream(
    input: &[u8],
    options: &InjectOptions,
) -> Result<(String, InjectionReport)> {
    let input = std::str::from_utf8(input).map_err(|e| Error::MalformedManifest {
        index: 0,
        reason: format!("stream is not valid UTF-8: {e}"),
    })?;

    let injector = Injector::new(options);
    let mut report = InjectionReport::new();
    let mut documents = Vec::new();
    for document in ManifestParser::new(input, options.strict) {
        documents.push(injector.inject_document(document?, &mut report));
    }

    let output = reassemble(&documents)?;
    tracing::debug!(
        "labeled {} resources in {} documents",
        report.resource_count(),
        documents.len()
    );
    Ok((output, report))
}

/// Write labeled manifests to `out`
///
/// A reader that went away early (`labeler ... | head`) is not an error.
fn emit<W: Write>(out: &mut W, output: &str) -> Result<()> {
    match out.write_all(output.as_bytes()).and_then(|()| out.flush()) {
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            tracing::debug!("output closed early: {}", e);
            Ok(())
        }
        result => Ok(result?),
    }
}

/// Labeling Engine
///
/// Runs invocations with a [`ToolRunner`] and the loaded configuration
pub struct Labeler<R: ToolRunner> {
    runner: R,
    config: LabelerConfig,
}

impl<R: ToolRunner> Labeler<R> {
    pub fn new(runner: R, config: LabelerConfig) -> Self {
        Self { runner, config }
    }

    /// Combine configured defaults with command line values
    ///
    /// Command line pairs replace configured pairs with the same key.
    pub fn inject_options(
        &self,
        labels: &LabelSet,
        annotations: &LabelSet,
        overwrite: bool,
        strict: bool,
    ) -> InjectOptions {
        let mut merged_labels = self.config.label_set();
        merged_labels.extend(labels);
        let mut merged_annotations = self.config.annotation_set();
        merged_annotations.extend(annotations);

        InjectOptions {
            labels: merged_labels,
            annotations: merged_annotations,
            policy: MergePolicy::from_overwrite(overwrite || self.config.overwrite),
            strict: strict || self.config.strict,
        }
    }

    /// Execute an invocation, writing rendered manifests to `out`
    ///
    /// # Errors
    /// - `LabelValidation` before the tool runs if a label is invalid
    /// - `SubprocessExit` if a tool whose output had to be labeled fails
    /// - Parse, reassembly, spawn and interrupt errors from the pipeline
    pub async fn run<W: Write>(&self, invocation: &Invocation, out: &mut W) -> Result<Outcome> {
        let tool = invocation.tool;
        let program = self.config.tools.program(tool);
        let options = self.inject_options(
            &invocation.labels,
            &invocation.annotations,
            invocation.overwrite,
            invocation.strict,
        );

        if invocation.plan.intercepts() && options.is_empty() {
            tracing::info!("no labels or annotations requested; running {} unchanged", tool);
            return Ok(Outcome::exited(
                self.runner.inherit(program, &invocation.args).await?,
            ));
        }

        match &invocation.plan {
            Plan::PassThrough => {
                if !invocation.labels.is_empty()
                    || !invocation.annotations.is_empty()
                    || invocation.strict
                {
                    tracing::warn!(
                        "`{} {}` neither renders nor applies manifests; labels are ignored",
                        tool,
                        invocation.verb.as_deref().unwrap_or("")
                    );
                }
                Ok(Outcome::exited(
                    self.runner.inherit(program, &invocation.args).await?,
                ))
            }

            Plan::Render => {
                options.validate()?;
                let captured = self.runner.capture(program, &invocation.args).await?;
                if captured.code != 0 {
                    return Err(Error::SubprocessExit {
                        tool: tool.name().to_string(),
                        code: captured.code,
                    });
                }

                let (output, report) = transform_stream(&captured.stdout, &options)?;
                emit(out, &output)?;
                Ok(Outcome {
                    exit_code: 0,
                    report: Some(report),
                })
            }

            Plan::ApplyManifests {
                sources,
                recursive,
                args,
            } => {
                options.validate()?;
                let input = self.read_sources(program, sources, *recursive).await?;
                let (output, report) = transform_stream(input.as_bytes(), &options)?;
                let code = self.runner.feed(program, args, output.into_bytes()).await?;
                Ok(Outcome {
                    exit_code: code,
                    report: Some(report),
                })
            }

            Plan::HelmPostRender => {
                options.validate()?;
                let exe = std::env::current_exe()?;
                let args = invocation.post_renderer_args(&exe, &options);
                Ok(Outcome::exited(self.runner.inherit(program, &args).await?))
            }
        }
    }

    /// Label a stream read by labeler itself (pipe mode and helm post-rendering)
    ///
    /// # Errors
    /// Validation, parse and reassembly errors; IO errors writing `out`
    pub fn label_stream<W: Write>(
        &self,
        input: &[u8],
        options: &InjectOptions,
        out: &mut W,
    ) -> Result<InjectionReport> {
        options.validate()?;
        let (output, report) = transform_stream(input, options)?;
        emit(out, &output)?;
        Ok(report)
    }

    /// Read every `-f`/`-k` source into one stream
    async fn read_sources(
        &self,
        kubectl: &str,
        manifest_sources: &[ManifestSource],
        recursive: bool,
    ) -> Result<String> {
        let mut chunks = Vec::new();

        for source in manifest_sources {
            match source {
                ManifestSource::File(path) => {
                    for file in sources::expand_path(path, recursive)? {
                        tracing::debug!("reading {}", file.display());
                        chunks.push(sources::read_file(&file).await?);
                    }
                }
                ManifestSource::Stdin => chunks.push(sources::read_stdin().await?),
                ManifestSource::Url(url) => chunks.push(sources::fetch_url(url).await?),
                ManifestSource::Kustomization(target) => {
                    let args = vec!["kustomize".to_string(), target.clone()];
                    let captured = self.runner.capture(kubectl, &args).await?;
                    if captured.code != 0 {
                        return Err(Error::SubprocessExit {
                            tool: Tool::Kubectl.name().to_string(),
                            code: captured.code,
                        });
                    }
                    let rendered =
                        String::from_utf8(captured.stdout).map_err(|e| Error::MalformedManifest {
                            index: 0,
                            reason: format!("kustomize output is not valid UTF-8: {e}"),
                        })?;
                    chunks.push(rendered);
                }
            }
        }

        Ok(sources::join_streams(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolPaths;
    use crate::dispatch::parse_invocation;
    use crate::manifest::parse_manifests;
    use crate::runner::Captured;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Capture(String, Vec<String>),
        Feed(String, Vec<String>, String),
        Inherit(String, Vec<String>),
    }

    /// Records calls and answers with canned output
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Call>>,
        stdout: String,
        code: i32,
    }

    impl RecordingRunner {
        fn with_output(stdout: &str, code: i32) -> Self {
            Self {
                stdout: stdout.to_string(),
                code,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ToolRunner for &RecordingRunner {
        async fn capture(&self, program: &str, args: &[String]) -> Result<Captured> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Capture(program.to_string(), args.to_vec()));
            Ok(Captured {
                code: self.code,
                stdout: self.stdout.clone().into_bytes(),
            })
        }

        async fn feed(&self, program: &str, args: &[String], input: Vec<u8>) -> Result<i32> {
            self.calls.lock().unwrap().push(Call::Feed(
                program.to_string(),
                args.to_vec(),
                String::from_utf8(input).unwrap(),
            ));
            Ok(self.code)
        }

        async fn inherit(&self, program: &str, args: &[String]) -> Result<i32> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Inherit(program.to_string(), args.to_vec()));
            Ok(self.code)
        }
    }

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    const TWO_CONFIGMAPS: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n  labels:\n    app.kubernetes.io/part-of: other\n";

    fn options(pairs: &[(&str, &str)]) -> InjectOptions {
        InjectOptions {
            labels: pairs.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_transform_stream_preserves_existing() {
        let (output, report) = transform_stream(
            TWO_CONFIGMAPS.as_bytes(),
            &options(&[("app.kubernetes.io/part-of", "sample")]),
        )
        .unwrap();

        let docs = parse_manifests(&output, true).unwrap();
        assert_eq!(
            docs[0].resources()[0].labels["app.kubernetes.io/part-of"],
            "sample"
        );
        assert_eq!(
            docs[1].resources()[0].labels["app.kubernetes.io/part-of"],
            "other"
        );
        assert_eq!(report.added, 1);
        assert_eq!(report.preserved, 1);
    }

    #[test]
    fn test_transform_stream_overwrite_is_idempotent() {
        let mut opts = options(&[("app.kubernetes.io/part-of", "sample")]);
        opts.policy = MergePolicy::Overwrite;

        let (once, _) = transform_stream(TWO_CONFIGMAPS.as_bytes(), &opts).unwrap();
        let (twice, report) = transform_stream(once.as_bytes(), &opts).unwrap();
        assert_eq!(once, twice);
        assert!(!report.has_changes());
    }

    #[test]
    fn test_transform_stream_empty_label_set_is_identity() {
        let (output, _) =
            transform_stream(TWO_CONFIGMAPS.as_bytes(), &InjectOptions::default()).unwrap();
        assert_eq!(output, TWO_CONFIGMAPS);
    }

    #[test]
    fn test_transform_stream_scalar_document() {
        let input = "kind: A\n---\njust text\n";
        let (output, report) = transform_stream(input.as_bytes(), &options(&[("a", "b")])).unwrap();
        assert!(output.ends_with("---\njust text\n"));
        assert_eq!(report.passed_through, 1);

        let mut strict = options(&[("a", "b")]);
        strict.strict = true;
        match transform_stream(input.as_bytes(), &strict).unwrap_err() {
            Error::MalformedManifest { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_transform_stream_rejects_invalid_utf8() {
        let err = transform_stream(&[0xff, 0xfe], &options(&[("a", "b")])).unwrap_err();
        assert!(matches!(err, Error::MalformedManifest { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_render_labels_tool_output() {
        let runner = RecordingRunner::with_output(TWO_CONFIGMAPS, 0);
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let invocation = parse_invocation(
            Tool::Helm,
            &args("template rel ./chart --label=foo=bar --dry-run"),
        )
        .unwrap();

        let mut out = Vec::new();
        let outcome = labeler.run(&invocation, &mut out).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.report.unwrap().added, 2);

        let output = String::from_utf8(out).unwrap();
        for doc in parse_manifests(&output, true).unwrap() {
            assert_eq!(doc.resources()[0].labels["foo"], "bar");
        }
        assert_eq!(
            runner.calls(),
            vec![Call::Capture(
                "helm".to_string(),
                args("template rel ./chart --dry-run")
            )]
        );
    }

    #[tokio::test]
    async fn test_render_failure_emits_nothing() {
        let runner = RecordingRunner::with_output("partial: output\n", 2);
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let invocation = parse_invocation(Tool::Kustomize, &args("build . -l a=b")).unwrap();

        let mut out = Vec::new();
        let err = labeler.run(&invocation, &mut out).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_label_fails_before_running() {
        let runner = RecordingRunner::default();
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let invocation = parse_invocation(Tool::Kustomize, &args("build . -l a=not_valid!")).unwrap();

        let err = labeler.run(&invocation, &mut Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::LabelValidation(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pass_through_forwards_arguments() {
        let runner = RecordingRunner::with_output("", 5);
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let invocation = parse_invocation(Tool::Kubectl, &args("get pods -l app=web")).unwrap();

        let outcome = labeler.run(&invocation, &mut Vec::new()).await.unwrap();
        assert_eq!(outcome.exit_code, 5);
        assert!(outcome.report.is_none());
        assert_eq!(
            runner.calls(),
            vec![Call::Inherit("kubectl".to_string(), args("get pods -l app=web"))]
        );
    }

    #[tokio::test]
    async fn test_intercepted_without_labels_runs_unchanged() {
        let runner = RecordingRunner::default();
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let invocation = parse_invocation(Tool::Kubectl, &args("apply -f x.yaml")).unwrap();

        labeler.run(&invocation, &mut Vec::new()).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![Call::Inherit("kubectl".to_string(), args("apply -f x.yaml"))]
        );
    }

    #[tokio::test]
    async fn test_apply_feeds_labeled_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: b",
        )
        .unwrap();

        let runner = RecordingRunner::default();
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let line = format!("apply -n prod -f {} -l team=core", dir.path().display());
        let invocation = parse_invocation(Tool::Kubectl, &args(&line)).unwrap();

        let outcome = labeler.run(&invocation, &mut Vec::new()).await.unwrap();
        assert_eq!(outcome.report.unwrap().added, 2);

        let calls = runner.calls();
        let Call::Feed(program, fed_args, input) = &calls[0] else {
            panic!("expected kubectl to be fed manifests: {calls:?}");
        };
        assert_eq!(program, "kubectl");
        assert_eq!(fed_args, &args("apply -n prod -f -"));

        let docs = parse_manifests(input, true).unwrap();
        assert_eq!(docs.len(), 2);
        for doc in docs {
            assert_eq!(doc.resources()[0].labels["team"], "core");
        }
    }

    #[tokio::test]
    async fn test_apply_renders_kustomization() {
        let runner = RecordingRunner::with_output("apiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n", 0);
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let invocation =
            parse_invocation(Tool::Kubectl, &args("apply -k overlays/prod -l team=core")).unwrap();

        labeler.run(&invocation, &mut Vec::new()).await.unwrap();
        let calls = runner.calls();
        assert_eq!(
            calls[0],
            Call::Capture("kubectl".to_string(), args("kustomize overlays/prod"))
        );
        assert!(matches!(&calls[1], Call::Feed(_, a, input)
            if a == &args("apply -f -") && input.contains("team: core")));
    }

    #[tokio::test]
    async fn test_helm_install_uses_post_renderer() {
        let runner = RecordingRunner::default();
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let invocation =
            parse_invocation(Tool::Helm, &args("upgrade --install rel chart -l team=core")).unwrap();

        labeler.run(&invocation, &mut Vec::new()).await.unwrap();
        let calls = runner.calls();
        let Call::Inherit(program, run_args) = &calls[0] else {
            panic!("expected helm to run directly: {calls:?}");
        };
        assert_eq!(program, "helm");
        assert_eq!(run_args[..4], args("upgrade --install rel chart")[..]);
        assert_eq!(run_args[4], "--post-renderer");
        assert_eq!(run_args[6], "--post-renderer-args=--label=team=core");
    }

    #[test]
    fn test_inject_options_merge_config() {
        let config = LabelerConfig {
            labels: [
                ("team".to_string(), "platform".to_string()),
                ("env".to_string(), "dev".to_string()),
            ]
            .into_iter()
            .collect(),
            overwrite: true,
            ..Default::default()
        };
        let runner = RecordingRunner::default();
        let labeler = Labeler::new(&runner, config);

        let cli: LabelSet = "team=core".parse().unwrap();
        let options = labeler.inject_options(&cli, &LabelSet::new(), false, false);
        assert_eq!(options.labels.get("team"), Some("core"));
        assert_eq!(options.labels.get("env"), Some("dev"));
        assert_eq!(options.policy, MergePolicy::Overwrite);
        assert!(!options.strict);
    }

    /// Writer whose reader has gone away
    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[tokio::test]
    async fn test_closed_output_is_quiet() {
        let runner = RecordingRunner::with_output(TWO_CONFIGMAPS, 0);
        let labeler = Labeler::new(&runner, LabelerConfig::default());
        let invocation = parse_invocation(Tool::Kustomize, &args("build . -l a=b")).unwrap();

        let outcome = labeler.run(&invocation, &mut ClosedPipe).await.unwrap();
        assert_eq!(outcome.exit_code, 0);

        let report = labeler
            .label_stream(TWO_CONFIGMAPS.as_bytes(), &options(&[("a", "b")]), &mut ClosedPipe)
            .unwrap();
        assert_eq!(report.added, 2);
    }

    #[test]
    fn test_label_stream() {
        let runner = RecordingRunner::default();
        let labeler = Labeler::new(&runner, LabelerConfig::default());

        let mut out = Vec::new();
        let report = labeler
            .label_stream(TWO_CONFIGMAPS.as_bytes(), &options(&[("a", "b")]), &mut out)
            .unwrap();
        assert_eq!(report.added, 2);
        assert!(String::from_utf8(out).unwrap().contains("    a: b\n"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::runner::ProcessRunner;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn config_with_helm(helm: &Path) -> LabelerConfig {
            LabelerConfig {
                tools: ToolPaths {
                    helm: helm.display().to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn test_helm_template_through_real_process() {
            let dir = tempfile::tempdir().unwrap();
            let helm = fake_tool(
                dir.path(),
                "helm",
                "cat <<'EOF'\n---\n# Source: chart/templates/svc.yaml\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\n---\n# Source: chart/templates/deploy.yaml\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  labels:\n    app: web\nEOF",
            );

            let labeler = Labeler::new(ProcessRunner::new(), config_with_helm(&helm));
            let invocation = parse_invocation(
                Tool::Helm,
                &args("template rel ./chart --label=foo=bar --dry-run"),
            )
            .unwrap();

            let mut out = Vec::new();
            let outcome = labeler.run(&invocation, &mut out).await.unwrap();
            assert_eq!(outcome.exit_code, 0);

            let output = String::from_utf8(out).unwrap();
            assert!(output.starts_with("---\n# Source: chart/templates/svc.yaml\n"));
            let docs = parse_manifests(&output, true).unwrap();
            let resources: Vec<_> = docs.iter().flat_map(|d| d.resources()).collect();
            assert_eq!(resources.len(), 2);
            for resource in resources {
                assert_eq!(resource.labels["foo"], "bar");
            }
        }

        #[tokio::test]
        async fn test_helm_exit_code_is_mirrored() {
            let dir = tempfile::tempdir().unwrap();
            let helm = fake_tool(dir.path(), "helm", "echo 'Error: chart not found' >&2\nexit 3");

            let labeler = Labeler::new(ProcessRunner::new(), config_with_helm(&helm));
            let invocation =
                parse_invocation(Tool::Helm, &args("template rel ./missing --label=foo=bar"))
                    .unwrap();

            let mut out = Vec::new();
            let err = labeler.run(&invocation, &mut out).await.unwrap_err();
            assert_eq!(err.exit_code(), 3);
            assert!(out.is_empty());
        }
    }
}
