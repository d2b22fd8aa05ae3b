//! Stage Runner
//!
//! Launches one external program per stage, surfaces its output line by line
//! while it runs, and classifies the result once it exits.
//!
//! # Contract
//! - stdout and stderr share one OS pipe, so lines come out in the order the
//!   child wrote them regardless of which stream they went to.
//! - Lines are trimmed; invalid UTF-8 is replaced, never fatal.
//! - A [`StageProcess`] is consumed once: read lines until `None`, then call
//!   [`StageProcess::finish`] for the disposition. It cannot be restarted.
//! - Once the child exits, output still in flight is drained for a short
//!   grace period. A descendant that keeps the pipe open cannot stall the
//!   stage past that.
//! - Non-zero exit → [`StageOutcome::ProcessFailed`]. Zero exit but missing
//!   post-condition artifact → [`StageOutcome::ArtifactMissing`].
//! - No retries.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use recon_common::events::EventPublisher;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::models::{PipelineState, StageOutcome};

/// Default number of lines buffered between the pipe readers and the
/// consumer
const DEFAULT_LINE_BUFFER: usize = 256;

/// How long output may keep arriving after the child has exited
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Post-condition checked after a clean exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactCheck {
    /// A regular file must exist
    File(PathBuf),
    /// A directory must exist and contain at least one entry
    NonEmptyDir(PathBuf),
}

impl ArtifactCheck {
    pub fn path(&self) -> &Path {
        match self {
            ArtifactCheck::File(path) | ArtifactCheck::NonEmptyDir(path) => path,
        }
    }

    pub async fn is_satisfied(&self) -> bool {
        match self {
            ArtifactCheck::File(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            ArtifactCheck::NonEmptyDir(path) => match tokio::fs::read_dir(path).await {
                Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
                Err(_) => false,
            },
        }
    }
}

/// Everything needed to invoke one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub stage: PipelineState,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    /// Inputs that must exist before launch
    pub requires: Vec<PathBuf>,
    /// Output that must exist after a clean exit
    pub produces: Option<ArtifactCheck>,
}

impl StageSpec {
    pub fn new(
        stage: PipelineState,
        program: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            requires: Vec::new(),
            produces: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn requires(mut self, path: impl Into<PathBuf>) -> Self {
        self.requires.push(path.into());
        self
    }

    pub fn produces(mut self, check: ArtifactCheck) -> Self {
        self.produces = Some(check);
        self
    }

    /// Command line for display
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// A running stage process
///
/// Produced by [`StageRunner::spawn`].
#[derive(Debug)]
pub struct StageProcess {
    stage: PipelineState,
    child: Child,
    lines: mpsc::Receiver<String>,
    produces: Option<ArtifactCheck>,
    exited: bool,
}

impl StageProcess {
    /// Next output line, `None` once the output is closed
    ///
    /// Suspends until the child writes a line or closes its output. After
    /// the child exits, waits at most [`EXIT_DRAIN_GRACE`] per line.
    pub async fn next_line(&mut self) -> Option<String> {
        if !self.exited {
            tokio::select! {
                biased;
                line = self.lines.recv() => return line,
                _ = self.child.wait() => self.exited = true,
            }
        }

        match tokio::time::timeout(EXIT_DRAIN_GRACE, self.lines.recv()).await {
            Ok(line) => line,
            Err(_) => {
                debug!(stage = %self.stage, "Output still open after exit, closing");
                self.lines.close();
                self.lines.try_recv().ok()
            }
        }
    }

    /// OS process id, if still known
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for exit and classify the result
    ///
    /// Lines not consumed before this call are discarded so the child can
    /// never block on a full pipe.
    pub async fn finish(&mut self) -> Result<StageOutcome, PipelineError> {
        while let Some(line) = self.next_line().await {
            debug!(stage = %self.stage, "Discarding unread output: {}", line);
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| PipelineError::fs(self.stage, e))?;

        Ok(self.classify(status).await)
    }

    async fn classify(&self, status: ExitStatus) -> StageOutcome {
        if !status.success() {
            return StageOutcome::ProcessFailed(status.code());
        }
        if let Some(check) = &self.produces {
            if !check.is_satisfied().await {
                return StageOutcome::ArtifactMissing(check.path().to_path_buf());
            }
        }
        StageOutcome::Success
    }

    /// Kill the child and reap it
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Launches stage processes
#[derive(Debug, Clone)]
pub struct StageRunner {
    line_buffer: usize,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self::new()
    }
}

enum RunStep {
    Line(String),
    Eof,
    Cancelled,
}

impl StageRunner {
    pub fn new() -> Self {
        Self {
            line_buffer: DEFAULT_LINE_BUFFER,
        }
    }

    /// Set how many lines may be buffered between pipe and consumer
    pub fn with_line_buffer(mut self, line_buffer: usize) -> Self {
        self.line_buffer = line_buffer.max(1);
        self
    }

    /// Check preconditions and launch the stage's program
    pub async fn spawn(&self, spec: &StageSpec) -> Result<StageProcess, PipelineError> {
        for input in &spec.requires {
            if tokio::fs::metadata(input).await.is_err() {
                return Err(PipelineError::ArtifactMissing {
                    stage: spec.stage,
                    path: input.clone(),
                });
            }
        }

        if !tokio::fs::metadata(&spec.working_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(PipelineError::fs(
                spec.stage,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("working directory not found: {}", spec.working_dir.display()),
                ),
            ));
        }

        let (reader, writer) = std::io::pipe().map_err(|e| PipelineError::fs(spec.stage, e))?;
        let stderr_writer = writer
            .try_clone()
            .map_err(|e| PipelineError::fs(spec.stage, e))?;

        // The Command temporary owns both write ends and drops them after
        // spawn, leaving the child as the only writer.
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::MissingExecutable {
                    stage: spec.stage,
                    program: spec.program.clone(),
                },
                _ => PipelineError::fs(spec.stage, e),
            })?;

        debug!(
            stage = %spec.stage,
            pid = ?child.id(),
            "Stage process started"
        );

        let (tx, rx) = mpsc::channel(self.line_buffer);
        let stage = spec.stage;
        tokio::task::spawn_blocking(move || forward_lines(reader, tx, stage));

        Ok(StageProcess {
            stage: spec.stage,
            child,
            lines: rx,
            produces: spec.produces.clone(),
            exited: false,
        })
    }

    /// Run a stage to completion, relaying every output line as a log event
    ///
    /// Cancellation kills the child and fails with
    /// [`PipelineError::Cancelled`].
    pub async fn run(
        &self,
        spec: &StageSpec,
        publisher: &EventPublisher,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let command_line = spec.command_line();
        info!(stage = %spec.stage, command = %command_line, "Running stage");
        if !relay(publisher, cancel, format!("Running: {}", command_line)).await {
            return Err(PipelineError::Cancelled { stage: spec.stage });
        }

        let mut process = self.spawn(spec).await?;

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => RunStep::Cancelled,
                line = process.next_line() => match line {
                    Some(line) => RunStep::Line(line),
                    None => RunStep::Eof,
                },
            };

            match step {
                RunStep::Line(line) => {
                    if !relay(publisher, cancel, line).await {
                        return Err(cancel_process(spec.stage, &mut process).await);
                    }
                }
                RunStep::Eof => break,
                RunStep::Cancelled => return Err(cancel_process(spec.stage, &mut process).await),
            }
        }

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = process.finish() => Some(outcome),
        };
        let outcome = match finished {
            Some(outcome) => outcome?,
            None => return Err(cancel_process(spec.stage, &mut process).await),
        };

        match &outcome {
            StageOutcome::Success => {
                info!(stage = %spec.stage, "Stage completed");
            }
            StageOutcome::ProcessFailed(code) => {
                warn!(stage = %spec.stage, exit_code = ?code, "Stage process failed");
            }
            StageOutcome::ArtifactMissing(path) => {
                warn!(
                    stage = %spec.stage,
                    path = %path.display(),
                    "Stage exited cleanly but its artifact is missing"
                );
            }
        }

        outcome.into_result(spec.stage)
    }
}

/// Publish one log line; `false` if cancellation won while waiting for
/// queue capacity
async fn relay(publisher: &EventPublisher, cancel: &CancellationToken, line: String) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = publisher.log(line) => true,
    }
}

async fn cancel_process(stage: PipelineState, process: &mut StageProcess) -> PipelineError {
    warn!(stage = %stage, pid = ?process.id(), "Cancelling stage process");
    if let Err(e) = process.kill().await {
        warn!(stage = %stage, error = %e, "Failed to kill stage process");
    }
    PipelineError::Cancelled { stage }
}

/// Read the merged output pipe line by line into `tx`
///
/// Runs on the blocking pool. Ends at EOF, on a read error, or when the
/// consumer goes away.
fn forward_lines(reader: PipeReader, tx: mpsc::Sender<String>, stage: PipelineState) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(stage = %stage, error = %e, "Failed reading stage output");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use recon_common::events::{event_channel, PipelineEvent};
    use std::time::Duration;

    fn sh(script: &str, dir: &Path) -> StageSpec {
        StageSpec::new(PipelineState::Matching, "/bin/sh", dir)
            .arg("-c")
            .arg(script)
    }

    #[tokio::test]
    async fn test_lines_are_produced_in_order_then_disposition() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let spec = sh("echo one; echo '  two  '; echo three", tmp.path());

        let mut process = runner.spawn(&spec).await.unwrap();
        let mut lines = Vec::new();
        while let Some(line) = process.next_line().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(process.finish().await.unwrap(), StageOutcome::Success);
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let spec = sh("echo to-stderr 1>&2", tmp.path());

        let mut process = runner.spawn(&spec).await.unwrap();
        assert_eq!(process.next_line().await.as_deref(), Some("to-stderr"));
        assert_eq!(process.next_line().await, None);
    }

    #[tokio::test]
    async fn test_interleaved_streams_keep_write_order() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let script: String = (0..200)
            .map(|n| {
                if n % 2 == 0 {
                    format!("echo {}; ", n)
                } else {
                    format!("echo {} 1>&2; ", n)
                }
            })
            .collect();
        let spec = sh(&script, tmp.path());

        let mut process = runner.spawn(&spec).await.unwrap();
        let mut lines = Vec::new();
        while let Some(line) = process.next_line().await {
            lines.push(line);
        }

        let expected: Vec<String> = (0..200).map(|n| n.to_string()).collect();
        assert_eq!(lines, expected);
        assert_eq!(process.finish().await.unwrap(), StageOutcome::Success);
    }

    #[tokio::test]
    async fn test_descendant_holding_output_does_not_block_finish() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let spec = sh("sleep 3 & echo parent-done", tmp.path());

        let mut process = runner.spawn(&spec).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), process.finish())
            .await
            .expect("finish should not wait for the descendant");
        assert_eq!(outcome.unwrap(), StageOutcome::Success);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_process_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let spec = sh("echo failing; exit 3", tmp.path());

        let mut process = runner.spawn(&spec).await.unwrap();
        assert_eq!(
            process.finish().await.unwrap(),
            StageOutcome::ProcessFailed(Some(3))
        );
    }

    #[tokio::test]
    async fn test_missing_artifact_after_clean_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let out_dir = tmp.path().join("sparse");
        std::fs::create_dir_all(&out_dir).unwrap();
        let runner = StageRunner::new();
        let spec = sh("true", tmp.path()).produces(ArtifactCheck::NonEmptyDir(out_dir.clone()));

        let mut process = runner.spawn(&spec).await.unwrap();
        assert_eq!(
            process.finish().await.unwrap(),
            StageOutcome::ArtifactMissing(out_dir)
        );
    }

    #[tokio::test]
    async fn test_artifact_present_is_success() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("model.msgpack");
        let runner = StageRunner::new();
        let spec = sh(&format!("touch '{}'", target.display()), tmp.path())
            .produces(ArtifactCheck::File(target));

        let mut process = runner.spawn(&spec).await.unwrap();
        assert_eq!(process.finish().await.unwrap(), StageOutcome::Success);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let spec = StageSpec::new(
            PipelineState::FeatureExtraction,
            tmp.path().join("no-such-colmap"),
            tmp.path(),
        );

        let err = runner.spawn(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingExecutable {
                stage: PipelineState::FeatureExtraction,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_precondition_prevents_launch() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("launched");
        let manifest = tmp.path().join("transforms.json");
        let runner = StageRunner::new();
        let spec = sh(&format!("touch '{}'", marker.display()), tmp.path()).requires(manifest.clone());

        let err = runner.spawn(&spec).await.unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactMissing { path, .. } if path == manifest));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_run_relays_lines_as_log_events() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let spec = sh("echo alpha; echo beta", tmp.path());
        let (publisher, mut stream) = event_channel(32);

        runner
            .run(&spec, &publisher, &CancellationToken::new())
            .await
            .unwrap();
        drop(publisher);

        let mut logs = Vec::new();
        while let Some(event) = stream.recv().await {
            if let PipelineEvent::Log(line) = event {
                logs.push(line);
            }
        }
        assert!(logs[0].starts_with("Running: /bin/sh -c"));
        assert_eq!(&logs[1..], &["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let spec = sh("exec sleep 30", tmp.path());
        let (publisher, _stream) = event_channel(32);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run(&spec, &publisher, &cancel),
        )
        .await
        .expect("cancellation should stop the stage promptly");
        assert!(matches!(
            result,
            Err(PipelineError::Cancelled {
                stage: PipelineState::Matching
            })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_while_event_queue_is_full() {
        // Subscriber connected but never reading
        let tmp = tempfile::tempdir().unwrap();
        let runner = StageRunner::new();
        let spec = sh("echo a; echo b; echo c; exec sleep 30", tmp.path());
        let (publisher, _stream) = event_channel(1);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            runner.run(&spec, &publisher, &cancel),
        )
        .await
        .expect("cancellation should not wait for queue capacity");
        assert!(matches!(result, Err(PipelineError::Cancelled { .. })));
    }
}
