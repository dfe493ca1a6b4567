//! Child process supervision and the per-line alert pipeline.
//!
//! A run negotiates free ports, optionally builds the child, spawns it with
//! the rewritten configuration and scans its output until both streams close.
//! stdout and stderr are read by two tasks feeding one channel: order within
//! each stream is preserved, order across the two is whatever arrives first.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alerts::AlertManager;
use crate::classifier::Classifier;
use crate::config::{AlertConfig, ChildSpec, ConfigError, RunConfig};
use crate::dispatcher::{self, Alert, Notifier, WebhookNotifier};
use crate::error::RunError;
use crate::line_log::LineLog;
use crate::ports;

/// Lines buffered between the stream readers and the scan loop.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// What the pipeline did with one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// No pattern matched.
    Unmatched,
    /// A pattern matched and an alert was dispatched.
    Sent {
        /// Key of the matching pattern.
        pattern: String,
        /// Suppressions reported with the alert.
        suppressed: u64,
        /// Whether the webhook accepted it.
        delivered: bool,
    },
    /// A pattern matched while cooling down.
    Suppressed {
        /// Key of the matching pattern.
        pattern: String,
        /// Suppression count after this match.
        suppressed: u64,
    },
}

/// Log → classify → decide → dispatch, one line at a time.
pub struct LinePipeline {
    line_log: LineLog,
    classifier: Classifier,
    alerts: AlertManager,
    notifier: Arc<dyn Notifier>,
    prefix: String,
    echo: Mutex<Option<Box<dyn Write + Send>>>,
}

impl LinePipeline {
    /// Assemble a pipeline. Lines are echoed to stdout unless disabled with
    /// [`LinePipeline::with_echo`].
    pub fn new(
        line_log: LineLog,
        classifier: Classifier,
        alerts: AlertManager,
        notifier: Arc<dyn Notifier>,
        prefix: impl Into<String>,
    ) -> Self {
        let stdout: Box<dyn Write + Send> = Box::new(std::io::stdout());
        Self {
            line_log,
            classifier,
            alerts,
            notifier,
            prefix: prefix.into(),
            echo: Mutex::new(Some(stdout)),
        }
    }

    /// Build the production pipeline: file line log, compiled rules, wall
    /// clock and the configured webhook.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Pattern`] if a pattern does not compile.
    pub fn from_config(config: &AlertConfig, prefix: &str) -> Result<Self, ConfigError> {
        let classifier = Classifier::from_config(&config.patterns)?;
        let alerts = AlertManager::new(config.default_cooldown());
        let notifier = Arc::new(WebhookNotifier::new(
            config.webhook_url.clone(),
            config.webhook_timeout(),
        ));
        let line_log = LineLog::new(&config.log_file, prefix);
        Ok(Self::new(line_log, classifier, alerts, notifier, prefix))
    }

    /// Toggle echoing scanned lines to stdout.
    pub fn with_echo(self, echo: bool) -> Self {
        if echo {
            self.with_echo_writer(std::io::stdout())
        } else {
            *self.echo.lock().unwrap_or_else(PoisonError::into_inner) = None;
            self
        }
    }

    /// Echo scanned lines to `writer` instead of stdout.
    pub fn with_echo_writer(self, writer: impl Write + Send + 'static) -> Self {
        *self.echo.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(writer));
        self
    }

    /// Alert bookkeeping, for inspection.
    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    /// Process one line.
    pub async fn process_line(&self, line: &str) -> LineOutcome {
        self.echo_line(line);
        self.line_log.append(line);

        let Some(rule) = self.classifier.classify(line) else {
            return LineOutcome::Unmatched;
        };

        let decision = self.alerts.should_send(rule);
        if !decision.send {
            debug!(
                pattern = %rule.key(),
                suppressed = decision.suppressed,
                "match suppressed during cooldown"
            );
            return LineOutcome::Suppressed {
                pattern: rule.key().to_owned(),
                suppressed: decision.suppressed,
            };
        }

        info!(pattern = %rule.key(), suppressed = decision.suppressed, "sending alert");
        let alert = Alert {
            prefix: self.prefix.clone(),
            line: line.to_owned(),
            suppressed: decision.suppressed,
        };
        let delivered = dispatcher::dispatch(self.notifier.as_ref(), &alert).await;
        LineOutcome::Sent {
            pattern: rule.key().to_owned(),
            suppressed: decision.suppressed,
            delivered,
        }
    }

    /// Echo one line. The first write error turns echo off for good; a closed
    /// stdout must not end the scan.
    fn echo_line(&self, line: &str) {
        let mut slot = self.echo.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = slot.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(error = %e, "failed to echo line, disabling echo");
            *slot = None;
        }
    }

    /// Scan `reader` to EOF, processing every line. Used for piped input.
    ///
    /// A read error ends the scan and is logged.
    pub async fn scan_reader<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(forward_lines(reader, StreamKind::Stdout, tx));
        while let Some(line) = rx.recv().await {
            self.process_line(&line).await;
        }
        if let Err(e) = reader_task.await {
            warn!(error = %e, "input reader task failed");
        }
    }
}

/// Read `reader` line by line into `tx` until EOF or a read error.
///
/// Invalid UTF-8 is replaced rather than treated as an error; trailing `\r\n`
/// or `\n` is stripped.
async fn forward_lines<R>(reader: R, kind: StreamKind, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(stream = ?kind, error = %e, "failed to read child output");
                break;
            }
        }
    }
    debug!(stream = ?kind, "stream closed");
}

/// Owns one supervised run of the child process.
pub struct Supervisor {
    child: ChildSpec,
    pipeline: LinePipeline,
}

impl Supervisor {
    /// Create a supervisor for `child`, feeding its output through `pipeline`.
    pub fn new(child: ChildSpec, pipeline: LinePipeline) -> Self {
        Self { child, pipeline }
    }

    /// Build a supervisor with the production pipeline for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Config`] if a pattern does not compile.
    pub fn from_config(config: RunConfig) -> Result<Self, RunError> {
        let pipeline = LinePipeline::from_config(&config.alerts, &config.message_prefix)?;
        Ok(Self::new(config.child, pipeline))
    }

    /// The line pipeline, for inspection after a run.
    pub fn pipeline(&self) -> &LinePipeline {
        &self.pipeline
    }

    /// Negotiate ports, build, spawn, scan output and wait for exit.
    ///
    /// The negotiated configuration file is removed before this returns, on
    /// every path.
    ///
    /// # Errors
    ///
    /// Returns a [`RunError`] for configuration or port failures, a failed
    /// build, a spawn failure, or a non-zero child exit.
    pub async fn run(&self) -> Result<(), RunError> {
        let negotiated = ports::negotiate(&self.child.resolved_config_path())?;

        if let Some(target) = &self.child.build_target {
            build(&self.child, target).await?;
        }

        let program = resolve_executable(&self.child);
        let config_arg = format!("--config={}", negotiated.path().display());
        info!(program = %program.display(), arg = %config_arg, "starting child");

        let mut child = tokio::process::Command::new(&program)
            .arg(&config_arg)
            .current_dir(&self.child.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, StreamKind::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, StreamKind::Stderr, tx.clone())));
        }
        drop(tx);

        while let Some(line) = rx.recv().await {
            self.pipeline.process_line(&line).await;
        }
        for reader in readers {
            if let Err(e) = reader.await {
                warn!(error = %e, "output reader task failed");
            }
        }

        let status = child.wait().await.map_err(RunError::Wait)?;
        if !status.success() {
            return Err(RunError::ChildExit { status });
        }
        info!(status = %status, "child exited");
        drop(negotiated);
        Ok(())
    }
}

/// Run `make <target>` in the repo directory.
async fn build(child: &ChildSpec, target: &str) -> Result<(), RunError> {
    info!(make_target = %target, dir = %child.repo_dir.display(), "building child");
    let status = tokio::process::Command::new("make")
        .arg(target)
        .current_dir(&child.repo_dir)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| RunError::Build {
            target: target.to_owned(),
            detail: e.to_string(),
        })?;
    if !status.success() {
        return Err(RunError::Build {
            target: target.to_owned(),
            detail: status.to_string(),
        });
    }
    Ok(())
}

/// Resolve the child executable.
///
/// Bare names are left for `PATH` lookup; relative paths are taken relative
/// to the repo directory.
pub fn resolve_executable(child: &ChildSpec) -> PathBuf {
    let exe = &child.executable;
    let is_bare = exe.parent().is_none_or(|p| p.as_os_str().is_empty());
    if exe.is_absolute() || is_bare {
        return exe.clone();
    }
    let joined = child.repo_dir.join(exe);
    std::path::absolute(&joined).unwrap_or(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(exe: &str) -> ChildSpec {
        ChildSpec {
            repo_dir: PathBuf::from("/srv/node"),
            executable: PathBuf::from(exe),
            config_path: PathBuf::from("node.yaml"),
            build_target: None,
        }
    }

    #[test]
    fn relative_executable_resolves_against_repo() {
        assert_eq!(
            resolve_executable(&spec("./build/bin/cdk-erigon")),
            PathBuf::from("/srv/node/build/bin/cdk-erigon")
        );
    }

    #[test]
    fn bare_and_absolute_executables_are_unchanged() {
        assert_eq!(resolve_executable(&spec("node")), PathBuf::from("node"));
        assert_eq!(resolve_executable(&spec("/usr/bin/node")), PathBuf::from("/usr/bin/node"));
    }

    #[tokio::test]
    async fn forward_lines_strips_terminators_and_replaces_bad_utf8() {
        let input: &[u8] = b"one\r\ntwo\n\xffthree";
        let (tx, mut rx) = mpsc::channel(8);
        forward_lines(input, StreamKind::Stdout, tx).await;
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
        assert_eq!(rx.recv().await.as_deref(), Some("\u{fffd}three"));
        assert_eq!(rx.recv().await, None);
    }
}
