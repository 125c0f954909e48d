//! Subprocess-backed [`AgentBackend`].
//!
//! Spawns the backend CLI once per call, writes the prompt on stdin, and
//! decodes stdout line-by-line into [`BackendEvent`]s. Cancellation kills the
//! child and surfaces [`DriverError::Aborted`]; a nonzero exit is reported as
//! a process error (the engine decides whether it matters: an exit after
//! `done` is noise, before it is a crash).

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wire::decode_line;
use crate::{AgentBackend, BackendEvent, DriverError, EffortLevel, EventStream, SendOptions};

/// How to launch one backend CLI.
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    pub program: PathBuf,
    /// Fixed arguments placed before the per-call ones.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessBackendConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

pub struct ProcessBackend {
    config: ProcessBackendConfig,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self { config }
    }

    fn command(&self, options: &SendOptions) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);
        cmd.arg("--model").arg(&options.model);
        if options.effort != EffortLevel::High {
            cmd.arg("--effort").arg(options.effort.to_string());
        }
        if let Some(handle) = &options.resume_handle {
            cmd.arg("--resume").arg(handle);
        }
        if let Some(prompt) = &options.system_prompt {
            cmd.arg("--system-prompt").arg(prompt);
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentBackend for ProcessBackend {
    async fn send(
        &self,
        prompt: &str,
        options: SendOptions,
        cancel: CancellationToken,
    ) -> Result<EventStream, DriverError> {
        let mut child = self.command(&options).spawn().map_err(DriverError::Spawn)?;

        let mut stdin = child.stdin.take().ok_or_else(|| DriverError::Process {
            message: "backend stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| DriverError::Process {
            message: "backend stdout unavailable".to_string(),
        })?;

        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|err| DriverError::Process {
                message: format!("failed to write prompt: {err}"),
            })?;
        drop(stdin);

        debug!(program = %self.config.program.display(), "backend process started");

        let stream = async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_done = false;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        if let Err(err) = child.start_kill() {
                            warn!(error = %err, "failed to kill cancelled backend process");
                        }
                        yield Err(DriverError::Aborted);
                        return;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(event) = decode_line(&line) {
                                saw_done = matches!(event, BackendEvent::Done { .. });
                                yield Ok(event);
                                if saw_done {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            yield Err(DriverError::Stream { message: err.to_string() });
                            return;
                        }
                    }
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    // After `done` this is post-completion noise; before it,
                    // a crash. Either way the engine makes the call.
                    yield Err(DriverError::Process {
                        message: format!("backend process exited with code {code}"),
                    });
                }
                Err(err) => {
                    if !saw_done {
                        yield Err(DriverError::Process {
                            message: format!("failed to reap backend process: {err}"),
                        });
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn shell_backend(script: &str) -> ProcessBackend {
        ProcessBackend::new(
            ProcessBackendConfig::new("/bin/sh").with_args(vec!["-c".to_string(), {
                // Consume the per-call flags the backend contract appends.
                format!("shift $#; {script}")
            }]),
        )
    }

    async fn collect(backend: &ProcessBackend) -> Vec<Result<BackendEvent, DriverError>> {
        let stream = backend
            .send("hello", SendOptions::default(), CancellationToken::new())
            .await
            .expect("spawn");
        stream.collect().await
    }

    #[tokio::test]
    async fn streams_decoded_events_until_done() {
        let backend = shell_backend(
            r#"cat > /dev/null; printf '{"type":"text","text":"hi"}\n{"type":"done"}\n'"#,
        );
        let events = collect(&backend).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].as_ref().expect("text event"),
            BackendEvent::Text { text } if text == "hi"
        ));
        assert!(matches!(
            events[1].as_ref().expect("done event"),
            BackendEvent::Done { .. }
        ));
    }

    #[tokio::test]
    async fn nonzero_exit_without_done_is_a_process_error() {
        let backend = shell_backend(r#"cat > /dev/null; exit 3"#);
        let events = collect(&backend).await;
        match events.last().expect("at least one item") {
            Err(DriverError::Process { message }) => {
                assert!(message.contains("exited with code 3"), "{message}");
            }
            other => panic!("expected process error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_surfaces_aborted() {
        let backend = shell_backend(r#"cat > /dev/null; sleep 30"#);
        let cancel = CancellationToken::new();
        let mut stream = backend
            .send("hello", SendOptions::default(), cancel.clone())
            .await
            .expect("spawn");
        cancel.cancel();
        let item = stream.next().await.expect("one item");
        assert!(matches!(item, Err(DriverError::Aborted)));
    }

    #[test]
    fn command_appends_resume_and_effort_flags() {
        let backend = ProcessBackend::new(ProcessBackendConfig::new("agent"));
        let options = SendOptions {
            resume_handle: Some("h-1".to_string()),
            model: "sonnet".to_string(),
            effort: EffortLevel::Low,
            system_prompt: None,
        };
        let cmd = backend.command(&options);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["--model", "sonnet", "--effort", "low", "--resume", "h-1"]
        );
    }
}
