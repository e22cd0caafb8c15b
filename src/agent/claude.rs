use std::path::PathBuf;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEvent, AgentOutcome, AgentRequest, AgentRunner};
use crate::errors::AgentError;
use crate::settings::AgentSection;
use crate::state::TokenUsage;
use crate::stream::{ContentBlock, StreamEvent, describe_tool_use, parse_line};

/// Runs the Claude CLI in `stream-json` mode with the prompt on stdin.
pub struct ClaudeRunner {
    settings: AgentSection,
    log_dir: Option<PathBuf>,
}

impl ClaudeRunner {
    pub fn new(settings: AgentSection) -> Self {
        Self {
            settings,
            log_dir: None,
        }
    }

    /// Write each prompt and output under `dir`.
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn flags(&self, request: &AgentRequest) -> Vec<String> {
        let mut flags = Vec::new();
        if self.settings.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        if let Some(model) = &self.settings.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if let Some(session) = &request.resume_session {
            flags.push("--resume".to_string());
            flags.push(session.clone());
        }
        flags.extend(self.settings.extra_args.iter().cloned());
        flags
    }

    fn log_file(&self, request: &AgentRequest, suffix: &str) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}-{}-attempt-{}-{}",
                request.task_id, request.phase_id, request.attempt, suffix
            ))
        })
    }

    fn write_log(&self, path: Option<PathBuf>, content: &str) {
        let Some(path) = path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, content) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write agent log");
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn invoke(
        &self,
        request: AgentRequest,
        events: UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        self.write_log(self.log_file(&request, "prompt.md"), &request.prompt);

        let flags = self.flags(&request);
        tracing::debug!(
            task = %request.task_id,
            phase = %request.phase_id,
            command = %format!("{} {}", self.settings.command, flags.join(" ")),
            "spawning agent"
        );

        let mut child = Command::new(&self.settings.command)
            .args(&flags)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .current_dir(&request.working_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(AgentError::Stream)?;
            stdin.shutdown().await.map_err(AgentError::Stream)?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Other(anyhow!("agent stdout not captured")))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut reader = BufReader::new(stdout).lines();
        let mut collector = StreamCollector::default();

        let timeout = request.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    tracing::info!(phase = %request.phase_id, "agent cancelled");
                    return Err(AgentError::Cancelled);
                }
                _ = &mut deadline => {
                    let _ = child.kill().await;
                    let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
                    return Err(AgentError::TimedOut { secs });
                }
                line = reader.next_line() => {
                    match line.map_err(AgentError::Stream)? {
                        Some(line) => collector.handle_line(&line, &events),
                        None => break,
                    }
                }
            }
        }

        let status = child.wait().await.map_err(AgentError::Stream)?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let exit_code = status.code().unwrap_or(-1);
        let mut outcome = collector.finish(exit_code);
        if !outcome.succeeded() && !stderr.trim().is_empty() {
            outcome.output.push_str("\n[stderr]\n");
            outcome.output.push_str(stderr.trim_end());
        }

        self.write_log(self.log_file(&request, "output.log"), &outcome.output);
        tracing::debug!(
            phase = %request.phase_id,
            exit_code,
            output_chars = outcome.output.len(),
            "agent finished"
        );
        Ok(outcome)
    }
}

/// Folds `stream-json` lines into events and a final outcome.
#[derive(Debug, Default)]
pub struct StreamCollector {
    text: String,
    final_result: Option<String>,
    is_error: bool,
    session_id: Option<String>,
    streamed: TokenUsage,
    result_usage: Option<TokenUsage>,
    cost_usd: f64,
}

impl StreamCollector {
    pub fn handle_line(&mut self, line: &str, events: &UnboundedSender<AgentEvent>) {
        if line.trim().is_empty() {
            return;
        }
        let Some(event) = parse_line(line) else {
            self.text.push_str(line);
            self.text.push('\n');
            return;
        };
        // A closed receiver only means nobody is listening.
        match event {
            StreamEvent::System { session_id, .. } => {
                if let Some(id) = session_id {
                    self.note_session(id, events);
                }
            }
            StreamEvent::Assistant {
                message,
                session_id,
            } => {
                if !session_id.is_empty() {
                    self.note_session(session_id, events);
                }
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                            let _ = events.send(AgentEvent::Text(text));
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            let description = describe_tool_use(&name, &input);
                            let _ = events.send(AgentEvent::ToolUse { name, description });
                        }
                        ContentBlock::Other => {}
                    }
                }
                if let Some(usage) = message.usage {
                    let tokens: TokenUsage = usage.into();
                    self.streamed += tokens;
                    let _ = events.send(AgentEvent::Usage {
                        tokens,
                        cost_usd: 0.0,
                    });
                }
            }
            StreamEvent::Result {
                result,
                is_error,
                session_id,
                total_cost_usd,
                usage,
                ..
            } => {
                self.final_result = result;
                self.is_error = is_error;
                if let Some(id) = session_id {
                    self.note_session(id, events);
                }
                let total: Option<TokenUsage> = usage.map(Into::into);
                let remainder = total
                    .map(|t| t.saturating_sub(&self.streamed))
                    .unwrap_or_default();
                self.result_usage = total;
                let cost = total_cost_usd.unwrap_or(0.0);
                self.cost_usd = cost;
                if !remainder.is_empty() || cost > 0.0 {
                    let _ = events.send(AgentEvent::Usage {
                        tokens: remainder,
                        cost_usd: cost,
                    });
                }
            }
            StreamEvent::Other => {}
        }
    }

    fn note_session(&mut self, id: String, events: &UnboundedSender<AgentEvent>) {
        if self.session_id.as_deref() != Some(id.as_str()) {
            let _ = events.send(AgentEvent::Session(id.clone()));
            self.session_id = Some(id);
        }
    }

    pub fn finish(self, exit_code: i32) -> AgentOutcome {
        let mut tokens = self.streamed;
        if let Some(total) = self.result_usage {
            tokens += total.saturating_sub(&self.streamed);
        }
        AgentOutcome {
            exit_code,
            output: self.final_result.unwrap_or(self.text),
            is_error: self.is_error,
            session_id: self.session_id,
            tokens,
            cost_usd: self.cost_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    // =========================================
    // Stream collector tests
    // =========================================

    #[test]
    fn test_collector_emits_events_and_totals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut c = StreamCollector::default();
        c.handle_line(r#"{"type":"system","subtype":"init","session_id":"s-1"}"#, &tx);
        c.handle_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working"},{"type":"tool_use","name":"Bash","input":{"command":"ls"}}],"usage":{"input_tokens":10,"output_tokens":5}},"session_id":"s-1"}"#,
            &tx,
        );
        c.handle_line(
            r#"{"type":"result","subtype":"success","result":"done","is_error":false,"total_cost_usd":0.3,"usage":{"input_tokens":12,"output_tokens":5}}"#,
            &tx,
        );

        let events = drain(&mut rx);
        assert_eq!(events[0], AgentEvent::Session("s-1".into()));
        assert_eq!(events[1], AgentEvent::Text("working".into()));
        assert!(matches!(&events[2], AgentEvent::ToolUse { description, .. } if description == "Running: ls"));
        assert!(matches!(&events[4], AgentEvent::Usage { tokens, cost_usd } if tokens.input == 2 && (*cost_usd - 0.3).abs() < 1e-9));

        let outcome = c.finish(0);
        assert!(outcome.succeeded());
        assert_eq!(outcome.output, "done");
        assert_eq!(outcome.tokens.input, 12);
        assert_eq!(outcome.tokens.output, 5);
        assert_eq!(outcome.session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn test_collector_without_result_uses_text() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut c = StreamCollector::default();
        c.handle_line("not json at all", &tx);
        c.handle_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}"#,
            &tx,
        );
        let outcome = c.finish(1);
        assert!(!outcome.succeeded());
        assert!(outcome.output.contains("not json at all"));
        assert!(outcome.output.contains("partial"));
    }

    #[test]
    fn test_collector_result_error_flag() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut c = StreamCollector::default();
        c.handle_line(
            r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#,
            &tx,
        );
        assert!(!c.finish(0).succeeded());
    }

    // =========================================
    // Flag tests
    // =========================================

    fn request() -> AgentRequest {
        AgentRequest {
            task_id: "TASK-001".into(),
            phase_id: "implement".into(),
            attempt: 1,
            prompt: "do it".into(),
            working_dir: std::env::temp_dir(),
            resume_session: Some("sess-7".into()),
            timeout: None,
        }
    }

    #[test]
    fn test_flags_include_resume_and_model() {
        let settings = AgentSection {
            model: Some("opus".into()),
            ..Default::default()
        };
        let flags = ClaudeRunner::new(settings).flags(&request());
        assert_eq!(flags[0], "--dangerously-skip-permissions");
        assert!(flags.windows(2).any(|w| w == ["--resume", "sess-7"]));
        assert!(flags.windows(2).any(|w| w == ["--model", "opus"]));
    }

    // =========================================
    // Process tests
    // =========================================

    #[cfg(unix)]
    fn fake_agent(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-claude.sh");
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_runs_process_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}'
echo '{"type":"result","subtype":"success","result":"finished","is_error":false,"session_id":"sess-9"}'"#;
        let settings = AgentSection {
            command: fake_agent(dir.path(), body),
            ..Default::default()
        };
        let runner = ClaudeRunner::new(settings).with_log_dir(dir.path().join("logs"));
        let mut req = request();
        req.working_dir = dir.path().to_path_buf();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = runner
            .invoke(req, tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.output, "finished");
        assert_eq!(outcome.session_id.as_deref(), Some("sess-9"));
        assert!(drain(&mut rx).contains(&AgentEvent::Text("hello".into())));
        assert!(
            dir.path()
                .join("logs/TASK-001-implement-attempt-1-prompt.md")
                .is_file()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_nonzero_exit_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSection {
            command: fake_agent(dir.path(), "echo 'boom' >&2\nexit 3"),
            ..Default::default()
        };
        let mut req = request();
        req.working_dir = dir.path().to_path_buf();
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = ClaudeRunner::new(settings)
            .invoke(req, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.output.contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSection {
            command: fake_agent(dir.path(), "sleep 30"),
            ..Default::default()
        };
        let mut req = request();
        req.working_dir = dir.path().to_path_buf();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let started = std::time::Instant::now();
        let err = ClaudeRunner::new(settings)
            .invoke(req, tx, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSection {
            command: fake_agent(dir.path(), "sleep 30"),
            ..Default::default()
        };
        let mut req = request();
        req.working_dir = dir.path().to_path_buf();
        req.timeout = Some(std::time::Duration::from_millis(200));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = ClaudeRunner::new(settings)
            .invoke(req, tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_invoke_missing_command_is_spawn_failure() {
        let settings = AgentSection {
            command: "/definitely/not/a/real/agent".into(),
            ..Default::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = ClaudeRunner::new(settings)
            .invoke(request(), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SpawnFailed(_)));
    }
}
