//! Claude Code process supervision.
//!
//! Two execution modes are supported:
//!
//! - **background**: stdout and stderr go to a capture file; the controller
//!   polls the process on a fixed interval, tails the capture for progress
//!   and kills the process at the timeout.
//! - **streaming**: stdout is read line by line, teed to a raw capture log
//!   and, through [`filter_stream_line`], to a live log that can be tailed.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::stream::filter_stream_line;
use crate::config::{ExecutionMode, LoopConfig, OutputFormat};
use crate::error::LoopError;
use crate::testing::{AgentProcess, AgentRequest, AgentRun};

/// File that mirrors the filtered stream for `tail -f`.
pub const LIVE_LOG_FILE: &str = "live.log";

/// Real agent process.
#[derive(Debug, Clone)]
pub struct ClaudeCodeProcess {
    project_dir: PathBuf,
    log_dir: PathBuf,
    command: String,
    output_format: OutputFormat,
    allowed_tools: Vec<String>,
    mode: ExecutionMode,
    poll_interval: Duration,
}

impl ClaudeCodeProcess {
    #[must_use]
    pub fn new(project_dir: &Path, log_dir: &Path, config: &LoopConfig) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            log_dir: log_dir.to_path_buf(),
            command: config.agent.command.clone(),
            output_format: config.effective_output_format(),
            allowed_tools: config.agent.allowed_tools.clone(),
            mode: config.agent.execution_mode,
            poll_interval: Duration::from_secs(config.agent.poll_interval_secs),
        }
    }

    /// Command-line arguments for one invocation.
    #[must_use]
    pub fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            self.output_format.to_string(),
        ];
        if self.output_format == OutputFormat::StreamJson {
            args.push("--verbose".to_string());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.extend(self.allowed_tools.iter().cloned());
        }
        if let Some(token) = &request.continuity_token {
            args.push("--resume".to_string());
            args.push(token.clone());
        }
        args
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(self.build_args(request))
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// A vanished binary ends the run; any other spawn failure is retried.
    fn spawn_error(&self, err: std::io::Error) -> LoopError {
        if err.kind() == std::io::ErrorKind::NotFound {
            LoopError::AgentNotFound {
                command: self.command.clone(),
            }
        } else {
            LoopError::agent(format!("failed to spawn {}: {err}", self.command))
        }
    }

    fn capture_path(&self, loop_number: u32) -> PathBuf {
        self.log_dir.join(format!("claude_output_loop_{loop_number}.log"))
    }

    async fn run_background(&self, request: &AgentRequest) -> Result<AgentRun> {
        let capture = self.capture_path(request.loop_number);
        let stdout = std::fs::File::create(&capture)
            .with_context(|| format!("Failed to create {}", capture.display()))?;
        let stderr = stdout.try_clone().context("Failed to share capture file")?;

        let started = Instant::now();
        let deadline = started + request.timeout;
        let mut child = self
            .command(request)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        debug!("Agent running in background (pid {:?})", child.id());

        let mut tail_offset = 0;
        let status = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break None;
            }
            match tokio::time::timeout(remaining.min(self.poll_interval), child.wait()).await {
                Ok(status) => break Some(status.context("Failed to wait for agent")?),
                Err(_) => tail_offset = tail_progress(&capture, tail_offset).await,
            }
        };

        if status.is_none() {
            kill(&mut child).await;
        }
        let output = read_lossy(&capture).await;
        Ok(finish(status, started.elapsed(), output))
    }

    async fn run_streaming(&self, request: &AgentRequest) -> Result<AgentRun> {
        let raw_path = self.capture_path(request.loop_number);
        let err_path = raw_path.with_extension("err.log");
        let mut raw = File::create(&raw_path)
            .await
            .with_context(|| format!("Failed to create {}", raw_path.display()))?;
        let mut live = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(LIVE_LOG_FILE))
            .await
            .context("Failed to open live log")?;
        let stderr = std::fs::File::create(&err_path)
            .with_context(|| format!("Failed to create {}", err_path.display()))?;

        let started = Instant::now();
        let mut child = self
            .command(request)
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let stdout = child
            .stdout
            .take()
            .context("Agent stdout was not captured")?;
        let reader = BufReader::new(stdout);

        let mut output = String::new();
        let status = tokio::time::timeout(
            request.timeout,
            stream_until_exit(&mut child, reader, &mut raw, &mut live, &mut output),
        )
        .await;

        let status = match status {
            Ok(status) => Some(status?),
            Err(_) => {
                kill(&mut child).await;
                None
            }
        };

        let _ = raw.flush().await;
        let _ = live.flush().await;

        let stderr_output = read_lossy(&err_path).await;
        if !stderr_output.trim().is_empty() {
            output.push_str(&stderr_output);
        }
        Ok(finish(status, started.elapsed(), output))
    }
}

#[async_trait]
impl AgentProcess for ClaudeCodeProcess {
    async fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        info!(
            "Invoking {} (loop {}, {} mode, timeout {}m{})",
            self.command,
            request.loop_number,
            self.mode,
            request.timeout.as_secs() / 60,
            if request.continuity_token.is_some() {
                ", resuming session"
            } else {
                ""
            }
        );
        match self.mode {
            ExecutionMode::Background => self.run_background(request).await,
            ExecutionMode::Streaming => self.run_streaming(request).await,
        }
    }
}

async fn stream_until_exit<R>(
    child: &mut Child,
    mut reader: R,
    raw: &mut File,
    live: &mut File,
    output: &mut String,
) -> Result<ExitStatus>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    while let Some(line) = next_line_lossy(&mut reader, &mut buf).await? {
        raw.write_all(line.as_bytes()).await?;
        raw.write_all(b"\n").await?;
        if let Some(text) = filter_stream_line(&line) {
            live.write_all(text.as_bytes()).await?;
            live.write_all(b"\n").await?;
            info!("{}", text);
        }
        output.push_str(&line);
        output.push('\n');
    }
    child.wait().await.context("Failed to wait for agent")
}

/// Next line without its terminator; invalid UTF-8 is replaced, not fatal.
async fn next_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Log lines appended to the capture file since `offset`. Returns the new offset.
async fn tail_progress(path: &Path, offset: usize) -> usize {
    let Ok(bytes) = fs::read(path).await else {
        return offset;
    };
    if bytes.len() <= offset {
        return offset;
    }
    let fresh = String::from_utf8_lossy(&bytes[offset..]);
    if let Some(last) = fresh.lines().rev().find(|l| !l.trim().is_empty()) {
        debug!("agent: {}", last.trim());
    }
    bytes.len()
}

async fn read_lossy(path: &Path) -> String {
    match fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Could not read agent output {}: {}", path.display(), e);
            String::new()
        }
    }
}

async fn kill(child: &mut Child) {
    warn!("Agent exceeded its timeout, killing it");
    if let Err(e) = child.kill().await {
        warn!("Failed to kill agent process: {}", e);
    }
}

fn finish(status: Option<ExitStatus>, duration: Duration, output: String) -> AgentRun {
    match status {
        Some(status) => AgentRun {
            exit_code: status.code(),
            timed_out: false,
            duration,
            output,
        },
        None => AgentRun::timed_out(duration, output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(token: Option<&str>) -> AgentRequest {
        AgentRequest {
            loop_number: 1,
            prompt: "Build the thing".into(),
            continuity_token: token.map(String::from),
            timeout: Duration::from_secs(5),
        }
    }

    fn process(config: &LoopConfig, temp: &TempDir) -> ClaudeCodeProcess {
        ClaudeCodeProcess::new(temp.path(), temp.path(), config)
    }

    #[test]
    fn test_build_args_json() {
        let temp = TempDir::new().unwrap();
        let args = process(&LoopConfig::default(), &temp).build_args(&request(None));
        assert_eq!(&args[..4], ["-p", "Build the thing", "--output-format", "json"]);
        assert!(args.contains(&"--allowedTools".to_string()));
        assert!(args.contains(&"Bash(git *)".to_string()));
        assert!(!args.contains(&"--resume".to_string()));
        assert!(!args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_build_args_resume_and_stream() {
        let temp = TempDir::new().unwrap();
        let mut config = LoopConfig::default();
        config.agent.execution_mode = ExecutionMode::Streaming;
        config.agent.allowed_tools.clear();

        let args = process(&config, &temp).build_args(&request(Some("abc")));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
        assert_eq!(&args[args.len() - 2..], ["--resume", "abc"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_run_captures_output() {
        let temp = TempDir::new().unwrap();
        let mut config = LoopConfig::default();
        config.agent.command = "echo".into();
        config.agent.poll_interval_secs = 1;

        let run = process(&config, &temp).run(&request(None)).await.unwrap();
        assert!(run.succeeded());
        assert!(run.output.contains("Build the thing"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streaming_run_captures_output() {
        let temp = TempDir::new().unwrap();
        let mut config = LoopConfig::default();
        config.agent.command = "echo".into();
        config.agent.execution_mode = ExecutionMode::Streaming;

        let run = process(&config, &temp).run(&request(None)).await.unwrap();
        assert!(run.succeeded());
        assert!(run.output.contains("stream-json"));
        let live = std::fs::read_to_string(temp.path().join(LIVE_LOG_FILE)).unwrap();
        assert!(live.contains("Build the thing"));
    }

    #[tokio::test]
    async fn test_next_line_lossy_replaces_invalid_utf8() {
        let mut reader = BufReader::new(&b"ok \xff\xfe bytes\r\nlast"[..]);
        let mut buf = Vec::new();

        let first = next_line_lossy(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(first, "ok \u{FFFD}\u{FFFD} bytes");
        let second = next_line_lossy(&mut reader, &mut buf).await.unwrap();
        assert_eq!(second.as_deref(), Some("last"));
        assert!(next_line_lossy(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streaming_survives_invalid_utf8() {
        let temp = TempDir::new().unwrap();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("printf 'ok \\377\\376 bytes\\n'; echo done; exit 0")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let reader = BufReader::new(child.stdout.take().unwrap());
        let mut raw = File::create(temp.path().join("raw.log")).await.unwrap();
        let mut live = File::create(temp.path().join(LIVE_LOG_FILE)).await.unwrap();
        let mut output = String::new();

        let status = stream_until_exit(&mut child, reader, &mut raw, &mut live, &mut output)
            .await
            .unwrap();

        assert!(status.success());
        assert_eq!(output, "ok \u{FFFD}\u{FFFD} bytes\ndone\n");
    }

    #[tokio::test]
    async fn test_missing_command_is_agent_not_found() {
        let temp = TempDir::new().unwrap();
        let mut config = LoopConfig::default();
        config.agent.command = "definitely-not-an-installed-agent".into();
        let err = process(&config, &temp).run(&request(None)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoopError>(),
            Some(LoopError::AgentNotFound { .. })
        ));
    }
}
