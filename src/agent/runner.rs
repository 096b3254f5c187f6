use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::Phase;
use crate::board::ItemId;
use crate::errors::DispatchError;

/// One agent invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub phase: Phase,
    pub item: ItemId,
    pub prompt: String,
    /// Directory the agent works in (a workspace, or the project root).
    pub workdir: PathBuf,
    /// Transcript log for this invocation.
    pub log_path: PathBuf,
}

/// How an invocation ended.
#[derive(Debug, Clone)]
pub struct AgentExit {
    pub success: bool,
    pub code: Option<i32>,
    pub transcript: String,
}

/// Runs the coding agent to completion.
/// Real implementation: `CliAgentRunner`. Test double: `testing::ScriptedAgent`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: &AgentRequest) -> Result<AgentExit, DispatchError>;
}

/// Runs the agent CLI (`claude --print ... -p <prompt>`) as a child process.
/// The child is killed if the invocation task is dropped or aborted.
pub struct CliAgentRunner {
    command: String,
    flags: Vec<String>,
    timeout: Duration,
}

impl CliAgentRunner {
    pub fn new(command: impl Into<String>, flags: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            flags,
            timeout,
        }
    }

    async fn open_log(&self, request: &AgentRequest) -> Result<tokio::fs::File, DispatchError> {
        let log_err = |source: std::io::Error| DispatchError::LogWrite {
            path: request.log_path.clone(),
            source,
        };
        if let Some(parent) = request.log_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(log_err)?;
        }
        let mut log = tokio::fs::File::create(&request.log_path).await.map_err(log_err)?;
        let header = format!(
            "# devloop {} #{} started {}\n# workdir: {}\n\n{}\n\n# --- transcript ---\n",
            request.phase,
            request.item,
            chrono::Utc::now().to_rfc3339(),
            request.workdir.display(),
            request.prompt
        );
        log.write_all(header.as_bytes()).await.map_err(log_err)?;
        Ok(log)
    }

    async fn run_to_completion(
        &self,
        request: &AgentRequest,
        mut log: tokio::fs::File,
    ) -> Result<AgentExit, DispatchError> {
        let mut child = Command::new(&self.command)
            .args(&self.flags)
            .arg("-p")
            .arg(&request.prompt)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DispatchError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_stderr = async {
            let mut content = String::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Some(line) = next_line_lossy(&mut reader, &mut buf).await {
                    content.push_str(&line);
                    content.push('\n');
                }
            }
            content
        };

        let read_stdout = async {
            let mut transcript = String::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                while let Some(line) = next_line_lossy(&mut reader, &mut buf).await {
                    if let Err(e) = log.write_all(format!("{}\n", line).as_bytes()).await {
                        tracing::warn!(log = %request.log_path.display(), error = %e, "Failed to write agent log");
                    }
                    transcript.push_str(&line);
                    transcript.push('\n');
                }
            }
            transcript
        };

        let (transcript, stderr_content) = tokio::join!(read_stdout, read_stderr);
        let status = child.wait().await.map_err(DispatchError::Spawn)?;

        if !stderr_content.trim().is_empty() {
            let tail = format!("\n# --- stderr ---\n{}", stderr_content);
            if let Err(e) = log.write_all(tail.as_bytes()).await {
                tracing::warn!(log = %request.log_path.display(), error = %e, "Failed to write agent log");
            }
        }
        let footer = format!("\n# exit: {:?}\n", status.code());
        let _ = log.write_all(footer.as_bytes()).await;
        let _ = log.flush().await;

        Ok(AgentExit {
            success: status.success(),
            code: status.code(),
            transcript,
        })
    }
}

/// Next line without its terminator, or `None` at EOF. Bytes that are not
/// UTF-8 are replaced rather than ending the stream.
async fn next_line_lossy<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String> {
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => {
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }
            Some(String::from_utf8_lossy(buf).into_owned())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read agent output");
            None
        }
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(&self, request: &AgentRequest) -> Result<AgentExit, DispatchError> {
        let log = self.open_log(request).await?;
        match tokio::time::timeout(self.timeout, self.run_to_completion(request, log)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(dir: &std::path::Path) -> AgentRequest {
        AgentRequest {
            phase: Phase::Implement,
            item: 42,
            prompt: "RESULT=IMPLEMENTED".into(),
            workdir: dir.to_path_buf(),
            log_path: dir.join("logs").join("implement-42.log"),
        }
    }

    #[tokio::test]
    async fn captures_transcript_and_writes_log() {
        let dir = tempdir().unwrap();
        // `echo -p <prompt>` prints the prompt back, standing in for the agent.
        let runner = CliAgentRunner::new("echo", vec![], Duration::from_secs(10));
        let exit = runner.run(&request(dir.path())).await.unwrap();

        assert!(exit.success);
        assert!(exit.transcript.contains("RESULT=IMPLEMENTED"));
        let log = std::fs::read_to_string(dir.path().join("logs").join("implement-42.log")).unwrap();
        assert!(log.contains("# devloop implement #42"));
        assert!(log.contains("# --- transcript ---"));
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_truncate_transcript() {
        let dir = tempdir().unwrap();
        let runner = CliAgentRunner::new(
            "sh",
            vec![
                "-c".into(),
                "printf 'diff \\377\\376 binary\\n'; echo RESULT=IMPLEMENTED".into(),
                "sh".into(),
            ],
            Duration::from_secs(10),
        );
        let exit = runner.run(&request(dir.path())).await.unwrap();

        assert!(exit.success);
        assert!(exit.transcript.contains("diff \u{FFFD}\u{FFFD} binary"));
        assert!(exit.transcript.contains("RESULT=IMPLEMENTED"));
        assert!(matches!(
            crate::agent::parse_outcome(Phase::Implement, &exit.transcript),
            crate::agent::AgentOutcome::Recognized { .. }
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let runner = CliAgentRunner::new("devloop-no-such-agent-binary", vec![], Duration::from_secs(10));
        let err = runner.run(&request(dir.path())).await.unwrap_err();
        assert!(matches!(err, DispatchError::Spawn(_)));
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let dir = tempdir().unwrap();
        let runner = CliAgentRunner::new(
            "sh",
            vec!["-c".into(), "sleep 5".into(), "sh".into()],
            Duration::from_millis(200),
        );
        let err = runner.run(&request(dir.path())).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
    }
}
