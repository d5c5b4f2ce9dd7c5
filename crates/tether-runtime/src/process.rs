use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};

use tether_core::ExecutorConfig;
use tether_orchestrator::{Executor, RunContext};
use tether_types::EventPayload;

use crate::{encode_input_line, parse_output_line, ControlLine, InputLine, OutputLine};

const STDERR_TAIL_BYTES: usize = 2_000;

/// Runs each execution as a child process speaking JSONL over stdio.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> anyhow::Result<Self> {
        let program = config
            .command
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow::anyhow!("executor.command is not configured"))?;
        Ok(Self {
            program: program.to_string(),
            args: config.args.clone(),
            env: config.env.clone(),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, mut ctx: RunContext) -> anyhow::Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .env("TETHER_SESSION_KEY", ctx.session_key.as_str())
            .env("TETHER_RUN_ID", &ctx.run_id)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn executor `{}`", self.program))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("stderr unavailable"))?;
        let stderr_task = tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES));

        tracing::debug!(
            session_key = %ctx.session_key,
            run_id = %ctx.run_id,
            program = %self.program,
            pid = ?child.id(),
            "executor process started"
        );
        send(&mut stdin, &InputLine::Input { text: ctx.input.clone() }).await;

        let mut lines = BufReader::new(stdout).lines();
        let mut follow_ups = ctx.take_follow_ups();
        let mut follow_ups_open = true;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    handle_line(&ctx, &mut stdin, &line).await?;
                }
                message = follow_ups.recv(), if follow_ups_open => match message {
                    Some(text) => send(&mut stdin, &InputLine::FollowUp { text }).await,
                    None => follow_ups_open = false,
                },
                _ = ctx.cancel.cancelled() => {
                    let _ = child.kill().await;
                    anyhow::bail!("execution cancelled");
                }
            }
        }

        drop(stdin);
        let status = child.wait().await?;
        let tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let tail = tail.trim();
            if tail.is_empty() {
                anyhow::bail!("executor exited with {status}");
            }
            anyhow::bail!("executor exited with {status}: {tail}");
        }
        Ok(())
    }
}

async fn handle_line(ctx: &RunContext, stdin: &mut ChildStdin, line: &str) -> anyhow::Result<()> {
    match parse_output_line(line) {
        None => {}
        Some(OutputLine::Event(payload)) => {
            ctx.emit(payload)?;
        }
        Some(OutputLine::Control(ControlLine::SpawnSubagent { task, label })) => {
            match ctx.spawn_subagent(task, label).await {
                Ok(child_session_key) => {
                    send(stdin, &InputLine::SubagentSpawned { child_session_key }).await
                }
                Err(err) => {
                    ctx.emit(EventPayload::notice(format!("subagent spawn failed: {err}")))?;
                    send(
                        stdin,
                        &InputLine::SubagentError {
                            error: err.to_string(),
                        },
                    )
                    .await;
                }
            }
        }
        Some(OutputLine::Control(ControlLine::WaitSubagents)) => {
            let status = ctx.wait_for_subagents().await;
            send(stdin, &InputLine::SubagentsSettled { status }).await;
        }
    }
    Ok(())
}

/// Best effort: a child that stopped reading stdin is not an error by itself.
async fn send(stdin: &mut ChildStdin, line: &InputLine) {
    let result = async {
        let raw = encode_input_line(line)?;
        stdin.write_all(raw.as_bytes()).await?;
        stdin.flush().await?;
        anyhow::Ok(())
    }
    .await;
    if let Err(err) = result {
        tracing::debug!(error = %err, "executor stdin write failed");
    }
}

async fn read_tail(mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static, max: usize) -> String {
    let mut buf = vec![0_u8; 4096];
    let mut out = String::new();
    loop {
        let read = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        out.push_str(&String::from_utf8_lossy(&buf[..read]));
        if out.len() > max * 2 {
            let mut cut = out.len() - max;
            while !out.is_char_boundary(cut) {
                cut += 1;
            }
            out = out.split_off(cut);
        }
    }
    if out.len() > max {
        let mut cut = out.len() - max;
        while !out.is_char_boundary(cut) {
            cut += 1;
        }
        out = out.split_off(cut);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_requires_a_command() {
        let err = ProcessExecutor::from_config(&ExecutorConfig::default()).expect_err("missing");
        assert!(err.to_string().contains("executor.command"));

        let config = ExecutorConfig {
            command: Some(" agent ".to_string()),
            args: vec!["--jsonl".to_string()],
            env: HashMap::new(),
        };
        let executor = ProcessExecutor::from_config(&config).expect("executor");
        assert_eq!(executor.program(), "agent");
    }

    #[tokio::test]
    async fn read_tail_keeps_the_end_of_long_output() {
        let data = format!("{}END", "x".repeat(10_000));
        let tail = read_tail(std::io::Cursor::new(data.into_bytes()), 100).await;
        assert_eq!(tail.len(), 100);
        assert!(tail.ends_with("END"));
    }
}
