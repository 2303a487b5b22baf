//! Script plugins: an external command fed the event context as JSON on stdin.
//!
//! Every non-empty stdout line becomes a reply to the originating chat. A line
//! that parses as `{"reply": "..."}` sends just the reply text.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tether_core::context::EventContext;
use tether_core::events::ProtocolEvent;
use tether_core::transport::Socket;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::catalog::reply;
use crate::error::PluginError;
use crate::plugin::PluginHandler;

#[derive(Clone, Debug)]
pub struct ScriptHandler {
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ReplyLine {
    reply: String,
}

impl ScriptHandler {
    /// `argv[0]` containing a path separator is resolved against `cwd`.
    pub fn new(argv: Vec<String>, cwd: PathBuf, timeout: Duration) -> Result<Self, PluginError> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| PluginError::manifest(&cwd, "empty command"))?;
        let program = if program.contains('/') && !program.starts_with('/') {
            cwd.join(&program).to_string_lossy().into_owned()
        } else {
            program
        };
        Ok(Self {
            program,
            args: argv.collect(),
            cwd,
            timeout,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn replies(stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .map(|line| match serde_json::from_str::<ReplyLine>(line) {
                Ok(parsed) => parsed.reply,
                Err(_) => line.to_string(),
            })
            .filter(|text| !text.is_empty())
            .collect()
    }

    async fn run(&self, input: Vec<u8>) -> Result<String, PluginError> {
        let start = Instant::now();
        let mut cmd = tokio::process::Command::new(&self.program);
        let _ = cmd
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(PluginError::io(&self.program))?;

        let stdin_pipe = child.stdin.take();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let stdin_handle = tokio::spawn(async move {
            if let Some(mut pipe) = stdin_pipe {
                // Scripts that ignore stdin close the pipe early.
                let _ = pipe.write_all(&input).await;
                let _ = pipe.shutdown().await;
            }
        });
        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(PluginError::io(&self.program))?;
                let _ = stdin_handle.await;
                let stdout = stdout_handle.await.unwrap_or_default();
                let stderr = stderr_handle.await.unwrap_or_default();
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                debug!(program = %self.program, exit_code = ?status.code(), duration_ms, "script finished");

                if !status.success() {
                    return Err(PluginError::ScriptFailed {
                        status: status.code().unwrap_or(-1),
                        stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                    });
                }
                Ok(String::from_utf8_lossy(&stdout).into_owned())
            }
            () = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                stdin_handle.abort();
                stdout_handle.abort();
                stderr_handle.abort();
                warn!(program = %self.program, timeout = ?self.timeout, "script timed out");
                Err(PluginError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl PluginHandler for ScriptHandler {
    async fn invoke(
        &self,
        socket: &Arc<dyn Socket>,
        ctx: &EventContext,
        _event: ProtocolEvent,
    ) -> Result<(), PluginError> {
        let input = serde_json::to_vec(&ctx.to_script_input())
            .map_err(|e| PluginError::Handler(format!("encode script input: {e}")))?;
        let stdout = self.run(input).await?;
        for line in Self::replies(&stdout) {
            reply(socket, ctx, &line).await?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "script"
    }
}
