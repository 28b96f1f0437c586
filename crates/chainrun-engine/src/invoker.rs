//! Model invocation seam.
//!
//! The engine never talks to a provider directly. Everything goes through
//! [`ModelInvoker`], which executes one rendered prompt for one chain step and
//! estimates token counts. [`CommandInvoker`] is a provider-agnostic
//! implementation that pipes the prompt through an external command.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainrun_core::{estimate_tokens, ChainStep, GenerationParams};

/// Errors returned by a model invoker.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The backend rejected or failed the call.
    #[error("Model call failed: {0}")]
    Failed(String),

    /// The caller's cancellation token fired.
    #[error("Model call cancelled")]
    Cancelled,

    #[error("Failed to spawn model command: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Executes one prompt against one backend model.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Run `prompt` for `step`. Implementations should return
    /// [`InvokeError::Cancelled`] promptly once `cancel` fires.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        step: &ChainStep,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, InvokeError>;

    /// Estimated token count of `text`.
    fn estimate_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

/// Invoker that runs an external command per call.
///
/// The prompt is written to the command's stdin and its stdout is the model
/// output. Step and parameter details are exposed as `CHAINRUN_*` environment
/// variables. The child is killed if the call is cancelled.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    program: String,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
}

impl CommandInvoker {
    /// Create an invoker for `program`, resolved through PATH.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
        }
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    fn build_command(&self, step: &ChainStep, params: &GenerationParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("CHAINRUN_STEP_ID", step.id.as_str())
            .env("CHAINRUN_STEP_ROLE", &step.role)
            .env("CHAINRUN_BACKEND", &step.backend);

        if let Some(model) = &params.model {
            cmd.env("CHAINRUN_MODEL", model);
        }
        if let Some(temperature) = params.temperature {
            cmd.env("CHAINRUN_TEMPERATURE", temperature.to_string());
        }
        if let Some(max_tokens) = params.max_tokens {
            cmd.env("CHAINRUN_MAX_TOKENS", max_tokens.to_string());
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl ModelInvoker for CommandInvoker {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        step: &ChainStep,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, InvokeError> {
        info!(
            program = %self.program,
            step = %step.id,
            backend = %step.backend,
            prompt_len = prompt.len(),
            "Spawning model command"
        );

        let mut child = self.build_command(step, params).spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| InvokeError::Failed("failed to open command stdin".to_string()))?;
        let prompt = prompt.to_owned();
        let writer = tokio::spawn(async move {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(error = %e, "Failed to write prompt to model command");
            }
            // stdin is dropped here so the command sees EOF
        });

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                writer.abort();
                return Err(InvokeError::Cancelled);
            }
            output = child.wait_with_output() => output?,
        };
        let _ = writer.await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InvokeError::Failed(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        debug!(step = %step.id, output_len = text.len(), "Model command finished");
        Ok(text)
    }
}
