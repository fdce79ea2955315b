//! Agent invocation capability and the stream-json wire format.
//!
//! [`AgentInvoker`] is the seam between the orchestrator and the external
//! coding agent. The real implementation spawns the agent CLI, feeds the
//! prompt on stdin, and parses its stream-json event output, forwarding
//! streaming text and tool activity to the [`OutputHandler`]. Tests script
//! the seam with `fake::FakeAgent`.

use crate::billing::{CostSnapshot, ModelUsage};
use crate::output::OutputHandler;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// One request to the agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    /// Continue an existing agent session instead of starting fresh.
    pub resume_session: Option<String>,
}

/// What one agent invocation produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub output: String,
    pub exit_code: i32,
    pub is_error: bool,
    pub cost: CostSnapshot,
    pub session_id: Option<String>,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: AgentRequest, handler: &dyn OutputHandler)
    -> Result<AgentOutcome>;
}

/// Events in the agent CLI's stream-json output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<UsageBlock>,
        #[serde(default, rename = "modelUsage")]
        model_usage: Option<HashMap<String, ModelUsageBlock>>,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize, Default)]
pub struct UsageBlock {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Per-model usage as emitted on the wire (camelCase).
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsageBlock {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub web_search_requests: u64,
    #[serde(default, rename = "costUSD")]
    pub cost_usd: f64,
    #[serde(default)]
    pub context_window: u64,
}

impl ModelUsageBlock {
    fn into_usage(self) -> ModelUsage {
        ModelUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            web_search_requests: self.web_search_requests,
            cost_usd: self.cost_usd,
            context_window: self.context_window,
        }
    }
}

/// Short status line for a tool-use event.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("...")
            .to_string()
    };
    match name {
        "Read" => format!("Reading {}", path("file_path")),
        "Write" => format!("Creating {}", path("file_path")),
        "Edit" => format!("Editing {}", path("file_path")),
        "Bash" => {
            let cmd = path("command");
            // Cut on a char boundary; commands may carry multibyte text.
            let cmd = match cmd.char_indices().nth(48) {
                Some((cut, _)) => format!("{}…", &cmd[..cut]),
                None => cmd,
            };
            format!("Running {cmd}")
        }
        other => format!("Tool: {other}"),
    }
}

/// Extract the last top-level JSON object embedded in free text.
///
/// Agent output wraps verdicts and plans in prose; the last balanced
/// `{...}` block is the one we asked for.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut last: Option<Value> = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_end(bytes, i) {
                if let Ok(value) = serde_json::from_str::<Value>(&text[i..=end]) {
                    if value.is_object() {
                        last = Some(value);
                        i = end + 1;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }
    last
}

/// Index of the `}` closing the object that opens at `start`, honoring
/// string literals and escapes.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Real agent over the configured CLI command.
pub struct ProcessAgent {
    cmd: String,
    project_dir: PathBuf,
}

impl ProcessAgent {
    pub fn new(cmd: String, project_dir: PathBuf) -> Self {
        Self { cmd, project_dir }
    }

    fn flags(&self, request: &AgentRequest) -> Vec<String> {
        let mut flags = vec![
            "--dangerously-skip-permissions".to_string(),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(session) = &request.resume_session {
            flags.push("--resume".to_string());
            flags.push(session.clone());
        }
        flags
    }
}

#[async_trait]
impl AgentInvoker for ProcessAgent {
    async fn invoke(
        &self,
        request: AgentRequest,
        handler: &dyn OutputHandler,
    ) -> Result<AgentOutcome> {
        let mut cmd = Command::new(&self.cmd);
        cmd.args(self.flags(&request));

        debug!(cmd = %self.cmd, "spawning agent");
        let mut child = cmd
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .current_dir(&self.project_dir)
            .spawn()
            .context("Failed to spawn agent process")?;

        // Feed the prompt and drain stderr concurrently with the stdout
        // loop; either pipe can fill and wedge the child otherwise.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt;
            tokio::spawn(async move {
                if stdin.write_all(prompt.as_bytes()).await.is_ok() {
                    let _ = stdin.shutdown().await;
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "agent stderr");
                }
            });
        }

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let mut reader = BufReader::new(stdout).lines();

        let mut accumulated = String::new();
        let mut final_result: Option<String> = None;
        let mut is_error = false;
        let mut cost = CostSnapshot::default();
        let mut session_id: Option<String> = None;

        while let Some(line) = reader.next_line().await? {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::Assistant { message, session_id: sid }) => {
                    if !sid.is_empty() {
                        session_id = Some(sid);
                    }
                    for content in message.content {
                        match content {
                            ContentBlock::ToolUse { name, input } => {
                                handler.progress(&describe_tool_use(&name, &input));
                            }
                            ContentBlock::Text { text } => {
                                handler.output(&text);
                                accumulated.push_str(&text);
                                accumulated.push('\n');
                            }
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    is_error: err,
                    total_cost_usd,
                    usage,
                    model_usage,
                    session_id: sid,
                }) => {
                    final_result = result;
                    is_error = err;
                    if let Some(sid) = sid {
                        session_id = Some(sid);
                    }
                    cost.total_cost_usd = total_cost_usd.unwrap_or(0.0);
                    if let Some(usage) = usage {
                        cost.input_tokens = usage.input_tokens;
                        cost.output_tokens = usage.output_tokens;
                    }
                    if let Some(models) = model_usage {
                        cost.model_usage = models
                            .into_iter()
                            .map(|(name, block)| (name, block.into_usage()))
                            .collect();
                    }
                }
                Ok(StreamEvent::User {}) | Ok(StreamEvent::System { .. }) => {}
                Err(_) => {
                    // Non-JSON noise (stderr bleed, partial lines).
                    accumulated.push_str(&line);
                    accumulated.push('\n');
                }
            }
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);
        debug!(exit_code, is_error, "agent finished");

        Ok(AgentOutcome {
            output: final_result.unwrap_or(accumulated),
            exit_code,
            is_error,
            cost,
            session_id,
        })
    }
}
