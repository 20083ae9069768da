//! Text completion backends for the feedback stage.
//!
//! Two backends share one trait:
//! - the OpenAI Responses API over HTTP (`OPENAI_API_KEY`)
//! - a local command that reads the prompt on stdin and prints the answer
//!   (`MONTHLY_LM_COMMAND`, split with shell-words)
//!
//! The command backend wins when both are configured, so dry runs never
//! reach the network.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_MODEL: &str = "gpt-5-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Turns a prompt into text.
pub trait TextCompleter {
    fn complete(&mut self, prompt: &str) -> Result<String>;

    /// Short backend label for logs.
    fn label(&self) -> String;
}

/// Settings for building a completer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmSettings {
    pub command: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub max_output_tokens: u32,
}

impl Default for LmSettings {
    fn default() -> Self {
        Self {
            command: None,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
            max_retries: 2,
            max_output_tokens: 2000,
        }
    }
}

/// Build the configured backend.
pub fn build_completer(settings: &LmSettings) -> Result<Box<dyn TextCompleter>> {
    if let Some(command) = settings.command.as_deref().filter(|c| !c.trim().is_empty()) {
        return Ok(Box::new(CommandCompleter::new(command)?));
    }
    let api_key = settings
        .api_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set (and no MONTHLY_LM_COMMAND)"))?;
    Ok(Box::new(OpenAiCompleter::new(api_key, settings)))
}

/// Runs a local command with the prompt on stdin.
#[derive(Debug)]
pub struct CommandCompleter {
    argv: Vec<String>,
}

impl CommandCompleter {
    pub fn new(command: &str) -> Result<Self> {
        let argv =
            shell_words::split(command).with_context(|| format!("parse LM command: {command}"))?;
        let Some(program) = argv.first() else {
            return Err(anyhow!("LM command is empty"));
        };
        which::which(program).with_context(|| format!("LM command not found: {program}"))?;
        Ok(Self { argv })
    }
}

impl TextCompleter for CommandCompleter {
    fn complete(&mut self, prompt: &str) -> Result<String> {
        let start = Instant::now();
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn LM command: {}", self.argv[0]))?;

        // Feed stdin from its own thread so a command that answers while
        // still reading cannot fill the stdout pipe and stall us.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_string();
            thread::spawn(move || stdin.write_all(prompt.as_bytes()))
        });

        let output = child.wait_with_output().context("wait for LM command")?;
        let written = match writer.map(thread::JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => return Err(anyhow!("LM stdin writer panicked")),
            None => Ok(()),
        };
        let elapsed_ms = start.elapsed().as_millis();
        tracing::info!(
            elapsed_ms,
            prompt_bytes = prompt.len(),
            response_bytes = output.stdout.len(),
            "lm command complete"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "LM command failed with status {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        written.context("write prompt to LM stdin")?;
        let text = String::from_utf8(output.stdout).context("decode LM stdout as UTF-8")?;
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("LM command produced no output"));
        }
        Ok(text.to_string())
    }

    fn label(&self) -> String {
        format!("command:{}", self.argv[0])
    }
}

/// OpenAI Responses API client.
pub struct OpenAiCompleter {
    agent: ureq::Agent,
    api_key: String,
    model: String,
    url: String,
    max_retries: u32,
    max_output_tokens: u32,
    backoff: Duration,
}

impl OpenAiCompleter {
    pub fn new(api_key: &str, settings: &LmSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            api_key: api_key.to_string(),
            model: settings.model.clone(),
            url: format!("{}/responses", settings.base_url.trim_end_matches('/')),
            max_retries: settings.max_retries,
            max_output_tokens: settings.max_output_tokens,
            backoff: Duration::from_millis(1500),
        }
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "input": prompt,
            "max_output_tokens": self.max_output_tokens,
        })
    }

    /// One attempt. `Err((retryable, error))` on failure.
    fn attempt(&self, body: &Value) -> std::result::Result<String, (bool, anyhow::Error)> {
        let mut response = self
            .agent
            .post(&self.url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(body)
            .map_err(|err| (true, anyhow!("completion request failed: {err}")))?;
        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|err| (true, anyhow!("read completion response: {err}")))?;
        if !(200..300).contains(&status) {
            let retryable = status == 429 || status >= 500;
            return Err((
                retryable,
                anyhow!(
                    "completion API returned HTTP {status}: {}",
                    crate::util::truncate_string(&text, 300)
                ),
            ));
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|err| (false, anyhow!("parse completion response: {err}")))?;
        response_text(&value).ok_or_else(|| (false, anyhow!("completion response has no text")))
    }
}

impl TextCompleter for OpenAiCompleter {
    fn complete(&mut self, prompt: &str) -> Result<String> {
        let body = self.request_body(prompt);
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.attempt(&body) {
                Ok(text) => {
                    tracing::info!(
                        elapsed_ms = start.elapsed().as_millis(),
                        model = %self.model,
                        attempts = attempt + 1,
                        "completion received"
                    );
                    return Ok(text);
                }
                Err((true, err)) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff * attempt;
                    tracing::warn!(error = %err, attempt, delay_ms = delay.as_millis(), "completion failed; retrying");
                    thread::sleep(delay);
                }
                Err((_, err)) => return Err(err),
            }
        }
    }

    fn label(&self) -> String {
        format!("openai:{}", self.model)
    }
}

/// Pull the answer out of a Responses API payload.
///
/// Prefers the `output_text` convenience field; otherwise joins every
/// `output[*].content[*].text` with blank lines.
pub fn response_text(value: &Value) -> Option<String> {
    if let Some(text) = value.get("output_text").and_then(Value::as_str) {
        let text = text.trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    let parts: Vec<&str> = value
        .get("output")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|content| content.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}
