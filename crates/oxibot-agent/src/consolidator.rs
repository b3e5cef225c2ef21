//! Background memory consolidation — folds aging history into long-term
//! memory so the live context window stays bounded.
//!
//! Grounded on nanobot's `agent/memory.py` consolidation pass (trigger
//! thresholds against a rolling watermark, single-flight scheduling per
//! session, LLM-authored summary + memory-file patch) adapted onto this
//! crate's `SessionManager`/`MemoryStore` split and `tracing`-based logging.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use oxibot_core::session::SessionManager;
use oxibot_core::types::Message;
use oxibot_providers::{LlmProvider, LlmRequestConfig};

use crate::memory::MemoryStore;

/// Consolidation fires once `delta` (uncompressed messages past the
/// watermark) reaches this many messages, regardless of the cooldown.
const HARD_LIMIT: usize = 30;
/// Minimum time between consolidation passes for a session that hasn't hit
/// `HARD_LIMIT`, so a chatty-but-under-threshold session still compresses
/// eventually.
const COOLDOWN: chrono::Duration = chrono::Duration::minutes(15);

const CONSOLIDATION_SYSTEM_PROMPT: &str = "You are compressing older conversation history into long-term memory. \
Given a transcript slice, produce a JSON object with exactly two keys: \
`history_entry` (a concise third-person summary of what happened, 2-4 sentences) \
and `memory_update` (the full rewritten long-term memory document, incorporating \
any durable facts from this slice — return the existing memory unchanged if nothing \
new is worth keeping). Respond with JSON only, no commentary.";

/// Decides when a session's history should be folded into long-term memory,
/// and performs the fold by asking the LLM to summarize the aging slice.
pub struct MemoryConsolidator {
    sessions: Arc<SessionManager>,
    memory: Arc<MemoryStore>,
    provider: Arc<dyn LlmProvider>,
    model: String,
    memory_window: usize,
    compression_window_size: usize,
    /// Sessions with a consolidation pass currently running.
    running: Mutex<HashSet<String>>,
    /// Sessions that asked for another pass while one was already running.
    pending: Mutex<HashSet<String>>,
}

/// Whether — and how — a session should be consolidated right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    None,
    /// Normal consolidation up to `compress_end`.
    Fire { compress_end: usize },
}

impl MemoryConsolidator {
    pub fn new(
        sessions: Arc<SessionManager>,
        memory: Arc<MemoryStore>,
        provider: Arc<dyn LlmProvider>,
        model: String,
        memory_window: usize,
        compression_window_size: usize,
    ) -> Self {
        Self {
            sessions,
            memory,
            provider,
            model,
            memory_window,
            compression_window_size,
            running: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    fn evaluate_trigger(&self, message_count: usize, last_consolidated: usize, last_consolidated_at: Option<chrono::DateTime<Utc>>) -> Trigger {
        let keep = (self.memory_window / 2).max(1);
        if message_count <= keep {
            return Trigger::None;
        }
        let compress_end = message_count - keep;
        if compress_end <= last_consolidated {
            return Trigger::None;
        }
        let delta = compress_end - last_consolidated;

        // A session that has never been consolidated has no cooldown to have
        // elapsed — only `delta` crossing a threshold should fire it here.
        let cooldown_elapsed = last_consolidated_at
            .map(|ts| Utc::now() - ts >= COOLDOWN)
            .unwrap_or(false);

        if delta >= HARD_LIMIT || delta >= self.compression_window_size || cooldown_elapsed {
            Trigger::Fire { compress_end }
        } else {
            Trigger::None
        }
    }

    /// Check whether `key`'s session is eligible for consolidation right now.
    pub fn should_consolidate(&self, key: &str) -> bool {
        let session = self.sessions.get_or_create(key);
        matches!(
            self.evaluate_trigger(session.messages.len(), session.last_consolidated, session.last_consolidated_at),
            Trigger::Fire { .. }
        )
    }

    /// Schedule a consolidation pass for `key` if eligible, deduplicating
    /// against any pass already running or queued for this session.
    ///
    /// Safe to call after every turn; most calls are no-ops.
    pub async fn maybe_schedule(self: &Arc<Self>, key: &str) {
        if !self.should_consolidate(key) {
            return;
        }

        {
            let mut running = self.running.lock().await;
            if running.contains(key) {
                self.pending.lock().await.insert(key.to_string());
                return;
            }
            running.insert(key.to_string());
        }

        let this = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            this.run_with_requeue(&key).await;
        });
    }

    async fn run_with_requeue(self: &Arc<Self>, key: &str) {
        loop {
            if let Err(e) = self.consolidate(key, false).await {
                warn!(session = %key, error = %e, "memory consolidation pass failed");
            }

            // Hold `running` across the final `pending` check so a
            // `maybe_schedule` landing between the two can't observe this
            // session as still running, queue into `pending`, and have that
            // request silently dropped when we remove `key` below.
            let mut running = self.running.lock().await;
            let mut pending = self.pending.lock().await;
            if pending.remove(key) {
                drop(pending);
                drop(running);
                continue;
            }
            running.remove(key);
            break;
        }
    }

    /// Force-consolidate the entire session history (used by `/new`), without
    /// advancing the watermark or persisting the session — the session is
    /// about to be cleared by the caller regardless.
    pub async fn archive_all(&self, key: &str) -> anyhow::Result<()> {
        self.consolidate(key, true).await
    }

    async fn consolidate(&self, key: &str, archive_all: bool) -> anyhow::Result<()> {
        let session = self.sessions.get_or_create(key);

        let (slice, compress_end) = if archive_all {
            (session.timestamped_range(0..session.messages.len()), session.messages.len())
        } else {
            match self.evaluate_trigger(session.messages.len(), session.last_consolidated, session.last_consolidated_at) {
                Trigger::None => return Ok(()),
                Trigger::Fire { compress_end } => (
                    session.timestamped_range(session.last_consolidated..compress_end),
                    compress_end,
                ),
            }
        };

        if slice.is_empty() {
            return Ok(());
        }

        let transcript = render_transcript(&slice);
        let existing_memory = self.memory.read_long_term();

        let prompt = format!(
            "## Existing long-term memory\n{}\n\n## Transcript slice to fold in\n{}",
            if existing_memory.trim().is_empty() { "(empty)" } else { &existing_memory },
            transcript
        );

        let messages = vec![Message::system(CONSOLIDATION_SYSTEM_PROMPT), Message::user(prompt)];
        let response = self
            .provider
            .chat(&messages, None, &self.model, &LlmRequestConfig::default())
            .await;

        let content = response.content.unwrap_or_default();
        let parsed = parse_consolidation_response(&content)
            .ok_or_else(|| anyhow::anyhow!("could not parse consolidation response: {content}"))?;

        self.memory.append_history(&parsed.history_entry)?;
        if parsed.memory_update.trim() != existing_memory.trim() {
            self.memory.write_long_term(&parsed.memory_update)?;
        }

        if !archive_all {
            self.sessions.advance_consolidation_watermark(key, compress_end);
        }

        debug!(session = %key, messages = slice.len(), archive_all, "consolidated session history");
        Ok(())
    }
}

fn render_transcript(messages: &[(Message, chrono::DateTime<Utc>)]) -> String {
    let mut lines = Vec::with_capacity(messages.len());
    for (m, ts) in messages {
        let (role, content, tools) = match m {
            Message::System { content } => ("SYSTEM", content.clone(), None),
            Message::User { content } => ("USER", message_content_text(content), None),
            Message::Assistant {
                content,
                tools_used,
                ..
            } => ("ASSISTANT", content.clone().unwrap_or_default(), tools_used.clone()),
            Message::Tool { content, name, .. } => ("TOOL", content.clone(), name.clone().map(|n| vec![n])),
        };
        if content.trim().is_empty() {
            continue;
        }
        let tool_suffix = tools
            .filter(|t| !t.is_empty())
            .map(|t| format!(" [tools: {}]", t.join(", ")))
            .unwrap_or_default();
        lines.push(format!("[{}] {}{}: {}", short_timestamp(ts), role, tool_suffix, content));
    }
    lines.join("\n")
}

fn message_content_text(content: &oxibot_core::types::MessageContent) -> String {
    use oxibot_core::types::{ContentPart, MessageContent};
    match content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.clone()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn short_timestamp(ts: &chrono::DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M").to_string()
}

struct ConsolidationResult {
    history_entry: String,
    memory_update: String,
}

/// Parse the LLM's consolidation response, tolerating markdown code fences
/// and mildly malformed JSON (trailing commas, unterminated braces/quotes).
fn parse_consolidation_response(raw: &str) -> Option<ConsolidationResult> {
    let stripped = strip_code_fence(raw);
    let value: serde_json::Value = serde_json::from_str(&stripped)
        .or_else(|_| serde_json::from_str(&repair_json(&stripped)))
        .ok()?;

    let history_entry = value.get("history_entry")?.as_str()?.to_string();
    let memory_update = value.get("memory_update")?.as_str()?.to_string();
    Some(ConsolidationResult {
        history_entry,
        memory_update,
    })
}

fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches('\n');
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

/// Best-effort repair pass for near-miss JSON from an LLM: drop trailing
/// commas before a closing bracket, and balance any unterminated
/// braces/brackets/quotes by appending closers.
fn repair_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            let mut lookahead = chars.clone();
            while let Some(&next) = lookahead.peek() {
                if next.is_whitespace() {
                    lookahead.next();
                } else {
                    break;
                }
            }
            if matches!(lookahead.peek(), Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in out.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}
