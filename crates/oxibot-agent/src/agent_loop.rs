//! Agent loop — the LLM ↔ tool-calling main loop.
//!
//! Port of nanobot's `agent/loop.py`.
//! Receives inbound messages, builds context, calls the LLM, dispatches
//! tool calls, and publishes outbound responses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::{InboundMessage, OutboundMessage};
use oxibot_core::config::schema::ExternalToolServerConfig;
use oxibot_core::session::manager::SessionManager;
use oxibot_core::types::{Message, ToolCall};
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::consolidator::MemoryConsolidator;
use crate::context::ContextBuilder;
use crate::memory::MemoryStore;
use crate::subagent::SubagentManager;
use crate::tools::base::Tool;
use crate::tools::external::ExternalToolManager;
use crate::tools::message::MessageTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

const HELP_TEXT: &str = "Available commands:\n\
/new — start a fresh session (older history is folded into long-term memory first)\n\
/help — show this message\n\
Anything else is sent straight to the agent.";

/// Trailing punctuation (ASCII and CJK) tolerated after a `[SILENT]` sentinel.
const SILENT_TRAILING_PUNCT: &[char] = &[
    '.', ',', '!', '?', ';', ':', '。', '，', '！', '？', '；', '：', '…', '~',
];

/// Configuration for the exec tool.
#[derive(Clone, Debug)]
pub struct ExecToolConfig {
    /// Timeout in seconds (default 60).
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

/// Tunables for the agent's tool-calling loop and memory-window behavior.
#[derive(Clone, Debug)]
pub struct AgentLoopConfig {
    /// Max LLM ↔ tool iterations per message before forcing a reply.
    pub max_iterations: usize,
    /// Most-recent messages kept in the live history window handed to the LLM.
    pub memory_window: usize,
    /// Uncompressed messages past the consolidation watermark that trigger a
    /// background compression pass.
    pub compression_window_size: usize,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            memory_window: 50,
            compression_window_size: 12,
        }
    }
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The main agent loop: polls the message bus, calls the LLM, dispatches tools.
pub struct AgentLoop {
    /// Message bus for inbound/outbound messages.
    bus: Arc<MessageBus>,
    /// LLM provider.
    provider: Arc<dyn LlmProvider>,
    /// Workspace root.
    #[allow(dead_code)]
    workspace: PathBuf,
    /// Model to use (overrides provider default if set).
    model: String,
    /// Tool-calling loop tunables.
    config: AgentLoopConfig,
    /// LLM request config (temperature, max_tokens).
    request_config: LlmRequestConfig,
    /// Tool registry.
    tools: ToolRegistry,
    /// Context builder.
    context: ContextBuilder,
    /// Session manager.
    sessions: Arc<SessionManager>,
    /// Reference to the message tool (for set_context).
    message_tool: Arc<MessageTool>,
    /// Spawn tool reference (for set_context).
    spawn_tool: Arc<SpawnTool>,
    /// Subagent manager (also held by SpawnTool; kept for direct access).
    #[allow(dead_code)]
    subagent_manager: Arc<SubagentManager>,
    /// External protocol-tool servers.
    external_tools: Arc<ExternalToolManager>,
    /// Background memory consolidation.
    consolidator: Arc<MemoryConsolidator>,
    /// Set by `stop()`; polled by `run()` once a second.
    stop_flag: Arc<AtomicBool>,
}

impl AgentLoop {
    /// Create a new agent loop.
    ///
    /// Async because external protocol-tool servers are discovered (up to a
    /// 30s handshake timeout each) before the tool registry is finalized.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        model: Option<String>,
        config: Option<AgentLoopConfig>,
        request_config: Option<LlmRequestConfig>,
        brave_api_key: Option<String>,
        exec_config: Option<ExecToolConfig>,
        restrict_to_workspace: bool,
        session_manager: Option<SessionManager>,
        agent_name: Option<String>,
        external_tools: HashMap<String, ExternalToolServerConfig>,
    ) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        let config = config.unwrap_or_default();
        let request_config = request_config.unwrap_or_default();
        let exec_config = exec_config.unwrap_or_default();
        let agent_name = agent_name.unwrap_or_else(|| "Oxibot".into());
        let sessions = Arc::new(
            session_manager.unwrap_or_else(|| SessionManager::new(None).expect("failed to create session manager")),
        );

        let context = ContextBuilder::new(&workspace, &agent_name);
        let memory = Arc::new(MemoryStore::new_lazy(&workspace));

        // Build tool registry
        let mut tools = ToolRegistry::new();
        let allowed_dir = if restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(ExecTool::new(
            workspace.clone(),
            Some(exec_config.timeout),
            restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(brave_api_key.clone())));
        tools.register(Arc::new(WebFetchTool::new()));

        let message_tool = Arc::new(MessageTool::new(None));
        tools.register(message_tool.clone());

        // Subagent manager + spawn tool
        let subagent_manager = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model.clone(),
            brave_api_key,
            exec_config,
            restrict_to_workspace,
            request_config.clone(),
        ));

        let spawn_tool = Arc::new(SpawnTool::new(subagent_manager.clone()));
        tools.register(spawn_tool.clone());

        // External protocol-tool servers
        let external_manager = Arc::new(ExternalToolManager::new(external_tools));
        for tool in external_manager.start().await {
            tools.register(tool);
        }

        let consolidator = Arc::new(MemoryConsolidator::new(
            sessions.clone(),
            memory,
            provider.clone(),
            model.clone(),
            config.memory_window,
            config.compression_window_size,
        ));

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = config.max_iterations,
            "agent loop initialized"
        );

        Self {
            bus,
            provider,
            workspace,
            model,
            config,
            request_config,
            tools,
            context,
            sessions,
            message_tool,
            spawn_tool,
            subagent_manager,
            external_tools: external_manager,
            consolidator,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the event loop: poll inbound messages and process them.
    ///
    /// Polls `consume_inbound` with a 1s timeout so `stop()` is noticed
    /// promptly even with no traffic; exits immediately if the bus's
    /// inbound channel is closed.
    pub async fn run(&self) {
        info!("agent loop started, waiting for messages");
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                info!("agent loop stop requested, exiting");
                break;
            }

            let next = tokio::time::timeout(Duration::from_secs(1), self.bus.consume_inbound()).await;
            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("inbound channel closed, agent loop exiting");
                    break;
                }
                Err(_) => continue,
            };

            let session_key = msg.session_key();
            debug!(session_key = %session_key, "received message");

            let result = if msg.channel == "system" && msg.sender_id == "subagent" {
                self.process_system_message(&msg).await
            } else {
                self.process_message(&msg).await
            };

            match result {
                Ok(Some(response)) => {
                    if let Err(e) = self.bus.publish_outbound(response).await {
                        error!(error = %e, "failed to publish outbound message");
                    }
                }
                Ok(None) => {
                    debug!(session_key = %session_key, "turn produced no outbound reply");
                }
                Err(e) => {
                    error!(error = %e, session_key = %session_key, "message processing error");
                    let err_msg = OutboundMessage::new(
                        &msg.channel,
                        &msg.chat_id,
                        format!("I encountered an error: {e}"),
                    );
                    let _ = self.bus.publish_outbound(err_msg).await;
                }
            }
        }
    }

    /// Stop `run()` at its next poll (within ~1s), and stop external tool
    /// servers.
    pub async fn shutdown(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.external_tools.stop().await;
    }

    /// Process a single inbound message → outbound response, if any.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<Option<OutboundMessage>> {
        let session_key = msg.session_key();

        self.message_tool.set_context(&msg.channel, &msg.chat_id).await;
        self.spawn_tool.set_context(&msg.channel, &msg.chat_id).await;

        let trimmed = msg.content.trim();
        if trimmed.eq_ignore_ascii_case("/new") {
            return self.handle_new_command(msg, &session_key).await.map(Some);
        }
        if trimmed.eq_ignore_ascii_case("/help") {
            return Ok(Some(OutboundMessage::new(&msg.channel, &msg.chat_id, HELP_TEXT)));
        }

        let media_paths: Vec<String> = msg.media.iter().map(|m| m.path.clone()).collect();
        self.run_turn(
            &session_key,
            &msg.channel,
            &msg.chat_id,
            &msg.content,
            &msg.content,
            &media_paths,
        )
        .await
    }

    async fn handle_new_command(&self, msg: &InboundMessage, session_key: &str) -> Result<OutboundMessage> {
        if let Err(e) = self.consolidator.archive_all(session_key).await {
            warn!(session = %session_key, error = %e, "archive-all consolidation failed for /new");
        }
        self.sessions.clear(session_key);
        Ok(OutboundMessage::new(
            &msg.channel,
            &msg.chat_id,
            "New session started. Memory consolidation in progress.",
        ))
    }

    /// Process a system message (from a subagent or cron).
    ///
    /// Parses the original `channel:chat_id` from `msg.chat_id`; if no `:`
    /// separator is present, the origin defaults to the `cli` channel with
    /// the raw chat_id.
    async fn process_system_message(&self, msg: &InboundMessage) -> Result<Option<OutboundMessage>> {
        info!(
            sender = %msg.sender_id,
            chat_id = %msg.chat_id,
            "processing system message"
        );

        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => ("cli".to_string(), msg.chat_id.clone()),
        };

        let session_key = format!("{origin_channel}:{origin_chat_id}");

        self.message_tool.set_context(&origin_channel, &origin_chat_id).await;
        self.spawn_tool.set_context(&origin_channel, &origin_chat_id).await;

        let persist_text = format!("[System: {}] {}", msg.sender_id, msg.content);
        self.run_turn(
            &session_key,
            &origin_channel,
            &origin_chat_id,
            &msg.content,
            &persist_text,
            &[],
        )
        .await
    }

    /// Direct processing mode (CLI entry point).
    ///
    /// Wraps text into an `InboundMessage` on the "cli" channel and processes.
    pub async fn process_direct(&self, text: &str) -> Result<String> {
        let msg = InboundMessage::new("cli", "user", "direct", text);
        let response = self.process_message(&msg).await?;
        Ok(response.map(|r| r.content).unwrap_or_default())
    }

    /// Shared LLM ↔ tool-calling pipeline used by both regular and system
    /// messages. `llm_text` is what the model sees as the user turn;
    /// `persist_text` is what gets written to session history (system
    /// messages persist with a `[System: ...]` prefix the model never sees).
    async fn run_turn(
        &self,
        session_key: &str,
        channel: &str,
        chat_id: &str,
        llm_text: &str,
        persist_text: &str,
        media_paths: &[String],
    ) -> Result<Option<OutboundMessage>> {
        let history = self.sessions.get_history(session_key, self.config.memory_window);
        let mut messages = self.context.build_messages(&history, llm_text, media_paths, channel, chat_id);
        let tool_defs = self.tools.get_definitions();

        let mut final_text: Option<String> = None;
        let mut stashed: Option<String> = None;
        let mut tool_log: Vec<(String, String, String)> = Vec::new();
        let mut tools_used: Vec<String> = Vec::new();
        let mut message_tool_fired = false;
        let mut last_finish_reason: Option<String> = None;
        let mut iterations_used = 0usize;

        for iteration in 0..self.config.max_iterations {
            iterations_used = iteration + 1;
            debug!(iteration = iteration, "LLM call");

            let response = self
                .provider
                .chat(&messages, Some(&tool_defs), &self.model, &self.request_config)
                .await;
            last_finish_reason = response.finish_reason.clone();

            if response.has_tool_calls() {
                if let Some(text) = &response.content {
                    if !text.trim().is_empty() {
                        stashed = Some(text.clone());
                    }
                }

                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(&mut messages, response.content.clone(), tool_calls.clone());

                for tc in &tool_calls {
                    let params = parse_tool_arguments(&tc.function.arguments);

                    if tc.function.name == self.message_tool.name() {
                        message_tool_fired = true;
                    }

                    info!(tool = %tc.function.name, iteration = iteration, "executing tool call");
                    let result = self.tools.execute(&tc.function.name, params).await;
                    debug!(tool = %tc.function.name, result_len = result.len(), "tool result");

                    tool_log.push((
                        tc.function.name.clone(),
                        truncate_for_log(&tc.function.arguments, 200),
                        truncate_for_log(&result, 200),
                    ));
                    if !tools_used.contains(&tc.function.name) {
                        tools_used.push(tc.function.name.clone());
                    }

                    ContextBuilder::add_tool_result(&mut messages, &tc.id, &result);
                }
            } else {
                final_text = response.content.clone();
                break;
            }
        }

        let exhausted = final_text.is_none() && iterations_used >= self.config.max_iterations;
        let content = match final_text.filter(|t| !t.trim().is_empty()) {
            Some(text) => text,
            None => {
                if let Some(text) = stashed {
                    text
                } else if message_tool_fired {
                    String::new()
                } else if exhausted {
                    format!(
                        "I hit my iteration limit ({}) while working on this (last stop reason: {}).",
                        self.config.max_iterations,
                        last_finish_reason.as_deref().unwrap_or("unknown")
                    )
                } else {
                    format!(
                        "I didn't produce a reply this turn (stop reason: {}).",
                        last_finish_reason.as_deref().unwrap_or("unknown")
                    )
                }
            }
        };

        let (content, silent) = strip_silent_sentinel(&content);

        let mut to_persist = vec![Message::user(persist_text)];
        if tool_log.is_empty() {
            to_persist.push(Message::assistant(content.clone()).with_tools_used(tools_used.clone()));
        } else {
            let summary_call = ToolCall::new("_tool_use_summary", "_tool_use_summary", "{}");
            let assistant_with_summary = Message::Assistant {
                content: Some(content.clone()),
                tool_calls: Some(vec![summary_call.clone()]),
                reasoning_content: None,
                tools_used: None,
            }
            .with_tools_used(tools_used.clone());
            to_persist.push(assistant_with_summary);

            let summary_text = tool_log
                .iter()
                .map(|(name, args, result)| format!("- {name}({args}) -> {result}"))
                .collect::<Vec<_>>()
                .join("\n");
            to_persist.push(Message::tool_result_named(
                summary_call.id.clone(),
                "_tool_use_summary",
                summary_text,
            ));
        }
        self.sessions.add_messages(session_key, to_persist);

        self.consolidator.maybe_schedule(session_key).await;

        if silent {
            return Ok(Some(OutboundMessage::silent(channel, chat_id)));
        }
        if message_tool_fired && content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(OutboundMessage::new(channel, chat_id, content)))
    }

    /// Get a reference to the tool registry (for testing/extension).
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Parse a tool call's raw JSON arguments string. On decode failure, the
/// original text is preserved under a `raw` key instead of being discarded.
pub(crate) fn parse_tool_arguments(raw: &str) -> HashMap<String, serde_json::Value> {
    serde_json::from_str(raw).unwrap_or_else(|_| {
        HashMap::from([("raw".to_string(), serde_json::Value::String(raw.to_string()))])
    })
}

fn truncate_for_log(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}…")
    }
}

/// Strip a trailing `[SILENT]` sentinel (tolerating ASCII/CJK punctuation
/// and whitespace after it), returning the cleaned text and whether the
/// sentinel was present.
fn strip_silent_sentinel(text: &str) -> (String, bool) {
    let right_trimmed = text.trim_end_matches(|c: char| c.is_whitespace() || SILENT_TRAILING_PUNCT.contains(&c));
    if let Some(stripped) = right_trimmed.strip_suffix("[SILENT]") {
        (stripped.trim_end().to_string(), true)
    } else {
        (text.to_string(), false)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
