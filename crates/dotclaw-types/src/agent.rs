//! The container invocation contract.
//!
//! The host passes an [`AgentInvocation`] as JSON -- on stdin in ephemeral
//! mode, as `agent_requests/<id>.json` in daemon mode -- and reads back an
//! [`AgentResponse`]. In ephemeral mode the response JSON is wrapped
//! between stdout sentinels so it can be extracted from mixed output.

use serde::{Deserialize, Serialize};

/// Start marker for the ephemeral stdout response.
pub const OUTPUT_START: &str = "---DOTCLAW_OUTPUT_START---";
/// End marker for the ephemeral stdout response.
pub const OUTPUT_END: &str = "---DOTCLAW_OUTPUT_END---";

/// The request payload handed to the in-container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInvocation {
    /// Request id; daemon responses are written to `<id>.response.json`.
    pub id: String,
    /// The assembled prompt.
    pub prompt: String,
    /// Owning group folder.
    pub group_folder: String,
    /// Originating chat id.
    pub chat_jid: String,
    /// Whether the group is the privileged main group.
    pub is_main: bool,
    /// Requesting user id.
    pub user_id: String,
    /// Requesting user display name.
    pub user_name: String,
    /// Model to use.
    pub model: String,
    /// Failover candidates the agent may report against.
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Reasoning effort.
    pub reasoning_effort: crate::routing::ReasoningEffort,
    /// Output token cap.
    pub max_output_tokens: u32,
    /// Tool-step budget.
    pub max_tool_steps: u32,
    /// Wall-clock budget for the run, milliseconds.
    pub timeout_ms: u64,
    /// Tool allowlist; empty means all tools.
    #[serde(default)]
    pub tool_allow: Vec<String>,
    /// Tool denylist.
    #[serde(default)]
    pub tool_deny: Vec<String>,
    /// Snapshot of remaining per-day tool budgets.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub tool_budgets_snapshot: serde_json::Value,
    /// Session to resume, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Whether the agent should persist the session.
    pub persist_session: bool,
    /// Pre-built memory recall lines.
    #[serde(default)]
    pub recall: Vec<String>,
    /// Extra system prompt fragments.
    #[serde(default)]
    pub system_prompt_overrides: Vec<String>,
    /// User-profile fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personalization: Option<String>,
}

/// One tool call as reported by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Tool name.
    pub name: String,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Wall-clock time of the call.
    pub latency_ms: u64,
}

/// The agent's response document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// `"success"` or `"error"`.
    pub status: String,
    /// Final textual reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error message when `status == "error"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Session id to persist.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "newSessionId")]
    pub new_session_id: Option<String>,
    /// The model actually used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Run latency.
    #[serde(default)]
    pub latency_ms: u64,
    /// Tool calls made during the run.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Prompt tokens consumed.
    #[serde(default)]
    pub tokens_prompt: u64,
    /// Completion tokens produced.
    #[serde(default)]
    pub tokens_completion: u64,
    /// How many memory lines were recalled.
    #[serde(default)]
    pub memory_recall_count: u32,
    /// Stream directory when the agent streamed incrementally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_dir: Option<String>,
}

impl AgentResponse {
    /// Whether the response reports success.
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    /// A successful response whose result is empty or whitespace.
    ///
    /// Treated as the soft failure category `invalid_response`.
    pub fn is_empty_success(&self) -> bool {
        self.is_success()
            && self
                .result
                .as_deref()
                .map(|r| r.trim().is_empty())
                .unwrap_or(true)
    }
}

/// Daemon container status file (`daemon_status.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    /// `idle` or `processing`.
    pub state: DaemonState,
    /// Request currently being processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// When processing began, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    /// Agent process id inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Daemon processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    /// Waiting for requests.
    Idle,
    /// Actively processing `request_id`.
    Processing,
}

/// Extract the response JSON from mixed ephemeral stdout.
///
/// Returns the text between the **last** start marker and the following
/// end marker, so stray agent logging that echoes the markers earlier in
/// the stream cannot confuse extraction.
pub fn extract_sentinel_output(stdout: &str) -> Option<&str> {
    let start = stdout.rfind(OUTPUT_START)?;
    let after = &stdout[start + OUTPUT_START.len()..];
    let end = after.find(OUTPUT_END)?;
    Some(after[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_plain() {
        let out = format!("noise\n{OUTPUT_START}\n{{\"status\":\"success\"}}\n{OUTPUT_END}\ntail");
        assert_eq!(
            extract_sentinel_output(&out),
            Some("{\"status\":\"success\"}")
        );
    }

    #[test]
    fn extract_uses_last_marker_pair() {
        let out = format!(
            "{OUTPUT_START}fake{OUTPUT_END}\nlog\n{OUTPUT_START}{{\"status\":\"error\"}}{OUTPUT_END}"
        );
        assert_eq!(
            extract_sentinel_output(&out),
            Some("{\"status\":\"error\"}")
        );
    }

    #[test]
    fn extract_missing_markers() {
        assert_eq!(extract_sentinel_output("just logs"), None);
        assert_eq!(
            extract_sentinel_output(&format!("{OUTPUT_START} unterminated")),
            None
        );
    }

    #[test]
    fn empty_success_detection() {
        let mut resp = AgentResponse {
            status: "success".into(),
            result: Some("  ".into()),
            error: None,
            new_session_id: None,
            model: None,
            latency_ms: 10,
            tool_calls: vec![],
            tokens_prompt: 0,
            tokens_completion: 0,
            memory_recall_count: 0,
            stream_dir: None,
        };
        assert!(resp.is_empty_success());

        resp.result = Some("hello".into());
        assert!(!resp.is_empty_success());

        resp.status = "error".into();
        assert!(!resp.is_empty_success());
    }

    #[test]
    fn response_parse_defaults() {
        let resp: AgentResponse =
            serde_json::from_str(r#"{"status":"success","result":"hi"}"#).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.latency_ms, 0);
        assert!(resp.tool_calls.is_empty());
        assert!(resp.stream_dir.is_none());
    }

    #[test]
    fn invocation_serde_camel_case() {
        let inv = AgentInvocation {
            id: "req-1".into(),
            prompt: "hello".into(),
            group_folder: "main".into(),
            chat_jid: "telegram:-1".into(),
            is_main: true,
            user_id: "u1".into(),
            user_name: "Ada".into(),
            model: "m".into(),
            fallbacks: vec![],
            reasoning_effort: crate::routing::ReasoningEffort::Medium,
            max_output_tokens: 4096,
            max_tool_steps: 24,
            timeout_ms: 300_000,
            tool_allow: vec![],
            tool_deny: vec![],
            tool_budgets_snapshot: serde_json::Value::Null,
            session_id: None,
            persist_session: true,
            recall: vec!["(preference) likes tea".into()],
            system_prompt_overrides: vec![],
            personalization: None,
        };
        let json = serde_json::to_string(&inv).unwrap();
        assert!(json.contains("groupFolder"));
        assert!(json.contains("maxToolSteps"));
        assert!(!json.contains("toolBudgetsSnapshot"));
    }

    #[test]
    fn daemon_status_parse() {
        let s: DaemonStatus = serde_json::from_str(
            r#"{"state":"processing","requestId":"req-9","startedAt":1700000000000,"pid":42}"#,
        )
        .unwrap();
        assert_eq!(s.state, DaemonState::Processing);
        assert_eq!(s.request_id.as_deref(), Some("req-9"));
    }
}
