//! Container→host IPC envelopes.
//!
//! Every request is a JSON document written atomically (temp file, then
//! rename) under the group's IPC subdirectory. The response is a sibling
//! file `<id>.response.json` with `{id, ok, result|error}`.

use serde::{Deserialize, Serialize};

/// All request kinds a container may send to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    // Provider operations
    SendMessage,
    EditMessage,
    DeleteMessage,
    SendPhoto,
    SendDocument,
    SendVoice,
    SendAudio,
    SendLocation,
    SendContact,
    SendPoll,
    SendButtons,
    // Task operations
    ScheduleTask,
    UpdateTask,
    PauseTask,
    ResumeTask,
    CancelTask,
    ListTasks,
    RunTask,
    GetTask,
    // Memory operations
    MemoryUpsert,
    MemorySearch,
    MemoryList,
    MemoryForget,
    MemoryStats,
    // Admin operations (main group only)
    RegisterGroup,
    RemoveGroup,
    ListGroups,
    SetModel,
    // Utilities
    DownloadUrl,
    TextToSpeech,
}

impl RequestKind {
    /// Provider send/edit/delete family (targets a chat).
    pub fn is_provider_op(self) -> bool {
        matches!(
            self,
            Self::SendMessage
                | Self::EditMessage
                | Self::DeleteMessage
                | Self::SendPhoto
                | Self::SendDocument
                | Self::SendVoice
                | Self::SendAudio
                | Self::SendLocation
                | Self::SendContact
                | Self::SendPoll
                | Self::SendButtons
        )
    }

    /// Task store mutation/read family.
    pub fn is_task_op(self) -> bool {
        matches!(
            self,
            Self::ScheduleTask
                | Self::UpdateTask
                | Self::PauseTask
                | Self::ResumeTask
                | Self::CancelTask
                | Self::ListTasks
                | Self::RunTask
                | Self::GetTask
        )
    }

    /// Memory store family.
    pub fn is_memory_op(self) -> bool {
        matches!(
            self,
            Self::MemoryUpsert
                | Self::MemorySearch
                | Self::MemoryList
                | Self::MemoryForget
                | Self::MemoryStats
        )
    }

    /// Operations only the main group may invoke at all.
    pub fn is_main_only(self) -> bool {
        matches!(
            self,
            Self::RegisterGroup | Self::RemoveGroup | Self::ListGroups | Self::SetModel
        )
    }
}

/// A request envelope read from `requests/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcRequest {
    /// Request id; also names the response file.
    pub id: String,
    /// Request kind.
    pub kind: RequestKind,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
}

/// The response envelope written next to the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcResponse {
    /// Echoed request id.
    pub id: String,
    /// Whether the handler succeeded.
    pub ok: bool,
    /// Handler result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Sanitized error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    /// Build a success response.
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}
