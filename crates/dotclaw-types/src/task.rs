//! Scheduled task types.
//!
//! A task runs an agent prompt for its group on a cron, interval, or
//! one-shot schedule. `running_since` is the claim marker: non-null iff
//! exactly one scheduler worker currently holds the task.

use serde::{Deserialize, Serialize};

/// How a task is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Cron expression in `schedule_value`.
    Cron,
    /// Fixed interval; `schedule_value` is milliseconds.
    Interval,
    /// Fire once at `schedule_value` (epoch milliseconds).
    Once,
}

impl ScheduleType {
    /// Stable string form used in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }

    /// Parse the store string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cron" => Some(Self::Cron),
            "interval" => Some(Self::Interval),
            "once" => Some(Self::Once),
            _ => None,
        }
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Eligible for claiming when due.
    Active,
    /// Kept but never claimed.
    Paused,
    /// Terminal.
    Canceled,
}

impl TaskStatus {
    /// Stable string form used in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
        }
    }

    /// Parse the store string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// How much chat context the task run receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Only the task prompt.
    #[default]
    None,
    /// Prompt plus recent chat history.
    Recent,
}

/// A durable scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// Task id (`task-<uuid>`).
    pub id: String,
    /// Owning group folder.
    pub group_folder: String,
    /// Chat the result is delivered to.
    pub chat_jid: String,
    /// Agent prompt to run.
    pub prompt: String,
    /// Schedule kind.
    pub schedule_type: ScheduleType,
    /// Cron expression, interval ms, or one-shot epoch ms (stringly, per
    /// kind).
    pub schedule_value: String,
    /// Chat context forwarded into the run.
    #[serde(default)]
    pub context_mode: ContextMode,
    /// Next due time, epoch milliseconds.
    pub next_run: i64,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Consecutive failed attempts.
    #[serde(default)]
    pub attempt: u32,
    /// Outcome of the last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
    /// Claim marker; set while a scheduler worker holds the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_since: Option<i64>,
    /// Opaque task-managed state carried between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_json: Option<String>,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_type_roundtrip() {
        for t in [ScheduleType::Cron, ScheduleType::Interval, ScheduleType::Once] {
            assert_eq!(ScheduleType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ScheduleType::parse("yearly"), None);
    }

    #[test]
    fn task_status_roundtrip() {
        for s in [TaskStatus::Active, TaskStatus::Paused, TaskStatus::Canceled] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn task_serde_roundtrip() {
        let task = ScheduledTask {
            id: "task-1".into(),
            group_folder: "main".into(),
            chat_jid: "telegram:-1".into(),
            prompt: "daily summary".into(),
            schedule_type: ScheduleType::Cron,
            schedule_value: "0 0 9 * * * *".into(),
            context_mode: ContextMode::Recent,
            next_run: 1_700_000_000_000,
            status: TaskStatus::Active,
            attempt: 0,
            last_result: None,
            running_since: None,
            state_json: None,
            created_at: 1_699_999_999_999,
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: ScheduledTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schedule_type, ScheduleType::Cron);
        assert_eq!(back.context_mode, ContextMode::Recent);
        assert!(back.running_since.is_none());
    }
}
