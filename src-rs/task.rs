use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::MediaKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// Status only moves forward; terminal states are final.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Statuses from which `next` is reachable.
    pub fn predecessors(next: TaskStatus) -> &'static [TaskStatus] {
        match next {
            TaskStatus::Pending => &[],
            TaskStatus::Processing => &[TaskStatus::Pending],
            TaskStatus::Completed | TaskStatus::Failed => {
                &[TaskStatus::Pending, TaskStatus::Processing]
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    pub id: String,
    pub user_id: String,
    pub kind: MediaKind,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub input_image_urls: Vec<String>,
    pub status: TaskStatus,
    pub cost: i64,
    pub charged_credits: i64,
    pub refunded: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub url: String,
    pub media_type: MediaKind,
    pub created_at: DateTime<Utc>,
}

/// Requested status change, applied only when the stored status allows it.
#[derive(Clone, Debug)]
pub struct TaskTransition {
    pub to: TaskStatus,
    pub error_message: Option<String>,
}

impl TaskTransition {
    pub fn processing() -> Self {
        Self {
            to: TaskStatus::Processing,
            error_message: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            to: TaskStatus::Completed,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            to: TaskStatus::Failed,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    #[test]
    fn transitions_are_monotonic() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Processing));
        for next in ALL {
            assert!(!TaskStatus::Completed.can_transition_to(next));
            assert!(!TaskStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn predecessors_agree_with_can_transition() {
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    TaskStatus::predecessors(to).contains(&from),
                    from.can_transition_to(to),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Processing).unwrap(),
            "\"processing\""
        );
    }
}
