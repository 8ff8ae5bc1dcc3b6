use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task's position in the assignment state machine (spec section 3).
///
/// ```text
/// NEW → READY               (durably persisted, eligible for dispatch)
/// READY → ASSIGNED          (leased to a client)
/// ASSIGNED → DONE           (exit_status == 0)
/// ASSIGNED → FAILED         (exit_status != 0, attempts exhausted)
/// ASSIGNED → READY          (client lost, lease expired, attempts remain)
/// ASSIGNED → ABANDONED      (client lost, attempts exhausted)
/// NEW → ABANDONED           (submission-side shutdown before persist)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    New,
    Ready,
    Assigned,
    Done,
    Failed,
    Abandoned,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::New => "NEW",
            TaskState::Ready => "READY",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Done => "DONE",
            TaskState::Failed => "FAILED",
            TaskState::Abandoned => "ABANDONED",
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(TaskState::New),
            "READY" => Ok(TaskState::Ready),
            "ASSIGNED" => Ok(TaskState::Assigned),
            "DONE" => Ok(TaskState::Done),
            "FAILED" => Ok(TaskState::Failed),
            "ABANDONED" => Ok(TaskState::Abandoned),
            other => Err(format!("unknown task state '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work, exposed to the shell as `TASK_ID` (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub uuid: Uuid,
    pub args: String,
    pub template: String,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    pub host: Option<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub exit_status: Option<i32>,
    pub output: Option<Vec<u8>>,
    pub error: Option<Vec<u8>>,
    pub state: TaskState,
    /// Structured reason for a FAILED task produced at submission (template
    /// parse error) rather than at execution (non-zero exit). Spec section 4.1.
    pub fail_reason: Option<String>,
}

impl Task {
    pub fn new(id: u64, args: String, template: String, max_attempts: u32) -> Self {
        Self {
            id,
            uuid: Uuid::new_v4(),
            args,
            template,
            submit_time: None,
            start_time: None,
            complete_time: None,
            host: None,
            attempt: 1,
            max_attempts,
            exit_status: None,
            output: None,
            error: None,
            state: TaskState::New,
            fail_reason: None,
        }
    }
}

/// Partial field update applied alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub host: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,
    pub output: Option<Vec<u8>>,
    pub error: Option<Vec<u8>>,
    pub fail_reason: Option<String>,
    pub bump_attempt: bool,
}
