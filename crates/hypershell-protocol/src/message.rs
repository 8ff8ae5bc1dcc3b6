use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current wire protocol version. Bumped on any incompatible change to
/// `Message`; negotiated in the HELLO/WELCOME exchange (spec section 4.4).
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: u64,
    pub command: String,
    pub attempt: u32,
    pub env_deltas: Vec<(String, String)>,
    pub lease_deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: u64,
    pub exit_status: i32,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
    pub start_time: DateTime<Utc>,
    pub complete_time: DateTime<Utc>,
}

/// Every frame exchanged between client and server (spec section 4.4's
/// wire protocol table). One `Message` per length-prefixed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Hello { protocol_version: u32, client_id: String, capability_flags: u32 },
    Welcome { protocol_version: u32, session_token: [u8; 16] },
    Reject { reason: String },
    Auth { mac: Vec<u8> },
    AuthOk,
    AuthFail { reason: String },
    Request { max_batch: u32 },
    Tasks { tasks: Vec<TaskDescriptor> },
    Result(TaskResult),
    Heartbeat { now: DateTime<Utc> },
    HeartbeatAck { now: DateTime<Utc> },
    Shutdown { drain_deadline: DateTime<Utc> },
    Bye,
}
