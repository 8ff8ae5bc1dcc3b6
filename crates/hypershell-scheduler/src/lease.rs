use chrono::{DateTime, Utc};

/// An ephemeral assignment of a task to a client (spec section 3). Owned
/// exclusively by the scheduler's lease table; the client session holds
/// only the `task_id` back-reference, which is how the cyclic
/// session/lease reference from the source is broken (spec section 9).
#[derive(Debug, Clone)]
pub struct Lease {
    pub task_id: u64,
    pub client_id: String,
    pub granted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}
