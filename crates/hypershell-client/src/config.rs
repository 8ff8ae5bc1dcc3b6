/// Client-side configuration (spec section 4.5, 6). Threaded through the
/// executor's constructor rather than read from globals (design note,
/// section 9).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub authkey: String,
    pub client_id: String,
    /// `--num-tasks`, default 1: how many outstanding TASKS the client
    /// keeps in flight.
    pub capacity: usize,
    pub template: String,
    pub capture: bool,
    /// `--timeout`, default 0 = infinite: exit after this many idle
    /// seconds with no work.
    pub idle_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:50001".to_string(),
            authkey: hypershell_protocol::SENTINEL_AUTHKEY.to_string(),
            client_id: uuid_like_id(),
            capacity: 1,
            template: hypershell_template::DEFAULT_TEMPLATE.to_string(),
            capture: false,
            idle_timeout_secs: 0,
        }
    }
}

fn uuid_like_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    format!("client-{nanos:x}")
}
