/// One authenticated connection between a worker and the server (spec
/// section 3). Owned by the dispatch server's per-connection task; the
/// leases it holds are back-references into the scheduler's lease table,
/// not owned copies (spec section 9 on breaking the session/lease cycle).
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: String,
    pub host: String,
    pub authenticated: bool,
    pub outstanding: Vec<u64>,
}

impl ClientSession {
    pub fn new(client_id: String, host: String) -> Self {
        Self { client_id, host, authenticated: false, outstanding: Vec::new() }
    }
}
