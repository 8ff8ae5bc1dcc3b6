//! The cluster supervisor: one entry point that runs the dispatch server
//! and launches N clients under a launcher strategy (spec section 4.6).

pub mod cluster;
pub mod error;
pub mod launcher;

pub use cluster::{ClusterConfig, ClusterSupervisor};
pub use error::SupervisorError;
pub use launcher::{resolve_client_exe, Launcher};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hypershell_scheduler::Scheduler;
    use hypershell_store::VolatileStore;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn shuts_down_cleanly_with_no_clients() {
        let scheduler = Scheduler::new(Arc::new(VolatileStore::new()), 8, 1, Duration::seconds(60));
        let config = ClusterConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            authkey: "secret".to_string(),
            num_clients: 0,
            launcher: Launcher::Local,
            client_template: "{}".to_string(),
            client_capacity: 1,
            client_capture: false,
            stagger_delay: StdDuration::from_millis(10),
            drain_deadline: StdDuration::from_millis(200),
        };
        let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move { while sink_rx.recv().await.is_some() {} });
        let supervisor = ClusterSupervisor::new(scheduler, config, sink_tx);
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            shutdown_clone.cancel();
        });
        let result = tokio::time::timeout(StdDuration::from_secs(2), supervisor.run(shutdown)).await;
        assert!(result.is_ok());
    }
}
