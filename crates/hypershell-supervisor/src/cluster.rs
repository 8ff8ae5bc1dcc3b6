use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hypershell_dispatch::DispatchServer;
use hypershell_scheduler::Scheduler;
use hypershell_sink::SinkEvent;
use hypershell_store::{OrderBy, Store, TaskFilter};

use crate::error::SupervisorError;
use crate::launcher::Launcher;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub bind_addr: String,
    pub authkey: String,
    pub num_clients: usize,
    pub launcher: Launcher,
    pub client_template: String,
    pub client_capacity: usize,
    pub client_capture: bool,
    /// Delay between successive client launches, 50-200ms recommended
    /// (spec section 4.6).
    pub stagger_delay: StdDuration,
    pub drain_deadline: StdDuration,
}

/// Co-launches the dispatch server in-process and N clients under a
/// launcher strategy, with staggered startup and ordered shutdown (spec
/// section 4.6).
pub struct ClusterSupervisor {
    scheduler: Arc<Scheduler>,
    config: ClusterConfig,
    sink_tx: mpsc::Sender<SinkEvent>,
}

impl ClusterSupervisor {
    pub fn new(scheduler: Arc<Scheduler>, config: ClusterConfig, sink_tx: mpsc::Sender<SinkEvent>) -> Self {
        Self { scheduler, config, sink_tx }
    }

    /// Binds the listener, starts the dispatch server and lease reaper,
    /// staggers client launches, and blocks until `shutdown` fires, at
    /// which point it runs the ordered shutdown sequence (spec sections
    /// 4.6, 5).
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "cluster supervisor bound");

        let server = DispatchServer::new(self.scheduler.clone(), self.config.authkey.clone(), self.sink_tx.clone());
        let server_shutdown = shutdown.clone();
        let server_clone = server.clone();
        let server_drain_deadline =
            Duration::from_std(self.config.drain_deadline).unwrap_or_else(|_| Duration::seconds(30));
        let server_task =
            tokio::spawn(async move { server_clone.run(listener, server_shutdown, server_drain_deadline).await });

        let reaper_scheduler = self.scheduler.clone();
        tokio::spawn(async move { reaper_scheduler.run_reaper().await });
        let promoter_scheduler = self.scheduler.clone();
        tokio::spawn(async move { promoter_scheduler.run_promoter().await });

        let client_exe = crate::launcher::resolve_client_exe();
        let mut children = Vec::new();
        for index in 0..self.config.num_clients {
            let args = vec![
                "-H".to_string(),
                local_addr.ip().to_string(),
                "-p".to_string(),
                local_addr.port().to_string(),
                "-k".to_string(),
                self.config.authkey.clone(),
                "-t".to_string(),
                self.config.client_template.clone(),
                "-N".to_string(),
                self.config.client_capacity.to_string(),
            ];
            let mut args = args;
            if self.config.client_capture {
                args.push("--capture".to_string());
            }
            let child = self.config.launcher.spawn(index, &client_exe, &args)?;
            children.push(child);
            if index + 1 < self.config.num_clients {
                sleep(self.config.stagger_delay).await;
            }
        }
        info!(count = children.len(), "clients launched");

        shutdown.cancelled().await;
        info!("shutdown requested, draining ready-queue");
        self.wait_for_drain().await;

        let deadline = Utc::now() + server_drain_deadline;
        while Utc::now() < deadline {
            if children.iter_mut().all(|c| matches!(c.try_wait(), Ok(Some(_)))) {
                break;
            }
            sleep(StdDuration::from_millis(100)).await;
        }

        for child in children.iter_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                warn!("drain deadline elapsed, killing client process");
                let _ = child.start_kill();
            }
        }

        match server_task.await {
            Ok(Err(e)) => return Err(SupervisorError::Dispatch(e)),
            Ok(Ok(())) => {}
            Err(join_err) => warn!(error = %join_err, "dispatch server task panicked"),
        }
        Ok(())
    }

    async fn wait_for_drain(&self) {
        loop {
            let in_flight = self
                .scheduler
                .store()
                .query(TaskFilter::default(), OrderBy::IdAsc, 1_000_000)
                .await
                .map(|tasks| tasks.iter().filter(|t| !t.state.is_terminal()).count())
                .unwrap_or(0);
            if in_flight == 0 {
                return;
            }
            sleep(StdDuration::from_millis(200)).await;
        }
    }
}
