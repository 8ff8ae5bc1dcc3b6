use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hypershell_protocol::{
    compute_mac, generate_challenge, read_message, verify_mac, write_message, Message, TaskDescriptor,
    PROTOCOL_VERSION,
};
use hypershell_scheduler::Scheduler;
use hypershell_sink::SinkEvent;
use hypershell_store::{TaskState, TaskUpdate};

use crate::error::DispatchError;
use crate::session::ClientSession;

/// Accepts authenticated client connections, dispatches leased tasks, and
/// applies results back to the store (spec section 4.4).
pub struct DispatchServer {
    scheduler: Arc<Scheduler>,
    authkey: String,
    sink_tx: mpsc::Sender<SinkEvent>,
    sessions: RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_session_id: AtomicU64,
}

impl DispatchServer {
    pub fn new(scheduler: Arc<Scheduler>, authkey: String, sink_tx: mpsc::Sender<SinkEvent>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            authkey,
            sink_tx,
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
        })
    }

    /// The acceptor loop (spec section 5: "1 acceptor"). One task is
    /// spawned per accepted connection. On shutdown, every connected
    /// session is sent SHUTDOWN with a drain deadline before the acceptor
    /// returns (spec section 4.6).
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
        drain_deadline: Duration,
    ) -> Result<(), DispatchError> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            warn!(peer = %addr, error = %e, "client session ended with error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("dispatch server shutting down, no longer accepting connections");
                    self.broadcast_shutdown(drain_deadline).await;
                    return Ok(());
                }
            }
        }
    }

    async fn broadcast_shutdown(&self, drain_deadline: Duration) {
        let deadline = Utc::now() + drain_deadline;
        let sessions = self.sessions.read().await;
        for tx in sessions.values() {
            let _ = tx.send(Message::Shutdown { drain_deadline: deadline });
        }
        info!(count = sessions.len(), "sent SHUTDOWN to connected clients");
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<(), DispatchError> {
        let hello = match read_message(&mut stream).await? {
            Some(Message::Hello { protocol_version, client_id, .. }) => (protocol_version, client_id),
            Some(_) => return Err(DispatchError::Protocol("expected HELLO".into())),
            None => return Ok(()),
        };
        let (peer_version, client_id) = hello;

        if peer_version != PROTOCOL_VERSION {
            write_message(
                &mut stream,
                &Message::Reject { reason: format!("unsupported protocol version {peer_version}") },
            )
            .await?;
            return Ok(());
        }

        let host = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let challenge = generate_challenge();
        write_message(
            &mut stream,
            &Message::Welcome { protocol_version: PROTOCOL_VERSION, session_token: challenge },
        )
        .await?;

        match read_message(&mut stream).await? {
            Some(Message::Auth { mac }) if verify_mac(&self.authkey, &challenge, &mac) => {
                write_message(&mut stream, &Message::AuthOk).await?;
            }
            Some(Message::Auth { .. }) => {
                write_message(&mut stream, &Message::AuthFail { reason: "bad MAC".into() }).await?;
                return Ok(());
            }
            _ => return Err(DispatchError::Protocol("expected AUTH".into())),
        }

        let mut session = ClientSession::new(client_id.clone(), host.clone());
        session.authenticated = true;
        info!(client_id = %client_id, host = %host, "client authenticated");

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        self.sessions.write().await.insert(session_id, push_tx);

        let result = self.session_loop(&mut stream, &mut session, push_rx).await;
        self.sessions.write().await.remove(&session_id);
        self.scheduler.revoke_client_leases(&session.client_id).await?;
        info!(client_id = %session.client_id, "client session closed, leases revoked");
        result
    }

    async fn session_loop(
        &self,
        stream: &mut TcpStream,
        session: &mut ClientSession,
        mut push_rx: mpsc::UnboundedReceiver<Message>,
    ) -> Result<(), DispatchError> {
        loop {
            tokio::select! {
                incoming = read_message(stream) => {
                    match incoming? {
                        Some(Message::Request { max_batch }) => {
                            self.handle_request(stream, session, max_batch).await?;
                        }
                        Some(Message::Result(result)) => {
                            self.handle_result(session, result).await?;
                        }
                        Some(Message::Heartbeat { now: _ }) => {
                            write_message(stream, &Message::HeartbeatAck { now: Utc::now() }).await?;
                        }
                        Some(Message::Bye) | None => return Ok(()),
                        Some(other) => {
                            return Err(DispatchError::Protocol(format!("unexpected message {other:?}")));
                        }
                    }
                }
                Some(msg) = push_rx.recv() => {
                    write_message(stream, &msg).await?;
                }
            }
        }
    }

    /// Never sends more TASKS than requested; backpressure comes from the
    /// scheduler's bounded ready-queue being empty, not from the server
    /// delaying a reply (spec section 4.4).
    async fn handle_request(
        &self,
        stream: &mut TcpStream,
        session: &mut ClientSession,
        max_batch: u32,
    ) -> Result<(), DispatchError> {
        let mut descriptors = Vec::new();
        for _ in 0..max_batch {
            match self.scheduler.lease_next(&session.client_id, &session.host).await? {
                Some((task, lease)) => {
                    session.outstanding.push(task.id);
                    descriptors.push(TaskDescriptor {
                        task_id: task.id,
                        command: task.args,
                        attempt: task.attempt,
                        env_deltas: Vec::new(),
                        lease_deadline: lease.deadline,
                    });
                }
                None => break,
            }
        }
        write_message(stream, &Message::Tasks { tasks: descriptors }).await?;
        Ok(())
    }

    async fn handle_result(
        &self,
        session: &mut ClientSession,
        result: hypershell_protocol::TaskResult,
    ) -> Result<(), DispatchError> {
        session.outstanding.retain(|id| *id != result.task_id);
        self.scheduler.release_lease(result.task_id).await;

        let store = self.scheduler.store();
        let task = store
            .get(result.task_id)
            .await?
            .ok_or_else(|| DispatchError::Protocol(format!("unknown task {}", result.task_id)))?;

        let to = if result.exit_status == 0 { TaskState::Done } else { TaskState::Failed };
        let update = TaskUpdate {
            start_time: Some(result.start_time),
            complete_time: Some(result.complete_time),
            exit_status: Some(result.exit_status),
            output: result.stdout.clone(),
            error: result.stderr.clone(),
            ..Default::default()
        };
        store.update_state(result.task_id, TaskState::Assigned, to, update).await?;

        if result.exit_status != 0 {
            if let Err(e) = self.sink_tx.send(SinkEvent::Failed { args: task.args.clone() }).await {
                error!(error = %e, "failure sink channel closed");
            }
        }
        if let Err(e) = self
            .sink_tx
            .send(SinkEvent::Output {
                task_id: result.task_id,
                stdout: result.stdout.unwrap_or_default(),
                stderr: result.stderr.unwrap_or_default(),
            })
            .await
        {
            error!(error = %e, "output sink channel closed");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypershell_store::{Store, VolatileStore};
    use std::net::SocketAddr;
    use tokio::net::TcpStream as ClientStream;

    async fn spin_up() -> (Arc<DispatchServer>, SocketAddr, mpsc::Receiver<SinkEvent>) {
        let scheduler = Scheduler::new(Arc::new(VolatileStore::new()), 16, 1, Duration::seconds(60));
        let (tx, rx) = mpsc::channel(16);
        let server = DispatchServer::new(scheduler, "secret".into(), tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_clone = server.clone();
        tokio::spawn(async move {
            let _ = server_clone.run(listener, CancellationToken::new(), Duration::seconds(30)).await;
        });
        (server, addr, rx)
    }

    #[tokio::test]
    async fn full_handshake_and_dispatch_round_trip() {
        let (server, addr, _rx) = spin_up().await;
        server.scheduler.submit_line("0".into(), "{}".into()).await.unwrap();

        let mut stream = ClientStream::connect(addr).await.unwrap();
        write_message(
            &mut stream,
            &Message::Hello { protocol_version: PROTOCOL_VERSION, client_id: "c1".into(), capability_flags: 0 },
        )
        .await
        .unwrap();

        let challenge = match read_message(&mut stream).await.unwrap().unwrap() {
            Message::Welcome { session_token, .. } => session_token,
            other => panic!("unexpected {other:?}"),
        };
        let mac = compute_mac("secret", &challenge);
        write_message(&mut stream, &Message::Auth { mac }).await.unwrap();
        assert!(matches!(read_message(&mut stream).await.unwrap().unwrap(), Message::AuthOk));

        write_message(&mut stream, &Message::Request { max_batch: 1 }).await.unwrap();
        let tasks = match read_message(&mut stream).await.unwrap().unwrap() {
            Message::Tasks { tasks } => tasks,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].command, "0");
    }

    #[tokio::test]
    async fn shutdown_broadcasts_to_connected_clients() {
        let (server, addr, _rx) = spin_up().await;
        let mut stream = ClientStream::connect(addr).await.unwrap();
        write_message(
            &mut stream,
            &Message::Hello { protocol_version: PROTOCOL_VERSION, client_id: "c1".into(), capability_flags: 0 },
        )
        .await
        .unwrap();
        let challenge = match read_message(&mut stream).await.unwrap().unwrap() {
            Message::Welcome { session_token, .. } => session_token,
            other => panic!("unexpected {other:?}"),
        };
        let mac = compute_mac("secret", &challenge);
        write_message(&mut stream, &Message::Auth { mac }).await.unwrap();
        assert!(matches!(read_message(&mut stream).await.unwrap().unwrap(), Message::AuthOk));

        // Give the session loop a moment to register its push channel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        server.broadcast_shutdown(Duration::seconds(5)).await;

        assert!(matches!(
            read_message(&mut stream).await.unwrap().unwrap(),
            Message::Shutdown { .. }
        ));
    }

    #[tokio::test]
    async fn bad_mac_is_rejected() {
        let (_server, addr, _rx) = spin_up().await;
        let mut stream = ClientStream::connect(addr).await.unwrap();
        write_message(
            &mut stream,
            &Message::Hello { protocol_version: PROTOCOL_VERSION, client_id: "c1".into(), capability_flags: 0 },
        )
        .await
        .unwrap();
        read_message(&mut stream).await.unwrap();
        write_message(&mut stream, &Message::Auth { mac: vec![0u8; 32] }).await.unwrap();
        assert!(matches!(
            read_message(&mut stream).await.unwrap().unwrap(),
            Message::AuthFail { .. }
        ));
    }
}
