use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hypershell_protocol::{
    compute_mac, read_message, write_message, Message, TaskResult, PROTOCOL_VERSION,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::runner::run_task;

/// Connects to a dispatch server, authenticates, and runs the request/lease/
/// execute/report loop until told to shut down or idle out (spec section
/// 4.5).
pub async fn run_client(config: ClientConfig) -> Result<(), ClientError> {
    let mut stream = TcpStream::connect(&config.server_addr).await?;
    handshake(&mut stream, &config).await?;
    info!(server = %config.server_addr, client_id = %config.client_id, "connected and authenticated");

    let mut running: HashMap<u64, AbortHandle> = HashMap::new();
    let mut tasks: JoinSet<(u64, Result<TaskResult, ClientError>)> = JoinSet::new();
    let mut shutting_down = false;
    let mut drain_deadline: Option<Instant> = None;

    let idle_duration = Duration::from_secs(config.idle_timeout_secs.max(1));
    let idle_sleep = tokio::time::sleep(idle_duration);
    tokio::pin!(idle_sleep);

    loop {
        if !shutting_down && running.len() < config.capacity {
            let max_batch = (config.capacity - running.len()) as u32;
            write_message(&mut stream, &Message::Request { max_batch }).await?;
        }

        tokio::select! {
            biased;

            _ = &mut idle_sleep, if config.idle_timeout_secs > 0 && running.is_empty() && !shutting_down => {
                info!("no work for {}s, disconnecting", config.idle_timeout_secs);
                write_message(&mut stream, &Message::Bye).await?;
                return Ok(());
            }

            _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                warn!(remaining = running.len(), "drain deadline elapsed, killing remaining children");
                let now = Utc::now();
                for (task_id, handle) in running.drain() {
                    handle.abort();
                    let result = TaskResult {
                        task_id,
                        exit_status: -1,
                        stdout: None,
                        stderr: None,
                        start_time: now,
                        complete_time: now,
                    };
                    write_message(&mut stream, &Message::Result(result)).await?;
                }
                write_message(&mut stream, &Message::Bye).await?;
                return Ok(());
            }

            incoming = read_message(&mut stream) => {
                match incoming? {
                    Some(Message::Tasks { tasks: descriptors }) => {
                        if config.idle_timeout_secs > 0 {
                            idle_sleep.as_mut().reset(Instant::now() + idle_duration);
                        }
                        for descriptor in descriptors {
                            let task_id = descriptor.task_id;
                            let template = config.template.clone();
                            let host = config.client_id.clone();
                            let capture = config.capture;
                            let attempt = descriptor.attempt;
                            let handle = tasks.spawn(async move {
                                let result = run_task(&descriptor, &template, &host, attempt, capture).await;
                                (task_id, result)
                            });
                            running.insert(task_id, handle);
                        }
                    }
                    Some(Message::HeartbeatAck { .. }) => {}
                    Some(Message::Shutdown { drain_deadline: deadline }) => {
                        shutting_down = true;
                        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        drain_deadline = Some(Instant::now() + remaining);
                        info!(running = running.len(), "received shutdown, draining");
                        if running.is_empty() {
                            write_message(&mut stream, &Message::Bye).await?;
                            return Ok(());
                        }
                    }
                    Some(Message::Reject { reason }) => return Err(ClientError::Rejected(reason)),
                    Some(Message::Bye) | None => return Ok(()),
                    Some(other) => return Err(ClientError::Protocol(format!("unexpected message {other:?}"))),
                }
            }

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                match joined {
                    Ok((task_id, Ok(result))) => {
                        running.remove(&task_id);
                        debug!(task_id, exit_status = result.exit_status, "task finished");
                        write_message(&mut stream, &Message::Result(result)).await?;
                    }
                    Ok((task_id, Err(e))) => {
                        running.remove(&task_id);
                        warn!(task_id, error = %e, "task executor failed");
                        let now = Utc::now();
                        let result = TaskResult {
                            task_id,
                            exit_status: -1,
                            stdout: None,
                            stderr: None,
                            start_time: now,
                            complete_time: now,
                        };
                        write_message(&mut stream, &Message::Result(result)).await?;
                    }
                    Err(join_err) => {
                        if !join_err.is_cancelled() {
                            warn!(error = %join_err, "task join error");
                        }
                    }
                }
                if shutting_down && running.is_empty() {
                    write_message(&mut stream, &Message::Bye).await?;
                    return Ok(());
                }
            }
        }
    }
}

async fn handshake(stream: &mut TcpStream, config: &ClientConfig) -> Result<(), ClientError> {
    write_message(
        stream,
        &Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_id: config.client_id.clone(),
            capability_flags: 0,
        },
    )
    .await?;

    let challenge = match read_message(stream).await? {
        Some(Message::Welcome { session_token, .. }) => session_token,
        Some(Message::Reject { reason }) => return Err(ClientError::Rejected(reason)),
        _ => return Err(ClientError::Protocol("expected WELCOME".into())),
    };

    let mac = compute_mac(&config.authkey, &challenge);
    write_message(stream, &Message::Auth { mac }).await?;

    match read_message(stream).await? {
        Some(Message::AuthOk) => Ok(()),
        Some(Message::AuthFail { reason }) => Err(ClientError::AuthFailed(reason)),
        _ => Err(ClientError::Protocol("expected AUTH_OK".into())),
    }
}
