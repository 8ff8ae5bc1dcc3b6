//! End-to-end coverage for the seed scenarios described in the task
//! distribution design: a full dispatch server paired with real client
//! executors, talking over an actual TCP loopback connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use hypershell_client::{run_client, run_task, ClientConfig};
use hypershell_dispatch::DispatchServer;
use hypershell_protocol::TaskDescriptor;
use hypershell_scheduler::Scheduler;
use hypershell_sink::SinkEvent;
use hypershell_store::{Store, TaskState, VolatileStore};

async fn spin_up_server(maxsize: usize, max_attempts: u32) -> (Arc<Scheduler>, String, mpsc::Receiver<SinkEvent>) {
    let scheduler = Scheduler::new(Arc::new(VolatileStore::new()), maxsize, max_attempts, ChronoDuration::seconds(30));
    let (sink_tx, sink_rx) = mpsc::channel(256);
    let server = DispatchServer::new(scheduler.clone(), "test-authkey".to_string(), sink_tx);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = tokio_util_shutdown();
    let server_clone = server.clone();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        let _ = server_clone.run(listener, shutdown_clone, ChronoDuration::seconds(30)).await;
    });
    tokio::spawn(scheduler.clone().run_reaper());
    (scheduler, addr.to_string(), sink_rx)
}

fn tokio_util_shutdown() -> tokio_util::sync::CancellationToken {
    tokio_util::sync::CancellationToken::new()
}

/// Hello World: four trivial tasks run by two clients; all complete DONE.
#[tokio::test]
async fn hello_world_all_tasks_complete() {
    let (scheduler, addr, _sink_rx) = spin_up_server(16, 1).await;

    for n in 0..4 {
        scheduler.submit_line(n.to_string(), "echo {}".to_string()).await.unwrap();
    }

    for i in 0..2 {
        let config = ClientConfig {
            server_addr: addr.clone(),
            authkey: "test-authkey".to_string(),
            client_id: format!("client-{i}"),
            capacity: 2,
            template: "echo {}".to_string(),
            capture: true,
            idle_timeout_secs: 1,
        };
        tokio::spawn(run_client(config));
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    let store = scheduler.store();
    for id in 1..=4 {
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Done, "task {id} should be DONE, was {:?}", task.state);
        assert_eq!(task.exit_status, Some(0));
    }
}

/// Failure sieve: true/false/true/false with a single client at capacity 1
/// forces strictly serial execution, so the failure sink sees completion
/// order equal to submission order.
#[tokio::test]
async fn failure_sieve_reports_in_completion_order() {
    let (scheduler, addr, mut sink_rx) = spin_up_server(16, 1).await;

    for args in ["true", "false", "true", "false"] {
        scheduler.submit_line(args.to_string(), "{}".to_string()).await.unwrap();
    }

    let config = ClientConfig {
        server_addr: addr,
        authkey: "test-authkey".to_string(),
        client_id: "client-serial".to_string(),
        capacity: 1,
        template: "{}".to_string(),
        capture: false,
        idle_timeout_secs: 1,
    };
    tokio::spawn(run_client(config));

    let mut failures = Vec::new();
    let collector = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(event) = sink_rx.recv().await {
            if let SinkEvent::Failed { args } = event {
                failures.push(args);
                if failures.len() == 2 {
                    break;
                }
            }
        }
    });
    let _ = collector.await;

    assert_eq!(failures, vec!["false".to_string(), "false".to_string()]);
}

/// Template slicing: `{[1:3]}` selects the middle two whitespace tokens.
#[tokio::test]
async fn template_slicing_selects_middle_tokens() {
    let descriptor = TaskDescriptor {
        task_id: 1,
        command: "a b c d".to_string(),
        attempt: 1,
        env_deltas: Vec::new(),
        lease_deadline: chrono::Utc::now(),
    };
    let result = run_task(&descriptor, "echo {[1:3]}", "host-a", 1, true).await.unwrap();
    assert_eq!(result.exit_status, 0);
    assert_eq!(String::from_utf8_lossy(&result.stdout.unwrap()), "b c\n");
}

/// Environment injection: `HYPERSHELL_EXPORT_FOO` is exported to the task
/// as `FOO`, with the prefix stripped.
#[tokio::test]
async fn export_prefixed_env_reaches_the_task() {
    std::env::set_var("HYPERSHELL_EXPORT_FOO", "bar");
    let descriptor = TaskDescriptor {
        task_id: 1,
        command: "noop".to_string(),
        attempt: 1,
        env_deltas: Vec::new(),
        lease_deadline: chrono::Utc::now(),
    };
    let result = run_task(&descriptor, "echo $FOO", "host-a", 1, true).await.unwrap();
    std::env::remove_var("HYPERSHELL_EXPORT_FOO");
    assert_eq!(result.exit_status, 0);
    assert_eq!(String::from_utf8_lossy(&result.stdout.unwrap()), "bar\n");
}
