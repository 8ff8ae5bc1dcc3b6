use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tokio::io::{stdin, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hyper_shell::config::HyperShellConfig;
use hyper_shell::submit::{run_submitter, submit_direct};
use hypershell_client::{run_client, ClientConfig};
use hypershell_dispatch::DispatchServer;
use hypershell_sink::{run_sink_writer, LineSink};
use hypershell_store::{DurableStore, OrderBy, Store, TaskFilter, TaskState, VolatileStore};
use hypershell_supervisor::{ClusterConfig, ClusterSupervisor, Launcher};

#[derive(Parser)]
#[command(author, version, about = "Distributed shell-command execution", long_about = None)]
struct Cli {
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    #[arg(short, long, default_value_t = 50001)]
    port: u16,
    #[arg(short = 'k', long)]
    authkey: Option<String>,
    #[arg(short, long)]
    verbose: bool,
    #[arg(short, long)]
    debug: bool,
    #[arg(short = 'l', long)]
    logging: bool,
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    #[arg(short = 'f', long)]
    failed: Option<PathBuf>,
    #[arg(short = 's', long)]
    maxsize: Option<usize>,
    #[arg(short = 't', long)]
    template: Option<String>,
    #[arg(short = 'N', long)]
    num_cores: Option<usize>,
    #[arg(short = 'x', long)]
    timeout: Option<u64>,
    #[arg(long)]
    capture: bool,
    #[arg(long)]
    no_db: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch server: accepts clients, dispatches tasks, and
    /// reads task lines from stdin.
    Server,
    /// Run a client executor that connects to a running server.
    Client,
    /// Co-launch a server and N clients in one process tree.
    Cluster {
        #[arg(default_value_t = 0)]
        num_clients: usize,
    },
    /// Submit task lines directly into a running server's durable store.
    Submit,
    #[command(subcommand)]
    Task(TaskCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum TaskCommand {
    Show { id: u64 },
    Status { id: u64 },
    Search {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        csv: bool,
        #[arg(short = 'x', long)]
        raw: bool,
        #[arg(short = 'c', long)]
        count: bool,
    },
    Wait { id: u64 },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(level).init();

    let mut config = HyperShellConfig::load().unwrap_or_default();
    config.host = cli.host.clone();
    config.port = cli.port;
    if let Some(key) = &cli.authkey {
        config.authkey = key.clone();
    }
    if let Some(t) = &cli.template {
        config.template = t.clone();
    }
    if let Some(n) = cli.maxsize {
        config.maxsize = n;
    }
    if let Some(n) = cli.num_cores {
        config.num_cores = n;
    }
    config.capture = cli.capture || config.capture;
    config.no_db = cli.no_db || config.no_db;

    let exit_code = match &cli.command {
        Command::Server => run_server(&config, cli.failed.as_deref(), cli.output.as_deref()).await?,
        Command::Client => run_client_command(&config, cli.timeout).await?,
        Command::Cluster { num_clients } => run_cluster(&config, *num_clients, cli.failed.as_deref(), cli.output.as_deref()).await?,
        Command::Submit => run_submit(&config).await?,
        Command::Task(task_cmd) => run_task_command(&config, task_cmd).await?,
        Command::Config(config_cmd) => run_config_command(&mut config, config_cmd)?,
    };

    std::process::exit(exit_code);
}

async fn open_store(config: &HyperShellConfig) -> Result<Arc<dyn Store>> {
    if config.no_db {
        Ok(Arc::new(VolatileStore::new()))
    } else {
        let url = format!("sqlite://{}?mode=rwc", config.db_path.display());
        let store = DurableStore::connect(&url).await.context("opening durable task store")?;
        Ok(Arc::new(store))
    }
}

fn open_sinks(failed: Option<&std::path::Path>, output: Option<&std::path::Path>) -> Result<(Option<LineSink>, Option<LineSink>)> {
    let failure_sink = match failed {
        Some(path) => Some(LineSink::open_file(path)?),
        None => None,
    };
    let output_sink = match output {
        Some(path) => Some(LineSink::open_file(path)?),
        None => None,
    };
    Ok((failure_sink, output_sink))
}

async fn run_server(config: &HyperShellConfig, failed: Option<&std::path::Path>, output: Option<&std::path::Path>) -> Result<i32> {
    let store = open_store(config).await?;
    let scheduler = hypershell_scheduler::Scheduler::new(
        store.clone(),
        config.maxsize,
        config.max_attempts,
        Duration::seconds(config.lease_ttl_secs),
    );
    scheduler.recover_pending().await?;

    let (failure_sink, output_sink) = open_sinks(failed, output)?;
    let (sink_tx, sink_rx) = tokio::sync::mpsc::channel(1024);
    tokio::spawn(run_sink_writer(sink_rx, failure_sink, output_sink));

    let listener = TcpListener::bind(config.bind_addr()).await.context("binding dispatch server")?;
    info!(addr = %config.bind_addr(), "dispatch server listening");

    let server = DispatchServer::new(scheduler.clone(), config.authkey.clone(), sink_tx);
    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());

    let reaper = tokio::spawn(scheduler.clone().run_reaper());
    let promoter = tokio::spawn(scheduler.clone().run_promoter());
    let server_task = tokio::spawn(server.run(listener, shutdown.clone(), Duration::seconds(config.drain_deadline_secs as i64)));

    let submitted = run_submitter(scheduler.clone(), BufReader::new(stdin()), config.template.clone()).await?;
    info!(submitted, "submitter reached EOF, waiting for store to drain");
    wait_for_drain(&store).await;

    shutdown.cancel();
    let _ = server_task.await;
    reaper.abort();
    promoter.abort();

    exit_code_for_store(&store).await
}

async fn run_client_command(config: &HyperShellConfig, timeout: Option<u64>) -> Result<i32> {
    let client_config = ClientConfig {
        server_addr: config.bind_addr(),
        authkey: config.authkey.clone(),
        client_id: format!("client-{}", std::process::id()),
        capacity: config.num_cores.max(1),
        template: config.template.clone(),
        capture: config.capture,
        idle_timeout_secs: timeout.unwrap_or(0),
    };
    run_client(client_config).await?;
    Ok(0)
}

async fn run_cluster(config: &HyperShellConfig, num_clients: usize, failed: Option<&std::path::Path>, output: Option<&std::path::Path>) -> Result<i32> {
    let mut config = config.clone();
    if config.authkey == hypershell_protocol::SENTINEL_AUTHKEY {
        config.authkey = hypershell_protocol::generate_authkey_hex();
        info!(authkey = %config.authkey, "generated cluster authkey");
    }
    let config = &config;
    let store = open_store(config).await?;
    let scheduler = hypershell_scheduler::Scheduler::new(
        store.clone(),
        config.maxsize,
        config.max_attempts,
        Duration::seconds(config.lease_ttl_secs),
    );
    scheduler.recover_pending().await?;

    let (failure_sink, output_sink) = open_sinks(failed, output)?;
    let (sink_tx, sink_rx) = tokio::sync::mpsc::channel(1024);
    tokio::spawn(run_sink_writer(sink_rx, failure_sink, output_sink));

    let num_clients = if num_clients == 0 { config.num_cores.max(1) } else { num_clients };
    let cluster_config = ClusterConfig {
        bind_addr: config.bind_addr(),
        authkey: config.authkey.clone(),
        num_clients,
        launcher: Launcher::Local,
        client_template: config.template.clone(),
        client_capacity: 1,
        client_capture: config.capture,
        stagger_delay: StdDuration::from_millis(100),
        drain_deadline: StdDuration::from_secs(config.drain_deadline_secs),
    };

    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());
    let supervisor = ClusterSupervisor::new(scheduler.clone(), cluster_config, sink_tx);
    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

    let submitted = run_submitter(scheduler.clone(), BufReader::new(stdin()), config.template.clone()).await?;
    info!(submitted, "submitter reached EOF, waiting for store to drain");
    wait_for_drain(&store).await;
    shutdown.cancel();
    let _ = supervisor_task.await;

    exit_code_for_store(&store).await
}

async fn run_submit(config: &HyperShellConfig) -> Result<i32> {
    let store = open_store(config).await?;
    let mut reader = BufReader::new(stdin());
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    let mut count = 0usize;
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        submit_direct(store.as_ref(), trimmed.to_string(), config.template.clone(), config.max_attempts).await?;
        count += 1;
    }
    info!(count, "tasks submitted to shared store");
    Ok(0)
}

async fn run_task_command(config: &HyperShellConfig, cmd: &TaskCommand) -> Result<i32> {
    let store = open_store(config).await?;
    match cmd {
        TaskCommand::Show { id } => {
            let task = store.get(*id).await?.context("task not found")?;
            println!("{}", serde_json::to_string_pretty(&task_view(&task))?);
            Ok(0)
        }
        TaskCommand::Status { id } => {
            let task = store.get(*id).await?.context("task not found")?;
            println!("{}", task.state);
            Ok(0)
        }
        TaskCommand::Search { state, host, json, csv, raw, count } => {
            let filter = TaskFilter {
                state: state.as_deref().map(|s| s.parse::<TaskState>()).transpose().map_err(anyhow::Error::msg)?,
                host: host.clone(),
                args_contains: None,
            };
            let tasks = store.query(filter, OrderBy::IdAsc, 10_000).await?;
            render_search(&tasks, *json, *csv, *raw, *count);
            Ok(0)
        }
        TaskCommand::Wait { id } => {
            loop {
                let task = store.get(*id).await?.context("task not found")?;
                if task.state.is_terminal() {
                    println!("{}", task.state);
                    return Ok(if task.state == TaskState::Done { 0 } else { 4 });
                }
                tokio::time::sleep(StdDuration::from_millis(200)).await;
            }
        }
    }
}

fn run_config_command(config: &mut HyperShellConfig, cmd: &ConfigCommand) -> Result<i32> {
    match cmd {
        ConfigCommand::Get { key } => {
            match config.get(key) {
                Some(value) => println!("{value}"),
                None => bail!("unknown config key '{key}'"),
            }
            Ok(0)
        }
        ConfigCommand::Set { key, value } => {
            bail!("config set '{key}={value}' requires a writable hypershell.toml; not implemented for ephemeral runs");
        }
    }
}

fn task_view(task: &hypershell_store::Task) -> serde_json::Value {
    serde_json::json!({
        "id": task.id,
        "uuid": task.uuid,
        "args": task.args,
        "state": task.state.as_str(),
        "attempt": task.attempt,
        "max_attempts": task.max_attempts,
        "host": task.host,
        "exit_status": task.exit_status,
        "fail_reason": task.fail_reason,
    })
}

fn render_search(tasks: &[hypershell_store::Task], json: bool, csv: bool, raw: bool, count_only: bool) {
    if count_only {
        println!("{}", tasks.len());
        return;
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks.iter().map(task_view).collect::<Vec<_>>()).unwrap());
        return;
    }
    if raw {
        for task in tasks {
            println!("{}", task.args);
        }
        return;
    }
    if csv {
        println!("id,state,args,host,exit_status");
        for task in tasks {
            println!(
                "{},{},{},{},{}",
                task.id,
                task.state,
                task.args,
                task.host.as_deref().unwrap_or(""),
                task.exit_status.map(|s| s.to_string()).unwrap_or_default()
            );
        }
        return;
    }
    println!("{:>6}  {:<10}  {:<8}  ARGS", "ID", "STATE", "HOST");
    for task in tasks {
        println!("{:>6}  {:<10}  {:<8}  {}", task.id, task.state, task.host.as_deref().unwrap_or("-"), task.args);
    }
}

async fn wait_for_drain(store: &Arc<dyn Store>) {
    loop {
        let in_flight = store
            .query(TaskFilter::default(), OrderBy::IdAsc, 1_000_000)
            .await
            .map(|tasks| tasks.iter().filter(|t| !t.state.is_terminal()).count())
            .unwrap_or(0);
        if in_flight == 0 {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(200)).await;
    }
}

async fn exit_code_for_store(store: &Arc<dyn Store>) -> Result<i32> {
    let tasks = store.query(TaskFilter::default(), OrderBy::IdAsc, 1_000_000).await?;
    let has_failure = tasks.iter().any(|t| matches!(t.state, TaskState::Failed | TaskState::Abandoned));
    Ok(if has_failure { 4 } else { 0 })
}

fn install_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt, beginning ordered shutdown");
        token.cancel();
    });
}
