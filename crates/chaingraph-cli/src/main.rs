//! Thin command-line front end over the ChainGraph flow execution engine.
//!
//! Deliberately small: environment variables already carry the
//! engine's tunables, so this binary only wires argument parsing, flow
//! loading and event/log formatting around `ExecutionEngine`. All
//! scheduling, persistence and subscription logic lives in
//! `chaingraph-engine`.

mod builtin;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use chaingraph_engine::{
    validate_flow, EngineConfig, ExecutionEngine, ExecutionOptions, ExecutionStatus, ExecutionStore,
    Flow, InMemoryFlowStore, ListExecutionsFilter, SqliteExecutionStore,
};

#[derive(Parser)]
#[command(name = "chaingraph")]
#[command(about = "Run and inspect ChainGraph flow executions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Statically validate a flow JSON file (dangling edges, type
    /// mismatches, system-edge cycles).
    Validate {
        /// Path to the flow's JSON file.
        flow: PathBuf,
    },

    /// Create and run a flow to completion, streaming its events to stdout.
    Run {
        /// Path to the flow's JSON file. Its own `flowId` is used to start it.
        flow: PathBuf,

        /// Additional flow files to preload (e.g. child flows bound via
        /// `eventChildFlows`). May be repeated.
        #[arg(long = "include")]
        include: Vec<PathBuf>,

        /// Enable debug mode: breakpoints are honored and the run accepts
        /// interactive `pause`/`resume`/`step`/`stop`/`bp add <node>`/
        /// `bp remove <node>` commands on stdin.
        #[arg(long)]
        debug: bool,

        /// Node id to break on. May be repeated. Implies `--debug`.
        #[arg(long = "breakpoint")]
        breakpoints: Vec<String>,

        #[arg(long = "max-concurrency")]
        max_concurrency: Option<usize>,

        #[arg(long = "node-timeout-ms")]
        node_timeout_ms: Option<u64>,

        #[arg(long = "flow-timeout-ms")]
        flow_timeout_ms: Option<u64>,

        #[arg(long)]
        owner: Option<String>,

        /// SQLite database file for execution/event persistence.
        #[arg(long, default_value = "chaingraph.db")]
        db: PathBuf,
    },

    /// Print the current status/timings/error of a past or running
    /// execution from the persisted store.
    State {
        execution_id: String,
        #[arg(long, default_value = "chaingraph.db")]
        db: PathBuf,
    },

    /// Replay an execution's persisted event log.
    Events {
        execution_id: String,
        /// Only events with index greater than this.
        #[arg(long)]
        since: Option<u64>,
        #[arg(long, default_value = "chaingraph.db")]
        db: PathBuf,
    },

    /// List child executions spawned from a parent execution.
    Children {
        execution_id: String,
        #[arg(long, default_value = "chaingraph.db")]
        db: PathBuf,
    },

    /// List root executions (no parent), most recently created first.
    Roots {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value = "chaingraph.db")]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(command: Command) -> Result<i32, Box<dyn std::error::Error>> {
    match command {
        Command::Validate { flow } => cmd_validate(&flow),
        Command::Run {
            flow,
            include,
            debug,
            breakpoints,
            max_concurrency,
            node_timeout_ms,
            flow_timeout_ms,
            owner,
            db,
        } => {
            cmd_run(
                &flow,
                &include,
                debug || !breakpoints.is_empty(),
                breakpoints,
                max_concurrency,
                node_timeout_ms,
                flow_timeout_ms,
                owner,
                &db,
            )
            .await
        }
        Command::State { execution_id, db } => cmd_state(&execution_id, &db).await,
        Command::Events { execution_id, since, db } => cmd_events(&execution_id, since, &db).await,
        Command::Children { execution_id, db } => cmd_children(&execution_id, &db).await,
        Command::Roots { owner, limit, offset, db } => cmd_roots(owner, limit, offset, &db).await,
    }
}

fn load_flow(path: &Path) -> Result<Flow, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn cmd_validate(path: &Path) -> Result<i32, Box<dyn std::error::Error>> {
    let flow = load_flow(path)?;
    let errors = validate_flow(&flow);
    if errors.is_empty() {
        println!("flow '{}' is valid ({} nodes, {} edges)", flow.flow_id, flow.nodes.len(), flow.edges.len());
        Ok(0)
    } else {
        for error in &errors {
            println!("{error}");
        }
        Ok(1)
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    path: &Path,
    include: &[PathBuf],
    debug: bool,
    breakpoints: Vec<String>,
    max_concurrency: Option<usize>,
    node_timeout_ms: Option<u64>,
    flow_timeout_ms: Option<u64>,
    owner: Option<String>,
    db: &Path,
) -> Result<i32, Box<dyn std::error::Error>> {
    let flow = load_flow(path)?;
    let flow_id = flow.flow_id.clone();

    let flow_store = Arc::new(InMemoryFlowStore::new());
    flow_store.insert(flow);
    for extra in include {
        flow_store.insert(load_flow(extra)?);
    }

    let registry = Arc::new(builtin::builtin_registry());
    let store = Arc::new(SqliteExecutionStore::open(db)?);
    let config = Arc::new(EngineConfig::from_env());
    let engine = ExecutionEngine::new(config, registry, store, flow_store);

    let options = ExecutionOptions {
        max_concurrency,
        node_timeout_ms,
        flow_timeout_ms,
        debug,
        breakpoints,
        owner,
        ..Default::default()
    };

    let execution_id = engine.create(&flow_id, options).await?;
    println!("execution {execution_id} created");
    engine.start(&execution_id).await?;

    let commands = debug.then(|| spawn_stdin_reader());
    let mut subscription = engine.subscribe_to_events(&execution_id, None, None).await?;

    loop {
        let command = match &commands {
            Some(rx) => {
                tokio::select! {
                    event = subscription.next() => Ok(event),
                    line = rx.recv_async() => Err(line),
                }
            }
            None => Ok(subscription.next().await),
        };

        match command {
            Ok(Some(event)) => {
                println!("{}", serde_json::to_string(&event)?);
                if event.data.is_flow_terminal() {
                    break;
                }
            }
            Ok(None) => break,
            Err(Some(line)) => handle_debug_command(&engine, &execution_id, &line).await,
            Err(None) => {}
        }
    }

    let state = engine.get_state(&execution_id).await?;
    println!("{}", serde_json::to_string(&state)?);
    Ok(match state.status {
        ExecutionStatus::Completed => 0,
        _ => 1,
    })
}

async fn handle_debug_command(engine: &ExecutionEngine, execution_id: &str, line: &str) {
    let mut parts = line.split_whitespace();
    let result = match parts.next() {
        Some("pause") => engine.pause(execution_id).await,
        Some("resume") => engine.resume(execution_id).await,
        Some("step") => engine.step(execution_id).await,
        Some("stop") => engine.stop(execution_id).await,
        Some("bp") => match (parts.next(), parts.next()) {
            (Some("add"), Some(node_id)) => engine.add_breakpoint(execution_id, node_id),
            (Some("remove"), Some(node_id)) => engine.remove_breakpoint(execution_id, node_id),
            _ => {
                eprintln!("usage: bp <add|remove> <nodeId>");
                return;
            }
        },
        Some(other) => {
            eprintln!("unknown command '{other}' (expected pause|resume|step|stop|bp add|bp remove)");
            return;
        }
        None => return,
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
    }
}

/// A tiny blocking-stdin-to-channel bridge: `tokio::io::stdin` would need an
/// extra feature just for this one interactive path, so a plain OS thread
/// plus a bounded channel does the job instead.
struct StdinCommands {
    inner: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<String>>,
}

impl StdinCommands {
    async fn recv_async(&self) -> Option<String> {
        self.inner.lock().await.recv().await
    }
}

fn spawn_stdin_reader() -> StdinCommands {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if tx.send(line).is_ok() => {}
                _ => break,
            }
        }
    });
    StdinCommands {
        inner: tokio::sync::Mutex::new(rx),
    }
}

async fn cmd_state(execution_id: &str, db: &Path) -> Result<i32, Box<dyn std::error::Error>> {
    let store = SqliteExecutionStore::open(db)?;
    let row = store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| format!("no such execution '{execution_id}'"))?;
    println!("{row:#?}");
    Ok(0)
}

async fn cmd_events(execution_id: &str, since: Option<u64>, db: &Path) -> Result<i32, Box<dyn std::error::Error>> {
    let store = SqliteExecutionStore::open(db)?;
    let events = store.list_events_since(execution_id, since.unwrap_or(0)).await?;
    for event in events {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(0)
}

async fn cmd_children(execution_id: &str, db: &Path) -> Result<i32, Box<dyn std::error::Error>> {
    let store = SqliteExecutionStore::open(db)?;
    let children = store.list_children_of(execution_id).await?;
    for child in children {
        println!("{} ({}) depth={}", child.id, child.status, child.execution_depth);
    }
    Ok(0)
}

async fn cmd_roots(
    owner: Option<String>,
    limit: usize,
    offset: usize,
    db: &Path,
) -> Result<i32, Box<dyn std::error::Error>> {
    let store = SqliteExecutionStore::open(db)?;
    let roots = store
        .list_roots_for(ListExecutionsFilter { owner_id: owner, limit, offset })
        .await?;
    for root in roots {
        println!("{} flow={} status={}", root.id, root.flow_id, root.status);
    }
    Ok(0)
}
