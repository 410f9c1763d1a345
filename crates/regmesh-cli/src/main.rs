//! Register Mesh Simulator Command-Line Interface
//!
//! Drives protocol nodes over the in-memory shared air so the join,
//! ping and register flows can be watched without packet-radio
//! hardware:
//! - Bringing up a mesh and watching id conflicts resolve
//! - Discovering who is present with a ping sweep
//! - Walking a remote register table (count, names, get, set)
//! - Long-running mixed traffic with optional packet loss

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use regmesh_core::{
    Completion, MeshConfig, MeshError, Node, RadioConfig, Register, SetOutcome, SharedAir,
    SimRadio, State, Status,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "regmesh")]
#[command(author, version, about = "Register mesh protocol simulator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up a mesh where every node asks for the same id
    Join {
        /// Number of nodes to bring up
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        /// Id every node requests (conflicts resolve by unique id)
        #[arg(long, default_value = "1")]
        requested_id: u8,

        /// Packet loss out of 1000
        #[arg(long, default_value = "0")]
        loss: u16,
    },

    /// Bring up a mesh and ping it from the first node
    Ping {
        /// Number of nodes to bring up
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        /// Packet loss out of 1000
        #[arg(long, default_value = "0")]
        loss: u16,
    },

    /// Publish registers on a server node and walk them from a client
    Registers {
        /// Emit the walk as JSON instead of text
        #[arg(long)]
        json: bool,

        /// Packet loss out of 1000
        #[arg(long, default_value = "0")]
        loss: u16,
    },

    /// Run mixed traffic until Ctrl+C
    Run {
        /// Number of nodes (ignored when --scenario is given)
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        /// Scenario file (JSON) overriding nodes, loss and registers
        #[arg(short, long)]
        scenario: Option<PathBuf>,

        /// Packet loss out of 1000 (ignored when --scenario is given)
        #[arg(long, default_value = "0")]
        loss: u16,

        /// Milliseconds between traffic rounds
        #[arg(long, default_value = "500")]
        round_ms: u64,
    },
}

/// Traffic description for the `run` subcommand.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct Scenario {
    /// Number of nodes to bring up
    nodes: usize,
    /// Packet loss out of 1000
    loss: u16,
    /// Milliseconds between traffic rounds
    round_ms: u64,
    /// Registers published by the first node
    registers: Vec<ScenarioRegister>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScenarioRegister {
    name: String,
    value: String,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            nodes: 4,
            loss: 0,
            round_ms: 500,
            registers: default_registers(),
        }
    }
}

fn default_registers() -> Vec<ScenarioRegister> {
    vec![
        ScenarioRegister {
            name: "mode".to_string(),
            value: "auto".to_string(),
        },
        ScenarioRegister {
            name: "temp".to_string(),
            value: "21.5".to_string(),
        },
    ]
}

type StatusSlot = Arc<Mutex<Option<Status>>>;

fn status_slot() -> (StatusSlot, Completion<SimRadio>) {
    let slot: StatusSlot = Arc::new(Mutex::new(None));
    let out = Arc::clone(&slot);
    let completion = Completion::callback(move |_, status| {
        *out.lock().unwrap() = Some(status);
    });
    (slot, completion)
}

/// Poll every node until `pending` clears or the deadline passes.
fn pump_while<F>(nodes: &mut [Node<SimRadio>], mut pending: F, timeout: Duration) -> Result<bool>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pending() {
            return Ok(true);
        }
        for node in nodes.iter_mut() {
            node.update()?;
        }
        thread::sleep(Duration::from_micros(200));
    }
    Ok(false)
}

/// Start one operation on `client` and pump the whole mesh until it
/// completes.
fn run_op<F>(
    nodes: &mut [Node<SimRadio>],
    client: usize,
    start: F,
    timeout: Duration,
) -> Result<Status>
where
    F: FnOnce(&mut Node<SimRadio>, Completion<SimRadio>) -> std::result::Result<(), MeshError>,
{
    let (slot, done) = status_slot();
    start(&mut nodes[client], done)?;
    pump_while(nodes, || slot.lock().unwrap().is_none(), timeout)?;
    let outcome = *slot.lock().unwrap();
    match outcome {
        Some(status) => Ok(status),
        None => bail!("operation did not complete within {:?}", timeout),
    }
}

/// Issue a join on every node at once and wait for all of them to
/// settle. Returns the per-node join status in node order.
fn bring_up<F>(nodes: &mut [Node<SimRadio>], requested: F, timeout: Duration) -> Result<Vec<Status>>
where
    F: Fn(usize) -> u8,
{
    let mut slots = Vec::with_capacity(nodes.len());
    for (index, node) in nodes.iter_mut().enumerate() {
        let (slot, done) = status_slot();
        node.join(requested(index), done)?;
        slots.push(slot);
    }
    let settled = pump_while(
        nodes,
        || slots.iter().any(|slot| slot.lock().unwrap().is_none()),
        timeout,
    )?;
    if !settled {
        bail!("not every node joined within {:?}", timeout);
    }
    Ok(slots
        .iter()
        .map(|slot| slot.lock().unwrap().unwrap_or(Status::Timeout))
        .collect())
}

fn make_nodes(air: &SharedAir, count: usize) -> Result<Vec<Node<SimRadio>>> {
    let radio_config = RadioConfig::default();
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let mut node = Node::new(air.attach(), MeshConfig::default());
        node.initialize(&radio_config)?;
        nodes.push(node);
    }
    Ok(nodes)
}

fn cmd_join(count: usize, requested_id: u8, loss: u16) -> Result<()> {
    ensure!((1..=32).contains(&count), "node count must be 1-32");
    ensure!(requested_id != 0, "requested id must be 1-255");
    ensure!(loss <= 1000, "loss is out of 1000");

    let air = SharedAir::with_loss(loss, rand::random());
    let mut nodes = make_nodes(&air, count)?;

    println!("=== Mesh Join ===");
    println!();
    println!("Nodes:        {}", count);
    println!("Requested id: {} (every node asks for it)", requested_id);
    println!("Loss:         {}/1000", loss);
    println!();

    let started = Instant::now();
    let statuses = bring_up(&mut nodes, |_| requested_id, Duration::from_secs(60))?;
    let elapsed = started.elapsed();

    println!(
        "{:<6} {:<8} {:<10} {:<10} {:<10}",
        "node", "unique", "requested", "assigned", "status"
    );
    println!("{}", "-".repeat(48));
    for (index, node) in nodes.iter().enumerate() {
        println!(
            "{:<6} {:#06x}   {:<10} {:<10} {:?}",
            index + 1,
            node.unique_id(),
            requested_id,
            node.node_id(),
            statuses[index]
        );
    }
    println!();
    println!("All joins settled in {:.2}s", elapsed.as_secs_f64());

    let stats = air.stats();
    println!(
        "Air: {} frames sent, {} delivered, {} dropped",
        stats.frames_sent, stats.frames_delivered, stats.frames_dropped
    );

    Ok(())
}

fn cmd_ping(count: usize, loss: u16) -> Result<()> {
    ensure!((2..=32).contains(&count), "node count must be 2-32");
    ensure!(loss <= 1000, "loss is out of 1000");

    let air = SharedAir::with_loss(loss, rand::random());
    let mut nodes = make_nodes(&air, count)?;

    println!("=== Mesh Ping ===");
    println!();
    println!("Nodes: {}", count);
    println!("Loss:  {}/1000", loss);
    println!();

    bring_up(&mut nodes, |index| (index + 1) as u8, Duration::from_secs(60))?;
    for (index, node) in nodes.iter().enumerate() {
        println!(
            "node {}: id {} (unique {:#06x})",
            index + 1,
            node.node_id(),
            node.unique_id()
        );
    }
    println!();

    let started = Instant::now();
    let status = run_op(
        &mut nodes,
        0,
        |node, done| node.ping(done),
        Duration::from_secs(10),
    )?;
    println!(
        "Ping from id {} finished in {:.2}s: {:?}",
        nodes[0].node_id(),
        started.elapsed().as_secs_f64(),
        status
    );

    let present = nodes[0].presence().ids();
    if present.is_empty() {
        println!("No other node answered.");
    } else {
        println!(
            "Present: {}",
            present
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    Ok(())
}

fn cmd_registers(json: bool, loss: u16) -> Result<()> {
    ensure!(loss <= 1000, "loss is out of 1000");

    let air = SharedAir::with_loss(loss, rand::random());
    let mut nodes = make_nodes(&air, 2)?;

    nodes[0].add_register(Register::with_value("mode", b"auto")?)?;
    nodes[0].add_register(
        Register::with_value("temp", b"21.5")?.on_set(Box::new(|reg, _proposed| {
            reg.set_error("temp is read-only");
            SetOutcome::Reject
        })),
    )?;

    bring_up(&mut nodes, |index| (index + 1) as u8, Duration::from_secs(60))?;
    let server_id = nodes[0].node_id();
    let server_unique = nodes[0].unique_id();
    let op_timeout = Duration::from_secs(10);

    // count
    let status = run_op(
        &mut nodes,
        1,
        |node, done| node.get_num_registers(server_id, None, done),
        op_timeout,
    )?;
    ensure!(status == Status::Ok, "count query failed: {:?}", status);
    let count = nodes[1]
        .num_registers_result()
        .context("count query completed without a result")?
        .count;

    // names
    let mut names = Vec::new();
    for index in 0..count {
        let status = run_op(
            &mut nodes,
            1,
            |node, done| node.get_register_name(server_id, index, Some(server_unique), done),
            op_timeout,
        )?;
        ensure!(status == Status::Ok, "name query {} failed: {:?}", index, status);
        names.push(
            nodes[1]
                .op_register()
                .name_str()
                .unwrap_or_default()
                .to_string(),
        );
    }

    // values
    let mut values = Vec::new();
    for name in &names {
        let status = run_op(
            &mut nodes,
            1,
            |node, done| node.get_register(Register::named(name)?, done),
            op_timeout,
        )?;
        ensure!(status == Status::Ok, "get {} failed: {:?}", name, status);
        values.push(String::from_utf8_lossy(nodes[1].op_register().value_bytes()).into_owned());
    }

    // one accepted write, one rejected write
    let mut writes = Vec::new();
    for (name, value) in [("mode", "eco"), ("temp", "0")] {
        let status = run_op(
            &mut nodes,
            1,
            |node, done| node.set_register(Register::with_value(name, value.as_bytes())?, done),
            op_timeout,
        )?;
        let error = nodes[1]
            .op_register()
            .error_str()
            .map(|text| text.to_string());
        writes.push((name.to_string(), value.to_string(), status, error));
    }

    // confirm the accepted write landed
    let status = run_op(
        &mut nodes,
        1,
        |node, done| node.get_register(Register::named("mode")?, done),
        op_timeout,
    )?;
    ensure!(status == Status::Ok, "re-read of mode failed: {:?}", status);
    let mode_after = String::from_utf8_lossy(nodes[1].op_register().value_bytes()).into_owned();

    if json {
        let registers: Vec<_> = names
            .iter()
            .zip(&values)
            .enumerate()
            .map(|(index, (name, value))| {
                serde_json::json!({ "index": index, "name": name, "value": value })
            })
            .collect();
        let writes: Vec<_> = writes
            .iter()
            .map(|(name, value, status, error)| {
                serde_json::json!({
                    "register": name,
                    "value": value,
                    "status": status,
                    "error": error,
                })
            })
            .collect();
        let report = serde_json::json!({
            "server": { "node_id": server_id, "unique_id": server_unique, "count": count },
            "registers": registers,
            "writes": writes,
            "mode_after": mode_after,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== Register Walk ===");
    println!();
    println!(
        "Server: id {} (unique {:#06x}), {} registers",
        server_id, server_unique, count
    );
    println!("Client: id {}", nodes[1].node_id());
    println!();
    for (index, (name, value)) in names.iter().zip(&values).enumerate() {
        println!("[{}] {:<10} = {:?}", index, name, value);
    }
    println!();
    for (name, value, status, error) in &writes {
        match error {
            Some(text) => println!("set {} = {:?}: {:?} ({})", name, value, status, text),
            None => println!("set {} = {:?}: {:?}", name, value, status),
        }
    }
    println!();
    println!("mode after write: {:?}", mode_after);

    Ok(())
}

#[derive(Default)]
struct RunTally {
    ok: u64,
    timeout: u64,
    other: u64,
}

fn cmd_run(count: usize, scenario: Option<PathBuf>, loss: u16, round_ms: u64) -> Result<()> {
    let scenario = match scenario {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read scenario {:?}", path))?;
            serde_json::from_str(&text).context("failed to parse scenario JSON")?
        }
        None => Scenario {
            nodes: count,
            loss,
            round_ms,
            registers: default_registers(),
        },
    };
    ensure!(
        (2..=32).contains(&scenario.nodes),
        "scenario node count must be 2-32"
    );
    ensure!(scenario.loss <= 1000, "scenario loss is out of 1000");
    ensure!(
        !scenario.registers.is_empty(),
        "scenario needs at least one register"
    );

    let air = SharedAir::with_loss(scenario.loss, rand::random());
    let mut nodes = make_nodes(&air, scenario.nodes)?;
    for reg in &scenario.registers {
        nodes[0].add_register(Register::with_value(&reg.name, reg.value.as_bytes())?)?;
    }

    println!("=== Mixed Traffic Run ===");
    println!();
    println!("Nodes:     {}", scenario.nodes);
    println!("Loss:      {}/1000", scenario.loss);
    println!("Round:     {} ms", scenario.round_ms);
    println!(
        "Registers: {}",
        scenario
            .registers
            .iter()
            .map(|reg| reg.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();

    bring_up(&mut nodes, |index| (index + 1) as u8, Duration::from_secs(60))?;
    for (index, node) in nodes.iter().enumerate() {
        println!(
            "node {}: id {} (unique {:#06x})",
            index + 1,
            node.node_id(),
            node.unique_id()
        );
    }
    let server_id = nodes[0].node_id();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    println!();
    println!("Running... (Press Ctrl+C to stop)");

    let tally: Arc<Mutex<RunTally>> = Arc::new(Mutex::new(RunTally::default()));
    let mut rng = rand::thread_rng();
    let round = Duration::from_millis(scenario.round_ms.max(1));
    let mut next_round = Instant::now() + round;
    let mut rounds: u64 = 0;

    while running.load(Ordering::SeqCst) {
        if Instant::now() >= next_round {
            next_round += round;
            let client = rng.gen_range(1..nodes.len());
            if nodes[client].state() == State::Idle {
                rounds += 1;
                let sink = Arc::clone(&tally);
                let done = Completion::callback(move |_, status| {
                    let mut tally = sink.lock().unwrap();
                    match status {
                        Status::Ok => tally.ok += 1,
                        Status::Timeout => tally.timeout += 1,
                        _ => tally.other += 1,
                    }
                });
                let id = nodes[client].node_id();
                let result = match rng.gen_range(0..4u8) {
                    0 => {
                        info!(id, "round {}: ping", rounds);
                        nodes[client].ping(done)
                    }
                    1 => {
                        let reg = &scenario.registers[rng.gen_range(0..scenario.registers.len())];
                        info!(id, register = %reg.name, "round {}: get", rounds);
                        nodes[client].get_register(Register::named(&reg.name)?, done)
                    }
                    2 => {
                        let reg = &scenario.registers[rng.gen_range(0..scenario.registers.len())];
                        let value = format!("v{}", rounds);
                        info!(id, register = %reg.name, value = %value, "round {}: set", rounds);
                        nodes[client]
                            .set_register(Register::with_value(&reg.name, value.as_bytes())?, done)
                    }
                    _ => {
                        info!(id, target = server_id, "round {}: count", rounds);
                        nodes[client].get_num_registers(server_id, None, done)
                    }
                };
                if let Err(error) = result {
                    debug!(%error, "round skipped");
                    rounds -= 1;
                }
            }
        }
        for node in nodes.iter_mut() {
            node.update()?;
        }
        thread::sleep(Duration::from_micros(200));
    }

    println!();
    println!("=== Run Summary ===");
    println!();
    let tally = tally.lock().unwrap();
    println!("Rounds issued: {}", rounds);
    println!(
        "Completions:   {} ok, {} timeout, {} other",
        tally.ok, tally.timeout, tally.other
    );
    let stats = air.stats();
    println!(
        "Air frames:    {} sent, {} delivered, {} dropped",
        stats.frames_sent, stats.frames_delivered, stats.frames_dropped
    );
    println!();
    for (index, node) in nodes.iter().enumerate() {
        println!(
            "node {}: id {}, state {:?}",
            index + 1,
            node.node_id(),
            node.state()
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Join {
            nodes,
            requested_id,
            loss,
        } => cmd_join(nodes, requested_id, loss),

        Commands::Ping { nodes, loss } => cmd_ping(nodes, loss),

        Commands::Registers { json, loss } => cmd_registers(json, loss),

        Commands::Run {
            nodes,
            scenario,
            loss,
            round_ms,
        } => cmd_run(nodes, scenario, loss, round_ms),
    }
}
