/*
* Command line interface
* ----------------------
* cloud-orchestrator [--config <dir>]
* ├── serve                      run the control plane until Ctrl-C
* ├── drs --cluster <id>         one manual DRS pass
* │       [--execute] [--json]
* ├── capacity [--json]          print the capacity ledger
* ├── vms [--json]               print VM placement and state
* └── init [--force]             write config/default.toml
*
* Every command runs against the simulator agent seeded from the
* `inventory` section of the configuration.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::{DriverRegistry, SimulatorAgent};
use crate::cluster::FirstFitAllocator;
use crate::config::Settings;
use crate::core::clock::SystemClock;
use crate::core::ledger::{CapacityLedger, ResourceType};
use crate::core::orchestrator::Orchestrator;
use crate::core::store::{DataStore, MemoryStore};
use crate::core::vm::{ClusterId, PlacementHints, VmSpec, VmState};
use crate::scheduler::drs::{cluster_loads, DrsOutcome};
use crate::scheduler::ControlPlane;

const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

#[derive(Parser)]
#[command(name = "cloud-orchestrator")]
#[command(about = "IaaS control plane: VM lifecycle, capacity and DRS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml / local.toml
    #[arg(short, long, value_name = "DIR")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane and its background loops
    Serve,
    /// Plan (and optionally execute) one DRS pass for a cluster
    Drs {
        #[arg(short, long)]
        cluster: u64,
        #[arg(short, long)]
        execute: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the capacity ledger
    Capacity {
        #[arg(long)]
        json: bool,
    },
    /// Show VMs
    Vms {
        #[arg(long)]
        json: bool,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

/// Orchestrator wired to an in-process simulator agent.
pub struct Simulation {
    pub orchestrator: Arc<Orchestrator>,
    pub agent: Arc<SimulatorAgent>,
}

impl Simulation {
    /// Builds the orchestrator and seeds clusters, hosts and VMs from the
    /// inventory settings.
    pub async fn build(settings: Settings) -> Result<Self> {
        let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CapacityLedger::new());
        let agent = Arc::new(SimulatorAgent::new());
        let drivers = DriverRegistry::with_dispatcher(agent.clone());
        let allocator = Arc::new(FirstFitAllocator::new(store.clone(), ledger.clone()));
        let inventory = settings.inventory.clone();

        let orchestrator = Arc::new(
            Orchestrator::new(
                store.clone(),
                ledger,
                drivers,
                allocator,
                Arc::new(SystemClock),
                settings,
            )
            .context("Failed to build orchestrator")?,
        );

        for cluster in inventory.clusters {
            store.insert_cluster(cluster).await?;
        }
        for host in inventory.hosts {
            let host_id = host.id;
            orchestrator
                .register_host(host)
                .await
                .with_context(|| format!("Failed to register host {host_id}"))?;
        }
        for seed in inventory.vms {
            let offering = inventory
                .offerings
                .iter()
                .find(|o| o.name == seed.offering)
                .cloned()
                .with_context(|| format!("Unknown offering {}", seed.offering))?;
            let vm_id = orchestrator
                .allocate(
                    VmSpec {
                        name: seed.name.clone(),
                        vm_type: seed.vm_type,
                        hypervisor: seed.hypervisor,
                    },
                    offering,
                    PlacementHints {
                        zone_id: None,
                        cluster_id: seed.cluster_id,
                        host_id: seed.host_id,
                    },
                )
                .await?;
            if seed.start {
                if let Err(e) = orchestrator.start(vm_id).await {
                    warn!(vm = %seed.name, error = %e, "Seed VM failed to start");
                }
            }
        }

        Ok(Self {
            orchestrator,
            agent,
        })
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return handle_init_command(cli.config.unwrap_or_else(|| PathBuf::from("config")), force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::load(&path.to_string_lossy()),
        None => Settings::new(),
    }
    .context("Failed to load configuration")?;
    let simulation = Simulation::build(settings).await?;

    match cli.command {
        Commands::Serve => serve(simulation).await?,
        Commands::Drs {
            cluster,
            execute,
            json,
        } => handle_drs_command(&simulation, ClusterId(cluster), execute, json).await?,
        Commands::Capacity { json } => print_capacity(&simulation, json).await?,
        Commands::Vms { json } => print_vms(&simulation, json).await?,
        Commands::Init { .. } => {}
    }
    Ok(())
}

async fn serve(simulation: Simulation) -> Result<()> {
    let mut control_plane = ControlPlane::new(simulation.orchestrator.clone());
    control_plane.start();
    info!("Control plane running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    control_plane.shutdown().await;
    Ok(())
}

async fn handle_drs_command(
    simulation: &Simulation,
    cluster_id: ClusterId,
    execute: bool,
    json: bool,
) -> Result<()> {
    let orchestrator = &simulation.orchestrator;
    let metric = orchestrator.settings().drs.metric;

    if !json {
        print_loads(simulation, cluster_id, metric, "Before").await?;
    }

    let outcome = orchestrator.run_drs(cluster_id, true).await?;
    let plan = match outcome.plan_id() {
        Some(plan_id) => Some(orchestrator.store().find_plan(plan_id).await?),
        None => None,
    };

    let status = match (&plan, execute) {
        (Some(plan), true) if !plan.migrations.is_empty() => {
            Some(orchestrator.execute_plan(plan.id).await?)
        }
        _ => None,
    };

    if json {
        let plan = match outcome.plan_id() {
            Some(plan_id) => Some(orchestrator.store().find_plan(plan_id).await?),
            None => None,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "outcome": outcome,
                "plan": plan,
            }))?
        );
        return Ok(());
    }

    match &outcome {
        DrsOutcome::Planned { plan_id, migrations } => {
            println!("{} plan {} with {} migration(s)", "✓".green(), plan_id, migrations);
        }
        DrsOutcome::Cooldown { last_run } => {
            println!("{} cluster in cooldown since {}", "!".yellow(), last_run);
        }
        DrsOutcome::Disabled => println!("{} DRS disabled", "!".yellow()),
    }
    if let Some(plan) = &plan {
        for m in &plan.migrations {
            let vm = orchestrator.vm(m.vm_id).await?;
            println!("  {} host {} -> host {}", vm.name.bold(), m.source_host_id, m.dest_host_id);
        }
    }
    if let Some(status) = status {
        println!("Plan finished: {:?}", status);
        print_loads(simulation, cluster_id, metric, "After").await?;
    }
    Ok(())
}

async fn print_loads(
    simulation: &Simulation,
    cluster_id: ClusterId,
    metric: ResourceType,
    label: &str,
) -> Result<()> {
    let orchestrator = &simulation.orchestrator;
    let loads = cluster_loads(
        orchestrator.store().as_ref(),
        orchestrator.ledger(),
        cluster_id,
        metric,
    )
    .await?;
    println!("{} ({} load):", label.bold(), metric);
    for (host_id, load) in loads {
        println!("  host {:>3}  {:>5.1}%", host_id, load * 100.0);
    }
    Ok(())
}

async fn print_capacity(simulation: &Simulation, json: bool) -> Result<()> {
    let ledger = simulation.orchestrator.ledger();
    let mut records = Vec::new();
    for host_id in ledger.hosts().await {
        records.extend(ledger.host_records(host_id).await);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("{}", "Capacity:".bold());
    for r in records {
        let line = format!(
            "  host {:>3} {:<6} total {:>8} used {:>8} reserved {:>8}",
            r.host_id,
            r.resource_type.to_string(),
            r.total,
            r.used,
            r.reserved
        );
        if r.used + r.reserved > r.total {
            println!("{}", line.red());
        } else {
            println!("{}", line);
        }
    }
    Ok(())
}

async fn print_vms(simulation: &Simulation, json: bool) -> Result<()> {
    let mut vms = simulation.orchestrator.store().list_vms(&|_| true).await?;
    vms.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        println!("{}", serde_json::to_string_pretty(&vms)?);
        return Ok(());
    }

    println!("{}", "Virtual Machines:".bold());
    for vm in vms {
        let state = match vm.state {
            VmState::Running => format!("{:?}", vm.state).green(),
            VmState::Stopped | VmState::Destroyed => format!("{:?}", vm.state).red(),
            _ => format!("{:?}", vm.state).yellow(),
        };
        let host = vm
            .host_id
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("- {} ({}) host {}", vm.name, state, host);
    }
    Ok(())
}

fn handle_init_command(config_dir: PathBuf, force: bool) -> Result<()> {
    let path = config_dir.join("default.toml");
    if path.exists() && !force {
        warn!("{} already exists. Use --force to overwrite.", path.display());
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;
    std::fs::write(&path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("{} Default configuration written to {}", "✓".green(), path.display());
    Ok(())
}
