// meshgrid: operator CLI
//
// Runs probes into a local store, inspects persisted proxies and probe
// schedules, and exercises replication in a self-test.

mod config;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use meshgrid_core::probe::adapter::json_value;
use meshgrid_core::probe::MemoryProbe;
use meshgrid_core::proxy::ExternalizedProxy;
use meshgrid_core::{
    AccessPath, MeshBase, MeshBaseId, MeshContext, MeshGrid, MeshObject, MeshObjectId, ProbeDirectory,
    ProbeOutput, ProbeUpdateSpecification, PropertyValue, SledStorage, UpdateOutcome,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshgrid")]
#[command(about = "meshgrid: replicated mesh objects fed by probes", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs and listings as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the probe for a data source and print what it produced
    Probe {
        source: String,
        /// one-time, periodic:<ms> or adaptive[:<current>:<max>:<fallback>:<factor>]
        #[arg(short, long)]
        coherence: Option<String>,
    },
    /// List persisted probe schedules
    Schedules,
    /// List persisted proxy records
    Proxies,
    /// Keep running scheduled probes
    Serve {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long = "for")]
        duration: Option<u64>,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Replicate a shadow between two in-process mesh bases
    Selftest,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(config.mesh.log_level.as_deref().unwrap_or("warn"))
    });
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Probe { source, coherence } => cmd_probe(&config, &source, coherence, cli.json).await,
        Commands::Schedules => cmd_schedules(&config, cli.json),
        Commands::Proxies => cmd_proxies(&config, cli.json),
        Commands::Serve { duration } => cmd_serve(&config, duration).await,
        Commands::Config { action } => cmd_config(config, action),
        Commands::Selftest => cmd_selftest().await,
    }
}

fn open_store(config: &config::Config) -> Result<SledStorage> {
    let path = config.storage_path()?;
    SledStorage::open(&path).with_context(|| format!("Failed to open store at {}", path))
}

fn format_timestamp(ms: Option<u64>) -> String {
    match ms.and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single()) {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "-".to_string(),
    }
}

fn object_json(object: &MeshObject) -> serde_json::Value {
    let properties: serde_json::Map<String, serde_json::Value> = object
        .properties
        .iter()
        .map(|(name, value)| (name.clone(), json_value(value)))
        .collect();
    serde_json::json!({
        "id": object.identifier.to_string(),
        "properties": properties,
    })
}

fn print_objects(mesh_base: &MeshBase, json: bool) {
    let mut ids = mesh_base.replica_ids();
    ids.sort();
    let objects: Vec<MeshObject> = ids.iter().filter_map(|id| mesh_base.get(id)).collect();

    if json {
        let listing: Vec<serde_json::Value> = objects.iter().map(object_json).collect();
        println!("{}", serde_json::Value::Array(listing));
        return;
    }

    println!("{} ({} objects)", mesh_base.id().to_string().bold(), objects.len());
    for object in objects {
        let name = if object.identifier.is_home_object() {
            "(home)".to_string()
        } else {
            object.identifier.local.clone()
        };
        println!("  {} {}", "•".bright_green(), name.bright_cyan());
        for (property, value) in &object.properties {
            println!("    {:<20} {}", property, value);
        }
    }
}

async fn cmd_probe(config: &config::Config, source: &str, coherence: Option<String>, json: bool) -> Result<()> {
    let source = MeshBaseId::new(source).context("Invalid data source")?;
    let coherence = coherence.as_deref().map(config::parse_coherence).transpose()?;

    let grid = MeshGrid::new(config.resolved()?)?;
    grid.start()?;
    let result = grid.probes().obtain_shadow(&source, coherence).await;
    match result {
        Ok(shadow) => {
            print_objects(&shadow, json);
            if !json {
                if let Some(schedule) = grid.probes().schedule(&source) {
                    println!();
                    println!(
                        "  Run {} finished, next run: {}",
                        schedule.probe_run_counter,
                        format_timestamp(schedule.next_probe_run)
                    );
                }
            }
            grid.shutdown().await;
            Ok(())
        }
        Err(e) => {
            grid.shutdown().await;
            Err(e).with_context(|| format!("Probe of {} failed", source))
        }
    }
}

fn cmd_schedules(config: &config::Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let schedules = ProbeUpdateSpecification::load_all(&store)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&schedules)?);
        return Ok(());
    }
    if schedules.is_empty() {
        println!("{}", "No probe schedules.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Probe schedules".bold(), schedules.len());
    println!();
    for schedule in schedules {
        let status = if schedule.last_run_successful {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("  {} {}", status, schedule.shadow.to_string().bright_cyan());
        println!("    Coherence: {}", schedule.coherence);
        println!("    Runs:      {}", schedule.probe_run_counter);
        println!("    Last run:  {}", format_timestamp(schedule.last_probe_run));
        println!(
            "    Next run:  {}",
            if schedule.stopped {
                "stopped".to_string()
            } else {
                format_timestamp(schedule.next_probe_run)
            }
        );
        if let Some(probe) = &schedule.last_probe_name {
            println!("    Probe:     {}", probe);
        }
        if let Some(error) = &schedule.last_error {
            println!("    Error:     {}", error.bright_red());
        }
    }
    Ok(())
}

fn cmd_proxies(config: &config::Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let proxies = ExternalizedProxy::load_all(&store)?;

    if json {
        let listing: Vec<serde_json::Value> = proxies
            .iter()
            .map(|p| {
                serde_json::json!({
                    "own": p.own.to_string(),
                    "partner": p.partner.to_string(),
                    "policy": p.policy,
                    "last_sent_token": p.endpoint.last_sent_token,
                    "last_received_token": p.endpoint.last_received_token,
                    "unacknowledged": p.endpoint.unacknowledged.len(),
                    "pending": p.endpoint.pending.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    if proxies.is_empty() {
        println!("{}", "No saved proxies.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Proxies".bold(), proxies.len());
    println!();
    for proxy in proxies {
        println!(
            "  {} {} -> {}",
            "•".bright_green(),
            proxy.own.to_string().bright_cyan(),
            proxy.partner.to_string().bright_cyan()
        );
        println!("    Policy:  {}", proxy.policy);
        println!(
            "    Tokens:  sent {}, received {}",
            proxy.endpoint.last_sent_token, proxy.endpoint.last_received_token
        );
        println!(
            "    Queues:  {} unacknowledged, {} pending",
            proxy.endpoint.unacknowledged.len(),
            proxy.endpoint.pending.len()
        );
        println!("    Updated: {}", format_timestamp(Some(proxy.time_updated)));
    }
    Ok(())
}

async fn cmd_serve(config: &config::Config, duration: Option<u64>) -> Result<()> {
    let grid = MeshGrid::new(config.resolved()?)?;
    let restored = grid.start()?;
    println!("{} Serving {} probe schedules", "✓".green(), restored);

    match duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            println!("  Press {} to stop", "Ctrl-C".bright_yellow());
            tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
        }
    }

    let invocations = grid.probes().probe_invocations();
    grid.shutdown().await;
    println!("{} Stopped after {} probe runs", "✓".green(), invocations);
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!("  {}", config.path().display().to_string().dimmed());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
    }
    Ok(())
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn integer(mesh_base: &MeshBase, object: &MeshObjectId) -> Option<i64> {
    match mesh_base.get(object)?.property("n") {
        Some(PropertyValue::Integer(n)) => Some(*n),
        _ => None,
    }
}

async fn cmd_selftest() -> Result<()> {
    println!("{}", "Running self-test...".bold());
    println!();

    let source = MeshBaseId::new("memory:selftest")?;
    let probe = Arc::new(MemoryProbe::new(
        ProbeOutput::default().object("entry", [("n", PropertyValue::Integer(1))]),
    ));
    let mut probes = ProbeDirectory::builtin();
    probes.register_id(source.clone(), probe.clone());

    let ctx = MeshContext::local(meshgrid_core::MeshConfig::default())?.with_probes(probes);
    let grid = MeshGrid::with_context(ctx);
    grid.start()?;

    let a = grid.mesh_base(&MeshBaseId::new("local:a")?)?;
    let b = grid.mesh_base(&MeshBaseId::new("local:b")?)?;
    let entry = MeshObjectId::new(source.clone(), "entry");
    let path = AccessPath::to_object(source.clone(), entry.clone());

    let (from_a, from_b) = tokio::join!(
        a.access_locally(&path, None, None),
        b.access_locally(&path, None, None)
    );
    from_a.context("local:a could not reach the shadow")?;
    from_b.context("local:b could not reach the shadow")?;
    println!(
        "  {} Both mesh bases replicated {} ({} probe run)",
        "✓".green(),
        entry,
        grid.probes().probe_invocations()
    );

    probe.set_output(ProbeOutput::default().object("entry", [("n", PropertyValue::Integer(2))]));
    let outcome = grid.probes().do_update_now(&source).await?;
    if outcome != UpdateOutcome::Changed {
        anyhow::bail!("Source change was not detected: {:?}", outcome);
    }
    if !wait_for(|| integer(&a, &entry) == Some(2) && integer(&b, &entry) == Some(2)).await {
        anyhow::bail!("Source change did not reach both replicas");
    }
    println!("  {} Source change reached both replicas", "✓".green());

    let item = b.execute(|tx| tx.create_object("item")).await?;
    a.access_locally(&AccessPath::to_object(b.id().clone(), item.clone()), None, None)
        .await?;
    a.obtain_lock(&[item.clone()], None).await?;
    a.execute(|tx| tx.set_property(&item, "n", 3i64)).await?;
    if !wait_for(|| integer(&b, &item) == Some(3)).await {
        anyhow::bail!("Write by the lock holder did not reach the home replica");
    }
    println!("  {} Lock moved to local:a and its write reached local:b", "✓".green());

    grid.shutdown().await;
    println!();
    println!("{}", "All checks passed.".green().bold());
    Ok(())
}
