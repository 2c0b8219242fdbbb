mod script;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use rem_core::sim::SimulatedPlatform;
use rem_core::time::secs_to_millis;
use rem_core::{
    ActivityMode, AuthorizationState, Clock, Collaborators, Coordinate, EngineConfig,
    LocationEngine, LocationUpdatePolicy, Memory, NotificationPresenter, RegionRequest,
    SystemClock, unix_millis_to_iso8601,
};
use rem_store::{CONFIG_FILE, DB_FILE, Store};

#[derive(Parser)]
#[command(name = "rem", about = "Reminiscence geofence engine CLI")]
struct Cli {
    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a memory at a coordinate and start monitoring its region
    Remember {
        /// Short title shown in the notification
        title: String,

        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Geofence radius in meters
        #[arg(long)]
        radius: Option<f64>,

        #[arg(long, default_value = "")]
        note: String,

        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,

        /// Stop monitoring after this many seconds
        #[arg(long)]
        expires_in: Option<u64>,
    },

    /// Delete a memory, its visits and its region
    Forget { id: String },

    /// List persisted regions
    Regions {
        #[arg(long)]
        json: bool,
    },

    /// List recorded visits, newest first
    Visits {
        /// Only visits tagged with this memory
        #[arg(long)]
        memory: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Replay a JSON script of platform callbacks, printing engine events
    Replay {
        script: PathBuf,

        /// Seed for `walk` jitter
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },

    /// Show the update configuration the policy picks
    Policy {
        /// Apply battery optimization
        #[arg(long)]
        battery: bool,
    },

    /// Show store statistics
    Stats,
}

/// Notification presenter for a headless process: logs instead of alerting.
pub(crate) struct LogPresenter;

impl NotificationPresenter for LogPresenter {
    fn present(&mut self, title: &str, body: &str) {
        tracing::info!("notification: {title}: {body}");
    }
}

fn data_dir() -> PathBuf {
    rem_store::default_base_dir()
}

fn load_config(cli: &Cli, base: &Path) -> Result<EngineConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| base.join(CONFIG_FILE));
    rem_store::load_config(&path).context("failed to load config")
}

fn open_store(base: &Path) -> Result<Store> {
    std::fs::create_dir_all(base)
        .with_context(|| format!("failed to create {}", base.display()))?;
    Store::open(&base.join(DB_FILE)).context("failed to open store")
}

/// An engine over the on-disk store with a platform that still monitors
/// every persisted region, as the OS would across launches.
fn headless_engine(base: &Path, config: &EngineConfig) -> Result<LocationEngine> {
    let store = open_store(base)?;
    let platform = SimulatedPlatform::new();
    for region in store.get_regions().context("failed to load regions")? {
        platform.preload_monitored(region);
    }

    let mut engine = LocationEngine::new(
        config.clone(),
        Collaborators {
            provider: Box::new(platform),
            storage: Box::new(store),
            presenter: Box::new(LogPresenter),
            clock: Arc::new(SystemClock),
        },
    );
    engine.start();
    Ok(engine)
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Remember {
            title,
            lat,
            lon,
            radius,
            note,
            id,
            expires_in,
        } => cmd_remember(
            &cli,
            title,
            Coordinate::new(*lat, *lon),
            *radius,
            note,
            id.as_deref(),
            *expires_in,
        ),
        Commands::Forget { id } => cmd_forget(&cli, id),
        Commands::Regions { json } => cmd_regions(*json),
        Commands::Visits { memory, limit } => cmd_visits(memory.as_deref(), *limit),
        Commands::Replay { script, seed } => cmd_replay(&cli, script, *seed).await,
        Commands::Policy { battery } => cmd_policy(&cli, *battery),
        Commands::Stats => cmd_stats(&cli),
    }
}

fn cmd_remember(
    cli: &Cli,
    title: &str,
    coordinate: Coordinate,
    radius: Option<f64>,
    note: &str,
    id: Option<&str>,
    expires_in: Option<u64>,
) -> Result<()> {
    if !coordinate.is_valid() {
        bail!("coordinate {coordinate} is out of range");
    }
    let base = data_dir();
    let config = load_config(cli, &base)?;
    let store = open_store(&base)?;
    let now = SystemClock.now();
    let radius = radius.unwrap_or(config.default_radius_meters);

    let memory = match id {
        Some(id) => {
            let memory = Memory {
                id: id.to_string(),
                title: title.to_string(),
                note: note.to_string(),
                coordinate,
                radius_meters: radius,
                created_at: now,
            };
            store
                .insert_memory(&memory)
                .with_context(|| format!("failed to save memory '{id}'"))?;
            memory
        }
        None => store
            .create_memory(title, note, coordinate, radius, now)
            .context("failed to save memory")?,
    };

    let before: Vec<String> = store
        .get_regions()
        .context("failed to load regions")?
        .into_iter()
        .map(|r| r.id)
        .collect();

    let mut engine = headless_engine(&base, &config)?;
    let expires_at = expires_in.map(|s| now + secs_to_millis(s));
    if let Err(e) = engine.register_region(
        RegionRequest::new(memory.id.clone(), coordinate, radius),
        expires_at,
    ) {
        store
            .remove_memory(&memory.id)
            .context("failed to roll back memory")?;
        bail!("could not monitor '{}': {e}", memory.id);
    }

    println!(
        "remembered {} '{}' at {} r={}m",
        memory.id, memory.title, coordinate, radius
    );
    for gone in before.iter().filter(|id| !engine.registry().contains(id)) {
        println!("evicted region {gone}");
    }
    Ok(())
}

fn cmd_forget(cli: &Cli, id: &str) -> Result<()> {
    let base = data_dir();
    let config = load_config(cli, &base)?;
    let store = open_store(&base)?;
    let known = store.get_memory(id).context("failed to look up memory")?;

    let mut engine = headless_engine(&base, &config)?;
    let had_region = engine.delete_memory(id);

    if known.is_none() && !had_region {
        bail!("no memory with id '{id}'");
    }
    println!("forgot {id}");
    Ok(())
}

fn cmd_regions(json: bool) -> Result<()> {
    let store = open_store(&data_dir())?;
    let regions = store.get_regions().context("failed to load regions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&regions)?);
        return Ok(());
    }
    if regions.is_empty() {
        println!("(no regions)");
        return Ok(());
    }
    for r in &regions {
        let title = store
            .get_memory(&r.id)?
            .map(|m| m.title)
            .unwrap_or_default();
        let expires = r
            .expires_at
            .map(unix_millis_to_iso8601)
            .unwrap_or_else(|| "never".to_string());
        let visited = r
            .last_visited_at
            .map(unix_millis_to_iso8601)
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {:<20} {} r={}m created={} expires={} visited={}",
            r.id,
            title,
            r.center,
            r.radius_meters,
            unix_millis_to_iso8601(r.created_at),
            expires,
            visited
        );
    }
    Ok(())
}

fn cmd_visits(memory: Option<&str>, limit: usize) -> Result<()> {
    let store = open_store(&data_dir())?;
    let visits = store
        .visits(memory, limit)
        .context("failed to load visits")?;

    if visits.is_empty() {
        println!("(no visits)");
    }
    for v in &visits {
        println!(
            "{}  {}  {}",
            unix_millis_to_iso8601(v.timestamp),
            v.coordinate,
            v.memory_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_replay(cli: &Cli, path: &Path, seed: u64) -> Result<()> {
    let config = load_config(cli, &data_dir())?;
    let script = script::load_script(path)?;
    let stdout = std::io::stdout();
    let printed = script::Replay::new(&script, config, seed, stdout.lock())?
        .run(&script.steps)
        .await?;
    tracing::info!("replay printed {printed} events");
    Ok(())
}

fn cmd_policy(cli: &Cli, battery: bool) -> Result<()> {
    let config = load_config(cli, &data_dir())?;
    let policy = LocationUpdatePolicy::new(config.policy.clone());

    for auth in [
        AuthorizationState::AuthorizedLimited,
        AuthorizationState::AuthorizedFull,
    ] {
        for mode in ActivityMode::ALL {
            let cfg = policy.select(auth, mode, battery);
            println!(
                "{:<18} {:<10} accuracy={:<6} filter={}m background={} significant={}",
                auth.as_str(),
                mode.as_str(),
                cfg.accuracy.as_str(),
                cfg.distance_filter_meters,
                yes_no(cfg.allow_background),
                yes_no(cfg.significant_changes_only)
            );
        }
    }
    Ok(())
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

fn cmd_stats(cli: &Cli) -> Result<()> {
    let base = data_dir();
    let config = load_config(cli, &base)?;
    let store = open_store(&base)?;
    let stats = store.stats().context("failed to read stats")?;

    println!("data_dir:   {}", base.display());
    println!("memories:   {}", stats.memories);
    println!("visits:     {}", stats.visits);
    println!("regions:    {}/{}", stats.regions, config.region_capacity);
    println!(
        "schema:     v{}",
        stats.schema_version.unwrap_or_default()
    );
    Ok(())
}
