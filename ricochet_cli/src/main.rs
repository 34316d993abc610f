mod catalog;

use ricochet_core::config::{CoordinatorKind, LoggingConfig, RicochetConfig};
use ricochet_core::coordinator::{Coordinator, LocalCoordinator};
use ricochet_core::remote::RemoteCoordinator;
use ricochet_core::schema::Schema;
use ricochet_core::sequence::SequenceCodec;
use ricochet_core::session::SessionHandshake;
use ricochet_core::target::Target;
use ricochet_core::template::RandomFieldMutator;
use ricochet_core::worker::{WorkerLoop, WorkerSettings};

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Pull work from a remote coordinator instead of the local index space.
    #[clap(long, env = "MASTER_URI")]
    coordinator_uri: Option<String>,
    #[clap(short, long)]
    iterations: Option<u32>,
    #[clap(long)]
    max_depth: Option<u32>,
    #[clap(long)]
    seed: Option<u64>,
    /// Stop once the index space is drained.
    #[clap(long)]
    exit_when_drained: bool,
    #[clap(long)]
    log_json: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load_config(cli: &Cli) -> Result<RicochetConfig, anyhow::Error> {
    let path = match &cli.config_file {
        Some(path) => path.clone(),
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if !default_config_path.exists() {
                return Err(anyhow::anyhow!(
                    "No config file specified and default 'config.toml' not found; \
                     a [target] section is required"
                ));
            }
            default_config_path
        }
    };
    let mut config = RicochetConfig::load_from_file(&path)?;

    if let Some(uri) = &cli.coordinator_uri {
        config.coordinator.kind = CoordinatorKind::Remote;
        config.coordinator.uri = Some(uri.clone());
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.iterations_per_case = iterations;
    }
    if let Some(depth) = cli.max_depth {
        config.fuzzer.max_depth = depth;
    }
    if cli.seed.is_some() {
        config.fuzzer.seed = cli.seed;
    }
    if cli.exit_when_drained {
        config.fuzzer.exit_when_drained = true;
    }
    if cli.log_json {
        config.logging.json = true;
    }
    Ok(config)
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn run_worker<C: Coordinator>(
    coordinator: C,
    config: &RicochetConfig,
    schema: Arc<Schema>,
    codec: SequenceCodec,
) -> Result<(), anyhow::Error> {
    use ricochet_core::ptrace::PtraceDebugger;
    use ricochet_core::target::TargetProcess;

    let mut target = TargetProcess::new(PtraceDebugger::new(), config.target.settings(), schema);
    if let Some(handshake) = &config.target.handshake {
        target = target.with_handshake(SessionHandshake::from_settings(handshake)?);
    }

    let seed = config.fuzzer.seed.unwrap_or_else(time_seed);
    info!(seed, "Seeding field mutator");
    let settings = WorkerSettings {
        idle: Duration::from_millis(config.fuzzer.idle_ms),
        exit_when_drained: config.fuzzer.exit_when_drained,
    };

    let mut worker =
        WorkerLoop::new(coordinator, target, codec, RandomFieldMutator::new(), seed, settings);
    let stats = match worker.run() {
        Ok(stats) => stats,
        Err(e) => {
            if let Err(stop) = worker.target_mut().stop() {
                warn!(error = %stop, "Failed to stop target after worker error");
            }
            return Err(e.into());
        }
    };
    info!(
        ranges = stats.ranges,
        cases = stats.cases_completed,
        iterations = stats.iterations,
        crashes = stats.crashes,
        unique = stats.unique_crashes,
        restarts = stats.restarts,
        "Fuzzing finished"
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_worker<C: Coordinator>(
    _coordinator: C,
    _config: &RicochetConfig,
    _schema: Arc<Schema>,
    _codec: SequenceCodec,
) -> Result<(), anyhow::Error> {
    Err(anyhow::anyhow!("Process monitoring is only supported on Linux"))
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.logging);
    info!(?config, "Effective configuration");

    let schema = match &config.schema {
        Some(path) => Schema::load_from_file(path)?,
        None => catalog::goldsrc_schema(),
    };
    info!(messages = schema.len(), "Message catalog loaded");

    let templates = config.templates.clone().unwrap_or_else(catalog::default_alphabet);
    let total = config.validate(templates.len())?;
    let codec = SequenceCodec::new(templates, config.fuzzer.max_depth);
    info!(
        message_types = codec.message_types(),
        max_depth = codec.max_depth(),
        total,
        "Sequence space ready"
    );

    let schema = Arc::new(schema);
    match config.coordinator.kind {
        CoordinatorKind::Local => {
            let mut coordinator = LocalCoordinator::new(
                total,
                config.coordinator.batch_width,
                config.fuzzer.iterations_per_case,
            );
            if let Some(dir) = &config.coordinator.crash_dir {
                coordinator = coordinator.with_crash_dir(dir);
            }
            run_worker(coordinator, &config, schema, codec)
        }
        CoordinatorKind::Remote => {
            let uri = config
                .coordinator
                .uri
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Remote coordinator requires a uri"))?;
            let coordinator = RemoteCoordinator::new(
                uri,
                Duration::from_millis(config.coordinator.request_timeout_ms),
            )?;
            run_worker(coordinator, &config, schema, codec)
        }
    }
}
