//! Operant daemon - runs one subject's experiment until it ends or Ctrl-C.
//!
//! ```text
//! operantd [config.json] [--data-dir DIR]
//! ```
//!
//! Without a config path, `config.json` in the data directory is used.
//! Trial records, the event log and the running summary are written under
//! the data directory, one folder per subject:
//! - Linux: ~/.local/share/operant/<subject>/
//! - Windows: %APPDATA%\operant\<subject>\
//! - MacOS: ~/Library/Application Support/operant/<subject>/

use std::path::PathBuf;
use std::sync::Arc;

use operant::blocks::BlockHandler;
use operant::clock::{CancelToken, Clock, SystemClock};
use operant::components::Rig;
use operant::error::ConfigError;
use operant::events::{EventBus, LogFileHandler, TracingHandler};
use operant::panel::StandardPanel;
use operant::sim::{RandomResponder, SimInterface};
use operant::store::JsonLinesStore;
use operant::{
    Behavior, ChoiceBehavior, Experiment, ExperimentConfig, ShapingBehavior, ShapingOptions,
    ShapingStage, WaitForStimulusBehavior,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod paths;

use paths::AppPaths;

#[derive(Debug, Error)]
enum DaemonError {
    #[error("usage: operantd [config.json] [--data-dir DIR]")]
    Usage,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] operant::Error),
    #[error("{0}")]
    Paths(String),
    #[error("experiment thread panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BehaviorKind {
    #[default]
    Choice,
    WaitForStimulus,
    Shaping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShapingConfig {
    #[serde(default)]
    start: ShapingStage,
    #[serde(default = "default_trials_per_stage")]
    trials_per_stage: u32,
    #[serde(default = "default_center")]
    center: String,
}

fn default_trials_per_stage() -> u32 {
    100
}

fn default_center() -> String {
    "center".into()
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            start: ShapingStage::default(),
            trials_per_stage: default_trials_per_stage(),
            center: default_center(),
        }
    }
}

/// Simulated subject answering on the simulated panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimulationConfig {
    #[serde(default = "default_accuracy")]
    accuracy: f64,
    #[serde(default = "default_response_rate")]
    response_rate: f64,
}

fn default_accuracy() -> f64 {
    0.8
}

fn default_response_rate() -> f64 {
    0.9
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            accuracy: default_accuracy(),
            response_rate: default_response_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DaemonConfig {
    #[serde(flatten)]
    experiment: ExperimentConfig,
    #[serde(default)]
    behavior: BehaviorKind,
    #[serde(default)]
    shaping: ShapingConfig,
    #[serde(default)]
    simulation: SimulationConfig,
}

impl DaemonConfig {
    fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.experiment.validate()?;
        if config.behavior == BehaviorKind::Shaping {
            let shaping = &config.shaping;
            if !config.experiment.panel.ports.iter().any(|p| p.class == shaping.center) {
                return Err(ConfigError::invalid(
                    "shaping.center",
                    format!("no response port for class {:?}", shaping.center),
                ));
            }
            if shaping.trials_per_stage == 0 {
                return Err(ConfigError::invalid("shaping.trials_per_stage", "must be at least 1"));
            }
        }
        Ok(config)
    }
}

struct Args {
    config: PathBuf,
    data_dir: Option<PathBuf>,
}

fn parse_args() -> Result<Args, DaemonError> {
    let mut config = None;
    let mut data_dir = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => data_dir = Some(args.next().ok_or(DaemonError::Usage)?.into()),
            "-h" | "--help" => return Err(DaemonError::Usage),
            _ if config.is_none() => config = Some(PathBuf::from(arg)),
            _ => return Err(DaemonError::Usage),
        }
    }
    let config = match config {
        Some(config) => config,
        None => data_dir
            .clone()
            .map_or_else(AppPaths::default_root, Ok)
            .map_err(DaemonError::Paths)?
            .join("config.json"),
    };
    Ok(Args { config, data_dir })
}

fn build(config: &DaemonConfig, paths: &AppPaths, cancel: CancelToken) -> Result<Experiment, DaemonError> {
    let exp = &config.experiment;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let events = EventBus::builder(clock.clone())
        .handler(LogFileHandler::append(&paths.events_file())?)
        .handler(TracingHandler)
        .build()?;
    let rig = Rig::new(clock.clone(), cancel, events);

    let ports = exp
        .panel
        .ports
        .iter()
        .map(|p| (p.class.clone(), p.ir))
        .collect();
    let mut responder = RandomResponder::new(ports, exp.seed);
    responder.accuracy = config.simulation.accuracy;
    responder.response_rate = config.simulation.response_rate;
    let sim = SimInterface::new(clock).with_responder(responder);
    if let Some(ir) = exp.panel.hopper_ir {
        sim.link(exp.panel.hopper_solenoid, ir);
    }
    let panel = StandardPanel::new(Arc::new(sim), &exp.panel, rig.clone());

    let behavior: Box<dyn Behavior> = match config.behavior {
        BehaviorKind::Choice => Box::new(ChoiceBehavior),
        BehaviorKind::WaitForStimulus => Box::new(WaitForStimulusBehavior),
        BehaviorKind::Shaping => Box::new(ShapingBehavior::new(ShapingOptions {
            center: config.shaping.center.clone(),
            start: config.shaping.start,
            trials_per_stage: config.shaping.trials_per_stage,
            seed: exp.seed,
            ..ShapingOptions::default()
        })),
    };

    let blocks = BlockHandler::new(exp.block_factories(), exp.block_order, exp.seed)?;
    let first_index = JsonLinesStore::next_index(&paths.trials_file()).map_err(operant::Error::from)?;
    let store = JsonLinesStore::open(paths.trials_file()).map_err(operant::Error::from)?;

    Ok(Experiment::new(
        Box::new(panel),
        behavior,
        blocks,
        Box::new(store),
        rig,
    )
    .with_options(exp.experiment_options())
    .with_session_schedulers(exp.session_schedulers()?)
    .with_sleep_schedulers(exp.sleep_schedulers()?)
    .with_summary_path(paths.summary_file())
    .with_first_trial_index(first_index))
}

async fn run() -> Result<(), DaemonError> {
    let args = parse_args()?;
    let config = DaemonConfig::load(&args.config)?;
    let paths = AppPaths::new(args.data_dir.as_deref(), &config.experiment.subject)
        .map_err(DaemonError::Paths)?;
    info!(subject = %config.experiment.subject, "Data directory: {:?}", paths.data_dir());

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C: ending experiment");
                cancel.cancel();
            }
        });
    }

    let mut experiment = build(&config, &paths, cancel)?;
    // The runtime blocks on hardware polling; keep it off the async workers.
    let finished = tokio::task::spawn_blocking(move || {
        let result = experiment.run();
        (result, experiment.summary().trials)
    })
    .await?;
    let (result, trials) = finished;
    info!(trials, "experiment finished");
    Ok(result?)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(match e {
            DaemonError::Usage | DaemonError::Config(_) => 2,
            _ => 1,
        });
    }
}
