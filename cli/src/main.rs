use anyhow::{bail, Context};
use clap::Parser;
use netgen::{
    config::document::preprocess,
    experiment::{DirectoryStore, ExperimentBuilder, ExperimentId, ExperimentStore},
    graph::{assemble, AssemblyOptions},
    resolve::{Resolver, Topology},
    rng,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod settings;
use settings::{load_settings, Overrides, RunSettings};

/// Resolve, assemble and register randomized future prediction networks.
#[derive(Parser, Debug)]
#[command(name = "netgen", version, about, long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,
    /// Partial architecture (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Seed of the resolution random source
    #[arg(long, global = true)]
    seed: Option<u64>,
    #[arg(long, global = true, value_parser = parse_topology)]
    topology: Option<Topology>,
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the resolved architecture
    Resolve,
    /// Print the assembled graph
    Graph {
        /// Print the graph as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Register an experiment, or check the stored architecture of an existing one
    Register {
        #[command(flatten)]
        experiment: ExperimentArgs,
    },
    /// Print the step records of an experiment
    Steps {
        #[command(flatten)]
        experiment: ExperimentArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ExperimentArgs {
    #[arg(long)]
    database: Option<String>,
    #[arg(long)]
    collection: Option<String>,
    #[arg(short, long)]
    experiment_id: Option<String>,
    /// Root of the experiment record store
    #[arg(long)]
    store_dir: Option<PathBuf>,
    /// Root of the weight checkpoints
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

fn parse_topology(s: &str) -> Result<Topology, String> {
    match s {
        "bypass" => Ok(Topology::Bypass),
        "coupled" => Ok(Topology::Coupled),
        _ => Err(format!(
            "unknown topology {s:?}, expected bypass or coupled"
        )),
    }
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let mut overrides = Overrides {
            seed: self.seed,
            config_file: self.config.clone(),
            topology: self.topology,
            ..Overrides::default()
        };
        if let Command::Register { experiment } | Command::Steps { experiment } = &self.command {
            overrides.database = experiment.database.clone();
            overrides.collection = experiment.collection.clone();
            overrides.experiment_id = experiment.experiment_id.clone();
            overrides.store_dir = experiment.store_dir.clone();
            overrides.save_dir = experiment.save_dir.clone();
        }
        overrides
    }
    fn load_settings(&self) -> anyhow::Result<RunSettings> {
        load_settings(self.settings.as_deref(), &self.overrides()).context("loading settings")
    }
}

fn experiment_id(settings: &RunSettings) -> anyhow::Result<ExperimentId> {
    let Some(experiment_id) = settings.experiment_id.as_ref() else {
        bail!("an experiment id is required (--experiment-id or NETGEN_EXPERIMENT_ID)");
    };
    Ok(ExperimentId::new(
        &settings.database,
        &settings.collection,
        experiment_id,
    ))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = cli.load_settings()?;
    tracing::debug!(?settings, "settings");
    let partial = settings.partial()?;

    match cli.command {
        Command::Resolve => {
            let resolution = Resolver::new(&partial, rng::seeded(settings.seed))
                .input(settings.input)
                .topology(settings.topology)
                .resolve()?;
            print_json(&preprocess(&resolution.config)?)?;
        }
        Command::Graph { json } => {
            let config = Resolver::new(&partial, rng::seeded(settings.seed))
                .input(settings.input)
                .topology(settings.topology)
                .resolve()?
                .config;
            let options = AssemblyOptions {
                loss_multiple: settings.loss_multiple,
            };
            let assembly = assemble(&config, &settings.input, settings.topology, options)?;
            if json {
                print_json(&assembly.graph)?;
            } else {
                print!("{}", assembly.graph);
            }
        }
        Command::Register { .. } => {
            let id = experiment_id(&settings)?;
            let experiment = ExperimentBuilder::new(id)
                .seed(settings.seed)
                .partial(partial)
                .input(settings.input)
                .topology(settings.topology)
                .policy(settings.policy)
                .save_dir(&settings.save_dir)
                .open(DirectoryStore::new(&settings.store_dir))?;
            match experiment.resume_step() {
                Some(step) => tracing::info!(step, start = experiment.start_step(), "resumable"),
                None => tracing::info!("registered"),
            }
            print_json(&preprocess(experiment.config())?)?;
        }
        Command::Steps { .. } => {
            let id = experiment_id(&settings)?;
            let store = DirectoryStore::new(&settings.store_dir);
            let records = store
                .step_records(&id)
                .with_context(|| format!("reading step records of {id}"))?;
            print_json(&records)?;
        }
    }
    Ok(())
}
