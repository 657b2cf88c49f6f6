use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use quake_depth::{
    config::Config,
    ml::{
        ArtifactStore, DepthPrediction, FeatureSchema, HistoricalDataset, InferenceContext,
        RawInputs, SequenceOutcome, TrainingPipeline,
    },
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "quake-depth")]
#[command(version, about = "Earthquake depth-class inference and training", long_about = None)]
struct Cli {
    /// Configuration override file
    #[arg(short, long, env = "QUAKE_DEPTH_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact directory (overrides configuration)
    #[arg(short, long)]
    artifacts: Option<PathBuf>,

    /// Print Prometheus metrics after the command finishes
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the classifiers and write the artifact set
    Train {
        /// Historical catalog CSV (overrides configuration)
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        /// Skip the sequence model
        #[arg(long)]
        no_sequence: bool,
    },

    /// Classify one event
    Predict {
        /// Feature value, e.g. --set mag=5.4 (repeatable)
        #[arg(short = 's', long = "set", value_name = "NAME=VALUE")]
        values: Vec<String>,

        /// JSON object of feature name to value
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the manifest of the artifact set
    Inspect {
        #[arg(long)]
        json: bool,
    },

    /// Summary statistics of a historical catalog
    Describe {
        /// Catalog CSV (defaults to the training dataset)
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from(Some(path)),
        None => Config::load(),
    };
    let mut config = config.context("loading configuration")?;
    if let Some(dir) = &cli.artifacts {
        config.artifacts.dir = dir.clone();
    }

    init_tracing(&config);

    if config.observability.prometheus_enabled {
        if let Err(e) = quake_depth::metrics::init_metrics() {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    match cli.command {
        Commands::Train {
            dataset,
            no_sequence,
        } => {
            let mut training = config.training.clone();
            if let Some(path) = dataset {
                training.dataset_path = path;
            }
            if no_sequence {
                training.sequence.enabled = false;
            }

            tracing::info!(
                dataset = %training.dataset_path.display(),
                artifacts = %config.artifacts.dir.display(),
                "Starting training run"
            );
            let pipeline = TrainingPipeline::new(training, FeatureSchema::canonical())?;
            let report = pipeline
                .run(&ArtifactStore::new(&config.artifacts.dir))
                .context("training failed")?;
            println!("{}", report);
        }

        Commands::Predict {
            values,
            input,
            json,
        } => {
            let raw = parse_inputs(&values, input.as_deref())?;
            let context = InferenceContext::load(&config.artifacts).with_context(|| {
                format!("loading artifacts from {}", config.artifacts.dir.display())
            })?;
            let prediction = context.predict(&raw)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&prediction)?);
            } else {
                print_prediction(&prediction);
            }
        }

        Commands::Inspect { json } => {
            let store = ArtifactStore::new(&config.artifacts.dir);
            let manifest = store.load_manifest()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                println!("artifact set: {}", manifest.id);
                println!("created:      {}", manifest.created_at.to_rfc3339());
                println!("version:      {}", manifest.crate_version);
                println!("schema:       {}", manifest.schema.fingerprint());
                println!("ensemble:     {:?}", manifest.ensemble_capability);
                println!("sequence:     {}", manifest.has_sequence_model());
                for model in &manifest.models {
                    println!("\n=== {} ({}) ===", model.name, model.model_type);
                    println!(
                        "trained {} on {} samples x {} features",
                        model.trained_at.to_rfc3339(),
                        model.n_training_samples,
                        model.n_features
                    );
                    println!("{}", model.test_metrics);
                }
            }
        }

        Commands::Describe { dataset, json } => {
            let path = dataset.unwrap_or_else(|| config.training.dataset_path.clone());
            let summary = HistoricalDataset::from_csv(&path)?.summary();
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary);
            }
        }
    }

    if cli.print_metrics {
        print!("{}", quake_depth::metrics::gather_metrics());
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("quake_depth={}", config.observability.log_level).into());

    // stdout carries command output
    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn parse_inputs(values: &[String], input: Option<&std::path::Path>) -> anyhow::Result<RawInputs> {
    let mut pairs: BTreeMap<String, f64> = match input {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => BTreeMap::new(),
    };

    for value in values {
        let Some((name, number)) = value.split_once('=') else {
            bail!("expected NAME=VALUE, got '{}'", value);
        };
        let number: f64 = number
            .trim()
            .parse()
            .with_context(|| format!("invalid number for '{}'", name))?;
        pairs.insert(name.trim().to_string(), number);
    }

    Ok(RawInputs::try_from(pairs)?)
}

fn print_prediction(prediction: &DepthPrediction) {
    println!("schema: {}", prediction.schema);
    println!("\ngradient boosting: {}", prediction.primary.class);
    if let Some(p) = &prediction.primary.probabilities {
        print_probabilities(&p.percentages());
    }

    match &prediction.sequence {
        SequenceOutcome::Predicted { output } => {
            println!("\nsequence model:    {}", output.class);
            if let Some(p) = &output.probabilities {
                print_probabilities(&p.percentages());
            }
        }
        SequenceOutcome::Unavailable { reason } => {
            println!("\nsequence model:    unavailable ({})", reason);
        }
    }
}

fn print_probabilities(percentages: &[f64; 3]) {
    use quake_depth::ml::DepthClass;
    use strum::IntoEnumIterator;

    for (class, pct) in DepthClass::iter().zip(percentages) {
        println!("  {:<26} {:>6.2}%", class.to_string(), pct);
    }
}
