//! σ-CW CLI
//!
//! Command-line driver for Carlini-Wagner L2 attacks on classifier
//! ensembles.
//!
//! # Commands
//!
//! - `sigma inspect` - Summarise an ensemble file
//! - `sigma attack` - Attack a data slice and write a JSON report
//! - `sigma sweep` - Attack over a list of confidences and threat models
//! - `sigma uncertainty` - Predictive uncertainty of a data slice

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use sigma_attack::{AttackConfig, CarliniL2};
use sigma_core::label_indices;
use sigma_data::{load_cifar_batches, load_mnist, next_label_targets, Dataset};
use sigma_ensemble::{dropout_replicas, DenseNetwork, Ensemble};
use sigma_eval::{
    evaluate_attack, run_sweep, AttackEvaluation, SweepConfig, SweepRecord, ThreatModel,
    UncertaintyReport,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sigma")]
#[command(about = "Carlini-Wagner L2 attacks against classifier ensembles")]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a summary of an ensemble
    Inspect {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Attack a slice of a dataset and write a JSON report
    Attack {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        threat: ThreatArgs,
        #[command(flatten)]
        overrides: AttackOverrides,
        /// Attack configuration as JSON (defaults to the preset for the model kind)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Margin κ by which the adversarial label must win
        #[arg(long)]
        confidence: Option<f32>,
        /// Attack towards the next class instead of away from the true one
        #[arg(long)]
        targeted: bool,
        /// Report file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Attack once per confidence and threat model
    Sweep {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        data: DataArgs,
        /// Threat models to sweep
        #[arg(long, value_enum, value_delimiter = ',', default_values_t = [ThreatKind::Gray, ThreatKind::White])]
        threats: Vec<ThreatKind>,
        /// Members attacked in white-box mode
        #[arg(long, default_value = "50")]
        members: usize,
        /// Comma-separated confidences (defaults to the standard sweep)
        #[arg(long, value_delimiter = ',')]
        confidences: Option<Vec<f32>>,
        #[command(flatten)]
        overrides: AttackOverrides,
        /// Sweep configuration as JSON
        #[arg(long)]
        config: Option<PathBuf>,
        /// Report file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Predictive uncertainty of a slice of a dataset
    Uncertainty {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        data: DataArgs,
        /// Optional JSON report file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// JSON file with one network or a list of posterior samples
    #[arg(long)]
    models: PathBuf,
    /// Treat the single network as MC dropout with this many fixed-mask replicas
    #[arg(long)]
    dropout_replicas: Option<usize>,
    /// Seed for dropout masks and member selection
    #[arg(long, default_value = "0")]
    seed: u64,
}

#[derive(Args)]
struct DataArgs {
    /// Dataset format
    #[arg(long, value_enum)]
    dataset: DatasetKind,
    /// CIFAR-10 batch files, or the MNIST image file
    #[arg(long, required = true, num_args = 1..)]
    data: Vec<PathBuf>,
    /// MNIST label file
    #[arg(long)]
    labels: Option<PathBuf>,
    /// Number of examples from the start of the data
    #[arg(long, default_value = "20")]
    count: usize,
}

#[derive(Args)]
struct ThreatArgs {
    /// Attacker knowledge
    #[arg(long, value_enum, default_value = "gray")]
    threat: ThreatKind,
    /// Members attacked in white-box mode
    #[arg(long, default_value = "50")]
    members: usize,
}

#[derive(Args)]
struct AttackOverrides {
    /// Examples optimised together
    #[arg(long)]
    batch_size: Option<usize>,
    /// Gradient steps per round
    #[arg(long)]
    max_iterations: Option<usize>,
    /// Rounds of the constant search
    #[arg(long)]
    binary_search_steps: Option<usize>,
    /// Adam step size
    #[arg(long)]
    learning_rate: Option<f32>,
    /// Trade-off constant of the first round
    #[arg(long)]
    initial_const: Option<f64>,
}

impl AttackOverrides {
    fn apply(&self, config: &mut AttackConfig) {
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.max_iterations {
            config.max_iterations = v;
        }
        if let Some(v) = self.binary_search_steps {
            config.binary_search_steps = v;
        }
        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if let Some(v) = self.initial_const {
            config.initial_const = v;
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DatasetKind {
    Cifar10,
    Mnist,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ThreatKind {
    Gray,
    White,
}

impl ThreatKind {
    fn model(self, members: usize) -> ThreatModel {
        match self {
            ThreatKind::Gray => ThreatModel::GrayBox,
            ThreatKind::White => ThreatModel::WhiteBox { members },
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_ensemble(args: &ModelArgs) -> anyhow::Result<Ensemble> {
    let networks = DenseNetwork::load_many(&args.models)
        .with_context(|| format!("failed to load models from {}", args.models.display()))?;
    let ensemble = match args.dropout_replicas {
        Some(count) => {
            let [network] = networks.as_slice() else {
                bail!(
                    "--dropout-replicas needs exactly one network, {} has {}",
                    args.models.display(),
                    networks.len()
                );
            };
            dropout_replicas(network, count, args.seed)?
        }
        None => Ensemble::from_networks(networks)?,
    };
    Ok(ensemble)
}

fn load_data(args: &DataArgs) -> anyhow::Result<Dataset> {
    let dataset = match args.dataset {
        DatasetKind::Cifar10 => load_cifar_batches(&args.data)?,
        DatasetKind::Mnist => {
            let [images] = args.data.as_slice() else {
                bail!("MNIST takes one image file, got {}", args.data.len());
            };
            let Some(labels) = &args.labels else {
                bail!("MNIST needs --labels");
            };
            load_mnist(images, labels)?
        }
    };
    if dataset.is_empty() {
        bail!("dataset is empty");
    }
    let slice = dataset.take(args.count);
    info!("Using {} of {} examples ({})", slice.len(), dataset.len(), slice.shape());
    Ok(slice)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let writer = BufWriter::new(
        File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
    );
    serde_json::to_writer_pretty(writer, value)?;
    info!("Wrote {}", path.display());
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
    );
    serde_json::from_reader(reader).with_context(|| format!("invalid JSON in {}", path.display()))
}

/// Preset matching how the ensemble was built.
fn preset(model: &ModelArgs, threat: ThreatKind) -> AttackConfig {
    match (model.dropout_replicas, threat) {
        (Some(_), ThreatKind::Gray) => AttackConfig::mc_dropout_gray_box(0.0),
        (Some(_), ThreatKind::White) => AttackConfig::mc_dropout_white_box(0.0),
        (None, _) => AttackConfig::bnn(0.0),
    }
}

fn inspect(model: &ModelArgs) -> anyhow::Result<()> {
    let networks = DenseNetwork::load_many(&model.models)
        .with_context(|| format!("failed to load models from {}", model.models.display()))?;
    let ensemble = load_ensemble(model)?;
    println!("Models:        {}", model.models.display());
    println!("Members:       {}", ensemble.len());
    println!("Input shape:   {}", ensemble.input_shape());
    println!("Labels:        {}", ensemble.num_labels());
    if let Some(first) = networks.first() {
        let layers: Vec<&str> = first.layers().iter().map(|l| l.kind()).collect();
        println!("Layers:        {}", layers.join(" -> "));
        println!("Parameters:    {} per network", first.parameter_count());
        println!("Dropout:       {}", if first.has_dropout() { "yes" } else { "no" });
    }
    Ok(())
}

#[derive(Serialize)]
struct ExampleReport {
    index: usize,
    label: usize,
    target: Option<usize>,
    adversarial_label: Option<usize>,
    distortion: Option<f32>,
}

#[derive(Serialize)]
struct AttackReport {
    threat: ThreatModel,
    attacked_members: usize,
    config: AttackConfig,
    success_rate: f32,
    mean_distortion: Option<f32>,
    examples: Vec<ExampleReport>,
    evaluation: AttackEvaluation,
}

#[allow(clippy::too_many_arguments)]
fn attack(
    model: &ModelArgs,
    data: &DataArgs,
    threat: &ThreatArgs,
    overrides: &AttackOverrides,
    config_path: Option<&Path>,
    confidence: Option<f32>,
    targeted: bool,
    output: &Path,
) -> anyhow::Result<()> {
    let ensemble = load_ensemble(model)?;
    let dataset = load_data(data)?;

    let mut config = match config_path {
        Some(path) => read_json(path)?,
        None => preset(model, threat.threat),
    };
    overrides.apply(&mut config);
    if let Some(k) = confidence {
        config.confidence = k;
    }
    if targeted {
        config.targeted = true;
    }

    let targets = if config.targeted {
        Some(next_label_targets(&dataset.labels))
    } else {
        None
    };
    let attack_labels = targets.as_ref().unwrap_or(&dataset.labels);

    let threat_model = threat.threat.model(threat.members);
    let mut rng = StdRng::seed_from_u64(model.seed);
    let target_ensemble = threat_model.select(&ensemble, &mut rng)?;
    info!("{} attack on {} member(s)", threat_model, target_ensemble.len());

    let attack = CarliniL2::new(config.clone())?;
    let outcome = attack.attack(&target_ensemble, &dataset.images, attack_labels)?;
    let adversarial = outcome.images_or_clean(&dataset.images)?;
    let evaluation = evaluate_attack(&ensemble, &dataset.images, &dataset.labels, &adversarial)?;

    let truth = dataset.label_indices();
    let target_ids = targets.as_ref().map(label_indices);
    let examples = outcome
        .records
        .iter()
        .enumerate()
        .map(|(index, record)| ExampleReport {
            index,
            label: truth[index],
            target: target_ids.as_ref().map(|t| t[index]),
            adversarial_label: record.label,
            distortion: record.is_found().then_some(record.distortion),
        })
        .collect();

    let report = AttackReport {
        threat: threat_model,
        attacked_members: target_ensemble.len(),
        config,
        success_rate: outcome.success_rate(),
        mean_distortion: outcome.mean_distortion(),
        examples,
        evaluation,
    };
    println!(
        "Success rate {:.3}, adversarial accuracy {:.3}, mean L2 {:.4}, AUC {:.3}",
        report.success_rate,
        report.evaluation.adversarial_accuracy,
        report.evaluation.mean_distance,
        report.evaluation.roc.auc
    );
    write_json(output, &report)
}

#[derive(Serialize)]
struct SweepReport {
    config: SweepConfig,
    records: Vec<SweepRecord>,
}

#[allow(clippy::too_many_arguments)]
fn sweep(
    model: &ModelArgs,
    data: &DataArgs,
    threats: &[ThreatKind],
    members: usize,
    confidences: Option<&[f32]>,
    overrides: &AttackOverrides,
    config_path: Option<&Path>,
    output: &Path,
) -> anyhow::Result<()> {
    let ensemble = load_ensemble(model)?;
    let dataset = load_data(data)?;

    let mut config = match config_path {
        Some(path) => read_json::<SweepConfig>(path)?,
        None => SweepConfig {
            threats: threats.iter().map(|t| t.model(members)).collect(),
            attack: preset(model, threats.first().copied().unwrap_or(ThreatKind::Gray)),
            seed: model.seed,
            ..SweepConfig::default()
        },
    };
    if let Some(list) = confidences {
        config.confidences = list.to_vec();
    }
    overrides.apply(&mut config.attack);

    let records = run_sweep(&ensemble, &dataset.images, &dataset.labels, &config)?;
    for record in &records {
        println!(
            "{:<26} κ={:<6} success {:.3}  accuracy {:.3}  L2 {:.4}  AUC {:.3}",
            record.threat.to_string(),
            record.confidence,
            record.success_rate,
            record.evaluation.adversarial_accuracy,
            record.evaluation.mean_distance,
            record.evaluation.roc.auc
        );
    }
    write_json(output, &SweepReport { config, records })
}

fn uncertainty(model: &ModelArgs, data: &DataArgs, output: Option<&Path>) -> anyhow::Result<()> {
    let ensemble = load_ensemble(model)?;
    let dataset = load_data(data)?;
    let report = UncertaintyReport::measure(&ensemble, &dataset.images)?;
    println!(
        "Uncertainty over {} examples: mean {:.6}, min {:.6}, max {:.6}",
        report.values.len(),
        report.mean,
        report.min,
        report.max
    );
    if let Some(path) = output {
        write_json(path, &report)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Inspect { model } => inspect(&model)?,
        Commands::Attack {
            model,
            data,
            threat,
            overrides,
            config,
            confidence,
            targeted,
            output,
        } => attack(
            &model,
            &data,
            &threat,
            &overrides,
            config.as_deref(),
            confidence,
            targeted,
            &output,
        )?,
        Commands::Sweep {
            model,
            data,
            threats,
            members,
            confidences,
            overrides,
            config,
            output,
        } => sweep(
            &model,
            &data,
            &threats,
            members,
            confidences.as_deref(),
            &overrides,
            config.as_deref(),
            &output,
        )?,
        Commands::Uncertainty {
            model,
            data,
            output,
        } => uncertainty(&model, &data, output.as_deref())?,
    }

    Ok(())
}
