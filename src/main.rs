//! `cpm`: train, apply and inspect Convex Polytope Machines.
//!
//! Datasets are libsvm text files. Models are the binary files written by
//! `ConvexPolytopeMachine::save`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use polytope_machine::data::dataset::Dataset;
use polytope_machine::eval::metrics::margin_histogram;
use polytope_machine::eval::parallel::{EvalOptions, ScoredInstance};
use polytope_machine::model::machine::{CpmConfig, Initialization};
use polytope_machine::model::schedule::LearningRate;
use polytope_machine::model::LossKind;
use polytope_machine::runtime::driver::{Cpm, FitOptions};

/// Convex Polytope Machine CLI.
#[derive(Parser, Debug)]
#[command(name = "cpm", about = "Convex Polytope Machine training and inference", version)]
struct Cli {
    /// Only log warnings and errors (overridden by RUST_LOG).
    #[arg(short, long, global = true, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model, optionally scoring a test set with it.
    Train(TrainArgs),
    /// Write raw scores of a dataset under a saved model.
    Predict(PredictArgs),
    /// Print metrics of a saved model on a dataset.
    Evaluate(EvaluateArgs),
    /// Describe a saved model.
    Inspect(InspectArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LossArg {
    Hinge,
    Perceptron,
    SmoothedHinge,
}

impl From<LossArg> for LossKind {
    fn from(arg: LossArg) -> Self {
        match arg {
            LossArg::Hinge => LossKind::Hinge,
            LossArg::Perceptron => LossKind::Perceptron,
            LossArg::SmoothedHinge => LossKind::SmoothedHinge,
        }
    }
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Training data (libsvm).
    #[arg(short, long)]
    train: PathBuf,

    /// Test data (libsvm); scored after training.
    #[arg(short = 'c', long)]
    test: Option<PathBuf>,

    /// Where to write the trained model.
    #[arg(short = 'o', long)]
    model_out: Option<PathBuf>,

    /// Where to write test scores (requires --test).
    #[arg(short, long)]
    scores: Option<PathBuf>,

    /// Number of polytopes.
    #[arg(short = 'k', long, default_value_t = 1)]
    polytopes: usize,

    /// Hyperplanes per polytope.
    #[arg(short = 'm', long, default_value_t = 1)]
    hyperplanes: usize,

    /// Initial learning rate.
    #[arg(long, default_value_t = polytope_machine::config::DEFAULT_LEARNING_RATE)]
    lr: f64,

    /// Learning-rate decay per example.
    #[arg(long, default_value_t = polytope_machine::config::DEFAULT_DECAY)]
    decay: f64,

    /// Regularization factor: Pegasos schedule 1/(λ(t+2)) with
    /// λ = 1/(C · epochs · instances), replacing --lr/--decay.
    #[arg(short = 'C', long)]
    c: Option<f64>,

    /// L2 penalty (defaults to λ with -C).
    #[arg(long)]
    l2: Option<f64>,

    /// Cost of negatives relative to positives.
    #[arg(long, default_value_t = 1.0)]
    cost_ratio: f64,

    /// Minimum exp(entropy) of the positive assignment, in [1, k].
    #[arg(long, default_value_t = 1.0)]
    entropy: f64,

    /// Label of the positive class.
    #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
    outer_label: i32,

    #[arg(long, value_enum, default_value_t = LossArg::Hinge)]
    loss: LossArg,

    /// Standard deviation of Gaussian initial weights (0 = zeros).
    #[arg(long, default_value_t = 0.0)]
    init_std: f64,

    #[arg(long, default_value_t = polytope_machine::config::DEFAULT_SEED)]
    seed: u64,

    #[arg(short = 'e', long, default_value_t = polytope_machine::config::DEFAULT_EPOCHS)]
    epochs: usize,

    #[arg(short, long, default_value_t = polytope_machine::config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Keep the training order fixed across epochs.
    #[arg(long, default_value_t = false)]
    no_shuffle: bool,

    /// Stop once the epoch loss improves by less than this.
    #[arg(long, default_value_t = 0.0)]
    tolerance: f64,

    #[arg(long, default_value_t = polytope_machine::config::DEFAULT_PATIENCE)]
    patience: usize,

    /// Save the model to --model-out every N epochs.
    #[arg(long, default_value_t = 0)]
    checkpoint_every: usize,

    /// Evaluation threads (0 = all cores).
    #[arg(short, long, default_value_t = 0)]
    workers: usize,

    /// Log metrics every N epochs (on --test when given).
    #[arg(long, default_value_t = 0)]
    eval_every: usize,
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[arg(short, long)]
    model: PathBuf,

    #[arg(short = 'c', long)]
    test: PathBuf,

    #[arg(short, long)]
    scores: PathBuf,

    #[arg(short, long, default_value_t = 0)]
    workers: usize,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    #[arg(short, long)]
    model: PathBuf,

    #[arg(short = 'c', long)]
    test: PathBuf,

    #[arg(short, long, default_value_t = 0)]
    workers: usize,

    /// Skip malformed instances instead of failing.
    #[arg(long, default_value_t = false)]
    skip_invalid: bool,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(short, long)]
    model: PathBuf,

    /// Also print a margin histogram over this dataset.
    #[arg(long)]
    data: Option<PathBuf>,

    #[arg(long, default_value_t = 20)]
    bins: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!("cpm v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Train(args) => train(args),
        Command::Predict(args) => predict(args),
        Command::Evaluate(args) => evaluate(args),
        Command::Inspect(args) => inspect(args),
    }
}

fn load_dataset(path: &Path) -> Result<Dataset> {
    let start = Instant::now();
    let dataset = Dataset::from_libsvm_file(path)
        .with_context(|| format!("Failed to load dataset {}", path.display()))?;
    tracing::info!(
        "Loaded {} instances from {} in {:.2}s",
        dataset.len(),
        path.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(dataset)
}

fn load_model(path: &Path) -> Result<Cpm> {
    Cpm::load(path).with_context(|| format!("Failed to load model {}", path.display()))
}

fn write_scores(path: &Path, scores: &[ScoredInstance]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    // score, polytope, ground truth (instance label == outer label)
    for s in scores {
        writeln!(out, "{}\t{}\t{}", s.score, s.polytope, s.is_outer as u8)?;
    }
    out.flush()?;
    tracing::info!("Wrote {} scores to {}", scores.len(), path.display());
    Ok(())
}

fn train(args: TrainArgs) -> Result<()> {
    if args.scores.is_some() && args.test.is_none() {
        anyhow::bail!("--scores requires --test");
    }
    if args.checkpoint_every > 0 && args.model_out.is_none() {
        anyhow::bail!("--checkpoint-every requires --model-out");
    }

    let train = load_dataset(&args.train)?;
    let test = args.test.as_deref().map(load_dataset).transpose()?;
    let dimensions = train
        .dimensions()
        .max(test.as_ref().map_or(0, |t| t.dimensions()));

    let initialization = if args.init_std > 0.0 {
        Initialization::Gaussian {
            std_dev: args.init_std,
        }
    } else {
        Initialization::Zeros
    };

    let mut config = CpmConfig::new(dimensions, args.polytopes, args.hyperplanes)
        .with_cost_ratio(args.cost_ratio)
        .with_min_effective_polytopes(args.entropy)
        .with_outer_label(args.outer_label)
        .with_loss(args.loss.into())
        .with_initialization(initialization)
        .with_seed(args.seed);
    match args.c {
        Some(c) => {
            let total_steps = (args.epochs as u64).saturating_mul(train.len() as u64);
            config = config.with_regularization(c, total_steps)?;
        }
        None => {
            config.learning_rate = LearningRate::new(args.lr, args.decay)?;
            config.l2 = polytope_machine::config::DEFAULT_L2;
        }
    }
    if let Some(l2) = args.l2 {
        config.l2 = l2;
    }

    tracing::info!(
        "Config: D={}, K={}, M={}, lr0={}, decay={}, l2={}, cost ratio={}, min entropy={}, loss={:?}",
        config.dimensions,
        config.polytopes,
        config.hyperplanes_per_polytope,
        config.learning_rate.initial,
        config.learning_rate.decay,
        config.l2,
        config.cost_ratio,
        config.min_effective_polytopes,
        config.loss
    );

    let mut options = FitOptions::default()
        .with_eval_every(args.eval_every)
        .with_epochs(args.epochs)
        .with_batch_size(args.batch_size)
        .with_shuffle(!args.no_shuffle)
        .with_seed(args.seed)
        .with_early_stopping(args.tolerance, args.patience)
        .with_workers(args.workers);
    if let (Some(path), true) = (&args.model_out, args.checkpoint_every > 0) {
        options = options.with_checkpoint(path, args.checkpoint_every);
    }

    let mut cpm = Cpm::from_config(config)?;
    let start = Instant::now();
    let metrics = cpm.fit_with_validation(&train, test.as_ref(), &options)?;
    tracing::info!(
        "Trained {} iterations in {:.2}s",
        cpm.model().iterations(),
        start.elapsed().as_secs_f64()
    );
    println!("# training set\n{}", metrics);

    if let Some(path) = &args.model_out {
        cpm.save(path)
            .with_context(|| format!("Failed to write model {}", path.display()))?;
    }

    if let Some(test) = &test {
        let metrics = cpm.evaluate(test, args.workers)?;
        println!("# test set\n{}", metrics);
        if let Some(path) = &args.scores {
            write_scores(path, &cpm.score(test, args.workers)?)?;
        }
    }
    Ok(())
}

fn predict(args: PredictArgs) -> Result<()> {
    let cpm = load_model(&args.model)?;
    let test = load_dataset(&args.test)?;
    let scores = cpm.score(&test, args.workers)?;
    write_scores(&args.scores, &scores)
}

fn evaluate(args: EvaluateArgs) -> Result<()> {
    let cpm = load_model(&args.model)?;
    let test = load_dataset(&args.test)?;
    let options = EvalOptions::default()
        .with_workers(args.workers)
        .with_skip_invalid(args.skip_invalid);
    let start = Instant::now();
    let metrics = cpm.evaluate_with(&test, &options)?;
    tracing::info!("Evaluated in {:.2}s", start.elapsed().as_secs_f64());
    println!("{}", metrics);
    Ok(())
}

fn inspect(args: InspectArgs) -> Result<()> {
    let cpm = load_model(&args.model)?;
    println!("{}", cpm.model().summary());

    if let Some(path) = &args.data {
        let data = load_dataset(path)?;
        let scores = cpm.score(&data, 0)?;
        let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
        let histogram = margin_histogram(&values, args.bins);
        let width = histogram.bin_width();
        println!("\nScore histogram over {}:", path.display());
        for (i, count) in histogram.counts.iter().enumerate() {
            let lo = histogram.min + width * i as f64;
            println!("  [{:>10.4}, {:>10.4})  {}", lo, lo + width, count);
        }
    }
    Ok(())
}
