//! Training CLI Tool
//!
//! Trains and evaluates the chest X-ray classifier end to end. Image decoding
//! lives outside this workspace, so the tool trains on the deterministic
//! synthetic dataset; the dataset path is passed through to the provider
//! unchanged.

use anyhow::{anyhow, bail, Context, Result};
use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::record::CompactRecorder;
use chrono::Local;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use xray_core::logging::{init_logging, LogConfig, LogLevel};
use xray_core::{EvaluationReport, EpochLog, TrainingConfig, CLASS_NAMES};
use xray_training::{
    ArchitectureSpec, BurnFactory, InputShape, SyntheticProvider, TrainingRun,
};

type TrainBackend = Autodiff<NdArray>;

/// Training configuration from file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainFile {
    pub training: TrainingConfig,
    pub model: ModelSection,
    pub dataset: DatasetSection,
    pub output: OutputSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Square input size in pixels
    pub image_size: usize,
    pub channels: usize,
    pub num_classes: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            image_size: xray_core::DEFAULT_IMAGE_SIZE,
            channels: xray_core::DEFAULT_CHANNELS,
            num_classes: xray_core::DEFAULT_NUM_CLASSES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSection {
    pub train_samples: usize,
    pub test_samples: usize,
    pub noise: f32,
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            train_samples: 60,
            test_samples: 15,
            noise: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub output_dir: PathBuf,
    pub save_model: bool,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            save_model: true,
        }
    }
}

/// Chest X-ray classifier training tool
#[derive(Parser, Debug)]
#[command(
    name = "xray-train",
    about = "Train and evaluate the chest X-ray classifier",
    long_about = "Build the CNN, train it with the configured optimizer, stream per-epoch \
                  progress and print the evaluation report for the test split."
)]
struct Args {
    /// Path to training configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override dataset identifier
    #[arg(short, long, value_name = "PATH")]
    dataset: Option<String>,

    /// Override number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Override learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Override batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Override optimizer (adam, adamw, sgd, rmsprop)
    #[arg(long, value_name = "NAME")]
    optimizer: Option<String>,

    /// Override shuffle seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override input image size
    #[arg(long, value_name = "PIXELS")]
    image_size: Option<usize>,

    /// Override number of synthetic training samples
    #[arg(long, value_name = "N")]
    samples: Option<usize>,

    /// Do not save the trained model
    #[arg(long)]
    no_save: bool,

    /// Verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error); overrides -v/-q
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Dry run (validate config without training)
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&log_config(&args)).map_err(|e| anyhow!(e))?;

    info!("Chest X-ray Classifier - Training Tool");
    info!("======================================");

    let mut file = match &args.config {
        Some(path) => load_config(path).context("Failed to load configuration file")?,
        None => TrainFile::default(),
    };
    apply_overrides(&mut file, &args)?;

    file.training.validate()?;
    let architecture = ArchitectureSpec::standard_for(
        InputShape {
            height: file.model.image_size,
            width: file.model.image_size,
            channels: file.model.channels,
        },
        file.model.num_classes,
    );
    architecture
        .validate()
        .context("Invalid model architecture")?;

    print_config_summary(&file, &architecture)?;

    if args.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let output_dir = &file.output.output_dir;
    std::fs::create_dir_all(output_dir).context("Failed to create output directory")?;
    let config_path = output_dir.join("config.toml");
    std::fs::write(&config_path, toml::to_string_pretty(&file)?)
        .context("Failed to save configuration")?;
    info!("Configuration saved to: {}", config_path.display());

    let provider = SyntheticProvider::new(
        architecture.input,
        file.model.num_classes,
        file.dataset.train_samples,
        file.dataset.test_samples,
    )
    .with_seed(file.training.seed)
    .with_noise(file.dataset.noise);
    let factory = BurnFactory::<TrainBackend>::default();

    let mut run = TrainingRun::new(file.training.clone(), architecture)?;
    let progress = spawn_progress_bar(&run);

    let outcome = run.execute(&factory, &provider).await?;
    progress.await.context("Progress display task failed")?;

    let names = CLASS_NAMES;
    let class_names = (outcome.report.num_classes == names.len()).then_some(&names[..]);
    println!("{}", outcome.report.display(class_names));

    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let report_path = output_dir.join(format!("report_{}.json", timestamp));
    save_report(&report_path, &outcome.report, &outcome.history)?;
    info!("Report saved to: {}", report_path.display());

    if file.output.save_model && !args.no_save {
        let model_path = output_dir.join(format!("xray_classifier_{}", timestamp));
        outcome
            .model
            .save_file(&model_path, &CompactRecorder::new())
            .map_err(|e| anyhow!("Failed to save model: {:?}", e))?;
        info!("Model saved to: {}", model_path.display());
    }

    info!("{} completed successfully", outcome.run_id);
    Ok(())
}

fn log_config(args: &Args) -> LogConfig {
    let mut config = if args.quiet {
        LogConfig::quiet()
    } else if args.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    if let Some(level) = &args.log_level {
        config.level = LogLevel::from_name(level);
    }
    config
}

fn load_config(path: &Path) -> Result<TrainFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn apply_overrides(file: &mut TrainFile, args: &Args) -> Result<()> {
    let training = &mut file.training;
    if let Some(dataset) = &args.dataset {
        training.dataset_path = dataset.clone();
    }
    if let Some(epochs) = args.epochs {
        training.epochs = epochs;
    }
    if let Some(lr) = args.lr {
        training.learning_rate = lr;
    }
    if let Some(batch_size) = args.batch_size {
        training.batch_size = batch_size;
    }
    if let Some(optimizer) = &args.optimizer {
        training.optimizer = optimizer.parse()?;
    }
    if let Some(seed) = args.seed {
        training.seed = seed;
    }
    if let Some(image_size) = args.image_size {
        file.model.image_size = image_size;
    }
    if let Some(samples) = args.samples {
        file.dataset.train_samples = samples;
    }
    if let Some(output) = &args.output {
        file.output.output_dir = output.clone();
    }
    if file.dataset.train_samples < 2 || file.dataset.test_samples == 0 {
        bail!(
            "need at least 2 training samples and 1 test sample, got {} and {}",
            file.dataset.train_samples,
            file.dataset.test_samples
        );
    }
    Ok(())
}

fn print_config_summary(file: &TrainFile, architecture: &ArchitectureSpec) -> Result<()> {
    let training = &file.training;
    info!("Configuration:");
    info!("  Dataset:       {}", training.dataset_path);
    info!("  Epochs:        {}", training.epochs);
    info!("  Batch size:    {}", training.batch_size);
    info!("  Learning rate: {}", training.learning_rate);
    info!("  Optimizer:     {}", training.optimizer);
    info!("  Seed:          {}", training.seed);
    info!(
        "  Input:         {}x{}x{}",
        architecture.input.height, architecture.input.width, architecture.input.channels
    );
    info!("  Classes:       {}", architecture.num_classes);
    info!("  Features:      {}", architecture.feature_size()?);
    info!("  Parameters:    {}", architecture.parameter_count()?);
    Ok(())
}

/// Drive a progress bar from the run's epoch stream until the run closes it.
fn spawn_progress_bar(run: &TrainingRun) -> tokio::task::JoinHandle<()> {
    let bar = ProgressBar::new(run.config().epochs as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} epochs {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let mut stream = run.reporter().subscribe();
    tokio::spawn(async move {
        while let Some(log) = stream.next().await {
            bar.set_position(log.epoch as u64);
            bar.set_message(format!(
                "loss={:.4} val_acc={:.2}%",
                log.train_loss,
                log.val_accuracy * 100.0
            ));
        }
        bar.finish();
    })
}

#[derive(Serialize)]
struct SavedReport<'a> {
    report: &'a EvaluationReport,
    history: &'a [EpochLog],
}

fn save_report(path: &Path, report: &EvaluationReport, history: &[EpochLog]) -> Result<()> {
    let json = serde_json::to_string_pretty(&SavedReport { report, history })?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_flags() {
        fn level(argv: &[&str]) -> LogLevel {
            log_config(&Args::parse_from(argv)).level
        }
        assert_eq!(level(&["xray-train"]), LogLevel::Info);
        assert_eq!(level(&["xray-train", "-v"]), LogLevel::Debug);
        assert_eq!(level(&["xray-train", "--quiet"]), LogLevel::Error);
        assert_eq!(level(&["xray-train", "-q", "--log-level", "warn"]), LogLevel::Warn);
        assert!(Args::try_parse_from(["xray-train", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_partial_training_section() {
        let file: TrainFile = toml::from_str("[training]\nepochs = 3\n").unwrap();
        assert_eq!(file.training.epochs, 3);
        assert_eq!(file.training.dataset_path, TrainingConfig::default().dataset_path);
        assert_eq!(file.model.image_size, xray_core::DEFAULT_IMAGE_SIZE);
    }
}
