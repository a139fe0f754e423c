//! Train the stacked ensemble on a synthetic panel
//!
//! Generates a multi-sine panel, scales it with statistics from the training
//! rows only, trains the primary model and the meta-learner, then reports
//! MAE/RMSE of both prediction paths in original units.

use anyhow::{Context, Result};
use clap::Parser;
use ndarray::s;
use tracing::info;

use stacked_attention_ensemble::{
    make_windows, setup_logging, synthetic_series, train_test_split, EnsembleConfig, MinMaxScaler,
    StackedEnsemble, WindowShape,
};

#[derive(Parser)]
#[command(name = "train_ensemble")]
#[command(about = "Train the stacked attention ensemble on synthetic data")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Number of epochs (overrides config)
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Random seed (overrides config)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Window length (overrides config)
    #[arg(short, long)]
    window: Option<usize>,

    /// Rows of the synthetic panel (overrides config)
    #[arg(long)]
    series_len: Option<usize>,

    /// Write the training histories as JSON
    #[arg(long)]
    history: Option<String>,

    /// Show a progress bar per fit
    #[arg(long)]
    progress: bool,

    /// Log level (overrides config; RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = EnsembleConfig::load_or_default(&args.config);
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(window) = args.window {
        config.data.window_len = window;
    }
    if let Some(len) = args.series_len {
        config.data.series_len = len;
    }
    if args.progress {
        config.training.show_progress = true;
    }
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(level)?;
    config.validate().context("invalid configuration")?;

    let data = &config.data;
    info!(
        "Generating {} x {} panel, windows of {}, seed {}",
        data.series_len, data.n_features, data.window_len, config.seed
    );
    let series = synthetic_series(data.series_len, data.n_features, config.seed);

    // Scaler statistics come from the rows the training windows can see
    let fit_rows = ((data.series_len as f64) * data.train_ratio).round() as usize;
    let fit_rows = fit_rows.clamp(1, data.series_len);
    let scaler = MinMaxScaler::fit(
        &series.slice(s![..fit_rows, ..]).to_owned(),
        data.target_column,
    )?;
    let scaled = scaler.transform(&series)?;

    let (windows, targets) = make_windows(&scaled, data.window_len, data.target_column)?;
    let (train, test) = train_test_split(windows, targets, data.train_ratio)?;
    info!("{} training windows, {} test windows", train.len(), test.len());

    let shape = WindowShape::new(data.window_len, data.n_features);
    let mut ensemble = StackedEnsemble::new(config.clone(), shape)?;
    ensemble.run(&train).context("training the ensemble")?;

    let report = ensemble.evaluate(&test, &scaler)?;
    println!();
    println!("Test set ({} windows, original units)", test.len());
    println!("{}", report);

    if let Some(importances) = ensemble.feature_importances() {
        println!();
        println!("Top meta-features:");
        for (name, value) in importances.iter().take(8) {
            println!("  {:<24} {:.4}", name, value);
        }
    }

    if let Some(path) = &args.history {
        let json = serde_json::to_string_pretty(ensemble.histories())?;
        std::fs::write(path, json).with_context(|| format!("writing history to {}", path))?;
        info!("Training history written to {}", path);
    }

    Ok(())
}
