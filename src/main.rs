use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use mechanical_karma::{
    build_per_lap_dataset, compute_stream, store, AppConfig, KarmaParams, LapFeatureRow, PipelineInputs,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: mechanical_karma <ingest | karma-stream [--smoothing X] [--wear-rate Y] | serve>";

fn ingest(cfg: &AppConfig) -> Result<()> {
    tracing::info!("loading raw telemetry + lap boundaries from {}", cfg.raw_dir().display());
    let inputs = PipelineInputs {
        telemetry: store::load_table(&cfg.raw_path(&cfg.files.telemetry))?,
        lap_start: store::load_optional_table(&cfg.raw_path(&cfg.files.lap_start))?,
        lap_end: store::load_optional_table(&cfg.raw_path(&cfg.files.lap_end))?,
        results: store::load_optional_table(&cfg.raw_path(&cfg.files.results))?,
    };

    let dataset = build_per_lap_dataset(&inputs, &cfg.pipeline)?;
    tracing::info!("join diagnostics: {:?}", dataset.diagnostics);

    let per_lap = store::save_json(&dataset.per_lap, &cfg.processed_dir().join("per_lap_features.json"))?;
    tracing::info!("saved per-lap dataset to {}", per_lap.display());
    let interim = store::save_json(
        &dataset.telemetry_with_laps,
        &cfg.interim_dir().join("telemetry_with_laps.json"),
    )?;
    tracing::info!("saved lap-tagged telemetry to {}", interim.display());
    Ok(())
}

fn karma_stream(cfg: &AppConfig, args: &[String]) -> Result<()> {
    let mut params: KarmaParams = cfg.karma;
    let mut it = args.iter();
    while let Some(flag) = it.next() {
        let value = it.next().with_context(|| format!("{} needs a value", flag))?;
        let value: f64 = value
            .parse()
            .with_context(|| format!("invalid number for {}: {}", flag, value))?;
        match flag.as_str() {
            "--smoothing" => params.smoothing = value,
            "--wear-rate" => params.wear_rate = value,
            other => bail!("unknown option {}\n{}", other, USAGE),
        }
    }

    let dataset_path = cfg.processed_dir().join("per_lap_features.json");
    let rows: Vec<LapFeatureRow> = store::load_json(&dataset_path)
        .with_context(|| format!("per-lap dataset not found at {}; run `ingest` first", dataset_path.display()))?;

    let records = compute_stream(&rows, &cfg.components, &params)?;
    let out = store::save_json(&records, &cfg.processed_dir().join("karma_stream.json"))?;
    tracing::info!("saved karma stream to {}", out.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mechanical_karma=info")),
        )
        .init();

    let config_path = std::env::var("KARMA_CONFIG").ok().map(PathBuf::from);
    let cfg = AppConfig::load(config_path.as_deref())?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("ingest") => ingest(&cfg),
        Some("karma-stream") => karma_stream(&cfg, &args[1..]),
        Some("serve") => mechanical_karma::server::serve(cfg).await,
        _ => bail!(USAGE),
    }
}
