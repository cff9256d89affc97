//! Convert a WAV file offline through the streaming pipeline
//!
//! Run with: cargo run --bin convert_wav -- in.wav out.wav --model-config config.json --onnx-model model.onnx

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info, warn};

use streamvc::audio::{duration_ms, load_wav, resample, to_pcm16, write_wav};
use streamvc::pipeline::SAMPLING_RATE;
use streamvc::settings::PROVIDER_KEY;
use streamvc::{init_tracing, ManagerConfig, Result, VoiceChangerManager};

/// streamvc - convert a recording chunk by chunk, the way a live stream would be
#[derive(Parser)]
#[command(name = "convert_wav", version, about)]
struct Cli {
    /// Input WAV file (any rate, mixed down to mono)
    input: PathBuf,

    /// Output WAV file (16-bit mono)
    output: PathBuf,

    /// Manager config file (TOML)
    #[arg(long, env = "STREAMVC_CONFIG")]
    config: Option<PathBuf>,

    /// Model config file (JSON for Onnx, YAML for Ddsp)
    #[arg(long)]
    model_config: String,

    /// Primary weights file, "-" to omit
    #[arg(long, default_value = "-")]
    model: String,

    /// ONNX weights file, "-" to omit
    #[arg(long, default_value = "-")]
    onnx_model: String,

    /// Cluster model file, "-" to omit
    #[arg(long, default_value = "-")]
    cluster_model: String,

    /// Backend family ("Onnx" or "Ddsp")
    #[arg(long)]
    framework: Option<String>,

    /// Pitch shift in semitones
    #[arg(long, allow_hyphen_values = true)]
    tran: Option<i64>,

    /// Target speaker id
    #[arg(long)]
    speaker: Option<i64>,

    /// Samples fed per cycle
    #[arg(long, default_value = "8192")]
    chunk_size: usize,

    /// Samples blended between consecutive cycles
    #[arg(long, default_value = "1024")]
    crossfade_size: usize,

    /// Execution provider: cpu, cuda, directml, openvino or a full ONNX Runtime name
    #[arg(long)]
    provider: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("convert_wav: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = ManagerConfig::load(cli.config.as_deref())?;
    let log_file = cli.log_file.as_deref().or(config.log_file.as_deref());
    init_tracing(log_file)?;

    let manager = VoiceChangerManager::from_config(&config)?;

    if let Some(framework) = cli.framework.as_deref() {
        apply(&manager, "framework", framework)?;
    }
    if let Some(tran) = cli.tran {
        apply(&manager, "tran", tran)?;
    }

    let snapshot = manager.load_model(
        &cli.model_config,
        Some(cli.model.as_str()),
        Some(cli.onnx_model.as_str()),
        Some(cli.cluster_model.as_str()),
    )?;
    info!(
        "Loaded {} ({} speakers)",
        snapshot.backend.as_deref().unwrap_or("backend"),
        snapshot.settings.speakers.len()
    );

    // Speaker ids only make sense once the model is known
    if let Some(speaker) = cli.speaker {
        apply(&manager, "dstId", speaker)?;
    }
    if let Some(provider) = cli.provider.as_deref() {
        apply(&manager, PROVIDER_KEY, provider)?;
    }

    let sample_rate = snapshot.sampling_rate.unwrap_or(SAMPLING_RATE);
    let (samples, source_rate) = load_wav(&cli.input)?;
    let samples = to_pcm16(&resample(&samples, source_rate, sample_rate)?);
    let chunk_size = cli.chunk_size.max(1);
    let crossfade_size = cli.crossfade_size.min(chunk_size);

    info!(
        "Converting {}ms of audio at {}Hz in chunks of {}",
        duration_ms(samples.len(), sample_rate),
        sample_rate,
        chunk_size
    );

    // Output lags input by one crossfade; flush it with trailing silence
    let mut padded = samples.clone();
    padded.resize(samples.len() + crossfade_size, 0);

    let started = Instant::now();
    let mut converted = Vec::with_capacity(padded.len() + chunk_size);
    for chunk in padded.chunks(chunk_size) {
        let mut chunk = chunk.to_vec();
        chunk.resize(chunk_size, 0);
        converted.extend(manager.process_chunk(&chunk, chunk_size, crossfade_size)?);
    }

    let mut output: Vec<i16> = converted.into_iter().skip(crossfade_size).collect();
    output.truncate(samples.len());
    write_wav(&output, sample_rate, &cli.output)?;

    let elapsed = started.elapsed();
    info!(
        "Wrote {} ({}ms) in {:.2}s",
        cli.output.display(),
        duration_ms(output.len(), sample_rate),
        elapsed.as_secs_f64()
    );

    manager.stop();
    Ok(())
}

fn apply(
    manager: &VoiceChangerManager,
    key: &str,
    value: impl Into<streamvc::SettingValue>,
) -> Result<()> {
    let value = value.into();
    if !manager.update_setting(key, value.clone())? {
        warn!("Setting {} = {} was not applied", key, value);
    }
    Ok(())
}
