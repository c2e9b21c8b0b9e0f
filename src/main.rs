use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_tracks::{
    pcm_decoder_factory, request_stop, CaptureError, Config, OutputFormat, ProcessProbe, ScriptedGateway,
    SessionController, SessionMetadata, SessionRegistry, Shutdown, StartRequest, StopOutcome, StopTimeouts, SysinfoProbe,
    SystemLoad,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loqa-tracks", version)]
#[command(about = "Record every call participant to a separate, time-aligned track")]
struct Cli {
    /// Config file (any format supported by the config crate)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record a channel until stopped
    Start {
        call_id: String,
        channel_id: String,
        output_dir: PathBuf,

        /// Output format (overrides config)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,

        /// Encoder bitrate in kbps (overrides config)
        #[arg(long)]
        bitrate: Option<u32>,

        /// Drive the session from a scripted gateway file
        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// Stop the session recording a call, in this or another process
    Stop { call_id: String },

    /// Show registered sessions
    Status,

    /// List finished recordings under a directory
    List { output_dir: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Start {
            call_id,
            channel_id,
            output_dir,
            format,
            bitrate,
            script,
        } => start(cfg, call_id, channel_id, output_dir, format, bitrate, script).await,
        Command::Stop { call_id } => stop(cfg, &call_id).await,
        Command::Status => status(cfg).await,
        Command::List { output_dir } => list(&output_dir),
    }
}

async fn start(
    mut cfg: Config,
    call_id: String,
    channel_id: String,
    output_dir: PathBuf,
    format: Option<OutputFormat>,
    bitrate: Option<u32>,
    script: Option<PathBuf>,
) -> Result<ExitCode> {
    if let Some(format) = format {
        cfg.audio.format = format;
    }
    if let Some(bitrate) = bitrate {
        cfg.audio.bitrate_kbps = bitrate;
    }

    let Some(script) = script else {
        let e = CaptureError::Precondition("no voice gateway is built in; pass --script <FILE>".into());
        error!("{}", e);
        return Ok(ExitCode::FAILURE);
    };
    let shutdown = Shutdown::install();
    let gateway = ScriptedGateway::from_file(&script, cfg.pcm_format(), cfg.frame_duration())?;
    let registry = SessionRegistry::open(cfg.registry.dir())?;

    let request = StartRequest::new(call_id, channel_id, output_dir)
        .with_format(cfg.audio.format)
        .with_bitrate(cfg.audio.bitrate_kbps);

    let mut controller = SessionController::new(
        cfg,
        Arc::new(gateway),
        pcm_decoder_factory(),
        registry,
        Arc::new(SysinfoProbe::new()),
    );

    let info = match controller.start(request).await {
        Ok(info) => info,
        Err(e) => {
            let kind = if e.is_precondition() { "cannot record" } else { "failed to join" };
            error!("Start {}: {}", kind, e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("Recording {} into {}", info.session_id, info.output_path.display());
    println!("Press Ctrl+C or run `loqa-tracks stop {}` to finish", info.call_id);

    let report = controller.run_until(async {
        shutdown.wait().await;
    })
    .await?;
    let metadata = &report.metadata;

    println!(
        "Session {} stopped ({:?}) after {:.1}s",
        metadata.session_id, metadata.stop_reason, metadata.duration_secs
    );
    for participant in &metadata.participants {
        match (&participant.file, &participant.discarded) {
            (Some(file), _) => println!("  {} -> {} ({:.1}s)", participant.display_name, file, participant.duration_secs),
            (None, Some(reason)) => println!("  {} -> discarded: {}", participant.display_name, reason),
            (None, None) => println!("  {} -> no output", participant.display_name),
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn stop(cfg: Config, call_id: &str) -> Result<ExitCode> {
    let registry = SessionRegistry::open(cfg.registry.dir())?;
    let probe = SysinfoProbe::new();

    match request_stop(
        &registry,
        &probe,
        call_id,
        &cfg.session.stop_marker,
        StopTimeouts::from_config(&cfg),
    )
    .await
    {
        Ok(outcome) => {
            let message = match outcome {
                StopOutcome::NotRunning => "no session was running",
                StopOutcome::StaleCleared => "cleared a stale session record",
                StopOutcome::Stopped => "session stopped",
                StopOutcome::Terminated => "session process was terminated",
            };
            println!("{}: {}", call_id, message);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn status(cfg: Config) -> Result<ExitCode> {
    let registry = SessionRegistry::open(cfg.registry.dir())?;
    let probe = SysinfoProbe::new();
    let records = registry.list()?;

    match SystemLoad::sample().await {
        Some(load) => println!("System load: {}", load),
        None => println!("System load: unavailable"),
    }

    if records.is_empty() {
        println!("No sessions registered in {}", registry.dir().display());
        return Ok(ExitCode::SUCCESS);
    }

    for record in records {
        let liveness = if probe.is_owner(&record) { "running" } else { "stale" };
        println!(
            "{}  channel {}  pid {} ({})  since {}  {} @ {}kbps  {}",
            record.call_id,
            record.channel_id,
            record.owner_pid,
            liveness,
            record.start_time.format("%Y-%m-%d %H:%M:%S UTC"),
            record.format,
            record.bitrate_kbps,
            record.output_path.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn list(output_dir: &Path) -> Result<ExitCode> {
    let sessions = SessionMetadata::list(output_dir)
        .with_context(|| format!("Failed to read recordings in {}", output_dir.display()))?;

    if sessions.is_empty() {
        println!("No recordings in {}", output_dir.display());
        return Ok(ExitCode::SUCCESS);
    }

    for (dir, metadata) in sessions {
        println!(
            "{}  {}  {:.1}s  {} tracks  {}",
            metadata.session_id,
            metadata.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            metadata.duration_secs,
            metadata.kept_files(),
            dir.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}
