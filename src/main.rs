//! Application entry point for ptt-translator.
//!
//! # `run` startup sequence
//!
//! 1. Load and validate every `--config` file (default: platform settings).
//! 2. Initialise logging from the first profile's `diagnostics.log_level`.
//! 3. Per profile: credentials, speech client, mixer, orchestrator startup,
//!    then the PTT hook feeding a bounded channel.
//! 4. Spawn each orchestrator on the tokio runtime.
//! 5. Wait for Ctrl-C, drop the PTT handlers (closing the channels) and let
//!    each orchestrator restore idle routing and log its timing summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use tokio::sync::mpsc;

use ptt_translator::{
    audio::{self, CaptureDevice, CaptureRequest, CpalCapture, CpalPlayback, PlaybackDevice},
    config::AppConfig,
    hotkey::{parse_key, InputHookError, PttEvent, PttHandler},
    mixer::{MixerController, VbanTextBackend},
    pipeline::{PipelineError, PipelineOrchestrator},
    translate::{AzureTranslator, SpeechCredentials},
};

/// Events buffered between the PTT worker and an orchestrator.
const PTT_CHANNEL: usize = 32;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Push-to-talk speech translator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one pipeline per settings file until Ctrl-C
    Run(RunCommand),

    /// Check credentials, mixer and audio devices, then exit
    SelfTest(SelfTestCommand),

    /// List audio input and output devices
    ListDevices,
}

#[derive(Args, Debug)]
struct RunCommand {
    /// Settings file; repeat for independent profiles
    #[arg(short, long)]
    config: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct SelfTestCommand {
    /// Settings file (default: platform settings)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(cmd) => run(cmd).await,
        Commands::SelfTest(cmd) => self_test(cmd).await,
        Commands::ListDevices => {
            init_logging("info");
            list_devices()
        }
    }
}

fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AppConfig::load().context("failed to load settings")?,
    };
    config
        .validate()
        .with_context(|| format!("invalid settings for profile {}", config.label()))?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// One running profile: its orchestrator and the PTT hook feeding it.
struct Instance {
    orchestrator: PipelineOrchestrator,
    ptt: PttHandler,
    ptt_rx: mpsc::Receiver<PttEvent>,
}

async fn run(cmd: RunCommand) -> Result<()> {
    let configs = if cmd.config.is_empty() {
        vec![load_config(None)?]
    } else {
        cmd.config
            .iter()
            .map(|path| load_config(Some(path)))
            .collect::<Result<Vec<_>>>()?
    };
    init_logging(&configs[0].diagnostics.log_level);
    log::info!("ptt-translator {} starting", env!("CARGO_PKG_VERSION"));

    let mut handlers = Vec::with_capacity(configs.len());
    let mut tasks = Vec::with_capacity(configs.len());
    for config in configs {
        let label = config.label().to_string();
        let instance = start_instance(config)
            .await
            .with_context(|| format!("profile {label} failed to start"))?;
        handlers.push(instance.ptt);
        tasks.push(tokio::spawn(instance.orchestrator.run(instance.ptt_rx)));
    }
    log::info!("{} profile(s) running, press Ctrl-C to quit", tasks.len());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    log::info!("shutting down");

    // Dropping the handlers drops the channel senders; each run() then exits.
    drop(handlers);
    for task in tasks {
        if let Err(e) = task.await {
            log::error!("pipeline task failed: {e}");
        }
    }
    Ok(())
}

async fn start_instance(config: AppConfig) -> Result<Instance, PipelineError> {
    config.validate()?;
    let key = parse_key(&config.ptt.key)
        .ok_or_else(|| InputHookError::UnknownKey(config.ptt.key.clone()))?;

    let credentials = SpeechCredentials::from_env(&config.speech.region)?;
    let translator = AzureTranslator::new(
        credentials,
        config.speech.voice.clone(),
        config.audio.recognizer_sample_rate,
        config.speech.push_retries,
        config.speech.finalize_timeout(),
    );

    let mixer = MixerController::new(Box::new(vban_backend(&config)), config.mixer.retry_policy());
    let playback = CpalPlayback::new(config.audio.playback_device.clone());

    let mut orchestrator = PipelineOrchestrator::new(
        config.clone(),
        Arc::new(CpalCapture::new()),
        Arc::new(playback),
        Arc::new(translator),
        Arc::new(mixer),
    );
    orchestrator.startup().await?;

    let (tx, ptt_rx) = mpsc::channel(PTT_CHANNEL);
    let mut ptt = PttHandler::new(key, config.ptt.debounce());
    let press_tx = tx.clone();
    ptt.on_press(move || forward(&press_tx, PttEvent::Pressed));
    ptt.on_release(move || forward(&tx, PttEvent::Released));
    ptt.start()?;

    Ok(Instance {
        orchestrator,
        ptt,
        ptt_rx,
    })
}

fn forward(tx: &mpsc::Sender<PttEvent>, event: PttEvent) {
    if let Err(e) = tx.try_send(event) {
        log::warn!("ptt: {event:?} dropped: {e}");
    }
}

fn vban_backend(config: &AppConfig) -> VbanTextBackend {
    VbanTextBackend::new(
        config.mixer.host.clone(),
        config.mixer.port,
        config.mixer.stream_name.clone(),
    )
    .with_ping_timeout(config.mixer.ping_timeout())
}

// ---------------------------------------------------------------------------
// self-test
// ---------------------------------------------------------------------------

async fn self_test(cmd: SelfTestCommand) -> Result<()> {
    let config = load_config(cmd.config.as_ref())?;
    init_logging(&config.diagnostics.log_level);

    let mut failures = 0;
    let mut report = |name: &str, result: Result<(), String>| match result {
        Ok(()) => println!("{name:<12} ok"),
        Err(reason) => {
            failures += 1;
            println!("{name:<12} FAILED: {reason}");
        }
    };

    report(
        "credentials",
        SpeechCredentials::from_env(&config.speech.region)
            .map(|_| ())
            .map_err(|e| e.to_string()),
    );

    let mixer = MixerController::new(Box::new(vban_backend(&config)), config.mixer.retry_policy());
    let connected = mixer.connect().await;
    mixer.disconnect().await;
    report(
        "mixer",
        if connected {
            Ok(())
        } else {
            Err(format!("no answer from {}:{}", config.mixer.host, config.mixer.port))
        },
    );

    let request = CaptureRequest {
        device: config.audio.capture_device.clone(),
        sample_rate: config.audio.capture_sample_rate,
        frame_duration: config.audio.frame_duration(),
        queue_frames: config.audio.queue_frames,
    };
    let opened = tokio::task::spawn_blocking(move || {
        CpalCapture::new()
            .open(&request)
            .map(|mut stream| stream.close())
    })
    .await
    .context("capture check panicked")?;
    report("capture", opened.map_err(|e| e.to_string()));

    let rate = config.audio.playback_sample_rate;
    let playback = CpalPlayback::new(config.audio.playback_device.clone());
    let played = tokio::task::spawn_blocking(move || {
        // 100 ms of silence
        playback.play(&vec![0; rate as usize / 10], rate)
    })
    .await
    .context("playback check panicked")?;
    report("playback", played.map_err(|e| e.to_string()));

    if failures > 0 {
        anyhow::bail!("{failures} check(s) failed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list-devices
// ---------------------------------------------------------------------------

fn list_devices() -> Result<()> {
    let (inputs, outputs) = audio::list_devices().context("failed to enumerate audio devices")?;
    println!("Input devices:");
    for name in inputs {
        println!("  {name}");
    }
    println!("Output devices:");
    for name in outputs {
        println!("  {name}");
    }
    Ok(())
}
