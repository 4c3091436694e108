use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use voice_coach::capture::CaptureStatus;
use voice_coach::{
    AudioProfile, Config, Connector, FileStore, LiveSession, LiveSessionConfig, LiveTransport,
    Preloader, SessionEvent, SessionPersistence, StartOptions, WavMicrophone, WavOutput,
    WsConnector,
};

#[derive(Parser)]
#[command(name = "voice-coach")]
#[command(about = "Live voice interview client")]
struct Args {
    /// Config file, extension optional
    #[arg(short, long, default_value = "config/voice-coach")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a WAV file to the live endpoint and record the coach's replies
    Run {
        #[arg(long)]
        interview_id: String,

        #[arg(long)]
        user_id: String,

        /// WAV file used as the microphone
        #[arg(short, long)]
        input: PathBuf,

        /// WAV file the coach audio is rendered into
        #[arg(short, long, default_value = "coach.wav")]
        output: PathBuf,

        /// Override the configured endpoint
        #[arg(long)]
        url: Option<String>,

        /// Feed the input at live pace instead of as fast as possible
        #[arg(long)]
        realtime: bool,

        /// Ask the server to resume an existing interview
        #[arg(long)]
        resume: bool,

        /// Warm the audio thread and network worker before starting
        #[arg(long)]
        preload: bool,
    },

    /// Print the most recent unfinished session, if it is still recoverable
    Recover,

    /// Evict stored sessions beyond the retention limit
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    info!("Voice Coach v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    let store = FileStore::open(&cfg.persistence.store_path).with_context(|| {
        format!(
            "Failed to open session store at {}",
            cfg.persistence.store_path.display()
        )
    })?;
    let persistence = Arc::new(SessionPersistence::new(
        Arc::new(store),
        cfg.persistence.options(),
    ));

    match args.command {
        Command::Run {
            interview_id,
            user_id,
            input,
            output,
            url,
            realtime,
            resume,
            preload,
        } => {
            let run = RunArgs {
                interview_id,
                user_id,
                input,
                output,
                url,
                realtime,
                resume,
                preload,
            };
            run_session(&cfg, persistence, run).await
        }
        Command::Recover => {
            match persistence.get_recoverable_session().await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => info!("No recoverable session"),
            }
            Ok(())
        }
        Command::Cleanup => {
            let evicted = persistence.cleanup_old_sessions().await?;
            info!("Evicted {} stored sessions", evicted);
            Ok(())
        }
    }
}

struct RunArgs {
    interview_id: String,
    user_id: String,
    input: PathBuf,
    output: PathBuf,
    url: Option<String>,
    realtime: bool,
    resume: bool,
    preload: bool,
}

async fn run_session(cfg: &Config, persistence: Arc<SessionPersistence>, args: RunArgs) -> Result<()> {
    let connector: Arc<dyn Connector> = Arc::new(WsConnector);

    let preloader = args.preload.then(|| {
        let preloader = Preloader::new(Arc::clone(&connector));
        preloader.preload(true);
        preloader
    });
    if let Some(preloader) = &preloader {
        preloader.wait().await;
    }

    let mut options = cfg.transport.options();
    if let Some(url) = args.url {
        options.url = url;
    }
    info!("Live endpoint: {}", options.url);

    let (transport, transport_events) = LiveTransport::new(options, connector);
    let transport = match &preloader {
        Some(preloader) => transport.with_pool(preloader.network_pool()),
        None => transport,
    };

    let profile = AudioProfile::for_tier(cfg.audio.profile);
    let mut config = LiveSessionConfig::new(args.interview_id, args.user_id).with_profile(profile);
    config.start = StartOptions {
        resume: args.resume,
        ..StartOptions::default()
    };
    config.capture.speech_threshold = cfg.audio.speech_threshold;
    config.capture.start_window_ms = cfg.audio.start_window_ms.max(profile.frame_duration_ms);
    config.capture.silence_window_ms = cfg.audio.silence_window_ms;
    config.max_buffered_frames = cfg.audio.max_buffered_frames;
    config.frame_interval = Duration::from_millis(cfg.audio.frame_interval_ms);

    let (session, mut events) = LiveSession::new(config, transport, transport_events, persistence);
    let session = match &preloader {
        Some(preloader) => session.with_audio_pool(preloader.audio_pool()),
        None => session,
    };

    let microphone = WavMicrophone::new(&args.input).realtime(args.realtime);
    let output = WavOutput::create(&args.output, profile.sample_rate)?;

    session
        .start(Box::new(microphone), Box::new(output))
        .await
        .context("Failed to start live session")?;

    info!("Session live. Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(SessionEvent::Capture(CaptureStatus::Ended)) => {
                    info!("Input exhausted");
                    break;
                }
                Some(SessionEvent::Error(message)) => warn!("{}", message),
                Some(_) => {}
                None => break,
            }
        }
    }

    let stats = session.stop().await?;
    info!(
        "Session finished: {:.1}s, {} frames sent, {} dropped, {} coach buffers, {} transcript lines",
        stats.duration_secs,
        stats.frames_sent,
        stats.frames_dropped,
        stats.buffers_played,
        stats.transcript_count
    );
    info!("Coach audio written to {}", args.output.display());

    Ok(())
}
