use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, mpsc, watch};
use tracing_subscriber::EnvFilter;

use karuna::conversation::Command as Control;
use karuna::voice::{
    AudioCapture, AudioPlayer, AudioSource, CpalSink, MicRecorder, PhraseSpotter, SAMPLE_RATE,
    WakeWordDetector, decode_mp3, play_samples, rms,
};
use karuna::{
    Backend, Config, ConversationController, HttpBackend, OverlayView, SessionId,
    TranscriptBridge, Turn,
};

/// Karuna - hands-free voice client for a retrieval-backed assistant
#[derive(Parser)]
#[command(name = "karuna", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: ~/.config/karuna/config.toml)
    #[arg(short, long, env = "KARUNA_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL, overrides config and environment
    #[arg(long)]
    backend_url: Option<String>,

    /// Disable passive wake word listening
    #[arg(long)]
    no_wake_word: bool,

    /// Print transcript turns as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Ask one typed question
    Chat {
        /// Question text
        question: String,
    },
    /// Fetch and play the greeting
    Greet,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

const KEY_HELP: &str = "keys: Enter toggle | o open | p pause | r resume | c close | q quit";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,karuna=info",
        1 => "info,karuna=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.backend_url {
        config.backend.url = url.trim_end_matches('/').to_string();
    }
    if cli.no_wake_word {
        config.wake_word.enabled = false;
    }

    // Handle subcommands
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Chat { question } => chat(&config, &question, cli.json).await,
            Command::Greet => greet(&config).await,
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
        };
    }

    tracing::info!(
        backend = %config.backend.url,
        wake_word = config.wake_word.enabled,
        "starting karuna"
    );

    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(&config.backend)?);
    let player = AudioPlayer::new(Box::new(CpalSink::new()?));
    let transcript = TranscriptBridge::new();

    let mut controller = ConversationController::new(
        &config.conversation,
        backend,
        Box::new(MicRecorder::new()),
        player,
        SessionId::current().clone(),
        transcript.clone(),
    );

    if config.wake_word.enabled {
        let init = PhraseSpotter::from_config(&config.wake_word)
            .map(|spotter| WakeWordDetector::new(Box::new(spotter)));
        controller = controller.with_wake_word_init(init);
    }

    let (commands, rx) = mpsc::channel(16);

    tokio::spawn(show_overlay(controller.subscribe()));
    tokio::spawn(print_turns(transcript.subscribe(), cli.json));
    tokio::spawn(read_keys(commands.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            let _ = commands.send(Control::Shutdown).await;
        }
    });

    if config.wake_word.enabled {
        eprintln!("Say \"{}\" or press Enter to talk.", config.wake_word.label);
    }
    eprintln!("{KEY_HELP}");

    controller.run(rx).await?;
    Ok(())
}

/// Map stdin lines to controller commands until quit or EOF
async fn read_keys(commands: mpsc::Sender<Control>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        let command = match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "" => Control::Toggle,
                "o" => Control::Open,
                "p" => Control::Pause,
                "r" => Control::Resume,
                "c" => Control::Close,
                "q" => Control::Shutdown,
                _ => {
                    eprintln!("{KEY_HELP}");
                    continue;
                }
            },
            Ok(None) => Control::Shutdown,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                Control::Shutdown
            }
        };

        let quit = command == Control::Shutdown;
        if commands.send(command).await.is_err() || quit {
            break;
        }
    }
}

/// Render overlay changes as status lines
async fn show_overlay(mut view: watch::Receiver<OverlayView>) {
    let mut shown = OverlayView::default();

    while view.changed().await.is_ok() {
        let current = view.borrow_and_update().clone();

        if current.state != shown.state {
            eprintln!("[{}]", current.state);
        }
        if current.caption != shown.caption && !current.caption.is_empty() {
            eprintln!("  {}", current.caption);
        }
        match &current.notice {
            Some(notice) if current.notice != shown.notice => eprintln!("! {notice}"),
            _ => {}
        }
        shown = current;
    }
}

/// Print each completed turn
async fn print_turns(mut turns: broadcast::Receiver<Turn>, json: bool) {
    loop {
        match turns.recv().await {
            Ok(turn) => print_turn(&turn, json),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "transcript feed lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_turn(turn: &Turn, json: bool) {
    if json {
        match serde_json::to_string(turn) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "turn serialization failed"),
        }
    } else {
        println!("You: {}", turn.user_text);
        println!("Karuna: {}", turn.assistant_text);
    }
}

/// Ask one typed question and record it in the transcript
async fn chat(config: &Config, question: &str, json: bool) -> anyhow::Result<()> {
    let backend = HttpBackend::new(&config.backend)?;
    let transcript = TranscriptBridge::new();

    let answer = backend.chat(question, SessionId::current()).await?;
    transcript.append(Turn::new(question, answer, None));

    for turn in transcript.history() {
        print_turn(&turn, json);
    }
    Ok(())
}

/// Fetch the greeting, print it and play its audio
async fn greet(config: &Config) -> anyhow::Result<()> {
    let backend = HttpBackend::new(&config.backend)?;
    let greeting = backend.greeting(SessionId::current()).await?;

    if let Some(text) = &greeting.text {
        println!("{text}");
    }

    let Some(audio) = greeting.audio else {
        tracing::debug!("greeting has no audio");
        return Ok(());
    };
    let source = AudioSource::parse(&audio)?;

    tokio::task::spawn_blocking(move || {
        let (samples, rate) = decode_mp3(&source.fetch()?)?;
        play_samples(&samples, rate, &AtomicBool::new(false))
    })
    .await??;
    Ok(())
}

/// Width of the level meter in columns
const METER_WIDTH: usize = 40;

/// Print a live input level meter
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    let mut capture = AudioCapture::new()?;
    capture.start()?;
    println!("Recording at {SAMPLE_RATE} Hz for {duration}s, say something...");

    let mut loudest = 0.0_f32;
    for second in 1..=duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.drain();
        let level = rms(&samples);
        loudest = loudest.max(level);
        println!("{second:>3}s  {level:.4}  |{}|", meter(level));
    }

    let faulted = capture.has_faulted();
    capture.stop();

    if faulted {
        println!("The input stream reported errors; check the device with `arecord -l`.");
    } else if loudest < 0.01 {
        println!("Input stayed silent. Check `pactl info | grep 'Default Source'`.");
    } else {
        println!("Microphone OK (peak level {loudest:.4}).");
    }
    Ok(())
}

/// Render a level as a bar of `#`
fn meter(level: f32) -> String {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let filled = ((level * 4.0).min(1.0) * METER_WIDTH as f32) as usize;
    format!("{}{}", "#".repeat(filled), " ".repeat(METER_WIDTH - filled))
}

/// Play a short two-tone chime on the default output
async fn test_speaker() -> anyhow::Result<()> {
    const RATE: u32 = 24000;

    #[allow(clippy::cast_precision_loss)]
    let chime: Vec<f32> = [440.0_f32, 660.0]
        .iter()
        .flat_map(|&frequency| {
            (0..RATE).map(move |i| {
                let t = i as f32 / RATE as f32;
                let fade = 1.0 - t;
                (std::f32::consts::TAU * frequency * t).sin() * 0.3 * fade
            })
        })
        .collect();

    println!("Playing a two-tone chime on the default output...");
    tokio::task::spawn_blocking(move || play_samples(&chime, RATE, &AtomicBool::new(false)))
        .await??;

    println!("Done. If nothing was audible, check `pactl list sinks short`.");
    Ok(())
}
