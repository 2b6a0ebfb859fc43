use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use silvercare_voice::call::{AgentTransport, CallState, DuplexCallSession, WebSocketTransport};
use silvercare_voice::config::{self, ApiKey};
use silvercare_voice::devices::{AcquireOutcome, DeviceResourceManager, MediaBackend, SystemMediaBackend};
use silvercare_voice::events::{EventBus, signal_channel};
use silvercare_voice::services::{
    HttpIntentService, HttpReplyGenerator, IntentService, ReplyOnlyIntentService,
};
use silvercare_voice::voice::{
    AudioCapture, CloudRecognizer, CpalOutput, PlayableBuffer, PlaybackScheduler,
    SentenceStreamingTts, SpeechRecognizer, SpeechSynthesizer, SpeechToText, SubmitMode,
    TextToSpeech, UnavailableRecognizer,
};
use silvercare_voice::{Companion, CompanionCommand, CompanionDeps, Config};

/// `SilverCare` - voice-first companion
#[derive(Parser)]
#[command(name = "silvercare", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable the wake word listener (calls and typed commands still work)
    #[arg(long, env = "SILVERCARE_DISABLE_VOICE")]
    disable_voice: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test streamed TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "您好，我是小玲。今天感觉怎么样？")]
        text: String,
    },
    /// Start a live call directly
    Call,
    /// List cameras and try acquiring media
    Devices {
        /// Cycle through every camera once
        #[arg(long)]
        cycle: bool,
    },
    /// Show configuration and key status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,silvercare_voice=info",
        1 => "info,silvercare_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&text).await,
            Command::Call => cmd_call().await,
            Command::Devices { cycle } => cmd_devices(cycle).await,
            Command::Status => cmd_status(),
        };
    }

    let mut config = Config::load()?;
    if cli.disable_voice {
        config.voice.enabled = false;
    }
    tracing::debug!(language = %config.locale, "loaded configuration");

    let media: Arc<dyn MediaBackend> = Arc::new(SystemMediaBackend::new());
    let scheduler = Arc::new(PlaybackScheduler::new(Arc::new(CpalOutput::new()?)));
    let speech = Arc::new(SentenceStreamingTts::new(
        scheduler,
        build_synthesizer(&config)?,
    ));

    let deps = CompanionDeps {
        recognizer: build_recognizer(&config, Arc::clone(&media)),
        intent: build_intent(&config),
        replies: Arc::new(HttpReplyGenerator::new(
            config.services.chat_url.clone(),
            config.api_keys.openai.as_ref().map(|k| k.value.clone()),
            config.services.chat_model.clone(),
            config.services.system_instruction.clone(),
        )),
        speech,
        media,
        transport: build_transport(&config)?,
    };

    let bus = EventBus::new();
    let companion = Companion::new(&config, deps, bus.clone())?;

    let (command_tx, command_rx) = mpsc::channel(16);
    let (_signal_tx, signal_rx) = signal_channel();

    // Log everything the companion reports
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = %json, "companion event"),
                Err(e) => tracing::warn!(error = %e, "unserializable event"),
            }
        }
    });

    tokio::spawn(read_console_commands(command_tx.clone()));

    let ctrl_c_tx = command_tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c_tx.send(CompanionCommand::Shutdown).await;
        }
    });

    if config.voice.enabled {
        tracing::info!(
            "silvercare ready - say \"{}\"",
            config.dialogue.wake_words.first().map_or("", String::as_str)
        );
    } else {
        tracing::info!("silvercare ready (voice listener disabled, type commands)");
    }

    companion.run(command_rx, signal_rx).await?;
    Ok(())
}

/// Map console lines to companion commands
async fn read_console_commands(commands: mpsc::Sender<CompanionCommand>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = match line.trim() {
            "" => continue,
            "/call" => CompanionCommand::StartCall,
            "/retry" => CompanionCommand::RetryCall,
            "/end" => CompanionCommand::EndCall,
            "/camera" => CompanionCommand::SwitchCamera,
            "/mute" => CompanionCommand::SetMuted(true),
            "/unmute" => CompanionCommand::SetMuted(false),
            "/quit" => CompanionCommand::Shutdown,
            text => CompanionCommand::SendText(text.to_string()),
        };
        if commands.send(command).await.is_err() {
            break;
        }
    }
}

fn required_key(key: Option<&ApiKey>, env_name: &str) -> anyhow::Result<SecretString> {
    Ok(config::require_key(key, env_name)?)
}

fn build_synthesizer(config: &Config) -> anyhow::Result<Arc<dyn SpeechSynthesizer>> {
    let voice = &config.voice;
    let tts = if voice.tts_provider == "elevenlabs" {
        TextToSpeech::new_elevenlabs(
            required_key(config.api_keys.elevenlabs.as_ref(), "ELEVENLABS_API_KEY")?,
            voice.tts_voice.clone(),
            voice.tts_model.clone(),
        )?
    } else {
        TextToSpeech::new_openai(
            required_key(config.api_keys.openai.as_ref(), "OPENAI_API_KEY")?,
            voice.tts_voice.clone(),
            voice.tts_speed,
            voice.tts_model.clone(),
        )?
    };
    Ok(Arc::new(tts))
}

fn build_recognizer(config: &Config, media: Arc<dyn MediaBackend>) -> Arc<dyn SpeechRecognizer> {
    let voice = &config.voice;
    let stt = if voice.stt_provider == "deepgram" {
        config.api_keys.deepgram.as_ref().map(|key| {
            SpeechToText::new_deepgram(
                key.value.clone(),
                voice.stt_model.clone(),
                config.locale.tag().to_string(),
            )
        })
    } else {
        config.api_keys.openai.as_ref().map(|key| {
            SpeechToText::new_whisper(
                key.value.clone(),
                voice.stt_model.clone(),
                config.locale.tag().to_string(),
            )
        })
    };

    match stt {
        Some(Ok(stt)) => Arc::new(CloudRecognizer::new(media, Arc::new(stt))),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "speech recognition disabled");
            Arc::new(UnavailableRecognizer)
        }
        None => {
            tracing::warn!(provider = %voice.stt_provider, "no STT key, speech recognition disabled");
            Arc::new(UnavailableRecognizer)
        }
    }
}

fn build_intent(config: &Config) -> Arc<dyn IntentService> {
    match &config.services.intent_url {
        Some(url) => Arc::new(HttpIntentService::new(
            url.clone(),
            config.api_keys.silvercare.as_ref().map(|k| k.value.clone()),
        )),
        None => {
            tracing::info!("no intent service configured, every command is a reply");
            Arc::new(ReplyOnlyIntentService)
        }
    }
}

fn build_transport(config: &Config) -> anyhow::Result<Arc<dyn AgentTransport>> {
    let key = required_key(config.api_keys.silvercare.as_ref(), "SILVERCARE_API_KEY")?;
    Ok(Arc::new(WebSocketTransport::new(&config.call.agent_url, key)?))
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let capture = AudioCapture::start()?;

    let sample_rate = capture.sample_rate();
    println!("Sample rate: {sample_rate} Hz, channels: {}", capture.channels());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_buffer();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with three back-to-back tones
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear three rising tones with no gaps\n");

    let scheduler = PlaybackScheduler::new(Arc::new(CpalOutput::new()?));
    let sample_rate = 24_000_u32;

    for frequency in [440.0_f32, 554.37, 659.25] {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (0..sample_rate / 2)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
            })
            .collect();
        let buffer = PlayableBuffer::new(samples, sample_rate, 1)?;
        if let Some(scheduled) = scheduler.enqueue(&buffer) {
            println!("{frequency:>7.2} Hz at {:.3}s", scheduled.start);
        }
    }

    scheduler.wait_idle().await;

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test clause-streamed TTS output
async fn test_tts(text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load()?;
    let scheduler = Arc::new(PlaybackScheduler::new(Arc::new(CpalOutput::new()?)));
    let speech = SentenceStreamingTts::new(Arc::clone(&scheduler), build_synthesizer(&config)?);

    let spoken = speech.speak(text, SubmitMode::Interrupt).await?;
    println!(
        "Scheduled {} clause(s), {} failed",
        spoken.clauses_played, spoken.clauses_failed
    );
    scheduler.wait_idle().await;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// Run a single live call until it ends or Ctrl-C
async fn cmd_call() -> anyhow::Result<()> {
    let config = Config::load()?;
    let transport = build_transport(&config)?;
    let scheduler = Arc::new(PlaybackScheduler::new(Arc::new(CpalOutput::new()?)));

    let mut devices = DeviceResourceManager::new(Arc::new(SystemMediaBackend::new()));
    let outcome = devices.acquire(config.call.camera_index).await;
    let mic_degraded = outcome.is_degraded();
    let stream = match outcome {
        AcquireOutcome::Success(stream) | AcquireOutcome::Degraded(stream) => stream,
        AcquireOutcome::Failed(reason) => anyhow::bail!("no camera or microphone: {reason}"),
    };
    if mic_degraded {
        println!("Microphone unavailable, sending video only");
    }

    let session = DuplexCallSession::new(
        transport,
        scheduler,
        stream,
        mic_degraded,
        config.call.options(),
    );
    session.connect().await?;
    println!("Connected (session {}), press Ctrl-C to hang up", session.id());

    tokio::select! {
        () = session.ended() => {}
        _ = tokio::signal::ctrl_c() => session.close(),
    }
    devices.release();

    if let CallState::Error(reason) = session.state() {
        println!("Call failed: {reason}");
    }
    for entry in session.transcript() {
        println!("[{}] {:?}: {}", entry.at.format("%H:%M:%S"), entry.speaker, entry.text);
    }

    Ok(())
}

/// List devices and try acquiring media
async fn cmd_devices(cycle: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let mut devices = DeviceResourceManager::new(Arc::new(SystemMediaBackend::new()));

    let mut outcome = devices.acquire(config.call.camera_index).await;
    let rounds = if cycle {
        devices.inventory().cameras.len().max(1)
    } else {
        1
    };

    for round in 0..rounds {
        if round > 0 {
            outcome = devices.cycle().await;
        }
        let inventory = devices.inventory();
        let camera = inventory
            .cameras
            .get(inventory.current_index)
            .map_or("none", |c| c.label.as_str());
        let result = match &outcome {
            AcquireOutcome::Success(_) => "ok".to_string(),
            AcquireOutcome::Degraded(_) => "video only".to_string(),
            AcquireOutcome::Failed(reason) => format!("failed: {reason}"),
        };
        println!(
            "camera {}/{}: {camera} | microphone: {} | {result}",
            inventory.current_index + 1,
            inventory.cameras.len(),
            if inventory.mic_available { "yes" } else { "no" },
        );
    }

    devices.release();
    Ok(())
}

/// Show configuration and key status
fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load()?;

    println!("Language:     {}", config.locale);
    println!("Voice:        {}", if config.voice.enabled { "enabled" } else { "disabled" });
    println!("STT:          {} ({})", config.voice.stt_provider, config.voice.stt_model);
    println!("TTS:          {} ({}, {})", config.voice.tts_provider, config.voice.tts_model, config.voice.tts_voice);
    println!("Agent:        {}", config.call.agent_url);
    println!(
        "Intent:       {}",
        config.services.intent_url.as_deref().unwrap_or("none (replies only)")
    );
    println!("Wake words:   {}", config.dialogue.wake_words.join(", "));
    println!();

    for key in config.api_keys.status() {
        println!(
            "{:<12} {:<16} {}",
            key.name,
            key.source.to_string(),
            key.display.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
