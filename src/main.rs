use chrono::Local;
use clap::{Parser, Subcommand};
use cue_flow::audio_runtime::{is_message_file, spawn_audio_runtime, AudioHandle};
use cue_flow::config::{default_config_dir, Settings};
use cue_flow::fade::{AudioFadeManager, FadeCurve, FadePreset, MAX_FADE_SECS};
use cue_flow::message_item::{Priority, QueueItem};
use cue_flow::message_queue_manager::{LoopSettings, MessageQueueManager};
use cue_flow::player::{Player, SimulatedPlayer};
use cue_flow::queue_service::QueueService;
use cue_flow::serializer::{LoadKind, QueueSerializer};
use cue_flow::sources::RadioSources;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cueflow", about = "Radio message scheduler CLI")]
struct Cli {
    /// Directory holding cueflow_config.json
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue and fade status
    Status,
    /// List queued messages
    List,
    /// Queue a message file from the messages folder
    Add {
        /// File name inside the messages folder
        file: String,
        /// Priority (1 = highest)
        #[arg(short, long, default_value = "1")]
        priority: u8,
        /// Repeat interval in minutes (0 = play once)
        #[arg(short, long, default_value = "5")]
        interval: f64,
    },
    /// Remove a queued message
    Remove { file: String },
    /// Remove every queued message
    Clear,
    /// Apply a fade preset: professional, fast, smooth, dramatic
    Preset { name: String },
    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
    /// Run the scheduler with an interactive console
    Run {
        /// Looped background program (overrides config)
        #[arg(short, long)]
        background: Option<PathBuf>,
        /// Simulate playback without an audio device
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Show current configuration
    Show,
    /// Set fade parameters
    Fade {
        /// Fade duration in seconds (0.5-5)
        #[arg(short, long)]
        duration: Option<f32>,
        /// linear, exponential, logarithmic or smooth
        #[arg(short, long)]
        curve: Option<String>,
        /// Background level during messages, percent (0-50)
        #[arg(short, long)]
        floor: Option<u8>,
    },
    /// Show file locations
    Paths,
    /// Set the messages folder
    Messages { dir: PathBuf },
    /// Set the background program ("off" to clear)
    Background { file: String },
    /// Named background programs
    Source {
        #[command(subcommand)]
        action: SourceCmd,
    },
}

#[derive(Subcommand)]
enum SourceCmd {
    /// List background sources
    List,
    /// Add a named background source
    Add { name: String, file: PathBuf },
    /// Remove a source by name or number
    Remove { name: String },
    /// Make a source current
    Use { name: String },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let mut settings = Settings::load(&config_dir);

    match cli.command {
        Commands::Status => {
            println!("cueFlow v{}", env!("CARGO_PKG_VERSION"));
            let loaded = QueueSerializer::new(&settings.queue_file).load(Local::now());
            let active = loaded
                .items
                .iter()
                .filter(|m| m.is_active())
                .map(|m| m.priority)
                .min();
            println!(
                "Messages: {} | Active tier: {} | State: {}",
                loaded.items.len(),
                active.map(|p| p.to_string()).unwrap_or_else(|| "none".into()),
                load_kind_display(loaded.kind)
            );
            print_fade(&settings);
        }
        Commands::List => {
            let loaded = QueueSerializer::new(&settings.queue_file).load(Local::now());
            let mut items = loaded.items;
            items.sort_by_key(|m| m.priority);
            print_items(&items);
        }
        Commands::Add { file, priority, interval } => {
            if !is_message_file(Path::new(&file)) {
                eprintln!("Error: '{}' is not an mp3, wav, aac or ogg file", file);
                std::process::exit(1);
            }
            if !settings.messages_dir.join(&file).exists() {
                eprintln!(
                    "Warning: '{}' not found in {}",
                    file,
                    settings.messages_dir.display()
                );
            }
            let mut queue = QueueService::open(&settings.queue_file);
            match queue.add(&file, Priority(priority), interval) {
                Ok(item) => println!(
                    "Queued {} {} every {} ({})",
                    item.priority,
                    item.filename,
                    item.interval_display(),
                    if item.is_pending { "pending" } else { "active" }
                ),
                Err(e) => eprintln!("Error: {}", e),
            }
            finish_offline(&queue);
        }
        Commands::Remove { file } => {
            let mut queue = QueueService::open(&settings.queue_file);
            match queue.remove(&file) {
                Ok(item) => println!("Removed {} {}", item.priority, item.filename),
                Err(e) => eprintln!("Error: {}", e),
            }
            finish_offline(&queue);
        }
        Commands::Clear => {
            let mut queue = QueueService::open(&settings.queue_file);
            let count = queue.len();
            queue.clear();
            finish_offline(&queue);
            println!("Cleared {} message(s).", count);
        }
        Commands::Preset { name } => match FadePreset::from_str_loose(&name) {
            Ok(preset) => {
                let (duration, curve, floor) = preset.values();
                settings.fade.duration_secs = duration;
                settings.fade.curve = curve;
                settings.fade.background_volume = floor;
                save_settings(&settings, &config_dir);
                println!("Preset '{}' applied.", preset);
                print_fade(&settings);
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<String> = FadePreset::ALL.iter().map(|p| p.to_string()).collect();
                eprintln!("Presets: {}", names.join(", "));
                std::process::exit(1);
            }
        },
        Commands::Config { action } => match action {
            ConfigCmd::Show => {
                println!("Messages folder: {}", settings.messages_dir.display());
                println!(
                    "Background: {}",
                    settings
                        .background_file
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "none".into())
                );
                print_fade(&settings);
                println!(
                    "Loop: tick {}s, error cooldown {}s, shutdown timeout {}s",
                    settings.tick_secs, settings.error_cooldown_secs, settings.shutdown_timeout_secs
                );
            }
            ConfigCmd::Fade { duration, curve, floor } => {
                let curve = match curve.as_deref().map(FadeCurve::from_str_loose).transpose() {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    }
                };
                if let Some(d) = duration {
                    settings.fade.duration_secs = d.clamp(0.5, MAX_FADE_SECS);
                }
                if let Some(c) = curve {
                    settings.fade.curve = c;
                }
                if let Some(f) = floor {
                    settings.fade.background_volume = f.min(50);
                }
                save_settings(&settings, &config_dir);
                print_fade(&settings);
            }
            ConfigCmd::Paths => {
                println!("Config:   {}", Settings::path_in(&config_dir).display());
                println!("Queue:    {}", settings.queue_file.display());
                println!(
                    "Session:  {}",
                    QueueSerializer::new(&settings.queue_file).marker_path().display()
                );
                println!("Messages: {}", settings.messages_dir.display());
                println!("Sources:  {}", RadioSources::path_in(&config_dir).display());
            }
            ConfigCmd::Messages { dir } => {
                settings.messages_dir = dir;
                save_settings(&settings, &config_dir);
                println!("Messages folder set to {}", settings.messages_dir.display());
            }
            ConfigCmd::Background { file } => {
                settings.background_file = if file.eq_ignore_ascii_case("off") {
                    None
                } else {
                    Some(PathBuf::from(file))
                };
                save_settings(&settings, &config_dir);
                println!("Background updated.");
            }
            ConfigCmd::Source { action } => source_command(action, &config_dir),
        },
        Commands::Run { background, dry_run } => {
            let background = background
                .or_else(|| RadioSources::load(&config_dir).current().map(|s| s.path.clone()))
                .or_else(|| settings.background_file.clone());
            run(&settings, &config_dir, background, dry_run);
        }
    }
}

fn source_command(action: SourceCmd, config_dir: &Path) {
    let mut sources = RadioSources::load(config_dir);
    let result = match action {
        SourceCmd::List => {
            print_sources(&sources);
            return;
        }
        SourceCmd::Add { name, file } => {
            if !file.exists() {
                eprintln!("Warning: '{}' does not exist yet", file.display());
            }
            sources.add(&name, file).map(|s| println!("Added source {}", s))
        }
        SourceCmd::Remove { name } => sources.remove(&name).map(|s| println!("Removed source {}", s.name)),
        SourceCmd::Use { name } => sources.set_current(&name).map(|s| println!("Current source: {}", s)),
    };
    if let Err(e) = result.and_then(|()| sources.save(config_dir)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(settings: &Settings, config_dir: &Path, background: Option<PathBuf>, dry_run: bool) {
    let mut audio: Option<AudioHandle> = None;
    let player: Arc<dyn Player> = if dry_run {
        println!("Dry run: messages are simulated (5s each).");
        Arc::new(SimulatedPlayer::new(Duration::from_secs(5)))
    } else {
        match spawn_audio_runtime(background, settings.messages_dir.clone()) {
            Ok(handle) => {
                audio = Some(handle.clone());
                Arc::new(handle)
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    };

    let fades = AudioFadeManager::with_settings(player.clone(), settings.fade);
    fades.set_fade_settings(
        Some(settings.fade.duration_secs),
        Some(settings.fade.curve),
        Some(settings.fade.background_volume),
    );

    let queue = QueueService::open(&settings.queue_file);
    println!(
        "Loaded {} message(s) ({}).",
        queue.len(),
        load_kind_display(queue.load_kind())
    );
    let queue = queue.shared();

    let mut manager = MessageQueueManager::new(
        queue.clone(),
        player.clone(),
        Arc::new(fades),
        LoopSettings::from(settings),
    );
    if let Err(e) = manager.start() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    println!(
        "Commands: add <file> [priority] [minutes], remove <file>, list, clear, status, preset <name>, sources, source <name>, quit"
    );
    let stdin = io::stdin();
    prompt();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => {}
            ["quit"] | ["exit"] => break,
            ["add", file, rest @ ..] if rest.len() <= 2 => match parse_add_args(rest) {
                Ok((priority, interval)) => match queue.lock().add(file, priority, interval) {
                    Ok(item) => println!("Queued {} {}", item.priority, item.filename),
                    Err(e) => println!("Error: {}", e),
                },
                Err(e) => println!("Error: {}", e),
            },
            ["remove", file] => match queue.lock().remove(file) {
                Ok(item) => println!("Removed {}", item.filename),
                Err(e) => println!("Error: {}", e),
            },
            ["list"] => print_items(&queue.lock().get_queue_items()),
            ["clear"] => {
                queue.lock().clear();
                println!("Queue cleared.");
            }
            ["status"] => {
                let status = manager.status();
                println!(
                    "Running: {} | Playing: {} | Messages: {} | Active tier: {}",
                    status.running,
                    status.current_message.as_deref().unwrap_or("-"),
                    status.queue_len,
                    status
                        .active_priority
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "none".into())
                );
            }
            ["preset", name] => match manager.fades().apply_preset(name) {
                Ok(s) => println!("Fade: {:.1}s {} to {}%", s.duration_secs, s.curve, s.background_volume),
                Err(e) => println!("Error: {}", e),
            },
            ["sources"] => print_sources(&RadioSources::load(config_dir)),
            ["source", name] => {
                let mut sources = RadioSources::load(config_dir);
                let switched = sources.set_current(name).cloned().and_then(|source| {
                    player.switch_background_source(&source.path)?;
                    sources.save(config_dir)?;
                    Ok(source)
                });
                match switched {
                    Ok(source) => println!("Background now {}", source),
                    Err(e) => println!("Error: {}", e),
                }
            }
            _ => println!("Unknown command: {}", line.trim()),
        }
        prompt();
    }

    println!("Shutting down...");
    manager.stop();
    finish_offline(&queue.lock());
    if let Some(handle) = audio {
        handle.shutdown();
    }
}

/// Optional `[priority] [minutes]` of the console `add`. Missing values
/// default to priority 1 every 5 minutes; malformed ones are errors.
fn parse_add_args(args: &[&str]) -> Result<(Priority, f64), String> {
    let priority = match args.first() {
        Some(raw) => match raw.parse::<u8>() {
            Ok(p) if Priority(p).is_valid() => Priority(p),
            Ok(p) => return Err(format!("priority must be 1 or greater, got {}", p)),
            Err(_) => return Err(format!("'{}' is not a priority (1-255)", raw)),
        },
        None => Priority(1),
    };
    let interval = match args.get(1) {
        Some(raw) => match raw.parse::<f64>() {
            Ok(i) if i.is_finite() && i >= 0.0 => i,
            _ => return Err(format!("'{}' is not an interval in minutes", raw)),
        },
        None => 5.0,
    };
    Ok((priority, interval))
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

/// Final save so the next start reschedules from scratch.
fn finish_offline(queue: &QueueService) {
    if let Err(e) = queue.shutdown_save() {
        eprintln!("Error: could not save queue: {}", e);
    }
}

fn save_settings(settings: &Settings, config_dir: &Path) {
    if let Err(e) = settings.save(config_dir) {
        eprintln!("Error: could not save config: {}", e);
        std::process::exit(1);
    }
}

fn print_sources(sources: &RadioSources) {
    if sources.is_empty() {
        println!("No background sources.");
        return;
    }
    for (i, source) in sources.sources().iter().enumerate() {
        let marker = if sources.is_current(&source.name) { "*" } else { " " };
        println!("{} {}. {}", marker, i + 1, source);
    }
}

fn print_fade(settings: &Settings) {
    let fade = &settings.fade;
    println!(
        "Fade: {:.1}s {} | Background during messages: {}% | Normal: {}%",
        fade.duration_secs, fade.curve, fade.background_volume, fade.normal_volume
    );
}

fn print_items(items: &[QueueItem]) {
    if items.is_empty() {
        println!("Queue is empty.");
        return;
    }
    let now = Local::now();
    println!("{:<4} {:<32} {:<10} {:<8} {:<9} {}", "Pri", "File", "Interval", "State", "Next", "In");
    for item in items {
        let state = if item.is_spent() {
            "spent"
        } else if item.is_pending {
            "pending"
        } else {
            "active"
        };
        let (next, countdown) = if item.is_active() {
            (item.next_play_time_display(), format!("{}s", item.countdown_secs(now)))
        } else {
            ("-".to_string(), "-".to_string())
        };
        println!(
            "{:<4} {:<32} {:<10} {:<8} {:<9} {}",
            item.priority,
            item.filename,
            item.interval_display(),
            state,
            next,
            countdown
        );
    }
}

fn load_kind_display(kind: LoadKind) -> String {
    match kind {
        LoadKind::Fresh => "fresh".into(),
        LoadKind::LiveReload => "live reload".into(),
        LoadKind::Restart(reason) => format!("restart: {}", reason),
    }
}
