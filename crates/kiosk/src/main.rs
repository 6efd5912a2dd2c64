use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use kiosk::attendance::{AttendanceLog, AttendanceTracker};
use kiosk::config::Config;
use kiosk::engine::{self, FaceReport, FaceStatus, Kiosk};
use kiosk::feed::{FeedDetector, FeedEmbedder, JsonlFeed};
use kiosk::store::TemplateStore;
use kiosk_core::IntentVerifier;

#[derive(Parser)]
#[command(name = "kiosk", about = "Face attendance kiosk")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize faces and log punches
    Run {
        /// JSON-lines frame feed ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        feed: PathBuf,
    },
    /// Enroll a new user from a burst of frames
    Register {
        /// Display name; must not already be enrolled
        #[arg(short, long)]
        name: String,
        /// JSON-lines frame feed ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        feed: PathBuf,
    },
    /// List enrolled users
    List,
    /// Print the attendance log
    Log,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Run { feed } => run(&config, &feed),
        Commands::Register { name, feed } => register(&config, &name, &feed),
        Commands::List => list(&config),
        Commands::Log => print_log(&config),
    }
}

fn open_feed(path: &Path) -> Result<JsonlFeed<Box<dyn BufRead>>> {
    let reader: Box<dyn BufRead> = if path == Path::new("-") {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open feed {}", path.display()))?;
        Box::new(BufReader::new(file))
    };
    Ok(JsonlFeed::new(reader))
}

fn build_kiosk(config: &Config) -> Kiosk<FeedDetector, FeedEmbedder> {
    Kiosk::new(
        FeedDetector,
        FeedEmbedder,
        IntentVerifier::new(config.intent()),
        config.recognition_threshold,
    )
}

fn print_report(report: &FaceReport) {
    match report.status {
        FaceStatus::Punched { .. } | FaceStatus::Wait { .. } | FaceStatus::Sampled { .. } => {
            println!("{}: {}", report.face_id, report.status.status_text());
        }
        _ => tracing::debug!(face = %report.face_id, status = %report.status.status_text()),
    }
}

fn run(config: &Config, feed: &Path) -> Result<()> {
    let store = TemplateStore::load(&config.store_path(), config.hash()?);
    if store.is_empty() {
        tracing::warn!("no users enrolled; every face will be Unknown");
    }
    let mut tracker = AttendanceTracker::open(&config.log_path(), config.cooldown())?;

    let mut kiosk = build_kiosk(config);
    if config.liveness_enabled {
        tracing::info!("liveness challenge enabled");
        kiosk = kiosk.with_liveness(config.liveness());
    }

    tracing::info!(
        camera = config.camera_index,
        width = config.frame_width,
        height = config.frame_height,
        users = store.len(),
        "kiosk running"
    );
    let mut source = open_feed(feed)?;
    let summary = engine::run_attendance(&mut source, &mut kiosk, &store, &mut tracker, print_report)?;
    println!("{} frames, {} punches", summary.frames, summary.punches);
    Ok(())
}

fn register(config: &Config, name: &str, feed: &Path) -> Result<()> {
    let name = name.trim();
    anyhow::ensure!(!name.is_empty(), "name must not be empty");

    let mut store = TemplateStore::load(&config.store_path(), config.hash()?);
    let mut kiosk = build_kiosk(config);
    let mut source = open_feed(feed)?;

    let template = engine::run_registration(
        &mut source,
        &mut kiosk,
        &mut store,
        name,
        config.samples_per_enroll,
        print_report,
    )?;
    println!("Enrolled {} ({})", template.name, template.key);
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = TemplateStore::load(&config.store_path(), config.hash()?);
    if store.is_empty() {
        println!("No users enrolled");
        return Ok(());
    }
    println!("{:<24} {:<16} DIM", "NAME", "KEY");
    for t in store.templates() {
        let short_key: String = t.key.chars().take(16).collect();
        println!("{:<24} {:<16} {}", t.name, short_key, t.embedding.dim());
    }
    Ok(())
}

fn print_log(config: &Config) -> Result<()> {
    let log = AttendanceLog::open(&config.log_path())?;
    log.export(std::io::stdout().lock())?;
    Ok(())
}
