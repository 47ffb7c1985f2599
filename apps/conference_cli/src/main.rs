use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{
    config::DEFAULT_SETTINGS_FILE, load_settings, transcript, Command, ConferenceEngine,
    EngineEvent, SessionUpdate,
};
use shared::{domain::Participant, protocol::SessionConfig};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Start a multi-agent AI conference and follow it live")]
struct Args {
    /// Backend base URL; overrides the settings file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long, default_value_t = 3)]
    rounds: u32,
    #[arg(long)]
    scenario: Option<String>,
    /// `id:name:title`, repeatable. The moderator seat is added automatically.
    #[arg(long = "participant", value_parser = parse_participant)]
    participants: Vec<Participant>,
    /// Transcript destination when the conference finishes (file or directory).
    #[arg(long)]
    export: Option<PathBuf>,
    #[arg(long)]
    list_scenarios: bool,
    /// Print the final session snapshot as JSON.
    #[arg(long)]
    snapshot_json: bool,
}

fn parse_participant(raw: &str) -> Result<Participant, String> {
    let mut parts = raw.splitn(3, ':').map(str::trim);
    let id = parts.next().filter(|s| !s.is_empty());
    let name = parts.next().filter(|s| !s.is_empty());
    match (id, name) {
        (Some(id), Some(name)) => Ok(Participant::new(id, name, parts.next().unwrap_or(""))),
        _ => Err(format!("expected id:name[:title], got `{raw}`")),
    }
}

const HISTORY_PAGE: u32 = 20;

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(Command),
    Export,
    Status,
    History,
    Quit,
    Help,
}

fn parse_input(line: &str) -> Option<Input> {
    let input = match line.trim().to_lowercase().as_str() {
        "" => return None,
        "next" | "n" => Input::Send(Command::NextRound),
        "pause" | "p" => Input::Send(Command::PauseConference),
        "resume" | "r" => Input::Send(Command::ResumeConference),
        "end" => Input::Send(Command::EndConference),
        "export" => Input::Export,
        "status" => Input::Status,
        "history" | "h" => Input::History,
        "quit" | "exit" | "q" => Input::Quit,
        _ => Input::Help,
    };
    Some(input)
}

enum Step {
    Engine(Option<EngineEvent>),
    Line(std::io::Result<Option<String>>),
    Interrupted,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(url) = &args.server_url {
        settings.server_url = url.clone();
    }
    info!(server_url = %settings.server_url, "using backend");
    let mut engine = ConferenceEngine::from_settings(&settings)?;

    if args.list_scenarios {
        let catalog = engine.rest().fetch_scenarios().await?;
        for (id, scenario) in &catalog.scenarios {
            let marker = if catalog.default.as_deref() == Some(id.as_str()) {
                "*"
            } else {
                " "
            };
            println!("{marker} {id}: {} - {}", scenario.name, scenario.description);
        }
        if let Some(guide) = &catalog.selection_guide {
            println!("\n{guide}");
        }
        return Ok(());
    }

    let topic = args
        .topic
        .clone()
        .ok_or_else(|| anyhow!("--topic is required unless --list-scenarios is given"))?;
    if args.participants.is_empty() {
        return Err(anyhow!("at least one --participant is required"));
    }
    let mut config = SessionConfig::new(topic, args.rounds, args.participants.clone()).with_moderator();
    if let Some(scenario) = &args.scenario {
        config = config.with_scenario(scenario.clone());
    }

    let printer = tokio::spawn(print_updates(engine.subscribe()));
    let session_id = engine.start_session(config).await?;
    println!("conference {session_id} started; commands: next, pause, resume, end, export, status, history, quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        let step = tokio::select! {
            event = engine.next_event() => Step::Engine(event),
            line = stdin.next_line(), if stdin_open => Step::Line(line),
            _ = tokio::signal::ctrl_c() => Step::Interrupted,
        };

        match step {
            Step::Engine(Some(event)) => engine.handle_event(event).await,
            Step::Engine(None) => break,
            Step::Line(Ok(Some(line))) => match parse_input(&line) {
                Some(Input::Send(command)) => {
                    if let Err(err) = engine.dispatch(command) {
                        eprintln!("[rejected] {err}");
                    }
                }
                Some(Input::Export) => {
                    let path = write_transcript(&engine, Path::new(".")).await?;
                    println!("transcript written to {}", path.display());
                }
                Some(Input::Status) => {
                    let session = engine.session();
                    println!(
                        "stage={} round={}/{} messages={} connection={}",
                        session.stage,
                        session.current_round,
                        session.rounds(),
                        session.messages.len(),
                        session.connection.status
                    );
                }
                Some(Input::History) => match engine.fetch_history(HISTORY_PAGE, 0).await {
                    Ok(page) => {
                        println!("backend holds {} message(s); first page:", page.total);
                        for message in page.messages {
                            println!("  {} - {}: {}", message.timestamp, message.speaker_name, message.text);
                        }
                    }
                    Err(err) => eprintln!("[history] {err}"),
                },
                Some(Input::Quit) => break,
                Some(Input::Help) => {
                    println!("commands: next, pause, resume, end, export, status, history, quit")
                }
                None => {}
            },
            Step::Line(Ok(None)) => stdin_open = false,
            Step::Line(Err(err)) => {
                warn!(error = %err, "stdin unreadable; continuing without input");
                stdin_open = false;
            }
            Step::Interrupted => {
                info!("interrupted");
                break;
            }
        }

        if engine.is_settled() {
            debug!(status = %engine.connection_status(), "engine settled");
            break;
        }
    }

    engine.close();
    if let Some(target) = &args.export {
        let path = write_transcript(&engine, target).await?;
        println!("transcript written to {}", path.display());
    }
    if args.snapshot_json {
        println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
    }
    if let Some(error) = &engine.session().connection.last_error {
        eprintln!("last error: {error}");
    }

    drop(engine);
    let _ = printer.await;
    Ok(())
}

async fn write_transcript(engine: &ConferenceEngine, target: &Path) -> Result<PathBuf> {
    let is_dir = tokio::fs::metadata(target)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    let path = if is_dir {
        let today = chrono::Local::now().date_naive();
        target.join(transcript::suggested_filename(engine.session(), today))
    } else {
        target.to_path_buf()
    };
    tokio::fs::write(&path, engine.export_transcript())
        .await
        .with_context(|| format!("failed to write transcript to {}", path.display()))?;
    Ok(path)
}

async fn print_updates(rx: broadcast::Receiver<SessionUpdate>) {
    let mut updates = BroadcastStream::new(rx);
    while let Some(update) = updates.next().await {
        match update {
            Ok(update) => render(update),
            Err(err) => warn!(error = %err, "display fell behind"),
        }
    }
}

fn render(update: SessionUpdate) {
    match update {
        SessionUpdate::SessionAssigned(id) => println!("[session] {id}"),
        SessionUpdate::Resynced {
            stage,
            current_round,
            message_count,
        } => println!("[sync] stage={stage} round={current_round} messages={message_count}"),
        SessionUpdate::MessageAppended(message) => println!(
            "\n{} ({}):\n{}",
            message.speaker_name, message.speaker_title, message.text
        ),
        SessionUpdate::StageChanged { from, to } => println!("[stage] {from} -> {to}"),
        SessionUpdate::RoundChanged(round) => println!("[round] {round}"),
        SessionUpdate::RoundCompleted(Some(round)) => println!("[round] {round} completed"),
        SessionUpdate::RoundCompleted(None) => println!("[round] completed"),
        SessionUpdate::ConclusionSet(text) => println!("\n== Conclusion ==\n{text}"),
        SessionUpdate::ConnectionChanged(state) => {
            debug!(status = %state.status, close_code = ?state.last_close_code, "connection")
        }
        SessionUpdate::Error(message) => eprintln!("[error] {message}"),
        SessionUpdate::Anomaly(_) => {}
    }
}
