// questkeeper-cli/src/main.rs
mod models;
mod rendering;
mod session;

use anyhow::{anyhow, Context, Result};
use colored::*;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use uuid::Uuid;

use dialoguer::{theme::ColorfulTheme, Confirm, FuzzySelect};
use indicatif::{ProgressBar, ProgressStyle};
use rustyline::error::ReadlineError;
use rustyline::{Config as ReadlineConfig, DefaultEditor};
use tokio::sync::mpsc;

use questkeeper_core::{ChatMessage, ClientConfig, GameMaster};

use crate::rendering::{print_combat_banner, print_formatted, print_party};
use crate::session::{
    delete_session, list_sessions, load_session, save_session, session_preview, CampaignSession,
};

use clap::Parser;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{
    fmt::{self, time::LocalTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const CONFIG_FILENAME: &str = "QuestKeeper.toml";
const LOG_FILE_NAME: &str = "questkeeper.log";

fn find_project_root() -> Result<PathBuf> {
    let current_dir = env::current_dir().context("Failed to get current directory")?;
    let mut current = current_dir.as_path();
    loop {
        let config_path = current.join(CONFIG_FILENAME);
        if config_path.exists() && config_path.is_file() {
            return Ok(current.to_path_buf());
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => {
                return Err(anyhow!(
                    "Could not find '{}' in current directory or any parent directory.",
                    CONFIG_FILENAME
                ));
            }
        }
    }
}

fn load_client_config() -> Result<(ClientConfig, PathBuf)> {
    let project_root = find_project_root()?;
    let config_path = project_root.join(CONFIG_FILENAME);
    info!("Found configuration file at: {:?}", config_path);
    let config_toml_content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
    let config = ClientConfig::from_toml_str(&config_toml_content)
        .context("Failed to parse or validate configuration content")?;
    Ok((config, project_root))
}

fn print_welcome_message(session: &CampaignSession, master: &GameMaster) {
    println!("\n{}", "QuestKeeper - AI Game Master".cyan().bold());
    if let Some(title) = &session.title {
        println!("{}: {}", "Campaign".cyan(), title);
    }
    println!("{}: {}", "Session ID".cyan(), session.id);
    let provider_id = &master.config().default_provider;
    if let Some(instance) = master.config().providers.get(provider_id) {
        println!(
            "{}: {} ({})",
            "Model".cyan(),
            instance.model_config.model_name,
            provider_id
        );
    }
    println!(
        "{}",
        "Type /party for the roster, /combat for the battlefield, /sessions for saved games."
            .dimmed()
    );
    println!(
        "{}",
        "Type 'exit', 'quit', Ctrl-D, or press Enter on an empty line to quit. Type 'new' for a fresh campaign."
            .dimmed()
    );
    println!();
}

fn thinking_spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "-"]),
    );
    pb.set_message("The game master is thinking...");
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

fn new_session(master: &GameMaster) -> CampaignSession {
    CampaignSession::new(vec![ChatMessage::system(
        master.config().system_prompt.clone(),
    )])
}

async fn print_combat_hud(master: &GameMaster) {
    if let Some(line) = master.combat().describe().await {
        print_combat_banner(&line);
    }
}

/// Plays one streaming turn: chunks print as they arrive, the spinner
/// clears on the first one, and the session history is updated on success.
async fn play_streaming_turn(
    master: &Arc<GameMaster>,
    session: &mut CampaignSession,
    input: &str,
) -> Result<()> {
    let mut history = session.messages.clone();
    history.push(ChatMessage::user(input));

    let pb = thinking_spinner()?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let spinner = pb.clone();
    let printer = tokio::spawn(async move {
        let mut streamed = false;
        while let Some(chunk) = rx.recv().await {
            if !streamed {
                spinner.finish_and_clear();
                println!();
                streamed = true;
            }
            print!("{}", chunk);
            let _ = io::stdout().flush();
        }
        streamed
    });

    let turn_result = master.stream_message(history, tx).await;
    // The turn dropped its sender, so the printer drains and exits.
    let streamed = printer.await.unwrap_or(false);
    pb.finish_and_clear();

    match turn_result {
        Ok((reply, updated)) => {
            if !streamed && !reply.trim().is_empty() {
                println!();
                if let Err(e) = print_formatted(&reply) {
                    error!("Failed to render reply markdown: {}. Printing raw.", e);
                    println!("{}", reply);
                }
            }
            println!();
            print_combat_hud(master).await;
            session.messages = updated;
            session.last_updated_at = chrono::Utc::now();
            session.ensure_title();
            Ok(())
        }
        Err(e) => Err(anyhow!(e)),
    }
}

/// Plays a single turn non-interactively and saves the session.
async fn run_single_turn(
    master: &Arc<GameMaster>,
    mut session: CampaignSession,
    project_root: &Path,
    prompt: String,
) -> Result<()> {
    info!(task = %prompt, session_id = %session.id, "Running non-interactive turn.");

    let mut history = session.messages.clone();
    history.push(ChatMessage::user(prompt));

    let pb = thinking_spinner()?;
    let turn_result = master.send_message(history).await;
    pb.finish_and_clear();

    match turn_result {
        Ok((reply, updated)) => {
            // Raw output here; formatting is for the interactive view.
            println!("{}", reply);
            session.messages = updated;
            session.last_updated_at = chrono::Utc::now();
            session.ensure_title();
            save_session(project_root, &session)?;
            info!(session_id = %session.id, "Saved updated session.");
            Ok(())
        }
        Err(e) => {
            error!("The game master ran into an error: {}", e);
            Err(anyhow!(e))
        }
    }
}

/// Runs an interactive campaign session using rustyline for a REPL
/// experience.
async fn run_interactive(
    master: Arc<GameMaster>,
    mut session: CampaignSession,
    project_root: PathBuf,
) -> Result<()> {
    print_welcome_message(&session, &master);

    let rl_config = ReadlineConfig::builder()
        .history_ignore_space(true)
        .completion_type(rustyline::CompletionType::List)
        .edit_mode(rustyline::EditMode::Emacs)
        .auto_add_history(true)
        .build();
    let mut rl = DefaultEditor::with_config(rl_config)?;

    let input_history_dir = dirs::cache_dir()
        .map(|d| d.join("questkeeper"))
        .ok_or_else(|| anyhow!("Could not determine cache directory for input history"))?;
    fs::create_dir_all(&input_history_dir).context("Failed to create input history directory")?;
    let input_history_path = input_history_dir.join("cli_history.txt");
    if rl.load_history(&input_history_path).is_err() {
        debug!(path = %input_history_path.display(), "No previous input history found or error loading.");
    }

    let prompt = format!("{} ", ">".green().bold());

    loop {
        let readline_result = rl.readline(&prompt);

        match readline_result {
            Ok(line) => {
                let trimmed_input = line.trim();

                if trimmed_input.is_empty()
                    || trimmed_input.eq_ignore_ascii_case("exit")
                    || trimmed_input.eq_ignore_ascii_case("quit")
                    || trimmed_input.eq_ignore_ascii_case("/exit")
                {
                    info!("Exit command or empty line entered, leaving the table.");
                    break;
                }

                if trimmed_input.eq_ignore_ascii_case("new")
                    || trimmed_input.eq_ignore_ascii_case("/new")
                {
                    println!("\n{}", "Starting a new campaign...".cyan());
                    if let Err(e) = save_session(&project_root, &session) {
                        error!(session_id = %session.id, "Failed to save session before starting new: {}", e);
                        eprintln!("{}", "Error: Failed to save the previous campaign.".red());
                    } else {
                        info!(session_id = %session.id, "Saved current session before starting new.");
                    }
                    session = new_session(&master);
                    info!(session_id = %session.id, "Started new campaign session.");
                    print_welcome_message(&session, &master);
                    continue;
                }

                if trimmed_input.eq_ignore_ascii_case("/party") {
                    let snapshot = master.game().snapshot().await;
                    print_party(&snapshot);
                    continue;
                }

                if trimmed_input.eq_ignore_ascii_case("/combat") {
                    match master.combat().battlefield_report().await {
                        Some(report) => println!("\n{}\n", report),
                        None => println!("{}", "No combat is underway.".dimmed()),
                    }
                    continue;
                }

                if trimmed_input.eq_ignore_ascii_case("/sessions") {
                    if let Err(e) = handle_list_sessions(&project_root, 10) {
                        error!("Failed to list sessions: {}", e);
                    }
                    continue;
                }

                match play_streaming_turn(&master, &mut session, trimmed_input).await {
                    Ok(()) => {
                        if let Err(e) = save_session(&project_root, &session) {
                            error!(session_id = %session.id, "Failed to save session: {}", e);
                            eprintln!("{}", "Error: Failed to save the campaign session.".red());
                        } else {
                            info!(session_id = %session.id, "Saved updated session.");
                        }
                    }
                    Err(e) => {
                        error!("The game master ran into an error: {}", e);
                        eprintln!(
                            "\n{}: {}",
                            "The game master ran into an error".red(),
                            e
                        );
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".yellow());
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("EOF detected, leaving the table.");
                break;
            }
            Err(err) => {
                error!("Readline error: {:?}", err);
                eprintln!("Error reading input: {}", err.to_string().red());
                break;
            }
        }
    }

    if let Err(e) = rl.save_history(&input_history_path) {
        warn!(path = %input_history_path.display(), error = %e, "Failed to save input history.");
    }

    if let Err(e) = save_session(&project_root, &session) {
        error!(session_id = %session.id, "Failed to save final session on exit: {}", e);
        eprintln!("{}", "Error: Failed to save the campaign session.".red());
    } else {
        info!(session_id = %session.id, "Saved final session on exit.");
    }

    println!("\n{}\n", "Campaign saved. Farewell, adventurer.".cyan());
    Ok(())
}

// --- Functions for sessions, view, delete ---

fn handle_list_sessions(project_root: &Path, limit: usize) -> Result<()> {
    let sessions = list_sessions(project_root)?;
    if sessions.is_empty() {
        println!("No saved sessions found.");
        return Ok(());
    }

    println!("\n{}", "Saved Campaigns:".bold());
    println!(
        "{:<36} {:<20} {}",
        "ID".underline(),
        "Last Played".underline(),
        "Title".underline()
    );
    for entry in sessions.iter().take(limit) {
        let local_time = entry.last_updated_at.with_timezone(&chrono::Local);
        println!(
            "{:<36} {:<20} {}",
            entry.id.to_string(),
            local_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            session_preview(entry).dimmed()
        );
    }
    println!(
        "\n{}",
        "(Use 'questkeeper resume <ID>' to pick up where you left off)".dimmed()
    );
    Ok(())
}

fn handle_view_session(project_root: &Path, id: Uuid, full: bool) -> Result<()> {
    let session = load_session(project_root, id)?;
    let created_local = session.created_at.with_timezone(&chrono::Local);
    let updated_local = session.last_updated_at.with_timezone(&chrono::Local);

    println!("\n{}", format!("Session ID: {}", session.id).bold());
    if let Some(title) = &session.title {
        println!("Campaign:        {}", title);
    }
    println!("Created:         {}", created_local.format("%Y-%m-%d %H:%M:%S %Z"));
    println!("Last Played:     {}", updated_local.format("%Y-%m-%d %H:%M:%S %Z"));
    println!("Messages:        {}", session.messages.len());
    println!("{}", "--- Messages ---".bold());

    for message in &session.messages {
        println!("\n[{}]", message.role.to_uppercase().cyan());
        let content_str = message.content.as_deref().unwrap_or("");

        if full {
            if let Err(e) = print_formatted(content_str) {
                error!("Failed to render message markdown in full view: {}. Printing raw.", e);
                println!("{}", content_str);
            }
        } else {
            let preview: String = content_str
                .lines()
                .next()
                .unwrap_or("")
                .chars()
                .take(100)
                .collect();
            println!("{}", preview.trim());
        }
    }
    println!("\n{}", "--- End ---".bold());

    let was_truncated = !full
        && session.messages.iter().any(|m| {
            let c = m.content.as_deref().unwrap_or("");
            c.lines().count() > 1 || c.chars().count() > 100
        });
    if was_truncated {
        println!("{}", "(Pass --full to see complete message content)".dimmed());
    }

    Ok(())
}

fn handle_delete_session(project_root: &Path, id: Uuid) -> Result<()> {
    if Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Delete campaign session {}?", id))
        .default(false)
        .interact()?
    {
        delete_session(project_root, id)?;
        println!("Session {} deleted.", id);
    } else {
        println!("Deletion cancelled.");
    }
    Ok(())
}

/// Fuzzy picker over saved sessions. Returns None when there is nothing to
/// resume or the player backs out.
fn pick_session(project_root: &Path) -> Result<Option<Uuid>> {
    let sessions = list_sessions(project_root)?;
    if sessions.is_empty() {
        println!("No saved sessions found.");
        return Ok(None);
    }
    let labels: Vec<String> = sessions
        .iter()
        .map(|s| {
            format!(
                "{}  {}  {}",
                s.id,
                s.last_updated_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M"),
                session_preview(s)
            )
        })
        .collect();
    let choice = FuzzySelect::with_theme(&ColorfulTheme::default())
        .with_prompt("Resume which campaign?")
        .items(&labels)
        .default(0)
        .interact_opt()?;
    Ok(choice.map(|index| sessions[index].id))
}

// --- Main Function ---

#[tokio::main]
async fn main() -> ExitCode {
    colored::control::set_override(true);

    dotenvy::dotenv().ok();
    let cli = models::cli::Cli::parse();

    // --- Logging Setup ---
    let default_level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(default_level.into()));

    let log_dir = match dirs::cache_dir()
        .or_else(dirs::runtime_dir)
        .or_else(|| Some(env::temp_dir()))
        .map(|d| d.join("questkeeper"))
    {
        Some(dir) => dir,
        None => {
            eprintln!(
                "{}",
                "Error: Could not determine a suitable directory for log files.".red()
            );
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!(
            "{} Failed to create log directory {}: {}",
            "Error:".red(),
            log_dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let log_path = log_dir.join(LOG_FILE_NAME);
    let file_appender = tracing_appender::rolling::never(&log_dir, LOG_FILE_NAME);
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let time_format_desc = match time::format_description::parse(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]",
    ) {
        Ok(desc) => desc,
        Err(e) => {
            eprintln!("Warning: Failed to parse time format, using default: {}", e);
            time::format_description::parse("[hour]:[minute]:[second]")
                .expect("Fallback time format failed")
        }
    };
    let local_timer = LocalTime::new(time_format_desc);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_timer(local_timer.clone());

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_timer(local_timer)
        .with_target(false)
        .with_level(true);

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("{} Failed to initialize logging: {}", "Error:".red(), e);
        return ExitCode::FAILURE;
    }
    colored::control::unset_override();

    info!(
        "Logging initialized. Level determined by RUST_LOG or -v flags (default: {}). Logging to stderr and {}",
        default_level,
        log_path.display()
    );
    // --- End Logging Setup ---

    // --- Load Config ---
    let (config, project_root) = match load_client_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!(
                "{} Could not find or load '{}'. Ensure you are in a QuestKeeper campaign directory.",
                "Error:".red(),
                CONFIG_FILENAME
            );
            return ExitCode::FAILURE;
        }
    };

    let master = match GameMaster::new(config) {
        Ok(master) => Arc::new(master),
        Err(e) => {
            error!("Failed to initialize the game client: {}", e);
            eprintln!("{} {}", "Error:".red(), e);
            return ExitCode::FAILURE;
        }
    };
    // Keeps the party and combat mirrors warm for the whole run.
    let _poll = master.spawn_backup_poll();

    // --- Command Handling ---
    let result = match cli.command {
        Some(models::cli::Commands::Sessions { limit }) => handle_list_sessions(&project_root, limit),
        Some(models::cli::Commands::View { id, full }) => {
            handle_view_session(&project_root, id, full)
        }
        Some(models::cli::Commands::Delete { id }) => handle_delete_session(&project_root, id),
        Some(models::cli::Commands::Resume { id, task }) => {
            let chosen = match id {
                Some(id) => Some(id),
                None => match pick_session(&project_root) {
                    Ok(choice) => choice,
                    Err(e) => {
                        error!("Failed to pick a session: {}", e);
                        None
                    }
                },
            };
            match chosen {
                Some(session_id) => match load_session(&project_root, session_id) {
                    Ok(session) => {
                        if let Some(prompt) = task {
                            run_single_turn(&master, session, &project_root, prompt).await
                        } else {
                            run_interactive(Arc::clone(&master), session, project_root.clone())
                                .await
                        }
                    }
                    Err(e) => {
                        error!("Failed to load session {}: {}", session_id, e);
                        eprintln!(
                            "{} Could not load session with ID: {}",
                            "Error:".red(),
                            session_id
                        );
                        Err(anyhow!("Failed to load session {}", session_id))
                    }
                },
                None => Ok(()),
            }
        }
        None => {
            let initial_session = new_session(&master);
            info!(session_id = %initial_session.id, "Starting new campaign session.");
            if let Some(prompt) = cli.task {
                run_single_turn(&master, initial_session, &project_root, prompt).await
            } else {
                run_interactive(Arc::clone(&master), initial_session, project_root.clone()).await
            }
        }
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            let error_string = e.to_string();
            let is_dialoguer_error = e.downcast_ref::<dialoguer::Error>().is_some();
            let already_handled = error_string.contains("Could not load session")
                || error_string.contains("The game master ran into an error")
                || error_string.contains("Failed to load session")
                || error_string.contains("Error reading input")
                || is_dialoguer_error;

            if !already_handled {
                error!("Operation failed: {}", e);
                eprintln!("{} Operation failed: {}", "Error:".red(), e);
            }
            ExitCode::FAILURE
        }
    }
}
