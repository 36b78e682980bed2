// questkeeper-cli/src/models/cli.rs
use clap::{ArgAction, Parser, Subcommand};
use uuid::Uuid;

/// QuestKeeper: an AI game master in your terminal.
/// Starts an interactive session by default, or plays a single turn with --task.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase message verbosity.
    ///
    /// Specify multiple times for more verbose output:
    ///  -v:  INFO level
    ///  -vv: DEBUG level
    ///  -vvv: TRACE level (most verbose)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Play a single turn non-interactively and exit.
    #[arg(short, long)]
    pub task: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List saved campaign sessions.
    Sessions {
        /// Maximum number of sessions to show.
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Show a saved session's messages.
    View {
        /// Session id.
        id: Uuid,
        /// Print complete message contents instead of previews.
        #[arg(long)]
        full: bool,
    },
    /// Delete a saved session.
    Delete {
        /// Session id.
        id: Uuid,
    },
    /// Resume a saved session. Picks interactively when no id is given.
    Resume {
        /// Session id.
        id: Option<Uuid>,
        /// Play a single turn non-interactively and exit.
        #[arg(short, long)]
        task: Option<String>,
    },
}
