// questkeeper-cli/src/session.rs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use uuid::Uuid;

use questkeeper_core::models::chat::ChatMessage;

const SESSION_SUBDIR: &str = ".questkeeper/sessions";
const TITLE_MAX_CHARS: usize = 48;

/// One saved campaign: the full message history plus bookkeeping.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CampaignSession {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

impl CampaignSession {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        let now = Utc::now();
        CampaignSession {
            id: Uuid::new_v4(),
            title: None,
            created_at: now,
            last_updated_at: now,
            messages,
        }
    }

    /// Derives a title from the first thing the player said. Does nothing
    /// once a title exists or while there is no user message yet.
    pub fn ensure_title(&mut self) {
        if self.title.is_some() {
            return;
        }
        let Some(first) = self
            .messages
            .iter()
            .find(|m| m.role.to_lowercase() == "user")
        else {
            return;
        };
        let content = first.content.as_deref().unwrap_or("").trim();
        if content.is_empty() {
            return;
        }
        let short: String = content.chars().take(TITLE_MAX_CHARS).collect();
        self.title = Some(if content.chars().count() > TITLE_MAX_CHARS {
            format!("{}...", short.trim_end())
        } else {
            short
        });
    }
}

// --- Helper Functions ---

/// Gets the project-local session storage directory, creating it if needed.
fn ensure_session_dir(project_root: &Path) -> Result<PathBuf> {
    let session_path = project_root.join(SESSION_SUBDIR);
    fs::create_dir_all(&session_path)
        .with_context(|| format!("Failed to create session directory at {:?}", session_path))?;
    Ok(session_path)
}

fn session_file_path(project_root: &Path, id: Uuid) -> Result<PathBuf> {
    let session_dir = ensure_session_dir(project_root)?;
    Ok(session_dir.join(format!("{}.json", id)))
}

/// Saves a session as pretty-printed JSON in the project's session directory.
pub fn save_session(project_root: &Path, session: &CampaignSession) -> Result<()> {
    let file_path = session_file_path(project_root, session.id)?;
    let file = File::create(&file_path)
        .with_context(|| format!("Failed to create session file at {:?}", file_path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, session)
        .with_context(|| format!("Failed to serialize session to {:?}", file_path))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush writer for {:?}", file_path))?;
    Ok(())
}

/// Loads a session by id from the project's session directory.
pub fn load_session(project_root: &Path, id: Uuid) -> Result<CampaignSession> {
    let file_path = session_file_path(project_root, id)?;
    if !file_path.exists() {
        return Err(anyhow::anyhow!("Session file not found at {:?}", file_path));
    }
    let file = File::open(&file_path)
        .with_context(|| format!("Failed to open session file at {:?}", file_path))?;
    let reader = BufReader::new(file);
    let session: CampaignSession = serde_json::from_reader(reader)
        .with_context(|| format!("Failed to deserialize session from {:?}", file_path))?;
    Ok(session)
}

/// Deletes a session file by id.
pub fn delete_session(project_root: &Path, id: Uuid) -> Result<()> {
    let file_path = session_file_path(project_root, id)?;
    if file_path.exists() {
        fs::remove_file(&file_path)
            .with_context(|| format!("Failed to delete session file at {:?}", file_path))?;
        Ok(())
    } else {
        Err(anyhow::anyhow!("Session with ID {} not found.", id))
    }
}

/// Lists all saved sessions in the project, newest first.
pub fn list_sessions(project_root: &Path) -> Result<Vec<CampaignSession>> {
    let session_dir = ensure_session_dir(project_root)?;
    let mut sessions = Vec::new();

    for entry in fs::read_dir(&session_dir)
        .with_context(|| format!("Failed to read session directory at {:?}", session_dir))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = Uuid::parse_str(stem) {
                    match load_session(project_root, id) {
                        Ok(session) => sessions.push(session),
                        Err(e) => {
                            eprintln!("Warning: Failed to load session file {:?}: {}", path, e);
                        }
                    }
                }
            }
        }
    }

    sessions.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
    Ok(sessions)
}

/// One-line label for a session: its title, or the first player message.
pub fn session_preview(session: &CampaignSession) -> String {
    if let Some(title) = &session.title {
        return title.clone();
    }
    session
        .messages
        .iter()
        .find(|m| m.role.to_lowercase() == "user")
        .map(|m| {
            let content_str = m.content.as_deref().unwrap_or("");
            let preview: String = content_str.chars().take(70).collect();
            if content_str.chars().count() > 70 {
                format!("{}...", preview)
            } else {
                preview
            }
        })
        .unwrap_or_else(|| "[No player messages]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn session_with_messages(messages: Vec<ChatMessage>) -> CampaignSession {
        CampaignSession::new(messages)
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempdir().unwrap();
        let session = session_with_messages(vec![
            ChatMessage::system("You are the game master."),
            ChatMessage::user("I enter the crypt."),
        ]);
        save_session(dir.path(), &session).unwrap();

        let loaded = load_session(dir.path(), session.id).unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].content.as_deref(), Some("I enter the crypt."));
    }

    #[test]
    fn list_orders_newest_first() {
        let dir = tempdir().unwrap();
        let mut older = session_with_messages(vec![ChatMessage::user("old campaign")]);
        older.last_updated_at = Utc::now() - Duration::hours(2);
        let newer = session_with_messages(vec![ChatMessage::user("new campaign")]);
        save_session(dir.path(), &older).unwrap();
        save_session(dir.path(), &newer).unwrap();

        let sessions = list_sessions(dir.path()).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, newer.id);
        assert_eq!(sessions[1].id, older.id);
    }

    #[test]
    fn delete_missing_session_errors() {
        let dir = tempdir().unwrap();
        assert!(delete_session(dir.path(), Uuid::new_v4()).is_err());
    }

    #[test]
    fn preview_prefers_title_over_first_message() {
        let mut session = session_with_messages(vec![ChatMessage::user("I attack the goblin!")]);
        assert_eq!(session_preview(&session), "I attack the goblin!");
        session.title = Some("Goblin ambush".to_string());
        assert_eq!(session_preview(&session), "Goblin ambush");
    }

    #[test]
    fn ensure_title_truncates_long_openers() {
        let long = "a".repeat(100);
        let mut session = session_with_messages(vec![ChatMessage::user(long)]);
        session.ensure_title();
        let title = session.title.clone().unwrap();
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 3);

        // A second call must not overwrite an existing title.
        session.messages.push(ChatMessage::user("different opener"));
        let before = session.title.clone();
        session.ensure_title();
        assert_eq!(session.title, before);
    }
}
