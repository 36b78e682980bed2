// questkeeper-cli/src/rendering.rs
use anyhow::Result;
use colored::*;
use std::io::{self, Write};
use termimad::{crossterm::style::Color, MadSkin};

use questkeeper_core::stores::game::{HitPoints, PartyMember, PartySnapshot};

fn create_skin() -> MadSkin {
    let mut skin = MadSkin::default();
    skin.inline_code.set_fg(Color::Cyan);
    skin.bold.set_fg(Color::Yellow);
    skin.italic.set_fg(Color::Magenta);
    skin
}

/// Renders game-master markdown to the terminal.
pub fn print_formatted(markdown_text: &str) -> Result<()> {
    let skin = create_skin();
    let mut stdout = io::stdout().lock();
    skin.write_text_on(&mut stdout, markdown_text)?;
    stdout.flush()?;
    Ok(())
}

/// Red banner line shown under the narration while an encounter is active.
pub fn print_combat_banner(line: &str) {
    println!("{}", format!("[Combat] {}", line).red().bold());
}

fn hp_display(hp: &HitPoints) -> String {
    let text = format!("{}/{}", hp.current, hp.max);
    if hp.max <= 0 {
        return text;
    }
    let ratio = hp.current as f64 / hp.max as f64;
    if ratio <= 0.25 {
        text.red().to_string()
    } else if ratio <= 0.5 {
        text.yellow().to_string()
    } else {
        text.green().to_string()
    }
}

fn member_line(member: &PartyMember, active: bool) -> String {
    let marker = if active { "*" } else { " " };
    let mut line = format!("{} {:<16}", marker, member.name);
    if let Some(level) = member.level {
        line.push_str(&format!(" Lvl {:<2}", level));
    }
    if let Some(class) = &member.class {
        line.push_str(&format!(" {:<10}", class));
    }
    line.push_str(&format!(" HP {}", hp_display(&member.hp)));
    if let Some(ac) = member.armor_class {
        line.push_str(&format!("  AC {}", ac));
    }
    if !member.conditions.is_empty() {
        line.push_str(&format!("  [{}]", member.conditions.join(", ").dimmed()));
    }
    line
}

/// Prints the party roster, marking the active character with `*`.
pub fn print_party(snapshot: &PartySnapshot) {
    if snapshot.party.is_empty() {
        println!("{}", "The party is empty. Ask the game master to create a character.".dimmed());
        return;
    }
    println!("\n{}", "Party".bold());
    for member in &snapshot.party {
        let active = snapshot
            .active_character_id
            .as_deref()
            .map_or(false, |id| id == member.id);
        println!("{}", member_line(member, active));
    }
    println!();
}
