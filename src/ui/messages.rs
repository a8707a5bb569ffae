use num_format::{Locale, ToFormattedString};
use std::time::Duration;

use crate::{
    audio::{player::EnqueueOutcome, queue::QueueSnapshot},
    bot::client::OutgoingMessage,
    moderation::{FanOutReport, ModerationRecord},
    sources::Track,
    stats::StatusSnapshot,
    storage::TrackRecord,
    ui::buttons,
};

/// Límite práctico por mensaje (Telegram acepta 4096)
pub const MAX_MESSAGE_CHARS: usize = 4000;

pub const NO_PERMISSION: &str = "❌ You don't have permission to use this command.";
pub const INVALID_USER_ID: &str = "❌ Invalid user ID. Please provide a valid numeric ID.";
pub const DEFAULT_REASON: &str = "No reason provided";
pub const NOT_PLAYING: &str = "❌ No music is currently playing.";
pub const NOT_FOUND: &str = "❌ Sorry, I couldn't find any matching songs.";
pub const QUEUE_EMPTY_ANNOUNCEMENT: &str = "📋 Music queue is now empty.";
pub const GROUP_ONLY: &str = "❌ This command can only be used in groups.";

/// Formats seconds as `m:ss` or `h:mm:ss`; zero means unknown.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "Unknown".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn now_playing(track: &Track) -> OutgoingMessage {
    OutgoingMessage::html(format!(
        "🎵 <b>Now Playing:</b>\n<b>Title:</b> {}\n<b>Duration:</b> {}",
        escape_html(&track.title),
        format_duration(track.duration)
    ))
    .with_buttons(vec![vec![buttons::watch_button(track)]])
}

pub fn searching(query: &str) -> String {
    format!("🔍 Searching for: {}", query)
}

pub fn enqueued(outcome: EnqueueOutcome, track: &Track) -> String {
    match outcome {
        EnqueueOutcome::Started => format!("🎵 Added to queue and starting playback: {}", track.title),
        EnqueueOutcome::Queued { position } => {
            format!("🎵 Added to queue (position {}): {}", position, track.title)
        }
        EnqueueOutcome::QueuedWhilePaused { position } => format!(
            "🎵 Added to queue (position {}): {}\n⏸️ Playback is paused, use /resume to continue.",
            position, track.title
        ),
    }
}

pub fn queue(snapshot: &QueueSnapshot) -> OutgoingMessage {
    if snapshot.is_empty() {
        return OutgoingMessage::plain("📋 The music queue is empty. Use /play to add songs.");
    }

    let mut text = String::from("📋 <b>Music Queue:</b>\n\n");
    if let Some(current) = &snapshot.current {
        text.push_str(&format!("<b>Now Playing:</b> {}\n\n", escape_html(&current.title)));
    }

    if !snapshot.pending.is_empty() {
        text.push_str("<b>Up Next:</b>\n");
        for (i, track) in snapshot.pending.iter().enumerate() {
            let line = format!(
                "{}. {} ({})\n",
                i + 1,
                escape_html(&track.title),
                format_duration(track.duration)
            );
            if text.len() + line.len() > MAX_MESSAGE_CHARS {
                text.push_str(&format!("… and {} more\n", snapshot.pending.len() - i));
                break;
            }
            text.push_str(&line);
        }
    }

    OutgoingMessage::html(text)
}

pub fn search_results(tracks: &[Track]) -> OutgoingMessage {
    OutgoingMessage::html("🔍 <b>Search Results:</b>\nClick on a song to play it.")
        .with_buttons(buttons::search_keyboard(tracks))
}

pub fn start(first_name: &str) -> String {
    format!(
        "👋 Hi {}! I'm Slayer, a music and moderation bot.\n\
         Use /play to queue a song or /help to see everything I can do.",
        first_name
    )
}

pub fn help() -> OutgoingMessage {
    let mut text = String::from("🤖 <b>Slayer Bot Commands</b>\n");
    for (section, commands) in crate::bot::commands::HELP_SECTIONS {
        text.push_str(&format!("\n<b>{}</b>\n", section));
        for (name, description) in *commands {
            text.push_str(&format!("/{} - {}\n", name, escape_html(description)));
        }
    }
    OutgoingMessage::html(text)
}

pub fn about() -> String {
    format!(
        "🎵 Slayer Bot v{}\n\
         Music queues, moderation and AI chat for Telegram groups.",
        env!("CARGO_PKG_VERSION")
    )
}

pub fn reason_or_default(reason: Option<&str>) -> &str {
    reason.unwrap_or(DEFAULT_REASON)
}

pub fn global_ban_done(user_id: u64, reason: Option<&str>, report: &FanOutReport) -> String {
    format!(
        "✅ User {} has been globally banned.\nReason: {}\n\n\
         ✅ Successfully banned from {} chats.\n❌ Failed to ban from {} chats.",
        user_id,
        reason_or_default(reason),
        report.succeeded,
        report.failed
    )
}

pub fn global_unban_done(user_id: u64, report: &FanOutReport) -> String {
    format!(
        "✅ User {} has been removed from the global ban list.\n\n\
         ✅ Successfully unbanned from {} chats.\n❌ Failed to unban from {} chats.",
        user_id, report.succeeded, report.failed
    )
}

pub fn global_ban_enforced(user_id: u64, reason: Option<&str>) -> String {
    format!(
        "⚠️ User {} is on the global ban list and has been banned from this chat.\nReason: {}",
        user_id,
        reason_or_default(reason)
    )
}

/// Splits the global ban list into messages under the size limit.
pub fn global_ban_list(records: &[ModerationRecord]) -> Vec<String> {
    if records.is_empty() {
        return vec!["📝 The global ban list is empty.".to_string()];
    }

    let entries: Vec<String> = records
        .iter()
        .map(|r| {
            format!(
                "👤 User ID: {}\n📄 Reason: {}\n👮 Banned by: {}\n📅 Date: {}\n",
                r.subject,
                reason_or_default(r.reason.as_deref()),
                r.actor,
                r.created_at.format("%Y-%m-%d %H:%M:%S")
            )
        })
        .collect();

    chunk_entries("📝 Global Ban List:\n\n", &entries, MAX_MESSAGE_CHARS)
}

pub fn sudo_list(owner_id: Option<u64>, users: &[u64]) -> String {
    let mut text = if users.is_empty() {
        String::from("No sudo users found.\n")
    } else {
        let mut text = String::from("📜 Sudo Users:\n\n");
        for (i, id) in users.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, id));
        }
        text
    };
    if let Some(owner) = owner_id {
        text.push_str(&format!("\n👑 Owner: {}", owner));
    }
    text
}

/// Extra numbers shown by `/stats` next to the counters.
pub struct StatsContext {
    pub known_chats: usize,
    pub tracked_songs: usize,
    pub active_global_bans: usize,
    pub active_playback_chats: usize,
}

pub fn stats(snapshot: &StatusSnapshot, context: &StatsContext, top: &[TrackRecord]) -> String {
    let uptime = humantime::format_duration(Duration::from_secs(snapshot.uptime_secs));
    let mut text = format!(
        "📊 Bot Statistics\n\n⏱️ Uptime: {}\n💬 Known chats: {}\n🎶 Active playback: {}\n📀 Tracked songs: {}\n🌐 Global bans: {}\n",
        uptime,
        format_count(context.known_chats as u64),
        format_count(context.active_playback_chats as u64),
        format_count(context.tracked_songs as u64),
        format_count(context.active_global_bans as u64),
    );

    if !snapshot.counters.is_empty() {
        text.push_str("\n📈 Counters:\n");
        for (name, value) in &snapshot.counters {
            text.push_str(&format!("• {}: {}\n", name.replace('_', " "), format_count(*value)));
        }
    }

    if !top.is_empty() {
        text.push_str("\n🏆 Most played:\n");
        for (i, record) in top.iter().enumerate() {
            text.push_str(&format!(
                "{}. {} ({} plays)\n",
                i + 1,
                record.track.title,
                format_count(record.play_count)
            ));
        }
    }

    text
}

fn format_count(value: u64) -> String {
    value.to_formatted_string(&Locale::en)
}

fn chunk_entries(header: &str, entries: &[String], limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = header.to_string();

    for entry in entries {
        let piece = format!("{}\n", entry);
        if current.len() + piece.len() > limit && current != header {
            chunks.push(current.trim_end().to_string());
            current = String::new();
        }
        current.push_str(&piece);
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    chunks
}
