//! Command parsing and the command menu.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Ping,
    About,
    Ask,
    Play,
    Pause,
    Resume,
    Skip,
    Stop,
    Queue,
    Current,
    Search,
    Ban,
    Unban,
    Kick,
    Mute,
    Unmute,
    GBan,
    UnGBan,
    GBanList,
    AddSudo,
    DelSudo,
    SudoList,
    Stats,
}

impl Command {
    pub fn from_name(name: &str) -> Option<Self> {
        let command = match name.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "ping" => Self::Ping,
            "about" => Self::About,
            "ask" => Self::Ask,
            "play" => Self::Play,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "skip" => Self::Skip,
            "stop" => Self::Stop,
            "queue" => Self::Queue,
            "current" => Self::Current,
            "search" => Self::Search,
            "ban" => Self::Ban,
            "unban" => Self::Unban,
            "kick" => Self::Kick,
            "mute" => Self::Mute,
            "unmute" => Self::Unmute,
            "gban" => Self::GBan,
            "ungban" => Self::UnGBan,
            "gbanlist" => Self::GBanList,
            "addsudo" => Self::AddSudo,
            "delsudo" => Self::DelSudo,
            "sudolist" => Self::SudoList,
            "stats" => Self::Stats,
            _ => return None,
        };
        Some(command)
    }
}

/// A command line as typed: `/name[@bot] args...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Option<Command>,
    pub name: String,
    pub args: String,
}

/// Parses a slash command.
///
/// Returns `None` for plain text and for commands addressed to another
/// bot (`/play@OtherBot`).
pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Invocation> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };

    let name = match head.split_once('@') {
        Some((name, target)) => {
            let ours = bot_username.map(|u| u.eq_ignore_ascii_case(target)).unwrap_or(false);
            if !ours {
                return None;
            }
            name
        }
        None => head,
    };

    if name.is_empty() {
        return None;
    }

    Some(Invocation {
        command: Command::from_name(name),
        name: name.to_string(),
        args: args.to_string(),
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("missing user id")]
    Missing,
    #[error("invalid user id")]
    Invalid,
}

/// Splits `<user_id> [reason...]` moderation arguments.
pub fn parse_target(args: &str) -> Result<(u64, Option<String>), TargetError> {
    let mut parts = args.trim().splitn(2, char::is_whitespace);
    let id = parts.next().filter(|s| !s.is_empty()).ok_or(TargetError::Missing)?;
    let id: u64 = id.parse().map_err(|_| TargetError::Invalid)?;
    let reason = parts
        .next()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    Ok((id, reason))
}

/// Menú de comandos agrupado para /help
pub const HELP_SECTIONS: &[(&str, &[(&str, &str)])] = &[
    (
        "🎵 Music",
        &[
            ("play", "Play a song by name or URL"),
            ("pause", "Pause the current playback"),
            ("resume", "Resume the playback"),
            ("skip", "Skip to the next song"),
            ("stop", "Stop playback and clear queue"),
            ("queue", "Show the current music queue"),
            ("current", "Show the currently playing song"),
            ("search", "Search for songs"),
        ],
    ),
    (
        "🤖 General",
        &[
            ("start", "Start the bot"),
            ("help", "Show help information"),
            ("ask", "Ask the AI a question"),
            ("ping", "Check if the bot is responsive"),
            ("about", "About this bot"),
        ],
    ),
    (
        "🛡️ Moderation",
        &[
            ("ban", "Ban a user from the chat"),
            ("unban", "Unban a user from the chat"),
            ("kick", "Kick a user from the chat"),
            ("mute", "Mute a user in the chat"),
            ("unmute", "Unmute a user in the chat"),
            ("gban", "Globally ban a user from all groups (sudo only)"),
            ("ungban", "Remove a global ban (sudo only)"),
            ("gbanlist", "List all globally banned users (sudo only)"),
        ],
    ),
    (
        "👑 Admin",
        &[
            ("addsudo", "Add a sudo user (admin only)"),
            ("delsudo", "Remove a sudo user (admin only)"),
            ("sudolist", "List all sudo users (sudo only)"),
            ("stats", "Show bot statistics (sudo only)"),
        ],
    ),
];
