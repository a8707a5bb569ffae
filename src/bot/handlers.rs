//! Slash command handlers.
//!
//! [`dispatch`] checks who may run a command, runs it and counts it. Every
//! handler replies in the chat the command came from.

use anyhow::Result;
use tracing::{info, warn};

use crate::{
    audio::queue::PlaybackError,
    bot::{
        client::{ChatError, Restriction},
        commands::{parse_target, Command, TargetError},
        IncomingMessage, Sender, SlayerBot,
    },
    moderation::{
        sudo::{AddSudoOutcome, RemoveSudoOutcome},
        RevokeOutcome,
    },
    sources::ResolverError,
    stats::counters,
    ui::messages::{self, StatsContext},
};

/// Quién puede usar cada comando
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Anyone,
    /// Sudo users, the owner and configured admins.
    Sudo,
    /// Owner and configured admins only.
    Manager,
    /// Sudo users or administrators of the chat; groups only.
    ChatModerator,
}

pub fn required_access(command: Command) -> Access {
    match command {
        Command::GBan | Command::UnGBan | Command::GBanList | Command::SudoList | Command::Stats => {
            Access::Sudo
        }
        Command::AddSudo | Command::DelSudo => Access::Manager,
        Command::Ban | Command::Unban | Command::Kick | Command::Mute | Command::Unmute => {
            Access::ChatModerator
        }
        _ => Access::Anyone,
    }
}

pub async fn dispatch(
    bot: &SlayerBot,
    msg: &IncomingMessage,
    sender: &Sender,
    command: Command,
    args: &str,
) -> Result<()> {
    let chat_id = msg.chat.id;
    info!("📝 Comando {:?} usado por {} en {}", command, sender.id, chat_id);

    let access = required_access(command);
    if access == Access::ChatModerator && !msg.chat.is_group() {
        bot.reply(chat_id, messages::GROUP_ONLY).await;
        return Ok(());
    }

    if !is_allowed(bot, chat_id, sender.id, access).await {
        warn!("🚫 {} sin permiso para {:?} en {}", sender.id, command, chat_id);
        bot.reply(chat_id, messages::NO_PERMISSION).await;
        return Ok(());
    }

    match command {
        Command::Start => bot.reply(chat_id, messages::start(&sender.first_name)).await,
        Command::Help => bot.reply(chat_id, messages::help()).await,
        Command::Ping => bot.reply(chat_id, "🏓 Pong!").await,
        Command::About => bot.reply(chat_id, messages::about()).await,
        Command::Ask => handle_ask(bot, chat_id, sender, args).await,
        Command::Play => handle_play(bot, chat_id, args).await,
        Command::Pause => handle_pause(bot, chat_id).await,
        Command::Resume => handle_resume(bot, chat_id).await,
        Command::Skip => handle_skip(bot, chat_id).await,
        Command::Stop => handle_stop(bot, chat_id).await,
        Command::Queue => bot.reply(chat_id, messages::queue(&bot.scheduler.snapshot(chat_id).await)).await,
        Command::Current => handle_current(bot, chat_id).await,
        Command::Search => handle_search(bot, chat_id, args).await,
        Command::Ban => handle_ban(bot, chat_id, sender.id, args).await,
        Command::Unban => handle_unban(bot, chat_id, sender.id, args).await,
        Command::Kick => handle_kick(bot, chat_id, sender.id, args).await,
        Command::Mute => handle_mute(bot, chat_id, sender.id, args).await,
        Command::Unmute => handle_unmute(bot, chat_id, sender.id, args).await,
        Command::GBan => handle_gban(bot, chat_id, sender.id, args).await,
        Command::UnGBan => handle_ungban(bot, chat_id, sender.id, args).await,
        Command::GBanList => handle_gban_list(bot, chat_id).await,
        Command::AddSudo => handle_add_sudo(bot, chat_id, sender.id, args).await,
        Command::DelSudo => handle_del_sudo(bot, chat_id, sender.id, args).await,
        Command::SudoList => {
            let text = messages::sudo_list(bot.sudo.owner_id(), &bot.sudo.list());
            bot.reply(chat_id, text).await
        }
        Command::Stats => handle_stats(bot, chat_id).await,
    }

    bot.stats.increment(counters::COMMANDS_PROCESSED);
    Ok(())
}

async fn is_allowed(bot: &SlayerBot, chat_id: i64, user_id: u64, access: Access) -> bool {
    match access {
        Access::Anyone => true,
        Access::Sudo => bot.sudo.is_sudo(user_id),
        Access::Manager => bot.sudo.can_manage(user_id),
        Access::ChatModerator => {
            if bot.sudo.is_sudo(user_id) {
                return true;
            }
            match bot.client.get_chat_member(chat_id, user_id).await {
                Ok(member) => member.is_admin(),
                Err(e) => {
                    warn!("⚠️ No se pudo consultar el miembro {} en {}: {}", user_id, chat_id, e);
                    false
                }
            }
        }
    }
}

// ===== Música =====

async fn handle_play(bot: &SlayerBot, chat_id: i64, query: &str) {
    if query.is_empty() {
        bot.reply(
            chat_id,
            "Please provide a song name or URL after the /play command.\nExample: /play Bohemian Rhapsody",
        )
        .await;
        return;
    }

    bot.reply(chat_id, messages::searching(query)).await;

    match bot.resolver.resolve_one(query).await {
        Ok(track) => bot.enqueue_and_report(chat_id, track).await,
        Err(e) => {
            log_resolver_error(chat_id, query, &e);
            bot.reply(chat_id, messages::NOT_FOUND).await;
        }
    }
}

async fn handle_pause(bot: &SlayerBot, chat_id: i64) {
    match bot.scheduler.pause(chat_id).await {
        Ok(_) => bot.reply(chat_id, "⏸️ Music playback paused.").await,
        Err(_) => bot.reply(chat_id, messages::NOT_PLAYING).await,
    }
}

async fn handle_resume(bot: &SlayerBot, chat_id: i64) {
    let text = match bot.scheduler.resume(chat_id).await {
        Ok(()) => "▶️ Music playback resumed.",
        Err(PlaybackError::AlreadyPlaying) => "❓ Music is already playing.",
        Err(_) => "❌ No music in queue. Use /play to add songs.",
    };
    bot.reply(chat_id, text).await;
}

async fn handle_skip(bot: &SlayerBot, chat_id: i64) {
    match bot.scheduler.skip(chat_id).await {
        Ok(_) => bot.reply(chat_id, "⏭️ Skipping to the next song...").await,
        Err(_) => bot.reply(chat_id, messages::NOT_PLAYING).await,
    }
}

async fn handle_stop(bot: &SlayerBot, chat_id: i64) {
    if bot.scheduler.snapshot(chat_id).await.is_empty() {
        bot.reply(chat_id, messages::NOT_PLAYING).await;
        return;
    }
    bot.scheduler.stop(chat_id).await;
    bot.reply(chat_id, "⏹️ Music playback stopped and queue cleared.").await;
}

async fn handle_current(bot: &SlayerBot, chat_id: i64) {
    match bot.scheduler.current(chat_id).await {
        Some(track) => bot.reply(chat_id, messages::now_playing(&track)).await,
        None => bot.reply(chat_id, messages::NOT_PLAYING).await,
    }
}

async fn handle_search(bot: &SlayerBot, chat_id: i64, query: &str) {
    if query.is_empty() {
        bot.reply(
            chat_id,
            "Please provide a search query after the /search command.\nExample: /search Bohemian Rhapsody",
        )
        .await;
        return;
    }

    bot.reply(chat_id, messages::searching(query)).await;

    let limit = bot.config.search_results_limit;
    match bot.resolver.resolve_many(query, limit).await {
        Ok(tracks) if !tracks.is_empty() => bot.reply(chat_id, messages::search_results(&tracks)).await,
        Ok(_) => bot.reply(chat_id, "❌ No results found for your search.").await,
        Err(e) => {
            log_resolver_error(chat_id, query, &e);
            bot.reply(chat_id, "❌ No results found for your search.").await;
        }
    }
}

fn log_resolver_error(chat_id: i64, query: &str, error: &ResolverError) {
    match error {
        ResolverError::NotFound => info!("🔍 Sin resultados para '{}' en {}", query, chat_id),
        other => warn!("🔍 Falló la búsqueda '{}' en {}: {}", query, chat_id, other),
    }
}

// ===== AI =====

async fn handle_ask(bot: &SlayerBot, chat_id: i64, sender: &Sender, question: &str) {
    if question.is_empty() {
        bot.reply(
            chat_id,
            "Please provide a question after the /ask command.\nExample: /ask What's the weather like today?",
        )
        .await;
        return;
    }

    match bot.conversation.reply(chat_id, sender.id, question).await {
        Ok(answer) => {
            bot.reply(chat_id, answer).await;
            bot.stats.increment(counters::AI_CONVERSATIONS);
        }
        Err(e) => {
            warn!("🤖 /ask falló en {}: {}", chat_id, e);
            bot.reply(chat_id, e.user_message()).await;
        }
    }
}

// ===== Moderación por chat =====

/// Parses the target or replies with usage / invalid id.
async fn target(bot: &SlayerBot, chat_id: i64, args: &str, usage: &str) -> Option<(u64, Option<String>)> {
    match parse_target(args) {
        Ok(target) => Some(target),
        Err(TargetError::Missing) => {
            bot.reply(chat_id, usage).await;
            None
        }
        Err(TargetError::Invalid) => {
            bot.reply(chat_id, messages::INVALID_USER_ID).await;
            None
        }
    }
}

/// Checks that the bot itself may restrict members, replying when it cannot.
async fn bot_can_restrict(bot: &SlayerBot, chat_id: i64, action: &str) -> bool {
    let allowed = match bot.client.get_chat_member(chat_id, bot.client.bot_id()).await {
        Ok(member) => member.can_restrict,
        Err(e) => {
            warn!("⚠️ No se pudieron verificar los permisos del bot en {}: {}", chat_id, e);
            false
        }
    };

    if !allowed {
        bot.reply(
            chat_id,
            format!("❌ I don't have permission to {} users in this chat.", action),
        )
        .await;
    }
    allowed
}

async fn report_failure(bot: &SlayerBot, chat_id: i64, action: &str, error: ChatError) {
    warn!("❌ No se pudo {} en {}: {}", action, chat_id, error);
    bot.reply(chat_id, format!("❌ Failed to {} user: {}", action, error)).await;
}

async fn handle_ban(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to ban.\nExample: /ban 123456789 Spamming";
    let Some((user_id, reason)) = target(bot, chat_id, args, usage).await else {
        return;
    };
    if !bot_can_restrict(bot, chat_id, "ban").await {
        return;
    }

    if let Err(e) = bot.client.ban_member(chat_id, user_id).await {
        return report_failure(bot, chat_id, "ban", e).await;
    }

    let text = format!(
        "✅ User {} has been banned from this chat.\nReason: {}",
        user_id,
        messages::reason_or_default(reason.as_deref())
    );
    bot.moderation.ban(user_id, chat_id, actor, reason).await;
    bot.stats.increment(counters::USERS_BANNED);
    bot.reply(chat_id, text).await;
}

async fn handle_unban(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to unban.\nExample: /unban 123456789";
    let Some((user_id, _)) = target(bot, chat_id, args, usage).await else {
        return;
    };
    if !bot_can_restrict(bot, chat_id, "unban").await {
        return;
    }

    if let Err(e) = bot.client.unban_member(chat_id, user_id).await {
        return report_failure(bot, chat_id, "unban", e).await;
    }

    // Sin registro activo igual se desbanea en Telegram
    if bot.moderation.unban(user_id, chat_id, actor).await == RevokeOutcome::NotFound {
        info!("📝 {} no tenía ban registrado en {}", user_id, chat_id);
    }
    bot.reply(chat_id, format!("✅ User {} has been unbanned from this chat.", user_id)).await;
}

async fn handle_kick(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to kick.\nExample: /kick 123456789 Disrupting conversation";
    let Some((user_id, reason)) = target(bot, chat_id, args, usage).await else {
        return;
    };
    if !bot_can_restrict(bot, chat_id, "kick").await {
        return;
    }

    if let Err(e) = bot.client.ban_member(chat_id, user_id).await {
        return report_failure(bot, chat_id, "kick", e).await;
    }
    if let Err(e) = bot.client.unban_member(chat_id, user_id).await {
        // Queda baneado; se informa igual que un fallo
        return report_failure(bot, chat_id, "kick", e).await;
    }

    let text = format!(
        "✅ User {} has been kicked from this chat.\nReason: {}",
        user_id,
        messages::reason_or_default(reason.as_deref())
    );
    bot.moderation.record_kick(user_id, chat_id, actor, reason).await;
    bot.stats.increment(counters::USERS_KICKED);
    bot.reply(chat_id, text).await;
}

async fn handle_mute(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to mute.\nExample: /mute 123456789 Flooding the chat";
    let Some((user_id, reason)) = target(bot, chat_id, args, usage).await else {
        return;
    };
    if !bot_can_restrict(bot, chat_id, "mute").await {
        return;
    }

    if let Err(e) = bot.client.restrict_member(chat_id, user_id, Restriction::Muted).await {
        return report_failure(bot, chat_id, "mute", e).await;
    }

    let text = format!(
        "✅ User {} has been muted in this chat.\nReason: {}",
        user_id,
        messages::reason_or_default(reason.as_deref())
    );
    bot.moderation.mute(user_id, chat_id, actor, reason).await;
    bot.stats.increment(counters::USERS_MUTED);
    bot.reply(chat_id, text).await;
}

async fn handle_unmute(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to unmute.\nExample: /unmute 123456789";
    let Some((user_id, _)) = target(bot, chat_id, args, usage).await else {
        return;
    };
    if !bot_can_restrict(bot, chat_id, "unmute").await {
        return;
    }

    if let Err(e) = bot.client.restrict_member(chat_id, user_id, Restriction::Unrestricted).await {
        return report_failure(bot, chat_id, "unmute", e).await;
    }

    bot.moderation.unmute(user_id, chat_id, actor).await;
    bot.reply(chat_id, format!("✅ User {} has been unmuted in this chat.", user_id)).await;
}

// ===== Moderación global =====

async fn handle_gban(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to globally ban.\nExample: /gban 123456789 Spammer across multiple groups";
    let Some((user_id, reason)) = target(bot, chat_id, args, usage).await else {
        return;
    };

    bot.reply(
        chat_id,
        format!("🔄 Processing global ban for user {}. This may take a moment...", user_id),
    )
    .await;

    let chats = bot.chats.group_chats();
    let report = bot
        .moderation
        .global_ban(user_id, actor, reason.clone(), &chats, bot.client.as_ref())
        .await;

    bot.stats.increment(counters::GLOBAL_BANS);
    bot.reply(chat_id, messages::global_ban_done(user_id, reason.as_deref(), &report.fan_out)).await;
}

async fn handle_ungban(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to remove from the global ban list.\nExample: /ungban 123456789";
    let Some((user_id, _)) = target(bot, chat_id, args, usage).await else {
        return;
    };

    let chats = bot.chats.group_chats();
    let report = bot
        .moderation
        .global_unban(user_id, actor, &chats, bot.client.as_ref())
        .await;

    match report.fan_out {
        Some(fan_out) => bot.reply(chat_id, messages::global_unban_done(user_id, &fan_out)).await,
        None => bot.reply(chat_id, format!("⚠️ User {} is not globally banned.", user_id)).await,
    }
}

async fn handle_gban_list(bot: &SlayerBot, chat_id: i64) {
    for chunk in messages::global_ban_list(&bot.moderation.active_global_bans()) {
        bot.reply(chat_id, chunk).await;
    }
}

// ===== Sudo =====

async fn handle_add_sudo(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to add as sudo.\nExample: /addsudo 123456789";
    let Some((user_id, _)) = target(bot, chat_id, args, usage).await else {
        return;
    };

    let text = match bot.sudo.add(user_id, actor).await {
        AddSudoOutcome::AlreadySudo => format!("⚠️ User {} is already a sudo user.", user_id),
        AddSudoOutcome::Restored => format!("✅ User {} has been restored as a sudo user.", user_id),
        AddSudoOutcome::Added => format!("✅ User {} has been added as a sudo user.", user_id),
    };
    bot.reply(chat_id, text).await;
}

async fn handle_del_sudo(bot: &SlayerBot, chat_id: i64, actor: u64, args: &str) {
    let usage = "Please provide a user ID to remove from sudo.\nExample: /delsudo 123456789";
    let Some((user_id, _)) = target(bot, chat_id, args, usage).await else {
        return;
    };

    let text = match bot.sudo.remove(user_id, actor).await {
        RemoveSudoOutcome::Protected => "❌ Cannot remove the owner from sudo users.".to_string(),
        RemoveSudoOutcome::Removed => format!("✅ User {} has been removed from sudo users.", user_id),
        RemoveSudoOutcome::NotSudo => format!("⚠️ User {} is not a sudo user.", user_id),
    };
    bot.reply(chat_id, text).await;
}

async fn handle_stats(bot: &SlayerBot, chat_id: i64) {
    let context = StatsContext {
        known_chats: bot.chats.len(),
        tracked_songs: bot.library.len(),
        active_global_bans: bot.moderation.active_global_bans().len(),
        active_playback_chats: bot.scheduler.active_chats().await,
    };
    let top = bot.library.top_tracks(5);
    bot.reply(chat_id, messages::stats(&bot.stats.snapshot(), &context, &top)).await;
}
