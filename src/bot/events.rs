//! Non-command events: members joining and inline button clicks.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    bot::{client::ChatRef, CallbackEvent, Sender, SlayerBot},
    stats::counters,
    ui::{buttons, messages},
};

/// Bans new members that are on the global ban list.
///
/// Nothing happens unless the bot can restrict members in the chat.
pub async fn handle_new_members(bot: &SlayerBot, chat: &ChatRef, members: &[Sender]) -> Result<()> {
    if !chat.is_group() {
        return Ok(());
    }

    let banned: Vec<&Sender> = members
        .iter()
        .filter(|m| bot.moderation.is_globally_banned(m.id))
        .collect();
    if banned.is_empty() {
        return Ok(());
    }

    let bot_member = bot.client.get_chat_member(chat.id, bot.client.bot_id()).await?;
    if !bot_member.can_restrict {
        warn!(
            "🚫 {} usuarios con ban global entraron a {} pero el bot no puede banear",
            banned.len(),
            chat.id
        );
        return Ok(());
    }

    for member in banned {
        if let Err(e) = bot.client.ban_member(chat.id, member.id).await {
            warn!("❌ No se pudo aplicar el ban global de {} en {}: {}", member.id, chat.id, e);
            continue;
        }

        let reason = bot.moderation.global_ban_record(member.id).and_then(|r| r.reason);
        info!("🌐 Ban global aplicado a {} al entrar en {}", member.id, chat.id);
        bot.stats.increment(counters::GLOBAL_BAN_ENFORCEMENTS);
        bot.reply(chat.id, messages::global_ban_enforced(member.id, reason.as_deref())).await;
    }

    Ok(())
}

/// `play:<id>` buttons from search results.
pub async fn handle_callback(bot: &SlayerBot, callback: CallbackEvent) -> Result<()> {
    let (Some(track_id), Some(chat)) = (buttons::parse_play_callback(&callback.data), callback.chat.as_ref())
    else {
        debug!("🔘 Callback ignorado: {}", callback.data);
        answer(bot, &callback, None).await;
        return Ok(());
    };

    info!("🔘 {} eligió {} en {}", callback.sender.id, track_id, chat.id);
    answer(bot, &callback, Some("🎵 Adding to queue...".to_string())).await;

    match bot.resolver.resolve_by_id(track_id).await {
        Ok(track) => bot.enqueue_and_report(chat.id, track).await,
        Err(e) => {
            warn!("🔍 No se pudo resolver {}: {}", track_id, e);
            bot.reply(chat.id, "❌ Sorry, I couldn't fetch information for this song.").await;
        }
    }
    Ok(())
}

async fn answer(bot: &SlayerBot, callback: &CallbackEvent, text: Option<String>) {
    if let Err(e) = bot.client.answer_callback(callback.id.clone(), text).await {
        warn!("⚠️ No se pudo responder el callback {}: {}", callback.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::queue::PlaybackState,
        bot::{testing::*, InboundEvent},
        sources::Track,
    };
    use pretty_assertions::assert_eq;

    fn joined(ids: &[u64]) -> InboundEvent {
        InboundEvent::NewMembers { chat: group(), members: ids.iter().map(|&id| user(id)).collect() }
    }

    fn click(data: &str) -> InboundEvent {
        InboundEvent::Callback(CallbackEvent {
            id: "cb-1".to_string(),
            chat: Some(group()),
            sender: user(5),
            data: data.to_string(),
        })
    }

    #[tokio::test]
    async fn globally_banned_members_are_removed_on_join() {
        let t = test_bot(vec![]).await;
        t.bot.moderation.global_ban(99, OWNER, Some("spam bot".into()), &[], t.client.as_ref()).await;
        t.client.grant_bot_rights(GROUP);

        t.bot.handle_event(joined(&[7, 99])).await;

        assert_eq!(t.client.banned_in(99), vec![GROUP]);
        assert!(t.client.banned_in(7).is_empty());
        assert_eq!(
            t.client.last_text(GROUP),
            Some(messages::global_ban_enforced(99, Some("spam bot")))
        );
        assert_eq!(t.bot.stats.get(counters::GLOBAL_BAN_ENFORCEMENTS), 1);
    }

    #[tokio::test]
    async fn enforcement_needs_the_restrict_right() {
        let t = test_bot(vec![]).await;
        t.bot.moderation.global_ban(99, OWNER, None, &[], t.client.as_ref()).await;

        t.bot.handle_event(joined(&[99])).await;

        assert!(t.client.banned_in(99).is_empty());
        assert!(t.client.texts_to(GROUP).is_empty());
    }

    #[tokio::test]
    async fn play_button_queues_the_cached_track() {
        let song = Track::new("abc123", "Bohemian Rhapsody", "https://www.youtube.com/watch?v=abc123");
        let t = test_bot(vec![song.clone()]).await;
        t.bot.resolver.cache().insert(song.id.clone(), song);

        t.bot.handle_event(click("play:abc123")).await;

        assert_eq!(t.client.answered(), vec![("cb-1".to_string(), Some("🎵 Adding to queue...".to_string()))]);
        assert!(t
            .client
            .texts_to(GROUP)
            .contains(&"🎵 Added to queue and starting playback: Bohemian Rhapsody".to_string()));
        assert_eq!(t.bot.scheduler.state(GROUP).await, PlaybackState::Playing);
        // Cache hit: el resolver no se consultó
        assert!(t.resolver.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn unknown_track_ids_are_reported() {
        let t = test_bot(vec![]).await;
        t.bot.handle_event(click("play:missing")).await;

        assert_eq!(
            t.client.last_text(GROUP),
            Some("❌ Sorry, I couldn't fetch information for this song.".to_string())
        );
        assert_eq!(t.bot.scheduler.state(GROUP).await, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn other_callbacks_are_only_acknowledged() {
        let t = test_bot(vec![]).await;
        t.bot.handle_event(click("volume:up")).await;

        assert_eq!(t.client.answered(), vec![("cb-1".to_string(), None)]);
        assert!(t.client.texts_to(GROUP).is_empty());
    }
}
