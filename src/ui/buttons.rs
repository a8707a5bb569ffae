use crate::{bot::client::Button, sources::Track, ui::messages::format_duration};

/// Datos de callback de los botones inline
pub mod button_ids {
    /// `play:<track_id>` on search results.
    pub const PLAY_PREFIX: &str = "play:";
}

/// Telegram limita callback_data a 64 bytes
const MAX_CALLBACK_DATA: usize = 64;
const MAX_BUTTON_TITLE: usize = 48;

pub fn play_callback(track_id: &str) -> Option<String> {
    let data = format!("{}{}", button_ids::PLAY_PREFIX, track_id);
    (data.len() <= MAX_CALLBACK_DATA).then_some(data)
}

/// Extracts the track id of a `play:<id>` callback.
pub fn parse_play_callback(data: &str) -> Option<&str> {
    data.strip_prefix(button_ids::PLAY_PREFIX)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

pub fn watch_button(track: &Track) -> Button {
    Button::Url {
        text: "🔗 Watch on YouTube".to_string(),
        url: track.url.clone(),
    }
}

/// One row per result: "1. Title (3:45)".
pub fn search_keyboard(tracks: &[Track]) -> Vec<Vec<Button>> {
    tracks
        .iter()
        .enumerate()
        .filter_map(|(i, track)| {
            let data = play_callback(&track.id)?;
            let text = format!(
                "{}. {} ({})",
                i + 1,
                truncate(&track.title, MAX_BUTTON_TITLE),
                format_duration(track.duration)
            );
            Some(vec![Button::Callback { text, data }])
        })
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn play_callbacks_round_trip_through_the_prefix() {
        let data = play_callback("dQw4w9WgXcQ").unwrap();
        assert_eq!(data, "play:dQw4w9WgXcQ");
        assert_eq!(parse_play_callback(&data), Some("dQw4w9WgXcQ"));
        assert_eq!(parse_play_callback("play:"), None);
        assert_eq!(parse_play_callback("queue:1"), None);
    }

    #[test]
    fn oversized_ids_get_no_button() {
        let long_id = "x".repeat(80);
        assert_eq!(play_callback(&long_id), None);

        let tracks = vec![
            Track::new(long_id, "Too long", "https://youtu.be/x"),
            Track::new("ok", "Fine", "https://youtu.be/ok").with_duration(225),
        ];
        let keyboard = search_keyboard(&tracks);
        assert_eq!(
            keyboard,
            vec![vec![Button::Callback {
                text: "2. Fine (3:45)".to_string(),
                data: "play:ok".to_string(),
            }]]
        );
    }

    #[test]
    fn long_titles_are_shortened() {
        let title = "a".repeat(100);
        let shortened = truncate(&title, MAX_BUTTON_TITLE);
        assert_eq!(shortened.chars().count(), MAX_BUTTON_TITLE);
        assert!(shortened.ends_with('…'));
    }
}
