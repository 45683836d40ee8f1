use std::time::Duration;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tracing::warn;

use crate::config::CONFIG;

pub async fn edit_text_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: &str,
) -> Result<()> {
    let mut delay = Duration::from_secs_f32(1.5);
    for attempt in 0..3 {
        match bot
            .edit_message_text(chat_id, message_id, text.to_string())
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) => {
                if attempt == 2 {
                    return Err(err.into());
                }
                warn!("edit_message_text failed: {err}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }

    Ok(())
}

pub fn clip_response(response: &str, max_length: usize) -> String {
    if response.len() <= max_length {
        return response.to_string();
    }

    let mut cut = max_length.saturating_sub(100);
    while cut > 0 && !response.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}...\n\n(Response was truncated due to length)",
        &response[..cut]
    )
}

/// Replaces the "working on it" message with the final response, clipped
/// to what one Telegram message can carry.
pub async fn send_response(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    response: &str,
) -> Result<()> {
    let text = clip_response(response, CONFIG.telegram_max_length);
    edit_text_with_retry(bot, chat_id, message_id, &text).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_responses_pass_through() {
        assert_eq!(clip_response("hello", 100), "hello");
    }

    #[test]
    fn long_responses_are_clipped_with_a_notice() {
        let long = "a".repeat(500);
        let clipped = clip_response(&long, 200);
        assert!(clipped.len() < 500);
        assert!(clipped.ends_with("(Response was truncated due to length)"));
    }

    #[test]
    fn clipping_respects_utf8_boundaries() {
        let long = "é".repeat(300);
        let clipped = clip_response(&long, 300);
        assert!(clipped.contains("truncated"));
    }
}
