use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile, MessageId, ReplyParameters};
use teloxide::RequestError;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, warn};

use crate::config::CONFIG;
use crate::db::models::{GenerationKind, GenerationLogInsert, NewUser};
use crate::handlers::access::is_rate_limited;
use crate::handlers::responses::{edit_text_with_retry, send_response};
use crate::limiter::{generations_used_today, QuotaDecision};
use crate::llm::{generate_image, generate_text, generate_video};
use crate::state::AppState;
use crate::storage::{self, StoredObject};
use crate::utils::logging::read_recent_log_lines;
use crate::utils::timing::{complete_command_timer, start_command_timer};

const TELEGRAM_RETRY_ATTEMPTS: usize = 3;
const LOG_RESULT_PREVIEW_CHARS: usize = 500;
const IMAGE_CAPTION_PROMPT_PREVIEW: usize = 900;
const DIAGNOSE_LOG_TAIL_LINES: usize = 12;
const DIAGNOSE_TEXT_LIMIT: usize = 3900;

fn message_user_id(message: &Message) -> Option<i64> {
    message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
}

fn strip_command_prefix(text: &str, command_prefix: &str) -> String {
    if text.starts_with(command_prefix) {
        text[command_prefix.len()..].trim().to_string()
    } else {
        text.to_string()
    }
}

fn resolve_prompt(message: &Message, arg: Option<String>, command_prefix: &str) -> String {
    if let Some(arg) = arg {
        return arg.trim().to_string();
    }
    let original = message
        .text()
        .map(|value| value.to_string())
        .unwrap_or_default();
    strip_command_prefix(&original, command_prefix)
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    let mut iter = text.chars();
    let truncated: String = iter.by_ref().take(max_chars).collect();
    let was_truncated = iter.next().is_some();
    (truncated, was_truncated)
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn redact_sensitive_text(text: &str) -> String {
    let mut redacted = text.to_string();
    let secrets = [
        CONFIG.bot_token.as_str(),
        CONFIG.gemini_api_key.as_str(),
        CONFIG.supabase_key.as_str(),
    ];

    for secret in secrets {
        let secret = secret.trim();
        if !secret.is_empty() {
            redacted = redacted.replace(secret, "[REDACTED]");
        }
    }

    redacted
}

fn build_image_caption(model_name: &str, prompt: &str) -> String {
    let clean_prompt = prompt.trim();
    if clean_prompt.is_empty() {
        return format!("Generated by {model_name}");
    }
    let (preview, was_truncated) = truncate_chars(clean_prompt, IMAGE_CAPTION_PROMPT_PREVIEW);
    if was_truncated {
        format!("Generated by {model_name} with prompt:\n{preview}...")
    } else {
        format!("Generated by {model_name} with prompt:\n{preview}")
    }
}

fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

async fn send_message_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    reply_to: Option<MessageId>,
) -> Result<Message> {
    let mut delay = Duration::from_secs_f32(1.5);
    for attempt in 0..TELEGRAM_RETRY_ATTEMPTS {
        let mut request = bot.send_message(chat_id, text.to_string());
        if let Some(reply_to) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(reply_to));
        }
        match request.await {
            Ok(message) => return Ok(message),
            Err(err) => {
                if !telegram_retryable_error(&err) || attempt + 1 == TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err.into());
                }
                warn!("send_message attempt {} failed: {err}", attempt + 1);
                if let RequestError::RetryAfter(wait) = err {
                    tokio::time::sleep(wait.duration()).await;
                } else {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    unreachable!("send_message retry loop exhausted")
}

async fn queue_generation_log(
    state: &AppState,
    telegram_id: i64,
    kind: GenerationKind,
    prompt: &str,
    result: Option<String>,
) {
    let insert = GenerationLogInsert::new(telegram_id, kind, prompt, result);
    if let Err(err) = state.db.queue_generation_log(insert).await {
        error!("Failed to queue generation log: {err}");
    }
}

/// Gate shared by all generation commands: flood cooldown, then the daily
/// quota under the account lock. The returned guard must stay alive until
/// `increment` has run, so the check-generate-increment sequence is
/// serialized per account.
async fn acquire_generation_slot(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    user_id: i64,
) -> Result<Option<OwnedMutexGuard<()>>> {
    if is_rate_limited(user_id) {
        bot.send_message(
            message.chat.id,
            "You're sending commands too quickly. Please wait a few seconds.",
        )
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
        return Ok(None);
    }

    let slot = state.limiter.lock_account(user_id).await;
    match state.limiter.can_generate(user_id).await {
        Ok(QuotaDecision::Allowed) => Ok(Some(slot)),
        Ok(decision) => {
            bot.send_message(message.chat.id, decision.user_message())
                .reply_parameters(ReplyParameters::new(message.id))
                .await?;
            Ok(None)
        }
        Err(err) => {
            error!("Quota check failed for user {user_id}: {err}");
            bot.send_message(
                message.chat.id,
                "The user store is temporarily unavailable. Please try again later.",
            )
            .reply_parameters(ReplyParameters::new(message.id))
            .await?;
            Ok(None)
        }
    }
}

async fn record_generation(state: &AppState, user_id: i64) {
    if let Err(err) = state.limiter.increment(user_id).await {
        error!("Failed to record generation for user {user_id}: {err}");
    }
}

pub async fn start_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user) = message.from.as_ref() else {
        return Ok(());
    };
    let Ok(user_id) = i64::try_from(user.id.0) else {
        return Ok(());
    };
    let display_name = user.full_name();

    match state.db.find_user(user_id).await {
        Ok(Some(existing)) => {
            bot.send_message(
                message.chat.id,
                format!(
                    "Welcome back, {display_name}! Your plan: {}.",
                    existing.plan_name
                ),
            )
            .reply_parameters(ReplyParameters::new(message.id))
            .await?;
        }
        Ok(None) => {
            let created = state
                .db
                .create_user(NewUser {
                    telegram_id: user_id,
                    display_name: display_name.clone(),
                    plan_name: CONFIG.free_plan_name.clone(),
                    daily_limit: CONFIG.free_plan_daily_limit,
                })
                .await;
            match created {
                Ok(created) => {
                    bot.send_message(
                        message.chat.id,
                        format!(
                            "Welcome, {display_name}! You are registered on the {} plan ({} generations per day).",
                            created.plan_name, created.daily_limit
                        ),
                    )
                    .reply_parameters(ReplyParameters::new(message.id))
                    .await?;
                }
                Err(err) => {
                    error!("Failed to register user {user_id}: {err}");
                    bot.send_message(
                        message.chat.id,
                        "Registration failed because the user store is unavailable. Please try again later.",
                    )
                    .reply_parameters(ReplyParameters::new(message.id))
                    .await?;
                }
            }
        }
        Err(err) => {
            error!("Failed to look up user {user_id}: {err}");
            bot.send_message(
                message.chat.id,
                "The user store is temporarily unavailable. Please try again later.",
            )
            .reply_parameters(ReplyParameters::new(message.id))
            .await?;
        }
    }
    Ok(())
}

pub async fn myplan_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };

    let text = match state.db.find_user(user_id).await {
        Ok(Some(user)) => {
            let used = generations_used_today(&user, Utc::now().date_naive());
            let remaining = (user.daily_limit - used).max(0);
            format!(
                "Plan: {}\nDaily limit: {}\nUsed today: {}\nRemaining: {}",
                user.plan_name, user.daily_limit, used, remaining
            )
        }
        Ok(None) => QuotaDecision::NotRegistered.user_message().to_string(),
        Err(err) => {
            error!("Failed to look up user {user_id}: {err}");
            "The user store is temporarily unavailable. Please try again later.".to_string()
        }
    };

    bot.send_message(message.chat.id, text)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn plans_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let text = match state.db.list_plans().await {
        Ok(plans) if !plans.is_empty() => {
            let mut lines = vec!["Available plans:".to_string()];
            for plan in plans {
                lines.push(format!(
                    "{} — {} generations/day — ${:.2}",
                    plan.name, plan.daily_limit, plan.price_usd
                ));
            }
            lines.join("\n")
        }
        Ok(_) => "No plans are configured right now.".to_string(),
        Err(err) => {
            error!("Failed to list plans: {err}");
            "The plan list is temporarily unavailable. Please try again later.".to_string()
        }
    };

    bot.send_message(message.chat.id, text)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    let help_text = "\
Commands:

/start - Register with the free plan
/myplan - Show your plan, daily limit, and remaining generations
/plans - List available plans
/text [prompt] - Generate text
/img [prompt] - Generate an image
/vid [prompt] - Generate a video (stub)
/status - Show bot health snapshot
/diagnose - Show extended diagnostics with recent log tails
/help - Show this help message
";

    bot.send_message(message.chat.id, help_text)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn text_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    prompt: Option<String>,
) -> Result<()> {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("text", &message);

    let prompt = resolve_prompt(&message, prompt, "/text");
    if prompt.is_empty() {
        bot.send_message(
            message.chat.id,
            "Please provide a prompt.\nUsage: /text [prompt]",
        )
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
        complete_command_timer(&mut timer, "invalid", None);
        return Ok(());
    }

    let Some(_slot) = acquire_generation_slot(&bot, &state, &message, user_id).await? else {
        complete_command_timer(&mut timer, "denied", None);
        return Ok(());
    };

    let processing =
        send_message_with_retry(&bot, message.chat.id, "Generating text...", Some(message.id))
            .await?;
    let _ = bot.send_chat_action(message.chat.id, ChatAction::Typing).await;

    match generate_text(&prompt).await {
        Ok(text) => {
            let (preview, _) = truncate_chars(&text, LOG_RESULT_PREVIEW_CHARS);
            queue_generation_log(&state, user_id, GenerationKind::Text, &prompt, Some(preview))
                .await;
            record_generation(&state, user_id).await;
            send_response(&bot, message.chat.id, processing.id, &text).await?;
            complete_command_timer(&mut timer, "success", None);
        }
        Err(err) => {
            error!("Text generation failed: {err}");
            queue_generation_log(
                &state,
                user_id,
                GenerationKind::Text,
                &prompt,
                Some(format!("error: {err}")),
            )
            .await;
            edit_text_with_retry(
                &bot,
                message.chat.id,
                processing.id,
                &format!("Sorry, I couldn't generate the text.\n\nError: {err}"),
            )
            .await?;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
        }
    }

    Ok(())
}

pub async fn img_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    prompt: Option<String>,
) -> Result<()> {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("img", &message);

    let prompt = resolve_prompt(&message, prompt, "/img");
    if prompt.is_empty() {
        bot.send_message(
            message.chat.id,
            "Please provide a prompt.\nUsage: /img [description]",
        )
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
        complete_command_timer(&mut timer, "invalid", None);
        return Ok(());
    }

    let Some(_slot) = acquire_generation_slot(&bot, &state, &message, user_id).await? else {
        complete_command_timer(&mut timer, "denied", None);
        return Ok(());
    };

    let processing = send_message_with_retry(
        &bot,
        message.chat.id,
        "Generating your image...",
        Some(message.id),
    )
    .await?;
    let _ = bot
        .send_chat_action(message.chat.id, ChatAction::UploadPhoto)
        .await;

    let model_name = CONFIG.gemini_image_model.as_str();
    let images = match generate_image(&prompt).await {
        Ok(images) => images,
        Err(err) => {
            error!(model = model_name, "Image generation failed: {}", err.0);
            queue_generation_log(
                &state,
                user_id,
                GenerationKind::Image,
                &prompt,
                Some(format!("error: {}", err.0)),
            )
            .await;
            edit_text_with_retry(
                &bot,
                message.chat.id,
                processing.id,
                &format!(
                    "Sorry, I couldn't generate the image using {model_name}.\n\nError: {}",
                    err.0
                ),
            )
            .await?;
            complete_command_timer(&mut timer, "error", Some(err.0));
            return Ok(());
        }
    };

    let mut image_iter = images.into_iter();
    let Some(first_image) = image_iter.next() else {
        edit_text_with_retry(
            &bot,
            message.chat.id,
            processing.id,
            "The model returned no image. Please try a different prompt.",
        )
        .await?;
        complete_command_timer(&mut timer, "error", Some("no image".to_string()));
        return Ok(());
    };

    let object_path = format!("images/{}_{}.png", user_id, Utc::now().timestamp());
    let stored = storage::upload_bytes(&CONFIG.storage_bucket, &object_path, &first_image).await;
    let stored_description = match &stored {
        Ok(stored) => Some(stored.describe()),
        Err(err) => {
            warn!("Failed to store generated image: {err}");
            None
        }
    };

    queue_generation_log(
        &state,
        user_id,
        GenerationKind::Image,
        &prompt,
        stored_description,
    )
    .await;
    record_generation(&state, user_id).await;

    let caption = build_image_caption(model_name, &prompt);
    let photo = match &stored {
        Ok(StoredObject::Url(stored_url)) => InputFile::url(stored_url.parse()?),
        Ok(StoredObject::LocalPath(path)) => InputFile::file(path.clone()),
        Err(_) => InputFile::memory(first_image),
    };
    bot.send_photo(message.chat.id, photo)
        .reply_parameters(ReplyParameters::new(message.id))
        .caption(caption)
        .await?;
    let _ = edit_text_with_retry(
        &bot,
        message.chat.id,
        processing.id,
        "Generated image below.",
    )
    .await;

    for image in image_iter {
        bot.send_photo(message.chat.id, InputFile::memory(image))
            .reply_parameters(ReplyParameters::new(message.id))
            .await?;
    }

    complete_command_timer(&mut timer, "success", None);
    Ok(())
}

pub async fn vid_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    prompt: Option<String>,
) -> Result<()> {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };
    let mut timer = start_command_timer("vid", &message);

    let prompt = resolve_prompt(&message, prompt, "/vid");
    if prompt.is_empty() {
        bot.send_message(
            message.chat.id,
            "Please provide a prompt for the video.\nUsage: /vid [text prompt]",
        )
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
        complete_command_timer(&mut timer, "invalid", None);
        return Ok(());
    }

    let Some(_slot) = acquire_generation_slot(&bot, &state, &message, user_id).await? else {
        complete_command_timer(&mut timer, "denied", None);
        return Ok(());
    };

    let processing = send_message_with_retry(
        &bot,
        message.chat.id,
        "Processing video request... This may take a few minutes.",
        Some(message.id),
    )
    .await?;

    match generate_video(&prompt).await {
        Ok(Some(video_bytes)) => {
            queue_generation_log(
                &state,
                user_id,
                GenerationKind::Video,
                &prompt,
                Some(format!("{} bytes", video_bytes.len())),
            )
            .await;
            record_generation(&state, user_id).await;
            bot.send_video(message.chat.id, InputFile::memory(video_bytes))
                .reply_parameters(ReplyParameters::new(message.id))
                .await?;
            complete_command_timer(&mut timer, "success", None);
        }
        Ok(None) => {
            // the stub still logs and counts the attempt
            queue_generation_log(
                &state,
                user_id,
                GenerationKind::Video,
                &prompt,
                Some("stub".to_string()),
            )
            .await;
            record_generation(&state, user_id).await;
            edit_text_with_retry(
                &bot,
                message.chat.id,
                processing.id,
                "Video generation is a stub for now. Your request was recorded.",
            )
            .await?;
            complete_command_timer(&mut timer, "stub", None);
        }
        Err(err) => {
            error!("Video generation failed: {err}");
            queue_generation_log(
                &state,
                user_id,
                GenerationKind::Video,
                &prompt,
                Some(format!("error: {err}")),
            )
            .await;
            edit_text_with_retry(
                &bot,
                message.chat.id,
                processing.id,
                &format!("Sorry, I couldn't generate the video.\n\nError: {err}"),
            )
            .await?;
            complete_command_timer(&mut timer, "error", Some(err.to_string()));
        }
    }

    Ok(())
}

async fn build_status_report(state: &AppState) -> String {
    let db_result = state.db.health_check().await;
    let db_status = if db_result.is_ok() { "ok" } else { "error" };
    let db_detail = db_result.err().map(|err| err.to_string());

    let user_count = state.db.count_users().await.ok();
    let log_count = state.db.count_generation_logs().await.ok();

    let queue_max = state.db.queue_max_capacity();
    let queue_pending = state.db.queue_len();
    let queue_available = state.db.queue_available_capacity();

    let gemini_configured = !CONFIG.gemini_api_key.trim().is_empty();
    let mock_active = CONFIG.enable_gemini_mock || !gemini_configured;
    let remote_storage =
        !CONFIG.supabase_url.trim().is_empty() && !CONFIG.supabase_key.trim().is_empty();

    let mut report = String::new();
    report.push_str("Status snapshot\n");
    report.push_str(&format!("time_utc: {}\n", Utc::now().to_rfc3339()));
    report.push_str(&format!("bot_mode: {}\n", CONFIG.bot_mode));
    report.push_str(&format!("store_backend: {}\n", state.db.backend_label()));
    report.push_str(&format!("db: {db_status}\n"));
    if let Some(detail) = db_detail {
        report.push_str(&format!("db_error: {detail}\n"));
    }
    report.push_str(&format!(
        "registered_users: {}\n",
        user_count.map_or_else(|| "unknown".to_string(), |count| count.to_string())
    ));
    report.push_str(&format!(
        "generation_logs: {}\n",
        log_count.map_or_else(|| "unknown".to_string(), |count| count.to_string())
    ));
    report.push_str(&format!(
        "log_queue: pending={queue_pending} available={queue_available} max={queue_max}\n"
    ));
    report.push_str(&format!(
        "gemini_configured: {}\n",
        bool_label(gemini_configured)
    ));
    report.push_str(&format!("gemini_mock_active: {}\n", bool_label(mock_active)));
    report.push_str(&format!(
        "remote_storage_configured: {}\n",
        bool_label(remote_storage)
    ));
    report.push_str(&format!(
        "local_storage_dir: {}\n",
        CONFIG.local_storage_dir
    ));
    report
}

fn append_log_tail(report: &mut String, base_name: &str, title: &str, max_lines: usize) {
    report.push_str(&format!("\n{title}\n"));
    match read_recent_log_lines(base_name, max_lines) {
        Ok(Some(tail)) => {
            report.push_str(&format!("source: {}\n", tail.path.display()));
            if tail.lines.is_empty() {
                report.push_str("(no lines available)\n");
            } else {
                for line in tail.lines {
                    let line = redact_sensitive_text(&line);
                    report.push_str(&line);
                    report.push('\n');
                }
            }
        }
        Ok(None) => {
            report.push_str("No matching log files found.\n");
        }
        Err(err) => {
            report.push_str(&format!("Failed to read log tail: {err}\n"));
        }
    }
}

async fn build_diagnose_report(state: &AppState) -> String {
    let mut report = String::new();
    report.push_str("Diagnosis report\n");
    report.push_str("Use /status for a compact health view.\n\n");

    let status = build_status_report(state).await;
    report.push_str(&status);

    report.push_str("\nConfig checks\n");
    report.push_str(&format!(
        "BOT_TOKEN_present: {}\n",
        bool_label(!CONFIG.bot_token.trim().is_empty())
    ));
    report.push_str(&format!(
        "GEMINI_API_KEY_present: {}\n",
        bool_label(!CONFIG.gemini_api_key.trim().is_empty())
    ));
    report.push_str(&format!(
        "SUPABASE_URL_present: {}\n",
        bool_label(!CONFIG.supabase_url.trim().is_empty())
    ));
    report.push_str(&format!(
        "SUPABASE_KEY_present: {}\n",
        bool_label(!CONFIG.supabase_key.trim().is_empty())
    ));
    report.push_str(&format!("DATABASE_URL: {}\n", CONFIG.database_url));

    append_log_tail(
        &mut report,
        "bot.log",
        "Recent bot log lines",
        DIAGNOSE_LOG_TAIL_LINES,
    );
    append_log_tail(
        &mut report,
        "timing.log",
        "Recent timing log lines",
        DIAGNOSE_LOG_TAIL_LINES,
    );

    let report = redact_sensitive_text(&report);
    let (truncated, was_truncated) = truncate_chars(&report, DIAGNOSE_TEXT_LIMIT);
    if was_truncated {
        format!("{truncated}\n\n[truncated to fit Telegram message size]")
    } else {
        truncated
    }
}

pub async fn status_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let report = build_status_report(&state).await;
    bot.send_message(message.chat.id, report)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn diagnose_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let report = build_diagnose_report(&state).await;
    bot.send_message(message.chat.id, report)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_prefix_is_stripped_with_surrounding_whitespace() {
        assert_eq!(strip_command_prefix("/text  a poem ", "/text"), "a poem");
        assert_eq!(strip_command_prefix("plain words", "/text"), "plain words");
    }

    #[test]
    fn truncation_reports_whether_it_cut_anything() {
        let (text, cut) = truncate_chars("abcdef", 4);
        assert_eq!(text, "abcd");
        assert!(cut);

        let (text, cut) = truncate_chars("abc", 4);
        assert_eq!(text, "abc");
        assert!(!cut);
    }

    #[test]
    fn image_caption_includes_a_prompt_preview() {
        let caption = build_image_caption("model-x", "a red fox");
        assert!(caption.contains("model-x"));
        assert!(caption.contains("a red fox"));

        let long_prompt = "p".repeat(2000);
        let caption = build_image_caption("model-x", &long_prompt);
        assert!(caption.chars().count() < 1100);
        assert!(caption.ends_with("..."));
    }
}
