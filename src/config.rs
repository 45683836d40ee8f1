use std::env;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub bot_mode: String,
    pub webhook_url: String,
    pub webhook_port: u16,
    pub log_level: String,
    pub database_url: String,
    pub use_fallback_db: bool,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_image_model: String,
    pub gemini_temperature: f32,
    pub gemini_top_k: i32,
    pub gemini_top_p: f32,
    pub gemini_max_output_tokens: i32,
    pub gemini_safety_settings: String,
    pub enable_gemini_mock: bool,
    pub supabase_url: String,
    pub supabase_key: String,
    pub storage_bucket: String,
    pub local_storage_dir: String,
    pub free_plan_name: String,
    pub free_plan_daily_limit: i64,
    pub rate_limit_seconds: u64,
    pub telegram_max_length: usize,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| {
            let value = value.trim().to_lowercase();
            matches!(value.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_database_url(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("://") {
        return trimmed.to_string();
    }
    // bare file path, e.g. DATABASE_URL=bot.db
    format!("sqlite://{trimmed}?mode=rwc")
}

fn normalize_bot_mode(value: String) -> String {
    let lowered = value.trim().to_lowercase();
    match lowered.as_str() {
        "polling" | "webhook" => lowered,
        "" => "polling".to_string(),
        _ => {
            warn!("Unknown BOT_MODE value '{}'; defaulting to polling.", value);
            "polling".to_string()
        }
    }
}

fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("BOT_TOKEN is required"));
        }

        Ok(Config {
            bot_token,
            bot_mode: normalize_bot_mode(env_string("BOT_MODE", "polling")),
            webhook_url: env_string("WEBHOOK_URL", ""),
            webhook_port: env_u16("WEBHOOK_PORT", 8443),
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://bot.db?mode=rwc",
            )),
            use_fallback_db: env_bool("USE_FALLBACK_DB", false),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_model: env_string("GEMINI_MODEL", "gemini-2.0-flash"),
            gemini_image_model: env_string("GEMINI_IMAGE_MODEL", "gemini-3-pro-image-preview"),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.7),
            gemini_top_k: env_i32("GEMINI_TOP_K", 40),
            gemini_top_p: env_f32("GEMINI_TOP_P", 0.95),
            gemini_max_output_tokens: env_i32("GEMINI_MAX_OUTPUT_TOKENS", 2048),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            enable_gemini_mock: env_bool("ENABLE_GEMINI_MOCK", true),
            supabase_url: env_string("SUPABASE_URL", ""),
            supabase_key: env_string("SUPABASE_KEY", ""),
            storage_bucket: env_string("STORAGE_BUCKET", "generated"),
            local_storage_dir: env_string("LOCAL_STORAGE_DIR", ".storage"),
            free_plan_name: env_string("FREE_PLAN_NAME", "Free"),
            free_plan_daily_limit: env_i64("FREE_PLAN_DAILY_LIMIT", 5),
            rate_limit_seconds: env_u64("RATE_LIMIT_SECONDS", 5),
            telegram_max_length: env_usize("TELEGRAM_MAX_LENGTH", 4000),
        })
    }
}

pub const TEXT_SYSTEM_PROMPT: &str = "You are a creative writing assistant inside a Telegram bot. \
Write an original, engaging piece of text based on the user's prompt.\n\n\
Guidelines:\n\
1. Follow the user's instructions for tone, length, and format.\n\
2. If no length is requested, stay under 300 words.\n\
3. Respond in the same language as the prompt.\n\
4. Return only the generated text, with no preamble or commentary.\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_database_url_gets_sqlite_scheme() {
        let normalized = normalize_database_url("bot.db".to_string());
        assert_eq!(normalized, "sqlite://bot.db?mode=rwc");
    }

    #[test]
    fn schemed_database_url_is_untouched() {
        let normalized = normalize_database_url("sqlite://data/bot.db".to_string());
        assert_eq!(normalized, "sqlite://data/bot.db");
    }

    #[test]
    fn unknown_safety_setting_falls_back_to_permissive() {
        assert_eq!(
            normalize_gemini_safety_settings("paranoid".to_string()),
            "permissive"
        );
        assert_eq!(
            normalize_gemini_safety_settings("STANDARD".to_string()),
            "standard"
        );
    }
}
