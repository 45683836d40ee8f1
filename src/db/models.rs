use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Per-user account record holding plan and daily quota state.
///
/// `generations_today` is only meaningful while `last_generation_date`
/// equals the current UTC date; any other state counts as zero.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    pub telegram_id: i64,
    pub display_name: String,
    pub plan_name: String,
    pub daily_limit: i64,
    pub generations_today: i64,
    pub last_generation_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub telegram_id: i64,
    pub display_name: String,
    pub plan_name: String,
    pub daily_limit: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlanRow {
    pub id: i64,
    pub name: String,
    pub daily_limit: i64,
    pub price_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Text,
    Image,
    Video,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::Text => "text",
            GenerationKind::Image => "image",
            GenerationKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GenerationLogRow {
    pub id: i64,
    pub telegram_id: i64,
    pub kind: String,
    pub prompt: String,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GenerationLogInsert {
    pub telegram_id: i64,
    pub kind: GenerationKind,
    pub prompt: String,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GenerationLogInsert {
    pub fn new(telegram_id: i64, kind: GenerationKind, prompt: &str, result: Option<String>) -> Self {
        GenerationLogInsert {
            telegram_id,
            kind,
            prompt: prompt.to_string(),
            result,
            created_at: Utc::now(),
        }
    }
}

pub fn default_plans() -> Vec<PlanRow> {
    vec![
        PlanRow {
            id: 1,
            name: "Free".to_string(),
            daily_limit: 5,
            price_usd: 0.0,
        },
        PlanRow {
            id: 2,
            name: "Pro".to_string(),
            daily_limit: 50,
            price_usd: 9.99,
        },
    ]
}
