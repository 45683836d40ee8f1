use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::models::{
    default_plans, GenerationLogInsert, GenerationLogRow, NewUser, PlanRow, UserRow,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("log queue unavailable: {0}")]
    Queue(String),
}

#[derive(Default)]
struct MemoryInner {
    users: Mutex<HashMap<i64, UserRow>>,
    logs: Mutex<Vec<GenerationLogRow>>,
    next_user_id: Mutex<i64>,
    next_log_id: Mutex<i64>,
}

#[derive(Clone)]
enum Backend {
    Sqlite(SqlitePool),
    Memory(Arc<MemoryInner>),
}

#[derive(Clone)]
pub struct Database {
    backend: Backend,
    sender: mpsc::Sender<GenerationLogInsert>,
}

impl Database {
    /// Opens the SQLite store, or the in-memory stand-in when forced via
    /// `use_fallback` or when SQLite cannot be opened.
    pub async fn init(database_url: &str, use_fallback: bool) -> Database {
        if !use_fallback && !database_url.trim().is_empty() {
            match Database::connect_sqlite(database_url).await {
                Ok(db) => return db,
                Err(err) => {
                    warn!("Failed to open SQLite store at {database_url}: {err}");
                    warn!("Falling back to in-memory store; data will not survive restarts");
                }
            }
        }
        Database::in_memory()
    }

    async fn connect_sqlite(database_url: &str) -> Result<Database, StoreError> {
        // a plain :memory: database is per-connection, so a larger pool
        // would hand each connection its own empty schema
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                telegram_id INTEGER NOT NULL UNIQUE,\
                display_name TEXT NOT NULL,\
                plan_name TEXT NOT NULL,\
                daily_limit INTEGER NOT NULL,\
                generations_today INTEGER NOT NULL DEFAULT 0,\
                last_generation_date TEXT\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plans (\
                id INTEGER PRIMARY KEY,\
                name TEXT NOT NULL,\
                daily_limit INTEGER NOT NULL,\
                price_usd REAL NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS generation_logs (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                telegram_id INTEGER NOT NULL,\
                kind TEXT NOT NULL,\
                prompt TEXT NOT NULL,\
                result TEXT,\
                created_at TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_generation_logs_telegram_id \
             ON generation_logs(telegram_id);",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_generation_logs_created_at \
             ON generation_logs(created_at);",
        )
        .execute(&pool)
        .await?;

        let plan_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plans")
            .fetch_one(&pool)
            .await?;
        if plan_count == 0 {
            for plan in default_plans() {
                sqlx::query("INSERT INTO plans (id, name, daily_limit, price_usd) VALUES (?, ?, ?, ?)")
                    .bind(plan.id)
                    .bind(&plan.name)
                    .bind(plan.daily_limit)
                    .bind(plan.price_usd)
                    .execute(&pool)
                    .await?;
            }
            info!("Seeded default plans");
        }

        info!("Database tables created successfully");

        Ok(Database::start(Backend::Sqlite(pool)))
    }

    pub fn in_memory() -> Database {
        info!("Using in-memory user store");
        Database::start(Backend::Memory(Arc::new(MemoryInner::default())))
    }

    fn start(backend: Backend) -> Database {
        let (sender, receiver) = mpsc::channel(1000);
        let writer_backend = backend.clone();
        tokio::spawn(async move {
            log_writer(writer_backend, receiver).await;
        });

        Database { backend, sender }
    }

    pub fn backend_label(&self) -> &'static str {
        match &self.backend {
            Backend::Sqlite(_) => "sqlite",
            Backend::Memory(_) => "memory",
        }
    }

    pub async fn find_user(&self, telegram_id: i64) -> Result<Option<UserRow>, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let row = sqlx::query_as::<_, UserRow>(
                    "SELECT id, telegram_id, display_name, plan_name, daily_limit, \
                     generations_today, last_generation_date \
                     FROM users WHERE telegram_id = ?",
                )
                .bind(telegram_id)
                .fetch_optional(pool)
                .await?;
                Ok(row)
            }
            Backend::Memory(inner) => Ok(inner.users.lock().get(&telegram_id).cloned()),
        }
    }

    pub async fn create_user(&self, user: NewUser) -> Result<UserRow, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let result = sqlx::query(
                    "INSERT INTO users (telegram_id, display_name, plan_name, daily_limit, generations_today) \
                     VALUES (?, ?, ?, ?, 0)",
                )
                .bind(user.telegram_id)
                .bind(&user.display_name)
                .bind(&user.plan_name)
                .bind(user.daily_limit)
                .execute(pool)
                .await?;

                Ok(UserRow {
                    id: result.last_insert_rowid(),
                    telegram_id: user.telegram_id,
                    display_name: user.display_name,
                    plan_name: user.plan_name,
                    daily_limit: user.daily_limit,
                    generations_today: 0,
                    last_generation_date: None,
                })
            }
            Backend::Memory(inner) => {
                let id = {
                    let mut next = inner.next_user_id.lock();
                    *next += 1;
                    *next
                };
                let row = UserRow {
                    id,
                    telegram_id: user.telegram_id,
                    display_name: user.display_name,
                    plan_name: user.plan_name,
                    daily_limit: user.daily_limit,
                    generations_today: 0,
                    last_generation_date: None,
                };
                inner.users.lock().insert(user.telegram_id, row.clone());
                Ok(row)
            }
        }
    }

    /// Writes the quota fields for one user. Returns false when no such
    /// user exists; that is not an error.
    pub async fn update_quota(
        &self,
        telegram_id: i64,
        generations_today: i64,
        last_generation_date: NaiveDate,
    ) -> Result<bool, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let result = sqlx::query(
                    "UPDATE users SET generations_today = ?, last_generation_date = ? \
                     WHERE telegram_id = ?",
                )
                .bind(generations_today)
                .bind(last_generation_date)
                .bind(telegram_id)
                .execute(pool)
                .await?;
                Ok(result.rows_affected() > 0)
            }
            Backend::Memory(inner) => {
                let mut users = inner.users.lock();
                match users.get_mut(&telegram_id) {
                    Some(user) => {
                        user.generations_today = generations_today;
                        user.last_generation_date = Some(last_generation_date);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    pub async fn list_plans(&self) -> Result<Vec<PlanRow>, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let rows = sqlx::query_as::<_, PlanRow>(
                    "SELECT id, name, daily_limit, price_usd FROM plans ORDER BY id",
                )
                .fetch_all(pool)
                .await?;
                Ok(rows)
            }
            Backend::Memory(_) => Ok(default_plans()),
        }
    }

    pub async fn count_users(&self) -> Result<i64, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
                    .fetch_one(pool)
                    .await?;
                Ok(count)
            }
            Backend::Memory(inner) => Ok(inner.users.lock().len() as i64),
        }
    }

    pub async fn count_generation_logs(&self) -> Result<i64, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM generation_logs")
                    .fetch_one(pool)
                    .await?;
                Ok(count)
            }
            Backend::Memory(inner) => Ok(inner.logs.lock().len() as i64),
        }
    }

    pub async fn insert_generation_log(
        &self,
        insert: &GenerationLogInsert,
    ) -> Result<(), StoreError> {
        insert_log(&self.backend, insert).await
    }

    pub async fn queue_generation_log(
        &self,
        insert: GenerationLogInsert,
    ) -> Result<(), StoreError> {
        self.sender
            .send(insert)
            .await
            .map_err(|err| StoreError::Queue(err.to_string()))
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
                Ok(())
            }
            Backend::Memory(_) => Ok(()),
        }
    }

    pub fn queue_max_capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn queue_available_capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_max_capacity()
            .saturating_sub(self.queue_available_capacity())
    }

    #[cfg(test)]
    pub fn sqlite_pool(&self) -> Option<&SqlitePool> {
        match &self.backend {
            Backend::Sqlite(pool) => Some(pool),
            Backend::Memory(_) => None,
        }
    }
}

async fn insert_log(backend: &Backend, insert: &GenerationLogInsert) -> Result<(), StoreError> {
    match backend {
        Backend::Sqlite(pool) => {
            sqlx::query(
                "INSERT INTO generation_logs (telegram_id, kind, prompt, result, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(insert.telegram_id)
            .bind(insert.kind.as_str())
            .bind(&insert.prompt)
            .bind(&insert.result)
            .bind(insert.created_at)
            .execute(pool)
            .await?;
            Ok(())
        }
        Backend::Memory(inner) => {
            let id = {
                let mut next = inner.next_log_id.lock();
                *next += 1;
                *next
            };
            inner.logs.lock().push(GenerationLogRow {
                id,
                telegram_id: insert.telegram_id,
                kind: insert.kind.as_str().to_string(),
                prompt: insert.prompt.clone(),
                result: insert.result.clone(),
                created_at: insert.created_at,
            });
            Ok(())
        }
    }
}

async fn log_writer(backend: Backend, mut receiver: mpsc::Receiver<GenerationLogInsert>) {
    while let Some(insert) = receiver.recv().await {
        if let Err(err) = insert_log(&backend, &insert).await {
            warn!("Error in generation log writer: {err}");
        }
    }

    if let Backend::Sqlite(pool) = backend {
        pool.close().await;
    }
    info!("Generation log writer task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::GenerationKind;
    use chrono::NaiveDate;

    fn sample_user(telegram_id: i64) -> NewUser {
        NewUser {
            telegram_id,
            display_name: "Test".to_string(),
            plan_name: "Free".to_string(),
            daily_limit: 5,
        }
    }

    #[tokio::test]
    async fn memory_store_roundtrips_users() {
        let db = Database::in_memory();
        assert_eq!(db.backend_label(), "memory");

        assert!(db.find_user(42).await.unwrap().is_none());

        let created = db.create_user(sample_user(42)).await.unwrap();
        assert_eq!(created.generations_today, 0);
        assert!(created.last_generation_date.is_none());

        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert!(db.update_quota(42, 3, date).await.unwrap());

        let found = db.find_user(42).await.unwrap().unwrap();
        assert_eq!(found.generations_today, 3);
        assert_eq!(found.last_generation_date, Some(date));
        assert_eq!(db.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_update_for_unknown_user_reports_no_match() {
        let db = Database::in_memory();
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert!(!db.update_quota(999, 1, date).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_store_roundtrips_users_and_plans() {
        let db = Database::init("sqlite::memory:", false).await;
        assert_eq!(db.backend_label(), "sqlite");

        let plans = db.list_plans().await.unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].name, "Free");
        assert_eq!(plans[1].daily_limit, 50);

        let created = db.create_user(sample_user(7)).await.unwrap();
        assert!(created.id > 0);

        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        assert!(db.update_quota(7, 1, date).await.unwrap());
        assert!(!db.update_quota(8, 1, date).await.unwrap());

        let found = db.find_user(7).await.unwrap().unwrap();
        assert_eq!(found.generations_today, 1);
        assert_eq!(found.last_generation_date, Some(date));
        assert_eq!(db.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn generation_logs_insert_directly_and_via_queue() {
        let db = Database::init("sqlite::memory:", false).await;

        let insert = GenerationLogInsert::new(7, GenerationKind::Text, "a prompt", None);
        db.insert_generation_log(&insert).await.unwrap();
        assert_eq!(db.count_generation_logs().await.unwrap(), 1);

        db.queue_generation_log(GenerationLogInsert::new(
            7,
            GenerationKind::Image,
            "another",
            Some("images/7_1.png".to_string()),
        ))
        .await
        .unwrap();

        for _ in 0..100 {
            if db.count_generation_logs().await.unwrap() == 2 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("queued generation log was not written");
    }
}
