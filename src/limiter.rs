use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::db::models::UserRow;
use crate::db::{Database, StoreError};

/// Source of the current UTC calendar date. Injected so tests can move
/// the day boundary without waiting for midnight.
pub trait Clock: Send + Sync {
    fn today_utc(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today_utc(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    NotRegistered,
    LimitReached,
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            QuotaDecision::Allowed => "ok",
            QuotaDecision::NotRegistered => "not registered",
            QuotaDecision::LimitReached => "daily limit reached",
        }
    }

    /// Reply text for the chat when a generation is denied.
    pub fn user_message(&self) -> &'static str {
        match self {
            QuotaDecision::Allowed => "ok",
            QuotaDecision::NotRegistered => {
                "You are not registered yet. Send /start to sign up for the free plan."
            }
            QuotaDecision::LimitReached => {
                "You have reached your plan's daily limit. Try again tomorrow or see /plans for an upgrade."
            }
        }
    }
}

/// Counter value in effect for `today`: a counter carried over from an
/// earlier date is stale and counts as zero.
pub fn generations_used_today(user: &UserRow, today: NaiveDate) -> i64 {
    if user.last_generation_date == Some(today) {
        user.generations_today
    } else {
        0
    }
}

/// Decides whether a generation is permitted for an account right now and
/// records that one occurred.
///
/// `can_generate` followed by `increment` is a check-then-act sequence
/// over two separate store calls; on its own it is not atomic, and two
/// racing callers can both pass the check. Callers that hold the guard
/// from `lock_account` across the whole check-generate-increment sequence
/// get per-account serialization, and the stored counter then never
/// exceeds the account's daily limit.
#[derive(Clone)]
pub struct QuotaLimiter {
    db: Database,
    clock: Arc<dyn Clock>,
    account_locks: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl QuotaLimiter {
    pub fn new(db: Database) -> Self {
        QuotaLimiter::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Database, clock: Arc<dyn Clock>) -> Self {
        QuotaLimiter {
            db,
            clock,
            account_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn lock_account(&self, telegram_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.account_locks.lock();
            locks.entry(telegram_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Checks whether the account may generate right now.
    ///
    /// Performs the lazy reset when the stored date is not today: the
    /// counter is zeroed and the date advanced in the store before the
    /// limit is evaluated. Repeated calls within one day are idempotent.
    /// Store failures surface as `Err` and must be treated as a denial,
    /// never as an allow.
    pub async fn can_generate(&self, telegram_id: i64) -> Result<QuotaDecision, StoreError> {
        let Some(mut user) = self.db.find_user(telegram_id).await? else {
            return Ok(QuotaDecision::NotRegistered);
        };

        let today = self.clock.today_utc();
        if user.last_generation_date != Some(today) {
            self.db.update_quota(telegram_id, 0, today).await?;
            user.generations_today = 0;
            user.last_generation_date = Some(today);
        }

        if user.generations_today >= user.daily_limit {
            return Ok(QuotaDecision::LimitReached);
        }

        Ok(QuotaDecision::Allowed)
    }

    /// Records one generation: counter + 1, date set to today.
    ///
    /// Performs no limit check; callers are expected to have seen
    /// `Allowed` from `can_generate` under the account lock. An unknown
    /// account is a no-op.
    pub async fn increment(&self, telegram_id: i64) -> Result<(), StoreError> {
        let Some(user) = self.db.find_user(telegram_id).await? else {
            return Ok(());
        };

        let today = self.clock.today_utc();
        self.db
            .update_quota(telegram_id, user.generations_today + 1, today)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewUser;

    struct ManualClock(Mutex<NaiveDate>);

    impl ManualClock {
        fn starting_at(date: NaiveDate) -> Arc<Self> {
            Arc::new(ManualClock(Mutex::new(date)))
        }

        fn set(&self, date: NaiveDate) {
            *self.0.lock() = date;
        }
    }

    impl Clock for ManualClock {
        fn today_utc(&self) -> NaiveDate {
            *self.0.lock()
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn limiter_with_user(daily_limit: i64) -> (QuotaLimiter, Arc<ManualClock>, Database) {
        let db = Database::in_memory();
        db.create_user(NewUser {
            telegram_id: 100,
            display_name: "Test".to_string(),
            plan_name: "Free".to_string(),
            daily_limit,
        })
        .await
        .unwrap();

        let clock = ManualClock::starting_at(date(2025, 6, 1));
        let limiter = QuotaLimiter::with_clock(db.clone(), clock.clone());
        (limiter, clock, db)
    }

    #[tokio::test]
    async fn counts_up_to_the_limit_then_denies() {
        let (limiter, _clock, db) = limiter_with_user(2).await;

        assert_eq!(
            limiter.can_generate(100).await.unwrap(),
            QuotaDecision::Allowed
        );
        limiter.increment(100).await.unwrap();
        assert_eq!(db.find_user(100).await.unwrap().unwrap().generations_today, 1);

        assert_eq!(
            limiter.can_generate(100).await.unwrap(),
            QuotaDecision::Allowed
        );
        limiter.increment(100).await.unwrap();
        assert_eq!(db.find_user(100).await.unwrap().unwrap().generations_today, 2);

        let decision = limiter.can_generate(100).await.unwrap();
        assert_eq!(decision, QuotaDecision::LimitReached);
        assert_eq!(decision.reason(), "daily limit reached");
    }

    #[tokio::test]
    async fn stale_counter_is_lazily_reset_on_check() {
        let (limiter, _clock, db) = limiter_with_user(5).await;
        db.update_quota(100, 5, date(2025, 5, 31)).await.unwrap();

        let decision = limiter.can_generate(100).await.unwrap();
        assert_eq!(decision, QuotaDecision::Allowed);
        assert_eq!(decision.reason(), "ok");

        let user = db.find_user(100).await.unwrap().unwrap();
        assert_eq!(user.generations_today, 0);
        assert_eq!(user.last_generation_date, Some(date(2025, 6, 1)));
    }

    #[tokio::test]
    async fn unknown_account_is_denied_without_mutation() {
        let db = Database::in_memory();
        let clock = ManualClock::starting_at(date(2025, 6, 1));
        let limiter = QuotaLimiter::with_clock(db.clone(), clock);

        let decision = limiter.can_generate(999).await.unwrap();
        assert_eq!(decision, QuotaDecision::NotRegistered);
        assert_eq!(decision.reason(), "not registered");
        assert_eq!(db.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_checks_are_idempotent() {
        let (limiter, _clock, db) = limiter_with_user(3).await;
        db.update_quota(100, 2, date(2025, 5, 30)).await.unwrap();

        let first = limiter.can_generate(100).await.unwrap();
        let after_first = db.find_user(100).await.unwrap().unwrap();
        for _ in 0..4 {
            assert_eq!(limiter.can_generate(100).await.unwrap(), first);
        }
        let after_many = db.find_user(100).await.unwrap().unwrap();
        assert_eq!(after_first.generations_today, after_many.generations_today);
        assert_eq!(
            after_first.last_generation_date,
            after_many.last_generation_date
        );
    }

    #[tokio::test]
    async fn increment_for_unknown_account_is_a_noop() {
        let db = Database::in_memory();
        let clock = ManualClock::starting_at(date(2025, 6, 1));
        let limiter = QuotaLimiter::with_clock(db.clone(), clock);

        limiter.increment(12345).await.unwrap();
        assert_eq!(db.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn day_rollover_restores_the_allowance() {
        let (limiter, clock, db) = limiter_with_user(1).await;

        assert!(limiter.can_generate(100).await.unwrap().is_allowed());
        limiter.increment(100).await.unwrap();
        assert_eq!(
            limiter.can_generate(100).await.unwrap(),
            QuotaDecision::LimitReached
        );

        clock.set(date(2025, 6, 2));
        assert!(limiter.can_generate(100).await.unwrap().is_allowed());

        let user = db.find_user(100).await.unwrap().unwrap();
        assert_eq!(user.generations_today, 0);
        assert_eq!(user.last_generation_date, Some(date(2025, 6, 2)));
    }

    #[tokio::test]
    async fn zero_limit_denies_even_on_a_fresh_day() {
        let (limiter, _clock, _db) = limiter_with_user(0).await;
        assert_eq!(
            limiter.can_generate(100).await.unwrap(),
            QuotaDecision::LimitReached
        );
    }

    // Documented reference behavior: without the account lock the
    // check-then-increment pair is not atomic, so interleaved callers can
    // push the stored counter past the limit.
    #[tokio::test]
    async fn unguarded_check_then_increment_can_exceed_the_limit() {
        let (limiter, _clock, db) = limiter_with_user(1).await;

        assert!(limiter.can_generate(100).await.unwrap().is_allowed());
        assert!(limiter.can_generate(100).await.unwrap().is_allowed());
        limiter.increment(100).await.unwrap();
        limiter.increment(100).await.unwrap();

        let user = db.find_user(100).await.unwrap().unwrap();
        assert!(user.generations_today > user.daily_limit);
    }

    #[tokio::test]
    async fn guarded_sequences_never_exceed_the_limit() {
        let (limiter, _clock, db) = limiter_with_user(3).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                let _slot = limiter.lock_account(100).await;
                if limiter.can_generate(100).await.unwrap().is_allowed() {
                    limiter.increment(100).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let user = db.find_user(100).await.unwrap().unwrap();
        assert_eq!(user.generations_today, 3);
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_an_error_not_a_decision() {
        let db = Database::init("sqlite::memory:", false).await;
        db.create_user(NewUser {
            telegram_id: 100,
            display_name: "Test".to_string(),
            plan_name: "Free".to_string(),
            daily_limit: 5,
        })
        .await
        .unwrap();

        let clock = ManualClock::starting_at(date(2025, 6, 1));
        let limiter = QuotaLimiter::with_clock(db.clone(), clock);

        db.sqlite_pool().unwrap().close().await;

        let err = limiter.can_generate(100).await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlx(_)));
        assert!(limiter.increment(100).await.is_err());
    }
}
