use crate::db::Database;
use crate::limiter::QuotaLimiter;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub limiter: QuotaLimiter,
}

impl AppState {
    pub fn new(db: Database) -> Self {
        let limiter = QuotaLimiter::new(db.clone());
        AppState { db, limiter }
    }
}
