use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::CONFIG;

static RATE_LIMITS: Lazy<Mutex<HashMap<i64, Instant>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Short per-user cooldown between generation commands, independent of the
/// daily quota. Checking also arms the cooldown.
pub fn is_rate_limited(user_id: i64) -> bool {
    let mut limits = RATE_LIMITS.lock();
    let now = Instant::now();

    if let Some(last) = limits.get(&user_id) {
        if now.duration_since(*last) < Duration::from_secs(CONFIG.rate_limit_seconds) {
            return true;
        }
    }

    limits.insert(user_id, now);
    false
}
