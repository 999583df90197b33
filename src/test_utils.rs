use std::sync::{Mutex, MutexGuard, OnceLock};

/// Global lock serializing tests that mutate process-wide state
/// (environment variables, the working directory).
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
