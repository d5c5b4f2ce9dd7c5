use std::time::{SystemTime, UNIX_EPOCH};

pub mod event;
pub mod run;
pub mod session_key;
pub mod transcript;

pub use event::*;
pub use run::*;
pub use session_key::*;
pub use transcript::*;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
