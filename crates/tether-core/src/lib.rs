pub mod config;
pub mod event_buffer;
pub mod paths;
pub mod transcripts;

pub use config::*;
pub use event_buffer::*;
pub use paths::*;
pub use transcripts::*;
