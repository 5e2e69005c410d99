pub mod agent_loop;
pub mod cancellations;
pub mod config;
pub mod event_bus;
pub mod prompt;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 8000;

pub use agent_loop::*;
pub use cancellations::*;
pub use config::*;
pub use event_bus::*;
pub use prompt::SYSTEM_PROMPT;
