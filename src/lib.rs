pub mod commands;
pub mod config;
pub mod data;
pub mod handlers;
pub mod logging;
pub mod moderation;

pub const BOT_NAME: &str = "case_warden";
pub const COMMAND_TARGET: &str = "case_warden::command";
pub const ERROR_TARGET: &str = "case_warden::error";
pub const EVENT_TARGET: &str = "case_warden::handlers";
pub const AUDIT_TARGET: &str = "case_warden::audit";
pub const CONSOLE_TARGET: &str = "case_warden";

pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
