use crate::moderation::{Case, CaseListener};
use crate::{AUDIT_TARGET, COMMAND_TARGET, CONSOLE_TARGET, Data, ERROR_TARGET, Error};
use poise::{Context, FrameworkError};
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Moderation log file name; command and case audit events both land here
pub const MODERATION_LOG_FILE: &str = "moderation";

/// Initialize the logging system with console and file outputs
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Create log directory if it doesn't exist
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    // Set up file appenders with daily rotation
    let moderation_file =
        RollingFileAppender::new(Rotation::DAILY, LOG_DIR, MODERATION_LOG_FILE);

    // Create a layer for console output (human-readable format)
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // Create a layer for command and audit logs (JSON format)
    let moderation_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(moderation_file);

    // Default to INFO level if not specified, but filter out serenity heartbeat logs
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info").add_directive("serenity=error".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(moderation_layer)
        .try_init()?;

    info!("Logging system initialized");
    Ok(())
}

// Store command start time in the context data
thread_local! {
    static COMMAND_START_TIME: std::cell::RefCell<Option<Instant>> = const { std::cell::RefCell::new(None) };
}

/// Log the start of a command execution (pre-command hook)
pub fn log_command_start(ctx: Context<'_, Data, Error>) {
    // Store the start time for later use in post_command
    COMMAND_START_TIME.with(|cell| {
        *cell.borrow_mut() = Some(Instant::now());
    });

    let command_name = ctx.command().qualified_name.clone();
    let guild_id = ctx
        .guild_id()
        .map_or_else(|| "DM".to_string(), |id| id.get().to_string());
    let user_id = ctx.author().id.get().to_string();

    // Attempt to format arguments
    let args = if ctx.command().parameters.is_empty() {
        String::new()
    } else {
        // This is a simplified approach - in a real scenario you'd want to
        // extract the actual arguments more carefully
        format!("{:?}", ctx.invocation_string())
    };

    info!(
        target: COMMAND_TARGET,
        command = %command_name,
        guild_id = %guild_id,
        user_id = %user_id,
        arguments = %args,
        event = "start",
        "Command execution started"
    );
}

/// Log the end of a command execution (post-command hook)
pub fn log_command_end(ctx: Context<'_, Data, Error>) {
    // Calculate execution time
    let duration =
        COMMAND_START_TIME.with(|cell| cell.borrow_mut().take().map(|start| start.elapsed()));

    let command_name = ctx.command().qualified_name.clone();
    let guild_id = ctx
        .guild_id()
        .map_or_else(|| "DM".to_string(), |id| id.get().to_string());
    let user_id = ctx.author().id.get().to_string();

    let duration_ms = u64::try_from(duration.map_or(0, |d| d.as_millis())).unwrap_or_default();
    info!(
        target: COMMAND_TARGET,
        command = %command_name,
        guild_id = %guild_id,
        user_id = %user_id,
        duration_ms = duration_ms,
        event = "end",
        "Command execution completed"
    );
}

/// Log errors that occur during command execution
pub fn log_command_error(error: &FrameworkError<'_, Data, Error>) {
    match error {
        FrameworkError::Command { error, ctx, .. } => {
            let command_name = ctx.command().qualified_name.clone();
            let guild_id = ctx
                .guild_id()
                .as_ref()
                .map_or_else(|| "DM".to_string(), ToString::to_string);
            let user_id = ctx.author().id.get().to_string();

            error!(
                target: ERROR_TARGET,
                command = %command_name,
                guild_id = %guild_id,
                user_id = %user_id,
                error = %error,
                "Command error"
            );
        }
        FrameworkError::CommandCheckFailed { error, ctx, .. } => {
            let command_name = ctx.command().qualified_name.clone();
            let guild_id = ctx
                .guild_id()
                .as_ref()
                .map_or_else(|| "DM".to_string(), ToString::to_string);
            let user_id = ctx.author().id.get().to_string();

            let error_msg = error
                .as_ref()
                .map_or_else(|| "Check failed".to_string(), ToString::to_string);

            error!(
                target: ERROR_TARGET,
                command = %command_name,
                guild_id = %guild_id,
                user_id = %user_id,
                error = %error_msg,
                "Command check failed"
            );
        }
        err => {
            error!(
                target: ERROR_TARGET,
                error_type = %std::any::type_name::<FrameworkError<'_, Data, Error>>(),
                error = ?err,
                "Other framework error"
            );
        }
    }
}

/// Writes every case lifecycle notification to the audit log
#[derive(Debug, Default, Clone, Copy)]
pub struct CaseAuditLog;

impl CaseListener for CaseAuditLog {
    fn case_create(&self, case: &Case) {
        info!(
            target: AUDIT_TARGET,
            event = "caseCreate",
            case_id = %case.id,
            kind = %case.kind,
            guild_id = case.community_id,
            actor_id = case.actor_id,
            subject_id = case.subject_id,
            expires_at = %describe_expiry(case),
            reason = %case.reason,
            "Case created"
        );
    }

    fn case_update(&self, old: &Case, new: &Case) {
        info!(
            target: AUDIT_TARGET,
            event = "caseUpdate",
            case_id = %new.id,
            old_expires_at = %describe_expiry(old),
            expires_at = %describe_expiry(new),
            old_reason = %old.reason,
            reason = %new.reason,
            "Case updated"
        );
    }

    fn case_delete(&self, case: &Case) {
        info!(
            target: AUDIT_TARGET,
            event = "caseDelete",
            case_id = %case.id,
            kind = %case.kind,
            guild_id = case.community_id,
            subject_id = case.subject_id,
            "Case ended"
        );
    }
}

/// Expiry as RFC 3339, or "never" for permanent and instantaneous cases
pub fn describe_expiry(case: &Case) -> String {
    case.expires_at
        .map_or_else(|| "never".to_string(), |at| at.to_rfc3339())
}

pub fn log_console(message: String) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}
