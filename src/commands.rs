use std::time::Duration;

use chrono::DateTime;
use poise::command;
use poise::serenity_prelude::{self as serenity, Mentionable};

use crate::moderation::{Case, CaseEdit, CaseId, DeleteOptions, ModerationError, SanctionRequest};
use crate::{Context, Error};

/// Every command this bot registers
#[must_use]
pub fn all() -> Vec<poise::Command<crate::Data, Error>> {
    vec![ban(), unban(), mute(), unmute(), warn(), kick(), case()]
}

/// Ban a member, optionally for a limited time
#[command(slash_command, guild_only, default_member_permissions = "BAN_MEMBERS")]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "Member to ban"] user: serenity::User,
    #[description = "How long, e.g. 30m, 12h or 7d; permanent if omitted"]
    duration: Option<String>,
    #[description = "Reason for the ban"] reason: Option<String>,
) -> Result<(), Error> {
    let request = with_duration(sanction_request(ctx, &user, reason)?, duration)?;
    let case = ctx.data().moderator().ban(request).await?;
    ctx.say(describe_case(&case)).await?;
    Ok(())
}

/// Lift a ban
#[command(slash_command, guild_only, default_member_permissions = "BAN_MEMBERS")]
pub async fn unban(
    ctx: Context<'_>,
    #[description = "User to unban"] user: serenity::User,
    #[description = "Reason for the unban"] reason: Option<String>,
) -> Result<(), Error> {
    let request = sanction_request(ctx, &user, reason)?;
    let case = ctx.data().moderator().unban(request).await?;
    ctx.say(describe_case(&case)).await?;
    Ok(())
}

/// Mute a member by giving them the mute role
#[command(slash_command, guild_only, default_member_permissions = "MODERATE_MEMBERS")]
pub async fn mute(
    ctx: Context<'_>,
    #[description = "Member to mute"] user: serenity::User,
    #[description = "Role that mutes members"] role: serenity::Role,
    #[description = "How long, e.g. 30m, 12h or 7d; permanent if omitted"]
    duration: Option<String>,
    #[description = "Reason for the mute"] reason: Option<String>,
) -> Result<(), Error> {
    let request = with_duration(sanction_request(ctx, &user, reason)?, duration)?
        .muted_role(role.id.get());
    let case = ctx.data().moderator().mute(request).await?;
    ctx.say(describe_case(&case)).await?;
    Ok(())
}

/// Remove the mute role from a member
#[command(slash_command, guild_only, default_member_permissions = "MODERATE_MEMBERS")]
pub async fn unmute(
    ctx: Context<'_>,
    #[description = "Member to unmute"] user: serenity::User,
    #[description = "Role that mutes members"] role: serenity::Role,
    #[description = "Reason for the unmute"] reason: Option<String>,
) -> Result<(), Error> {
    let request = sanction_request(ctx, &user, reason)?.muted_role(role.id.get());
    let case = ctx.data().moderator().unmute(request).await?;
    ctx.say(describe_case(&case)).await?;
    Ok(())
}

/// Record a warning against a member
#[command(slash_command, guild_only, default_member_permissions = "MODERATE_MEMBERS")]
pub async fn warn(
    ctx: Context<'_>,
    #[description = "Member to warn"] user: serenity::User,
    #[description = "Reason for the warning"] reason: String,
) -> Result<(), Error> {
    let request = sanction_request(ctx, &user, Some(reason))?;
    let case = ctx.data().moderator().warn(request).await?;
    ctx.say(describe_case(&case)).await?;
    Ok(())
}

/// Kick a member from the server
#[command(slash_command, guild_only, default_member_permissions = "KICK_MEMBERS")]
pub async fn kick(
    ctx: Context<'_>,
    #[description = "Member to kick"] user: serenity::User,
    #[description = "Reason for the kick"] reason: String,
) -> Result<(), Error> {
    let request = sanction_request(ctx, &user, Some(reason))?;
    let case = ctx.data().moderator().kick(request).await?;
    ctx.say(describe_case(&case)).await?;
    Ok(())
}

/// Inspect and manage moderation cases
#[command(
    slash_command,
    guild_only,
    default_member_permissions = "MODERATE_MEMBERS",
    subcommands("show", "list", "end", "edit", "delete"),
    subcommand_required
)]
pub async fn case(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show a single case
#[command(slash_command, guild_only)]
pub async fn show(
    ctx: Context<'_>,
    #[description = "Case ID"] id: String,
) -> Result<(), Error> {
    let case = ctx.data().moderator().find(&parse_case_id(&id)?)?;
    ensure_same_guild(ctx, &case)?;
    ctx.say(describe_case(&case)).await?;
    Ok(())
}

/// List the cases recorded against a member
#[command(slash_command, guild_only)]
pub async fn list(
    ctx: Context<'_>,
    #[description = "Member to look up"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command can only be used in a server")?;
    let cases = ctx
        .data()
        .moderator()
        .cases_for(guild_id.get(), user.id.get())?;

    if cases.is_empty() {
        ctx.say(format!("No cases recorded for {}", user.mention()))
            .await?;
        return Ok(());
    }
    let lines: Vec<String> = cases.iter().map(describe_case).collect();
    ctx.say(lines.join("\n")).await?;
    Ok(())
}

/// End an active case early, lifting its ban or mute
#[command(slash_command, guild_only)]
pub async fn end(
    ctx: Context<'_>,
    #[description = "Case ID"] id: String,
) -> Result<(), Error> {
    let moderator = ctx.data().moderator();
    let id = parse_case_id(&id)?;
    ensure_same_guild(ctx, &moderator.find(&id)?)?;

    let case = moderator.end(&id).await?;
    ctx.say(format!("Ended case `{}`", case.id)).await?;
    Ok(())
}

/// Change the reason or expiry of an active case
#[command(slash_command, guild_only)]
pub async fn edit(
    ctx: Context<'_>,
    #[description = "Case ID"] id: String,
    #[description = "New reason"] reason: Option<String>,
    #[description = "Time to add, e.g. 1h; prefix with - to shorten"] add_time: Option<String>,
    #[description = "New end as a Unix timestamp in seconds"] ends_at: Option<i64>,
) -> Result<(), Error> {
    let moderator = ctx.data().moderator();
    let id = parse_case_id(&id)?;
    ensure_same_guild(ctx, &moderator.find(&id)?)?;

    let add_time_ms = add_time.as_deref().map(parse_signed_millis).transpose()?;
    let set_end_timestamp = ends_at
        .map(|secs| {
            DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                ModerationError::Validation(format!("{secs} is not a valid timestamp"))
            })
        })
        .transpose()?;

    let edit = CaseEdit {
        actor_id: None,
        reason,
        add_time_ms,
        set_end_timestamp,
    };
    let case = moderator.edit(&id, edit).await?;
    ctx.say(describe_case(&case)).await?;
    Ok(())
}

/// Delete a case, lifting its sanction if it is still active
#[command(slash_command, guild_only, default_member_permissions = "ADMINISTRATOR")]
pub async fn delete(
    ctx: Context<'_>,
    #[description = "Case ID"] id: String,
    #[description = "Why the case is deleted"] reason: Option<String>,
) -> Result<(), Error> {
    let moderator = ctx.data().moderator();
    let id = parse_case_id(&id)?;
    ensure_same_guild(ctx, &moderator.find(&id)?)?;

    let options = DeleteOptions {
        actor_id: Some(ctx.author().id.get()),
        reason,
    };
    let case = moderator.delete(&id, options).await?;
    ctx.say(format!("Deleted case `{}`", case.id)).await?;
    Ok(())
}

fn sanction_request(
    ctx: Context<'_>,
    user: &serenity::User,
    reason: Option<String>,
) -> Result<SanctionRequest, Error> {
    let guild_id = ctx.guild_id().ok_or("This command can only be used in a server")?;
    let author = ctx.author();
    let mut request = SanctionRequest::new(guild_id.get(), author.id.get(), user.id.get())
        .actor_tag(author.tag());
    request.reason = reason;
    Ok(request)
}

fn with_duration(
    request: SanctionRequest,
    duration: Option<String>,
) -> Result<SanctionRequest, ModerationError> {
    match duration.as_deref() {
        Some(text) => Ok(request.duration(parse_duration(text)?)),
        None => Ok(request),
    }
}

// Cases are global; only let a guild see its own
fn ensure_same_guild(ctx: Context<'_>, case: &Case) -> Result<(), ModerationError> {
    match ctx.guild_id() {
        Some(guild_id) if guild_id.get() == case.community_id => Ok(()),
        _ => Err(ModerationError::NotFound(case.id.clone())),
    }
}

fn parse_case_id(text: &str) -> Result<CaseId, ModerationError> {
    text.trim()
        .parse()
        .map_err(|_| ModerationError::Validation(format!("`{text}` is not a case ID")))
}

/// Parse a duration such as `90s`, `30m`, `1h 30m` or `7days`. A bare number is seconds.
pub fn parse_duration(text: &str) -> Result<Duration, ModerationError> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(text)
        .map_err(|e| ModerationError::Validation(format!("`{text}` is not a valid duration: {e}")))
}

/// Like [`parse_duration`], with an optional leading `-`, in milliseconds
pub fn parse_signed_millis(text: &str) -> Result<i64, ModerationError> {
    let text = text.trim();
    let (sign, magnitude) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text.strip_prefix('+').unwrap_or(text)),
    };
    let millis = i64::try_from(parse_duration(magnitude)?.as_millis())
        .map_err(|_| ModerationError::Validation(format!("`{text}` is too long")))?;
    Ok(sign * millis)
}

/// One-line summary of a case for replies
pub fn describe_case(case: &Case) -> String {
    let status = match case.expires_at {
        Some(at) if !case.ended => format!("expires <t:{}:R>", at.timestamp()),
        None if !case.kind.is_instantaneous() => "permanent".to_string(),
        _ => "ended".to_string(),
    };
    format!(
        "Case `{}`: {} <@{}> by <@{}> ({status}): {}",
        case.id, case.kind, case.subject_id, case.actor_id, case.reason
    )
}
