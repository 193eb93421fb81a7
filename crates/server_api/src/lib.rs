pub mod auth;

use shared::{
    domain::{ChannelId, ChannelSeq, ServerId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChannelSummary, MessagePayload, ServerSummary, TokenResponse, UserProfile},
};
use storage::{StoredChannel, StoredMessage, StoredServer, Storage, UsernameUpdate};
use tracing::info;

pub use auth::AuthConfig;

pub const MAX_NAME_BYTES: usize = 100;
pub const MAX_MESSAGE_BYTES: usize = 4000;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
}

/// A freshly appended message together with the server whose members should
/// receive it.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub server_id: ServerId,
    pub message: MessagePayload,
}

pub async fn register(
    ctx: &ApiContext,
    username: &str,
    password: &str,
) -> Result<UserProfile, ApiError> {
    let username = validate_name(username, "username")?;
    if password.is_empty() {
        return Err(ApiError::validation("password must not be empty"));
    }
    let salt = auth::new_salt();
    let digest = auth::digest_password(password, &salt);
    let user_id = ctx
        .storage
        .create_user(&username, &digest, &salt)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Conflict, "username already registered"))?;
    info!(user_id = user_id.0, %username, "registered user");
    Ok(UserProfile { user_id, username })
}

pub async fn issue_token(
    ctx: &ApiContext,
    username: &str,
    password: &str,
) -> Result<TokenResponse, ApiError> {
    let user = ctx
        .storage
        .user_by_username(username.trim())
        .await
        .map_err(internal)?
        .filter(|user| auth::verify_password(password, &user.password_salt, &user.password_hash))
        .ok_or_else(|| ApiError::unauthorized("incorrect username or password"))?;
    Ok(TokenResponse {
        access_token: auth::issue_token(&ctx.auth, user.user_id)?,
        token_type: "bearer".to_string(),
    })
}

/// Token to identity. A valid token for a user that no longer exists is
/// still `Unauthorized`.
pub async fn authenticate_token(ctx: &ApiContext, token: &str) -> Result<UserProfile, ApiError> {
    let user_id = auth::verify_token(&ctx.auth, token)?;
    let user = ctx
        .storage
        .user_by_id(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::unauthorized("unknown user"))?;
    Ok(UserProfile {
        user_id: user.user_id,
        username: user.username,
    })
}

pub async fn current_user(ctx: &ApiContext, user_id: UserId) -> Result<UserProfile, ApiError> {
    let user = ctx
        .storage
        .user_by_id(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(UserProfile {
        user_id: user.user_id,
        username: user.username,
    })
}

pub async fn update_profile(
    ctx: &ApiContext,
    user_id: UserId,
    username: &str,
) -> Result<UserProfile, ApiError> {
    let username = validate_name(username, "username")?;
    match ctx
        .storage
        .update_username(user_id, &username)
        .await
        .map_err(internal)?
    {
        UsernameUpdate::Updated => Ok(UserProfile { user_id, username }),
        UsernameUpdate::Taken => Err(ApiError::new(
            ErrorCode::Conflict,
            "username already registered",
        )),
        UsernameUpdate::UnknownUser => Err(ApiError::not_found("user not found")),
    }
}

pub async fn list_servers(ctx: &ApiContext, user_id: UserId) -> Result<Vec<ServerSummary>, ApiError> {
    let servers = ctx
        .storage
        .list_servers_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(servers.into_iter().map(|s| server_summary(s, true)).collect())
}

/// Every server, for discovery. Invite codes are withheld.
pub async fn list_all_servers(ctx: &ApiContext) -> Result<Vec<ServerSummary>, ApiError> {
    let servers = ctx.storage.list_all_servers().await.map_err(internal)?;
    Ok(servers.into_iter().map(|s| server_summary(s, false)).collect())
}

pub async fn create_server(
    ctx: &ApiContext,
    user_id: UserId,
    name: &str,
) -> Result<ServerSummary, ApiError> {
    let name = validate_name(name, "server name")?;
    let server = ctx
        .storage
        .create_server(&name, user_id)
        .await
        .map_err(internal)?;
    info!(
        server_id = server.server_id.0,
        owner_id = user_id.0,
        "created server"
    );
    Ok(server_summary(server, true))
}

pub async fn join_server(
    ctx: &ApiContext,
    user_id: UserId,
    server_id: ServerId,
) -> Result<ServerSummary, ApiError> {
    let server = ctx
        .storage
        .server_by_id(server_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("server not found"))?;
    join(ctx, user_id, server).await
}

pub async fn join_by_invite(
    ctx: &ApiContext,
    user_id: UserId,
    invite_code: &str,
) -> Result<ServerSummary, ApiError> {
    let server = ctx
        .storage
        .server_by_invite(invite_code.trim())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("invite not found"))?;
    join(ctx, user_id, server).await
}

pub async fn delete_server(
    ctx: &ApiContext,
    user_id: UserId,
    server_id: ServerId,
) -> Result<(), ApiError> {
    ensure_owner(ctx, server_id, user_id).await?;
    ctx.storage
        .delete_server(server_id)
        .await
        .map_err(internal)?;
    info!(server_id = server_id.0, "deleted server");
    Ok(())
}

pub async fn list_channels(
    ctx: &ApiContext,
    user_id: UserId,
    server_id: ServerId,
) -> Result<Vec<ChannelSummary>, ApiError> {
    ensure_membership(ctx, server_id, user_id).await?;
    let channels = ctx
        .storage
        .list_channels_for_server(server_id)
        .await
        .map_err(internal)?;
    Ok(channels.into_iter().map(channel_summary).collect())
}

pub async fn create_channel(
    ctx: &ApiContext,
    user_id: UserId,
    server_id: ServerId,
    name: &str,
) -> Result<ChannelSummary, ApiError> {
    let name = validate_name(name, "channel name")?;
    ensure_owner(ctx, server_id, user_id).await?;
    let channel = ctx
        .storage
        .create_channel(server_id, &name)
        .await
        .map_err(internal)?;
    Ok(channel_summary(channel))
}

/// Newest-first page of the channel log.
pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    limit: u32,
    before: Option<ChannelSeq>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let channel = channel_for_member(ctx, channel_id, user_id).await?;
    let messages = ctx
        .storage
        .list_channel_messages(channel.channel_id, limit.clamp(1, MAX_PAGE_LIMIT), before)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

/// A message that passed validation and the membership check but has not
/// been appended yet.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub author: UserId,
    content: String,
}

/// Validates the content and resolves the channel for a member. Nothing is
/// written; the caller appends with [`append_message`].
pub async fn prepare_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    content: &str,
) -> Result<MessageDraft, ApiError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("message content must not be empty"));
    }
    if content.len() > MAX_MESSAGE_BYTES {
        return Err(ApiError::validation(format!(
            "message content exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }
    let channel = channel_for_member(ctx, channel_id, user_id).await?;
    Ok(MessageDraft {
        server_id: channel.server_id,
        channel_id: channel.channel_id,
        author: user_id,
        content: content.to_string(),
    })
}

pub async fn append_message(ctx: &ApiContext, draft: MessageDraft) -> Result<PostedMessage, ApiError> {
    let stored = ctx
        .storage
        .insert_message(draft.channel_id, draft.author, &draft.content)
        .await
        .map_err(internal)?;
    Ok(PostedMessage {
        server_id: draft.server_id,
        message: message_payload(stored),
    })
}

pub async fn send_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    content: &str,
) -> Result<PostedMessage, ApiError> {
    let draft = prepare_message(ctx, user_id, channel_id, content).await?;
    append_message(ctx, draft).await
}

/// Resolves the requested page size: absent means `default`, anything else
/// is clamped to `1..=MAX_PAGE_LIMIT`.
pub fn page_limit(requested: Option<u32>, default: u32) -> u32 {
    requested.unwrap_or(default).clamp(1, MAX_PAGE_LIMIT)
}

pub fn message_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        channel_id: message.channel_id,
        seq: message.seq,
        sender: UserProfile {
            user_id: message.sender_id,
            username: message.sender_username,
        },
        content: message.content,
        created_at: message.created_at,
    }
}

async fn join(
    ctx: &ApiContext,
    user_id: UserId,
    server: StoredServer,
) -> Result<ServerSummary, ApiError> {
    let joined = ctx
        .storage
        .add_membership(server.server_id, user_id)
        .await
        .map_err(internal)?;
    if joined {
        info!(
            server_id = server.server_id.0,
            user_id = user_id.0,
            "user joined server"
        );
    }
    Ok(server_summary(server, true))
}

async fn ensure_membership(
    ctx: &ApiContext,
    server_id: ServerId,
    user_id: UserId,
) -> Result<(), ApiError> {
    let member = ctx
        .storage
        .is_member(server_id, user_id)
        .await
        .map_err(internal)?;
    if !member {
        return Err(ApiError::forbidden("user is not a member"));
    }
    Ok(())
}

async fn ensure_owner(
    ctx: &ApiContext,
    server_id: ServerId,
    user_id: UserId,
) -> Result<StoredServer, ApiError> {
    let server = ctx
        .storage
        .server_by_id(server_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("server not found"))?;
    if server.owner_id != user_id {
        return Err(ApiError::forbidden("only the server owner may do this"));
    }
    Ok(server)
}

async fn channel_for_member(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<StoredChannel, ApiError> {
    let channel = ctx
        .storage
        .channel_by_id(channel_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("channel not found"))?;
    ensure_membership(ctx, channel.server_id, user_id).await?;
    Ok(channel)
}

fn validate_name(raw: &str, what: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(ApiError::validation(format!(
            "{what} exceeds {MAX_NAME_BYTES} bytes"
        )));
    }
    Ok(name.to_string())
}

fn server_summary(server: StoredServer, with_invite: bool) -> ServerSummary {
    ServerSummary {
        server_id: server.server_id,
        name: server.name,
        owner_id: server.owner_id,
        invite_code: with_invite.then_some(server.invite_code),
    }
}

fn channel_summary(channel: StoredChannel) -> ChannelSummary {
    ChannelSummary {
        channel_id: channel.channel_id,
        server_id: channel.server_id,
        name: channel.name,
        position: channel.position,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
