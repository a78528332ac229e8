use std::path::PathBuf;

use anyhow::{anyhow, Context};
use shared::{
    chat_line::format_timestamp,
    domain::{canonical_email, MessageId, SessionToken},
    error::{ApiError, ErrorCode},
    protocol::{
        ChangePasswordRequest, HistoryEntry, LoginRequest, LoginResponse, ProfilePicResponse,
        RegisterRequest, StatusMessage,
    },
};
use storage::{Storage, StoredMessage, StoredUser};
use tracing::{error, info, warn};

pub mod password;

use password::{hash_password, new_session_token, verify_password};

/// Where uploaded profile pictures land on disk and the URL prefix they are served under.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub dir: PathBuf,
    pub public_prefix: String,
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub uploads: UploadConfig,
}

pub async fn register(ctx: &ApiContext, req: RegisterRequest) -> Result<StatusMessage, ApiError> {
    let user_name = req.user_name.trim();
    let email = normalize_email(&req.email)?;
    if user_name.is_empty() {
        return Err(ApiError::validation("User name cannot be empty"));
    }
    if req.password.is_empty() {
        return Err(ApiError::validation("Password cannot be empty"));
    }

    if ctx
        .storage
        .user_by_email(&email)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ApiError::validation("User Already exist"));
    }

    let pass_hash = hash_password(&req.password).map_err(|e| internal(anyhow!(e)))?;
    // A concurrent sign-up can still claim the email between the lookup and the insert.
    let user_id = ctx
        .storage
        .create_user(user_name, &email, &pass_hash)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::validation("User Already exist"))?;
    info!(user_id = user_id.0, %email, "user registered");

    Ok(StatusMessage::new("User registered successfully"))
}

pub async fn login(ctx: &ApiContext, req: LoginRequest) -> Result<LoginResponse, ApiError> {
    let email = normalize_email(&req.email)?;
    let user = ctx
        .storage
        .user_by_email(&email)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::validation("User doesnot exist"))?;

    if !verify_password(&req.password, &user.pass_hash) {
        warn!(user_id = user.user_id.0, "login rejected: wrong password");
        return Err(ApiError::validation("Password Incorrect"));
    }

    let token = new_session_token();
    ctx.storage
        .create_session(&token, user.user_id)
        .await
        .map_err(internal)?;
    info!(user_id = user.user_id.0, "session opened");

    Ok(LoginResponse {
        message: "Login successful".into(),
        token: token.0,
        user_name: user.user_name,
        email: user.email,
        profile_pic: user.profile_pic,
    })
}

/// Resolves a path token to its user or fails with `Unauthorized`.
pub async fn authenticate(ctx: &ApiContext, token: &SessionToken) -> Result<StoredUser, ApiError> {
    ctx.storage
        .user_for_session(token)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::unauthorized("Invalid token"))
}

pub async fn end_session(ctx: &ApiContext, token: &SessionToken) -> Result<(), ApiError> {
    let removed = ctx.storage.delete_session(token).await.map_err(internal)?;
    if removed {
        info!("session closed");
    }
    Ok(())
}

pub async fn change_password(
    ctx: &ApiContext,
    token: &SessionToken,
    req: ChangePasswordRequest,
) -> Result<StatusMessage, ApiError> {
    let user = authenticate(ctx, token).await?;

    if !verify_password(&req.old_password, &user.pass_hash) {
        return Err(ApiError::validation("Old password incorrect"));
    }
    if req.new_password.is_empty() {
        return Err(ApiError::validation("New password cannot be empty"));
    }

    let pass_hash = hash_password(&req.new_password).map_err(|e| internal(anyhow!(e)))?;
    ctx.storage
        .update_password_hash(user.user_id, &pass_hash)
        .await
        .map_err(internal)?;
    info!(user_id = user.user_id.0, "password changed");

    Ok(StatusMessage::new("Password changed successfully"))
}

/// Stores the uploaded picture as `<user_id>.jpg`, replacing any previous one.
pub async fn store_profile_pic(
    ctx: &ApiContext,
    token: &SessionToken,
    bytes: &[u8],
) -> Result<ProfilePicResponse, ApiError> {
    let user = authenticate(ctx, token).await?;
    if bytes.is_empty() {
        return Err(ApiError::validation("Uploaded file is empty"));
    }

    let filename = format!("{}.jpg", user.user_id.0);
    let path = ctx.uploads.dir.join(&filename);
    write_upload(&ctx.uploads.dir, &path, bytes)
        .await
        .map_err(internal)?;

    let public_path = format!(
        "{}/{filename}",
        ctx.uploads.public_prefix.trim_end_matches('/')
    );
    ctx.storage
        .set_profile_pic(user.user_id, &public_path)
        .await
        .map_err(internal)?;
    info!(user_id = user.user_id.0, size_bytes = bytes.len(), "profile picture stored");

    Ok(ProfilePicResponse {
        profile_pic: Some(public_path),
    })
}

pub async fn profile_pic(
    ctx: &ApiContext,
    token: &SessionToken,
) -> Result<ProfilePicResponse, ApiError> {
    let user = authenticate(ctx, token).await?;
    Ok(ProfilePicResponse {
        profile_pic: user.profile_pic,
    })
}

/// A formatted chat line tagged with the message it was rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatBroadcast {
    pub message_id: MessageId,
    pub line: String,
}

impl ChatBroadcast {
    fn from_stored(message: &StoredMessage) -> Self {
        Self {
            message_id: message.message_id,
            line: history_entry(message).to_line(),
        }
    }
}

pub async fn history(ctx: &ApiContext, limit: Option<u32>) -> Result<Vec<HistoryEntry>, ApiError> {
    let messages = ctx.storage.list_messages(limit).await.map_err(internal)?;
    Ok(messages.iter().map(history_entry).collect())
}

/// History as socket lines, oldest first.
pub async fn replay_lines(
    ctx: &ApiContext,
    limit: Option<u32>,
) -> Result<Vec<ChatBroadcast>, ApiError> {
    let messages = ctx.storage.list_messages(limit).await.map_err(internal)?;
    Ok(messages.iter().map(ChatBroadcast::from_stored).collect())
}

/// Persists a chat message and returns the line to broadcast.
pub async fn post_message(
    ctx: &ApiContext,
    user: &StoredUser,
    text: &str,
) -> Result<ChatBroadcast, ApiError> {
    let stored = ctx
        .storage
        .insert_message(user.user_id, text)
        .await
        .map_err(internal)?;
    Ok(ChatBroadcast::from_stored(&stored))
}

fn history_entry(message: &StoredMessage) -> HistoryEntry {
    HistoryEntry {
        user_name: message.user_name.clone(),
        message: message.body.clone(),
        timestamp: format_timestamp(message.created_at),
    }
}

fn normalize_email(raw: &str) -> Result<String, ApiError> {
    let email = canonical_email(raw);
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(ApiError::new(ErrorCode::Validation, "Invalid email address")),
    }
}

async fn write_upload(dir: &std::path::Path, path: &std::path::Path, bytes: &[u8]) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create upload dir '{}'", dir.display()))?;
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("failed to write upload '{}'", path.display()))?;
    Ok(())
}

/// Logs the full error chain; callers only see a generic detail.
fn internal(err: anyhow::Error) -> ApiError {
    error!(error = ?err, "internal error");
    ApiError::internal("Internal server error")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (ApiContext, tempfile::TempDir) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let uploads = tempfile::tempdir().expect("upload dir");
        let ctx = ApiContext {
            storage,
            uploads: UploadConfig {
                dir: uploads.path().join("uploads"),
                public_prefix: "/static/uploads".into(),
            },
        };
        (ctx, uploads)
    }

    fn registration(user_name: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            user_name: user_name.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    async fn registered_login(ctx: &ApiContext) -> LoginResponse {
        register(ctx, registration("alice", "alice@example.com", "pw"))
            .await
            .expect("register");
        login(
            ctx,
            LoginRequest {
                email: "alice@example.com".into(),
                password: "pw".into(),
            },
        )
        .await
        .expect("login")
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (ctx, _dir) = setup().await;
        register(&ctx, registration("alice", "alice@example.com", "pw"))
            .await
            .expect("first");
        let err = register(&ctx, registration("other", "Alice@Example.com", "pw"))
            .await
            .expect_err("duplicate");
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.detail, "User Already exist");
    }

    #[tokio::test]
    async fn invalid_email_is_rejected() {
        let (ctx, _dir) = setup().await;
        let err = register(&ctx, registration("alice", "not-an-email", "pw"))
            .await
            .expect_err("invalid");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn login_reports_unknown_user_and_wrong_password() {
        let (ctx, _dir) = setup().await;
        let err = login(
            &ctx,
            LoginRequest {
                email: "ghost@example.com".into(),
                password: "pw".into(),
            },
        )
        .await
        .expect_err("unknown");
        assert_eq!(err.detail, "User doesnot exist");

        register(&ctx, registration("alice", "alice@example.com", "pw"))
            .await
            .expect("register");
        let err = login(
            &ctx,
            LoginRequest {
                email: "alice@example.com".into(),
                password: "nope".into(),
            },
        )
        .await
        .expect_err("wrong password");
        assert_eq!(err.detail, "Password Incorrect");
    }

    #[tokio::test]
    async fn login_issues_a_usable_session() {
        let (ctx, _dir) = setup().await;
        let session = registered_login(&ctx).await;
        assert_eq!(session.user_name, "alice");
        assert_eq!(session.email, "alice@example.com");
        assert!(session.profile_pic.is_none());

        let user = authenticate(&ctx, &SessionToken(session.token.clone()))
            .await
            .expect("authenticated");
        assert_eq!(user.user_name, "alice");

        end_session(&ctx, &SessionToken(session.token.clone()))
            .await
            .expect("end");
        let err = authenticate(&ctx, &SessionToken(session.token))
            .await
            .expect_err("ended");
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn change_password_requires_old_password() {
        let (ctx, _dir) = setup().await;
        let session = registered_login(&ctx).await;
        let token = SessionToken(session.token);

        let err = change_password(
            &ctx,
            &token,
            ChangePasswordRequest {
                old_password: "wrong".into(),
                new_password: "next".into(),
            },
        )
        .await
        .expect_err("old password mismatch");
        assert_eq!(err.detail, "Old password incorrect");

        change_password(
            &ctx,
            &token,
            ChangePasswordRequest {
                old_password: "pw".into(),
                new_password: "next".into(),
            },
        )
        .await
        .expect("changed");

        login(
            &ctx,
            LoginRequest {
                email: "alice@example.com".into(),
                password: "next".into(),
            },
        )
        .await
        .expect("login with new password");
    }

    #[tokio::test]
    async fn profile_pic_is_written_and_remembered() {
        let (ctx, _dir) = setup().await;
        let session = registered_login(&ctx).await;
        let token = SessionToken(session.token);

        let stored = store_profile_pic(&ctx, &token, b"jpeg-bytes")
            .await
            .expect("upload");
        let url = stored.profile_pic.expect("url");
        assert!(url.starts_with("/static/uploads/"));
        assert!(url.ends_with(".jpg"));

        let filename = url.rsplit('/').next().expect("filename");
        let on_disk = std::fs::read(ctx.uploads.dir.join(filename)).expect("file on disk");
        assert_eq!(on_disk, b"jpeg-bytes");

        let fetched = profile_pic(&ctx, &token).await.expect("fetch");
        assert_eq!(fetched.profile_pic.as_deref(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn profile_pic_requires_a_valid_token() {
        let (ctx, _dir) = setup().await;
        let err = store_profile_pic(&ctx, &SessionToken("bogus".into()), b"x")
            .await
            .expect_err("bad token");
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(err.detail, "Invalid token");
    }

    #[tokio::test]
    async fn posted_messages_show_up_in_history() {
        let (ctx, _dir) = setup().await;
        let session = registered_login(&ctx).await;
        let user = authenticate(&ctx, &SessionToken(session.token))
            .await
            .expect("user");

        let posted = post_message(&ctx, &user, "hello: world")
            .await
            .expect("post");
        assert!(posted.line.starts_with('['));
        assert!(posted.line.ends_with("] alice: hello: world"));

        let entries = history(&ctx, None).await.expect("history");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_name, "alice");
        assert_eq!(entries[0].message, "hello: world");
        assert_eq!(entries[0].to_line(), posted.line);

        let replay = replay_lines(&ctx, None).await.expect("replay");
        assert_eq!(replay, vec![posted]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_signups_for_one_email_admit_exactly_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let database_url = format!(
            "sqlite://{}",
            dir.path().join("chat.db").to_string_lossy().replace('\\', "/")
        );
        let ctx = ApiContext {
            storage: Storage::new(&database_url).await.expect("db"),
            uploads: UploadConfig {
                dir: dir.path().join("uploads"),
                public_prefix: "/static/uploads".into(),
            },
        };

        let attempts: Vec<_> = (0..2)
            .map(|n| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    register(&ctx, registration(&format!("dup{n}"), "dup@example.com", "pw")).await
                })
            })
            .collect();
        let mut outcomes = Vec::new();
        for attempt in attempts {
            outcomes.push(attempt.await.expect("join"));
        }

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let err = outcomes
            .into_iter()
            .find_map(Result::err)
            .expect("one attempt loses");
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.detail, "User Already exist");
    }

    #[test]
    fn internal_errors_hide_their_cause() {
        let err = internal(anyhow!("failed to write upload '/srv/secret/1.jpg'"));
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.detail, "Internal server error");
    }

    #[tokio::test]
    async fn empty_profile_pic_upload_is_rejected() {
        let (ctx, _dir) = setup().await;
        let session = registered_login(&ctx).await;
        let err = store_profile_pic(&ctx, &SessionToken(session.token), b"")
            .await
            .expect_err("empty");
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.detail, "Uploaded file is empty");
    }
}
