//! Protocol dispatcher: one decoded envelope in, one reply envelope out.
//!
//! Every failure is a typed reply `{success:false, code, message}` with a
//! display-safe message; nothing here panics or leaks backend errors across
//! the wire. Side effects on the connection (binding a user after login,
//! unbinding after logout) are returned as an [`AuthEffect`] for the client
//! handler to apply; the dispatcher itself holds no reference back into the
//! acceptor.

use std::sync::Arc;

use {
    async_trait::async_trait,
    tracing::{debug, error, info, warn},
};

use {
    roost_auth::{
        CodeType, IssueError, Mailer, RegisterRequest, RegistrationService,
        VerificationCodeManager, validate_email, verify_password,
    },
    roost_cache::CacheManager,
    roost_config::SharedConfig,
    roost_protocol::{Envelope, actions, reply_err, reply_ok},
    roost_sessions::{SessionError, SessionManager},
    roost_storage::{UserStatus, UserStore},
};

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod codes {
    pub const UNKNOWN_ACTION: &str = "UnknownAction";
    pub const INVALID_PAYLOAD: &str = "InvalidPayload";
    pub const AUTHENTICATION_FAILED: &str = "AuthenticationFailed";
    pub const ACCOUNT_DISABLED: &str = "AccountDisabled";
    pub const SESSION_LIMIT_EXCEEDED: &str = "SessionLimitExceeded";
    pub const SESSION_ERROR: &str = "SessionError";
    pub const RATE_LIMITED: &str = "RateLimited";
    pub const EMAIL_FORMAT_INVALID: &str = "EmailFormatInvalid";
    pub const SEND_FAILED: &str = "SendFailed";
    pub const DATABASE_ERROR: &str = "DatabaseError";
}

/// Connection-level side effect of a handled request.
#[derive(Debug, Clone)]
pub enum AuthEffect {
    LoggedIn { user_id: String },
    LoggedOut,
}

pub struct HandlerOutcome {
    pub reply: serde_json::Value,
    pub effect: Option<AuthEffect>,
}

impl HandlerOutcome {
    fn reply(reply: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            reply: serde_json::Value::Object(reply),
            effect: None,
        }
    }

    fn with_effect(reply: serde_json::Map<String, serde_json::Value>, effect: AuthEffect) -> Self {
        Self {
            reply: serde_json::Value::Object(reply),
            effect: Some(effect),
        }
    }
}

/// The dispatcher seam between the connection layer and the services. The
/// production implementation is [`ProtocolHandler`]; tests drive the wire
/// layer with stubs.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn handle(&self, envelope: &Envelope, client_id: &str, peer_ip: &str) -> HandlerOutcome;
}

pub struct ProtocolHandler {
    config: SharedConfig,
    users: UserStore,
    sessions: Arc<SessionManager>,
    registration: Arc<RegistrationService>,
    codes_manager: Arc<VerificationCodeManager>,
    cache: Arc<CacheManager>,
    mailer: Arc<dyn Mailer>,
}

impl ProtocolHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SharedConfig,
        users: UserStore,
        sessions: Arc<SessionManager>,
        registration: Arc<RegistrationService>,
        codes_manager: Arc<VerificationCodeManager>,
        cache: Arc<CacheManager>,
        mailer: Arc<dyn Mailer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            users,
            sessions,
            registration,
            codes_manager,
            cache,
            mailer,
        })
    }

    /// Dispatch one envelope. Never fails; every path produces a reply.
    async fn dispatch(
        &self,
        envelope: &Envelope,
        client_id: &str,
        peer_ip: &str,
    ) -> HandlerOutcome {
        let request_id = envelope.request_id.as_deref();
        debug!(action = %envelope.action, client_id, "dispatching request");

        match envelope.action.as_str() {
            actions::LOGIN => self.handle_login(envelope, client_id, peer_ip).await,
            actions::REGISTER => self.handle_register(envelope).await,
            actions::SEND_VERIFICATION_CODE => {
                self.handle_send_verification_code(envelope, peer_ip).await
            },
            actions::CHECK_USERNAME => self.handle_check_username(envelope).await,
            actions::CHECK_EMAIL => self.handle_check_email(envelope).await,
            actions::LOGOUT => self.handle_logout(envelope).await,
            other => {
                warn!(action = %other, client_id, "unknown action");
                HandlerOutcome::reply(reply_err(
                    actions::ERROR,
                    request_id,
                    codes::UNKNOWN_ACTION,
                    "Unknown action",
                ))
            },
        }
    }

    // ── login ────────────────────────────────────────────────────────────


    async fn handle_login(
        &self,
        envelope: &Envelope,
        client_id: &str,
        peer_ip: &str,
    ) -> HandlerOutcome {
        let request_id = envelope.request_id.as_deref();
        let (Some(username), Some(password)) =
            (envelope.str_field("username"), envelope.str_field("password"))
        else {
            return HandlerOutcome::reply(reply_err(
                actions::LOGIN,
                request_id,
                codes::INVALID_PAYLOAD,
                "Username and password are required",
            ));
        };
        let device_id = envelope.str_field("device_id").unwrap_or("unknown");
        let remember_me = envelope.bool_field("remember_me").unwrap_or(false);

        let user = match self.users.find_by_username(username).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(username, "login for unknown username");
                return HandlerOutcome::reply(reply_err(
                    actions::LOGIN,
                    request_id,
                    codes::AUTHENTICATION_FAILED,
                    "Invalid username or password",
                ));
            },
            Err(e) => {
                error!(error = %e, "user lookup failed");
                return HandlerOutcome::reply(reply_err(
                    actions::LOGIN,
                    request_id,
                    codes::DATABASE_ERROR,
                    "Login is temporarily unavailable",
                ));
            },
        };

        match user.status() {
            UserStatus::Active => {},
            UserStatus::Banned | UserStatus::Deleted | UserStatus::Inactive => {
                self.users.record_login(&user.user_id, peer_ip, false).await;
                return HandlerOutcome::reply(reply_err(
                    actions::LOGIN,
                    request_id,
                    codes::ACCOUNT_DISABLED,
                    "Account is not available",
                ));
            },
        }

        if !verify_password(password, &user.password_hash) {
            self.users.record_login(&user.user_id, peer_ip, false).await;
            return HandlerOutcome::reply(reply_err(
                actions::LOGIN,
                request_id,
                codes::AUTHENTICATION_FAILED,
                "Invalid username or password",
            ));
        }

        let session_token = match self
            .sessions
            .create(&user.user_id, device_id, client_id, peer_ip, remember_me)
            .await
        {
            Ok(token) => token,
            Err(SessionError::LimitExceeded) => {
                return HandlerOutcome::reply(reply_err(
                    actions::LOGIN,
                    request_id,
                    codes::SESSION_LIMIT_EXCEEDED,
                    "Too many active sessions",
                ));
            },
            Err(e) => {
                error!(error = %e, "session creation failed");
                return HandlerOutcome::reply(reply_err(
                    actions::LOGIN,
                    request_id,
                    codes::SESSION_ERROR,
                    "Login is temporarily unavailable",
                ));
            },
        };

        if let Err(e) = self.users.update_last_login(&user.user_id).await {
            warn!(error = %e, "failed to update last login");
        }
        self.users.record_login(&user.user_id, peer_ip, true).await;
        self.cache.cache_user_info(&user.username, user.public_data());

        info!(user_id = %user.user_id, username, "user logged in");
        let mut reply = reply_ok(actions::LOGIN, request_id);
        reply.insert("session_token".into(), session_token.into());
        reply.insert("user_data".into(), user.public_data());
        reply.insert("timestamp".into(), roost_common::epoch_secs().into());
        HandlerOutcome::with_effect(
            reply,
            AuthEffect::LoggedIn {
                user_id: user.user_id,
            },
        )
    }

    // ── register ─────────────────────────────────────────────────────────

    async fn handle_register(&self, envelope: &Envelope) -> HandlerOutcome {
        let request_id = envelope.request_id.as_deref();
        let request = RegisterRequest {
            username: envelope.str_field("username").unwrap_or_default().to_string(),
            email: envelope.str_field("email").unwrap_or_default().to_string(),
            password: envelope.str_field("password").unwrap_or_default().to_string(),
            verification_code: envelope
                .str_field("verification_code")
                .unwrap_or_default()
                .to_string(),
        };

        match self.registration.register(&request).await {
            Ok(registered) => {
                let mut reply = reply_ok(actions::REGISTER, request_id);
                reply.insert("user_id".into(), registered.user_id.into());
                reply.insert("user_data".into(), registered.user_data);
                HandlerOutcome::reply(reply)
            },
            Err(e) => HandlerOutcome::reply(reply_err(
                actions::REGISTER,
                request_id,
                e.code(),
                e.message(),
            )),
        }
    }

    // ── send_verification_code ───────────────────────────────────────────

    async fn handle_send_verification_code(
        &self,
        envelope: &Envelope,
        peer_ip: &str,
    ) -> HandlerOutcome {
        let request_id = envelope.request_id.as_deref();
        let Some(email) = envelope.str_field("email") else {
            return HandlerOutcome::reply(reply_err(
                actions::SEND_VERIFICATION_CODE,
                request_id,
                codes::INVALID_PAYLOAD,
                "Email is required",
            ));
        };
        if !validate_email(email) {
            return HandlerOutcome::reply(reply_err(
                actions::SEND_VERIFICATION_CODE,
                request_id,
                codes::EMAIL_FORMAT_INVALID,
                "Email address is not valid",
            ));
        }

        let issued = match self
            .codes_manager
            .issue(email, CodeType::Registration, peer_ip)
            .await
        {
            Ok(issued) => issued,
            Err(IssueError::RateLimited {
                remaining_seconds, ..
            }) => {
                let mut reply = reply_err(
                    actions::SEND_VERIFICATION_CODE,
                    request_id,
                    codes::RATE_LIMITED,
                    "Please wait before requesting another code",
                );
                reply.insert("remaining_seconds".into(), remaining_seconds.into());
                return HandlerOutcome::reply(reply);
            },
            Err(e) => {
                error!(error = %e, "code issue failed");
                return HandlerOutcome::reply(reply_err(
                    actions::SEND_VERIFICATION_CODE,
                    request_id,
                    codes::DATABASE_ERROR,
                    "Could not issue a verification code",
                ));
            },
        };

        let smtp_timeout =
            std::time::Duration::from_secs(self.config.get().smtp.timeout.max(1));
        let body = format!(
            "Your verification code is {}. It expires in {} minutes.",
            issued.code,
            issued.expires_in.as_secs() / 60
        );
        let sent = tokio::time::timeout(
            smtp_timeout,
            self.mailer.send(email, "Your verification code", &body),
        )
        .await;

        match sent {
            Ok(Ok(())) => {
                let mut reply = reply_ok(actions::SEND_VERIFICATION_CODE, request_id);
                reply.insert(
                    "expires_in".into(),
                    (issued.expires_in.as_secs()).into(),
                );
                HandlerOutcome::reply(reply)
            },
            Ok(Err(e)) => {
                error!(error = %e, "mail dispatch failed");
                HandlerOutcome::reply(reply_err(
                    actions::SEND_VERIFICATION_CODE,
                    request_id,
                    codes::SEND_FAILED,
                    "Could not send the verification code",
                ))
            },
            Err(_) => {
                error!("mail dispatch timed out");
                HandlerOutcome::reply(reply_err(
                    actions::SEND_VERIFICATION_CODE,
                    request_id,
                    codes::SEND_FAILED,
                    "Could not send the verification code",
                ))
            },
        }
    }

    // ── availability checks ──────────────────────────────────────────────

    async fn handle_check_username(&self, envelope: &Envelope) -> HandlerOutcome {
        let request_id = envelope.request_id.as_deref();
        let Some(username) = envelope.str_field("username") else {
            return HandlerOutcome::reply(reply_err(
                actions::CHECK_USERNAME,
                request_id,
                codes::INVALID_PAYLOAD,
                "Username is required",
            ));
        };

        // Hot-key accounting is the only side effect of a check.
        self.cache
            .record_access(roost_cache::USER_INFO_TYPE, username)
            .await;

        match self.users.username_exists(username).await {
            Ok(exists) => {
                let mut reply = reply_ok(actions::CHECK_USERNAME, request_id);
                reply.insert("available".into(), (!exists).into());
                HandlerOutcome::reply(reply)
            },
            Err(e) => {
                error!(error = %e, "username check failed");
                HandlerOutcome::reply(reply_err(
                    actions::CHECK_USERNAME,
                    request_id,
                    codes::DATABASE_ERROR,
                    "Availability check failed",
                ))
            },
        }
    }

    async fn handle_check_email(&self, envelope: &Envelope) -> HandlerOutcome {
        let request_id = envelope.request_id.as_deref();
        let Some(email) = envelope.str_field("email") else {
            return HandlerOutcome::reply(reply_err(
                actions::CHECK_EMAIL,
                request_id,
                codes::INVALID_PAYLOAD,
                "Email is required",
            ));
        };

        self.cache.record_access("user_email", email).await;

        match self.users.email_exists(email).await {
            Ok(exists) => {
                let mut reply = reply_ok(actions::CHECK_EMAIL, request_id);
                reply.insert("available".into(), (!exists).into());
                HandlerOutcome::reply(reply)
            },
            Err(e) => {
                error!(error = %e, "email check failed");
                HandlerOutcome::reply(reply_err(
                    actions::CHECK_EMAIL,
                    request_id,
                    codes::DATABASE_ERROR,
                    "Availability check failed",
                ))
            },
        }
    }

    // ── logout ───────────────────────────────────────────────────────────

    async fn handle_logout(&self, envelope: &Envelope) -> HandlerOutcome {
        let request_id = envelope.request_id.as_deref();
        if let Some(token) = envelope.str_field("session_token") {
            match self.sessions.destroy(token).await {
                Ok(_) => {},
                Err(e) => warn!(error = %e, "session destroy failed during logout"),
            }
        }
        let reply = reply_ok(actions::LOGOUT, request_id);
        HandlerOutcome::with_effect(reply, AuthEffect::LoggedOut)
    }
}

#[async_trait]
impl Dispatch for ProtocolHandler {
    async fn handle(&self, envelope: &Envelope, client_id: &str, peer_ip: &str) -> HandlerOutcome {
        self.dispatch(envelope, client_id, peer_ip).await
    }
}
