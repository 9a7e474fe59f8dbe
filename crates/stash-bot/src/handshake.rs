//! Login handshake coordinator.
//!
//! Front-channel state machine that collects phone, one-time code, and an
//! optional second-factor password from the user, ferries them into the
//! account session task through the rendezvous slots, and awaits the task's
//! authentication outcome with a bounded timeout. Every terminal branch
//! cleans the registry and answers the user; nothing here panics or leaks
//! into the poll loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{info, warn};

use stash_account::AccountClientFactory;
use stash_core::{current_unix_timestamp_ms, record_account_id};
use stash_session::{
    rendezvous, start_account_session, MediaRelayConfig, RegisterOutcome, RendezvousFulfiller,
    SessionRegistry, SessionTaskConfig, SessionTaskError, DEFAULT_CODE_WAIT,
    DEFAULT_PASSWORD_WAIT,
};

pub const DEFAULT_COMPLETION_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

const MSG_ALREADY_ACTIVE: &str =
    "You already have an active session. Use /logout first if you want to start a new one.";
const MSG_LOGIN_IN_PROGRESS: &str =
    "A login is already in progress. Send the requested input, or /cancel to stop.";
const MSG_ASK_PHONE: &str =
    "Okay, let's log you in. Send your phone number in international format \
     (e.g., +12345678900), or /cancel to stop.";
const MSG_BAD_PHONE: &str =
    "That does not look like a valid phone number. Try again (e.g., +12345678900) or /cancel.";
const MSG_ASK_CODE: &str =
    "A login code is on its way to your account. Send it back to me once it arrives.";
const MSG_CODE_ACCEPTED: &str = "Got it, processing the code.";
const MSG_ASK_PASSWORD: &str =
    "If two-factor authentication is enabled for your account, send your password now. \
     Otherwise the login will finish on its own.";
const MSG_CODE_ALREADY_PROCESSED: &str =
    "The code was already processed. If the login fails, use /cancel and /login again.";
const MSG_FINALIZING: &str = "Finalizing the login, please wait...";
const MSG_LOGIN_TIMED_OUT: &str = "The login timed out. Try /login again or /cancel.";
const MSG_CANCELLED: &str = "Login cancelled.";
const MSG_NOTHING_TO_CANCEL: &str = "There is no login in progress to cancel.";
const MSG_IDLE_EXPIRED: &str =
    "The login was abandoned due to inactivity. Use /login to start again.";
const MSG_NOT_LOGGED_IN: &str = "You were not logged in, or your session was already inactive.";

#[derive(Debug, Clone)]
/// Handshake timeouts and storage locations.
pub struct HandshakeConfig {
    pub trigger: String,
    pub sessions_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub account_ids_file: PathBuf,
    pub code_wait: Duration,
    pub password_wait: Duration,
    pub completion_wait: Duration,
    pub idle_timeout: Duration,
    pub cancel_grace: Duration,
}

impl HandshakeConfig {
    pub fn new(trigger: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            trigger: trigger.into(),
            sessions_dir: state_dir.join("sessions"),
            downloads_dir: state_dir.join("downloads"),
            account_ids_file: state_dir.join("account-ids.txt"),
            code_wait: DEFAULT_CODE_WAIT,
            password_wait: DEFAULT_PASSWORD_WAIT,
            completion_wait: DEFAULT_COMPLETION_WAIT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginStage {
    AwaitPhone,
    AwaitCode,
    AwaitPassword,
}

/// One in-progress handshake, owned exclusively by the coordinator.
struct LoginAttempt {
    stage: LoginStage,
    code_tx: Option<RendezvousFulfiller<String>>,
    password_tx: Option<RendezvousFulfiller<String>>,
    completion: Option<oneshot::Receiver<Result<i64, SessionTaskError>>>,
    last_activity_unix_ms: u64,
}

impl LoginAttempt {
    fn new() -> Self {
        Self {
            stage: LoginStage::AwaitPhone,
            code_tx: None,
            password_tx: None,
            completion: None,
            last_activity_unix_ms: current_unix_timestamp_ms(),
        }
    }

    fn touch(&mut self) {
        self.last_activity_unix_ms = current_unix_timestamp_ms();
    }

    /// Releases both rendezvous slots with the "none" sentinel so a waiting
    /// session task unblocks and unwinds.
    fn release_rendezvous(&mut self) {
        if let Some(code_tx) = self.code_tx.take() {
            code_tx.fulfill(None);
        }
        if let Some(password_tx) = self.password_tx.take() {
            password_tx.fulfill(None);
        }
    }
}

/// Front-channel login handshake coordinator.
///
/// Methods return the reply texts to deliver to the user; the transport
/// stays at the caller's edge.
pub struct LoginCoordinator {
    config: HandshakeConfig,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn AccountClientFactory>,
    conversations: Mutex<HashMap<i64, LoginAttempt>>,
}

impl LoginCoordinator {
    pub fn new(
        config: HandshakeConfig,
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn AccountClientFactory>,
    ) -> Self {
        Self {
            config,
            registry,
            factory,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn trigger(&self) -> &str {
        &self.config.trigger
    }

    /// `/login`: opens a handshake unless one (or a live session) exists.
    pub fn handle_login(&self, user_id: i64) -> Vec<String> {
        if self.registry.is_active(user_id) {
            return vec![MSG_ALREADY_ACTIVE.to_string()];
        }
        let Ok(mut conversations) = self.conversations.lock() else {
            return vec![MSG_LOGIN_IN_PROGRESS.to_string()];
        };
        if conversations.contains_key(&user_id) {
            return vec![MSG_LOGIN_IN_PROGRESS.to_string()];
        }
        info!("user {user_id} starting login handshake");
        conversations.insert(user_id, LoginAttempt::new());
        vec![MSG_ASK_PHONE.to_string()]
    }

    /// Free-text input routed by the current handshake stage. Returns no
    /// replies when the user has no handshake in progress.
    pub async fn handle_text(&self, user_id: i64, text: &str) -> Vec<String> {
        let input = text.trim();
        let staged = {
            let Ok(mut conversations) = self.conversations.lock() else {
                return Vec::new();
            };
            let Some(attempt) = conversations.get_mut(&user_id) else {
                return Vec::new();
            };
            attempt.touch();
            match attempt.stage {
                LoginStage::AwaitPhone => {
                    return self.accept_phone(attempt, user_id, input);
                }
                LoginStage::AwaitCode => {
                    return Self::accept_code(attempt, user_id, input);
                }
                LoginStage::AwaitPassword => {
                    // The final await must not hold the conversation lock;
                    // the attempt leaves the map here and is terminal below.
                    let mut attempt = conversations.remove(&user_id).unwrap_or_else(LoginAttempt::new);
                    if let Some(password_tx) = attempt.password_tx.take() {
                        password_tx.fulfill(Some(input.to_string()));
                    }
                    attempt
                }
            }
        };
        let mut replies = vec![MSG_FINALIZING.to_string()];
        replies.extend(self.finish_login(user_id, staged).await);
        replies
    }

    fn accept_phone(&self, attempt: &mut LoginAttempt, user_id: i64, input: &str) -> Vec<String> {
        if !is_plausible_phone(input) {
            return vec![MSG_BAD_PHONE.to_string()];
        }

        let (code_tx, code_rx) = rendezvous();
        let (password_tx, password_rx) = rendezvous();

        let mut task_config = SessionTaskConfig::new(
            user_id,
            input,
            self.config.sessions_dir.clone(),
            MediaRelayConfig::new(self.config.trigger.clone(), self.config.downloads_dir.clone()),
        );
        task_config.code_wait = self.config.code_wait;
        task_config.password_wait = self.config.password_wait;

        let started =
            start_account_session(task_config, Arc::clone(&self.factory), code_rx, password_rx);
        match self.registry.register(user_id, started.handle) {
            RegisterOutcome::Accepted => {}
            RegisterOutcome::Rejected(handle) => {
                // Lost the race against a concurrent registration; unwind
                // the task we just spawned.
                handle.cancel();
                return vec![MSG_ALREADY_ACTIVE.to_string()];
            }
        }

        info!("user {user_id} submitted phone; session task registered");
        attempt.stage = LoginStage::AwaitCode;
        attempt.code_tx = Some(code_tx);
        attempt.password_tx = Some(password_tx);
        attempt.completion = Some(started.completion);
        vec![
            format!("Thank you. Attempting to log in with {input}."),
            MSG_ASK_CODE.to_string(),
        ]
    }

    fn accept_code(attempt: &mut LoginAttempt, user_id: i64, input: &str) -> Vec<String> {
        let fulfilled = attempt
            .code_tx
            .as_ref()
            .map(|code_tx| code_tx.fulfill(Some(input.to_string())))
            .unwrap_or(false);
        attempt.stage = LoginStage::AwaitPassword;
        if fulfilled {
            info!("user {user_id} submitted a login code");
            vec![MSG_CODE_ACCEPTED.to_string(), MSG_ASK_PASSWORD.to_string()]
        } else {
            vec![MSG_CODE_ALREADY_PROCESSED.to_string(), MSG_ASK_PASSWORD.to_string()]
        }
    }

    /// Awaits the session task's authentication outcome with a bounded
    /// timeout and maps it to the terminal user-facing reply.
    async fn finish_login(&self, user_id: i64, mut attempt: LoginAttempt) -> Vec<String> {
        let Some(completion) = attempt.completion.take() else {
            warn!("user {user_id} reached the final login step without a session task");
            return vec![MSG_LOGIN_TIMED_OUT.to_string()];
        };

        match tokio::time::timeout(self.config.completion_wait, completion).await {
            Ok(Ok(Ok(account_id))) => {
                if let Err(error) = record_account_id(&self.config.account_ids_file, account_id) {
                    warn!("failed to record account id {account_id}: {error}");
                }
                info!("user {user_id} logged in as account {account_id}");
                vec![format!(
                    "Login successful (account id {account_id}). I am now watching your \
                     outgoing replies for '{}'.",
                    self.config.trigger
                )]
            }
            Ok(Ok(Err(error))) => {
                self.registry.remove(user_id);
                warn!("login for user {user_id} failed: {error}");
                vec![format!("Login failed: {error}. Try /login again or /cancel.")]
            }
            Ok(Err(_)) => {
                self.registry.remove(user_id);
                warn!("login task for user {user_id} went away before reporting an outcome");
                vec![MSG_LOGIN_TIMED_OUT.to_string()]
            }
            Err(_) => {
                // Coordinator-side timeout: cancel rather than merely
                // unregister so the task cannot authenticate while
                // untracked.
                attempt.release_rendezvous();
                self.registry
                    .cancel_and_remove(user_id, self.config.cancel_grace)
                    .await;
                warn!("login for user {user_id} timed out awaiting the session task");
                vec![MSG_LOGIN_TIMED_OUT.to_string()]
            }
        }
    }

    /// `/cancel`: tears the handshake down from any non-terminal state.
    pub async fn handle_cancel(&self, user_id: i64) -> Vec<String> {
        let attempt = self
            .conversations
            .lock()
            .ok()
            .and_then(|mut conversations| conversations.remove(&user_id));
        let Some(mut attempt) = attempt else {
            return vec![MSG_NOTHING_TO_CANCEL.to_string()];
        };
        info!("user {user_id} cancelled the login handshake");
        attempt.release_rendezvous();
        self.registry
            .cancel_and_remove(user_id, self.config.cancel_grace)
            .await;
        vec![MSG_CANCELLED.to_string()]
    }

    /// `/logout`: abandons any in-progress handshake, cancels the session
    /// task, and wipes the durable credential state.
    pub async fn handle_logout(&self, user_id: i64) -> Vec<String> {
        let attempt = self
            .conversations
            .lock()
            .ok()
            .and_then(|mut conversations| conversations.remove(&user_id));
        if let Some(mut attempt) = attempt {
            attempt.release_rendezvous();
        }

        let report = self
            .registry
            .logout(user_id, self.config.cancel_grace)
            .await;
        info!(
            "user {user_id} logged out (was_registered={}, credential_removed={})",
            report.was_registered, report.credential_file_removed
        );

        if report.credential_file_error.is_some() {
            return vec![
                "Logged out, but your session file could not be removed. Please contact the \
                 administrator."
                    .to_string(),
            ];
        }
        if report.credential_file_removed {
            return vec!["You have been logged out. Your session file has been removed.".to_string()];
        }
        if report.was_registered {
            return vec!["You have been logged out (no session file found to remove).".to_string()];
        }
        vec![MSG_NOT_LOGGED_IN.to_string()]
    }

    /// Sweeps handshakes idle past the configured timeout, applying the same
    /// cleanup as `/cancel`. Returns one notice per expired user.
    pub async fn expire_idle(&self) -> Vec<(i64, String)> {
        let now = current_unix_timestamp_ms();
        let idle_ms = self.config.idle_timeout.as_millis() as u64;
        let expired = {
            let Ok(mut conversations) = self.conversations.lock() else {
                return Vec::new();
            };
            let stale_ids = conversations
                .iter()
                .filter(|(_, attempt)| {
                    now.saturating_sub(attempt.last_activity_unix_ms) >= idle_ms
                })
                .map(|(user_id, _)| *user_id)
                .collect::<Vec<_>>();
            stale_ids
                .into_iter()
                .filter_map(|user_id| {
                    conversations
                        .remove(&user_id)
                        .map(|attempt| (user_id, attempt))
                })
                .collect::<Vec<_>>()
        };

        let mut notices = Vec::new();
        for (user_id, mut attempt) in expired {
            warn!("login handshake for user {user_id} expired after inactivity");
            attempt.release_rendezvous();
            self.registry
                .cancel_and_remove(user_id, self.config.cancel_grace)
                .await;
            notices.push((user_id, MSG_IDLE_EXPIRED.to_string()));
        }
        notices
    }

    /// True when the user currently has a handshake in progress.
    pub fn has_conversation(&self, user_id: i64) -> bool {
        self.conversations
            .lock()
            .map(|conversations| conversations.contains_key(&user_id))
            .unwrap_or(false)
    }
}

/// Minimal phone-number shape check: leading `+` followed by at least
/// seven digits.
pub fn is_plausible_phone(raw: &str) -> bool {
    let Some(digits) = raw.strip_prefix('+') else {
        return false;
    };
    digits.len() >= 7 && digits.chars().all(|ch| ch.is_ascii_digit())
}
