//! Telegram Bot API bridge for the stash login handshake and session
//! supervision engine.
//!
//! The bridge long-polls `getUpdates`, routes each private-chat command or
//! free-text message through the [`LoginCoordinator`], and delivers the
//! coordinator's replies back through `sendMessage`. Each update is handled
//! on its own task so a slow login finalization never stalls the poll loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stash_account::AccountClientFactory;
use stash_session::SessionRegistry;

mod bot_api_client;
mod bot_helpers;
mod handshake;


pub use handshake::{
    is_plausible_phone, HandshakeConfig, LoginCoordinator, DEFAULT_CANCEL_GRACE,
    DEFAULT_COMPLETION_WAIT, DEFAULT_IDLE_TIMEOUT,
};

use bot_api_client::{BotUpdate, TelegramApiClient};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_TRIGGER: &str = ".d";
pub const DEFAULT_POLL_TIMEOUT_S: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Installs the process-wide tracing subscriber. `RUST_LOG` overrides the
/// WARN default.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[derive(Clone)]
/// Runtime configuration for the bot bridge transport loop.
pub struct BotBridgeRuntimeConfig {
    pub account_client_factory: Arc<dyn AccountClientFactory>,
    pub bot_token: String,
    pub api_base: String,
    pub state_dir: PathBuf,
    pub trigger: String,
    pub poll_timeout_s: u64,
    pub request_timeout_ms: u64,
    pub reconnect_delay: Duration,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub idle_sweep_interval: Duration,
    pub code_wait: Duration,
    pub password_wait: Duration,
    pub completion_wait: Duration,
    pub idle_timeout: Duration,
    pub cancel_grace: Duration,
}

impl BotBridgeRuntimeConfig {
    pub fn new(
        account_client_factory: Arc<dyn AccountClientFactory>,
        bot_token: impl Into<String>,
        state_dir: impl Into<PathBuf>,
        trigger: impl Into<String>,
    ) -> Self {
        Self {
            account_client_factory,
            bot_token: bot_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            state_dir: state_dir.into(),
            trigger: trigger.into(),
            poll_timeout_s: DEFAULT_POLL_TIMEOUT_S,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            idle_sweep_interval: DEFAULT_IDLE_SWEEP_INTERVAL,
            code_wait: stash_session::DEFAULT_CODE_WAIT,
            password_wait: stash_session::DEFAULT_PASSWORD_WAIT,
            completion_wait: DEFAULT_COMPLETION_WAIT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bot_token.trim().is_empty() {
            bail!("bot token must not be empty");
        }
        if self.trigger.trim().is_empty() {
            bail!("trigger phrase must not be empty");
        }
        if self.api_base.trim().is_empty() {
            bail!("bot api base url must not be empty");
        }
        if self.poll_timeout_s == 0 {
            bail!("poll timeout must be at least one second");
        }
        Ok(())
    }
}

/// Runs the bot bridge transport loop until interrupted.
pub async fn run_bot_bridge(config: BotBridgeRuntimeConfig) -> Result<()> {
    let mut runtime = BotBridgeRuntime::new(config)?;
    runtime.run().await
}

struct BotBridgeRuntime {
    client: TelegramApiClient,
    coordinator: Arc<LoginCoordinator>,
    poll_timeout_s: u64,
    reconnect_delay: Duration,
    idle_sweep_interval: Duration,
    next_offset: i64,
}

impl BotBridgeRuntime {
    fn new(config: BotBridgeRuntimeConfig) -> Result<Self> {
        config.validate()?;

        let mut handshake = HandshakeConfig::new(config.trigger.clone(), config.state_dir.clone());
        handshake.code_wait = config.code_wait;
        handshake.password_wait = config.password_wait;
        handshake.completion_wait = config.completion_wait;
        handshake.idle_timeout = config.idle_timeout;
        handshake.cancel_grace = config.cancel_grace;

        for dir in [
            &config.state_dir,
            &handshake.sessions_dir,
            &handshake.downloads_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let client = TelegramApiClient::new(
            config.api_base.clone(),
            config.bot_token.clone(),
            config.request_timeout_ms,
            config.retry_max_attempts,
            config.retry_base_delay_ms,
        )?;

        let registry = Arc::new(SessionRegistry::new(handshake.sessions_dir.clone()));
        let coordinator = Arc::new(LoginCoordinator::new(
            handshake,
            registry,
            Arc::clone(&config.account_client_factory),
        ));

        Ok(Self {
            client,
            coordinator,
            poll_timeout_s: config.poll_timeout_s,
            reconnect_delay: config.reconnect_delay,
            idle_sweep_interval: config.idle_sweep_interval,
            next_offset: 0,
        })
    }

    async fn run(&mut self) -> Result<()> {
        let profile = self
            .client
            .get_me()
            .await
            .context("bot token validation failed")?;
        info!(
            "bot bridge connected as id {} ({})",
            profile.id,
            profile.username.as_deref().unwrap_or("unnamed")
        );

        let mut last_sweep = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("bot bridge shutdown requested");
                    return Ok(());
                }
                updates = self.client.get_updates(self.next_offset, self.poll_timeout_s) => {
                    match updates {
                        Ok(updates) => {
                            for update in updates {
                                self.next_offset = self.next_offset.max(update.update_id + 1);
                                self.dispatch_update(update);
                            }
                        }
                        Err(error) => {
                            warn!("bot bridge poll failed: {error:#}");
                            tokio::select! {
                                _ = tokio::signal::ctrl_c() => {
                                    info!("bot bridge shutdown requested");
                                    return Ok(());
                                }
                                _ = tokio::time::sleep(self.reconnect_delay) => {}
                            }
                        }
                    }
                }
            }

            if last_sweep.elapsed() >= self.idle_sweep_interval {
                last_sweep = Instant::now();
                self.sweep_idle_conversations();
            }
        }
    }

    /// Handles one update on a dedicated task so the final login await
    /// never blocks the poll loop.
    fn dispatch_update(&self, update: BotUpdate) {
        let Some(message) = update.message else {
            return;
        };
        let Some(text) = message.text.clone() else {
            return;
        };
        let user_id = message
            .from
            .as_ref()
            .map(|sender| sender.id)
            .unwrap_or(message.chat.id);
        // Group chats are out of scope for the login conversation.
        if message.chat.id != user_id {
            return;
        }
        let chat_id = message.chat.id;

        let client = self.client.clone();
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            let replies = route_message(&coordinator, user_id, &text).await;
            for reply in replies {
                if let Err(error) = client.send_message(chat_id, &reply).await {
                    warn!("failed to send reply to chat {chat_id}: {error:#}");
                }
            }
        });
    }

    fn sweep_idle_conversations(&self) {
        let client = self.client.clone();
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            for (user_id, notice) in coordinator.expire_idle().await {
                if let Err(error) = client.send_message(user_id, &notice).await {
                    warn!("failed to notify user {user_id} of expired login: {error:#}");
                }
            }
        });
    }
}

/// Routes a private-chat message to the coordinator and returns the
/// replies to deliver.
async fn route_message(
    coordinator: &LoginCoordinator,
    user_id: i64,
    text: &str,
) -> Vec<String> {
    match command_of(text) {
        Some("start") => vec![render_greeting(coordinator.trigger())],
        Some("help") => vec![render_help(coordinator.trigger())],
        Some("login") => coordinator.handle_login(user_id),
        Some("cancel") => coordinator.handle_cancel(user_id).await,
        Some("logout") => coordinator.handle_logout(user_id).await,
        Some(_) => vec!["Unknown command. Send /help for the list of commands.".to_string()],
        None => coordinator.handle_text(user_id, text).await,
    }
}

/// Extracts the bare command name from `/command` or `/command@BotName`.
fn command_of(text: &str) -> Option<&str> {
    let first = text.trim().split_whitespace().next()?;
    let command = first.strip_prefix('/')?;
    let command = command.split('@').next().unwrap_or(command);
    if command.is_empty() {
        None
    } else {
        Some(command)
    }
}

fn render_greeting(trigger: &str) -> String {
    format!(
        "Hello! I can archive media from your own account.\n\
         Use /login to connect your account. Once logged in, reply to any \
         message containing media with '{trigger}' and I will save a copy \
         to your private archive.\n\
         Send /help for the full command list."
    )
}

fn render_help(trigger: &str) -> String {
    format!(
        "Commands:\n\
         /login - connect your account\n\
         /cancel - abort a login in progress\n\
         /logout - disconnect and delete your stored session\n\
         /help - show this message\n\n\
         While logged in, reply '{trigger}' to a media message from your \
         own account to archive it."
    )
}
