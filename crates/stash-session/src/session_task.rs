//! The back-channel account session task.
//!
//! One spawned task per user: authenticates the account using credentials
//! ferried through the rendezvous slots, persists the credential state,
//! reports the outcome on a one-shot completion channel, then watches the
//! account's outgoing messages for the relay trigger until cancelled or
//! disconnected.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use stash_account::{
    credential_state_path, AccountClient, AccountClientFactory, AccountError, AccountIdentity,
    SignInOutcome,
};
use stash_core::write_text_atomic;

use crate::media_relay::{relay_replied_media, MediaRelayConfig};
use crate::registry::SessionHandle;
use crate::rendezvous::{RendezvousWaiter, WaitOutcome};

pub const DEFAULT_CODE_WAIT: Duration = Duration::from_secs(300);
pub const DEFAULT_PASSWORD_WAIT: Duration = Duration::from_secs(300);

/// Typed terminal failures of the session task, delivered to the
/// coordinator through the completion channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionTaskError {
    #[error("the login code was not provided in time")]
    CodeUnavailable,
    #[error("the two-factor password was not provided in time")]
    PasswordUnavailable,
    #[error("the login was cancelled")]
    Cancelled,
    #[error("failed to persist credential state: {0}")]
    CredentialPersist(String),
    #[error(transparent)]
    Account(#[from] AccountError),
}

#[derive(Debug, Clone)]
/// Inputs for one account session task.
pub struct SessionTaskConfig {
    pub user_id: i64,
    pub phone: String,
    pub sessions_dir: std::path::PathBuf,
    pub code_wait: Duration,
    pub password_wait: Duration,
    pub relay: MediaRelayConfig,
}

impl SessionTaskConfig {
    pub fn new(
        user_id: i64,
        phone: impl Into<String>,
        sessions_dir: impl Into<std::path::PathBuf>,
        relay: MediaRelayConfig,
    ) -> Self {
        Self {
            user_id,
            phone: phone.into(),
            sessions_dir: sessions_dir.into(),
            code_wait: DEFAULT_CODE_WAIT,
            password_wait: DEFAULT_PASSWORD_WAIT,
            relay,
        }
    }
}

/// A freshly spawned session task: the registry-ready handle plus the
/// one-shot channel the coordinator awaits for the authentication outcome.
pub struct StartedSession {
    pub handle: SessionHandle,
    pub completion: oneshot::Receiver<Result<i64, SessionTaskError>>,
}

/// Spawns the account session task for `config`.
///
/// The returned completion channel resolves once authentication succeeds
/// (with the account id) or fails; the task itself keeps running through
/// the watch phase after a successful resolution.
pub fn start_account_session(
    config: SessionTaskConfig,
    factory: Arc<dyn AccountClientFactory>,
    code_rx: RendezvousWaiter<String>,
    password_rx: RendezvousWaiter<String>,
) -> StartedSession {
    let (completion_tx, completion) = oneshot::channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(run_account_session(
        config,
        factory,
        code_rx,
        password_rx,
        cancel_rx,
        completion_tx,
    ));
    StartedSession {
        handle: SessionHandle::new(cancel_tx, task),
        completion,
    }
}

async fn run_account_session(
    config: SessionTaskConfig,
    factory: Arc<dyn AccountClientFactory>,
    code_rx: RendezvousWaiter<String>,
    password_rx: RendezvousWaiter<String>,
    mut cancel_rx: watch::Receiver<bool>,
    completion_tx: oneshot::Sender<Result<i64, SessionTaskError>>,
) {
    let credential_path = credential_state_path(&config.sessions_dir, config.user_id);
    match authenticate_account(
        &config,
        factory.as_ref(),
        code_rx,
        password_rx,
        &mut cancel_rx,
        &credential_path,
    )
    .await
    {
        Ok((client, identity)) => {
            info!(
                "account session for user {} authenticated as {} (trigger '{}')",
                config.user_id, identity.id, config.relay.trigger
            );
            let _ = completion_tx.send(Ok(identity.id));
            watch_outgoing(client.as_ref(), identity.id, &config.relay, &mut cancel_rx).await;
            client.disconnect().await;
            info!("account session for user {} stopped", config.user_id);
        }
        Err(error) => {
            warn!(
                "account session for user {} failed to authenticate: {error}",
                config.user_id
            );
            let _ = completion_tx.send(Err(error));
        }
    }
}

/// Connects, runs the code/password exchange, and persists credential state.
/// Every failure path disconnects before returning.
async fn authenticate_account(
    config: &SessionTaskConfig,
    factory: &dyn AccountClientFactory,
    code_rx: RendezvousWaiter<String>,
    password_rx: RendezvousWaiter<String>,
    cancel_rx: &mut watch::Receiver<bool>,
    credential_path: &Path,
) -> Result<(Arc<dyn AccountClient>, AccountIdentity), SessionTaskError> {
    let client = factory.open(credential_path).await?;
    client.connect().await?;

    let identity = match login_exchange(config, client.as_ref(), code_rx, password_rx, cancel_rx)
        .await
    {
        Ok(identity) => identity,
        Err(error) => {
            client.disconnect().await;
            return Err(error);
        }
    };

    let blob = match client.export_credentials().await {
        Ok(blob) => blob,
        Err(error) => {
            client.disconnect().await;
            return Err(error.into());
        }
    };
    if let Err(error) = write_text_atomic(credential_path, &blob) {
        client.disconnect().await;
        return Err(SessionTaskError::CredentialPersist(error.to_string()));
    }

    Ok((client, identity))
}

async fn login_exchange(
    config: &SessionTaskConfig,
    client: &dyn AccountClient,
    code_rx: RendezvousWaiter<String>,
    password_rx: RendezvousWaiter<String>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<AccountIdentity, SessionTaskError> {
    if client.is_authorized().await? {
        info!(
            "user {} already authorized from prior credential state",
            config.user_id
        );
        return Ok(client.identity().await?);
    }

    client.request_login_code(&config.phone).await?;
    info!(
        "login code requested for user {}; awaiting code rendezvous",
        config.user_id
    );

    let code = tokio::select! {
        _ = cancelled(cancel_rx) => return Err(SessionTaskError::Cancelled),
        outcome = code_rx.wait(config.code_wait) => match outcome {
            WaitOutcome::Value(code) => code,
            WaitOutcome::Declined | WaitOutcome::TimedOut => {
                return Err(SessionTaskError::CodeUnavailable);
            }
        },
    };

    match client.sign_in_with_code(&config.phone, &code).await? {
        SignInOutcome::Authenticated(identity) => Ok(identity),
        SignInOutcome::PasswordRequired => {
            info!(
                "second factor required for user {}; awaiting password rendezvous",
                config.user_id
            );
            let password = tokio::select! {
                _ = cancelled(cancel_rx) => return Err(SessionTaskError::Cancelled),
                outcome = password_rx.wait(config.password_wait) => match outcome {
                    WaitOutcome::Value(password) => password,
                    WaitOutcome::Declined | WaitOutcome::TimedOut => {
                        return Err(SessionTaskError::PasswordUnavailable);
                    }
                },
            };
            Ok(client.sign_in_with_password(&password).await?)
        }
    }
}

/// Watch phase: processes outgoing events one at a time in arrival order
/// until cancellation or stream end. Relay failures never surface here.
async fn watch_outgoing(
    client: &dyn AccountClient,
    account_id: i64,
    relay: &MediaRelayConfig,
    cancel_rx: &mut watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = cancelled(cancel_rx) => {
                info!("watch phase for account {account_id} cancelled");
                return;
            }
            event = client.next_outgoing() => event,
        };
        match event {
            Ok(Some(event)) => {
                if event.reply_to_message_id.is_none() || event.text != relay.trigger {
                    continue;
                }
                if event.sender_id != account_id {
                    warn!(
                        "account {account_id} saw trigger from unexpected sender {}; ignoring",
                        event.sender_id
                    );
                    continue;
                }
                relay_replied_media(client, account_id, &event, relay).await;
            }
            Ok(None) => {
                info!("event stream for account {account_id} closed");
                return;
            }
            Err(error) => {
                warn!("event stream for account {account_id} failed: {error}");
                return;
            }
        }
    }
}

/// Resolves when cancellation is signalled. A dropped sender counts as
/// cancellation so an abandoned handle cannot strand the task.
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    let _ = cancel_rx.wait_for(|cancel| *cancel).await;
}
