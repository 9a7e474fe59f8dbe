//! Tests for the rendezvous primitive, session task, registry, and relay.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::{watch, Mutex as AsyncMutex};

use stash_account::{
    credential_state_path, AccountClient, AccountClientFactory, AccountError, AccountIdentity,
    FetchedMessage, OutgoingEvent, PostedStatus, SenderProfile, SignInOutcome,
};

use crate::media_relay::relay_replied_media;
use crate::registry::SessionHandle;
use crate::{
    rendezvous, start_account_session, MediaRelayConfig, SessionRegistry, SessionTaskConfig,
    SessionTaskError, WaitOutcome,
};

const ACCOUNT_ID: i64 = 77700011;

fn test_identity() -> AccountIdentity {
    AccountIdentity {
        id: ACCOUNT_ID,
        first_name: "Test".to_string(),
        last_name: None,
        username: Some("tester".to_string()),
    }
}

struct ScriptedAccountClient {
    authorized: bool,
    password_required: bool,
    sign_in_code_error: Option<AccountError>,
    sign_in_password_error: Option<AccountError>,
    identity: AccountIdentity,
    keep_stream_open: bool,
    events: AsyncMutex<VecDeque<OutgoingEvent>>,
    fetch_result: Option<FetchedMessage>,
    download_error: Option<AccountError>,
    forward_error: Option<AccountError>,
    calls: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
}

impl ScriptedAccountClient {
    fn unauthorized() -> Self {
        Self {
            authorized: false,
            password_required: false,
            sign_in_code_error: None,
            sign_in_password_error: None,
            identity: test_identity(),
            keep_stream_open: true,
            events: AsyncMutex::new(VecDeque::new()),
            fetch_result: None,
            download_error: None,
            forward_error: None,
            calls: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        }
    }

    fn authorized() -> Self {
        Self {
            authorized: true,
            ..Self::unauthorized()
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls lock").push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn has_call(&self, prefix: &str) -> bool {
        self.calls().iter().any(|call| call.starts_with(prefix))
    }
}

#[async_trait]
impl AccountClient for ScriptedAccountClient {
    async fn connect(&self) -> Result<(), AccountError> {
        self.record("connect");
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool, AccountError> {
        Ok(self.authorized)
    }

    async fn request_login_code(&self, phone: &str) -> Result<(), AccountError> {
        self.record(format!("request_code:{phone}"));
        Ok(())
    }

    async fn sign_in_with_code(
        &self,
        _phone: &str,
        code: &str,
    ) -> Result<SignInOutcome, AccountError> {
        self.record(format!("sign_in_code:{code}"));
        if let Some(error) = self.sign_in_code_error.clone() {
            return Err(error);
        }
        if self.password_required {
            return Ok(SignInOutcome::PasswordRequired);
        }
        Ok(SignInOutcome::Authenticated(self.identity.clone()))
    }

    async fn sign_in_with_password(
        &self,
        _password: &str,
    ) -> Result<AccountIdentity, AccountError> {
        self.record("sign_in_password");
        if let Some(error) = self.sign_in_password_error.clone() {
            return Err(error);
        }
        Ok(self.identity.clone())
    }

    async fn identity(&self) -> Result<AccountIdentity, AccountError> {
        Ok(self.identity.clone())
    }

    async fn export_credentials(&self) -> Result<String, AccountError> {
        self.record("export");
        Ok(format!("credential-blob:{}", self.identity.id))
    }

    async fn next_outgoing(&self) -> Result<Option<OutgoingEvent>, AccountError> {
        if let Some(event) = self.events.lock().await.pop_front() {
            return Ok(Some(event));
        }
        if self.keep_stream_open {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }

    async fn fetch_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<FetchedMessage>, AccountError> {
        self.record(format!("fetch:{chat_id}:{message_id}"));
        Ok(self.fetch_result.clone())
    }

    async fn resolve_sender(
        &self,
        _message: &FetchedMessage,
    ) -> Result<Option<SenderProfile>, AccountError> {
        Ok(Some(SenderProfile {
            id: 5,
            first_name: "Alice".to_string(),
            last_name: Some("Smith".to_string()),
        }))
    }

    async fn download_media(
        &self,
        _message: &FetchedMessage,
        dest_dir: &Path,
    ) -> Result<PathBuf, AccountError> {
        self.record("download");
        if let Some(error) = self.download_error.clone() {
            return Err(error);
        }
        let path = dest_dir.join("media.bin");
        std::fs::write(&path, b"payload").expect("write scratch file");
        Ok(path)
    }

    async fn send_file_to_self(&self, path: &Path, caption: &str) -> Result<(), AccountError> {
        self.record(format!("forward:{caption}"));
        assert!(path.exists(), "forwarded file must exist during forward");
        if let Some(error) = self.forward_error.clone() {
            return Err(error);
        }
        Ok(())
    }

    async fn post_status(
        &self,
        chat_id: i64,
        reply_to: i64,
        text: &str,
    ) -> Result<PostedStatus, AccountError> {
        self.record(format!("post:{text}"));
        let _ = reply_to;
        Ok(PostedStatus {
            chat_id,
            message_id: 900,
        })
    }

    async fn edit_status(&self, _status: &PostedStatus, text: &str) -> Result<(), AccountError> {
        self.record(format!("edit:{text}"));
        Ok(())
    }

    async fn delete_status(&self, _status: &PostedStatus) -> Result<(), AccountError> {
        self.record("delete_status");
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedFactory {
    client: Arc<ScriptedAccountClient>,
}

#[async_trait]
impl AccountClientFactory for ScriptedFactory {
    async fn open(
        &self,
        credential_path: &Path,
    ) -> Result<Arc<dyn AccountClient>, AccountError> {
        self.client
            .record(format!("open:{}", credential_path.display()));
        Ok(self.client.clone())
    }
}

fn test_task_config(user_id: i64, base: &Path) -> SessionTaskConfig {
    let mut relay = MediaRelayConfig::new(".d", base.join("downloads"));
    relay.notice_delete_delay = Duration::from_millis(10);
    relay.success_delete_delay = Duration::from_millis(10);
    let mut config = SessionTaskConfig::new(user_id, "+12345678900", base.join("sessions"), relay);
    config.code_wait = Duration::from_millis(200);
    config.password_wait = Duration::from_millis(200);
    config
}

fn trigger_event(sender_id: i64) -> OutgoingEvent {
    OutgoingEvent {
        chat_id: 10,
        message_id: 100,
        sender_id,
        text: ".d".to_string(),
        reply_to_message_id: Some(99),
        chat_title: Some("Ops Chat".to_string()),
    }
}

fn idle_session_handle() -> SessionHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let _ = cancel_rx.wait_for(|cancel| *cancel).await;
    });
    SessionHandle::new(cancel_tx, task)
}

async fn await_completion(
    completion: tokio::sync::oneshot::Receiver<Result<i64, SessionTaskError>>,
) -> Result<i64, SessionTaskError> {
    tokio::time::timeout(Duration::from_secs(2), completion)
        .await
        .expect("completion in time")
        .expect("completion channel delivered")
}

// --- rendezvous ---

#[tokio::test]
async fn rendezvous_first_fulfillment_wins() {
    let (fulfiller, waiter) = rendezvous::<String>();
    assert!(fulfiller.is_pending());
    assert!(fulfiller.fulfill(Some("54321".to_string())));
    assert!(!fulfiller.fulfill(Some("99999".to_string())));
    assert!(!fulfiller.is_pending());
    assert_eq!(
        waiter.wait(Duration::from_millis(100)).await,
        WaitOutcome::Value("54321".to_string())
    );
}

#[tokio::test]
async fn rendezvous_none_sentinel_declines() {
    let (fulfiller, waiter) = rendezvous::<String>();
    assert!(fulfiller.fulfill(None));
    assert_eq!(
        waiter.wait(Duration::from_millis(100)).await,
        WaitOutcome::Declined
    );
}

#[tokio::test]
async fn rendezvous_dropped_fulfiller_declines() {
    let (fulfiller, waiter) = rendezvous::<String>();
    drop(fulfiller);
    assert_eq!(
        waiter.wait(Duration::from_millis(100)).await,
        WaitOutcome::Declined
    );
}

#[tokio::test]
async fn rendezvous_times_out_when_unfulfilled() {
    let (_fulfiller, waiter) = rendezvous::<String>();
    assert_eq!(
        waiter.wait(Duration::from_millis(20)).await,
        WaitOutcome::TimedOut
    );
}

// --- session task ---

#[tokio::test]
async fn login_with_code_persists_credentials_and_keeps_watching() {
    let base = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedAccountClient::unauthorized());
    let factory = Arc::new(ScriptedFactory {
        client: client.clone(),
    });
    let (code_tx, code_rx) = rendezvous();
    let (_password_tx, password_rx) = rendezvous::<String>();
    let config = test_task_config(7, base.path());

    let started = start_account_session(config, factory, code_rx, password_rx);
    assert!(code_tx.fulfill(Some("54321".to_string())));

    assert_eq!(await_completion(started.completion).await, Ok(ACCOUNT_ID));
    assert!(client.has_call("request_code:+12345678900"));
    assert!(client.has_call("sign_in_code:54321"));

    let credential_path = credential_state_path(&base.path().join("sessions"), 7);
    assert_eq!(
        std::fs::read_to_string(&credential_path).expect("credential blob"),
        format!("credential-blob:{ACCOUNT_ID}")
    );

    // Watch phase keeps running after the completion resolves.
    assert!(!started.handle.is_finished());
    started.handle.cancel();
    assert!(
        started
            .handle
            .await_termination(Duration::from_secs(2))
            .await
    );
    assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn login_with_second_factor_consumes_password_rendezvous() {
    let base = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedAccountClient {
        password_required: true,
        ..ScriptedAccountClient::unauthorized()
    });
    let factory = Arc::new(ScriptedFactory {
        client: client.clone(),
    });
    let (code_tx, code_rx) = rendezvous();
    let (password_tx, password_rx) = rendezvous();

    let started = start_account_session(test_task_config(8, base.path()), factory, code_rx, password_rx);
    assert!(code_tx.fulfill(Some("54321".to_string())));
    assert!(password_tx.fulfill(Some("hunter2".to_string())));

    assert_eq!(await_completion(started.completion).await, Ok(ACCOUNT_ID));
    assert!(client.has_call("sign_in_password"));
    started.handle.cancel();
    assert!(
        started
            .handle
            .await_termination(Duration::from_secs(2))
            .await
    );
}

#[tokio::test]
async fn unfulfilled_code_rendezvous_fails_the_login() {
    let base = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedAccountClient::unauthorized());
    let factory = Arc::new(ScriptedFactory {
        client: client.clone(),
    });
    let (_code_tx, code_rx) = rendezvous::<String>();
    let (_password_tx, password_rx) = rendezvous::<String>();

    let started = start_account_session(test_task_config(9, base.path()), factory, code_rx, password_rx);

    assert_eq!(
        await_completion(started.completion).await,
        Err(SessionTaskError::CodeUnavailable)
    );
    assert!(
        started
            .handle
            .await_termination(Duration::from_secs(2))
            .await
    );
    assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);
    assert!(!credential_state_path(&base.path().join("sessions"), 9).exists());
}

#[tokio::test]
async fn credential_rejection_propagates_with_its_kind() {
    let base = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedAccountClient {
        sign_in_code_error: Some(AccountError::CodeRejected),
        ..ScriptedAccountClient::unauthorized()
    });
    let factory = Arc::new(ScriptedFactory {
        client: client.clone(),
    });
    let (code_tx, code_rx) = rendezvous();
    let (_password_tx, password_rx) = rendezvous::<String>();

    let started =
        start_account_session(test_task_config(10, base.path()), factory, code_rx, password_rx);
    assert!(code_tx.fulfill(Some("00000".to_string())));

    assert_eq!(
        await_completion(started.completion).await,
        Err(SessionTaskError::Account(AccountError::CodeRejected))
    );
    assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_during_code_wait_disconnects_cleanly() {
    let base = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedAccountClient::unauthorized());
    let factory = Arc::new(ScriptedFactory {
        client: client.clone(),
    });
    let (_code_tx, code_rx) = rendezvous::<String>();
    let (_password_tx, password_rx) = rendezvous::<String>();
    let mut config = test_task_config(11, base.path());
    config.code_wait = Duration::from_secs(300);

    let started = start_account_session(config, factory, code_rx, password_rx);
    // Let the task reach the code suspension point before cancelling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    started.handle.cancel();

    assert!(
        started
            .handle
            .await_termination(Duration::from_secs(2))
            .await
    );
    assert_eq!(await_completion(started.completion).await, Err(SessionTaskError::Cancelled));
    assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn prior_authorization_skips_the_code_exchange() {
    let base = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedAccountClient::authorized());
    let factory = Arc::new(ScriptedFactory {
        client: client.clone(),
    });
    let (_code_tx, code_rx) = rendezvous::<String>();
    let (_password_tx, password_rx) = rendezvous::<String>();

    let started =
        start_account_session(test_task_config(12, base.path()), factory, code_rx, password_rx);

    assert_eq!(await_completion(started.completion).await, Ok(ACCOUNT_ID));
    assert!(!client.has_call("request_code"));
    assert!(client.has_call("export"));
    started.handle.cancel();
    assert!(
        started
            .handle
            .await_termination(Duration::from_secs(2))
            .await
    );
}

#[tokio::test]
async fn spoofed_trigger_sender_is_ignored() {
    let base = tempdir().expect("tempdir");
    let client = Arc::new(ScriptedAccountClient {
        keep_stream_open: false,
        events: AsyncMutex::new(VecDeque::from([trigger_event(555)])),
        ..ScriptedAccountClient::authorized()
    });
    let factory = Arc::new(ScriptedFactory {
        client: client.clone(),
    });
    let (_code_tx, code_rx) = rendezvous::<String>();
    let (_password_tx, password_rx) = rendezvous::<String>();

    let started =
        start_account_session(test_task_config(13, base.path()), factory, code_rx, password_rx);

    assert_eq!(await_completion(started.completion).await, Ok(ACCOUNT_ID));
    assert!(
        started
            .handle
            .await_termination(Duration::from_secs(2))
            .await
    );
    assert!(!client.has_call("fetch"));
}

// --- registry ---

#[tokio::test]
async fn register_rejects_second_live_session_for_same_user() {
    let base = tempdir().expect("tempdir");
    let registry = SessionRegistry::new(base.path());

    assert!(registry.register(42, idle_session_handle()).is_accepted());
    assert!(registry.is_active(42));

    let rejected = registry.register(42, idle_session_handle());
    assert!(!rejected.is_accepted());
    if let crate::RegisterOutcome::Rejected(handle) = rejected {
        handle.cancel();
        assert!(handle.await_termination(Duration::from_secs(2)).await);
    }

    let report = registry
        .cancel_and_remove(42, Duration::from_secs(2))
        .await;
    assert!(report.was_registered);
    assert!(report.terminated_within_grace);
    assert!(!registry.is_active(42));
}

#[tokio::test]
async fn finished_entry_is_replaced_on_register() {
    let base = tempdir().expect("tempdir");
    let registry = SessionRegistry::new(base.path());

    let finished = idle_session_handle();
    finished.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(finished.is_finished());
    assert!(registry.register(42, finished).is_accepted());
    assert!(!registry.is_active(42));

    assert!(registry.register(42, idle_session_handle()).is_accepted());
    assert!(registry.is_active(42));
    registry.cancel_and_remove(42, Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_accepts_exactly_one() {
    let base = tempdir().expect("tempdir");
    let registry = Arc::new(SessionRegistry::new(base.path()));

    let mut attempts = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        attempts.push(tokio::spawn(async move {
            match registry.register(77, idle_session_handle()) {
                crate::RegisterOutcome::Accepted => true,
                crate::RegisterOutcome::Rejected(handle) => {
                    handle.cancel();
                    false
                }
            }
        }));
    }

    let mut accepted = 0;
    for attempt in attempts {
        if attempt.await.expect("join") {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    registry.cancel_and_remove(77, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn cancel_and_remove_reports_unknown_user() {
    let base = tempdir().expect("tempdir");
    let registry = SessionRegistry::new(base.path());
    let report = registry.cancel_and_remove(1, Duration::from_millis(50)).await;
    assert!(!report.was_registered);
}

#[tokio::test]
async fn logout_removes_credential_state_file() {
    let base = tempdir().expect("tempdir");
    let registry = SessionRegistry::new(base.path());
    registry.register(5, idle_session_handle());

    let credential_path = credential_state_path(base.path(), 5);
    std::fs::write(&credential_path, "blob").expect("seed credential file");

    let report = registry.logout(5, Duration::from_secs(2)).await;
    assert!(report.was_registered);
    assert!(report.terminated_within_grace);
    assert!(report.credential_file_removed);
    assert!(report.credential_file_error.is_none());
    assert!(!credential_path.exists());

    // Idempotent: a second logout finds neither entry nor file.
    let report = registry.logout(5, Duration::from_millis(50)).await;
    assert!(!report.was_registered);
    assert!(!report.credential_file_removed);
    assert!(report.credential_file_error.is_none());
}

// --- media relay ---

fn media_message() -> FetchedMessage {
    FetchedMessage {
        chat_id: 10,
        message_id: 99,
        has_media: true,
        sender_id: Some(5),
    }
}

fn relay_config(base: &Path) -> MediaRelayConfig {
    let mut config = MediaRelayConfig::new(".d", base.join("downloads"));
    config.notice_delete_delay = Duration::from_millis(10);
    config.success_delete_delay = Duration::from_millis(10);
    config
}

#[tokio::test]
async fn relay_forwards_media_and_cleans_up_scratch() {
    let base = tempdir().expect("tempdir");
    let client = ScriptedAccountClient {
        fetch_result: Some(media_message()),
        ..ScriptedAccountClient::authorized()
    };
    let config = relay_config(base.path());

    relay_replied_media(&client, ACCOUNT_ID, &trigger_event(ACCOUNT_ID), &config).await;

    let calls = client.calls();
    assert!(calls.iter().any(|c| c == "post:Processing..."));
    assert!(calls.iter().any(|c| c.starts_with("forward:Saved: media.bin")));
    assert!(calls
        .iter()
        .any(|c| c.contains("Originally from: Alice Smith (ID: 5)")));
    assert!(calls.iter().any(|c| c.contains("Replied in chat: Ops Chat")));
    assert!(calls
        .iter()
        .any(|c| c == "edit:Media saved to your private archive."));
    assert!(calls.iter().any(|c| c == "delete_status"));

    let scratch = base
        .path()
        .join("downloads")
        .join(ACCOUNT_ID.to_string())
        .join("media.bin");
    assert!(!scratch.exists(), "scratch file must be cleaned up");
}

#[tokio::test]
async fn relay_without_media_posts_notice_and_skips_download() {
    let base = tempdir().expect("tempdir");
    let client = ScriptedAccountClient {
        fetch_result: Some(FetchedMessage {
            has_media: false,
            ..media_message()
        }),
        ..ScriptedAccountClient::authorized()
    };
    let config = relay_config(base.path());

    relay_replied_media(&client, ACCOUNT_ID, &trigger_event(ACCOUNT_ID), &config).await;

    let calls = client.calls();
    assert!(calls
        .iter()
        .any(|c| c == "edit:The replied message does not contain media."));
    assert!(calls.iter().any(|c| c == "delete_status"));
    assert!(!client.has_call("download"));
    assert!(!base.path().join("downloads").join(ACCOUNT_ID.to_string()).exists());
}

#[tokio::test]
async fn relay_reports_missing_replied_message() {
    let base = tempdir().expect("tempdir");
    let client = ScriptedAccountClient {
        fetch_result: None,
        ..ScriptedAccountClient::authorized()
    };
    let config = relay_config(base.path());

    relay_replied_media(&client, ACCOUNT_ID, &trigger_event(ACCOUNT_ID), &config).await;

    assert!(client.has_call(
        "edit:Could not fetch the replied message (it might have been deleted)."
    ));
    assert!(!client.has_call("download"));
}

#[tokio::test]
async fn relay_download_failure_updates_status_only() {
    let base = tempdir().expect("tempdir");
    let client = ScriptedAccountClient {
        fetch_result: Some(media_message()),
        download_error: Some(AccountError::Connection("dc timeout".to_string())),
        ..ScriptedAccountClient::authorized()
    };
    let config = relay_config(base.path());

    relay_replied_media(&client, ACCOUNT_ID, &trigger_event(ACCOUNT_ID), &config).await;

    assert!(client.has_call("edit:Failed to download the file"));
    assert!(!client.has_call("forward"));
}

#[tokio::test]
async fn relay_cleans_scratch_even_when_forward_fails() {
    let base = tempdir().expect("tempdir");
    let client = ScriptedAccountClient {
        fetch_result: Some(media_message()),
        forward_error: Some(AccountError::Connection("flood wait".to_string())),
        ..ScriptedAccountClient::authorized()
    };
    let config = relay_config(base.path());

    relay_replied_media(&client, ACCOUNT_ID, &trigger_event(ACCOUNT_ID), &config).await;

    assert!(client.has_call("edit:Failed to forward the file"));
    let scratch = base
        .path()
        .join("downloads")
        .join(ACCOUNT_ID.to_string())
        .join("media.bin");
    assert!(!scratch.exists(), "scratch cleanup runs on forward failure");
}
