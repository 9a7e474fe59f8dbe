//! Account-client collaborator seam for Stash crates.
//!
//! The protocol-level messaging client (connect, authenticate, fetch,
//! download, forward, outgoing-event stream) lives behind the
//! [`AccountClient`] trait; the session engine only depends on this surface
//! and on the typed [`AccountError`] kinds it must distinguish when
//! reporting login failures back to the user.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Typed failures from the account-client collaborator.
///
/// The credential-rejection kinds are matched on across the task/coordinator
/// boundary so the user sees the specific reason; everything else collapses
/// into `Connection`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("the login code was incorrect")]
    CodeRejected,
    #[error("the phone number was rejected")]
    PhoneRejected,
    #[error("the two-factor password was incorrect")]
    PasswordRejected,
    #[error("connection failure: {0}")]
    Connection(String),
}

/// Identity of the authenticated account, as reported by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

/// Outcome of a code sign-in attempt: either done, or a second factor is
/// still required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    Authenticated(AccountIdentity),
    PasswordRequired,
}

/// One outgoing message observed on the authenticated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEvent {
    pub chat_id: i64,
    pub message_id: i64,
    pub sender_id: i64,
    pub text: String,
    pub reply_to_message_id: Option<i64>,
    pub chat_title: Option<String>,
}

/// A message resolved by id, carrying just what the relay needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub has_media: bool,
    pub sender_id: Option<i64>,
}

/// Sender attribution for a relayed media message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderProfile {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
}

impl SenderProfile {
    /// Display form used in relay captions: "First Last (ID: n)".
    pub fn display(&self) -> String {
        let mut name = self.first_name.clone();
        if let Some(last_name) = self.last_name.as_deref().filter(|v| !v.is_empty()) {
            name.push(' ');
            name.push_str(last_name);
        }
        format!("{} (ID: {})", name, self.id)
    }
}

/// Handle to a transient status message posted on the back channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedStatus {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Trait contract for the protocol-level account client.
#[async_trait]
pub trait AccountClient: Send + Sync {
    /// Establishes the connection. Prior credential state, if any, was
    /// loaded when the client was opened against its credential path.
    async fn connect(&self) -> Result<(), AccountError>;

    /// True when prior durable state already authenticates this account.
    async fn is_authorized(&self) -> Result<bool, AccountError>;

    /// Asks the service to deliver a one-time login code to the account.
    async fn request_login_code(&self, phone: &str) -> Result<(), AccountError>;

    async fn sign_in_with_code(
        &self,
        phone: &str,
        code: &str,
    ) -> Result<SignInOutcome, AccountError>;

    async fn sign_in_with_password(
        &self,
        password: &str,
    ) -> Result<AccountIdentity, AccountError>;

    /// Identity of the already-authorized account.
    async fn identity(&self) -> Result<AccountIdentity, AccountError>;

    /// Serializes the current authentication material for durable storage.
    async fn export_credentials(&self) -> Result<String, AccountError>;

    /// Next outgoing message from this account, or `None` once the
    /// connection is gone. Cancellation-safe.
    async fn next_outgoing(&self) -> Result<Option<OutgoingEvent>, AccountError>;

    /// Resolves a message by id; `None` when it no longer exists.
    async fn fetch_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<FetchedMessage>, AccountError>;

    async fn resolve_sender(
        &self,
        message: &FetchedMessage,
    ) -> Result<Option<SenderProfile>, AccountError>;

    /// Downloads the message's media into `dest_dir`, returning the file path.
    async fn download_media(
        &self,
        message: &FetchedMessage,
        dest_dir: &Path,
    ) -> Result<PathBuf, AccountError>;

    /// Forwards a local file to the account's own private archive chat.
    async fn send_file_to_self(&self, path: &Path, caption: &str) -> Result<(), AccountError>;

    /// Posts a status reply to `reply_to` in `chat_id`.
    async fn post_status(
        &self,
        chat_id: i64,
        reply_to: i64,
        text: &str,
    ) -> Result<PostedStatus, AccountError>;

    async fn edit_status(&self, status: &PostedStatus, text: &str) -> Result<(), AccountError>;

    async fn delete_status(&self, status: &PostedStatus) -> Result<(), AccountError>;

    /// Tears the connection down. Must be safe to call more than once.
    async fn disconnect(&self);
}

/// Opens account clients against a credential-state path.
#[async_trait]
pub trait AccountClientFactory: Send + Sync {
    async fn open(
        &self,
        credential_path: &Path,
    ) -> Result<std::sync::Arc<dyn AccountClient>, AccountError>;
}

/// Credential-state file for one front-channel user id.
pub fn credential_state_path(sessions_dir: &Path, user_id: i64) -> PathBuf {
    sessions_dir.join(format!("user_{user_id}.session"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_state_path_is_keyed_by_user_id() {
        let path = credential_state_path(Path::new("sessions"), 4242);
        assert_eq!(path, PathBuf::from("sessions/user_4242.session"));
    }

    #[test]
    fn sender_profile_display_includes_id() {
        let full = SenderProfile {
            id: 9,
            first_name: "Ada".to_string(),
            last_name: Some("Lovelace".to_string()),
        };
        assert_eq!(full.display(), "Ada Lovelace (ID: 9)");

        let bare = SenderProfile {
            id: 10,
            first_name: "Ada".to_string(),
            last_name: None,
        };
        assert_eq!(bare.display(), "Ada (ID: 10)");
    }

    #[test]
    fn account_error_messages_name_the_rejected_credential() {
        assert_eq!(
            AccountError::CodeRejected.to_string(),
            "the login code was incorrect"
        );
        assert_eq!(
            AccountError::PasswordRejected.to_string(),
            "the two-factor password was incorrect"
        );
        assert_eq!(
            AccountError::Connection("dc unreachable".to_string()).to_string(),
            "connection failure: dc unreachable"
        );
    }
}
