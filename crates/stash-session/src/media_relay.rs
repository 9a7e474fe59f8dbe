//! Media relay triggered by a matching outgoing reply.
//!
//! Every step reports into a transient status message and nothing here ever
//! propagates to the watch loop; one failed relay must not take the session
//! down.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use stash_account::{AccountClient, OutgoingEvent, PostedStatus};

const STATUS_PROCESSING: &str = "Processing...";
const STATUS_FETCH_FAILED: &str =
    "Could not fetch the replied message (it might have been deleted).";
const STATUS_NO_MEDIA: &str = "The replied message does not contain media.";
const STATUS_SAVED: &str = "Media saved to your private archive.";
const UNKNOWN_SENDER: &str = "Unknown User";
const UNKNOWN_CHAT: &str = "DM/Unknown Chat";

#[derive(Debug, Clone)]
/// Relay settings carried by each account session task.
pub struct MediaRelayConfig {
    pub trigger: String,
    pub downloads_root: PathBuf,
    /// How long the "no media" notice stays up before auto-deletion.
    pub notice_delete_delay: Duration,
    /// How long the success status stays up before auto-deletion.
    pub success_delete_delay: Duration,
}

impl MediaRelayConfig {
    pub fn new(trigger: impl Into<String>, downloads_root: impl Into<PathBuf>) -> Self {
        Self {
            trigger: trigger.into(),
            downloads_root: downloads_root.into(),
            notice_delete_delay: Duration::from_secs(5),
            success_delete_delay: Duration::from_secs(10),
        }
    }
}

/// Runs one relay for a trigger reply: fetch, download, forward, cleanup.
pub(crate) async fn relay_replied_media(
    client: &dyn AccountClient,
    account_id: i64,
    event: &OutgoingEvent,
    config: &MediaRelayConfig,
) {
    let Some(reply_to) = event.reply_to_message_id else {
        return;
    };

    // Best effort; the relay proceeds even when the status cannot be posted.
    let status = match client
        .post_status(event.chat_id, event.message_id, STATUS_PROCESSING)
        .await
    {
        Ok(status) => Some(status),
        Err(error) => {
            warn!("account {account_id} could not post relay status in chat {}: {error}", event.chat_id);
            None
        }
    };

    let target = match client.fetch_message(event.chat_id, reply_to).await {
        Ok(Some(target)) => target,
        Ok(None) => {
            edit_status(client, account_id, status.as_ref(), STATUS_FETCH_FAILED).await;
            return;
        }
        Err(error) => {
            warn!(
                "account {account_id} failed to fetch message {reply_to} in chat {}: {error}",
                event.chat_id
            );
            edit_status(client, account_id, status.as_ref(), STATUS_FETCH_FAILED).await;
            return;
        }
    };

    if !target.has_media {
        edit_status(client, account_id, status.as_ref(), STATUS_NO_MEDIA).await;
        delete_status_after(client, status, config.notice_delete_delay).await;
        return;
    }

    let sender_info = match client.resolve_sender(&target).await {
        Ok(Some(profile)) => profile.display(),
        Ok(None) => UNKNOWN_SENDER.to_string(),
        Err(error) => {
            warn!("account {account_id} failed to resolve media sender: {error}");
            UNKNOWN_SENDER.to_string()
        }
    };

    let dest_dir = config.downloads_root.join(account_id.to_string());
    if let Err(error) = tokio::fs::create_dir_all(&dest_dir).await {
        warn!(
            "account {account_id} failed to create scratch dir {}: {error}",
            dest_dir.display()
        );
        edit_status(client, account_id, status.as_ref(), "Failed to download the file.").await;
        return;
    }

    let downloaded = match client.download_media(&target, &dest_dir).await {
        Ok(path) => path,
        Err(error) => {
            warn!("account {account_id} media download failed: {error}");
            edit_status(
                client,
                account_id,
                status.as_ref(),
                &format!("Failed to download the file: {error}"),
            )
            .await;
            return;
        }
    };
    info!(
        "account {account_id} downloaded media to {}",
        downloaded.display()
    );

    let file_name = downloaded
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let chat_name = event.chat_title.as_deref().unwrap_or(UNKNOWN_CHAT);
    let caption =
        format!("Saved: {file_name}\nOriginally from: {sender_info}\nReplied in chat: {chat_name}");

    match client.send_file_to_self(&downloaded, &caption).await {
        Ok(()) => {
            edit_status(client, account_id, status.as_ref(), STATUS_SAVED).await;
            cleanup_scratch(account_id, &downloaded).await;
            delete_status_after(client, status, config.success_delete_delay).await;
        }
        Err(error) => {
            warn!("account {account_id} failed to forward media: {error}");
            edit_status(
                client,
                account_id,
                status.as_ref(),
                &format!("Failed to forward the file: {error}"),
            )
            .await;
            // Scratch cleanup runs even when the forward failed.
            cleanup_scratch(account_id, &downloaded).await;
        }
    }
}

async fn cleanup_scratch(account_id: i64, path: &std::path::Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        warn!(
            "account {account_id} failed to remove scratch file {}: {error}",
            path.display()
        );
    }
}

async fn edit_status(
    client: &dyn AccountClient,
    account_id: i64,
    status: Option<&PostedStatus>,
    text: &str,
) {
    let Some(status) = status else {
        info!("account {account_id} relay status: {text}");
        return;
    };
    if let Err(error) = client.edit_status(status, text).await {
        warn!("account {account_id} failed to edit relay status: {error}");
    }
}

async fn delete_status_after(
    client: &dyn AccountClient,
    status: Option<PostedStatus>,
    delay: Duration,
) {
    let Some(status) = status else {
        return;
    };
    tokio::time::sleep(delay).await;
    let _ = client.delete_status(&status).await;
}
