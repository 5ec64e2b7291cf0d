//! Attachment upload engine.
//!
//! Attachments arrive as a sequence of chunks of at most [`CHUNK_SIZE`]
//! bytes. A full-size chunk means more follow; a shorter one ends the
//! upload. Chunks are stored as a singly linked list whose head row id is
//! the message id, and every chunk reserves the row id of its successor.
//!
//! Upload state is keyed by (uploader, message). Failed uploads are marked
//! `failed` in the metadata row so clients can tell them apart from uploads
//! still in progress, and their partial chain is purged. A periodic sweep
//! inside the actor loop times out idle uploads; a timed-out entry stays as
//! a tombstone until the next sweep so late chunks get a precise error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::types::{ChunkId, MessageId, UserId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::messages::{AttachmentMessage, ChunkAck, ChunkSubmission, MessageTable};
use super::registry::ConnectionRegistry;
use super::supervisor::{reply, supervise, RestartPolicy, Supervised, SupervisorExit};
use crate::errors::RtcError;
use crate::events::{AttachmentProgress, ServerEvent};
use crate::observability::metrics;
use crate::repositories::{bounded, AttachmentStore, NewChunk};

/// Mailbox capacity.
pub const ATTACHMENT_CHANNEL_BUFFER: usize = 256;

/// Size of every non-terminal chunk.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_DB_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    /// Uploads idle for at least this long are timed out by the sweep.
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    /// Deadline for each store call.
    pub db_timeout: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            db_timeout: DEFAULT_DB_TIMEOUT,
        }
    }
}

/// Completion ratio reported after the chunk at `index`: bytes confirmed
/// before that chunk over the declared size.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress_ratio(index: u64, size: i64) -> f64 {
    if size <= 0 {
        return 0.0;
    }
    let confirmed = index as f64 * CHUNK_SIZE as f64;
    (confirmed / size as f64).min(1.0)
}

/// Handle to the attachment upload engine.
#[derive(Debug, Clone)]
pub struct AttachmentEngineHandle {
    sender: mpsc::Sender<AttachmentMessage>,
    cancel_token: CancellationToken,
}

impl AttachmentEngineHandle {
    /// Spawn a supervised upload engine.
    #[must_use]
    pub fn spawn<S: AttachmentStore>(
        registry: Arc<ConnectionRegistry>,
        store: S,
        settings: UploadSettings,
        policy: RestartPolicy,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<SupervisorExit>) {
        let (handle, actor) = AttachmentEngine::new(registry, store, settings, cancel_token);
        let task = tokio::spawn(supervise(actor, policy));
        (handle, task)
    }

    pub async fn submit_chunk(&self, chunk: ChunkSubmission) -> Result<ChunkAck, RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(AttachmentMessage::SubmitChunk {
            chunk,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn delete(&self, uploader: UserId, message_id: MessageId) -> Result<(), RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(AttachmentMessage::Delete {
            uploader,
            message_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn in_flight(&self, uploader: UserId) -> Result<Vec<MessageId>, RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(AttachmentMessage::InFlight {
            uploader,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn send(&self, message: AttachmentMessage) -> Result<(), RtcError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| RtcError::Internal(format!("channel send failed: {e}")))
    }
}

#[derive(Debug)]
struct Upload {
    table: MessageTable,
    size: i64,
    /// Index of the next expected chunk.
    index: u64,
    /// Row id reserved for the next chunk; `None` once the terminal chunk
    /// is written.
    next: Option<ChunkId>,
    last_chunk_at: Instant,
    timed_out: bool,
    recipients: Vec<UserId>,
}

type UploadKey = (UserId, MessageId);

pub struct AttachmentEngine<S> {
    receiver: mpsc::Receiver<AttachmentMessage>,
    disconnects: broadcast::Receiver<UserId>,
    disconnects_open: bool,
    registry: Arc<ConnectionRegistry>,
    store: S,
    settings: UploadSettings,
    cancel_token: CancellationToken,
    uploads: HashMap<UploadKey, Upload>,
    sweep_timer: Interval,
}

impl<S: AttachmentStore> AttachmentEngine<S> {
    /// Build an unspawned engine and its handle.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: S,
        settings: UploadSettings,
        cancel_token: CancellationToken,
    ) -> (AttachmentEngineHandle, Self) {
        let (sender, receiver) = mpsc::channel(ATTACHMENT_CHANNEL_BUFFER);
        let handle = AttachmentEngineHandle {
            sender,
            cancel_token: cancel_token.clone(),
        };
        let mut sweep_timer = tokio::time::interval_at(
            Instant::now() + settings.sweep_interval,
            settings.sweep_interval,
        );
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let actor = Self {
            receiver,
            disconnects: registry.subscribe_disconnects(),
            disconnects_open: true,
            registry,
            store,
            settings,
            cancel_token,
            uploads: HashMap::new(),
            sweep_timer,
        };
        (handle, actor)
    }

    #[instrument(skip_all, name = "rtc.actor.attachments")]
    async fn run_loop(&mut self) -> Result<(), RtcError> {
        info!(target: "rtc.actor.attachments", "Attachment engine started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(target: "rtc.actor.attachments", "Attachment engine received cancellation signal");
                    return Ok(());
                }

                _ = self.sweep_timer.tick() => {
                    self.sweep().await;
                }

                disconnect = self.disconnects.recv(), if self.disconnects_open => {
                    match disconnect {
                        Ok(user_id) => self.handle_disconnect(user_id).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(target: "rtc.actor.attachments", missed, "Disconnect notifications lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.disconnects_open = false;
                        }
                    }
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        info!(target: "rtc.actor.attachments", "Attachment engine channel closed, exiting");
                        return Ok(());
                    };
                    metrics::set_actor_mailbox_depth(Self::NAME, self.receiver.len());
                    self.handle_message(message).await?;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: AttachmentMessage) -> Result<(), RtcError> {
        match message {
            AttachmentMessage::SubmitChunk { chunk, respond_to } => {
                let result = self.submit_chunk(chunk).await;
                reply(respond_to, result)?;
            }
            AttachmentMessage::Delete {
                uploader,
                message_id,
                respond_to,
            } => {
                let result = self.delete(uploader, message_id).await;
                reply(respond_to, result)?;
            }
            AttachmentMessage::InFlight {
                uploader,
                respond_to,
            } => {
                let mut ids: Vec<MessageId> = self
                    .uploads
                    .iter()
                    .filter(|((user, _), upload)| *user == uploader && !upload.timed_out)
                    .map(|((_, message_id), _)| *message_id)
                    .collect();
                ids.sort();
                let _ = respond_to.send(ids);
            }
        }
        Ok(())
    }

    async fn submit_chunk(&mut self, chunk: ChunkSubmission) -> Result<ChunkAck, RtcError> {
        let ChunkSubmission {
            uploader,
            message_id,
            table,
            bytes,
            recipients,
        } = chunk;
        if bytes.len() > CHUNK_SIZE {
            return Err(RtcError::ChunkTooLarge { len: bytes.len() });
        }
        // The uploader's disconnect may already have been handled.
        if !self.registry.is_online(uploader).await {
            return Err(RtcError::NotConnected(uploader));
        }
        let key = (uploader, message_id);
        if self.uploads.get(&key).is_some_and(|upload| upload.timed_out) {
            return Err(RtcError::UploadTimedOut(message_id));
        }

        let lookup = self
            .db(
                "attachment_metadata",
                self.store.attachment_metadata(table, message_id),
            )
            .await;
        let metadata = match lookup {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                // Metadata is gone; drop whatever this upload wrote.
                if let Some(upload) = self.uploads.remove(&key) {
                    self.purge_chain(message_id, upload.next).await;
                    self.publish_gauges();
                }
                return Err(RtcError::AttachmentNotFound(message_id));
            }
            Err(e) => return Err(self.fail_upload(key, &recipients, e).await),
        };
        if metadata.failed {
            return Err(self
                .fail_upload(key, &recipients, RtcError::AttachmentFailed(message_id))
                .await);
        }

        let upload = self.uploads.entry(key).or_insert_with(|| Upload {
            table,
            size: metadata.size,
            index: 0,
            next: Some(ChunkId::from(message_id)),
            last_chunk_at: Instant::now(),
            timed_out: false,
            recipients: Vec::new(),
        });
        upload.last_chunk_at = Instant::now();
        upload.recipients.clone_from(&recipients);
        let Some(row_id) = upload.next else {
            return Err(RtcError::ActorFault(format!(
                "upload of {message_id} has no reserved chunk id"
            )));
        };
        let index = upload.index;
        let terminal = bytes.len() < CHUNK_SIZE;
        let next = (!terminal).then(ChunkId::new);
        let ratio = progress_ratio(index, metadata.size);

        let written = self
            .write_chunk(key, table, row_id, bytes, next, ratio, &recipients)
            .await;
        match written {
            Ok(ack) => {
                self.publish_gauges();
                Ok(ack)
            }
            Err(e) => Err(self.fail_upload(key, &recipients, e).await),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_chunk(
        &mut self,
        key: UploadKey,
        table: MessageTable,
        row_id: ChunkId,
        bytes: Bytes,
        next: Option<ChunkId>,
        ratio: f64,
        recipients: &[UserId],
    ) -> Result<ChunkAck, RtcError> {
        let (_, message_id) = key;
        let chunk = NewChunk {
            id: row_id,
            message_id,
            bytes,
            next,
        };
        self.db("insert_chunk", self.store.insert_chunk(table, chunk))
            .await?;
        if let Some(upload) = self.uploads.get_mut(&key) {
            upload.next = next;
        }

        self.db("set_ratio", self.store.set_ratio(table, message_id, ratio))
            .await?;
        self.broadcast_progress(message_id, ratio, false, recipients)
            .await;

        if next.is_some() {
            if let Some(upload) = self.uploads.get_mut(&key) {
                upload.index += 1;
            }
            return Ok(ChunkAck::Progress { ratio });
        }

        self.db("set_ratio", self.store.set_ratio(table, message_id, 1.0))
            .await?;
        self.uploads.remove(&key);
        self.broadcast_progress(message_id, 1.0, false, recipients)
            .await;
        metrics::record_upload_outcome("complete");
        info!(target: "rtc.actor.attachments", message_id = %message_id, "Upload complete");
        Ok(ChunkAck::Complete)
    }

    /// Drop the upload, mark it failed, purge what was written and tell
    /// the recipients. Returns `error` for the requester.
    async fn fail_upload(
        &mut self,
        key: UploadKey,
        recipients: &[UserId],
        error: RtcError,
    ) -> RtcError {
        let (_, message_id) = key;
        warn!(
            target: "rtc.actor.attachments",
            message_id = %message_id,
            error = %error,
            "Upload failed"
        );
        let upload = self.uploads.remove(&key);
        let frontier = upload.as_ref().and_then(|upload| upload.next);

        if let Some(upload) = &upload {
            self.mark_failed(upload.table, message_id).await;
        } else if let Ok(table) = self.resolve_table(message_id).await {
            self.mark_failed(table, message_id).await;
        }
        self.purge_chain(message_id, frontier).await;
        self.broadcast_progress(message_id, 0.0, true, recipients)
            .await;
        metrics::record_upload_outcome("failed");
        self.publish_gauges();
        error
    }

    /// Remove the metadata row, then the chain. An in-flight upload is only
    /// dropped once both succeed, so a failed delete leaves it resumable.
    async fn delete(&mut self, uploader: UserId, message_id: MessageId) -> Result<(), RtcError> {
        let key = (uploader, message_id);
        let in_flight = self.uploads.get(&key).map(|upload| upload.next);

        let table = self.resolve_table(message_id).await?;
        let complete = if in_flight.is_some() {
            false
        } else {
            self.db(
                "attachment_metadata",
                self.store.attachment_metadata(table, message_id),
            )
            .await?
            .is_some_and(|metadata| metadata.complete)
        };
        let removed = self
            .db(
                "delete_metadata",
                self.store.delete_metadata(table, message_id),
            )
            .await?;
        let deleted = self
            .walk_chain(table, message_id, in_flight.flatten(), !complete)
            .await?;

        if self.uploads.remove(&key).is_some() {
            metrics::record_upload_outcome("deleted");
            self.publish_gauges();
        }
        if !removed && deleted == 0 {
            return Err(RtcError::AttachmentNotFound(message_id));
        }
        debug!(
            target: "rtc.actor.attachments",
            message_id = %message_id,
            chunks = deleted,
            "Attachment deleted"
        );
        Ok(())
    }

    async fn handle_disconnect(&mut self, user_id: UserId) {
        let keys: Vec<UploadKey> = self
            .uploads
            .keys()
            .filter(|(uploader, _)| *uploader == user_id)
            .copied()
            .collect();

        for key in keys {
            let Some(upload) = self.uploads.remove(&key) else {
                continue;
            };
            if upload.timed_out {
                continue;
            }
            let (_, message_id) = key;
            info!(
                target: "rtc.actor.attachments",
                message_id = %message_id,
                "Uploader disconnected, discarding upload"
            );
            self.mark_failed(upload.table, message_id).await;
            self.purge_chain(message_id, upload.next).await;
            self.broadcast_progress(message_id, 0.0, true, &upload.recipients)
                .await;
            metrics::record_upload_outcome("disconnected");
        }
        self.publish_gauges();
    }

    async fn sweep(&mut self) {
        self.uploads.retain(|_, upload| !upload.timed_out);

        let inactivity_timeout = self.settings.inactivity_timeout;
        let stale: Vec<UploadKey> = self
            .uploads
            .iter()
            .filter(|(_, upload)| upload.last_chunk_at.elapsed() >= inactivity_timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in stale {
            let Some(upload) = self.uploads.get_mut(&key) else {
                continue;
            };
            upload.timed_out = true;
            let table = upload.table;
            let frontier = upload.next;
            let recipients = upload.recipients.clone();
            let (_, message_id) = key;

            warn!(target: "rtc.actor.attachments", message_id = %message_id, "Upload timed out");
            self.purge_chain(message_id, frontier).await;
            self.mark_failed(table, message_id).await;
            self.broadcast_progress(message_id, 0.0, true, &recipients)
                .await;
            metrics::record_upload_outcome("timed_out");
        }
        self.publish_gauges();
    }

    /// Owning table of a message, direct messages first.
    async fn resolve_table(&self, message_id: MessageId) -> Result<MessageTable, RtcError> {
        for table in MessageTable::LOOKUP_ORDER {
            if self
                .db("message_exists", self.store.message_exists(table, message_id))
                .await?
            {
                return Ok(table);
            }
        }
        Err(RtcError::MessageNotFound(message_id))
    }

    /// Delete the chain of an upload that never completed, logging instead
    /// of failing.
    async fn purge_chain(&self, message_id: MessageId, frontier: Option<ChunkId>) {
        let result = match self.resolve_table(message_id).await {
            Ok(table) => self.walk_chain(table, message_id, frontier, true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                target: "rtc.actor.attachments",
                message_id = %message_id,
                error = %e,
                "Failed to purge chunk chain"
            );
        }
    }

    /// Delete chunks from the head, following forward pointers until the
    /// terminal chunk or `frontier`, the id reserved for an unwritten chunk.
    /// A missing head means nothing was written. With `open_ended` the chain
    /// belongs to an upload that never completed and whose frontier may be
    /// lost, so the first missing row ends it; otherwise a missing row is a
    /// broken chain. Returns the number of rows deleted.
    async fn walk_chain(
        &self,
        table: MessageTable,
        message_id: MessageId,
        frontier: Option<ChunkId>,
        open_ended: bool,
    ) -> Result<usize, RtcError> {
        let head = ChunkId::from(message_id);
        let mut current = Some(head);
        let mut deleted = 0;

        while let Some(chunk_id) = current {
            if frontier == Some(chunk_id) {
                break;
            }
            match self
                .db("delete_chunk", self.store.delete_chunk(table, chunk_id))
                .await?
            {
                Some(row) => {
                    deleted += 1;
                    current = row.next;
                }
                None if chunk_id == head || open_ended => break,
                None => {
                    return Err(RtcError::ChunkChainBroken {
                        message_id,
                        chunk_id,
                    })
                }
            }
        }
        Ok(deleted)
    }

    async fn mark_failed(&self, table: MessageTable, message_id: MessageId) {
        if let Err(e) = self
            .db("mark_failed", self.store.mark_failed(table, message_id))
            .await
        {
            warn!(
                target: "rtc.actor.attachments",
                message_id = %message_id,
                error = %e,
                "Failed to mark attachment failed"
            );
        }
    }

    async fn broadcast_progress(
        &self,
        message_id: MessageId,
        ratio: f64,
        failed: bool,
        recipients: &[UserId],
    ) {
        self.registry
            .send_to_users(
                recipients,
                ServerEvent::AttachmentProgress(AttachmentProgress {
                    msg_id: message_id,
                    ratio,
                    failed,
                }),
            )
            .await;
    }

    async fn db<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RtcError>>,
    ) -> Result<T, RtcError> {
        bounded(self.settings.db_timeout, operation, call).await
    }

    fn publish_gauges(&self) {
        let in_flight = self.uploads.values().filter(|u| !u.timed_out).count();
        metrics::set_uploads_in_flight(in_flight);
    }
}

impl<S: AttachmentStore> Supervised for AttachmentEngine<S> {
    const NAME: &'static str = "attachments";

    fn run(&mut self) -> impl Future<Output = Result<(), RtcError>> + Send {
        self.run_loop()
    }

    /// Tombstones only exist to answer late chunks; the metadata row keeps
    /// rejecting them after a restart.
    fn on_restart(&mut self) {
        self.uploads.retain(|_, upload| !upload.timed_out);
        self.publish_gauges();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::actors::test_support::{connect, drain};
    use crate::repositories::memory::StoreOp;
    use crate::repositories::InMemoryStore;

    const MIB: usize = 1024 * 1024;

    fn spawn(registry: &Arc<ConnectionRegistry>, store: &InMemoryStore) -> AttachmentEngineHandle {
        let (handle, _task) = AttachmentEngineHandle::spawn(
            Arc::clone(registry),
            store.clone(),
            UploadSettings::default(),
            RestartPolicy::Unbounded,
            CancellationToken::new(),
        );
        handle
    }

    fn chunk(
        uploader: UserId,
        message_id: MessageId,
        len: usize,
        recipients: &[UserId],
    ) -> ChunkSubmission {
        ChunkSubmission {
            uploader,
            message_id,
            table: MessageTable::Direct,
            bytes: Bytes::from(vec![7u8; len]),
            recipients: recipients.to_vec(),
        }
    }

    fn progress(events: Vec<ServerEvent>) -> Vec<(f64, bool)> {
        events
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::AttachmentProgress(p) => Some((p.ratio, p.failed)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_progress_ratio_reports_bytes_before_current_chunk() {
        let size = i64::try_from(9 * MIB).unwrap();
        assert_eq!(progress_ratio(0, size), 0.0);
        assert_eq!(progress_ratio(1, size), 4.0 / 9.0);
        assert_eq!(progress_ratio(2, size), 8.0 / 9.0);
        assert_eq!(progress_ratio(5, size), 1.0);
        assert_eq!(progress_ratio(3, 0), 0.0);
    }

    #[tokio::test]
    async fn test_three_chunk_upload_reports_ratios_in_order() {
        let registry = ConnectionRegistry::new();
        let (alice, _, mut alice_rx) = connect(&registry).await;
        let (bob, _, mut bob_rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(9 * MIB).unwrap(),
        );
        let engine = spawn(&registry, &store);
        let recipients = [alice, bob];

        let first = engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &recipients))
            .await
            .unwrap();
        let second = engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &recipients))
            .await
            .unwrap();
        assert_eq!(engine.in_flight(alice).await.unwrap(), vec![message_id]);
        let last = engine
            .submit_chunk(chunk(alice, message_id, MIB, &recipients))
            .await
            .unwrap();

        assert_eq!(first, ChunkAck::Progress { ratio: 0.0 });
        assert_eq!(second, ChunkAck::Progress { ratio: 4.0 / 9.0 });
        assert_eq!(last, ChunkAck::Complete);
        assert!(engine.in_flight(alice).await.unwrap().is_empty());

        let expected = vec![
            (0.0, false),
            (4.0 / 9.0, false),
            (8.0 / 9.0, false),
            (1.0, false),
        ];
        assert_eq!(progress(drain(&mut alice_rx)), expected);
        assert_eq!(progress(drain(&mut bob_rx)), expected);

        // Head row id is the message id; the chain ends at the 1 MiB chunk.
        let head = store
            .chunk(MessageTable::Direct, ChunkId::from(message_id))
            .unwrap();
        let middle = store.chunk(MessageTable::Direct, head.next.unwrap()).unwrap();
        let tail = store.chunk(MessageTable::Direct, middle.next.unwrap()).unwrap();
        assert_eq!(tail.bytes.len(), MIB);
        assert_eq!(tail.next, None);
        assert_eq!(store.chunk_count(message_id), 3);
        assert_eq!(
            store.metadata(MessageTable::Direct, message_id).unwrap().ratio,
            1.0
        );
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected_without_mutation() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(MessageTable::Direct, message_id, 100);
        let engine = spawn(&registry, &store);

        let err = engine
            .submit_chunk(chunk(alice, message_id, CHUNK_SIZE + 1, &[alice]))
            .await
            .unwrap_err();

        assert!(matches!(err, RtcError::ChunkTooLarge { len } if len == CHUNK_SIZE + 1));
        assert!(store.operations().is_empty());
        assert!(engine.in_flight(alice).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_upload_is_swept_and_late_chunks_rejected() {
        let registry = ConnectionRegistry::new();
        let (alice, _, mut alice_rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(9 * MIB).unwrap(),
        );
        let engine = spawn(&registry, &store);

        engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap();
        drain(&mut alice_rx);

        tokio::time::advance(Duration::from_secs(15)).await;
        let late = engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap_err();

        assert!(matches!(late, RtcError::UploadTimedOut(id) if id == message_id));
        assert!(store.metadata(MessageTable::Direct, message_id).unwrap().failed);
        assert_eq!(store.chunk_count(message_id), 0);
        assert_eq!(progress(drain(&mut alice_rx)), vec![(0.0, true)]);
        assert!(engine.in_flight(alice).await.unwrap().is_empty());

        // After the tombstone is purged the failed flag still rejects.
        tokio::time::advance(Duration::from_secs(15)).await;
        let later = engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap_err();
        assert!(matches!(later, RtcError::AttachmentFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_upload_survives_sweep() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(12 * MIB).unwrap(),
        );
        let engine = spawn(&registry, &store);

        engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(engine.in_flight(alice).await.unwrap(), vec![message_id]);
        assert!(!store.metadata(MessageTable::Direct, message_id).unwrap().failed);
    }

    #[tokio::test]
    async fn test_delete_walks_chain_from_head_in_order() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(MessageTable::Room, message_id, 10);
        let a = ChunkId::from(message_id);
        let b = ChunkId::new();
        let c = ChunkId::new();
        for (id, next) in [(a, Some(b)), (b, Some(c)), (c, None)] {
            store.insert_raw_chunk(
                MessageTable::Room,
                NewChunk {
                    id,
                    message_id,
                    bytes: Bytes::from_static(b"x"),
                    next,
                },
            );
        }
        let engine = spawn(&registry, &store);

        engine.delete(alice, message_id).await.unwrap();

        assert_eq!(
            store.operations(),
            vec![
                StoreOp::DeleteMetadata(message_id),
                StoreOp::DeleteChunk(a),
                StoreOp::DeleteChunk(b),
                StoreOp::DeleteChunk(c),
            ]
        );
        assert!(store.metadata(MessageTable::Room, message_id).is_none());
    }

    #[tokio::test]
    async fn test_missing_row_in_completed_chain_is_reported() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(MessageTable::Direct, message_id, 10);
        let missing = ChunkId::new();
        store.insert_raw_chunk(
            MessageTable::Direct,
            NewChunk {
                id: ChunkId::from(message_id),
                message_id,
                bytes: Bytes::from_static(b"x"),
                next: Some(missing),
            },
        );
        store
            .set_ratio(MessageTable::Direct, message_id, 1.0)
            .await
            .unwrap();
        let engine = spawn(&registry, &store);

        let err = engine.delete(alice, message_id).await.unwrap_err();
        assert!(matches!(
            err,
            RtcError::ChunkChainBroken { chunk_id, .. } if chunk_id == missing
        ));
    }

    #[tokio::test]
    async fn test_delete_of_unknown_message_is_rejected() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let store = InMemoryStore::new();
        let engine = spawn(&registry, &store);

        let err = engine.delete(alice, MessageId::new()).await.unwrap_err();
        assert!(matches!(err, RtcError::MessageNotFound(_)));
        assert!(store.operations().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_in_flight_upload_stops_at_reserved_chunk() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(9 * MIB).unwrap(),
        );
        let engine = spawn(&registry, &store);
        for _ in 0..2 {
            engine
                .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
                .await
                .unwrap();
        }

        engine.delete(alice, message_id).await.unwrap();

        assert_eq!(store.chunk_count(message_id), 0);
        assert!(engine.in_flight(alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_upload_resumable() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(9 * MIB).unwrap(),
        );
        let engine = spawn(&registry, &store);
        engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap();

        store.fail_operation("message_exists");
        let err = engine.delete(alice, message_id).await.unwrap_err();
        assert!(matches!(err, RtcError::Database(_)));
        assert_eq!(engine.in_flight(alice).await.unwrap(), vec![message_id]);
        assert!(!store.metadata(MessageTable::Direct, message_id).unwrap().failed);
        assert_eq!(store.chunk_count(message_id), 1);

        store.clear_failures();
        let resumed = engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap();
        assert_eq!(resumed, ChunkAck::Progress { ratio: 4.0 / 9.0 });
        assert_eq!(store.chunk_count(message_id), 2);

        engine.delete(alice, message_id).await.unwrap();
        assert_eq!(store.chunk_count(message_id), 0);
        assert!(store.metadata(MessageTable::Direct, message_id).is_none());
        assert!(engine.in_flight(alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_abandoned_upload_stops_at_first_missing_row() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(9 * MIB).unwrap(),
        );
        // One full chunk written, its successor reserved but never written,
        // and no upload entry left to say so.
        let reserved = ChunkId::new();
        store.insert_raw_chunk(
            MessageTable::Direct,
            NewChunk {
                id: ChunkId::from(message_id),
                message_id,
                bytes: Bytes::from(vec![7u8; CHUNK_SIZE]),
                next: Some(reserved),
            },
        );
        let engine = spawn(&registry, &store);

        engine.delete(alice, message_id).await.unwrap();

        assert_eq!(
            store.operations(),
            vec![
                StoreOp::DeleteMetadata(message_id),
                StoreOp::DeleteChunk(ChunkId::from(message_id)),
            ]
        );
        assert_eq!(store.chunk_count(message_id), 0);
    }

    #[tokio::test]
    async fn test_chunk_queued_before_disconnect_is_rejected() {
        let registry = ConnectionRegistry::new();
        let (alice, alice_conn, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(9 * MIB).unwrap(),
        );
        let (handle, engine) = AttachmentEngine::new(
            Arc::clone(&registry),
            store.clone(),
            UploadSettings::default(),
            CancellationToken::new(),
        );

        let queued = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
                    .await
            }
        });
        while engine.receiver.is_empty() {
            tokio::task::yield_now().await;
        }
        registry.unregister(alice_conn).await;
        tokio::spawn(supervise(engine, RestartPolicy::Unbounded));

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, RtcError::NotConnected(user) if user == alice));
        assert!(handle.in_flight(alice).await.unwrap().is_empty());
        assert_eq!(store.chunk_count(message_id), 0);
    }

    #[tokio::test]
    async fn test_store_failure_marks_failed_and_purges_partial_chain() {
        let registry = ConnectionRegistry::new();
        let (alice, _, mut alice_rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(9 * MIB).unwrap(),
        );
        let engine = spawn(&registry, &store);

        engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap();
        store.fail_operation("set_ratio");
        let err = engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap_err();

        assert!(matches!(err, RtcError::Database(_)));
        assert!(store.metadata(MessageTable::Direct, message_id).unwrap().failed);
        assert_eq!(store.chunk_count(message_id), 0);
        assert_eq!(progress(drain(&mut alice_rx)), vec![(0.0, false), (0.0, true)]);
        assert!(engine.in_flight(alice).await.unwrap().is_empty());

        store.clear_failures();
        let retry = engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice]))
            .await
            .unwrap_err();
        assert!(matches!(retry, RtcError::AttachmentFailed(_)));
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_attachment_is_rejected() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let store = InMemoryStore::new();
        let engine = spawn(&registry, &store);

        let err = engine
            .submit_chunk(chunk(alice, MessageId::new(), 10, &[alice]))
            .await
            .unwrap_err();
        assert!(matches!(err, RtcError::AttachmentNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(MessageTable::Direct, message_id, 10);
        store.set_latency(Some(Duration::from_secs(10)));
        let engine = spawn(&registry, &store);

        let err = engine
            .submit_chunk(chunk(alice, message_id, 10, &[alice]))
            .await
            .unwrap_err();
        assert!(matches!(err, RtcError::DatabaseTimeout("attachment_metadata")));
    }

    #[tokio::test]
    async fn test_disconnect_discards_in_flight_uploads() {
        let registry = ConnectionRegistry::new();
        let (alice, alice_conn, _alice_rx) = connect(&registry).await;
        let (bob, _, mut bob_rx) = connect(&registry).await;
        let message_id = MessageId::new();
        let store = InMemoryStore::new().with_message(
            MessageTable::Direct,
            message_id,
            i64::try_from(9 * MIB).unwrap(),
        );
        let engine = spawn(&registry, &store);
        engine
            .submit_chunk(chunk(alice, message_id, 4 * MIB, &[alice, bob]))
            .await
            .unwrap();
        drain(&mut bob_rx);

        registry.unregister(alice_conn).await;

        assert!(engine.in_flight(alice).await.unwrap().is_empty());
        assert_eq!(store.chunk_count(message_id), 0);
        assert!(store.metadata(MessageTable::Direct, message_id).unwrap().failed);
        assert_eq!(progress(drain(&mut bob_rx)), vec![(0.0, true)]);
    }
}
