//! Channel mesh presence.
//!
//! Tracks who is connected to each voice/video channel's full mesh and the
//! media metadata they announced. Joiners receive the current peer list and
//! then signal each peer individually; the actor relays those signals and
//! fans out join, leave and media updates.
//!
//! Mesh peers are notified directly. Room-level presence goes to the
//! `channel:<id>` topic, whose subscribers are managed by the transport
//! layer. The owning room is looked up once per channel entry.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::types::{ChannelId, RoomId, UserId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::messages::ChannelMeshMessage;
use super::registry::{channel_topic, ConnectionRegistry};
use super::supervisor::{supervise, RestartPolicy, Supervised, SupervisorExit};
use crate::errors::RtcError;
use crate::events::{
    ChannelPeer, ChannelReturnSignal, ChannelSignal, ChannelUsers, MediaOptions, MediaUpdate,
    PeerLeft, RoomChannelPresence, ServerEvent, Signal,
};
use crate::observability::metrics;
use crate::repositories::{bounded, ChannelDirectory};

/// Mailbox capacity.
pub const CHANNEL_MESH_BUFFER: usize = 256;

/// Handle to the channel mesh actor.
#[derive(Debug, Clone)]
pub struct ChannelMeshHandle {
    sender: mpsc::Sender<ChannelMeshMessage>,
    cancel_token: CancellationToken,
}

impl ChannelMeshHandle {
    /// Spawn a supervised channel mesh actor.
    #[must_use]
    pub fn spawn<D: ChannelDirectory>(
        registry: Arc<ConnectionRegistry>,
        directory: D,
        db_timeout: Duration,
        policy: RestartPolicy,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<SupervisorExit>) {
        let (handle, actor) = ChannelMesh::new(registry, directory, db_timeout, cancel_token);
        let task = tokio::spawn(supervise(actor, policy));
        (handle, task)
    }

    /// Join a channel. Returns the peers the joiner must signal.
    pub async fn join(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        media: MediaOptions,
    ) -> Result<Vec<ChannelPeer>, RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelMeshMessage::Join {
            channel_id,
            user_id,
            media,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave a channel. Returns whether the user was a member.
    pub async fn leave(&self, channel_id: ChannelId, user_id: UserId) -> Result<bool, RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelMeshMessage::Leave {
            channel_id,
            user_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn signal(
        &self,
        from: UserId,
        to: UserId,
        signal: Signal,
        media: MediaOptions,
    ) -> Result<(), RtcError> {
        self.send(ChannelMeshMessage::Signal {
            from,
            to,
            signal,
            media,
        })
        .await
    }

    pub async fn return_signal(
        &self,
        from: UserId,
        to: UserId,
        signal: Signal,
        media: MediaOptions,
    ) -> Result<(), RtcError> {
        self.send(ChannelMeshMessage::ReturnSignal {
            from,
            to,
            signal,
            media,
        })
        .await
    }

    pub async fn members(&self, channel_id: ChannelId) -> Result<HashSet<UserId>, RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelMeshMessage::GetMembers {
            channel_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn update_media_options(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        media: MediaOptions,
    ) -> Result<(), RtcError> {
        self.send(ChannelMeshMessage::UpdateMediaOptions {
            channel_id,
            user_id,
            media,
        })
        .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn send(&self, message: ChannelMeshMessage) -> Result<(), RtcError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| RtcError::Internal(format!("channel send failed: {e}")))
    }
}

#[derive(Debug, Default)]
struct Channel {
    room_id: Option<RoomId>,
    members: HashMap<UserId, MediaOptions>,
}

impl Channel {
    /// Members other than `user_id`, ordered by id.
    fn peers_of(&self, user_id: UserId) -> Vec<ChannelPeer> {
        let mut peers: Vec<ChannelPeer> = self
            .members
            .iter()
            .filter(|(uid, _)| **uid != user_id)
            .map(|(uid, media)| ChannelPeer {
                uid: *uid,
                media: media.clone(),
            })
            .collect();
        peers.sort_by_key(|peer| peer.uid);
        peers
    }

    fn peer_ids_of(&self, user_id: UserId) -> Vec<UserId> {
        self.members
            .keys()
            .filter(|uid| **uid != user_id)
            .copied()
            .collect()
    }
}

pub struct ChannelMesh<D> {
    receiver: mpsc::Receiver<ChannelMeshMessage>,
    disconnects: broadcast::Receiver<UserId>,
    disconnects_open: bool,
    registry: Arc<ConnectionRegistry>,
    directory: D,
    db_timeout: Duration,
    cancel_token: CancellationToken,
    channels: HashMap<ChannelId, Channel>,
}

impl<D: ChannelDirectory> ChannelMesh<D> {
    /// Build an unspawned actor and its handle.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: D,
        db_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> (ChannelMeshHandle, Self) {
        let (sender, receiver) = mpsc::channel(CHANNEL_MESH_BUFFER);
        let handle = ChannelMeshHandle {
            sender,
            cancel_token: cancel_token.clone(),
        };
        let actor = Self {
            receiver,
            disconnects: registry.subscribe_disconnects(),
            disconnects_open: true,
            registry,
            directory,
            db_timeout,
            cancel_token,
            channels: HashMap::new(),
        };
        (handle, actor)
    }

    #[instrument(skip_all, name = "rtc.actor.channel_mesh")]
    async fn run_loop(&mut self) -> Result<(), RtcError> {
        info!(target: "rtc.actor.channel_mesh", "Channel mesh started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(target: "rtc.actor.channel_mesh", "Channel mesh received cancellation signal");
                    return Ok(());
                }

                disconnect = self.disconnects.recv(), if self.disconnects_open => {
                    match disconnect {
                        Ok(user_id) => self.handle_disconnect(user_id).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(target: "rtc.actor.channel_mesh", missed, "Disconnect notifications lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.disconnects_open = false;
                        }
                    }
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        info!(target: "rtc.actor.channel_mesh", "Channel mesh channel closed, exiting");
                        return Ok(());
                    };
                    metrics::set_actor_mailbox_depth(Self::NAME, self.receiver.len());
                    self.handle_message(message).await;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: ChannelMeshMessage) {
        match message {
            ChannelMeshMessage::Join {
                channel_id,
                user_id,
                media,
                respond_to,
            } => {
                let result = self.join(channel_id, user_id, media).await;
                let _ = respond_to.send(result);
            }
            ChannelMeshMessage::Leave {
                channel_id,
                user_id,
                respond_to,
            } => {
                let left = self.leave(channel_id, user_id).await;
                let _ = respond_to.send(left);
            }
            ChannelMeshMessage::Signal {
                from,
                to,
                signal,
                media,
            } => {
                self.registry
                    .send_to_user(
                        to,
                        ServerEvent::ChannelWebrtcJoined(ChannelSignal {
                            caller_id: from,
                            signal,
                            media,
                        }),
                    )
                    .await;
            }
            ChannelMeshMessage::ReturnSignal {
                from,
                to,
                signal,
                media,
            } => {
                self.registry
                    .send_to_user(
                        to,
                        ServerEvent::ChannelWebrtcReturnSignalOut(ChannelReturnSignal {
                            uid: from,
                            signal,
                            media,
                        }),
                    )
                    .await;
            }
            ChannelMeshMessage::GetMembers {
                channel_id,
                respond_to,
            } => {
                let members = self
                    .channels
                    .get(&channel_id)
                    .map(|channel| channel.members.keys().copied().collect())
                    .unwrap_or_default();
                let _ = respond_to.send(members);
            }
            ChannelMeshMessage::UpdateMediaOptions {
                channel_id,
                user_id,
                media,
            } => self.update_media_options(channel_id, user_id, media).await,
        }
    }

    async fn join(
        &mut self,
        channel_id: ChannelId,
        user_id: UserId,
        media: MediaOptions,
    ) -> Result<Vec<ChannelPeer>, RtcError> {
        if !self.registry.is_online(user_id).await {
            return Err(RtcError::NotConnected(user_id));
        }
        if !self.channels.contains_key(&channel_id) {
            let room_id = self.lookup_room(channel_id).await;
            self.channels.insert(
                channel_id,
                Channel {
                    room_id,
                    members: HashMap::new(),
                },
            );
        }
        let channel = self.channels.entry(channel_id).or_default();

        if channel.members.is_empty() {
            channel.members.insert(user_id, media);
            debug!(target: "rtc.actor.channel_mesh", channel_id = %channel_id, user_id = %user_id, "First member joined");
            self.registry
                .send_to_user(
                    user_id,
                    ServerEvent::ChannelWebrtcAllUsers(ChannelUsers { users: Vec::new() }),
                )
                .await;
            self.publish_gauges();
            return Ok(Vec::new());
        }

        let peers = channel.peers_of(user_id);
        let newly_joined = !channel.members.contains_key(&user_id);
        let room_id = channel.room_id;
        if newly_joined {
            channel.members.insert(user_id, media);
        }

        self.registry
            .send_to_user(
                user_id,
                ServerEvent::ChannelWebrtcAllUsers(ChannelUsers {
                    users: peers.clone(),
                }),
            )
            .await;
        if newly_joined {
            debug!(
                target: "rtc.actor.channel_mesh",
                channel_id = %channel_id,
                user_id = %user_id,
                peers = peers.len(),
                "Member joined"
            );
            self.registry
                .send_to_topic(
                    &channel_topic(channel_id),
                    ServerEvent::RoomChannelWebrtcUserJoined(RoomChannelPresence {
                        channel_id,
                        room_id,
                        uid: user_id,
                    }),
                )
                .await;
            self.publish_gauges();
        }
        Ok(peers)
    }

    async fn leave(&mut self, channel_id: ChannelId, user_id: UserId) -> bool {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        if !channel.members.contains_key(&user_id) {
            return false;
        }
        let peers = channel.peer_ids_of(user_id);
        let room_id = channel.room_id;
        channel.members.remove(&user_id);

        debug!(target: "rtc.actor.channel_mesh", channel_id = %channel_id, user_id = %user_id, "Member left");
        self.notify_left(channel_id, room_id, user_id, &peers).await;
        self.publish_gauges();
        true
    }

    async fn notify_left(
        &self,
        channel_id: ChannelId,
        room_id: Option<RoomId>,
        user_id: UserId,
        peers: &[UserId],
    ) {
        self.registry
            .send_to_users(peers, ServerEvent::ChannelWebrtcLeft(PeerLeft { uid: user_id }))
            .await;
        self.registry
            .send_to_topic(
                &channel_topic(channel_id),
                ServerEvent::RoomChannelWebrtcUserLeft(RoomChannelPresence {
                    channel_id,
                    room_id,
                    uid: user_id,
                }),
            )
            .await;
    }

    async fn update_media_options(
        &mut self,
        channel_id: ChannelId,
        user_id: UserId,
        media: MediaOptions,
    ) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        let Some(stored) = channel.members.get_mut(&user_id) else {
            debug!(target: "rtc.actor.channel_mesh", user_id = %user_id, "Media update from non-member dropped");
            return;
        };
        stored.clone_from(&media);
        let peers = channel.peer_ids_of(user_id);
        self.registry
            .send_to_users(
                &peers,
                ServerEvent::UpdateMediaOptionsOut(MediaUpdate { uid: user_id, media }),
            )
            .await;
    }

    async fn handle_disconnect(&mut self, user_id: UserId) {
        let mut departures = Vec::new();
        for (channel_id, channel) in &mut self.channels {
            if channel.members.remove(&user_id).is_some() {
                let peers: Vec<UserId> = channel.members.keys().copied().collect();
                departures.push((*channel_id, channel.room_id, peers));
            }
        }
        if departures.is_empty() {
            return;
        }

        info!(
            target: "rtc.actor.channel_mesh",
            user_id = %user_id,
            channels = departures.len(),
            "Removed disconnected user from channels"
        );
        for (channel_id, room_id, peers) in departures {
            self.notify_left(channel_id, room_id, user_id, &peers).await;
        }
        self.publish_gauges();
    }

    async fn lookup_room(&self, channel_id: ChannelId) -> Option<RoomId> {
        match bounded(self.db_timeout, "room_of", self.directory.room_of(channel_id)).await {
            Ok(Some(room_id)) => Some(room_id),
            Ok(None) => {
                warn!(target: "rtc.actor.channel_mesh", channel_id = %channel_id, "Channel has no owning room");
                None
            }
            Err(e) => {
                warn!(target: "rtc.actor.channel_mesh", channel_id = %channel_id, error = %e, "Room lookup failed");
                None
            }
        }
    }

    fn publish_gauges(&self) {
        let participants = self.channels.values().map(|c| c.members.len()).sum();
        metrics::set_channel_participants(participants);
    }
}

impl<D: ChannelDirectory> Supervised for ChannelMesh<D> {
    const NAME: &'static str = "channel_mesh";

    fn run(&mut self) -> impl Future<Output = Result<(), RtcError>> + Send {
        self.run_loop()
    }
}
