//! Call coordinator.
//!
//! State machine for 1-to-1 calls. Per user: idle, pending (as caller or
//! called), or active. Invariants held by this actor:
//!
//! - at most one pending call per caller, and a user is the target of at
//!   most one pending call;
//! - a user appears in at most one active call, as caller or called;
//! - `active` (caller to called) and `active_by_called` are exact inverses.
//!
//! Pending calls expire through a `DelayQueue` polled by the actor loop.
//! Each entry carries the generation of the pending call it was scheduled
//! for, and an expiry for a replaced or resolved call is ignored.

use std::collections::{HashMap, HashSet};
use std::future::{poll_fn, Future};
use std::sync::Arc;
use std::time::Duration;

use common::types::UserId;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, instrument, warn};

use super::messages::{CallMessage, CallState};
use super::registry::ConnectionRegistry;
use super::supervisor::{reply, supervise, RestartPolicy, Supervised, SupervisorExit};
use crate::errors::RtcError;
use crate::events::{CallPair, Empty, MediaOptions, MediaUpdate, RelayedSignal, ServerEvent, Signal};
use crate::observability::metrics;

/// Mailbox capacity.
pub const CALL_CHANNEL_BUFFER: usize = 256;

/// Default time a call may ring before it is treated as not accepted.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
pub struct CallSettings {
    pub pending_timeout: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }
}

/// Handle to the call coordinator.
#[derive(Debug, Clone)]
pub struct CallCoordinatorHandle {
    sender: mpsc::Sender<CallMessage>,
    cancel_token: CancellationToken,
}

impl CallCoordinatorHandle {
    /// Spawn a supervised call coordinator.
    #[must_use]
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        settings: CallSettings,
        policy: RestartPolicy,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<SupervisorExit>) {
        let (handle, actor) = CallCoordinator::new(registry, settings, cancel_token);
        let task = tokio::spawn(supervise(actor, policy));
        (handle, task)
    }

    pub async fn initiate(&self, caller: UserId, called: UserId) -> Result<(), RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallMessage::Initiate {
            caller,
            called,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn respond(
        &self,
        caller: UserId,
        called: UserId,
        accept: bool,
    ) -> Result<(), RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallMessage::Respond {
            caller,
            called,
            accept,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn leave(&self, user_id: UserId) -> Result<(), RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallMessage::Leave {
            user_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn offer(
        &self,
        caller: UserId,
        signal: Signal,
        media: MediaOptions,
    ) -> Result<(), RtcError> {
        self.send(CallMessage::Offer {
            caller,
            signal,
            media,
        })
        .await
    }

    pub async fn answer(
        &self,
        called: UserId,
        signal: Signal,
        media: MediaOptions,
    ) -> Result<(), RtcError> {
        self.send(CallMessage::Answer {
            called,
            signal,
            media,
        })
        .await
    }

    pub async fn request_reinitialization(&self, called: UserId) -> Result<(), RtcError> {
        self.send(CallMessage::RequestReinitialization { called })
            .await
    }

    pub async fn update_media_options(
        &self,
        user_id: UserId,
        media: MediaOptions,
    ) -> Result<(), RtcError> {
        self.send(CallMessage::UpdateMediaOptions { user_id, media })
            .await
    }

    pub async fn get_state(&self) -> Result<CallState, RtcError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallMessage::GetState { respond_to: tx }).await?;
        rx.await
            .map_err(|e| RtcError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn send(&self, message: CallMessage) -> Result<(), RtcError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| RtcError::Internal(format!("channel send failed: {e}")))
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingCall {
    called: UserId,
    generation: u64,
}

pub struct CallCoordinator {
    receiver: mpsc::Receiver<CallMessage>,
    disconnects: broadcast::Receiver<UserId>,
    disconnects_open: bool,
    registry: Arc<ConnectionRegistry>,
    settings: CallSettings,
    cancel_token: CancellationToken,
    /// Caller to pending call.
    pending: HashMap<UserId, PendingCall>,
    /// Caller to called.
    active: HashMap<UserId, UserId>,
    /// Called to caller.
    active_by_called: HashMap<UserId, UserId>,
    timeouts: DelayQueue<(UserId, u64)>,
    next_generation: u64,
}

impl CallCoordinator {
    /// Build an unspawned coordinator and its handle.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        settings: CallSettings,
        cancel_token: CancellationToken,
    ) -> (CallCoordinatorHandle, Self) {
        let (sender, receiver) = mpsc::channel(CALL_CHANNEL_BUFFER);
        let handle = CallCoordinatorHandle {
            sender,
            cancel_token: cancel_token.clone(),
        };
        let actor = Self {
            receiver,
            disconnects: registry.subscribe_disconnects(),
            disconnects_open: true,
            registry,
            settings,
            cancel_token,
            pending: HashMap::new(),
            active: HashMap::new(),
            active_by_called: HashMap::new(),
            timeouts: DelayQueue::new(),
            next_generation: 0,
        };
        (handle, actor)
    }

    #[instrument(skip_all, name = "rtc.actor.calls")]
    async fn run_loop(&mut self) -> Result<(), RtcError> {
        info!(target: "rtc.actor.calls", "Call coordinator started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(target: "rtc.actor.calls", "Call coordinator received cancellation signal");
                    return Ok(());
                }

                Some(expired) = poll_fn(|cx| self.timeouts.poll_expired(cx)) => {
                    let (caller, generation) = expired.into_inner();
                    self.expire_pending(caller, generation).await;
                }

                disconnect = self.disconnects.recv(), if self.disconnects_open => {
                    match disconnect {
                        Ok(user_id) => self.handle_disconnect(user_id).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(target: "rtc.actor.calls", missed, "Disconnect notifications lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.disconnects_open = false;
                        }
                    }
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        info!(target: "rtc.actor.calls", "Call coordinator channel closed, exiting");
                        return Ok(());
                    };
                    metrics::set_actor_mailbox_depth(Self::NAME, self.receiver.len());
                    self.handle_message(message).await?;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: CallMessage) -> Result<(), RtcError> {
        match message {
            CallMessage::Initiate {
                caller,
                called,
                respond_to,
            } => {
                let result = self.initiate(caller, called).await;
                reply(respond_to, result)?;
            }
            CallMessage::Respond {
                caller,
                called,
                accept,
                respond_to,
            } => {
                let result = self.respond(caller, called, accept).await;
                reply(respond_to, result)?;
            }
            CallMessage::Leave {
                user_id,
                respond_to,
            } => {
                let result = match self.end_active_call_of(user_id).await {
                    Some(_) => Ok(()),
                    None => Err(RtcError::CallNotFound(format!("{user_id} is not in a call"))),
                };
                reply(respond_to, result)?;
            }
            CallMessage::Offer {
                caller,
                signal,
                media,
            } => match self.active.get(&caller).copied() {
                Some(called) => {
                    self.registry
                        .send_to_user(
                            called,
                            ServerEvent::CallWebrtcOfferFromInitiator(RelayedSignal { signal, media }),
                        )
                        .await;
                }
                None => debug!(target: "rtc.actor.calls", caller = %caller, "Offer without active call dropped"),
            },
            CallMessage::Answer {
                called,
                signal,
                media,
            } => match self.active_by_called.get(&called).copied() {
                Some(caller) => {
                    self.registry
                        .send_to_user(
                            caller,
                            ServerEvent::CallWebrtcAnswerFromRecipient(RelayedSignal { signal, media }),
                        )
                        .await;
                }
                None => debug!(target: "rtc.actor.calls", called = %called, "Answer without active call dropped"),
            },
            CallMessage::RequestReinitialization { called } => {
                match self.active_by_called.get(&called).copied() {
                    Some(caller) => {
                        self.registry
                            .send_to_user(
                                caller,
                                ServerEvent::CallWebrtcRequestedReinitialization(Empty {}),
                            )
                            .await;
                    }
                    None => debug!(
                        target: "rtc.actor.calls",
                        called = %called,
                        "Re-initialization without active call dropped"
                    ),
                }
            }
            CallMessage::UpdateMediaOptions { user_id, media } => {
                match self.partner_of(user_id) {
                    Some(partner) => {
                        self.registry
                            .send_to_user(
                                partner,
                                ServerEvent::UpdateMediaOptionsOut(MediaUpdate { uid: user_id, media }),
                            )
                            .await;
                    }
                    None => debug!(
                        target: "rtc.actor.calls",
                        user_id = %user_id,
                        "Media update without active call dropped"
                    ),
                }
            }
            CallMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
        Ok(())
    }

    async fn initiate(&mut self, caller: UserId, called: UserId) -> Result<(), RtcError> {
        if caller == called {
            return Err(RtcError::BadRequest("cannot call yourself".to_string()));
        }
        // A request queued before the caller's disconnect is answered after
        // the cleanup; it must not leave a pending call behind.
        if !self.registry.is_online(caller).await {
            return Err(RtcError::NotConnected(caller));
        }
        let already_ringing = self
            .pending
            .iter()
            .any(|(other, pending)| *other != caller && pending.called == called);
        if already_ringing {
            return Err(RtcError::Conflict(
                "user already has a pending call".to_string(),
            ));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let previous = self.pending.insert(caller, PendingCall { called, generation });

        if let Some(previous) = previous.filter(|p| p.called != called) {
            debug!(
                target: "rtc.actor.calls",
                caller = %caller,
                previous = %previous.called,
                "Pending call replaced"
            );
            self.registry
                .send_to_users(
                    &[previous.called, caller],
                    ServerEvent::call_response(caller, previous.called, false),
                )
                .await;
        }

        self.registry
            .send_to_users(
                &[called, caller],
                ServerEvent::CallUserAcknowledge(CallPair { caller, called }),
            )
            .await;
        self.timeouts
            .insert((caller, generation), self.settings.pending_timeout);
        self.publish_gauges();
        Ok(())
    }

    async fn expire_pending(&mut self, caller: UserId, generation: u64) {
        let is_current = self
            .pending
            .get(&caller)
            .is_some_and(|pending| pending.generation == generation);
        if !is_current {
            return;
        }
        if let Some(pending) = self.pending.remove(&caller) {
            info!(
                target: "rtc.actor.calls",
                caller = %caller,
                called = %pending.called,
                "Pending call timed out"
            );
            self.registry
                .send_to_users(
                    &[pending.called, caller],
                    ServerEvent::call_response(caller, pending.called, false),
                )
                .await;
            self.publish_gauges();
        }
    }

    async fn respond(
        &mut self,
        caller: UserId,
        called: UserId,
        accept: bool,
    ) -> Result<(), RtcError> {
        let matches = self
            .pending
            .get(&caller)
            .is_some_and(|pending| pending.called == called);
        if !matches {
            return Err(RtcError::CallNotFound(format!(
                "no pending call from {caller} to {called}"
            )));
        }
        self.pending.remove(&caller);

        if !accept {
            self.registry
                .send_to_users(&[called, caller], ServerEvent::call_response(caller, called, false))
                .await;
            self.publish_gauges();
            return Ok(());
        }

        self.end_active_call_of(caller).await;
        self.end_active_call_of(called).await;
        if self.partner_of(caller).is_some() || self.partner_of(called).is_some() {
            return Err(RtcError::ActorFault(
                "participant still in a call after teardown".to_string(),
            ));
        }

        self.active.insert(caller, called);
        self.active_by_called.insert(called, caller);
        info!(target: "rtc.actor.calls", caller = %caller, called = %called, "Call started");

        self.registry
            .send_to_users(&[called, caller], ServerEvent::call_response(caller, called, true))
            .await;
        self.publish_gauges();
        Ok(())
    }

    /// End the user's active call, notifying the other party. Returns the
    /// other party if there was a call.
    async fn end_active_call_of(&mut self, user_id: UserId) -> Option<UserId> {
        let partner = self.take_active_call_of(user_id)?;
        self.registry
            .send_to_user(partner, ServerEvent::call_left())
            .await;
        self.publish_gauges();
        Some(partner)
    }

    /// Remove the user's active call from both indexes without notifying.
    fn take_active_call_of(&mut self, user_id: UserId) -> Option<UserId> {
        let partner = if let Some(called) = self.active.remove(&user_id) {
            self.active_by_called.remove(&called);
            called
        } else {
            let caller = self.active_by_called.remove(&user_id)?;
            self.active.remove(&caller);
            caller
        };
        info!(target: "rtc.actor.calls", user_id = %user_id, partner = %partner, "Call ended");
        Some(partner)
    }

    fn partner_of(&self, user_id: UserId) -> Option<UserId> {
        self.active
            .get(&user_id)
            .or_else(|| self.active_by_called.get(&user_id))
            .copied()
    }

    /// Drop every pending and active call involving the user, then notify
    /// each counterparty once. An active partner gets `CALL_LEFT` even if
    /// they also had a pending call with the user.
    async fn handle_disconnect(&mut self, user_id: UserId) {
        let partner = self.take_active_call_of(user_id);

        // (caller, called) of each pending call the user was part of.
        let mut declined: Vec<(UserId, UserId)> = Vec::new();
        if let Some(pending) = self.pending.remove(&user_id) {
            declined.push((user_id, pending.called));
        }
        let ringing_callers: Vec<UserId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.called == user_id)
            .map(|(caller, _)| *caller)
            .collect();
        for caller in ringing_callers {
            self.pending.remove(&caller);
            declined.push((caller, user_id));
        }

        let mut notified: HashSet<UserId> = HashSet::new();
        if let Some(partner) = partner {
            notified.insert(partner);
            self.registry
                .send_to_user(partner, ServerEvent::call_left())
                .await;
        }
        for (caller, called) in declined {
            let counterparty = if caller == user_id { called } else { caller };
            if notified.insert(counterparty) {
                self.registry
                    .send_to_user(counterparty, ServerEvent::call_response(caller, called, false))
                    .await;
            }
        }

        self.publish_gauges();
    }

    fn snapshot(&self) -> CallState {
        let mut pending: Vec<(UserId, UserId)> = self
            .pending
            .iter()
            .map(|(caller, pending)| (*caller, pending.called))
            .collect();
        let mut active: Vec<(UserId, UserId)> = self
            .active
            .iter()
            .map(|(caller, called)| (*caller, *called))
            .collect();
        pending.sort();
        active.sort();
        CallState { pending, active }
    }

    fn publish_gauges(&self) {
        metrics::set_calls(self.pending.len(), self.active.len());
    }
}

impl Supervised for CallCoordinator {
    const NAME: &'static str = "calls";

    fn run(&mut self) -> impl Future<Output = Result<(), RtcError>> + Send {
        self.run_loop()
    }

    /// Rebuild the reverse index from the primary map, dropping any active
    /// call whose called party is already claimed by another call.
    fn on_restart(&mut self) {
        self.active_by_called.clear();
        let mut conflicting = Vec::new();
        for (caller, called) in &self.active {
            if self.active_by_called.contains_key(called) || self.active.contains_key(called) {
                conflicting.push(*caller);
            } else {
                self.active_by_called.insert(*called, *caller);
            }
        }
        for caller in conflicting {
            warn!(target: "rtc.actor.calls", caller = %caller, "Dropping inconsistent active call");
            self.active.remove(&caller);
        }
        self.publish_gauges();
    }
}
