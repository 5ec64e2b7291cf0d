//! Actor supervision.
//!
//! An actor's `run` consumes its mailbox until it is cancelled or the
//! mailbox closes (`Ok`), or until a message handler reports an internal
//! fault (`Err`). The supervisor owns the actor across runs: it logs the
//! fault, lets the actor repair derived state in `on_restart`, and runs it
//! again while the policy allows.
//!
//! A panic inside `run` is caught at the same boundary and handled as a
//! fault: it counts against the restart budget and `on_restart` repairs
//! whatever the interrupted handler left half-done.
//!
//! Request-level errors never reach the supervisor; those are answered on
//! the requester's reply channel.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};

use crate::errors::RtcError;
use crate::observability::metrics;

/// How many faults an actor may recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Stop permanently after this many restarts.
    Bounded(u32),
    Unbounded,
}

impl RestartPolicy {
    fn allows(self, restarts_so_far: u32) -> bool {
        match self {
            RestartPolicy::Bounded(limit) => restarts_so_far < limit,
            RestartPolicy::Unbounded => true,
        }
    }
}

/// Why a supervisor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Actor stopped cleanly (cancelled or mailbox closed).
    Completed,
    /// Fault after the restart budget was spent; the actor is stopped.
    RestartLimitReached { restarts: u32 },
}

pub trait Supervised: Send + Sized + 'static {
    /// Metric label and log name.
    const NAME: &'static str;

    /// Process messages until stop or fault.
    fn run(&mut self) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Called before running again after a fault or panic.
    fn on_restart(&mut self) {}
}

/// Answer a request. A fault is answered as an internal error and handed
/// back so the actor loop can return it to the supervisor.
pub(crate) fn reply<T>(
    respond_to: oneshot::Sender<Result<T, RtcError>>,
    result: Result<T, RtcError>,
) -> Result<(), RtcError> {
    match result {
        Err(RtcError::ActorFault(reason)) => {
            let _ = respond_to.send(Err(RtcError::Internal(
                "request aborted by actor fault".to_string(),
            )));
            Err(RtcError::ActorFault(reason))
        }
        other => {
            let _ = respond_to.send(other);
            Ok(())
        }
    }
}

#[instrument(skip_all, name = "rtc.supervisor", fields(actor = A::NAME))]
pub async fn supervise<A: Supervised>(mut actor: A, policy: RestartPolicy) -> SupervisorExit {
    let mut restarts: u32 = 0;

    loop {
        let fault = match AssertUnwindSafe(actor.run()).catch_unwind().await {
            Ok(Ok(())) => {
                info!(target: "rtc.supervisor", actor = A::NAME, "Actor stopped");
                return SupervisorExit::Completed;
            }
            Ok(Err(fault)) => fault,
            Err(_) => {
                error!(target: "rtc.supervisor", actor = A::NAME, "Actor panicked");
                metrics::record_actor_panic(A::NAME);
                RtcError::ActorFault("panicked".to_string())
            }
        };

        if !policy.allows(restarts) {
            error!(
                target: "rtc.supervisor",
                actor = A::NAME,
                restarts,
                error = %fault,
                "Actor fault with no restarts left, stopping permanently"
            );
            return SupervisorExit::RestartLimitReached { restarts };
        }
        restarts += 1;
        warn!(
            target: "rtc.supervisor",
            actor = A::NAME,
            restarts,
            error = %fault,
            "Actor fault, restarting"
        );
        metrics::record_actor_restart(A::NAME);
        actor.on_restart();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyActor {
        faults_left: Option<u32>,
        runs: Arc<AtomicU32>,
        repairs: u32,
        panics_left: u32,
    }

    impl FlakyActor {
        fn new(faults_left: Option<u32>) -> (Self, Arc<AtomicU32>) {
            let runs = Arc::new(AtomicU32::new(0));
            let actor = Self {
                faults_left,
                runs: Arc::clone(&runs),
                repairs: 0,
                panics_left: 0,
            };
            (actor, runs)
        }
    }

    impl Supervised for FlakyActor {
        const NAME: &'static str = "flaky";

        async fn run(&mut self) -> Result<(), RtcError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panics_left > 0 {
                self.panics_left -= 1;
                panic!("boom");
            }
            match self.faults_left.as_mut() {
                None => Err(RtcError::ActorFault("always".into())),
                Some(0) => Ok(()),
                Some(n) => {
                    *n -= 1;
                    Err(RtcError::ActorFault("once".into()))
                }
            }
        }

        fn on_restart(&mut self) {
            self.repairs += 1;
        }
    }

    /// Reports the restart hook count once the wrapped actor completes.
    struct Reporting(FlakyActor, Option<tokio::sync::oneshot::Sender<u32>>);

    impl Supervised for Reporting {
        const NAME: &'static str = "reporting";

        async fn run(&mut self) -> Result<(), RtcError> {
            let outcome = self.0.run().await;
            if outcome.is_ok() {
                if let Some(tx) = self.1.take() {
                    let _ = tx.send(self.0.repairs);
                }
            }
            outcome
        }

        fn on_restart(&mut self) {
            self.0.on_restart();
        }
    }

    #[tokio::test]
    async fn test_bounded_policy_stops_after_limit() {
        let (actor, runs) = FlakyActor::new(None);

        let exit = supervise(actor, RestartPolicy::Bounded(10)).await;

        assert_eq!(exit, SupervisorExit::RestartLimitReached { restarts: 10 });
        // The original run plus ten restarts.
        assert_eq!(runs.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_unbounded_policy_recovers() {
        let (actor, runs) = FlakyActor::new(Some(25));

        let exit = supervise(actor, RestartPolicy::Unbounded).await;

        assert_eq!(exit, SupervisorExit::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 26);
    }

    #[tokio::test]
    async fn test_restart_hook_runs_once_per_fault() {
        let (actor, _runs) = FlakyActor::new(Some(3));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let exit = supervise(Reporting(actor, Some(tx)), RestartPolicy::Unbounded).await;
        assert_eq!(exit, SupervisorExit::Completed);
        assert_eq!(rx.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_budget_stops_on_first_fault() {
        let (actor, runs) = FlakyActor::new(None);
        let exit = supervise(actor, RestartPolicy::Bounded(0)).await;
        assert_eq!(exit, SupervisorExit::RestartLimitReached { restarts: 0 });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_actor_is_restarted() {
        let (mut actor, runs) = FlakyActor::new(Some(0));
        actor.panics_left = 2;
        let (tx, rx) = tokio::sync::oneshot::channel();

        let exit = supervise(Reporting(actor, Some(tx)), RestartPolicy::Unbounded).await;

        assert_eq!(exit, SupervisorExit::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        // Each panic went through the restart hook.
        assert_eq!(rx.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_panics_count_against_bounded_budget() {
        let (mut actor, runs) = FlakyActor::new(Some(0));
        actor.panics_left = u32::MAX;

        let exit = supervise(actor, RestartPolicy::Bounded(2)).await;

        assert_eq!(exit, SupervisorExit::RestartLimitReached { restarts: 2 });
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
