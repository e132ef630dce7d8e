//! Connection lifecycle of a live room session.
//!
//! [`Lifecycle::handle`] is a pure transition function: it takes one
//! [`LifecycleEvent`], updates the state and returns the [`Effect`]s the driver
//! has to carry out. Nothing in here touches a socket or a timer, which is what
//! keeps the reconnect rules testable on their own.
//!
//! Every session gets a generation number. Events carry the generation they were
//! produced under, and events from a superseded session are ignored, so a late
//! close from a socket that was already replaced cannot trigger anything.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::ReconnectPolicy;
use crate::error::{DanmakuError, Result};
use crate::event::{FailureReason, RoomStatus};

/// Where the session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    /// Fetching credentials or opening the socket
    Connecting,
    /// Handshake sent, waiting for the reply
    AwaitingAuth,
    Live,
    /// Socket gone, reconnect decision pending
    Closing,
    /// Waiting out the reconnect delay
    Reconnecting,
    /// Disposed, or the session failed for good
    Terminated,
}

impl ConnectionState {
    /// A session is in progress or being retried.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingAuth | Self::Live | Self::Closing | Self::Reconnecting
        )
    }

    fn has_socket(self) -> bool {
        matches!(self, Self::Connecting | Self::AwaitingAuth | Self::Live)
    }
}

/// Intent flags guarding reconnection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSession {
    pub disposed: bool,
    pub auto_reconnect: bool,
    /// The room the caller wants to be in
    pub room_id: Option<u64>,
    pub reconnect_attempts: u32,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Enter { room_id: u64 },
    /// The socket is open
    Opened { generation: u64 },
    HandshakeAccepted { generation: u64 },
    HandshakeRejected { generation: u64, code: i64 },
    /// Credentials could not be fetched or the socket could not be opened
    ConnectFailed { generation: u64, reason: String },
    /// The socket opened but no handshake reply arrived in time
    HandshakeTimedOut { generation: u64 },
    /// The socket closed or errored
    Closed { generation: u64, reason: String },
    /// The reconnect delay elapsed
    ReconnectDue { generation: u64 },
    Leave,
    Dispose,
}

impl LifecycleEvent {
    fn generation(&self) -> Option<u64> {
        match self {
            Self::Opened { generation }
            | Self::HandshakeAccepted { generation }
            | Self::HandshakeRejected { generation, .. }
            | Self::ConnectFailed { generation, .. }
            | Self::HandshakeTimedOut { generation }
            | Self::Closed { generation, .. }
            | Self::ReconnectDue { generation } => Some(*generation),
            Self::Enter { .. } | Self::Leave | Self::Dispose => None,
        }
    }
}

/// Work the driver performs after a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a socket. `attempt` is 0 for the first connection of a session.
    Connect { generation: u64, attempt: u32 },
    SendHandshake { generation: u64 },
    StartHeartbeat { generation: u64 },
    StopHeartbeat,
    /// Close the socket and drop everything tied to it
    Teardown,
    ScheduleReconnect {
        generation: u64,
        attempt: u32,
        delay: Duration,
    },
    Notify(RoomStatus),
}

/// The connection state machine.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    session: RoomSession,
    policy: ReconnectPolicy,
    generation: u64,
    /// The current session reached `Live` at least once
    established: bool,
}

/// How a lost connection is treated on the attempt `enter_room` started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loss {
    /// Fatal on the initial attempt, retried afterwards
    Setup,
    /// Always goes through the reconnect policy
    Transport,
}

impl Lifecycle {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            session: RoomSession::default(),
            policy,
            generation: 0,
            established: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &RoomSession {
        &self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_room_id(&self) -> Option<u64> {
        self.session.room_id
    }

    pub fn is_live(&self) -> bool {
        self.state == ConnectionState::Live
    }

    /// Whether `room_id` is the room already being served.
    pub fn is_active_in(&self, room_id: u64) -> bool {
        self.state.is_active() && self.session.room_id == Some(room_id)
    }

    /// Apply one event.
    ///
    /// Only `Enter` can fail (after disposal). Events that do not apply to the current
    /// state or generation are ignored and produce no effects.
    pub fn handle(&mut self, event: LifecycleEvent) -> Result<Vec<Effect>> {
        if let Some(generation) = event.generation()
            && generation != self.generation
        {
            trace!(
                generation,
                current = self.generation,
                ?event,
                "Ignoring event from superseded session"
            );
            return Ok(Vec::new());
        }

        let before = self.state;
        let effects = match event {
            LifecycleEvent::Enter { room_id } => self.enter(room_id)?,
            LifecycleEvent::Opened { generation } => self.opened(generation),
            LifecycleEvent::HandshakeAccepted { generation } => self.accepted(generation),
            LifecycleEvent::HandshakeRejected { code, .. } => self.rejected(code),
            LifecycleEvent::ConnectFailed { generation, reason } => {
                self.closed(generation, &reason, Loss::Setup)
            }
            LifecycleEvent::HandshakeTimedOut { generation } => {
                self.closed(generation, "handshake timed out", Loss::Setup)
            }
            LifecycleEvent::Closed { generation, reason } => {
                self.closed(generation, &reason, Loss::Transport)
            }
            LifecycleEvent::ReconnectDue { generation } => self.reconnect_due(generation),
            LifecycleEvent::Leave => self.leave(),
            LifecycleEvent::Dispose => self.dispose(),
        };

        if before != self.state {
            debug!(
                from = ?before,
                to = ?self.state,
                generation = self.generation,
                room_id = ?self.session.room_id,
                "Lifecycle transition"
            );
        }
        Ok(effects)
    }

    fn enter(&mut self, room_id: u64) -> Result<Vec<Effect>> {
        if self.session.disposed {
            return Err(DanmakuError::Disposed);
        }
        if self.is_active_in(room_id) {
            debug!(room_id, "Already in room");
            return Ok(Vec::new());
        }

        let mut effects = if self.state.is_active() {
            self.leave()
        } else {
            Vec::new()
        };

        self.generation += 1;
        self.established = false;
        self.session.room_id = Some(room_id);
        self.session.auto_reconnect = true;
        self.session.reconnect_attempts = 0;
        self.state = ConnectionState::Connecting;
        info!(room_id, generation = self.generation, "Entering room");

        effects.push(Effect::Connect {
            generation: self.generation,
            attempt: 0,
        });
        Ok(effects)
    }

    fn opened(&mut self, generation: u64) -> Vec<Effect> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::AwaitingAuth;
        vec![Effect::SendHandshake { generation }]
    }

    fn accepted(&mut self, generation: u64) -> Vec<Effect> {
        if self.state != ConnectionState::AwaitingAuth {
            return Vec::new();
        }
        let Some(room_id) = self.session.room_id else {
            return Vec::new();
        };
        self.state = ConnectionState::Live;
        self.established = true;
        self.session.reconnect_attempts = 0;
        info!(room_id, generation, "Room is live");
        vec![
            Effect::StartHeartbeat { generation },
            Effect::Notify(RoomStatus::Live { room_id }),
        ]
    }

    fn rejected(&mut self, code: i64) -> Vec<Effect> {
        if !self.state.has_socket() {
            return Vec::new();
        }
        let room_id = self.session.room_id.take();
        self.session.auto_reconnect = false;
        self.state = ConnectionState::Terminated;
        warn!(?room_id, code, "Handshake rejected");

        let mut effects = vec![Effect::StopHeartbeat, Effect::Teardown];
        if let Some(room_id) = room_id {
            effects.push(Effect::Notify(RoomStatus::Failed {
                room_id,
                reason: FailureReason::AuthRejected { code },
            }));
        }
        effects
    }

    /// No reconnect has been tried yet and the session never went live.
    fn is_initial_attempt(&self) -> bool {
        !self.established && self.session.reconnect_attempts == 0
    }

    fn closed(&mut self, generation: u64, reason: &str, loss: Loss) -> Vec<Effect> {
        if !self.state.has_socket() {
            return Vec::new();
        }
        self.state = ConnectionState::Closing;
        debug!(generation, reason, ?loss, "Connection closing");

        let mut effects = vec![Effect::StopHeartbeat, Effect::Teardown];

        if loss == Loss::Setup && self.is_initial_attempt() {
            // Unreachable server or unanswered handshake: `enter_room` reports it.
            self.session.room_id = None;
            self.session.auto_reconnect = false;
            self.state = ConnectionState::Idle;
            return effects;
        }

        let Some(room_id) = self.session.room_id else {
            self.state = ConnectionState::Idle;
            return effects;
        };
        if self.session.disposed || !self.session.auto_reconnect {
            self.state = ConnectionState::Idle;
            return effects;
        }

        let max_attempts = self.policy.max_attempts;
        if self.session.reconnect_attempts < max_attempts {
            self.session.reconnect_attempts += 1;
            let attempt = self.session.reconnect_attempts;
            self.state = ConnectionState::Reconnecting;
            info!(room_id, attempt, max_attempts, reason, "Scheduling reconnect");
            effects.push(Effect::ScheduleReconnect {
                generation,
                attempt,
                delay: self.policy.delay(),
            });
            effects.push(Effect::Notify(RoomStatus::Reconnecting {
                room_id,
                attempt,
                max_attempts,
            }));
        } else {
            let attempts = self.session.reconnect_attempts;
            self.session.room_id = None;
            self.session.auto_reconnect = false;
            self.state = ConnectionState::Terminated;
            warn!(room_id, attempts, "Reconnect attempts exhausted");
            effects.push(Effect::Notify(RoomStatus::Failed {
                room_id,
                reason: FailureReason::ReconnectExhausted { attempts },
            }));
        }
        effects
    }

    fn reconnect_due(&mut self, generation: u64) -> Vec<Effect> {
        if self.state != ConnectionState::Reconnecting {
            return Vec::new();
        }
        // Intent may have changed while the delay ran.
        if self.session.disposed || !self.session.auto_reconnect || self.session.room_id.is_none()
        {
            self.state = ConnectionState::Idle;
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Effect::Connect {
            generation,
            attempt: self.session.reconnect_attempts,
        }]
    }

    fn leave(&mut self) -> Vec<Effect> {
        // Room first, so a close racing the teardown sees nothing to reconnect to.
        let room_id = self.session.room_id.take();
        self.session.auto_reconnect = false;
        let was_active = self.state.is_active();
        if was_active {
            self.state = ConnectionState::Idle;
        }

        let mut effects = Vec::new();
        if was_active {
            effects.push(Effect::StopHeartbeat);
            effects.push(Effect::Teardown);
        }
        if let Some(room_id) = room_id {
            info!(room_id, "Leaving room");
            effects.push(Effect::Notify(RoomStatus::Left { room_id }));
        }
        effects
    }

    fn dispose(&mut self) -> Vec<Effect> {
        if self.session.disposed {
            return Vec::new();
        }
        self.session.disposed = true;
        self.session.auto_reconnect = false;
        let effects = self.leave();
        self.state = ConnectionState::Terminated;
        info!("Disposed");
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            delay_ms: 3000,
        }
    }

    fn handle(lifecycle: &mut Lifecycle, event: LifecycleEvent) -> Vec<Effect> {
        lifecycle.handle(event).unwrap()
    }

    /// Drive a fresh lifecycle into `Live` for `room_id`.
    fn live(room_id: u64) -> (Lifecycle, u64) {
        let mut lifecycle = Lifecycle::new(policy());
        handle(&mut lifecycle, LifecycleEvent::Enter { room_id });
        let generation = lifecycle.generation();
        handle(&mut lifecycle, LifecycleEvent::Opened { generation });
        handle(&mut lifecycle, LifecycleEvent::HandshakeAccepted { generation });
        assert!(lifecycle.is_live());
        (lifecycle, generation)
    }

    fn close(lifecycle: &mut Lifecycle, generation: u64) -> Vec<Effect> {
        handle(
            lifecycle,
            LifecycleEvent::Closed {
                generation,
                reason: "reset".to_string(),
            },
        )
    }

    #[test]
    fn test_happy_path_effects() {
        let mut lifecycle = Lifecycle::new(policy());

        let effects = handle(&mut lifecycle, LifecycleEvent::Enter { room_id: 7 });
        assert_eq!(
            effects,
            vec![Effect::Connect {
                generation: 1,
                attempt: 0
            }]
        );
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert_eq!(lifecycle.current_room_id(), Some(7));
        assert!(lifecycle.session().auto_reconnect);

        let effects = handle(&mut lifecycle, LifecycleEvent::Opened { generation: 1 });
        assert_eq!(effects, vec![Effect::SendHandshake { generation: 1 }]);
        assert_eq!(lifecycle.state(), ConnectionState::AwaitingAuth);

        let effects = handle(
            &mut lifecycle,
            LifecycleEvent::HandshakeAccepted { generation: 1 },
        );
        assert_eq!(
            effects,
            vec![
                Effect::StartHeartbeat { generation: 1 },
                Effect::Notify(RoomStatus::Live { room_id: 7 })
            ]
        );
        assert!(lifecycle.is_live());
    }

    #[test]
    fn test_reconnect_until_exhausted() {
        let (mut lifecycle, generation) = live(7);

        for expected in 1..=5 {
            let effects = close(&mut lifecycle, generation);
            assert_eq!(lifecycle.state(), ConnectionState::Reconnecting);
            assert_eq!(lifecycle.session().reconnect_attempts, expected);
            assert!(effects.contains(&Effect::StopHeartbeat));
            assert!(effects.contains(&Effect::ScheduleReconnect {
                generation,
                attempt: expected,
                delay: Duration::from_millis(3000),
            }));

            let effects = handle(&mut lifecycle, LifecycleEvent::ReconnectDue { generation });
            assert_eq!(
                effects,
                vec![Effect::Connect {
                    generation,
                    attempt: expected
                }]
            );
            // Socket opens and dies straight away.
            handle(&mut lifecycle, LifecycleEvent::Opened { generation });
        }

        let effects = close(&mut lifecycle, generation);
        assert_eq!(lifecycle.state(), ConnectionState::Terminated);
        assert_eq!(lifecycle.current_room_id(), None);
        assert!(effects.contains(&Effect::Notify(RoomStatus::Failed {
            room_id: 7,
            reason: FailureReason::ReconnectExhausted { attempts: 5 },
        })));
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::ScheduleReconnect { .. }))
        );
    }

    #[test]
    fn test_connect_failures_count_as_attempts() {
        let (mut lifecycle, generation) = live(7);
        close(&mut lifecycle, generation);
        handle(&mut lifecycle, LifecycleEvent::ReconnectDue { generation });

        handle(
            &mut lifecycle,
            LifecycleEvent::ConnectFailed {
                generation,
                reason: "refused".to_string(),
            },
        );
        assert_eq!(lifecycle.state(), ConnectionState::Reconnecting);
        assert_eq!(lifecycle.session().reconnect_attempts, 2);
    }

    #[test]
    fn test_live_resets_attempts() {
        let (mut lifecycle, generation) = live(7);
        close(&mut lifecycle, generation);
        close(&mut lifecycle, generation); // ignored while reconnecting
        assert_eq!(lifecycle.session().reconnect_attempts, 1);

        handle(&mut lifecycle, LifecycleEvent::ReconnectDue { generation });
        handle(&mut lifecycle, LifecycleEvent::Opened { generation });
        handle(&mut lifecycle, LifecycleEvent::HandshakeAccepted { generation });
        assert!(lifecycle.is_live());
        assert_eq!(lifecycle.session().reconnect_attempts, 0);
    }

    #[test]
    fn test_first_connection_failure_goes_idle() {
        let mut lifecycle = Lifecycle::new(policy());
        handle(&mut lifecycle, LifecycleEvent::Enter { room_id: 7 });
        let effects = handle(
            &mut lifecycle,
            LifecycleEvent::ConnectFailed {
                generation: 1,
                reason: "dns".to_string(),
            },
        );
        assert_eq!(effects, vec![Effect::StopHeartbeat, Effect::Teardown]);
        assert_eq!(lifecycle.state(), ConnectionState::Idle);
        assert_eq!(lifecycle.current_room_id(), None);
        assert!(!lifecycle.session().auto_reconnect);
    }

    #[test]
    fn test_close_before_auth_on_first_connection_reconnects() {
        let mut lifecycle = Lifecycle::new(policy());
        handle(&mut lifecycle, LifecycleEvent::Enter { room_id: 7 });
        handle(&mut lifecycle, LifecycleEvent::Opened { generation: 1 });

        let effects = close(&mut lifecycle, 1);
        assert_eq!(lifecycle.state(), ConnectionState::Reconnecting);
        assert_eq!(lifecycle.current_room_id(), Some(7));
        assert!(effects.contains(&Effect::ScheduleReconnect {
            generation: 1,
            attempt: 1,
            delay: Duration::from_millis(3000),
        }));

        // Once retrying, a refused connection is just another attempt.
        handle(&mut lifecycle, LifecycleEvent::ReconnectDue { generation: 1 });
        handle(
            &mut lifecycle,
            LifecycleEvent::ConnectFailed {
                generation: 1,
                reason: "refused".to_string(),
            },
        );
        assert_eq!(lifecycle.state(), ConnectionState::Reconnecting);
        assert_eq!(lifecycle.session().reconnect_attempts, 2);
    }

    #[test]
    fn test_handshake_timeout_only_fatal_on_first_attempt() {
        let mut lifecycle = Lifecycle::new(policy());
        handle(&mut lifecycle, LifecycleEvent::Enter { room_id: 7 });
        handle(&mut lifecycle, LifecycleEvent::Opened { generation: 1 });
        let effects = handle(
            &mut lifecycle,
            LifecycleEvent::HandshakeTimedOut { generation: 1 },
        );
        assert_eq!(effects, vec![Effect::StopHeartbeat, Effect::Teardown]);
        assert_eq!(lifecycle.state(), ConnectionState::Idle);
        assert_eq!(lifecycle.current_room_id(), None);

        let (mut lifecycle, generation) = live(7);
        close(&mut lifecycle, generation);
        handle(&mut lifecycle, LifecycleEvent::ReconnectDue { generation });
        handle(&mut lifecycle, LifecycleEvent::Opened { generation });
        handle(&mut lifecycle, LifecycleEvent::HandshakeTimedOut { generation });
        assert_eq!(lifecycle.state(), ConnectionState::Reconnecting);
        assert_eq!(lifecycle.session().reconnect_attempts, 2);
    }

    #[test]
    fn test_leave_clears_room_before_close() {
        let (mut lifecycle, generation) = live(7);

        let effects = handle(&mut lifecycle, LifecycleEvent::Leave);
        assert_eq!(lifecycle.current_room_id(), None);
        assert_eq!(lifecycle.state(), ConnectionState::Idle);
        assert_eq!(
            effects,
            vec![
                Effect::StopHeartbeat,
                Effect::Teardown,
                Effect::Notify(RoomStatus::Left { room_id: 7 })
            ]
        );

        // The close caused by the teardown arrives afterwards.
        assert!(close(&mut lifecycle, generation).is_empty());
        assert_eq!(lifecycle.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_leave_during_delay_cancels_reconnect() {
        let (mut lifecycle, generation) = live(7);
        close(&mut lifecycle, generation);
        handle(&mut lifecycle, LifecycleEvent::Leave);

        let effects = handle(&mut lifecycle, LifecycleEvent::ReconnectDue { generation });
        assert!(effects.is_empty());
        assert_eq!(lifecycle.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_dispose_during_delay_cancels_reconnect() {
        let (mut lifecycle, generation) = live(7);
        close(&mut lifecycle, generation);

        handle(&mut lifecycle, LifecycleEvent::Dispose);
        assert!(lifecycle.session().disposed);
        assert_eq!(lifecycle.state(), ConnectionState::Terminated);

        let effects = handle(&mut lifecycle, LifecycleEvent::ReconnectDue { generation });
        assert!(effects.is_empty());
        assert_eq!(lifecycle.state(), ConnectionState::Terminated);
    }

    #[test]
    fn test_dispose_is_terminal_and_idempotent() {
        let (mut lifecycle, _) = live(7);
        let effects = handle(&mut lifecycle, LifecycleEvent::Dispose);
        assert!(effects.contains(&Effect::Notify(RoomStatus::Left { room_id: 7 })));
        assert!(handle(&mut lifecycle, LifecycleEvent::Dispose).is_empty());

        assert!(matches!(
            lifecycle.handle(LifecycleEvent::Enter { room_id: 8 }),
            Err(DanmakuError::Disposed)
        ));
        assert_eq!(lifecycle.current_room_id(), None);
    }

    #[test]
    fn test_reentering_same_room_is_noop() {
        let (mut lifecycle, generation) = live(7);
        assert!(handle(&mut lifecycle, LifecycleEvent::Enter { room_id: 7 }).is_empty());
        assert_eq!(lifecycle.generation(), generation);
        assert!(lifecycle.is_live());
    }

    #[test]
    fn test_switching_rooms_supersedes_old_session() {
        let (mut lifecycle, old) = live(7);

        let effects = handle(&mut lifecycle, LifecycleEvent::Enter { room_id: 8 });
        assert_eq!(
            effects,
            vec![
                Effect::StopHeartbeat,
                Effect::Teardown,
                Effect::Notify(RoomStatus::Left { room_id: 7 }),
                Effect::Connect {
                    generation: old + 1,
                    attempt: 0
                },
            ]
        );

        // Late close from the old socket.
        assert!(close(&mut lifecycle, old).is_empty());
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert_eq!(lifecycle.current_room_id(), Some(8));
    }

    #[test]
    fn test_handshake_rejection_is_terminal_for_session() {
        let mut lifecycle = Lifecycle::new(policy());
        handle(&mut lifecycle, LifecycleEvent::Enter { room_id: 7 });
        handle(&mut lifecycle, LifecycleEvent::Opened { generation: 1 });

        let effects = handle(
            &mut lifecycle,
            LifecycleEvent::HandshakeRejected {
                generation: 1,
                code: -101,
            },
        );
        assert_eq!(lifecycle.state(), ConnectionState::Terminated);
        assert_eq!(lifecycle.current_room_id(), None);
        assert!(effects.contains(&Effect::Notify(RoomStatus::Failed {
            room_id: 7,
            reason: FailureReason::AuthRejected { code: -101 },
        })));

        // Not disposed, so another room can still be entered.
        assert!(lifecycle.handle(LifecycleEvent::Enter { room_id: 8 }).is_ok());
    }

    #[test]
    fn test_events_ignored_in_wrong_state() {
        let mut lifecycle = Lifecycle::new(policy());
        assert!(handle(&mut lifecycle, LifecycleEvent::Leave).is_empty());
        assert!(handle(&mut lifecycle, LifecycleEvent::Opened { generation: 0 }).is_empty());
        assert!(
            handle(
                &mut lifecycle,
                LifecycleEvent::HandshakeAccepted { generation: 0 }
            )
            .is_empty()
        );
        assert_eq!(lifecycle.state(), ConnectionState::Idle);
    }
}
