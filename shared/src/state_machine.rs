//! Link State Machine
//!
//! Per-peer connection lifecycle:
//! `Disconnected -> Connecting -> Connected -> Degraded -> Disconnected`.
//!
//! Time is passed in explicitly so the machine can be driven by a fake clock.

use crate::LinkState;

/// Events that can trigger link transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connect / open attempt is starting
    ConnectStarted,
    /// The transport came up
    ConnectSucceeded,
    /// The attempt failed before the transport came up
    ConnectFailed,
    /// Any liveness evidence from the peer (heartbeat, ack, frame)
    HeartbeatReceived,
    /// A write to the peer failed
    SendFailed,
    /// The peer closed the transport or a read failed
    LinkClosed,
    /// Operator-initiated teardown
    ManualStop,
}

/// A single state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LinkState,
    pub to: LinkState,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// One or more transitions were applied, in order
    Success(Vec<Transition>),
    /// The event was accepted but the state did not change
    Unchanged(LinkState),
    /// Event makes no sense in the current state
    Invalid { from: LinkState, event: LinkEvent },
}

impl TransitionResult {
    /// Transitions applied by this result (empty unless `Success`)
    pub fn transitions(&self) -> &[Transition] {
        match self {
            TransitionResult::Success(t) => t,
            _ => &[],
        }
    }
}

/// How long a peer may stay silent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Silence beyond this marks a connected link Degraded
    pub window_ms: u64,
    /// Number of windows of silence before the link is Disconnected
    pub missed_beats: u32,
}

impl LivenessPolicy {
    pub fn new(window_ms: u64, missed_beats: u32) -> Self {
        Self {
            window_ms: window_ms.max(1),
            missed_beats: missed_beats.max(1),
        }
    }

    /// Silence after which the link is declared Disconnected
    pub fn disconnect_after_ms(&self) -> u64 {
        self.window_ms.saturating_mul(self.missed_beats as u64)
    }
}

/// Lifecycle of one peer link
#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    policy: LivenessPolicy,
    /// Last liveness evidence, 0 until the link first comes up
    last_heartbeat_ms: u64,
}

impl LinkStateMachine {
    /// Create a new machine in the Disconnected state
    pub fn new(policy: LivenessPolicy) -> Self {
        Self {
            state: LinkState::Disconnected,
            policy,
            last_heartbeat_ms: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn policy(&self) -> LivenessPolicy {
        self.policy
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms
    }

    /// Milliseconds since the last liveness evidence
    pub fn silence_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_heartbeat_ms)
    }

    /// Whole heartbeat windows missed so far
    pub fn missed_beats(&self, now_ms: u64) -> u64 {
        self.silence_ms(now_ms) / self.policy.window_ms
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent, now_ms: u64) -> TransitionResult {
        use LinkEvent::*;
        use LinkState::*;

        let path: &[LinkState] = match (self.state, event) {
            (Disconnected, ConnectStarted) => &[Connecting],

            (Connecting, ConnectSucceeded) => {
                self.last_heartbeat_ms = now_ms;
                &[Connected]
            }
            (Connecting, ConnectFailed) => &[Disconnected],

            (Connected, HeartbeatReceived) => {
                self.last_heartbeat_ms = now_ms;
                return TransitionResult::Unchanged(Connected);
            }
            (Degraded, HeartbeatReceived) => {
                self.last_heartbeat_ms = now_ms;
                &[Connected]
            }

            (Connected, SendFailed) => &[Degraded],
            (Degraded, SendFailed) => &[Disconnected],

            // A dropped link still passes through Degraded
            (Connected, LinkClosed) => &[Degraded, Disconnected],
            (Degraded, LinkClosed) => &[Disconnected],
            (Connecting, LinkClosed) => &[Disconnected],

            (Connecting | Connected | Degraded, ManualStop) => &[Disconnected],

            (Disconnected, LinkClosed | SendFailed | ConnectFailed | ManualStop) => {
                return TransitionResult::Unchanged(Disconnected);
            }

            (from, event) => return TransitionResult::Invalid { from, event },
        };

        TransitionResult::Success(self.walk(path))
    }

    /// Apply timer-driven transitions for the given instant
    ///
    /// A connected link that has been silent for more than one window becomes
    /// Degraded; after `missed_beats` windows it becomes Disconnected. Both
    /// can happen in one call if the check ran late.
    pub fn check_liveness(&mut self, now_ms: u64) -> Vec<Transition> {
        let silence = self.silence_ms(now_ms);
        let mut path = Vec::with_capacity(2);

        if matches!(self.state, LinkState::Connected) && silence > self.policy.window_ms {
            path.push(LinkState::Degraded);
        }
        let degraded = matches!(self.state, LinkState::Degraded) || !path.is_empty();
        if degraded && silence > self.policy.disconnect_after_ms() {
            path.push(LinkState::Disconnected);
        }

        self.walk(&path)
    }

    fn walk(&mut self, path: &[LinkState]) -> Vec<Transition> {
        let mut transitions = Vec::with_capacity(path.len());
        for &to in path {
            debug_assert!(is_valid_transition(self.state, to));
            transitions.push(Transition {
                from: self.state,
                to,
            });
            self.state = to;
        }
        transitions
    }
}

/// Check if a transition from one state to another is part of the lifecycle
pub fn is_valid_transition(from: LinkState, to: LinkState) -> bool {
    use LinkState::*;

    match (from, to) {
        (Disconnected, Connecting) => true,
        (Connecting, Connected) => true,
        (Connecting, Disconnected) => true,
        (Connected, Degraded) => true,
        // Only through a fresh heartbeat
        (Degraded, Connected) => true,
        (Degraded, Disconnected) => true,
        // Manual stop
        (Connected, Disconnected) => true,
        _ => false,
    }
}
