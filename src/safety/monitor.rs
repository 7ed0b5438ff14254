//! Liveness Monitor
//!
//! Owns the `HeartbeatState` of both links. Link tasks report what they see
//! through a [`LinkReporter`]; a background task applies those events and
//! the periodic timeout checks to the per-peer state machines and turns the
//! resulting transitions into [`SafetyAction`]s for the bridge.

use crate::clock::SharedClock;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use anyhow::{anyhow, Result};
use firebot_shared::{
    state_machine::{LinkEvent, LinkStateMachine, LivenessPolicy, Transition, TransitionResult},
    LinkState, Peer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Missed watchdog windows before the serial link is torn down and reopened
const CONTROLLER_MISSED_WINDOWS: u32 = 2;

/// Lower bound on the timeout check period
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Actions that the monitor asks the bridge to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyAction {
    /// A link changed state
    StateChanged {
        peer: Peer,
        from: LinkState,
        to: LinkState,
    },
    /// The controller went quiet: stop the motors before anything else
    SafeStop { reason: String },
    /// A link timed out completely and must be re-established
    Reconnect { peer: Peer },
}

/// Runtime liveness state of both peers
#[derive(Debug)]
pub struct HeartbeatState {
    pub station: LinkStateMachine,
    pub controller: LinkStateMachine,
}

impl HeartbeatState {
    pub fn new(config: &BridgeConfig) -> Self {
        let station_window = config.connection.reconnect_interval().as_millis() as u64;
        Self {
            station: LinkStateMachine::new(LivenessPolicy::new(
                station_window,
                config.connection.missed_heartbeats,
            )),
            controller: LinkStateMachine::new(LivenessPolicy::new(
                config.serial.watchdog_timeout,
                CONTROLLER_MISSED_WINDOWS,
            )),
        }
    }

    fn machine_mut(&mut self, peer: Peer) -> &mut LinkStateMachine {
        match peer {
            Peer::Station => &mut self.station,
            Peer::Controller => &mut self.controller,
        }
    }

    /// How often timeouts should be checked to stay within a quarter window
    fn check_interval(&self) -> Duration {
        let shortest = self
            .station
            .policy()
            .window_ms
            .min(self.controller.policy().window_ms);
        Duration::from_millis(shortest / 4).max(MIN_CHECK_INTERVAL)
    }
}

/// Snapshot of both link states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub station: LinkState,
    pub controller: LinkState,
}

/// Cloneable handle used by a link task to report events for its peer
#[derive(Debug, Clone)]
pub struct LinkReporter {
    peer: Peer,
    tx: mpsc::UnboundedSender<(Peer, LinkEvent)>,
}

impl LinkReporter {
    /// Report an event; ignored once the monitor has stopped
    pub fn report(&self, event: LinkEvent) {
        let _ = self.tx.send((self.peer, event));
    }
}

/// The liveness monitor
pub struct SafetyMonitor {
    state: Arc<RwLock<HeartbeatState>>,
    clock: SharedClock,
    event_tx: mpsc::UnboundedSender<(Peer, LinkEvent)>,
    /// Taken by the monitoring task
    event_rx: Option<mpsc::UnboundedReceiver<(Peer, LinkEvent)>>,
    action_tx: mpsc::UnboundedSender<SafetyAction>,
    action_rx: mpsc::UnboundedReceiver<SafetyAction>,
}

impl SafetyMonitor {
    /// Create a new monitor with both links Disconnected
    pub fn new(config: &BridgeConfig, clock: SharedClock) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();

        Self {
            state: Arc::new(RwLock::new(HeartbeatState::new(config))),
            clock,
            event_tx,
            event_rx: Some(event_rx),
            action_tx,
            action_rx,
        }
    }

    /// Reporter for one peer's link task
    pub fn reporter(&self, peer: Peer) -> LinkReporter {
        LinkReporter {
            peer,
            tx: self.event_tx.clone(),
        }
    }

    /// Receive the next safety action
    pub async fn recv_action(&mut self) -> Option<SafetyAction> {
        self.action_rx.recv().await
    }

    /// Current state of both links
    pub async fn status(&self) -> LinkSnapshot {
        let state = self.state.read().await;
        LinkSnapshot {
            station: state.station.state(),
            controller: state.controller.state(),
        }
    }

    /// Start the monitoring task; it runs until `shutdown` flips to true
    pub fn start_monitoring(&mut self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let event_rx = self
            .event_rx
            .take()
            .ok_or_else(|| anyhow!("liveness monitoring already started"))?;

        let state = self.state.clone();
        let clock = self.clock.clone();
        let action_tx = self.action_tx.clone();

        Ok(tokio::spawn(async move {
            monitor_loop(state, clock, event_rx, action_tx, shutdown).await;
        }))
    }
}

/// Why a set of transitions happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    Reported,
    Timeout,
}

async fn monitor_loop(
    state: Arc<RwLock<HeartbeatState>>,
    clock: SharedClock,
    mut event_rx: mpsc::UnboundedReceiver<(Peer, LinkEvent)>,
    action_tx: mpsc::UnboundedSender<SafetyAction>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(state.read().await.check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            maybe = event_rx.recv() => {
                let Some((peer, event)) = maybe else { break };
                let now = clock.now_ms();
                let mut guard = state.write().await;
                let machine = guard.machine_mut(peer);
                match machine.process_event(event, now) {
                    TransitionResult::Success(transitions) => {
                        let policy = machine.policy();
                        drop(guard);
                        emit(&action_tx, peer, &transitions, Cause::Reported, 0, policy);
                    }
                    TransitionResult::Unchanged(_) => {}
                    TransitionResult::Invalid { from, event } => {
                        debug!(%peer, %from, ?event, "Ignoring link event");
                    }
                }
            }

            _ = ticker.tick() => {
                let now = clock.now_ms();
                let mut guard = state.write().await;
                for peer in [Peer::Controller, Peer::Station] {
                    let machine = guard.machine_mut(peer);
                    let silent_ms = machine.silence_ms(now);
                    let transitions = machine.check_liveness(now);
                    if !transitions.is_empty() {
                        let policy = machine.policy();
                        emit(&action_tx, peer, &transitions, Cause::Timeout, silent_ms, policy);
                    }
                }
            }
        }
    }

    info!("Liveness monitoring stopped");
}

fn emit(
    action_tx: &mpsc::UnboundedSender<SafetyAction>,
    peer: Peer,
    transitions: &[Transition],
    cause: Cause,
    silent_ms: u64,
    policy: LivenessPolicy,
) {
    for t in transitions {
        match t.to {
            LinkState::Degraded | LinkState::Disconnected => {
                warn!(%peer, from = %t.from, to = %t.to, ?cause, "Link state changed")
            }
            _ => info!(%peer, from = %t.from, to = %t.to, "Link state changed"),
        }
        let _ = action_tx.send(SafetyAction::StateChanged {
            peer,
            from: t.from,
            to: t.to,
        });

        if cause != Cause::Timeout {
            continue;
        }

        if peer == Peer::Controller && t.from == LinkState::Connected && t.to == LinkState::Degraded
        {
            let reason = BridgeError::WatchdogTimeout {
                peer,
                silent_ms,
                window_ms: policy.window_ms,
            };
            error!(%reason, "Watchdog expired, commanding safe-stop");
            let _ = action_tx.send(SafetyAction::SafeStop {
                reason: reason.to_string(),
            });
        }

        if t.to == LinkState::Disconnected {
            let _ = action_tx.send(SafetyAction::Reconnect { peer });
        }
    }
}
