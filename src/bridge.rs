//! Bridge Process
//!
//! Wires the two links, the liveness monitor and the command executor
//! together and relays messages between the station and the controller.
//!
//! Everything the relay loop does is non-blocking: outbound queues are fed
//! with `try_send`, so a stalled peer can never hold up the other link or
//! the safety actions.

use crate::clock::SharedClock;
use crate::command::{CommandExecutor, Dispatch};
use crate::config::BridgeConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::controller::{ControllerEvent, ControllerLink};
use crate::error::BridgeError;
use crate::safety::{LinkSnapshot, SafetyAction, SafetyMonitor};
use crate::telemetry::TelemetryAnnotator;
use crate::transport::TransportConnector;
use firebot_shared::{
    liveness, now_ms, Ack, AlertKind, BridgeMessage, ControllerCommand, ControllerFrame, LinkState,
    Peer, StationMessage,
};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::error::TrySendError, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// The bridge between one station and one controller
pub struct Bridge<S, K> {
    config: Arc<BridgeConfig>,
    station: S,
    controller: K,
    clock: SharedClock,
}

impl<S, K> Bridge<S, K>
where
    S: TransportConnector,
    K: TransportConnector,
{
    pub fn new(config: Arc<BridgeConfig>, station: S, controller: K, clock: SharedClock) -> Self {
        Self {
            config,
            station,
            controller,
            clock,
        }
    }

    /// Run until `shutdown` resolves or a fatal link error occurs
    ///
    /// Both links are closed before this returns, on every exit path.
    pub async fn run<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        let Bridge {
            config,
            station,
            controller,
            clock,
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut monitor = SafetyMonitor::new(&config, clock.clone());
        let monitor_task = monitor.start_monitoring(shutdown_rx.clone()).ok();

        info!(
            station = station.name(),
            controller = controller.name(),
            "Bridge starting"
        );

        let mut relay = Relay::new(config, station, controller, clock, &monitor, shutdown_rx);

        let mut auto_stop = interval(Duration::from_millis(liveness::AUTO_STOP_CHECK_MS));
        auto_stop.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }

                Some(action) = monitor.recv_action() => relay.on_safety_action(action),

                Some(event) = relay.controller.recv() => {
                    if let Err(e) = relay.on_controller_event(event) {
                        break Err(e);
                    }
                }

                Some(event) = relay.station.recv() => {
                    if let Err(e) = relay.on_station_event(event) {
                        break Err(e);
                    }
                }

                _ = auto_stop.tick() => relay.check_auto_stop(),
            }
        };

        if let Err(ref e) = outcome {
            error!(error = %e, "Bridge stopping on fatal error");
        }
        let links = monitor.status().await;
        info!(station = %links.station, controller = %links.controller, "Closing links");

        // Deterministic teardown: signal, give in-flight I/O a grace period, abort
        let _ = shutdown_tx.send(true);
        let mut tasks: Vec<JoinHandle<()>> = monitor_task
            .into_iter()
            .chain(relay.station.take_task())
            .chain(relay.controller.take_task())
            .collect();

        let grace = Duration::from_millis(liveness::SHUTDOWN_GRACE_MS);
        if timeout(grace, join_all(tasks.iter_mut())).await.is_err() {
            warn!(?grace, "Link tasks did not stop in time, aborting");
            for task in &tasks {
                task.abort();
            }
            for task in tasks {
                let _ = task.await;
            }
        }

        info!("Bridge stopped");
        outcome
    }
}

/// Relay state owned by the bridge loop
struct Relay {
    station: ConnectionManager,
    controller: ControllerLink,
    executor: CommandExecutor,
    annotator: TelemetryAnnotator,
    /// Mirror of the monitor's state, updated from its transitions
    links: LinkSnapshot,
    clock: SharedClock,
    config: Arc<BridgeConfig>,
    dropped_telemetry: u64,
    dropped_replies: u64,
}

impl Relay {
    fn new<S, K>(
        config: Arc<BridgeConfig>,
        station: S,
        controller: K,
        clock: SharedClock,
        monitor: &SafetyMonitor,
        shutdown: watch::Receiver<bool>,
    ) -> Self
    where
        S: TransportConnector,
        K: TransportConnector,
    {
        Self {
            station: ConnectionManager::new(
                station,
                config.clone(),
                monitor.reporter(Peer::Station),
                shutdown.clone(),
            ),
            controller: ControllerLink::new(
                controller,
                config.clone(),
                monitor.reporter(Peer::Controller),
                shutdown,
            ),
            executor: CommandExecutor::new(config.clone()),
            annotator: TelemetryAnnotator::new(config.sensors.clone()),
            links: LinkSnapshot {
                station: LinkState::Disconnected,
                controller: LinkState::Disconnected,
            },
            clock,
            config,
            dropped_telemetry: 0,
            dropped_replies: 0,
        }
    }

    fn on_safety_action(&mut self, action: SafetyAction) {
        match action {
            SafetyAction::StateChanged { peer, to, .. } => {
                match peer {
                    Peer::Station => self.links.station = to,
                    Peer::Controller => self.links.controller = to,
                }
                self.to_station(BridgeMessage::status(
                    self.links.station,
                    self.links.controller,
                ));
            }
            SafetyAction::SafeStop { reason } => {
                if self.controller.safe_stop() {
                    warn!(%reason, "Safe-stop queued ahead of pending commands");
                }
                self.executor.note_stopped();
                self.to_station(BridgeMessage::alert(AlertKind::WatchdogTimeout, reason));
            }
            SafetyAction::Reconnect { peer } => {
                info!(%peer, "Re-establishing link");
                match peer {
                    Peer::Station => self.station.request_reconnect(),
                    Peer::Controller => self.controller.request_reconnect(),
                }
            }
        }
    }

    fn on_controller_event(&mut self, event: ControllerEvent) -> Result<(), BridgeError> {
        match event {
            ControllerEvent::Connected => info!("Controller connected"),
            ControllerEvent::Disconnected { reason } => warn!(%reason, "Controller disconnected"),
            ControllerEvent::Frame(ControllerFrame::Sensors { readings }) => {
                let telemetry = self.annotator.annotate(&readings, now_ms());
                if telemetry.has_alert() {
                    debug!(seq = telemetry.seq, "Telemetry carries alerts");
                }
                if station_up(self.links.station) {
                    self.relay_telemetry(BridgeMessage::Telemetry(telemetry));
                }
            }
            ControllerEvent::Frame(ControllerFrame::Status { message }) => {
                info!(%message, "Controller status");
            }
            // Pongs never leave the link task
            ControllerEvent::Frame(ControllerFrame::Pong { .. }) => {}
            ControllerEvent::Malformed { reason } => {
                self.to_station(BridgeMessage::error(format!(
                    "malformed controller frame: {reason}"
                )));
            }
            ControllerEvent::Fatal { reason } => return Err(BridgeError::serial(reason)),
        }
        Ok(())
    }

    fn on_station_event(&mut self, event: ConnectionEvent) -> Result<(), BridgeError> {
        match event {
            ConnectionEvent::Connected => info!("Station connected"),
            ConnectionEvent::Disconnected { reason } => warn!(%reason, "Station disconnected"),
            ConnectionEvent::Received(msg) => self.on_station_message(msg),
            ConnectionEvent::ConnectionFailed { attempts, reason } => {
                let err = BridgeError::network(reason);
                error!(attempts, error = %err, "Station unreachable, still retrying");
            }
            ConnectionEvent::Abandoned { reason } => return Err(BridgeError::network(reason)),
        }
        Ok(())
    }

    fn on_station_message(&mut self, msg: StationMessage) {
        let Some(Dispatch { ack, command }) = self.executor.execute(&msg, self.links.controller)
        else {
            return;
        };

        let ack = match command {
            Some(command) => match self.controller.try_send(command.clone()) {
                Ok(()) => {
                    self.executor.note_delivered(&command, self.clock.now_ms());
                    ack
                }
                Err(e) => {
                    warn!(id = ack.id, error = %e, "Could not queue command");
                    Ack::failed(ack.id, e.to_string())
                }
            },
            None => ack,
        };
        debug!(
            moving = self.executor.is_moving(),
            speed = self.executor.current_speed(),
            "Motion state"
        );
        self.to_station(BridgeMessage::Ack(ack));
    }

    fn check_auto_stop(&mut self) {
        if !self.executor.check_auto_stop(self.clock.now_ms()) {
            return;
        }
        if let Err(e) = self.controller.try_send(ControllerCommand::Stop) {
            warn!(error = %e, "Could not queue auto-stop");
        }
        self.to_station(BridgeMessage::alert(
            AlertKind::AutoStop,
            format!(
                "no motion command for {:?}, robot stopped",
                self.config.navigation.auto_stop_timeout()
            ),
        ));
    }

    fn relay_telemetry(&mut self, msg: BridgeMessage) {
        match self.station.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_telemetry += 1;
                warn!(dropped = self.dropped_telemetry, "Station queue full, telemetry dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn to_station(&mut self, msg: BridgeMessage) {
        match self.station.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                self.dropped_replies += 1;
                warn!(
                    dropped = self.dropped_replies,
                    message = ?msg,
                    "Station queue full, message dropped"
                );
            }
            Err(TrySendError::Closed(_)) => debug!("Station link closed, message not queued"),
        }
    }
}

fn station_up(state: LinkState) -> bool {
    matches!(state, LinkState::Connected | LinkState::Degraded)
}
