//! Station link manager with persistent connection and automatic reconnection

use crate::config::BridgeConfig;
use crate::safety::LinkReporter;
use crate::shutdown;
use crate::transport::{TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use firebot_shared::{
    codec::{self, FrameDecoder},
    liveness, now_ms,
    state_machine::LinkEvent,
    BridgeMessage, Heartbeat, StationMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Events emitted by the station link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connected to the station
    Connected,
    /// Lost the station
    Disconnected { reason: String },
    /// A command from the station
    Received(StationMessage),
    /// Reconnection budget used up; retries continue in the background
    ConnectionFailed { attempts: u32, reason: String },
    /// Link is down and `auto_reconnect` is off
    Abandoned { reason: String },
}

/// Requests from the bridge to the link task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkControl {
    /// Drop the current connection and dial again
    Reconnect,
}

/// How a connection ended without an I/O error
enum Exit {
    Shutdown,
    Reconnect,
}

/// Manages the TCP link to the control station
pub struct ConnectionManager {
    /// Channel to send messages to the station
    outbound_tx: mpsc::Sender<BridgeMessage>,
    control_tx: mpsc::Sender<LinkControl>,
    /// Channel to receive connection events
    event_rx: mpsc::Receiver<ConnectionEvent>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new<C: TransportConnector>(
        connector: C,
        config: Arc<BridgeConfig>,
        reporter: LinkReporter,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<BridgeMessage>(100);
        let (control_tx, control_rx) = mpsc::channel::<LinkControl>(4);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);

        let task = tokio::spawn(async move {
            let link = StationLink {
                connector,
                config,
                reporter,
                outbound_rx,
                control_rx,
                event_tx,
                shutdown,
                heartbeat_seq: 0,
            };
            link.run().await;
        });

        Self {
            outbound_tx,
            control_tx,
            event_rx,
            task: Some(task),
        }
    }

    /// Queue a message for the station without waiting
    pub fn try_send(&self, msg: BridgeMessage) -> Result<(), mpsc::error::TrySendError<BridgeMessage>> {
        self.outbound_tx.try_send(msg)
    }

    /// Ask the link to drop and re-establish the connection
    pub fn request_reconnect(&self) {
        let _ = self.control_tx.try_send(LinkControl::Reconnect);
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Join handle of the link task, for shutdown
    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

struct StationLink<C> {
    connector: C,
    config: Arc<BridgeConfig>,
    reporter: LinkReporter,
    outbound_rx: mpsc::Receiver<BridgeMessage>,
    control_rx: mpsc::Receiver<LinkControl>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    shutdown: watch::Receiver<bool>,
    heartbeat_seq: u64,
}

impl<C: TransportConnector> StationLink<C> {
    /// Main connection loop with reconnection logic
    async fn run(mut self) {
        let conn = &self.config.connection;
        let base_delay = conn.reconnect_interval();
        let connect_timeout = conn.connect_timeout();
        let auto_reconnect = conn.auto_reconnect;
        let max_attempts = conn.max_reconnect_attempts;
        let mut attempts: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.reporter.report(LinkEvent::ConnectStarted);
            debug!(station = self.connector.name(), attempt = attempts + 1, "Connecting");

            let connect = timeout(connect_timeout, self.connector.connect());
            let result = tokio::select! {
                r = connect => r,
                _ = shutdown::requested(&mut self.shutdown) => {
                    self.reporter.report(LinkEvent::ManualStop);
                    break;
                }
            };

            let failure = match result {
                Ok(Ok(stream)) => {
                    attempts = 0;
                    self.discard_stale();
                    self.reporter.report(LinkEvent::ConnectSucceeded);
                    info!(station = self.connector.name(), "Connected to station");
                    self.emit(ConnectionEvent::Connected).await;

                    match self.handle_connection(stream).await {
                        Ok(Exit::Shutdown) => {
                            self.reporter.report(LinkEvent::ManualStop);
                            break;
                        }
                        Ok(Exit::Reconnect) => "heartbeat timeout".to_string(),
                        Err(e) => {
                            self.reporter.report(LinkEvent::LinkClosed);
                            e.to_string()
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.reporter.report(LinkEvent::ConnectFailed);
                    attempts = attempts.saturating_add(1);
                    format!("connect failed: {e:#}")
                }
                Err(_) => {
                    self.reporter.report(LinkEvent::ConnectFailed);
                    attempts = attempts.saturating_add(1);
                    format!("connect timed out after {:?}", connect_timeout)
                }
            };

            warn!(attempts, reason = %failure, "Station link down");

            if !auto_reconnect {
                error!("auto_reconnect disabled, giving up on station link");
                self.emit(ConnectionEvent::Abandoned { reason: failure }).await;
                break;
            }

            if attempts == 0 {
                self.emit(ConnectionEvent::Disconnected { reason: failure }).await;
            } else if attempts == max_attempts {
                self.emit(ConnectionEvent::ConnectionFailed {
                    attempts,
                    reason: failure,
                })
                .await;
            }

            let delay = reconnect_delay(base_delay, attempts);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown::requested(&mut self.shutdown) => break,
            }
        }

        debug!("Station link task finished");
    }

    async fn emit(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Drop messages and reconnect requests queued while the link was down
    fn discard_stale(&mut self) {
        let mut dropped = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded messages queued while disconnected");
        }
        while self.control_rx.try_recv().is_ok() {
            debug!("Discarded reconnect request for the previous connection");
        }
    }

    /// Handle an active connection
    async fn handle_connection(&mut self, mut stream: C::Stream) -> Result<Exit> {
        let result = self.pump(&mut stream).await;
        let limit = self.config.connection.reconnect_interval();
        match timeout(limit, TransportStream::shutdown(&mut stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Station stream shutdown"),
            Err(_) => debug!("Station stream shutdown timed out"),
        }
        result
    }

    async fn pump(&mut self, stream: &mut C::Stream) -> Result<Exit> {
        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; 4096];

        // Ping twice per heartbeat window
        let period = (self.config.connection.reconnect_interval() / 2).max(Duration::from_millis(10));
        let mut heartbeat_interval = interval(period);
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown::requested(&mut self.shutdown) => {
                    // Best effort: flush whatever is already queued
                    while let Ok(msg) = self.outbound_rx.try_recv() {
                        if self.write(stream, &msg).await.is_err() {
                            break;
                        }
                    }
                    return Ok(Exit::Shutdown);
                }

                Some(LinkControl::Reconnect) = self.control_rx.recv() => {
                    return Ok(Exit::Reconnect);
                }

                _ = heartbeat_interval.tick() => {
                    self.heartbeat_seq += 1;
                    let hb = BridgeMessage::Heartbeat(Heartbeat::new(self.heartbeat_seq));
                    self.write(stream, &hb).await?;
                }

                Some(msg) = self.outbound_rx.recv() => {
                    self.write(stream, &msg).await?;
                }

                read = stream.read(&mut read_buf) => {
                    let n = read.map_err(|e| anyhow!("Read error: {}", e))?;
                    if n == 0 {
                        return Err(anyhow!("Station closed connection"));
                    }
                    decoder.extend(&read_buf[..n]);
                    self.drain_frames(stream, &mut decoder).await?;
                }
            }
        }
    }

    /// Process all complete lines in the decoder
    async fn drain_frames(&mut self, stream: &mut C::Stream, decoder: &mut FrameDecoder) -> Result<()> {
        loop {
            match decoder.decode_next::<StationMessage>() {
                Ok(Some(StationMessage::Heartbeat(hb))) => {
                    self.reporter.report(LinkEvent::HeartbeatReceived);
                    let ack = BridgeMessage::HeartbeatAck(Heartbeat {
                        seq: hb.seq,
                        timestamp_ms: now_ms(),
                    });
                    self.write(stream, &ack).await?;
                }
                Ok(Some(StationMessage::HeartbeatAck(hb))) => {
                    debug!(seq = hb.seq, "Station heartbeat ack");
                    self.reporter.report(LinkEvent::HeartbeatReceived);
                }
                Ok(Some(msg)) => {
                    self.emit(ConnectionEvent::Received(msg)).await;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Malformed message from station");
                    self.write(stream, &BridgeMessage::error(format!("malformed message: {e}")))
                        .await?;
                }
            }
        }
    }

    /// Write one message, giving up after a heartbeat window
    async fn write(&mut self, stream: &mut C::Stream, msg: &BridgeMessage) -> Result<()> {
        let encoded = codec::encode(msg)?;
        let limit = self.config.connection.reconnect_interval();
        let err = match timeout(limit, stream.write_all(&encoded)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => anyhow!("Write error: {}", e),
            Err(_) => anyhow!("Write timed out after {:?}", limit),
        };
        self.reporter.report(LinkEvent::SendFailed);
        Err(err)
    }
}

/// Linear backoff, capped
fn reconnect_delay(base: Duration, attempts: u32) -> Duration {
    let delay = base.saturating_mul(attempts.max(1));
    delay.min(Duration::from_millis(liveness::MAX_RECONNECT_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::safety::SafetyMonitor;
    use crate::transport::mock::MockConnector;
    use firebot_shared::{
        Ack, DriveAction, LinkState, Peer, RobotControl,
    };
    use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

    fn config(auto_reconnect: bool) -> Arc<BridgeConfig> {
        let mut config = BridgeConfig::default();
        config.connection.reconnect_interval = 1.0;
        config.connection.auto_reconnect = auto_reconnect;
        config.connection.max_reconnect_attempts = 3;
        Arc::new(config)
    }

    struct Harness {
        manager: ConnectionManager,
        monitor: SafetyMonitor,
        shutdown: watch::Sender<bool>,
    }

    fn start(connector: MockConnector, config: Arc<BridgeConfig>) -> Harness {
        let (shutdown, rx) = watch::channel(false);
        let mut monitor = SafetyMonitor::new(&config, Arc::new(TokioClock::new()));
        monitor.start_monitoring(rx.clone()).unwrap();
        let manager = ConnectionManager::new(connector, config, monitor.reporter(Peer::Station), rx);
        Harness {
            manager,
            monitor,
            shutdown,
        }
    }

    async fn next_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> BridgeMessage {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_heartbeat_and_forwards_commands() {
        let connector = MockConnector::new("station");
        let peer = connector.push_stream();
        let mut h = start(connector, config(true));

        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));

        let (rd, mut wr) = tokio::io::split(peer);
        let mut reader = BufReader::new(rd);

        // The bridge pings first
        assert!(matches!(next_line(&mut reader).await, BridgeMessage::Heartbeat(_)));

        wr.write_all(b"{\"type\":\"heartbeat\",\"seq\":41,\"timestamp_ms\":5}\n")
            .await
            .unwrap();
        match next_line(&mut reader).await {
            BridgeMessage::HeartbeatAck(hb) => assert_eq!(hb.seq, 41),
            other => panic!("expected heartbeat_ack, got {:?}", other),
        }

        wr.write_all(b"{\"type\":\"robot_control\",\"id\":9,\"action\":\"stop\"}\n")
            .await
            .unwrap();
        assert_eq!(
            h.manager.recv().await,
            Some(ConnectionEvent::Received(StationMessage::RobotControl(RobotControl {
                id: 9,
                action: DriveAction::Stop,
                speed: None,
                heading: None,
                value: None,
            })))
        );

        h.manager.try_send(BridgeMessage::Ack(Ack::accepted(9, ""))).unwrap();
        assert_eq!(
            next_line(&mut reader).await,
            BridgeMessage::Ack(Ack::accepted(9, ""))
        );
        assert_eq!(h.monitor.status().await.station, LinkState::Connected);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_line_gets_error_reply() {
        let connector = MockConnector::new("station");
        let peer = connector.push_stream();
        let mut h = start(connector, config(true));
        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));

        let (rd, mut wr) = tokio::io::split(peer);
        let mut reader = BufReader::new(rd);
        next_line(&mut reader).await;

        wr.write_all(b"{\"type\":\"warp_drive\"}\n").await.unwrap();
        match next_line(&mut reader).await {
            BridgeMessage::Error(report) => assert!(report.message.starts_with("malformed")),
            other => panic!("expected error, got {:?}", other),
        }
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_close() {
        let connector = MockConnector::new("station");
        let first = connector.push_stream();
        let _second = connector.push_stream();
        let mut h = start(connector.clone(), config(true));

        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));
        drop(first);

        assert!(matches!(
            h.manager.recv().await,
            Some(ConnectionEvent::Disconnected { .. })
        ));
        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));
        assert_eq!(connector.attempts(), 2);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_reports_failure_and_keeps_trying() {
        let connector = MockConnector::new("station");
        let mut h = start(connector.clone(), config(true));

        match h.manager.recv().await {
            Some(ConnectionEvent::ConnectionFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected event: {:?}", other),
        }

        // A late listener is still picked up
        let _peer = connector.push_stream();
        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_without_auto_reconnect() {
        let connector = MockConnector::new("station");
        let mut h = start(connector, config(false));

        assert!(matches!(
            h.manager.recv().await,
            Some(ConnectionEvent::Abandoned { .. })
        ));
        let task = h.manager.take_task().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_request_redials() {
        let connector = MockConnector::new("station");
        let _first = connector.push_stream();
        let _second = connector.push_stream();
        let mut h = start(connector.clone(), config(true));

        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));
        h.manager.request_reconnect();
        assert!(matches!(
            h.manager.recv().await,
            Some(ConnectionEvent::Disconnected { reason }) if reason == "heartbeat timeout"
        ));
        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_that_stops_reading_is_redialled() {
        let connector = MockConnector::new("station");
        // Too small for a single heartbeat, and never read
        let _frozen = connector.push_stream_with_capacity(16);
        let _second = connector.push_stream();
        let mut h = start(connector.clone(), config(true));

        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));
        match h.manager.recv().await {
            Some(ConnectionEvent::Disconnected { reason }) => {
                assert!(reason.contains("timed out"), "{reason}")
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));
        assert_eq!(connector.attempts(), 2);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_request_from_before_connect_is_ignored() {
        let connector = MockConnector::new("station");
        let mut h = start(connector.clone(), config(true));
        h.manager.request_reconnect();

        let _peer = connector.push_stream();
        assert_eq!(h.manager.recv().await, Some(ConnectionEvent::Connected));
        assert!(
            timeout(Duration::from_secs(3), h.manager.recv()).await.is_err(),
            "new connection must not be torn down"
        );
        let _ = h.shutdown.send(true);
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let base = Duration::from_secs(5);
        assert_eq!(reconnect_delay(base, 0), Duration::from_secs(5));
        assert_eq!(reconnect_delay(base, 3), Duration::from_secs(15));
        assert_eq!(reconnect_delay(base, 10), Duration::from_secs(30));
    }
}
