//! Serial link to the microcontroller
//!
//! Commands are written in the order they were queued. A safe-stop travels on
//! a separate single-slot channel that the writer always polls first, and it
//! discards whatever motion commands were still waiting behind it.

use crate::config::BridgeConfig;
use crate::connection::LinkControl;
use crate::safety::LinkReporter;
use crate::shutdown;
use crate::transport::{TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use firebot_shared::{
    codec::{self, FrameDecoder},
    liveness,
    state_machine::LinkEvent,
    ControllerCommand, ControllerFrame,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Events emitted by the controller link
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// Serial device opened
    Connected,
    /// Serial device lost or closed for reopening
    Disconnected { reason: String },
    /// Sensor or status frame, in arrival order
    Frame(ControllerFrame),
    /// A line that did not parse as a frame
    Malformed { reason: String },
    /// Retry budget exhausted
    Fatal { reason: String },
}

enum Exit {
    Shutdown,
    Reconnect,
}

/// Handle to the serial link task
pub struct ControllerLink {
    command_tx: mpsc::Sender<ControllerCommand>,
    priority_tx: mpsc::Sender<ControllerCommand>,
    control_tx: mpsc::Sender<LinkControl>,
    event_rx: mpsc::Receiver<ControllerEvent>,
    task: Option<JoinHandle<()>>,
}

impl ControllerLink {
    /// Start the link task
    pub fn new<C: TransportConnector>(
        connector: C,
        config: Arc<BridgeConfig>,
        reporter: LinkReporter,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (priority_tx, priority_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::channel(256);

        let task = tokio::spawn(async move {
            let link = SerialLink {
                connector,
                config,
                reporter,
                command_rx,
                priority_rx,
                control_rx,
                event_tx,
                shutdown,
                ping_seq: 0,
                failures: 0,
            };
            link.run().await;
        });

        Self {
            command_tx,
            priority_tx,
            control_tx,
            event_rx,
            task: Some(task),
        }
    }

    /// Queue a command behind earlier ones without waiting
    pub fn try_send(&self, cmd: ControllerCommand) -> Result<()> {
        self.command_tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("controller queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("controller link closed"),
        })
    }

    /// Put a stop ahead of every queued command
    ///
    /// Returns false if a stop is already pending.
    pub fn safe_stop(&self) -> bool {
        self.priority_tx.try_send(ControllerCommand::Stop).is_ok()
    }

    /// Close the serial device and open it again
    pub fn request_reconnect(&self) {
        let _ = self.control_tx.try_send(LinkControl::Reconnect);
    }

    pub async fn recv(&mut self) -> Option<ControllerEvent> {
        self.event_rx.recv().await
    }

    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

struct SerialLink<C> {
    connector: C,
    config: Arc<BridgeConfig>,
    reporter: LinkReporter,
    command_rx: mpsc::Receiver<ControllerCommand>,
    priority_rx: mpsc::Receiver<ControllerCommand>,
    control_rx: mpsc::Receiver<LinkControl>,
    event_tx: mpsc::Sender<ControllerEvent>,
    shutdown: watch::Receiver<bool>,
    ping_seq: u64,
    /// Consecutive failures; cleared by the first good frame
    failures: u32,
}

impl<C: TransportConnector> SerialLink<C> {
    async fn run(mut self) {
        let max_retries = self.config.serial.max_retries;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.reporter.report(LinkEvent::ConnectStarted);
            let result = tokio::select! {
                r = self.connector.connect() => r,
                _ = shutdown::requested(&mut self.shutdown) => {
                    self.reporter.report(LinkEvent::ManualStop);
                    break;
                }
            };

            let reason = match result {
                Ok(stream) => {
                    self.reporter.report(LinkEvent::ConnectSucceeded);
                    info!(
                        device = self.connector.name(),
                        baud = self.config.serial.baud_rate,
                        "Serial link open"
                    );
                    self.emit(ControllerEvent::Connected).await;

                    let reason = match self.handle_connection(stream).await {
                        Ok(Exit::Shutdown) => {
                            self.reporter.report(LinkEvent::ManualStop);
                            break;
                        }
                        Ok(Exit::Reconnect) => "watchdog timeout".to_string(),
                        Err(e) => {
                            self.reporter.report(LinkEvent::LinkClosed);
                            e.to_string()
                        }
                    };
                    self.emit(ControllerEvent::Disconnected {
                        reason: reason.clone(),
                    })
                    .await;
                    reason
                }
                Err(e) => {
                    self.reporter.report(LinkEvent::ConnectFailed);
                    format!("{e:#}")
                }
            };

            self.failures = self.failures.saturating_add(1);
            warn!(failures = self.failures, max_retries, %reason, "Serial link down");

            if self.failures > max_retries {
                error!(device = self.connector.name(), "Serial retry budget exhausted");
                self.emit(ControllerEvent::Fatal {
                    reason: format!(
                        "{} after {} attempts: {}",
                        self.connector.name(),
                        self.failures,
                        reason
                    ),
                })
                .await;
                break;
            }

            let delay = retry_delay(self.failures);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown::requested(&mut self.shutdown) => break,
            }
        }

        debug!("Serial link task finished");
    }

    async fn emit(&self, event: ControllerEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn handle_connection(&mut self, mut stream: C::Stream) -> Result<Exit> {
        while self.control_rx.try_recv().is_ok() {
            debug!("Discarded reconnect request for the previous session");
        }
        let result = self.pump(&mut stream).await;
        let limit = self.config.serial.watchdog_timeout();
        match timeout(limit, TransportStream::shutdown(&mut stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Serial stream shutdown"),
            Err(_) => debug!("Serial stream shutdown timed out"),
        }
        result
    }

    async fn pump(&mut self, stream: &mut C::Stream) -> Result<Exit> {
        let mut decoder = FrameDecoder::new();
        let mut read_buf = vec![0u8; 1024];
        let mut ping = interval(self.config.serial.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown::requested(&mut self.shutdown) => {
                    // Leave the motors stopped
                    let grace = Duration::from_millis(liveness::SHUTDOWN_GRACE_MS / 4);
                    if timeout(grace, self.write(stream, &ControllerCommand::Stop)).await.is_err() {
                        warn!("Timed out writing stop during shutdown");
                    }
                    return Ok(Exit::Shutdown);
                }

                Some(cmd) = self.priority_rx.recv() => {
                    self.write(stream, &cmd).await?;
                    let mut discarded = 0usize;
                    while self.command_rx.try_recv().is_ok() {
                        discarded += 1;
                    }
                    if discarded > 0 {
                        warn!(discarded, "Dropped queued commands behind safe-stop");
                    }
                }

                Some(LinkControl::Reconnect) = self.control_rx.recv() => {
                    return Ok(Exit::Reconnect);
                }

                _ = ping.tick() => {
                    self.ping_seq += 1;
                    let cmd = ControllerCommand::Ping { seq: self.ping_seq };
                    self.write(stream, &cmd).await?;
                }

                Some(cmd) = self.command_rx.recv() => {
                    debug!(?cmd, "Writing command");
                    self.write(stream, &cmd).await?;
                }

                read = stream.read(&mut read_buf) => {
                    let n = read.map_err(|e| anyhow!("Serial read error: {}", e))?;
                    if n == 0 {
                        return Err(anyhow!("Serial device closed"));
                    }
                    decoder.extend(&read_buf[..n]);
                    self.drain_frames(&mut decoder).await;
                }
            }
        }
    }

    async fn drain_frames(&mut self, decoder: &mut FrameDecoder) {
        loop {
            match decoder.decode_next::<ControllerFrame>() {
                Ok(Some(frame)) => {
                    self.failures = 0;
                    self.reporter.report(LinkEvent::HeartbeatReceived);
                    match frame {
                        ControllerFrame::Pong { seq } => debug!(seq, "Controller pong"),
                        other => self.emit(ControllerEvent::Frame(other)).await,
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Malformed frame from controller");
                    self.emit(ControllerEvent::Malformed {
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    /// Write one command, giving up after a watchdog window
    async fn write(&mut self, stream: &mut C::Stream, cmd: &ControllerCommand) -> Result<()> {
        let encoded = codec::encode(cmd)?;
        let limit = self.config.serial.watchdog_timeout();
        let written = async {
            stream.write_all(&encoded).await?;
            stream.flush().await
        };
        let err = match timeout(limit, written).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => anyhow!("Serial write error: {}", e),
            Err(_) => anyhow!("Serial write timed out after {:?}", limit),
        };
        self.reporter.report(LinkEvent::SendFailed);
        Err(err)
    }
}

fn retry_delay(failures: u32) -> Duration {
    let ms = liveness::SERIAL_RETRY_DELAY_MS.saturating_mul(failures.max(1) as u64);
    Duration::from_millis(ms.min(liveness::SERIAL_MAX_RETRY_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::safety::SafetyMonitor;
    use crate::transport::mock::MockConnector;
    use firebot_shared::{Direction, Peer};
    use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

    fn config(max_retries: u32) -> Arc<BridgeConfig> {
        let mut config = BridgeConfig::default();
        config.serial.max_retries = max_retries;
        config.serial.ping_interval = 500;
        config.serial.watchdog_timeout = 2000;
        Arc::new(config)
    }

    fn start(
        connector: MockConnector,
        config: Arc<BridgeConfig>,
    ) -> (ControllerLink, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let mut monitor = SafetyMonitor::new(&config, Arc::new(TokioClock::new()));
        monitor.start_monitoring(rx.clone()).unwrap();
        let link = ControllerLink::new(connector, config, monitor.reporter(Peer::Controller), rx);
        (link, tx)
    }

    async fn next_command<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> ControllerCommand {
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let cmd: ControllerCommand = serde_json::from_str(&line).unwrap();
            if !matches!(cmd, ControllerCommand::Ping { .. }) {
                return cmd;
            }
        }
    }

    fn drive(speed: u16) -> ControllerCommand {
        ControllerCommand::Drive {
            direction: Direction::Forward,
            speed,
            heading: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_written_in_order() {
        let connector = MockConnector::new("/dev/mock");
        let peer = connector.push_stream();
        let (mut link, _shutdown) = start(connector, config(3));
        assert_eq!(link.recv().await, Some(ControllerEvent::Connected));

        for speed in [10, 20, 30] {
            link.try_send(drive(speed)).unwrap();
        }

        let mut reader = BufReader::new(peer);
        for speed in [10, 20, 30] {
            assert_eq!(next_command(&mut reader).await, drive(speed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_forwarded_and_pongs_swallowed() {
        let connector = MockConnector::new("/dev/mock");
        let mut peer = connector.push_stream();
        let (mut link, _shutdown) = start(connector, config(3));
        assert_eq!(link.recv().await, Some(ControllerEvent::Connected));

        peer.write_all(
            b"{\"frame\":\"pong\",\"seq\":1}\n{\"frame\":\"sensors\",\"readings\":{\"mq2\":1}}\n{\"frame\":\"status\",\"message\":\"ok\"}\n",
        )
        .await
        .unwrap();

        match link.recv().await {
            Some(ControllerEvent::Frame(ControllerFrame::Sensors { readings })) => {
                assert_eq!(readings["mq2"], 1.0)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            link.recv().await,
            Some(ControllerEvent::Frame(ControllerFrame::Status {
                message: "ok".into()
            }))
        );

        peer.write_all(b"garbage\n").await.unwrap();
        assert!(matches!(
            link.recv().await,
            Some(ControllerEvent::Malformed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_stop_jumps_the_queue() {
        let connector = MockConnector::new("/dev/mock");
        let peer = connector.push_stream();
        let (mut link, _shutdown) = start(connector, config(3));

        // Queue before the device is open so the writer sees everything at once
        link.try_send(drive(10)).unwrap();
        link.try_send(drive(20)).unwrap();
        assert!(link.safe_stop());
        assert!(!link.safe_stop(), "second stop is coalesced");

        assert_eq!(link.recv().await, Some(ControllerEvent::Connected));

        let mut reader = BufReader::new(peer);
        assert_eq!(next_command(&mut reader).await, ControllerCommand::Stop);

        // Queued motion was discarded; the next command is a fresh one
        link.try_send(drive(30)).unwrap();
        assert_eq!(next_command(&mut reader).await, drive(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_device_is_fatal_after_retries() {
        let connector = MockConnector::new("/dev/mock");
        let (mut link, _shutdown) = start(connector.clone(), config(2));

        match link.recv().await {
            Some(ControllerEvent::Fatal { reason }) => assert!(reason.contains("/dev/mock")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(connector.attempts(), 3);
        link.take_task().unwrap().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_motors_and_releases_device() {
        let connector = MockConnector::new("/dev/mock");
        let peer = connector.push_stream();
        let (mut link, shutdown) = start(connector.clone(), config(3));
        assert_eq!(link.recv().await, Some(ControllerEvent::Connected));
        assert!(connector.in_use());

        shutdown.send(true).unwrap();
        link.take_task().unwrap().await.unwrap();

        let mut reader = BufReader::new(peer);
        assert_eq!(next_command(&mut reader).await, ControllerCommand::Stop);
        assert!(!connector.in_use());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_that_stops_reading_is_reopened() {
        let connector = MockConnector::new("/dev/mock");
        // Stalled on flow control: the first ping never fits
        let _stalled = connector.push_stream_with_capacity(8);
        let _second = connector.push_stream();
        let (mut link, _shutdown) = start(connector.clone(), config(3));

        assert_eq!(link.recv().await, Some(ControllerEvent::Connected));
        match link.recv().await {
            Some(ControllerEvent::Disconnected { reason }) => {
                assert!(reason.contains("timed out"), "{reason}")
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(link.recv().await, Some(ControllerEvent::Connected));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_request_from_before_open_is_ignored() {
        let connector = MockConnector::new("/dev/mock");
        let (mut link, _shutdown) = start(connector.clone(), config(3));
        link.request_reconnect();

        let peer = connector.push_stream();
        assert_eq!(link.recv().await, Some(ControllerEvent::Connected));

        let mut reader = BufReader::new(peer);
        link.try_send(drive(10)).unwrap();
        assert_eq!(next_command(&mut reader).await, drive(10));
        assert_eq!(connector.attempts(), 1);
    }

    #[test]
    fn test_retry_delay() {
        assert_eq!(retry_delay(0), Duration::from_millis(1000));
        assert_eq!(retry_delay(2), Duration::from_millis(2000));
        assert_eq!(retry_delay(9), Duration::from_millis(5000));
    }
}
