mod command;
mod operator;
mod session;

use anyhow::Result;
use clap::Parser;
use command::{CommandDispatcher, TimeoutTracker};
use firebot_shared::{BridgeMessage, Heartbeat, StationMessage};
use session::{BridgeSession, SessionHandle, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Headless control station for bench testing the firebot bridge
#[derive(Parser, Debug)]
#[command(name = "station", version, about)]
struct Cli {
    /// Address to accept bridge connections on
    #[arg(long, default_value = "0.0.0.0:9999", env = "STATION_LISTEN")]
    listen: SocketAddr,

    /// Heartbeat period towards connected bridges, in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let listener = TcpListener::bind(cli.listen).await?;
    info!(addr = %cli.listen, "Station listening");

    let sessions = Arc::new(SessionManager::new());
    let dispatcher = Arc::new(CommandDispatcher::new(sessions.clone()));

    let tracker = TimeoutTracker::new(dispatcher.clone());
    tokio::spawn(async move { tracker.run().await });
    tokio::spawn(operator::run_stdin(dispatcher.clone()));
    tokio::spawn(reap_dead_sessions(sessions.clone()));
    tokio::spawn(send_heartbeats(
        sessions.clone(),
        Duration::from_millis(cli.heartbeat_ms.max(10)),
    ));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, addr) = accepted?;
                if let Err(e) = socket.set_nodelay(true) {
                    debug!(%addr, error = %e, "set_nodelay failed");
                }
                tokio::spawn(serve(socket, addr, sessions.clone(), dispatcher.clone()));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Station shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Run one bridge session to completion
async fn serve<S>(
    stream: S,
    addr: SocketAddr,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<CommandDispatcher>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut session = BridgeSession::new(stream, addr);
    let handle = session.handle();
    sessions.register(handle.clone()).await;
    let count = sessions.count().await;
    info!(%addr, sessions = count, "Bridge connected");

    while let Some(msg) = session.recv().await {
        handle_message(&handle, &dispatcher, msg).await;
    }

    sessions.unregister(&addr).await;
    info!(
        %addr,
        connected_s = handle.connected_at.elapsed().as_secs(),
        "Bridge disconnected"
    );
}

async fn handle_message(handle: &SessionHandle, dispatcher: &CommandDispatcher, msg: BridgeMessage) {
    let addr = handle.addr;
    match msg {
        BridgeMessage::Heartbeat(hb) => {
            let ack = StationMessage::HeartbeatAck(Heartbeat::new(hb.seq));
            if let Err(e) = handle.send(&ack).await {
                warn!(%addr, error = %e, "Failed to answer heartbeat");
            }
        }
        BridgeMessage::HeartbeatAck(hb) => debug!(%addr, seq = hb.seq, "Heartbeat acknowledged"),
        BridgeMessage::Telemetry(t) => {
            for r in &t.readings {
                if r.alert {
                    warn!(seq = t.seq, sensor = %r.sensor, value = r.value, "ALERT");
                } else {
                    info!(seq = t.seq, sensor = %r.sensor, value = r.value, "Reading");
                }
            }
        }
        BridgeMessage::Ack(ack) => {
            dispatcher.handle_ack(&ack).await;
        }
        BridgeMessage::Alert(alert) => {
            warn!(%addr, kind = ?alert.kind, message = %alert.message, "Bridge alert")
        }
        BridgeMessage::Status(s) => {
            info!(%addr, station = %s.station, controller = %s.controller, "Link status")
        }
        BridgeMessage::Error(e) => error!(%addr, message = %e.message, "Bridge reported error"),
    }
}

async fn reap_dead_sessions(sessions: Arc<SessionManager>) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        for addr in sessions.remove_dead_sessions().await {
            warn!(%addr, "Bridge silent, session dropped");
        }
    }
}

async fn send_heartbeats(sessions: Arc<SessionManager>, period: Duration) {
    let mut ticker = interval(period);
    let mut seq = 0u64;
    loop {
        ticker.tick().await;
        seq += 1;
        sessions
            .broadcast(&StationMessage::Heartbeat(Heartbeat::new(seq)))
            .await;
    }
}
