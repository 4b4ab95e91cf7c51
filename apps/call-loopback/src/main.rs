//! Runs a full two-party audio call inside one process: two lifecycles, two
//! webrtc-rs peer connections and an in-memory signaling bus.

mod gate;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use call_negotiation::rtc::{RemoteAudioFrame, RtcConnectionFactory, RtcMediaSession};
use call_negotiation::{
    BusSignalingTransport, CallConfig, CallEvent, CallLifecycle, CallSession, CallStatus,
    SignalingTransport,
};
use clap::Parser;
use signal_bus::LocalBus;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::gate::GatedSignaling;
use crate::logging::{LogConfig, LogLevel};

// Opus TOC for a 20 ms silent frame.
const SILENCE_FRAME: &[u8] = &[0xF8, 0xFF, 0xFE];
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(
    name = "call-loopback",
    author,
    version,
    about = "Negotiate and run an audio call between two local peers"
)]
struct Cli {
    #[arg(long, value_enum, env = "CALL_LOG_LEVEL", default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, env = "CALL_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[arg(long, default_value = "loopback")]
    call_id: String,

    /// Overrides the Callee's fallback offer timeout.
    #[arg(long)]
    fallback_ms: Option<u64>,

    /// Hold both sides' signaling until each has offered, forcing an offer
    /// collision that the Callee resolves by rolling back.
    #[arg(long)]
    glare: bool,

    #[arg(long, default_value_t = 5)]
    duration_secs: u64,

    #[arg(long, default_value_t = 15)]
    connect_timeout_secs: u64,
}

struct Side {
    name: &'static str,
    call: CallLifecycle,
    media: Arc<RtcMediaSession>,
    gate: Option<Arc<GatedSignaling>>,
    received: Arc<AtomicU64>,
    sent: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl Side {
    fn new(name: &'static str, config: CallConfig, bus: &Arc<LocalBus>, glare: bool) -> Self {
        let bus_transport: Arc<dyn SignalingTransport> =
            Arc::new(BusSignalingTransport::new(bus.clone()));
        let (gate, transport): (Option<Arc<GatedSignaling>>, Arc<dyn SignalingTransport>) =
            if glare {
                let gate = Arc::new(GatedSignaling::closed(bus_transport));
                (Some(gate.clone()), gate)
            } else {
                (None, bus_transport)
            };

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let media = Arc::new(RtcMediaSession::new(&config).with_playback(playback_tx));
        let call = CallLifecycle::new(
            config,
            media.clone(),
            Arc::new(RtcConnectionFactory::new()),
            transport,
        );
        let received = Arc::new(AtomicU64::new(0));

        let mut side = Self {
            name,
            call,
            media,
            gate,
            received: received.clone(),
            sent: Arc::new(AtomicU64::new(0)),
            tasks: Vec::new(),
        };
        side.tasks.push(tokio::spawn(count_frames(playback_rx, received)));
        side.tasks.push(tokio::spawn(report_events(name, side.call.clone())));
        side
    }

    fn start_silence(&mut self) {
        let media = self.media.clone();
        let sent = self.sent.clone();
        let name = self.name;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(track) = media.local_track() else {
                    continue;
                };
                match track
                    .write_frame(Bytes::from_static(SILENCE_FRAME), FRAME_INTERVAL)
                    .await
                {
                    Ok(true) => {
                        sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(side = name, error = %err, "silence frame rejected");
                        break;
                    }
                }
            }
        }));
    }

    async fn finish(self) -> (u64, u64) {
        self.call.end().await;
        for task in &self.tasks {
            task.abort();
        }
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }
}

async fn count_frames(mut frames: mpsc::UnboundedReceiver<RemoteAudioFrame>, received: Arc<AtomicU64>) {
    while let Some(frame) = frames.recv().await {
        let total = received.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 {
            tracing::info!(track_id = %frame.track_id, "first remote audio frame");
        }
    }
}

async fn report_events(name: &'static str, call: CallLifecycle) {
    let mut events = call.events();
    loop {
        match events.recv().await {
            Ok(CallEvent::StatusChanged(status)) => {
                tracing::info!(side = name, status = ?status, "call status");
            }
            Ok(CallEvent::RemoteAudio { track_id }) => {
                tracing::info!(side = name, track_id = %track_id, "remote audio arrived");
            }
            Ok(CallEvent::PlaybackBlocked) => {
                // Stands in for the user gesture a real client would wait for.
                tracing::info!(side = name, "playback blocked; resuming");
                if let Err(err) = call.resume_playback().await {
                    tracing::warn!(side = name, error = %err, "resume failed");
                }
            }
            Ok(CallEvent::Failed { call_id }) => {
                tracing::warn!(side = name, call_id = %call_id, "call failed");
            }
            Ok(CallEvent::Ended { call_id }) => {
                tracing::info!(side = name, call_id = %call_id, "call ended");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(side = name, skipped, "event receiver lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn wait_connected(mut status: watch::Receiver<CallStatus>) -> anyhow::Result<()> {
    loop {
        match *status.borrow_and_update() {
            CallStatus::Connected => return Ok(()),
            CallStatus::Failed => bail!("call failed before connecting"),
            CallStatus::Ended => bail!("call ended before connecting"),
            _ => {}
        }
        status.changed().await.context("call lifecycle dropped")?;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let base = CallConfig::from_env().context("invalid call configuration")?;
    let mut callee_config = base.clone();
    if let Some(millis) = cli.fallback_ms {
        callee_config.fallback_offer_timeout = Duration::from_millis(millis);
        callee_config.validate()?;
    }

    let bus = Arc::new(LocalBus::new());
    let session = CallSession::new(cli.call_id.as_str(), "alice", "bob");
    let mut alice = Side::new("alice", base, &bus, cli.glare);
    let mut bob = Side::new("bob", callee_config.clone(), &bus, cli.glare);

    bob.call.start(session.clone(), "bob".into()).await?;
    alice.call.start(session.clone(), "alice".into()).await?;

    if let (Some(alice_gate), Some(bob_gate)) = (alice.gate.clone(), bob.gate.clone()) {
        // Let the Callee's fallback offer fire behind the gate.
        tokio::time::sleep(callee_config.fallback_offer_timeout + Duration::from_millis(250)).await;
        tracing::info!(
            alice_held = alice_gate.held(),
            bob_held = bob_gate.held(),
            "releasing both offers at once"
        );
        alice_gate.release().await?;
        bob_gate.release().await?;
    }

    let connect_timeout = Duration::from_secs(cli.connect_timeout_secs);
    let connected = tokio::time::timeout(connect_timeout, async {
        tokio::try_join!(
            wait_connected(alice.call.status()),
            wait_connected(bob.call.status())
        )
    })
    .await;
    match connected {
        Ok(Ok(_)) => println!("call {} connected", session.call_id),
        Ok(Err(err)) => {
            alice.finish().await;
            bob.finish().await;
            return Err(err);
        }
        Err(_) => {
            alice.finish().await;
            bob.finish().await;
            bail!("peers did not connect within {}s", cli.connect_timeout_secs);
        }
    }

    alice.start_silence();
    bob.start_silence();

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
        }
    }

    let (alice_sent, alice_received) = alice.finish().await;
    let (bob_sent, bob_received) = bob.finish().await;
    println!("alice: sent {alice_sent} frames, received {alice_received}");
    println!("bob:   sent {bob_sent} frames, received {bob_received}");
    Ok(())
}
