//! Outgoing peer links.
//!
//! A [`PeerLink`] owns one TCP session to a peer's command endpoint,
//! identified by a per-session connect id. The link task reconnects on
//! its own; frames queue up to the high watermark while the session is
//! down, and a full queue surfaces as a send error that drives the
//! caller's backoff machinery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meridian_primitives::{KvResponse, WireMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::JsonCodec;
use crate::TransportError;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// What a link reports back to its owner's event loop.
#[derive(Debug)]
pub enum LinkEvent {
    /// A solicited response arrived from `peer`.
    Response {
        peer: String,
        id: u64,
        response: KvResponse,
    },
    /// The TCP session to `peer` dropped; the link is retrying.
    Down { peer: String },
}

#[derive(Debug)]
pub struct PeerLink {
    peer: String,
    connect_id: String,
    tx: mpsc::Sender<WireMessage>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl PeerLink {
    /// Spawns the link task; the handle is live immediately, the session
    /// comes up in the background.
    pub fn open(
        node_id: &str,
        peer: &str,
        connect_id: &str,
        addr: String,
        capacity: usize,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        drop(tokio::spawn(run_link(
            node_id.to_owned(),
            peer.to_owned(),
            connect_id.to_owned(),
            addr,
            rx,
            Arc::clone(&connected),
            Arc::clone(&shutdown),
            events,
        )));

        Self {
            peer: peer.to_owned(),
            connect_id: connect_id.to_owned(),
            tx,
            connected,
            shutdown,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connect_id(&self) -> &str {
        &self.connect_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queues a frame for the session. Frames queue while the session is
    /// still coming up and flush once it does; the send fails only when
    /// the queue hits its high watermark or the link was torn down.
    pub fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull {
                peer: self.peer.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed {
                peer: self.peer.clone(),
            },
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_link(
    node_id: String,
    peer: String,
    connect_id: String,
    addr: String,
    mut rx: mpsc::Receiver<WireMessage>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    events: mpsc::Sender<LinkEvent>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%peer, %addr, %err, "peer connect failed, retrying");
                // Queued frames stay queued until the session comes up.
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        let mut framed = Framed::new(stream, JsonCodec::<WireMessage>::new());
        if framed
            .send(WireMessage::Hello {
                node_id: node_id.clone(),
                connect_id: connect_id.clone(),
            })
            .await
            .is_err()
        {
            sleep(RECONNECT_DELAY).await;
            continue;
        }
        connected.store(true, Ordering::Relaxed);
        debug!(%peer, %addr, %connect_id, "peer link established");

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => {
                        if let Err(err) = framed.send(message).await {
                            warn!(%peer, %err, "peer link send failed");
                            break;
                        }
                    }
                    None => return,
                },
                frame = framed.next() => match frame {
                    Some(Ok(WireMessage::Response { id, response })) => {
                        let _ = events
                            .send(LinkEvent::Response { peer: peer.clone(), id, response })
                            .await;
                    }
                    Some(Ok(_)) => debug!(%peer, "ignoring unexpected frame on peer link"),
                    Some(Err(err)) => {
                        warn!(%peer, %err, "peer link receive failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        connected.store(false, Ordering::Relaxed);
        let _ = events.send(LinkEvent::Down { peer: peer.clone() }).await;
        sleep(RECONNECT_DELAY).await;
    }
}
