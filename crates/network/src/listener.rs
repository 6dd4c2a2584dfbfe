//! Inbound listeners: the command server and the publication fan-out.

use futures_util::{SinkExt, StreamExt};
use meridian_primitives::{KvRequest, KvResponse, WireMessage};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::JsonCodec;

/// Queue depth between a connection's reader and its writer half.
const CONN_WRITE_QUEUE: usize = 64;

/// A request read off a command connection, with the path to answer it.
#[derive(Debug)]
pub enum ServerEvent {
    Request {
        /// Node id from the connection's `Hello`, when the sender is a
        /// peer store rather than an anonymous tool.
        peer: Option<String>,
        request: KvRequest,
        reply: ReplyHandle,
    },
}

/// One-shot path back to the requesting connection. Dropping it without
/// sending is fine for fire-and-forget requests.
#[derive(Debug)]
pub struct ReplyHandle {
    id: Option<u64>,
    tx: mpsc::Sender<WireMessage>,
}

impl ReplyHandle {
    pub fn wants_response(&self) -> bool {
        self.id.is_some()
    }

    pub fn send(self, response: KvResponse) {
        if let Some(id) = self.id {
            if self
                .tx
                .try_send(WireMessage::Response { id, response })
                .is_err()
            {
                debug!("response dropped, command connection backlogged or gone");
            }
        }
    }
}

/// Accepts command connections and forwards their requests into `events`.
pub fn spawn_cmd_server(listener: TcpListener, events: mpsc::Sender<ServerEvent>) {
    drop(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    drop(tokio::spawn(serve_connection(stream, addr, events.clone())));
                }
                Err(err) => {
                    warn!(%err, "command accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }));
}

async fn serve_connection(stream: TcpStream, addr: SocketAddr, events: mpsc::Sender<ServerEvent>) {
    let framed = Framed::new(stream, JsonCodec::<WireMessage>::new());
    let (mut sink, mut frames) = framed.split();

    let (write_tx, mut write_rx) = mpsc::channel::<WireMessage>(CONN_WRITE_QUEUE);
    drop(tokio::spawn(async move {
        while let Some(message) = write_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    }));

    let mut peer = None;
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(WireMessage::Hello {
                node_id,
                connect_id,
            }) => {
                debug!(%addr, %node_id, %connect_id, "peer session opened");
                peer = Some(node_id);
            }
            Ok(WireMessage::Request { id, request }) => {
                let event = ServerEvent::Request {
                    peer: peer.clone(),
                    request,
                    reply: ReplyHandle {
                        id,
                        tx: write_tx.clone(),
                    },
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Ok(WireMessage::Response { .. }) => {
                debug!(%addr, "ignoring unexpected response frame");
            }
            Err(err) => {
                debug!(%addr, %err, "command connection failed");
                return;
            }
        }
    }
}

/// Accepts subscriber connections and replays every published item to
/// each of them. Slow subscribers lag and miss items rather than slow
/// the publisher down.
pub fn spawn_pub_fanout<T>(listener: TcpListener, publications: broadcast::Sender<T>)
where
    T: Clone + Serialize + Send + 'static,
{
    drop(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "publication subscriber connected");
                    let mut rx = publications.subscribe();
                    drop(tokio::spawn(async move {
                        let mut framed = Framed::new(stream, JsonCodec::<T>::new());
                        loop {
                            match rx.recv().await {
                                Ok(item) => {
                                    if framed.send(item).await.is_err() {
                                        return;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(missed)) => {
                                    debug!(%addr, missed, "subscriber lagged");
                                }
                                Err(broadcast::error::RecvError::Closed) => return,
                            }
                        }
                    }));
                }
                Err(err) => {
                    warn!(%err, "publication accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }));
}
