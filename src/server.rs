use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    frame::{self, Frame, Identity},
    registry::{OutboundSender, Registry},
};

/// One raw line read off a connection, tagged with the reader's identity
/// and waiting to be routed. Decoding happens in the dispatcher, never in
/// the reader.
struct RoutingItem {
    sender: Identity,
    line: String,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    inbound_tx: mpsc::UnboundedSender<RoutingItem>,
    inbound_rx: mpsc::UnboundedReceiver<RoutingItem>,
}

struct ServerState {
    registry: Registry,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            listener,
            state: Arc::new(ServerState {
                registry: Registry::new(),
            }),
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. The dispatcher task
    /// drains the inbound queue for the whole run and winds down once the
    /// last reader is gone.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            state,
            inbound_tx,
            inbound_rx,
        } = self;

        tokio::spawn(run_dispatcher(Arc::clone(&state), inbound_rx));
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &inbound_tx).await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &Arc<ServerState>) {
    info!("server shutting down");
    // Dropping every outbound sender stops each writer task, which shuts
    // its stream down and lets the peer see EOF.
    state.registry.clear().await;
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    inbound_tx: &mpsc::UnboundedSender<RoutingItem>,
) {
    match result {
        Ok((stream, peer)) => handle_accept(stream, peer, state, inbound_tx).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Brings one accepted connection to life: register it, spawn its writer,
/// announce it, spawn its reader.
///
/// The registry entry exists before any frame is written, and every write
/// to the connection from here on goes through its outbound queue.
async fn handle_accept(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    inbound_tx: &mpsc::UnboundedSender<RoutingItem>,
) {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let identity = state.registry.register(outbound_tx.clone()).await;
    info!(%peer, identity, "connection registered");

    tokio::spawn(run_writer(identity, write_half, outbound_rx));

    announce(state, identity, &outbound_tx).await;

    let state = Arc::clone(state);
    let inbound_tx = inbound_tx.clone();
    tokio::spawn(run_reader(identity, read_half, state, inbound_tx));
}

/// Greets the new connection and tells everyone else about it: the hello
/// frame carries the assigned identity, each existing peer gets a join
/// notice, and once more than one connection is registered the full list
/// goes out to all of them. Clients that already hold a list ignore the
/// repeat delivery.
async fn announce(state: &Arc<ServerState>, identity: Identity, outbound: &OutboundSender) {
    let _ = outbound.send(Frame::ServerHello(identity));

    let identities = state.registry.snapshot().await;
    for &peer in identities.iter().filter(|&&peer| peer != identity) {
        send_to(state, peer, Frame::NewClient(identity)).await;
    }

    if identities.len() > 1 {
        for &peer in &identities {
            send_to(state, peer, Frame::ClientList(identities.clone())).await;
        }
    }
}

/// Best-effort enqueue to one connection; a peer that disconnects
/// mid-broadcast is skipped.
async fn send_to(state: &Arc<ServerState>, identity: Identity, frame: Frame) {
    if let Some(outbound) = state.registry.lookup(identity).await {
        let _ = outbound.send(frame);
    }
}

/// Sole writer for one connection. Drains the outbound queue until it is
/// closed or a write fails, then shuts the stream down.
async fn run_writer(
    identity: Identity,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(err) = frame::write_frame(&mut write_half, &frame).await {
            debug!(identity, error = ?err, "write failed, stopping writer");
            break;
        }
    }

    if let Err(err) = write_half.shutdown().await {
        debug!(identity, error = ?err, "failed to shut down write half");
    }
}

/// Reads lines off one connection for its whole lifetime and submits them
/// for routing in read order. Any read failure, clean EOF included,
/// removes the connection from the registry and ends the task. Peers get
/// no leave notice.
async fn run_reader(
    identity: Identity,
    read_half: OwnedReadHalf,
    state: Arc<ServerState>,
    inbound_tx: mpsc::UnboundedSender<RoutingItem>,
) {
    let mut reader = BufReader::new(read_half);

    loop {
        match frame::read_line(&mut reader).await {
            Ok(Some(line)) => {
                let item = RoutingItem {
                    sender: identity,
                    line,
                };
                if inbound_tx.send(item).is_err() {
                    // Dispatcher is gone; the server is winding down.
                    break;
                }
            }
            Ok(None) => {
                info!(identity, "peer disconnected");
                break;
            }
            Err(err) => {
                warn!(identity, error = ?err, "read failed, dropping connection");
                break;
            }
        }
    }

    state.registry.unregister(identity).await;
}

/// The single routing serialization point: drains the inbound queue in
/// arrival order, resolves each destination, and forwards the message.
/// Malformed lines and unresolvable destinations are dropped; neither
/// stops the loop.
async fn run_dispatcher(
    state: Arc<ServerState>,
    mut inbound_rx: mpsc::UnboundedReceiver<RoutingItem>,
) {
    while let Some(RoutingItem { sender, line }) = inbound_rx.recv().await {
        let (destination, text) = match frame::parse_route(&line) {
            Ok(route) => route,
            Err(err) => {
                warn!(sender, error = %err, "dropping malformed frame");
                continue;
            }
        };

        match state.registry.lookup(destination).await {
            Some(outbound) => {
                // Enqueue failure means the destination is mid-teardown;
                // delivery is fire-and-forget either way.
                let _ = outbound.send(Frame::Regular {
                    sender,
                    text: text.to_string(),
                });
            }
            None => debug!(sender, destination, "destination not registered, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_registry() -> Arc<ServerState> {
        Arc::new(ServerState {
            registry: Registry::new(),
        })
    }

    #[tokio::test]
    async fn dispatcher_routes_to_the_addressed_identity_only() {
        let state = state_with_registry();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = state.registry.register(a_tx).await;
        let b = state.registry.register(b_tx).await;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&state), inbound_rx));

        inbound_tx
            .send(RoutingItem {
                sender: a,
                line: frame::encode_route(b, "hello"),
            })
            .expect("submit routing item");
        drop(inbound_tx);
        dispatcher.await.expect("dispatcher task");

        assert_eq!(
            b_rx.recv().await,
            Some(Frame::Regular {
                sender: a,
                text: "hello".into()
            })
        );
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatcher_survives_malformed_and_unroutable_items() {
        let state = state_with_registry();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let a = state.registry.register(a_tx).await;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&state), inbound_rx));

        for line in ["abc:hello", "no separator", "99:nobody home"] {
            inbound_tx
                .send(RoutingItem {
                    sender: a,
                    line: line.to_string(),
                })
                .expect("submit routing item");
        }
        inbound_tx
            .send(RoutingItem {
                sender: a,
                line: frame::encode_route(a, "still here"),
            })
            .expect("submit routing item");
        drop(inbound_tx);
        dispatcher.await.expect("dispatcher task");

        assert_eq!(
            a_rx.recv().await,
            Some(Frame::Regular {
                sender: a,
                text: "still here".into()
            })
        );
        assert!(a_rx.try_recv().is_err());
    }
}
