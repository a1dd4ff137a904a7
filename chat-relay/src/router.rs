use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{DEFAULT_MAX_LINE_LENGTH, Notice, ServerLine},
    registry::{Registry, SessionHandle},
    session::{self, SessionId},
};

/// Upper bound on delivering the shutdown notice to any one session.
const SHUTDOWN_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime knobs for a [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_line_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Accept loop that hands every connection its own session task.
pub struct Relay {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared registry, for inspecting who is logged in.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            registry,
            config,
        } = self;
        let mut next_id: SessionId = 1;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&registry).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, next_id, &registry, &config);
                    next_id += 1;
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

async fn handle_shutdown(registry: &Registry) {
    let names = registry.names().await;
    info!(sessions = names.len(), ?names, "relay shutting down");

    // A peer that stopped reading can hold its writer lock indefinitely, so each
    // notice gets its own task and deadline.
    let mut notices = JoinSet::new();
    for handle in registry.handles().await {
        notices.spawn(async move {
            let notice = ServerLine::from(Notice::ShuttingDown);
            match timeout(SHUTDOWN_NOTICE_TIMEOUT, handle.send(&notice)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(name = handle.name(), error = ?err, "failed to deliver shutdown notice")
                }
                Err(_) => debug!(name = handle.name(), "shutdown notice timed out"),
            }
        });
    }
    while notices.join_next().await.is_some() {}
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    id: SessionId,
    registry: &Arc<Registry>,
    config: &RelayConfig,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, id, registry, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    registry: &Arc<Registry>,
    config: &RelayConfig,
) {
    info!(peer = %peer, session = id, "connection accepted");
    let registry = Arc::clone(registry);
    let max_line_length = config.max_line_length;
    tokio::spawn(async move {
        if let Err(err) = session::handle_connection(stream, id, registry, max_line_length).await {
            warn!(peer = %peer, session = id, error = ?err, "session closed with error");
        }
    });
}

/// Result of a single relay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    UnknownRecipient,
    /// The recipient was registered but its stream rejected the write.
    Failed,
}

/// Forwards `body` from `sender` to `recipient`, notifying the sender when it cannot.
///
/// The registry lock is released before writing, so a recipient that disconnects
/// in between shows up as [`Delivery::Failed`]. The returned error is only ever a
/// failure to write a notice back to the sender.
pub async fn route(
    registry: &Registry,
    sender: &SessionHandle,
    recipient: &str,
    body: &str,
) -> io::Result<Delivery> {
    let Some(target) = registry.lookup(recipient).await else {
        sender
            .send(&Notice::UserNotFound {
                recipient: recipient.to_string(),
            })
            .await?;
        return Ok(Delivery::UnknownRecipient);
    };

    let relayed = ServerLine::Relayed {
        sender: sender.name().to_string(),
        body: body.to_string(),
    };
    if let Err(err) = target.send(&relayed).await {
        debug!(sender = sender.name(), recipient, error = ?err, "failed to relay message");
        sender
            .send(&Notice::FailedToSend {
                recipient: recipient.to_string(),
            })
            .await?;
        return Ok(Delivery::Failed);
    }

    Ok(Delivery::Delivered)
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, BufReader, DuplexStream},
        sync::Mutex,
    };

    use super::*;
    use crate::registry::BoxedWriter;

    fn handle(id: SessionId, name: &str) -> (SessionHandle, BufReader<DuplexStream>) {
        let (writer, peer) = tokio::io::duplex(1024);
        let writer: BoxedWriter = Box::new(writer);
        (
            SessionHandle::new(id, name, Arc::new(Mutex::new(writer))),
            BufReader::new(peer),
        )
    }

    async fn read_line(peer: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        peer.read_line(&mut line).await.expect("read line");
        line.trim_end_matches('\n').to_string()
    }

    #[tokio::test]
    async fn route_delivers_to_registered_recipient() {
        let registry = Registry::new();
        let (alice, _alice_peer) = handle(1, "alice");
        let (bob, mut bob_peer) = handle(2, "bob");
        registry.register(alice.clone()).await.expect("alice");
        registry.register(bob).await.expect("bob");

        let delivery = route(&registry, &alice, "bob", "hello").await.expect("route");

        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(read_line(&mut bob_peer).await, "@alice: hello");
    }

    #[tokio::test]
    async fn route_reports_unknown_recipient_to_sender() {
        let registry = Registry::new();
        let (alice, mut alice_peer) = handle(1, "alice");
        registry.register(alice.clone()).await.expect("alice");

        let delivery = route(&registry, &alice, "ghost", "hi").await.expect("route");

        assert_eq!(delivery, Delivery::UnknownRecipient);
        assert_eq!(
            read_line(&mut alice_peer).await,
            "[System] User 'ghost' not found."
        );
    }

    #[tokio::test]
    async fn route_reports_broken_recipient_stream_to_sender() {
        let registry = Registry::new();
        let (alice, mut alice_peer) = handle(1, "alice");
        let (bob, bob_peer) = handle(2, "bob");
        registry.register(alice.clone()).await.expect("alice");
        registry.register(bob).await.expect("bob");
        drop(bob_peer);

        let delivery = route(&registry, &alice, "bob", "anyone there?")
            .await
            .expect("route");

        assert_eq!(delivery, Delivery::Failed);
        assert_eq!(
            read_line(&mut alice_peer).await,
            "[System] Failed to send to bob."
        );
    }
}
