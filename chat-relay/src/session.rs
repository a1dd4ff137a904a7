use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{Directive, Inbound, LineReader, Notice, ParseError, ServerLine, write_line},
    registry::{BoxedWriter, RegisterError, Registry, SessionHandle},
    router::{self, Delivery},
};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream open, no name accepted yet.
    Connecting,
    /// Name accepted and present in the registry.
    Authenticated,
    Closed,
}

/// Server-side bookkeeping for one client connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    name: Option<String>,
    state: SessionState,
}

impl Session {
    pub fn new(id: SessionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            name: None,
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Records the accepted name. Only succeeds once, from `Connecting`.
    pub fn authenticate(&mut self, name: String) -> bool {
        if self.state != SessionState::Connecting {
            return false;
        }
        self.name = Some(name);
        self.state = SessionState::Authenticated;
        true
    }

    /// Moves to `Closed`; returns `false` if the session was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }
}

/// Runs one accepted TCP connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    id: SessionId,
    registry: Arc<Registry>,
    max_line_length: usize,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    run_session(reader, writer, id, peer, registry, max_line_length).await
}

/// Drives the login handshake and directive loop over any byte stream.
///
/// The registry entry is removed and the writer shut down on every exit path,
/// including read errors.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    id: SessionId,
    peer: Option<SocketAddr>,
    registry: Arc<Registry>,
    max_line_length: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Sync + Unpin + 'static,
{
    let mut reader = LineReader::new(reader, max_line_length);
    let writer: BoxedWriter = Box::new(writer);
    let writer = Arc::new(Mutex::new(writer));
    let mut session = Session::new(id, peer);

    let outcome = serve(&mut session, &mut reader, &writer, &registry).await;
    cleanup(&mut session, &registry, &writer).await;

    outcome
}

async fn serve<R>(
    session: &mut Session,
    reader: &mut LineReader<R>,
    writer: &Arc<Mutex<BoxedWriter>>,
    registry: &Registry,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(name) = read_login(reader, writer).await? else {
        debug!(peer = ?session.peer(), "connection closed before login");
        return Ok(());
    };

    let handle = SessionHandle::new(session.id(), name.clone(), Arc::clone(writer));
    register_and_welcome(session, registry, &handle, writer).await?;
    relay_directives(&handle, reader, registry).await
}

async fn read_login<R>(
    reader: &mut LineReader<R>,
    writer: &Arc<Mutex<BoxedWriter>>,
) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next_line().await? {
            Some(Inbound::Line(line)) => return Ok(Some(line.trim().to_string())),
            Some(Inbound::TooLong) => {
                let mut writer = writer.lock().await;
                write_line(&mut **writer, &Notice::MessageTooLong).await?;
            }
            None => return Ok(None),
        }
    }
}

async fn register_and_welcome(
    session: &mut Session,
    registry: &Registry,
    handle: &SessionHandle,
    writer: &Arc<Mutex<BoxedWriter>>,
) -> Result<()> {
    // Held until the welcome is written, so a relay racing in behind the
    // registration queues up after it.
    let mut writer = writer.lock().await;

    if let Err(err) = registry.register(handle.clone()).await {
        warn!(peer = ?session.peer(), name = handle.name(), error = %err, "login rejected");
        let notice = match &err {
            RegisterError::EmptyName => Notice::EmptyName,
            RegisterError::NameTaken(name) => Notice::NameTaken { name: name.clone() },
        };
        write_line(&mut **writer, &notice).await?;
        return Err(err.into());
    }

    session.authenticate(handle.name().to_string());
    info!(peer = ?session.peer(), name = handle.name(), "user logged in");

    let welcome = ServerLine::Welcome {
        name: handle.name().to_string(),
    };
    write_line(&mut **writer, &welcome).await?;
    Ok(())
}

async fn relay_directives<R>(
    handle: &SessionHandle,
    reader: &mut LineReader<R>,
    registry: &Registry,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(inbound) = reader.next_line().await? {
        match inbound {
            Inbound::Line(line) if line.trim().is_empty() => {}
            Inbound::Line(line) => handle_directive(handle, registry, &line).await?,
            Inbound::TooLong => handle.send(&Notice::MessageTooLong).await?,
        }
    }
    Ok(())
}

async fn handle_directive(handle: &SessionHandle, registry: &Registry, line: &str) -> Result<()> {
    let directive = match Directive::parse(line) {
        Ok(directive) => directive,
        Err(ParseError::MissingSeparator) => {
            handle.send(&Notice::InvalidFormat).await?;
            return Ok(());
        }
    };

    let delivery = router::route(registry, handle, &directive.recipient, &directive.body).await?;
    if delivery != Delivery::Delivered {
        debug!(
            sender = handle.name(),
            recipient = %directive.recipient,
            ?delivery,
            "message not relayed"
        );
    }
    Ok(())
}

async fn cleanup(session: &mut Session, registry: &Registry, writer: &Arc<Mutex<BoxedWriter>>) {
    if !session.close() {
        return;
    }

    if let Some(name) = session.name() {
        if registry.unregister(name, session.id()).await.is_some() {
            info!(peer = ?session.peer(), name, "user disconnected");
        }
    }

    let mut writer = writer.lock().await;
    if let Err(err) = writer.shutdown().await {
        debug!(peer = ?session.peer(), error = ?err, "failed to shut down session stream");
    }
}
