use std::{collections::HashMap, fmt, io, sync::Arc};

use thiserror::Error;
use tokio::{io::AsyncWrite, sync::Mutex};

use crate::{protocol::write_line, session::SessionId};

/// Outbound half of a client stream. Boxed so tests can substitute in-memory pipes.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Cloneable reference to a live session's outbound stream.
///
/// The session task owns the read half; every clone of the handle shares the
/// same writer, guarded by its own lock so concurrent relays never interleave
/// partial lines.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    name: String,
    writer: Arc<Mutex<BoxedWriter>>,
}

impl SessionHandle {
    pub fn new(id: SessionId, name: impl Into<String>, writer: Arc<Mutex<BoxedWriter>>) -> Self {
        Self {
            id,
            name: name.into(),
            writer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes one line to this session's peer.
    pub async fn send<T>(&self, line: &T) -> io::Result<()>
    where
        T: fmt::Display + ?Sized,
    {
        let mut writer = self.writer.lock().await;
        write_line(&mut **writer, line).await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("name cannot be empty")]
    EmptyName,
    #[error("name '{0}' is already in use")]
    NameTaken(String),
}

/// Process-wide map from logged-in name to the session using it.
///
/// All access goes through the internal lock; handles are cloned out so the
/// lock is never held while writing to a socket.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the handle under its name. An existing entry is never replaced.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), RegisterError> {
        if handle.name().trim().is_empty() {
            return Err(RegisterError::EmptyName);
        }

        let mut entries = self.entries.lock().await;
        if entries.contains_key(handle.name()) {
            return Err(RegisterError::NameTaken(handle.name().to_string()));
        }

        entries.insert(handle.name().to_string(), handle);
        Ok(())
    }

    /// Removes `name` only if it is still owned by session `id`.
    pub async fn unregister(&self, name: &str, id: SessionId) -> Option<SessionHandle> {
        let mut entries = self.entries.lock().await;
        match entries.get(name) {
            Some(handle) if handle.id() == id => entries.remove(name),
            _ => None,
        }
    }

    pub async fn lookup(&self, name: &str) -> Option<SessionHandle> {
        self.entries.lock().await.get(name).cloned()
    }

    /// Sorted names of every logged-in session.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
