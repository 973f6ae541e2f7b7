//
// vfs.rs
//
// Explicit virtual file system context: one replaceable connection plus
// in-memory overlays for open documents
//

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tower_lsp::lsp_types::Url;

/// A source of file contents, typically a connection to the editor or a
/// remote file system.
#[async_trait]
pub trait VfsConnection: Send + Sync {
    /// Short label used in log messages
    fn name(&self) -> &str;

    async fn read(&self, uri: &Url) -> anyhow::Result<String>;

    /// Release the connection. Called once, when it is replaced or the
    /// context is closed.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reads `file://` URIs from the local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFsConnection;

#[async_trait]
impl VfsConnection for LocalFsConnection {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, uri: &Url) -> anyhow::Result<String> {
        let path = uri
            .to_file_path()
            .map_err(|_| anyhow!("not a local file URI: {uri}"))?;
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

/// Resolves resources for the components that need them.
///
/// Overlays hold the text of open documents and always win over the
/// connection. The connection can be swapped when the client reconnects;
/// the displaced one is closed.
#[derive(Default)]
pub struct VfsContext {
    connection: RwLock<Option<Arc<dyn VfsConnection>>>,
    overlays: DashMap<Url, String>,
}

impl std::fmt::Debug for VfsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsContext")
            .field(
                "connection",
                &self.connection.read().as_ref().map(|c| c.name().to_string()),
            )
            .field("overlays", &self.overlays.len())
            .finish()
    }
}

impl VfsContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(connection: Arc<dyn VfsConnection>) -> Self {
        Self {
            connection: RwLock::new(Some(connection)),
            overlays: DashMap::new(),
        }
    }

    /// Install `connection`, closing the one it replaces.
    pub async fn connect(&self, connection: Arc<dyn VfsConnection>) {
        log::info!("VFS connected via {}", connection.name());
        let previous = self.connection.write().replace(connection);
        if let Some(previous) = previous {
            close_connection(previous).await;
        }
    }

    /// Close and drop the current connection. Overlays are kept.
    pub async fn close(&self) {
        let previous = self.connection.write().take();
        if let Some(previous) = previous {
            close_connection(previous).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    pub fn set_overlay(&self, uri: Url, text: String) {
        self.overlays.insert(uri, text);
    }

    pub fn remove_overlay(&self, uri: &Url) -> Option<String> {
        self.overlays.remove(uri).map(|(_, text)| text)
    }

    pub fn has_overlay(&self, uri: &Url) -> bool {
        self.overlays.contains_key(uri)
    }

    /// Contents of `uri`: the overlay if one exists, otherwise whatever the
    /// current connection returns.
    pub async fn read(&self, uri: &Url) -> anyhow::Result<String> {
        if let Some(text) = self.overlays.get(uri) {
            return Ok(text.clone());
        }
        // Clone out so the lock is not held across the await
        let connection = self.connection.read().clone();
        match connection {
            Some(connection) => connection.read(uri).await,
            None => Err(anyhow!("no VFS connection to resolve {uri}")),
        }
    }
}

async fn close_connection(connection: Arc<dyn VfsConnection>) {
    if let Err(err) = connection.close().await {
        log::warn!("Failed to close VFS connection {}: {err:#}", connection.name());
    } else {
        log::debug!("Closed VFS connection {}", connection.name());
    }
}
