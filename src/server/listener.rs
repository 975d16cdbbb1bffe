//! RTMP server listener
//!
//! Accept loop: one spawned task per connection, a shared source registry,
//! and a 1-second reaper tick for idle sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::protocol::constants::SOURCE_CYCLE_INTERVAL;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::session::source::{SourceHandler, SourceRegistry};

/// RTMP server: accept loop plus the process-wide source registry
pub struct RtmpServer {
    config: ServerConfig,
    handler: Arc<dyn SourceHandler>,
    registry: Arc<SourceRegistry>,
    next_session_id: AtomicU64,
}

impl RtmpServer {
    /// Create a server with the given configuration and stream handler
    pub fn new<H: SourceHandler + 'static>(config: ServerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            registry: Arc::new(SourceRegistry::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// The shared source registry (stats, tests)
    pub fn registry(&self) -> Arc<SourceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind and serve until the process is stopped.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "rtmp server listening");

        self.spawn_reaper();

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr.to_string());
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Serve until the shutdown future resolves (ctrl-c in the binary).
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                info!("shutdown signal received");
                Ok(())
            }
            result = self.run() => result,
        }
    }

    fn spawn_reaper(&self) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SOURCE_CYCLE_INTERVAL);
            loop {
                ticker.tick().await;
                registry.cycle_all();
            }
        });
    }

    fn handle_connection(&self, socket: TcpStream, peer: String) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        debug!(session_id, peer = %peer, "accepted connection");

        if let Err(e) = socket.set_nodelay(self.config.default_vhost.tcp_nodelay) {
            debug!(error = %e, "set_nodelay failed");
        }

        let (reader, writer) = socket.into_split();
        let mut connection = Connection::new(
            session_id,
            peer,
            reader,
            writer,
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
        );

        tokio::spawn(async move {
            match connection.run().await {
                Ok(()) => debug!(session_id, "connection finished"),
                Err(e) if e.is_gracefully_closed() => {
                    debug!(session_id, "client gracefully closed")
                }
                Err(e) if e.is_system_control() => {
                    debug!(session_id, error = %e, "connection ended by control")
                }
                Err(e) => info!(session_id, error = %e, "connection error"),
            }
        });
    }
}
