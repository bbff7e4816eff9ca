//! Proxy server: listener, slot pool and the scheduler loop.
//!
//! A single task owns every session. Each loop iteration either admits a
//! new client into a free slot or runs one scheduler pass over the pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Server                             │
//! │  ┌────────────────┐        ┌──────────────────────────────┐  │
//! │  │  TCP Listener  │──────▶ │          Slot Pool           │  │
//! │  │  (Port 1080)   │ accept │  [0] [1] [2] [3] [4]         │  │
//! │  └────────────────┘        │   each slot: Session state   │  │
//! │          ▲                 │   machine + relay buffers    │  │
//! │          │ tick            └──────────────┬───────────────┘  │
//! │  ┌───────┴────────┐                       │ dial             │
//! │  │   Interval     │        ┌──────────────▼───────────────┐  │
//! │  │   (5 ms)       │        │  Connector (TCP or TLS by    │  │
//! │  └────────────────┘        │  destination port)           │  │
//! │                            └──────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod metrics;
pub mod pool;
pub mod session;

pub use config::{ServerConfig, ServerConfigFile};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use pool::SlotPool;
pub use session::{Session, SessionContext, SessionState, StateKind};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::proxy::connector::{Dialer, NetDialer, Resolver, SystemResolver};
use crate::proxy::stream::TcpProxyStream;

/// Main server instance.
pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    ctx: Arc<SessionContext>,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Bind the listener using the system resolver and the network dialer.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let dialer = NetDialer::new()?;
        Self::bind_with(config, Arc::new(dialer), Arc::new(SystemResolver)).await
    }

    /// Bind the listener with caller-supplied dial and resolve seams.
    pub async fn bind_with(
        config: ServerConfig,
        dialer: Arc<dyn Dialer>,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr()).await?;
        tracing::info!("slotsocks listening on {}", listener.local_addr()?);

        let metrics = Arc::new(ServerMetrics::new());
        let ctx = Arc::new(SessionContext::new(
            &config,
            dialer,
            resolver,
            Arc::clone(&metrics),
        ));

        Ok(Self {
            listener,
            config: Arc::new(config),
            ctx,
            metrics,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the scheduler until [`Server::shutdown`] is called.
    ///
    /// Sessions still open when the loop exits are dropped, which closes
    /// their sockets.
    pub async fn run(&self) -> Result<()> {
        let mut pool = SlotPool::new(self.config.max_sessions, Arc::clone(&self.ctx));
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "{} slots, encrypted ports {:?}",
            pool.capacity(),
            self.ctx.connector.policy().encrypted_ports()
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(&mut pool, stream, peer),
                    Err(e) => tracing::warn!("accept error: {}", e),
                },
                _ = ticker.tick() => pool.tick().await,
                _ = self.shutdown.notified() => {
                    tracing::info!("shutting down with {} open sessions", pool.active());
                    break;
                }
            }
        }

        Ok(())
    }

    fn admit(&self, pool: &mut SlotPool, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", peer, e);
        }

        match pool.accept(Box::new(TcpProxyStream::new(stream))) {
            Ok(slot) => tracing::info!(slot, "accepted client {}", peer),
            Err(e) => tracing::warn!("rejected client {}: {}", peer, e),
        }
    }

    /// Ask a running [`Server::run`] to return.
    pub fn shutdown(&self) {
        // notify_one keeps a permit if the loop is mid-pass
        self.shutdown.notify_one();
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Get session count.
    pub fn session_count(&self) -> usize {
        self.metrics.active_sessions() as usize
    }
}
