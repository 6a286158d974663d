//! Connection acceptor: one session task per accepted connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::catalog::CatalogStore;
use crate::clock::LamportClock;
use crate::constants::ClockScope;
use crate::session::{Session, SessionOptions};
use crate::Result;

/// Acceptor settings.
#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    /// Upper bound on concurrently served sessions. Accepting pauses while
    /// the bound is reached.
    pub max_sessions: usize,
    pub clock_scope: ClockScope,
    pub session: SessionOptions,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            max_sessions: 1024,
            clock_scope: ClockScope::default(),
            session: SessionOptions::default(),
        }
    }
}

/// Listens for clients and hands each connection to its own [`Session`].
pub struct Acceptor {
    listener: TcpListener,
    clock: Arc<LamportClock>,
    catalog: Arc<dyn CatalogStore>,
    options: AcceptorOptions,
    sessions: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl Acceptor {
    pub async fn bind(
        addr: &str,
        catalog: Arc<dyn CatalogStore>,
        options: AcceptorOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "catalog server listening");
        Ok(Self::from_listener(listener, catalog, options))
    }

    pub fn from_listener(
        listener: TcpListener,
        catalog: Arc<dyn CatalogStore>,
        options: AcceptorOptions,
    ) -> Self {
        let sessions = Arc::new(Semaphore::new(options.max_sessions.max(1)));
        Self {
            listener,
            clock: Arc::new(LamportClock::new()),
            catalog,
            options,
            sessions,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The instance-wide clock handed to every session.
    pub fn clock(&self) -> Arc<LamportClock> {
        self.clock.clone()
    }

    /// Number of sessions currently being served.
    pub fn active_sessions(&self) -> usize {
        self.options.max_sessions.max(1) - self.sessions.available_permits()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.sessions.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "could not disable Nagle");
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let clock = match self.options.clock_scope {
                ClockScope::Instance => self.clock.clone(),
                ClockScope::Connection => Arc::new(LamportClock::new()),
            };
            let session = Session::new(
                id,
                stream,
                clock,
                self.catalog.clone(),
                self.options.session.clone(),
            );

            info!(session = id, %peer, "connection established");
            let span = info_span!("session", id, %peer);
            tokio::spawn(
                async move {
                    match session.run().await {
                        Ok(()) => info!("session closed"),
                        Err(e) => warn!(error = %e, "session terminated"),
                    }
                    drop(permit);
                }
                .instrument(span),
            );
        }

        info!(active = self.active_sessions(), "acceptor stopped");
        Ok(())
    }
}
