//! Placement balancer: a TCP front end that sends every new client to the
//! next backend chosen by the weighted round-robin selector.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::selector::{Endpoint, WeightedRoundRobin};
use crate::{Error, Result};

pub struct Balancer {
    listener: TcpListener,
    selector: Arc<WeightedRoundRobin>,
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl Balancer {
    pub async fn bind(
        addr: &str,
        selector: WeightedRoundRobin,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            backends = selector.endpoints().len(),
            cycle = selector.cycle_len(),
            "balancer listening"
        );
        Ok(Balancer {
            listener,
            selector: Arc::new(selector),
            connect_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn selector(&self) -> Arc<WeightedRoundRobin> {
        self.selector.clone()
    }

    /// Place and proxy clients until `shutdown` resolves.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (client, peer) = tokio::select! {
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

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let backend = self.selector.next().clone();
            info!(client = id, %peer, backend = %backend, "placing client");

            let connect_timeout = self.connect_timeout;
            let span = info_span!("placement", id, %peer);
            tokio::spawn(
                async move {
                    match proxy(client, &backend, connect_timeout).await {
                        Ok((up, down)) => debug!(up, down, "client disconnected"),
                        Err(e) => warn!(backend = %backend.address(), error = %e, "proxy failed"),
                    }
                }
                .instrument(span),
            );
        }

        info!("balancer stopped");
        Ok(())
    }
}

/// Connect to `backend` and copy bytes both ways until either side closes.
///
/// Returns the byte counts client→backend and backend→client.
async fn proxy(
    mut client: TcpStream,
    backend: &Endpoint,
    connect_timeout: Duration,
) -> Result<(u64, u64)> {
    let mut upstream = timeout(connect_timeout, TcpStream::connect(backend.address()))
        .await
        .map_err(|_| Error::Timeout("connecting to backend"))??;
    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    Ok(tokio::io::copy_bidirectional(&mut client, &mut upstream).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// A backend that answers every connection with its own name.
    async fn named_backend(name: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = stream.write_all(name.as_bytes()).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_clients_follow_weights() {
        let a = named_backend("a").await;
        let b = named_backend("b").await;
        let selector = WeightedRoundRobin::new(vec![
            Endpoint::new("127.0.0.1", a, 3),
            Endpoint::new("127.0.0.1", b, 2),
        ])
        .unwrap();
        let balancer = Balancer::bind("127.0.0.1:0", selector, Duration::from_secs(2))
            .await
            .unwrap();
        let addr = balancer.local_addr().unwrap();
        tokio::spawn(balancer.serve_until(std::future::pending()));

        let mut seen = String::new();
        for _ in 0..5 {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            let mut name = String::new();
            conn.read_to_string(&mut name).await.unwrap();
            seen.push_str(&name);
        }
        assert_eq!(seen, "aabab");
    }

    #[tokio::test]
    async fn test_dead_backend_only_drops_that_client() {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let live = named_backend("live").await;
        let selector = WeightedRoundRobin::new(vec![
            Endpoint::new("127.0.0.1", dead, 1),
            Endpoint::new("127.0.0.1", live, 1),
        ])
        .unwrap();
        let balancer = Balancer::bind("127.0.0.1:0", selector, Duration::from_secs(2))
            .await
            .unwrap();
        let addr = balancer.local_addr().unwrap();
        tokio::spawn(balancer.serve_until(std::future::pending()));

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        first.read_to_end(&mut buf).await.unwrap_or_default();
        assert!(buf.is_empty());

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut name = String::new();
        second.read_to_string(&mut name).await.unwrap();
        assert_eq!(name, "live");
    }
}
