use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::select;
use tracing::{debug, info, warn};

use crate::{config::RelayConfig, router::Router, transport::Transport};

/// The relay's receive loop.
///
/// Datagrams are pulled one at a time and fully handled (decode, registry
/// update, sends) before the next receive. Shutdown is checked between
/// receives, never in the middle of a dispatch.
pub struct Relay {
    transport: Arc<Transport>,
    router: Arc<Router<Transport>>,
}

impl Relay {
    pub fn new(transport: Transport, config: RelayConfig) -> Self {
        let transport = Arc::new(transport);
        let router = Arc::new(Router::new(Arc::clone(&transport), config));
        Self { transport, router }
    }

    pub async fn bind(addr: SocketAddr, config: RelayConfig) -> std::io::Result<Self> {
        let transport = Transport::bind(addr, config.max_datagram).await?;
        Ok(Self::new(transport, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Shared handle to the router, for inspecting registry state.
    pub fn router(&self) -> Arc<Router<Transport>> {
        Arc::clone(&self.router)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { transport, router } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&router);
                    break;
                }
                received = transport.recv() => {
                    handle_received(received, &router).await;
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

fn handle_shutdown(router: &Router<Transport>) {
    let stats = router.stats();
    info!(
        sessions = stats.sessions,
        rooms = stats.rooms,
        pending_transfers = stats.pending_transfers,
        "relay shutting down"
    );
}

async fn handle_received(
    received: std::io::Result<(Vec<u8>, SocketAddr)>,
    router: &Router<Transport>,
) {
    match received {
        Ok((datagram, peer)) => {
            let delivery = router.dispatch(&datagram, peer).await;
            debug!(
                peer = %peer,
                sent = delivery.sent,
                failed = delivery.failed,
                "datagram handled"
            );
        }
        // ICMP errors from earlier sends surface here on some platforms;
        // they concern one peer only and must not stop the loop.
        Err(err) => warn!(error = ?err, "failed to receive datagram"),
    }
}
