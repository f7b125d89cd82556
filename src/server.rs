use crate::config::Config;
use crate::dispatch::{dispatch, DispatchContext};
use crate::error::Result;
use crate::info::ServerInfo;
use crate::metrics::{MetricsSource, RandomMetrics};
use crate::protocol::frame::{read_frame, write_frame};
use crate::store::{DocumentStore, MemStore};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Process-wide collaborators shared by every connection worker.
pub struct ServerState {
    pub store: Arc<dyn DocumentStore>,
    pub info: Arc<ServerInfo>,
    pub metrics: Arc<dyn MetricsSource>,
    connection_ids: AtomicI64,
}

impl ServerState {
    pub fn new() -> Self {
        Self::with_parts(Arc::new(MemStore::new()), Arc::new(RandomMetrics))
    }

    pub fn with_parts(store: Arc<dyn DocumentStore>, metrics: Arc<dyn MetricsSource>) -> Self {
        Self {
            store,
            info: Arc::new(ServerInfo::new()),
            metrics,
            connection_ids: AtomicI64::new(1),
        }
    }

    fn next_connection_id(&self) -> i64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run(cfg: Config) -> Result<()> {
    let (_state, _addr, _shutdown, handle) = spawn_with_shutdown(cfg).await?;
    // The shutdown sender stays alive for the lifetime of `run`, so the
    // accept loop only ends on a listener error.
    handle
        .await
        .map_err(|e| crate::error::Error::Msg(format!("accept loop panicked: {e}")))
}

/// Bind the listener and run the accept loop as a background task. Used by
/// `run` and by tests, which bind port 0 and need the resolved address plus
/// a shutdown handle.
pub async fn spawn_with_shutdown(
    cfg: Config,
) -> Result<(Arc<ServerState>, SocketAddr, watch::Sender<bool>, JoinHandle<()>)> {
    cfg.validate()?;
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(listen_addr = %addr, "minimongo listening");

    let state = Arc::new(ServerState::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let loop_state = state.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!("listener shutting down");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let conn_id = loop_state.next_connection_id();
                    tracing::debug!(%peer, conn_id, "accepted connection");
                    let state = loop_state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, state, conn_id).await {
                            tracing::debug!(conn_id, error = %format!("{e:?}"), "connection closed with error");
                        }
                    });
                }
            }
        }
    });

    Ok((state, addr, shutdown_tx, handle))
}

/// Per-connection worker: frames are read, dispatched, and answered strictly
/// in arrival order until the peer closes or a fatal decode error occurs.
async fn handle_connection(
    mut socket: TcpStream,
    state: Arc<ServerState>,
    conn_id: i64,
) -> Result<()> {
    let ctx = DispatchContext::new(
        state.store.clone(),
        state.info.clone(),
        state.metrics.clone(),
        conn_id,
    );

    loop {
        let (header, frame) = match read_frame(&mut socket).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::trace!(conn_id, "peer closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id, error = %e, "closing connection on read error");
                break;
            }
        };
        tracing::trace!(
            conn_id,
            op_code = header.op_code,
            request_id = header.request_id,
            len = header.message_length,
            "received frame"
        );

        match dispatch(&ctx, &header, &frame) {
            Ok(Some(reply)) => write_frame(&mut socket, &reply).await?,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    conn_id,
                    op_code = header.op_code,
                    error = %e,
                    "fatal decode error; closing connection"
                );
                break;
            }
        }
    }

    let _ = socket.shutdown().await;
    Ok(())
}
