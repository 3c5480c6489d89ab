//! Raft RPC server for handling incoming requests.

use std::time::Duration;

use nng::options::{Options, RecvTimeout};
use nng::{Protocol, Socket};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::RaftError;
use crate::network::messages::{RaftReply, RaftRequest};
use crate::types::{CounterRaft, NodeId};

/// How long a receive blocks before the shutdown signal is checked again.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Raft RPC server listening on an NNG REP socket.
pub struct RaftTransport {
    node_id: NodeId,
    url: String,
    socket: Socket,
}

/// Running transport: the serving thread and its shutdown trigger.
pub struct TransportHandle {
    pub task: JoinHandle<Result<(), RaftError>>,
    pub shutdown: oneshot::Sender<()>,
}

impl RaftTransport {
    /// Bind the listening socket.
    ///
    /// Binding happens before the engine starts so that an address already
    /// in use fails node construction.
    pub fn bind(node_id: NodeId, listen_addr: &str) -> Result<Self, RaftError> {
        let url = format!("tcp://{listen_addr}");
        let socket = Socket::new(Protocol::Rep0)
            .map_err(|e| RaftError::Network(format!("failed to create socket: {e}")))?;
        socket
            .set_opt::<RecvTimeout>(Some(POLL_INTERVAL))
            .map_err(|e| RaftError::Network(format!("failed to set recv timeout: {e}")))?;
        socket
            .listen(&url)
            .map_err(|e| RaftError::Network(format!("failed to listen on {url}: {e}")))?;

        tracing::info!(node_id, %url, "raft transport listening");
        Ok(Self {
            node_id,
            url,
            socket,
        })
    }

    /// Serve requests for `raft` on a blocking thread until shut down.
    pub fn spawn(self, raft: CounterRaft) -> TransportHandle {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let runtime = Handle::current();
        let task = tokio::task::spawn_blocking(move || self.run(raft, runtime, shutdown_rx));
        TransportHandle { task, shutdown }
    }

    fn run(
        self,
        raft: CounterRaft,
        runtime: Handle,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), RaftError> {
        loop {
            match shutdown_rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => break,
            }

            let request = match self.socket.recv() {
                Ok(msg) => msg,
                Err(nng::Error::TimedOut) => continue,
                Err(nng::Error::Closed) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to receive raft rpc");
                    continue;
                }
            };

            let reply = match serde_json::from_slice::<RaftRequest>(request.as_slice()) {
                Ok(rpc) => runtime.block_on(dispatch(&raft, rpc)),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed raft rpc");
                    RaftReply::Rejected(e.to_string())
                }
            };

            let bytes = match serde_json::to_vec(&reply) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode raft reply");
                    continue;
                }
            };

            if let Err((_, e)) = self.socket.send(nng::Message::from(bytes.as_slice())) {
                tracing::warn!(error = %e, "failed to send raft reply");
            }
        }

        tracing::info!(node_id = self.node_id, url = %self.url, "raft transport stopped");
        Ok(())
    }
}

async fn dispatch(raft: &CounterRaft, request: RaftRequest) -> RaftReply {
    match request {
        RaftRequest::Vote(rpc) => RaftReply::Vote(raft.vote(rpc).await),
        RaftRequest::AppendEntries(rpc) => RaftReply::AppendEntries(raft.append_entries(rpc).await),
        RaftRequest::InstallSnapshot(rpc) => {
            RaftReply::InstallSnapshot(raft.install_snapshot(rpc).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_conflict_is_an_error() {
        let first = RaftTransport::bind(1, "127.0.0.1:0");
        assert!(first.is_ok());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().to_string();
        assert!(matches!(
            RaftTransport::bind(2, &taken),
            Err(RaftError::Network(_))
        ));
    }
}
