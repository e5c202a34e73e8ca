//! Inbound sessions: other nodes subscribing to our shared record.
//!
//! The acceptor hands every connection its own task. A session must open
//! with `Subscribe`. Anything else ends it, and so does a protocol version
//! we do not speak or credentials not made with our shared secret. Once
//! open, the node runtime gets a sender for the session's write queue and
//! every later request is forwarded to it in order.

use std::net::SocketAddr;
use std::sync::Arc;

use concord_core::{MessageReader, MessageWriter};
use concord_proto::constants::CONCORD_PROTO_VER;
use concord_proto::creds::PeerCreds;
use concord_proto::defaults::DEFAULT_PEER_WRITE_CHANNEL_SIZE;
use concord_proto::error::{ConcordError, ConcordResult};
use concord_proto::message::{PeerMessage, PeerRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a session task reports.
#[derive(Debug)]
pub enum SessionEvent {
    /// A node subscribed. Messages queued on `tx` are written in order.
    Opened {
        node_name: String,
        tx: mpsc::Sender<PeerMessage>,
    },
    Request(PeerRequest),
    /// The subscriber logged off or the connection dropped.
    Closed,
}

/// Who may open a session, and how large its frames may be.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub max_frame: usize,
    /// Subscribers must present credentials made with this secret.
    pub shared_secret: Option<String>,
}

/// Accept sessions until `shutdown` fires. Each session gets an id, passed
/// to `wrap` along with every event it reports.
pub fn spawn_acceptor<T, F>(
    listener: TcpListener,
    shutdown: Arc<Notify>,
    events: mpsc::Sender<T>,
    wrap: F,
    policy: SessionPolicy,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(u64, SessionEvent) -> T + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let policy = Arc::new(policy);
        let stop = shutdown.notified();
        tokio::pin!(stop);
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("session listener shutting down");
                    break;
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, addr)) => {
                            next_id += 1;
                            debug!("session {}: accepted connection from {}", next_id, addr);
                            stream.set_nodelay(true).ok();
                            tokio::spawn(run_session(
                                next_id,
                                stream,
                                addr,
                                Arc::clone(&shutdown),
                                events.clone(),
                                wrap.clone(),
                                Arc::clone(&policy),
                            ));
                        }
                        Err(e) => warn!("session accept error: {}", e),
                    }
                }
            }
        }
    })
}

async fn run_session<T, F>(
    id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
    events: mpsc::Sender<T>,
    wrap: F,
    policy: Arc<SessionPolicy>,
) where
    F: Fn(u64, SessionEvent) -> T,
{
    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::with_max_frame(read_half, policy.max_frame);
    let mut writer = MessageWriter::with_max_frame(write_half, policy.max_frame);

    let node_name = match open(&mut reader).await {
        Ok((creds, proto_ver)) => {
            let refusal = if proto_ver != CONCORD_PROTO_VER {
                warn!(
                    "session {}: {} speaks protocol {}, we speak {}",
                    id, creds.node_name, proto_ver, CONCORD_PROTO_VER
                );
                Some(ConcordError::VerMismatch)
            } else if !creds.is_authentic(policy.shared_secret.as_deref()) {
                warn!(
                    "session {}: rejecting {} from {}: bad credentials",
                    id, creds.node_name, addr
                );
                Some(ConcordError::AuthFailed)
            } else {
                None
            };
            if let Some(e) = refusal {
                let _ = writer.send(&PeerMessage::Refused { code: e.to_code() }).await;
                writer.shutdown().await;
                return;
            }
            creds.node_name
        }
        Err(e) => {
            debug!("session {} from {} ended before subscribing: {}", id, addr, e);
            return;
        }
    };
    info!("session {}: {} subscribed from {}", id, node_name, addr);

    let (tx, mut rx) = mpsc::channel::<PeerMessage>(DEFAULT_PEER_WRITE_CHANNEL_SIZE);
    if events
        .send(wrap(id, SessionEvent::Opened { node_name: node_name.clone(), tx }))
        .await
        .is_err()
    {
        return;
    }

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.send(&msg).await {
                debug!("session {}: write failed: {}", id, e);
                break;
            }
        }
        writer.shutdown().await;
    });

    let stop = shutdown.notified();
    tokio::pin!(stop);
    loop {
        let req = tokio::select! {
            _ = &mut stop => break,
            result = reader.recv::<PeerRequest>() => match result {
                Ok(req) => req,
                Err(ConcordError::NetworkError) => {
                    debug!("session {}: {} disconnected", id, node_name);
                    break;
                }
                Err(e) => {
                    warn!("session {}: bad message from {}: {}", id, node_name, e);
                    break;
                }
            },
        };
        if matches!(req, PeerRequest::Logoff) {
            info!("session {}: {} logged off", id, node_name);
            break;
        }
        if events.send(wrap(id, SessionEvent::Request(req))).await.is_err() {
            return;
        }
    }
    let _ = events.send(wrap(id, SessionEvent::Closed)).await;
}

/// Read the opening `Subscribe`.
async fn open<R>(reader: &mut MessageReader<R>) -> ConcordResult<(PeerCreds, u16)>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match reader.recv::<PeerRequest>().await? {
        PeerRequest::Subscribe { creds, proto_ver } => Ok((creds, proto_ver)),
        other => {
            warn!("expected Subscribe, got {:?}", other);
            Err(ConcordError::UnexpectedMessage)
        }
    }
}
