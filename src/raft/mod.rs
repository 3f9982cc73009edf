use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::RaftConfig;
use crate::dispatcher::{Message, Outcome, Request, Source};
use crate::error::ServerError;
use crate::resp::{encode_command, parse_command, Reply};

mod log;
mod node;
mod rpc;

pub use node::RaftMsg;

/// Shared, lock-free view of the node for INFO and tests.
#[derive(Default)]
pub struct RaftStatus {
    /// 0 follower, 1 candidate, 2 leader.
    pub role: AtomicU8,
    pub term: AtomicI64,
    pub commit: AtomicU64,
    pub applied: AtomicU64,
    /// 0 means unknown; node ids are 1-based.
    pub leader: AtomicU32,
}

impl RaftStatus {
    pub fn role_name(&self) -> &'static str {
        match self.role.load(Ordering::Relaxed) {
            2 => "leader",
            1 => "candidate",
            _ => "follower",
        }
    }
}

#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<RaftMsg>,
    pub status: Arc<RaftStatus>,
    pub node_id: u32,
}

impl RaftHandle {
    /// Submit a client write. The response sender is answered by the
    /// node task: with a redirect immediately on a non-leader, with the
    /// command's reply after commit + local apply on the leader.
    pub fn propose(&self, command: Bytes, resp: Option<oneshot::Sender<Outcome>>) {
        if self.tx.send(RaftMsg::Propose { command, resp }).is_err() {
            warn!("raft node task is gone");
        }
    }
}

/// A log entry's payload: the target database index followed by the
/// RESP-encoded command array.
pub fn encode_entry(db_index: usize, argv: &[Vec<u8>]) -> Bytes {
    let cmd = encode_command(argv);
    let mut out = Vec::with_capacity(4 + cmd.len());
    out.extend_from_slice(&(db_index as u32).to_be_bytes());
    out.extend_from_slice(&cmd);
    Bytes::from(out)
}

pub fn decode_entry(payload: &[u8]) -> Option<(usize, Vec<Vec<u8>>)> {
    if payload.len() < 4 {
        return None;
    }
    let db_index =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let mut buf = BytesMut::from(&payload[4..]);
    let argv = parse_command(&mut buf).ok()??;
    if !buf.is_empty() || argv.is_empty() {
        return None;
    }
    Some((db_index, argv))
}

/// Bind the peer listener, restore persistent state, and start the
/// three tasks: RPC server, node state machine, apply loop.
pub async fn start(
    cfg: &RaftConfig,
    dispatch: mpsc::Sender<Message>,
) -> Result<RaftHandle, ServerError> {
    let addr = cfg
        .self_addr()
        .ok_or_else(|| ServerError::Raft("raft peer list is missing this node".to_string()))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Raft(format!("binding {}: {}", addr, e)))?;

    let (storage, term, voted_for, log) = log::Storage::open(&cfg.dir, cfg.node_id)
        .map_err(|e| ServerError::Raft(format!("opening state files: {}", e)))?;
    info!(
        node = cfg.node_id,
        term,
        last_index = log.last_index(),
        "raft state restored"
    );

    let status = Arc::new(RaftStatus::default());
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (apply_tx, apply_rx) = mpsc::unbounded_channel();

    tokio::spawn(rpc::serve(listener, inbox_tx.clone()));
    tokio::spawn(apply_loop(
        apply_rx,
        dispatch,
        inbox_tx.clone(),
        status.clone(),
    ));

    let peers: Vec<(u32, String)> = cfg.others().cloned().collect();
    let node = node::Node::new(
        cfg.node_id,
        peers,
        Duration::from_millis(cfg.heartbeat_ms),
        cfg.election_min_ms,
        cfg.election_max_ms,
        storage,
        term,
        voted_for,
        log,
        inbox_rx,
        inbox_tx.clone(),
        apply_tx,
        status.clone(),
    );
    tokio::spawn(node.run());

    Ok(RaftHandle {
        tx: inbox_tx,
        status,
        node_id: cfg.node_id,
    })
}

/// The apply loop: committed entries arrive in index order; each is
/// executed by the dispatcher before the next is taken, and the result
/// is posted back so the leader can answer the waiting client.
async fn apply_loop(
    mut rx: mpsc::UnboundedReceiver<(u64, Bytes)>,
    dispatch: mpsc::Sender<Message>,
    node: mpsc::UnboundedSender<RaftMsg>,
    status: Arc<RaftStatus>,
) {
    while let Some((index, payload)) = rx.recv().await {
        let reply = match decode_entry(&payload) {
            Some((db_index, argv)) => {
                let (tx, result) = oneshot::channel();
                let request = Request {
                    argv,
                    db_index,
                    source: Source::Raft,
                    resp: Some(tx),
                };
                if dispatch.send(Message::Request(request)).await.is_err() {
                    return;
                }
                match result.await {
                    Ok(Outcome::Reply(reply)) => reply,
                    Ok(_) => Reply::Error("ERR unexpected outcome applying entry".to_string()),
                    Err(_) => return,
                }
            }
            None => {
                warn!(index, "raft: undecodable log entry skipped");
                Reply::Error("ERR corrupt log entry".to_string())
            }
        };
        status.applied.store(index, Ordering::Relaxed);
        let _ = node.send(RaftMsg::Applied { index, reply });
    }
}
