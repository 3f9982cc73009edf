use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::dispatcher::{Message, Outcome, Request, Source};
use crate::resp::{encode_command, parse_command, parse_line};
use crate::util::gen_run_id;

/// Ring of the most recent replication-stream bytes. `start` is the
/// replication offset of the first byte held; a replica whose offset
/// still falls inside the ring can partially resync.
pub struct Backlog {
    data: VecDeque<u8>,
    capacity: usize,
    start: u64,
}

impl Backlog {
    pub fn new(capacity: usize) -> Backlog {
        Backlog {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            start: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().copied());
        while self.data.len() > self.capacity {
            self.data.pop_front();
            self.start += 1;
        }
    }

    pub fn start_offset(&self) -> u64 {
        self.start
    }

    pub fn end_offset(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// True when `offset` lies within the retained window, so the bytes
    /// from `offset` onward can be replayed.
    pub fn covers(&self, offset: u64) -> bool {
        offset >= self.start && offset <= self.end_offset()
    }

    pub fn tail_from(&self, offset: u64) -> Vec<u8> {
        let skip = (offset - self.start) as usize;
        self.data.iter().skip(skip).copied().collect()
    }
}

/// Primary-side replication state: identity, offset, backlog and the
/// live feeds of connected replicas.
pub struct ReplMaster {
    pub run_id: String,
    pub offset: u64,
    backlog: Backlog,
    replicas: Vec<mpsc::UnboundedSender<Bytes>>,
    sel_db: i64,
}

impl ReplMaster {
    pub fn new(backlog_capacity: usize) -> ReplMaster {
        ReplMaster {
            run_id: gen_run_id(),
            offset: 0,
            backlog: Backlog::new(backlog_capacity),
            replicas: Vec::new(),
            sel_db: -1,
        }
    }

    /// Append a locally-applied write to the stream: backlog first
    /// (advancing the offset), then every live replica. A SELECT is
    /// injected whenever the stream switches databases.
    pub fn feed(&mut self, db_index: usize, cmd_bytes: &[u8]) {
        let mut chunk = Vec::with_capacity(cmd_bytes.len() + 32);
        if self.sel_db != db_index as i64 {
            chunk.extend_from_slice(&encode_command(&[
                b"select".to_vec(),
                db_index.to_string().into_bytes(),
            ]));
            self.sel_db = db_index as i64;
        }
        chunk.extend_from_slice(cmd_bytes);
        self.backlog.push(&chunk);
        self.offset += chunk.len() as u64;
        let payload = Bytes::from(chunk);
        self.replicas
            .retain(|feed| feed.send(payload.clone()).is_ok());
    }

    /// Register a new replica feed. The caller decides what precedes
    /// the stream (full dump or backlog tail).
    pub fn register(&mut self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.replicas.push(tx);
        rx
    }

    /// Force the next fed command to carry an explicit SELECT. Needed
    /// whenever a replica joins with no stream context.
    pub fn reset_sel_db(&mut self) {
        self.sel_db = -1;
    }

    /// Promotion back to primary starts a fresh command history; stale
    /// replicas of the old history must full resync.
    pub fn promote(&mut self) {
        self.run_id = gen_run_id();
    }

    pub fn can_continue(&self, run_id: &str, offset: i64) -> bool {
        offset >= 0 && run_id == self.run_id && self.backlog.covers(offset as u64)
    }

    pub fn tail_from(&self, offset: u64) -> Vec<u8> {
        self.backlog.tail_from(offset)
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }
}

/// Handle the dispatcher keeps on the replica->primary link task.
pub struct ReplicaLinkHandle {
    pub stop: watch::Sender<bool>,
    pub offset: Arc<AtomicU64>,
    pub connected: Arc<AtomicBool>,
}

impl ReplicaLinkHandle {
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

/// Spawn the replica link: connect to the primary, negotiate PSYNC,
/// then apply the command stream through the dispatcher. Reconnects
/// with the last applied offset until stopped.
pub fn spawn_link(
    host: String,
    port: u16,
    dispatch: mpsc::Sender<Message>,
) -> ReplicaLinkHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let offset = Arc::new(AtomicU64::new(0));
    let connected = Arc::new(AtomicBool::new(false));
    tokio::spawn(link_loop(
        format!("{}:{}", host, port),
        dispatch,
        offset.clone(),
        connected.clone(),
        stop_rx,
    ));
    ReplicaLinkHandle {
        stop: stop_tx,
        offset,
        connected,
    }
}

async fn link_loop(
    addr: String,
    dispatch: mpsc::Sender<Message>,
    offset: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut run_id: Option<String> = None;
    loop {
        if *stop.borrow() {
            return;
        }
        match sync_once(
            &addr,
            &dispatch,
            &offset,
            &connected,
            &mut run_id,
            &mut stop,
        )
        .await
        {
            Ok(()) => return, // stopped cleanly
            Err(e) => {
                connected.store(false, Ordering::Relaxed);
                debug!("replication link to {}: {}", addr, e);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}

async fn read_more(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<(), String> {
    match stream.read_buf(buf).await {
        Ok(0) => Err("primary closed the connection".to_string()),
        Ok(_) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

async fn sync_once(
    addr: &str,
    dispatch: &mpsc::Sender<Message>,
    offset: &Arc<AtomicU64>,
    connected: &Arc<AtomicBool>,
    run_id: &mut Option<String>,
    stop: &mut watch::Receiver<bool>,
) -> Result<(), String> {
    let mut stream = TcpStream::connect(addr).await.map_err(|e| e.to_string())?;
    let (id_arg, offset_arg) = match run_id {
        Some(id) => (
            id.clone().into_bytes(),
            offset.load(Ordering::Relaxed).to_string().into_bytes(),
        ),
        None => (b"?".to_vec(), b"-1".to_vec()),
    };
    stream
        .write_all(&encode_command(&[b"psync".to_vec(), id_arg, offset_arg]))
        .await
        .map_err(|e| e.to_string())?;

    let mut buf = BytesMut::with_capacity(64 * 1024);
    let line = loop {
        if let Some(line) = parse_line(&mut buf) {
            break line;
        }
        read_more(&mut stream, &mut buf).await?;
    };
    let line = String::from_utf8_lossy(&line).to_string();

    if let Some(rest) = line.strip_prefix("+FULLRESYNC ") {
        let mut parts = rest.split_whitespace();
        let new_id = parts
            .next()
            .ok_or_else(|| "malformed FULLRESYNC".to_string())?
            .to_string();
        let new_offset: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| "malformed FULLRESYNC offset".to_string())?;

        // length header, then the raw dump bytes
        let len_line = loop {
            if let Some(line) = parse_line(&mut buf) {
                break line;
            }
            read_more(&mut stream, &mut buf).await?;
        };
        if len_line.first() != Some(&b'$') {
            return Err("expected dump length header".to_string());
        }
        let dump_len: usize = std::str::from_utf8(&len_line[1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| "malformed dump length".to_string())?;
        while buf.len() < dump_len {
            read_more(&mut stream, &mut buf).await?;
        }
        let dump = buf.split_to(dump_len).to_vec();

        let (tx, rx) = oneshot::channel();
        dispatch
            .send(Message::LoadSnapshot { dump, resp: tx })
            .await
            .map_err(|_| "dispatcher is gone".to_string())?;
        rx.await
            .map_err(|_| "dispatcher is gone".to_string())?
            .map_err(|e| format!("loading primary dump: {}", e))?;

        *run_id = Some(new_id);
        offset.store(new_offset, Ordering::Relaxed);
        info!("full resynchronization with primary complete");
    } else if line.starts_with("+CONTINUE") {
        info!("partial resynchronization with primary accepted");
    } else {
        return Err(format!("primary refused PSYNC: {}", line));
    }

    connected.store(true, Ordering::Relaxed);
    let mut current_db = 0usize;
    loop {
        // apply every complete frame currently buffered
        loop {
            let before = buf.len();
            let argv = match parse_command(&mut buf) {
                Ok(Some(argv)) => argv,
                Ok(None) => break,
                Err(e) => return Err(format!("bad frame from primary: {}", e)),
            };
            let consumed = (before - buf.len()) as u64;
            if !argv.is_empty() {
                let (tx, rx) = oneshot::channel();
                let request = Request {
                    argv,
                    db_index: current_db,
                    source: Source::Master,
                    resp: Some(tx),
                };
                dispatch
                    .send(Message::Request(request))
                    .await
                    .map_err(|_| "dispatcher is gone".to_string())?;
                match rx.await {
                    Ok(Outcome::Select(index)) => current_db = index,
                    Ok(_) => {}
                    Err(_) => return Err("dispatcher is gone".to_string()),
                }
            }
            offset.fetch_add(consumed, Ordering::Relaxed);
        }

        tokio::select! {
            result = read_more(&mut stream, &mut buf) => result?,
            _ = stop.changed() => {
                if *stop.borrow() {
                    return Ok(());
                }
            }
        }
    }
}
