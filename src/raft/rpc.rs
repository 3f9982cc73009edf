use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::node::RaftMsg;

/// Wire framing: u32 frame length (kind + body), u8 kind, body. All
/// integers big-endian. Textual framing is deliberately avoided for the
/// consensus path.
const KIND_VOTE_REQ: u8 = 1;
const KIND_VOTE_REPLY: u8 = 2;
const KIND_APPEND_REQ: u8 = 3;
const KIND_APPEND_REPLY: u8 = 4;

/// A single frame is never larger than this; a bigger length prefix
/// means a corrupt or hostile peer.
const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct VoteReq {
    pub term: i32,
    pub candidate_id: u32,
    pub last_log_index: u64,
    pub last_log_term: i32,
}

#[derive(Debug, Clone)]
pub struct VoteReply {
    pub term: i32,
    pub granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendReq {
    pub term: i32,
    pub leader_id: u32,
    pub prev_log_index: u64,
    pub prev_log_term: i32,
    pub leader_commit: u64,
    pub entries: Vec<(i32, Bytes)>,
}

/// The failure hints let the leader skip a conflicting term in one
/// round instead of decrementing nextIndex entry by entry.
#[derive(Debug, Clone)]
pub struct AppendReply {
    pub term: i32,
    pub success: bool,
    pub x_term: i32,
    pub x_index: i64,
    pub x_len: u64,
}

#[derive(Debug, Clone)]
pub enum RpcRequest {
    Vote(VoteReq),
    Append(AppendReq),
}

#[derive(Debug, Clone)]
pub enum RpcReply {
    Vote(VoteReply),
    Append(AppendReply),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }
    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }
    fn i32(&mut self) -> Option<i32> {
        let b = self.take(4)?;
        Some(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn u32(&mut self) -> Option<u32> {
        let b = self.take(4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn u64(&mut self) -> Option<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Some(u64::from_be_bytes(arr))
    }
    fn i64(&mut self) -> Option<i64> {
        Some(self.u64()? as i64)
    }
}

fn encode_request(req: &RpcRequest) -> Vec<u8> {
    let mut body = Vec::new();
    let kind = match req {
        RpcRequest::Vote(v) => {
            body.extend_from_slice(&v.term.to_be_bytes());
            body.extend_from_slice(&v.candidate_id.to_be_bytes());
            body.extend_from_slice(&v.last_log_index.to_be_bytes());
            body.extend_from_slice(&v.last_log_term.to_be_bytes());
            KIND_VOTE_REQ
        }
        RpcRequest::Append(a) => {
            body.extend_from_slice(&a.term.to_be_bytes());
            body.extend_from_slice(&a.leader_id.to_be_bytes());
            body.extend_from_slice(&a.prev_log_index.to_be_bytes());
            body.extend_from_slice(&a.prev_log_term.to_be_bytes());
            body.extend_from_slice(&a.leader_commit.to_be_bytes());
            body.extend_from_slice(&(a.entries.len() as u32).to_be_bytes());
            for (term, command) in &a.entries {
                body.extend_from_slice(&term.to_be_bytes());
                body.extend_from_slice(&(command.len() as u32).to_be_bytes());
                body.extend_from_slice(command);
            }
            KIND_APPEND_REQ
        }
    };
    frame(kind, &body)
}

fn encode_reply(reply: &RpcReply) -> Vec<u8> {
    let mut body = Vec::new();
    let kind = match reply {
        RpcReply::Vote(v) => {
            body.extend_from_slice(&v.term.to_be_bytes());
            body.push(v.granted as u8);
            KIND_VOTE_REPLY
        }
        RpcReply::Append(a) => {
            body.extend_from_slice(&a.term.to_be_bytes());
            body.push(a.success as u8);
            body.extend_from_slice(&a.x_term.to_be_bytes());
            body.extend_from_slice(&(a.x_index as u64).to_be_bytes());
            body.extend_from_slice(&a.x_len.to_be_bytes());
            KIND_APPEND_REPLY
        }
    };
    frame(kind, &body)
}

fn frame(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
    out.push(kind);
    out.extend_from_slice(body);
    out
}

fn decode_request(kind: u8, body: &[u8]) -> Option<RpcRequest> {
    let mut c = Cursor { buf: body, pos: 0 };
    match kind {
        KIND_VOTE_REQ => Some(RpcRequest::Vote(VoteReq {
            term: c.i32()?,
            candidate_id: c.u32()?,
            last_log_index: c.u64()?,
            last_log_term: c.i32()?,
        })),
        KIND_APPEND_REQ => {
            let term = c.i32()?;
            let leader_id = c.u32()?;
            let prev_log_index = c.u64()?;
            let prev_log_term = c.i32()?;
            let leader_commit = c.u64()?;
            let count = c.u32()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let term = c.i32()?;
                let len = c.u32()? as usize;
                entries.push((term, Bytes::copy_from_slice(c.take(len)?)));
            }
            Some(RpcRequest::Append(AppendReq {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            }))
        }
        _ => None,
    }
}

fn decode_reply(kind: u8, body: &[u8]) -> Option<RpcReply> {
    let mut c = Cursor { buf: body, pos: 0 };
    match kind {
        KIND_VOTE_REPLY => Some(RpcReply::Vote(VoteReply {
            term: c.i32()?,
            granted: c.u8()? != 0,
        })),
        KIND_APPEND_REPLY => Some(RpcReply::Append(AppendReply {
            term: c.i32()?,
            success: c.u8()? != 0,
            x_term: c.i32()?,
            x_index: c.i64()?,
            x_len: c.u64()?,
        })),
        _ => None,
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad frame length",
        ));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(Some((frame[0], frame[1..].to_vec())))
}

/// Serve peer RPCs: each request is forwarded into the node task and
/// the reply written back on the same connection.
pub async fn serve(listener: TcpListener, inbox: mpsc::UnboundedSender<RaftMsg>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                debug!("raft accept failed: {}", e);
                continue;
            }
        };
        let inbox = inbox.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                let (kind, body) = match read_frame(&mut stream).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return,
                    Err(e) => {
                        debug!("raft rpc read from {}: {}", peer, e);
                        return;
                    }
                };
                let req = match decode_request(kind, &body) {
                    Some(req) => req,
                    None => {
                        debug!("raft rpc: undecodable frame from {}", peer);
                        return;
                    }
                };
                let (tx, rx) = oneshot::channel();
                if inbox.send(RaftMsg::Rpc { req, resp: tx }).is_err() {
                    return;
                }
                let reply = match rx.await {
                    Ok(reply) => reply,
                    Err(_) => return,
                };
                if stream.write_all(&encode_reply(&reply)).await.is_err() {
                    return;
                }
            }
        });
    }
}

/// One RPC round-trip with a per-call timeout bounded by the heartbeat
/// interval. None covers timeouts, connection failures and undecodable
/// replies alike; the caller treats them all as a silent peer.
pub async fn call(addr: String, req: RpcRequest, timeout: Duration) -> Option<RpcReply> {
    let fut = async move {
        let mut stream = TcpStream::connect(&addr).await.ok()?;
        stream.write_all(&encode_request(&req)).await.ok()?;
        let (kind, body) = read_frame(&mut stream).await.ok()??;
        decode_reply(kind, &body)
    };
    tokio::time::timeout(timeout, fut).await.ok()?
}
