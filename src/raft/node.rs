use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatcher::Outcome;
use crate::error::CmdError;
use crate::resp::Reply;

use super::log::{LogEntry, RaftLog, Storage};
use super::rpc::{self, AppendReply, AppendReq, RpcReply, RpcRequest, VoteReply, VoteReq};
use super::RaftStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

pub enum RaftMsg {
    /// A peer RPC delivered by the listener; the reply goes back on the
    /// same connection.
    Rpc {
        req: RpcRequest,
        resp: oneshot::Sender<RpcReply>,
    },
    VoteResult {
        term_at_send: i32,
        peer: u32,
        reply: Option<VoteReply>,
    },
    AppendResult {
        peer: u32,
        term_at_send: i32,
        prev: u64,
        count: usize,
        reply: Option<AppendReply>,
    },
    /// A client write submitted by the dispatcher. The response sender
    /// is answered after commit + local apply, or immediately with a
    /// redirect on a non-leader.
    Propose {
        command: Bytes,
        resp: Option<oneshot::Sender<Outcome>>,
    },
    /// The apply loop finished executing the entry at `index`.
    Applied { index: u64, reply: Reply },
}

/// The consensus state machine. One task owns all of this; RPC I/O and
/// per-peer calls run on helper tasks that post results back into the
/// inbox.
pub struct Node {
    id: u32,
    peers: Vec<(u32, String)>,
    cluster_size: usize,
    hb_interval: Duration,
    election_min: u64,
    election_max: u64,
    call_timeout: Duration,

    role: Role,
    current_term: i32,
    voted_for: i32,
    log: RaftLog,
    storage: Storage,
    commit_index: u64,
    leader_id: Option<u32>,
    next_index: HashMap<u32, u64>,
    match_index: HashMap<u32, u64>,
    votes: HashSet<u32>,
    pending: HashMap<u64, oneshot::Sender<Outcome>>,

    inbox: mpsc::UnboundedReceiver<RaftMsg>,
    self_tx: mpsc::UnboundedSender<RaftMsg>,
    apply_tx: mpsc::UnboundedSender<(u64, Bytes)>,
    status: Arc<RaftStatus>,
    deadline: Instant,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        peers: Vec<(u32, String)>,
        hb_interval: Duration,
        election_min: u64,
        election_max: u64,
        storage: Storage,
        current_term: i32,
        voted_for: i32,
        log: RaftLog,
        inbox: mpsc::UnboundedReceiver<RaftMsg>,
        self_tx: mpsc::UnboundedSender<RaftMsg>,
        apply_tx: mpsc::UnboundedSender<(u64, Bytes)>,
        status: Arc<RaftStatus>,
    ) -> Node {
        let cluster_size = peers.len() + 1;
        let call_timeout =
            Duration::from_millis(hb_interval.as_millis().saturating_sub(50).max(100) as u64);
        let mut node = Node {
            id,
            peers,
            cluster_size,
            hb_interval,
            election_min,
            election_max,
            call_timeout,
            role: Role::Follower,
            current_term,
            voted_for,
            log,
            storage,
            commit_index: 0,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            pending: HashMap::new(),
            inbox,
            self_tx,
            apply_tx,
            status,
            deadline: Instant::now(),
        };
        node.reset_election_deadline();
        node.publish();
        node
    }

    pub async fn run(mut self) {
        loop {
            let received =
                tokio::time::timeout_at(self.deadline, self.inbox.recv()).await;
            match received {
                Ok(Some(msg)) => self.handle(msg),
                Ok(None) => return,
                Err(_) => self.on_timeout(),
            }
        }
    }

    fn handle(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::Rpc { req, resp } => {
                let reply = match req {
                    RpcRequest::Vote(v) => RpcReply::Vote(self.on_vote(v)),
                    RpcRequest::Append(a) => RpcReply::Append(self.on_append(a)),
                };
                let _ = resp.send(reply);
            }
            RaftMsg::VoteResult {
                term_at_send,
                peer,
                reply,
            } => self.on_vote_result(term_at_send, peer, reply),
            RaftMsg::AppendResult {
                peer,
                term_at_send,
                prev,
                count,
                reply,
            } => self.on_append_result(peer, term_at_send, prev, count, reply),
            RaftMsg::Propose { command, resp } => self.on_propose(command, resp),
            RaftMsg::Applied { index, reply } => {
                if let Some(tx) = self.pending.remove(&index) {
                    let _ = tx.send(Outcome::Reply(reply));
                }
            }
        }
    }

    fn majority(&self, count: usize) -> bool {
        count * 2 > self.cluster_size
    }

    fn publish(&self) {
        self.status
            .term
            .store(self.current_term as i64, Ordering::Relaxed);
        self.status.commit.store(self.commit_index, Ordering::Relaxed);
        self.status.role.store(
            match self.role {
                Role::Follower => 0,
                Role::Candidate => 1,
                Role::Leader => 2,
            },
            Ordering::Relaxed,
        );
        self.status
            .leader
            .store(self.leader_id.unwrap_or(0), Ordering::Relaxed);
    }

    fn reset_election_deadline(&mut self) {
        let wait = rand::thread_rng().gen_range(self.election_min..self.election_max);
        self.deadline = Instant::now() + Duration::from_millis(wait);
    }

    fn persist_hdr(&mut self) {
        if let Err(e) = self.storage.save_hdr(self.current_term, self.voted_for) {
            warn!("raft: persisting term/vote failed: {}", e);
        }
    }

    /// Observe a higher term: revert to follower and fail the pending
    /// proposals so their clients can retry against the new leader.
    fn step_down(&mut self, term: i32) {
        debug!(term, "stepping down");
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = -1;
        self.persist_hdr();
        self.votes.clear();
        self.leader_id = None;
        self.fail_pending();
        self.reset_election_deadline();
        self.publish();
    }

    fn fail_pending(&mut self) {
        let hint = self
            .leader_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Outcome::Reply(Reply::Error(
                CmdError::NotLeader(hint.clone()).to_string(),
            )));
        }
    }

    fn on_timeout(&mut self) {
        match self.role {
            Role::Leader => {
                self.broadcast_append();
                self.deadline = Instant::now() + self.hb_interval;
            }
            _ => self.start_election(),
        }
    }

    fn start_election(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = self.id as i32;
        self.leader_id = None;
        self.persist_hdr();
        self.votes = HashSet::from([self.id]);
        self.reset_election_deadline();
        self.publish();
        info!(term = self.current_term, "election timeout, becoming candidate");

        if self.majority(self.votes.len()) {
            self.become_leader();
            return;
        }
        let req = VoteReq {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for (peer, addr) in self.peers.clone() {
            let tx = self.self_tx.clone();
            let term_at_send = self.current_term;
            let req = req.clone();
            let timeout = self.call_timeout;
            tokio::spawn(async move {
                let reply = match rpc::call(addr, RpcRequest::Vote(req), timeout).await {
                    Some(RpcReply::Vote(v)) => Some(v),
                    _ => None,
                };
                let _ = tx.send(RaftMsg::VoteResult {
                    term_at_send,
                    peer,
                    reply,
                });
            });
        }
    }

    fn on_vote(&mut self, req: VoteReq) -> VoteReply {
        if req.term < self.current_term {
            return VoteReply {
                term: self.current_term,
                granted: false,
            };
        }
        if req.term > self.current_term {
            self.step_down(req.term);
        }
        let up_to_date = self
            .log
            .other_is_up_to_date(req.last_log_index, req.last_log_term);
        let free = self.voted_for == -1 || self.voted_for == req.candidate_id as i32;
        if up_to_date && free {
            self.voted_for = req.candidate_id as i32;
            // the grant must be durable before it is spoken
            if let Err(e) = self.storage.save_hdr(self.current_term, self.voted_for) {
                warn!("raft: persisting vote failed: {}", e);
                return VoteReply {
                    term: self.current_term,
                    granted: false,
                };
            }
            self.reset_election_deadline();
            debug!(candidate = req.candidate_id, term = self.current_term, "vote granted");
            VoteReply {
                term: self.current_term,
                granted: true,
            }
        } else {
            VoteReply {
                term: self.current_term,
                granted: false,
            }
        }
    }

    fn on_vote_result(&mut self, term_at_send: i32, peer: u32, reply: Option<VoteReply>) {
        if self.role != Role::Candidate || term_at_send != self.current_term {
            return;
        }
        let reply = match reply {
            Some(reply) => reply,
            None => return,
        };
        if reply.term > self.current_term {
            self.step_down(reply.term);
            return;
        }
        if reply.granted {
            self.votes.insert(peer);
            if self.majority(self.votes.len()) {
                self.become_leader();
            }
        }
    }

    fn become_leader(&mut self) {
        info!(term = self.current_term, "won election, becoming leader");
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        let next = self.log.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for (peer, _) in &self.peers {
            self.next_index.insert(*peer, next);
            self.match_index.insert(*peer, 0);
        }
        self.publish();
        self.broadcast_append();
        self.deadline = Instant::now() + self.hb_interval;
    }

    fn broadcast_append(&mut self) {
        for (peer, addr) in self.peers.clone() {
            self.replicate_to(peer, addr);
        }
    }

    fn replicate_to(&mut self, peer: u32, addr: String) {
        let next = *self
            .next_index
            .get(&peer)
            .unwrap_or(&(self.log.last_index() + 1));
        let prev = next.saturating_sub(1);
        let prev_term = self.log.term_at(prev).unwrap_or(-1);
        let entries: Vec<(i32, Bytes)> = self
            .log
            .entries_from(next)
            .iter()
            .map(|e| (e.term, e.command.clone()))
            .collect();
        let count = entries.len();
        let req = AppendReq {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index: prev,
            prev_log_term: prev_term,
            leader_commit: self.commit_index,
            entries,
        };
        let tx = self.self_tx.clone();
        let term_at_send = self.current_term;
        let timeout = self.call_timeout;
        tokio::spawn(async move {
            let reply = match rpc::call(addr, RpcRequest::Append(req), timeout).await {
                Some(RpcReply::Append(a)) => Some(a),
                _ => None,
            };
            let _ = tx.send(RaftMsg::AppendResult {
                peer,
                term_at_send,
                prev,
                count,
                reply,
            });
        });
    }

    fn on_append(&mut self, req: AppendReq) -> AppendReply {
        let fail = |term: i32, x_term: i32, x_index: i64, x_len: u64| AppendReply {
            term,
            success: false,
            x_term,
            x_index,
            x_len,
        };
        if req.term < self.current_term {
            return fail(self.current_term, -1, -1, self.log.len());
        }
        if req.term > self.current_term {
            self.step_down(req.term);
        } else if self.role != Role::Follower {
            self.role = Role::Follower;
            self.fail_pending();
        }
        self.leader_id = Some(req.leader_id);
        self.reset_election_deadline();
        self.publish();

        if req.prev_log_index >= self.log.len() {
            return fail(self.current_term, -1, -1, self.log.len());
        }
        let local_term = match self.log.term_at(req.prev_log_index) {
            Some(t) => t,
            None => return fail(self.current_term, -1, -1, self.log.len()),
        };
        if local_term != req.prev_log_term {
            let x_index = self.log.first_index_of_term(local_term).unwrap_or(0) as i64;
            return fail(self.current_term, local_term, x_index, self.log.len());
        }

        let mut truncated = false;
        let mut appended: Vec<LogEntry> = Vec::new();
        for (i, (term, command)) in req.entries.iter().enumerate() {
            let index = req.prev_log_index + 1 + i as u64;
            if index <= self.log.last_index() {
                if self.log.term_at(index) == Some(*term) {
                    continue;
                }
                self.log.truncate(index);
                truncated = true;
            }
            let entry = LogEntry {
                term: *term,
                command: command.clone(),
            };
            self.log.append(entry.clone());
            appended.push(entry);
        }

        let persisted = if truncated {
            self.storage.rewrite_log(&self.log).is_ok()
        } else if !appended.is_empty() {
            self.storage.append_entries(&appended).is_ok()
        } else {
            true
        };
        if !persisted {
            warn!("raft: log persistence failed, refusing entries");
            return fail(self.current_term, -1, -1, self.log.len());
        }

        if req.leader_commit > self.commit_index {
            let last_new = req.prev_log_index + req.entries.len() as u64;
            let new_commit = req.leader_commit.min(last_new);
            if new_commit > self.commit_index {
                self.advance_commit_to(new_commit);
            }
        }

        AppendReply {
            term: self.current_term,
            success: true,
            x_term: -1,
            x_index: -1,
            x_len: self.log.len(),
        }
    }

    fn on_append_result(
        &mut self,
        peer: u32,
        term_at_send: i32,
        prev: u64,
        count: usize,
        reply: Option<AppendReply>,
    ) {
        if self.role != Role::Leader || term_at_send != self.current_term {
            return;
        }
        let reply = match reply {
            Some(reply) => reply,
            None => return, // silent peer, next heartbeat retries
        };
        if reply.term > self.current_term {
            self.step_down(reply.term);
            return;
        }
        if reply.success {
            let matched = prev + count as u64;
            let entry = self.match_index.entry(peer).or_insert(0);
            if matched > *entry {
                *entry = matched;
            }
            self.next_index.insert(peer, matched + 1);
            self.advance_leader_commit();
        } else {
            // back off using the conflict hints
            let next = if reply.x_term >= 0 {
                match self.log.last_index_of_term(reply.x_term) {
                    Some(last) => last + 1,
                    None => reply.x_index.max(1) as u64,
                }
            } else {
                reply.x_len.max(1)
            };
            self.next_index.insert(peer, next.max(1));
            if let Some(addr) = self
                .peers
                .iter()
                .find(|(id, _)| *id == peer)
                .map(|(_, a)| a.clone())
            {
                self.replicate_to(peer, addr);
            }
        }
    }

    /// Highest N replicated on a majority with an entry from the
    /// current term; committing older-term entries directly is the
    /// classic unsafety the term check prevents.
    fn advance_leader_commit(&mut self) {
        let mut n = self.log.last_index();
        while n > self.commit_index {
            if self.log.term_at(n) == Some(self.current_term) {
                let replicated = 1 + self
                    .peers
                    .iter()
                    .filter(|(peer, _)| {
                        self.match_index.get(peer).map_or(false, |&m| m >= n)
                    })
                    .count();
                if self.majority(replicated) {
                    break;
                }
            }
            n -= 1;
        }
        if n > self.commit_index {
            self.advance_commit_to(n);
        }
    }

    fn advance_commit_to(&mut self, new_commit: u64) {
        for index in (self.commit_index + 1)..=new_commit {
            if let Some(entry) = self.log.entry(index) {
                let _ = self.apply_tx.send((index, entry.command.clone()));
            }
        }
        self.commit_index = new_commit;
        self.publish();
    }

    fn on_propose(&mut self, command: Bytes, resp: Option<oneshot::Sender<Outcome>>) {
        if self.role != Role::Leader {
            if let Some(tx) = resp {
                let hint = self
                    .leader_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "?".to_string());
                let _ = tx.send(Outcome::Reply(Reply::Error(
                    CmdError::NotLeader(hint).to_string(),
                )));
            }
            return;
        }
        let index = self.log.last_index() + 1;
        let entry = LogEntry {
            term: self.current_term,
            command,
        };
        self.log.append(entry.clone());
        if let Err(e) = self.storage.append_entries(&[entry]) {
            warn!("raft: appending proposal failed: {}", e);
            self.log.truncate(index);
            if let Some(tx) = resp {
                let _ = tx.send(Outcome::Reply(Reply::Error(
                    "ERR raft log write failed".to_string(),
                )));
            }
            return;
        }
        if let Some(tx) = resp {
            self.pending.insert(index, tx);
        }
        if self.cluster_size == 1 {
            self.advance_commit_to(index);
        } else {
            self.broadcast_append();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(dir: &tempfile::TempDir, peers: Vec<(u32, String)>) -> (Node, mpsc::UnboundedReceiver<(u64, Bytes)>) {
        let (storage, term, voted, log) =
            Storage::open(dir.path().to_str().unwrap(), 1).unwrap();
        let (self_tx, inbox) = mpsc::unbounded_channel();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RaftStatus::default());
        let node = Node::new(
            1,
            peers,
            Duration::from_millis(500),
            3000,
            6000,
            storage,
            term,
            voted,
            log,
            inbox,
            self_tx,
            apply_tx,
            status,
        );
        (node, apply_rx)
    }

    fn append_req(term: i32, prev: u64, prev_term: i32, commit: u64, entries: Vec<(i32, &[u8])>) -> AppendReq {
        AppendReq {
            term,
            leader_id: 2,
            prev_log_index: prev,
            prev_log_term: prev_term,
            leader_commit: commit,
            entries: entries
                .into_iter()
                .map(|(t, c)| (t, Bytes::copy_from_slice(c)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn vote_granting_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, _apply) = test_node(&dir, vec![(2, "x".into()), (3, "x".into())]);

        // stale term is refused
        node.current_term = 5;
        let reply = node.on_vote(VoteReq {
            term: 4,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: -1,
        });
        assert!(!reply.granted);
        assert_eq!(reply.term, 5);

        // up-to-date candidate in a newer term gets the vote
        let reply = node.on_vote(VoteReq {
            term: 6,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: -1,
        });
        assert!(reply.granted);
        assert_eq!(node.voted_for, 2);

        // same term, different candidate: vote already taken
        let reply = node.on_vote(VoteReq {
            term: 6,
            candidate_id: 3,
            last_log_index: 9,
            last_log_term: 5,
        });
        assert!(!reply.granted);
    }

    #[tokio::test]
    async fn vote_refused_for_stale_log() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, _apply) = test_node(&dir, vec![(2, "x".into())]);
        node.log.append(LogEntry {
            term: 3,
            command: Bytes::from_static(b"w"),
        });
        node.current_term = 3;
        let reply = node.on_vote(VoteReq {
            term: 4,
            candidate_id: 2,
            last_log_index: 5,
            last_log_term: 2, // lower last term than ours
        });
        assert!(!reply.granted);
    }

    #[tokio::test]
    async fn append_beyond_log_hints_xlen() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, _apply) = test_node(&dir, vec![(2, "x".into())]);
        let reply = node.on_append(append_req(1, 5, 1, 0, vec![(1, b"cmd")]));
        assert!(!reply.success);
        assert_eq!(reply.x_term, -1);
        assert_eq!(reply.x_index, -1);
        assert_eq!(reply.x_len, 1); // only the sentinel
    }

    #[tokio::test]
    async fn append_conflict_hints_term_and_first_index() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, _apply) = test_node(&dir, vec![(2, "x".into())]);
        for term in [1, 2, 2] {
            node.log.append(LogEntry {
                term,
                command: Bytes::from_static(b"old"),
            });
        }
        node.current_term = 2;
        let reply = node.on_append(append_req(3, 3, 3, 0, vec![]));
        assert!(!reply.success);
        assert_eq!(reply.x_term, 2);
        assert_eq!(reply.x_index, 2); // first index of term 2
        assert_eq!(reply.x_len, 4);
    }

    #[tokio::test]
    async fn append_truncates_conflicts_and_applies_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, mut apply) = test_node(&dir, vec![(2, "x".into())]);
        node.log.append(LogEntry {
            term: 1,
            command: Bytes::from_static(b"keep"),
        });
        node.log.append(LogEntry {
            term: 1,
            command: Bytes::from_static(b"stale"),
        });
        node.current_term = 1;

        let reply = node.on_append(append_req(
            2,
            1,
            1,
            2,
            vec![(2, b"new-2"), (2, b"new-3")],
        ));
        assert!(reply.success);
        assert_eq!(node.log.last_index(), 3);
        assert_eq!(node.log.term_at(2), Some(2));
        assert_eq!(node.commit_index, 2);
        // committed prefix flows to the apply loop in order
        assert_eq!(apply.try_recv().unwrap().0, 1);
        assert_eq!(apply.try_recv().unwrap().0, 2);
        assert!(apply.try_recv().is_err());
    }

    #[tokio::test]
    async fn leader_commit_requires_current_term_majority() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, mut apply) = test_node(&dir, vec![(2, "x".into()), (3, "x".into())]);
        node.current_term = 2;
        node.role = Role::Leader;
        node.log.append(LogEntry {
            term: 1,
            command: Bytes::from_static(b"old-term"),
        });
        node.log.append(LogEntry {
            term: 2,
            command: Bytes::from_static(b"current"),
        });

        // only the old-term entry replicated: nothing commits
        node.match_index.insert(2, 1);
        node.match_index.insert(3, 0);
        node.advance_leader_commit();
        assert_eq!(node.commit_index, 0);

        // current-term entry on a majority commits both
        node.match_index.insert(2, 2);
        node.advance_leader_commit();
        assert_eq!(node.commit_index, 2);
        assert_eq!(apply.try_recv().unwrap().0, 1);
        assert_eq!(apply.try_recv().unwrap().0, 2);
    }

    #[tokio::test]
    async fn propose_on_follower_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, _apply) = test_node(&dir, vec![(2, "x".into())]);
        node.leader_id = Some(2);
        let (tx, rx) = oneshot::channel();
        node.on_propose(Bytes::from_static(b"cmd"), Some(tx));
        match rx.await.unwrap() {
            Outcome::Reply(Reply::Error(e)) => assert!(e.starts_with("NOTLEADER 2")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn single_node_cluster_commits_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, mut apply) = test_node(&dir, vec![]);
        node.role = Role::Leader;
        node.current_term = 1;
        let (tx, _rx) = oneshot::channel();
        node.on_propose(Bytes::from_static(b"cmd"), Some(tx));
        assert_eq!(node.commit_index, 1);
        assert_eq!(apply.try_recv().unwrap().0, 1);
    }

    #[tokio::test]
    async fn backoff_uses_conflict_hints() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, _apply) = test_node(&dir, vec![(2, "127.0.0.1:1".into())]);
        node.role = Role::Leader;
        node.current_term = 3;
        for term in [1, 1, 3] {
            node.log.append(LogEntry {
                term,
                command: Bytes::from_static(b"e"),
            });
        }
        node.next_index.insert(2, 4);

        // follower had term 1 at the probe point: leader has term 1,
        // so next lands past its last occurrence
        node.on_append_result(
            2,
            3,
            3,
            0,
            Some(AppendReply {
                term: 3,
                success: false,
                x_term: 1,
                x_index: 1,
                x_len: 3,
            }),
        );
        assert_eq!(node.next_index[&2], 3);

        // unknown conflict term: fall back to xIndex
        node.on_append_result(
            2,
            3,
            2,
            0,
            Some(AppendReply {
                term: 3,
                success: false,
                x_term: 7,
                x_index: 2,
                x_len: 3,
            }),
        );
        assert_eq!(node.next_index[&2], 2);

        // bare xLen hint
        node.on_append_result(
            2,
            3,
            1,
            0,
            Some(AppendReply {
                term: 3,
                success: false,
                x_term: -1,
                x_index: -1,
                x_len: 2,
            }),
        );
        assert_eq!(node.next_index[&2], 2);
    }
}
