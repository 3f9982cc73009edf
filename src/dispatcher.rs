use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::aof::{self, AofHandle};
use crate::cmd::{self, AdminCmd, CommandKind, CommandProc, ExecCtx};
use crate::config::{AofSyncPolicy, Config};
use crate::db::Databases;
use crate::error::{CmdError, ServerError};
use crate::raft::{self, RaftHandle};
use crate::rdb;
use crate::repl::{self, ReplMaster, ReplicaLinkHandle};
use crate::resp::{encode_command, parse_command, Reply};
use crate::util::{now_ms, now_secs, parse_i64};

/// Where a command came from. The source decides which guards apply
/// and which side effects fire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Client,
    /// Replica applying its primary's stream; bypasses the read-only
    /// guard and is not re-propagated.
    Master,
    /// Startup replay; the bytes are already in the file.
    AofReplay,
    /// Committed entry delivered by the Raft apply loop.
    Raft,
}

pub struct Request {
    pub argv: Vec<Vec<u8>>,
    pub db_index: usize,
    pub source: Source,
    pub resp: Option<oneshot::Sender<Outcome>>,
}

/// What a connection does with a finished command.
#[derive(Debug)]
pub enum Outcome {
    Reply(Reply),
    /// SELECT succeeded; the connection adopts the index.
    Select(usize),
    /// PSYNC succeeded; the connection becomes a replica feed.
    Psync(PsyncOutcome),
    /// SHUTDOWN was accepted; the server is going down.
    ShuttingDown,
}

#[derive(Debug)]
pub enum PsyncOutcome {
    Full {
        run_id: String,
        offset: u64,
        dump: Vec<u8>,
        feed: mpsc::UnboundedReceiver<Bytes>,
    },
    Partial {
        tail: Vec<u8>,
        feed: mpsc::UnboundedReceiver<Bytes>,
    },
}

/// Everything the dispatcher task consumes, client requests and
/// internal completions alike.
pub enum Message {
    Request(Request),
    /// 100 ms cron pulse.
    Tick,
    BgSaveDone {
        ok: bool,
        dirty_at_start: u64,
    },
    /// The rewrite task finished writing the snapshot portion.
    RewriteSnapshotDone {
        tmp: PathBuf,
    },
    RewriteFailed {
        reason: String,
    },
    /// The writer finished (or failed) the atomic swap.
    RewriteDone {
        ok: bool,
    },
    /// Replica full resync: replace the whole keyspace with a dump.
    LoadSnapshot {
        dump: Vec<u8>,
        resp: oneshot::Sender<Result<(), String>>,
    },
}

/// Counters the connection layer shares with INFO.
#[derive(Default)]
pub struct ServerStats {
    pub connected: AtomicU64,
    pub total_connections: AtomicU64,
}

/// The single logical executor. One task owns the keyspaces and drains
/// one channel; everything else talks to it through messages.
pub struct Dispatcher {
    cfg: Arc<Config>,
    dbs: Databases,
    rx: mpsc::Receiver<Message>,
    self_tx: mpsc::Sender<Message>,
    aof: Option<AofHandle>,
    raft: Option<RaftHandle>,
    stats: Arc<ServerStats>,
    shutdown: Arc<Notify>,

    start_time: u64,
    dirty: u64,
    last_save: u64,
    stat_numcommands: u64,

    bgsave_in_progress: bool,
    rewrite_in_progress: bool,
    rewrite_feed: Option<mpsc::UnboundedSender<Bytes>>,
    rewrite_side: Option<mpsc::UnboundedReceiver<Bytes>>,
    aof_sel_db: i64,

    repl: Option<ReplMaster>,
    master_addr: Option<(String, u16)>,
    master_link: Option<ReplicaLinkHandle>,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<Config>,
        rx: mpsc::Receiver<Message>,
        self_tx: mpsc::Sender<Message>,
        aof: Option<AofHandle>,
        raft: Option<RaftHandle>,
        stats: Arc<ServerStats>,
        shutdown: Arc<Notify>,
    ) -> Dispatcher {
        let repl = if cfg.replication_enabled && raft.is_none() {
            Some(ReplMaster::new(cfg.replication_buffer_size))
        } else {
            None
        };
        let dbs = Databases::new(cfg.database_count);
        Dispatcher {
            cfg,
            dbs,
            rx,
            self_tx,
            aof,
            raft,
            stats,
            shutdown,
            start_time: now_secs(),
            dirty: 0,
            last_save: now_secs(),
            stat_numcommands: 0,
            bgsave_in_progress: false,
            rewrite_in_progress: false,
            rewrite_feed: None,
            rewrite_side: None,
            aof_sel_db: -1,
            repl,
            master_addr: None,
            master_link: None,
        }
    }

    /// Load persisted state and arm the periodic machinery. Runs before
    /// the first client command.
    pub async fn bootstrap(&mut self) -> Result<(), ServerError> {
        let started = std::time::Instant::now();
        if self.cfg.aof_enabled && std::path::Path::new(&self.cfg.aof_file).exists() {
            let commands = self.replay_aof().await?;
            info!(
                "DB loaded from append only file: {} commands, {:.3} seconds",
                commands,
                started.elapsed().as_secs_f64()
            );
        } else if self.cfg.rdb_enabled {
            if let Some(dbs) =
                rdb::load_file(&self.cfg.rdb_file, self.cfg.database_count, now_ms())?
            {
                self.dbs = dbs;
                info!(
                    "DB loaded from disk: {} keys, {:.3} seconds",
                    self.dbs.total_keys(),
                    started.elapsed().as_secs_f64()
                );
            }
        }

        if let Some((host, port)) = self.cfg.master.clone() {
            info!("configured as replica of {}:{}", host, port);
            self.master_addr = Some((host.clone(), port));
            self.master_link = Some(repl::spawn_link(host, port, self.self_tx.clone()));
        }

        let tick = self.self_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            loop {
                interval.tick().await;
                if tick.send(Message::Tick).await.is_err() {
                    return;
                }
            }
        });
        Ok(())
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                Message::Request(req) => self.handle_request(req).await,
                Message::Tick => self.cron(),
                Message::BgSaveDone { ok, dirty_at_start } => {
                    self.bgsave_in_progress = false;
                    if ok {
                        self.last_save = now_secs();
                        self.dirty = self.dirty.saturating_sub(dirty_at_start);
                        info!("background saving terminated with success");
                    } else {
                        warn!("background saving error");
                    }
                }
                Message::RewriteSnapshotDone { tmp } => self.finish_rewrite(tmp).await,
                Message::RewriteFailed { reason } => {
                    warn!("background append only file rewriting failed: {}", reason);
                    self.rewrite_feed = None;
                    self.rewrite_side = None;
                    self.rewrite_in_progress = false;
                }
                Message::RewriteDone { ok } => {
                    self.rewrite_in_progress = false;
                    if ok {
                        info!("background append only file rewriting finished");
                    } else {
                        warn!("background append only file rewriting failed at swap");
                    }
                }
                Message::LoadSnapshot { dump, resp } => {
                    match rdb::load_from_bytes(&dump, self.cfg.database_count, now_ms()) {
                        Ok(dbs) => {
                            self.dbs = dbs;
                            info!(
                                "keyspace replaced from primary dump: {} keys",
                                self.dbs.total_keys()
                            );
                            let _ = resp.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = resp.send(Err(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, req: Request) {
        let Request {
            argv,
            db_index,
            source,
            mut resp,
        } = req;

        // Consensus mode: client writes travel the log, not this path.
        if source == Source::Client && self.raft.is_some() {
            if let Some(command) = cmd::lookup(
                &String::from_utf8_lossy(&argv[0]).to_ascii_lowercase(),
            ) {
                if command.flags.is_write() && command.arity_ok(argv.len()) {
                    let payload = raft::encode_entry(db_index, &argv);
                    if let Some(raft) = &self.raft {
                        raft.propose(payload, resp.take());
                    }
                    return;
                }
            }
        }

        let (outcome, ack) = self.execute(argv, db_index, source).await;
        match resp {
            Some(tx) => match ack {
                Some(ack_rx) => {
                    // ALWAYS policy: the reply is released only once the
                    // bytes are durable
                    tokio::spawn(async move {
                        let durable = ack_rx.await.unwrap_or(false);
                        let out = if durable {
                            outcome
                        } else {
                            Outcome::Reply(Reply::Error(
                                "ERR append only file write failed".to_string(),
                            ))
                        };
                        let _ = tx.send(out);
                    });
                }
                None => {
                    let _ = tx.send(outcome);
                }
            },
            None => {}
        }
    }

    /// Run one command against the keyspace and fire its side effects.
    /// This is the only place the keyspace is mutated.
    async fn execute(
        &mut self,
        argv: Vec<Vec<u8>>,
        db_index: usize,
        source: Source,
    ) -> (Outcome, Option<oneshot::Receiver<bool>>) {
        let err = |e: CmdError| (Outcome::Reply(Reply::Error(e.to_string())), None);

        if argv.is_empty() {
            return err(CmdError::UnknownCommand(String::new()));
        }
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_lowercase();
        let command = match cmd::lookup(&name) {
            Some(command) => command,
            None => return err(CmdError::UnknownCommand(name)),
        };
        if !command.arity_ok(argv.len()) {
            return err(CmdError::WrongArity(name));
        }
        if command.flags.is_write() && source == Source::Client && self.master_addr.is_some() {
            return err(CmdError::ReadOnlyReplica);
        }
        if command.flags.is_deny_oom()
            && source == Source::Client
            && self.cfg.max_memory > 0
            && !self.ensure_memory()
        {
            return err(CmdError::Oom);
        }

        self.stat_numcommands += 1;

        let proc: CommandProc = match &command.kind {
            CommandKind::Admin(admin) => {
                return (self.admin(*admin, &argv, source).await, None)
            }
            CommandKind::Data(proc) => *proc,
        };

        let mut ctx = ExecCtx {
            dbs: &mut self.dbs,
            db_index,
            now_ms: now_ms(),
            dirty: 0,
            propagate: None,
        };
        let result = proc(&mut ctx, &argv);
        let dirty = ctx.dirty;
        let propagate = ctx.propagate.take();

        match result {
            Err(e) => err(e),
            Ok(reply) => {
                let mut ack = None;
                if dirty > 0 {
                    self.dirty += dirty;
                    if command.flags.is_write() {
                        let prop_argv = propagate.unwrap_or(argv);
                        let bytes = encode_command(&prop_argv);
                        if source != Source::AofReplay {
                            ack = self.feed_aof(db_index, &bytes).await;
                        }
                        let fan_out = source != Source::AofReplay
                            && source != Source::Master
                            && self.master_addr.is_none();
                        if fan_out {
                            if let Some(repl) = &mut self.repl {
                                repl.feed(db_index, &bytes);
                            }
                        }
                    }
                }
                (Outcome::Reply(reply), ack)
            }
        }
    }

    /// Hand a write's bytes to the AOF writer, injecting a SELECT when
    /// the log stream switches databases, mirroring into the rewrite
    /// side buffer while one runs, and attaching a durability ack under
    /// the ALWAYS policy.
    async fn feed_aof(
        &mut self,
        db_index: usize,
        bytes: &[u8],
    ) -> Option<oneshot::Receiver<bool>> {
        let aof = self.aof.clone()?;
        let mut chunk = Vec::with_capacity(bytes.len() + 32);
        if self.aof_sel_db != db_index as i64 {
            chunk.extend_from_slice(&encode_command(&[
                b"select".to_vec(),
                db_index.to_string().into_bytes(),
            ]));
            self.aof_sel_db = db_index as i64;
        }
        chunk.extend_from_slice(bytes);
        if let Some(feed) = &self.rewrite_feed {
            let _ = feed.send(Bytes::copy_from_slice(&chunk));
        }
        let (ack_tx, ack_rx) = if self.cfg.aof_sync_policy == AofSyncPolicy::Always {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        aof.append(Bytes::from(chunk), ack_tx).await;
        ack_rx
    }

    async fn admin(&mut self, which: AdminCmd, argv: &[Vec<u8>], source: Source) -> Outcome {
        let err = |e: CmdError| Outcome::Reply(Reply::Error(e.to_string()));
        match which {
            AdminCmd::Select => match parse_i64(&argv[1]) {
                Some(index) if index >= 0 && (index as usize) < self.dbs.count() => {
                    Outcome::Select(index as usize)
                }
                _ => err(CmdError::InvalidDbIndex),
            },
            AdminCmd::Info => Outcome::Reply(Reply::Bulk(self.info().into_bytes())),
            AdminCmd::LastSave => Outcome::Reply(Reply::Integer(self.last_save as i64)),
            AdminCmd::Save => {
                if self.bgsave_in_progress {
                    return err(CmdError::Custom(
                        "background save in progress".to_string(),
                    ));
                }
                let result = tokio::task::block_in_place(|| {
                    rdb::save_to_file(&self.dbs, &self.cfg.rdb_file, self.cfg.rdb_compression)
                });
                match result {
                    Ok(()) => {
                        self.last_save = now_secs();
                        self.dirty = 0;
                        Outcome::Reply(Reply::ok())
                    }
                    Err(e) => {
                        warn!("SAVE failed: {}", e);
                        err(CmdError::Custom("save failed".to_string()))
                    }
                }
            }
            AdminCmd::BgSave => {
                if self.bgsave_in_progress {
                    return err(CmdError::Custom(
                        "background save already in progress".to_string(),
                    ));
                }
                self.start_bgsave();
                Outcome::Reply(Reply::Simple("Background saving started".to_string()))
            }
            AdminCmd::BgRewriteAof => {
                if self.aof.is_none() {
                    return err(CmdError::Custom(
                        "append only file is disabled".to_string(),
                    ));
                }
                if self.rewrite_in_progress {
                    return err(CmdError::Custom(
                        "background append only file rewriting already in progress"
                            .to_string(),
                    ));
                }
                self.start_rewrite();
                Outcome::Reply(Reply::Simple(
                    "Background append only file rewriting started".to_string(),
                ))
            }
            AdminCmd::Shutdown => {
                let nosave =
                    argv.len() >= 2 && argv[1].eq_ignore_ascii_case(b"nosave");
                info!("user requested shutdown, {}",
                    if nosave { "not saving" } else { "saving the final snapshot" });
                if let Some(aof) = self.aof.clone() {
                    if let Err(e) = aof.flush(Duration::from_secs(5)).await {
                        warn!("final AOF flush: {}", e);
                    }
                }
                if !nosave && self.cfg.rdb_enabled {
                    let result = tokio::task::block_in_place(|| {
                        rdb::save_to_file(
                            &self.dbs,
                            &self.cfg.rdb_file,
                            self.cfg.rdb_compression,
                        )
                    });
                    if let Err(e) = result {
                        warn!("final snapshot failed: {}", e);
                    }
                }
                self.shutdown.notify_one();
                Outcome::ShuttingDown
            }
            AdminCmd::SlaveOf => self.slave_of(argv),
            AdminCmd::Psync => self.psync(argv, source),
        }
    }

    fn slave_of(&mut self, argv: &[Vec<u8>]) -> Outcome {
        let err = |e: CmdError| Outcome::Reply(Reply::Error(e.to_string()));
        if self.raft.is_some() {
            return err(CmdError::Custom(
                "SLAVEOF is not available in consensus mode".to_string(),
            ));
        }
        let host = String::from_utf8_lossy(&argv[1]).to_string();
        let port_arg = String::from_utf8_lossy(&argv[2]).to_string();
        if host.eq_ignore_ascii_case("no") && port_arg.eq_ignore_ascii_case("one") {
            if let Some(link) = self.master_link.take() {
                link.shutdown();
            }
            if self.master_addr.take().is_some() {
                if let Some(repl) = &mut self.repl {
                    repl.promote();
                }
                info!("MASTER MODE enabled");
            }
            return Outcome::Reply(Reply::ok());
        }
        let port: u16 = match port_arg.parse() {
            Ok(port) => port,
            Err(_) => return err(CmdError::NotInteger),
        };
        if let Some(link) = self.master_link.take() {
            link.shutdown();
        }
        self.master_addr = Some((host.clone(), port));
        info!("REPLICA MODE enabled, primary is {}:{}", host, port);
        self.master_link = Some(repl::spawn_link(host, port, self.self_tx.clone()));
        Outcome::Reply(Reply::ok())
    }

    fn psync(&mut self, argv: &[Vec<u8>], source: Source) -> Outcome {
        let err = |e: CmdError| Outcome::Reply(Reply::Error(e.to_string()));
        if source != Source::Client {
            return err(CmdError::Custom("PSYNC from invalid source".to_string()));
        }
        if self.raft.is_some() || self.master_addr.is_some() {
            return err(CmdError::Custom(
                "PSYNC is not available on this node".to_string(),
            ));
        }
        let repl = match self.repl.as_mut() {
            Some(repl) => repl,
            None => {
                return err(CmdError::Custom("replication is disabled".to_string()))
            }
        };
        let offered_id = String::from_utf8_lossy(&argv[1]).to_string();
        let offered_offset = parse_i64(&argv[2]).unwrap_or(-1);

        if repl.can_continue(&offered_id, offered_offset) {
            let tail = repl.tail_from(offered_offset as u64);
            let feed = repl.register();
            info!(
                "partial resynchronization accepted, {} backlog bytes",
                tail.len()
            );
            return Outcome::Psync(PsyncOutcome::Partial { tail, feed });
        }

        let run_id = repl.run_id.clone();
        let offset = repl.offset;
        let feed = repl.register();
        repl.reset_sel_db();
        let dump = rdb::serialize(&self.dbs, self.cfg.rdb_compression);
        info!(
            "full resynchronization requested, sending {} byte dump at offset {}",
            dump.len(),
            offset
        );
        Outcome::Psync(PsyncOutcome::Full {
            run_id,
            offset,
            dump,
            feed,
        })
    }

    fn start_bgsave(&mut self) {
        let snapshot = self.dbs.clone();
        let path = self.cfg.rdb_file.clone();
        let compression = self.cfg.rdb_compression;
        let dirty_at_start = self.dirty;
        let tx = self.self_tx.clone();
        self.bgsave_in_progress = true;
        info!("background saving started");
        tokio::spawn(async move {
            let ok = tokio::task::spawn_blocking(move || {
                rdb::save_to_file(&snapshot, &path, compression)
            })
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
            let _ = tx.send(Message::BgSaveDone { ok, dirty_at_start }).await;
        });
    }

    fn start_rewrite(&mut self) {
        let snapshot = self.dbs.clone();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        self.rewrite_feed = Some(feed_tx);
        self.rewrite_side = Some(feed_rx);
        // force the next live append to restate its database, since the
        // rewritten file ends on an arbitrary SELECT
        self.aof_sel_db = -1;
        self.rewrite_in_progress = true;
        let tmp = PathBuf::from(format!(
            "{}.rewrite-{}",
            self.cfg.aof_file,
            std::process::id()
        ));
        let (done_tx, done_rx) = oneshot::channel();
        aof::spawn_rewrite(snapshot, tmp, done_tx);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let msg = match done_rx.await {
                Ok(Ok(tmp)) => Message::RewriteSnapshotDone { tmp },
                Ok(Err(reason)) => Message::RewriteFailed { reason },
                Err(_) => Message::RewriteFailed {
                    reason: "rewrite task vanished".to_string(),
                },
            };
            let _ = tx.send(msg).await;
        });
        info!("background append only file rewriting started");
    }

    async fn finish_rewrite(&mut self, tmp: PathBuf) {
        // dropping the feed sender freezes the side buffer's content;
        // anything enqueued from here on lands in the new file via the
        // writer's regular queue
        self.rewrite_feed = None;
        let side = self.rewrite_side.take();
        match (self.aof.clone(), side) {
            (Some(aof), Some(side)) => {
                let (done_tx, done_rx) = oneshot::channel();
                aof.finish_rewrite(tmp, side, done_tx).await;
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    let ok = done_rx.await.unwrap_or(false);
                    let _ = tx.send(Message::RewriteDone { ok }).await;
                });
            }
            _ => {
                self.rewrite_in_progress = false;
            }
        }
    }

    fn cron(&mut self) {
        let now = now_ms();
        for (_, db) in self.dbs.iter_mut() {
            db.active_expire_cycle(now, 20);
        }

        if self.cfg.rdb_enabled && !self.bgsave_in_progress && self.dirty > 0 {
            let elapsed = now_secs().saturating_sub(self.last_save);
            let due = self
                .cfg
                .save_points
                .iter()
                .any(|sp| self.dirty >= sp.changes && elapsed >= sp.seconds);
            if due {
                debug!(
                    dirty = self.dirty,
                    elapsed, "save point reached, scheduling background save"
                );
                self.start_bgsave();
            }
        }

        if self.cfg.max_memory > 0 {
            self.ensure_memory();
        }
    }

    /// Soft max-memory enforcement: evict volatile keys, nearest expiry
    /// first, until under the limit or out of candidates.
    fn ensure_memory(&mut self) -> bool {
        let limit = self.cfg.max_memory as usize;
        if limit == 0 {
            return true;
        }
        let mut used = self.dbs.used_memory();
        let mut rounds = 0;
        while used > limit && rounds < 128 {
            let mut evicted = false;
            for (_, db) in self.dbs.iter_mut() {
                if let Some(key) = db.nearest_volatile(16) {
                    db.remove(&key);
                    evicted = true;
                }
            }
            if !evicted {
                break;
            }
            used = self.dbs.used_memory();
            rounds += 1;
        }
        used <= limit
    }

    /// Replay the append-only file through the normal execution path.
    /// A truncated trailing command is tolerated; anything else
    /// malformed refuses startup.
    async fn replay_aof(&mut self) -> Result<u64, ServerError> {
        let raw = tokio::fs::read(&self.cfg.aof_file).await?;
        let mut buf = BytesMut::from(&raw[..]);
        let mut current_db = 0usize;
        let mut commands = 0u64;
        loop {
            match parse_command(&mut buf) {
                Ok(Some(argv)) => {
                    if argv.is_empty() {
                        continue;
                    }
                    let (outcome, _) =
                        self.execute(argv, current_db, Source::AofReplay).await;
                    match outcome {
                        Outcome::Select(index) => current_db = index,
                        Outcome::Reply(Reply::Error(e)) => {
                            return Err(ServerError::Persistence(format!(
                                "bad command in append only file: {}",
                                e
                            )));
                        }
                        _ => {}
                    }
                    commands += 1;
                }
                Ok(None) => {
                    if !buf.is_empty() {
                        warn!(
                            "truncated trailing command in append only file ({} bytes discarded)",
                            buf.len()
                        );
                    }
                    break;
                }
                Err(e) => {
                    return Err(ServerError::Persistence(format!(
                        "append only file: {}",
                        e
                    )));
                }
            }
        }
        Ok(commands)
    }

    fn info(&self) -> String {
        let mut out = String::new();
        out.push_str("# Server\r\n");
        out.push_str(&format!("raftis_version:{}\r\n", crate::VERSION));
        out.push_str(&format!("process_id:{}\r\n", std::process::id()));
        out.push_str(&format!(
            "uptime_in_seconds:{}\r\n",
            now_secs().saturating_sub(self.start_time)
        ));

        out.push_str("# Clients\r\n");
        out.push_str(&format!(
            "connected_clients:{}\r\n",
            self.stats.connected.load(Ordering::Relaxed)
        ));

        out.push_str("# Memory\r\n");
        out.push_str(&format!("used_memory:{}\r\n", self.dbs.used_memory()));
        out.push_str(&format!("maxmemory:{}\r\n", self.cfg.max_memory));

        out.push_str("# Persistence\r\n");
        out.push_str(&format!(
            "aof_enabled:{}\r\n",
            self.cfg.aof_enabled as u8
        ));
        out.push_str(&format!(
            "aof_rewrite_in_progress:{}\r\n",
            self.rewrite_in_progress as u8
        ));
        out.push_str(&format!(
            "rdb_bgsave_in_progress:{}\r\n",
            self.bgsave_in_progress as u8
        ));
        out.push_str(&format!("rdb_last_save_time:{}\r\n", self.last_save));
        out.push_str(&format!(
            "rdb_changes_since_last_save:{}\r\n",
            self.dirty
        ));

        out.push_str("# Stats\r\n");
        out.push_str(&format!(
            "total_commands_processed:{}\r\n",
            self.stat_numcommands
        ));
        out.push_str(&format!(
            "total_connections_received:{}\r\n",
            self.stats.total_connections.load(Ordering::Relaxed)
        ));

        out.push_str("# Replication\r\n");
        match (&self.master_addr, &self.repl) {
            (Some((host, port)), _) => {
                out.push_str("role:slave\r\n");
                out.push_str(&format!("master_host:{}\r\n", host));
                out.push_str(&format!("master_port:{}\r\n", port));
                if let Some(link) = &self.master_link {
                    out.push_str(&format!(
                        "master_link_status:{}\r\n",
                        if link.connected.load(Ordering::Relaxed) {
                            "up"
                        } else {
                            "down"
                        }
                    ));
                    out.push_str(&format!(
                        "slave_repl_offset:{}\r\n",
                        link.offset.load(Ordering::Relaxed)
                    ));
                }
            }
            (None, Some(repl)) => {
                out.push_str("role:master\r\n");
                out.push_str(&format!("connected_slaves:{}\r\n", repl.replica_count()));
                out.push_str(&format!("master_replid:{}\r\n", repl.run_id));
                out.push_str(&format!("master_repl_offset:{}\r\n", repl.offset));
            }
            (None, None) => {
                out.push_str("role:master\r\n");
            }
        }

        if let Some(raft) = &self.raft {
            out.push_str("# Raft\r\n");
            out.push_str(&format!("raft_node_id:{}\r\n", raft.node_id));
            out.push_str(&format!("raft_role:{}\r\n", raft.status.role_name()));
            out.push_str(&format!(
                "raft_term:{}\r\n",
                raft.status.term.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "raft_commit_index:{}\r\n",
                raft.status.commit.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "raft_last_applied:{}\r\n",
                raft.status.applied.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "raft_leader_id:{}\r\n",
                raft.status.leader.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dispatcher(cfg: Config) -> Dispatcher {
        let (self_tx, rx) = mpsc::channel(64);
        Dispatcher::new(
            Arc::new(cfg),
            rx,
            self_tx,
            None,
            None,
            Arc::new(ServerStats::default()),
            Arc::new(Notify::new()),
        )
    }

    fn args(parts: &[&[u8]]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.to_vec()).collect()
    }

    async fn run(d: &mut Dispatcher, parts: &[&[u8]]) -> Outcome {
        d.execute(args(parts), 0, Source::Client).await.0
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_your_write() {
        let mut d = test_dispatcher(Config::default());
        match run(&mut d, &[b"set" as &[u8], b"k", b"v"]).await {
            Outcome::Reply(r) => assert_eq!(r, Reply::ok()),
            other => panic!("unexpected {:?}", other),
        }
        match run(&mut d, &[b"get" as &[u8], b"k"]).await {
            Outcome::Reply(r) => assert_eq!(r, Reply::Bulk(b"v".to_vec())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_and_arity_errors() {
        let mut d = test_dispatcher(Config::default());
        match run(&mut d, &[b"nonsense" as &[u8]]).await {
            Outcome::Reply(Reply::Error(e)) => assert!(e.contains("unknown command")),
            other => panic!("unexpected {:?}", other),
        }
        match run(&mut d, &[b"get" as &[u8]]).await {
            Outcome::Reply(Reply::Error(e)) => {
                assert!(e.contains("wrong number of arguments"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn select_validates_index() {
        let mut d = test_dispatcher(Config::default());
        match run(&mut d, &[b"select" as &[u8], b"3"]).await {
            Outcome::Select(3) => {}
            other => panic!("unexpected {:?}", other),
        }
        match run(&mut d, &[b"select" as &[u8], b"99"]).await {
            Outcome::Reply(Reply::Error(e)) => assert!(e.contains("out of range")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn databases_are_isolated() {
        let mut d = test_dispatcher(Config::default());
        d.execute(args(&[b"set" as &[u8], b"k", b"zero"]), 0, Source::Client)
            .await;
        d.execute(args(&[b"set" as &[u8], b"k", b"five"]), 5, Source::Client)
            .await;
        let (outcome, _) = d
            .execute(args(&[b"get" as &[u8], b"k"]), 5, Source::Client)
            .await;
        match outcome {
            Outcome::Reply(r) => assert_eq!(r, Reply::Bulk(b"five".to_vec())),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn aof_replay_rebuilds_state() {
        let dir = tempfile::tempdir().unwrap();
        let aof_path = dir.path().join("test.aof");
        let mut stream = Vec::new();
        for argv in [
            vec![b"set".to_vec(), b"a".to_vec(), b"1".to_vec()],
            vec![b"incr".to_vec(), b"a".to_vec()],
            vec![b"lpush".to_vec(), b"L".to_vec(), b"x".to_vec()],
            vec![b"lpush".to_vec(), b"L".to_vec(), b"y".to_vec()],
            vec![b"rpush".to_vec(), b"L".to_vec(), b"z".to_vec()],
            vec![b"del".to_vec(), b"a".to_vec()],
        ] {
            stream.extend_from_slice(&encode_command(&argv));
        }
        std::fs::write(&aof_path, &stream).unwrap();

        let mut cfg = Config::default();
        cfg.aof_enabled = true;
        cfg.aof_file = aof_path.to_str().unwrap().to_string();
        cfg.rdb_enabled = false;
        let mut d = test_dispatcher(cfg);
        let replayed = d.replay_aof().await.unwrap();
        assert_eq!(replayed, 6);

        match run(&mut d, &[b"exists" as &[u8], b"a"]).await {
            Outcome::Reply(r) => assert_eq!(r, Reply::Integer(0)),
            other => panic!("unexpected {:?}", other),
        }
        match run(&mut d, &[b"lrange" as &[u8], b"L", b"0", b"-1"]).await {
            Outcome::Reply(Reply::Array(items)) => {
                let items: Vec<Vec<u8>> = items
                    .into_iter()
                    .map(|item| match item {
                        Reply::Bulk(b) => b,
                        other => panic!("unexpected {:?}", other),
                    })
                    .collect();
                assert_eq!(items, vec![b"y".to_vec(), b"x".to_vec(), b"z".to_vec()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn aof_replay_tolerates_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let aof_path = dir.path().join("test.aof");
        let mut stream = encode_command(&args(&[b"set" as &[u8], b"k", b"v"]));
        let second = encode_command(&args(&[b"set" as &[u8], b"other", b"value"]));
        stream.extend_from_slice(&second[..second.len() - 4]);
        std::fs::write(&aof_path, &stream).unwrap();

        let mut cfg = Config::default();
        cfg.aof_enabled = true;
        cfg.aof_file = aof_path.to_str().unwrap().to_string();
        let mut d = test_dispatcher(cfg);
        assert_eq!(d.replay_aof().await.unwrap(), 1);
        assert_eq!(d.dbs.get(0).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn aof_replay_rejects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let aof_path = dir.path().join("test.aof");
        std::fs::write(&aof_path, b"*1\r\n#oops\r\n*1\r\n$4\r\nping\r\n").unwrap();
        let mut cfg = Config::default();
        cfg.aof_enabled = true;
        cfg.aof_file = aof_path.to_str().unwrap().to_string();
        let mut d = test_dispatcher(cfg);
        assert!(d.replay_aof().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replica_guard_rejects_client_writes() {
        let mut d = test_dispatcher(Config::default());
        d.master_addr = Some(("10.0.0.1".to_string(), 6379));
        match run(&mut d, &[b"set" as &[u8], b"k", b"v"]).await {
            Outcome::Reply(Reply::Error(e)) => assert!(e.starts_with("READONLY")),
            other => panic!("unexpected {:?}", other),
        }
        // reads and stream-sourced writes still pass
        match run(&mut d, &[b"get" as &[u8], b"k"]).await {
            Outcome::Reply(Reply::Nil) => {}
            other => panic!("unexpected {:?}", other),
        }
        let (outcome, _) = d
            .execute(args(&[b"set" as &[u8], b"k", b"v"]), 0, Source::Master)
            .await;
        match outcome {
            Outcome::Reply(r) => assert_eq!(r, Reply::ok()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn psync_full_then_partial() {
        let mut d = test_dispatcher(Config::default());
        run(&mut d, &[b"set" as &[u8], b"k", b"v"]).await;

        let full = d
            .execute(args(&[b"psync" as &[u8], b"?", b"-1"]), 0, Source::Client)
            .await
            .0;
        let (run_id, offset) = match full {
            Outcome::Psync(PsyncOutcome::Full { run_id, offset, dump, .. }) => {
                assert!(!dump.is_empty());
                (run_id, offset)
            }
            other => panic!("unexpected {:?}", other),
        };

        run(&mut d, &[b"set" as &[u8], b"k2", b"v2"]).await;

        let partial = d
            .execute(
                args(&[
                    b"psync" as &[u8],
                    run_id.as_bytes(),
                    offset.to_string().as_bytes(),
                ]),
                0,
                Source::Client,
            )
            .await
            .0;
        match partial {
            Outcome::Psync(PsyncOutcome::Partial { tail, .. }) => {
                assert!(!tail.is_empty());
                let text = String::from_utf8_lossy(&tail).to_string();
                assert!(text.contains("k2"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn max_memory_evicts_volatile_keys() {
        let mut cfg = Config::default();
        cfg.max_memory = 4 * 1024;
        let mut d = test_dispatcher(cfg);
        let filler = vec![b'x'; 512];
        for i in 0..32u32 {
            let key = format!("k{}", i).into_bytes();
            d.dbs.get_mut(0).set_value(
                key.clone(),
                crate::obj::Value::Str(crate::dynstr::DynStr::from_bytes(&filler)),
            );
            d.dbs.get_mut(0).set_expire(&key, u64::MAX - i as u64);
        }
        assert!(d.dbs.used_memory() > 4 * 1024);
        d.ensure_memory();
        assert!(d.dbs.used_memory() <= 4 * 1024);
        assert!(d.dbs.get(0).len() < 32);
    }
}
