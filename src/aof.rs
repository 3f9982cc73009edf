use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::AofSyncPolicy;
use crate::db::Databases;
use crate::error::ServerError;
use crate::resp::encode_command;
use crate::util::format_f64;

/// A batch closes when it reaches this many commands...
const BATCH_MAX_COMMANDS: usize = 50;
/// ...or this many bytes, or the queue drains.
const BATCH_MAX_BYTES: usize = 512 * 1024;
/// Commands at least this big skip batching entirely.
const LARGE_COMMAND: usize = 512 * 1024;
/// Bounded queue between the dispatcher and the writer; a full queue
/// backpressures the dispatcher instead of dropping commands.
const QUEUE_CAPACITY: usize = 1024;

/// Elements per constructor command emitted by the rewriter.
const REWRITE_ITEMS_PER_CMD: usize = 64;

pub enum AofJob {
    Append {
        bytes: Bytes,
        /// Present under the ALWAYS policy: fires true once the bytes
        /// are on disk, false if the write failed.
        ack: Option<oneshot::Sender<bool>>,
    },
    Flush {
        resp: oneshot::Sender<io::Result<()>>,
    },
    /// Rewrite finalization: drain the side buffer into the temporary
    /// file, fsync, swap it over the live log, reopen.
    FinishRewrite {
        tmp: PathBuf,
        side: mpsc::UnboundedReceiver<Bytes>,
        done: oneshot::Sender<bool>,
    },
}

#[derive(Clone)]
pub struct AofHandle {
    tx: mpsc::Sender<AofJob>,
}

impl AofHandle {
    /// Enqueue a command's bytes. Blocks (asynchronously) when the
    /// queue is full, which is the backpressure contract.
    pub async fn append(&self, bytes: Bytes, ack: Option<oneshot::Sender<bool>>) {
        if self.tx.send(AofJob::Append { bytes, ack }).await.is_err() {
            warn!("aof writer is gone; dropping append");
        }
    }

    /// Flush with a deadline. Timing out is reported, never silent.
    pub async fn flush(&self, deadline: Duration) -> Result<(), ServerError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(AofJob::Flush { resp: tx })
            .await
            .map_err(|_| ServerError::Persistence("aof writer is gone".to_string()))?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(ServerError::Persistence("aof writer is gone".to_string())),
            Err(_) => Err(ServerError::Persistence("aof flush timed out".to_string())),
        }
    }

    pub async fn finish_rewrite(
        &self,
        tmp: PathBuf,
        side: mpsc::UnboundedReceiver<Bytes>,
        done: oneshot::Sender<bool>,
    ) {
        let _ = self.tx.send(AofJob::FinishRewrite { tmp, side, done }).await;
    }
}

struct Writer {
    file: File,
    path: String,
    policy: AofSyncPolicy,
    rx: mpsc::Receiver<AofJob>,
}

/// Open the append-only file and start the writer task.
pub async fn start(path: &str, policy: AofSyncPolicy) -> io::Result<AofHandle> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let writer = Writer {
        file,
        path: path.to_string(),
        policy,
        rx,
    };
    tokio::spawn(writer.run());
    Ok(AofHandle { tx })
}

impl Writer {
    async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            let mut next = Some(job);
            while let Some(j) = next.take() {
                next = self.handle(j).await;
            }
        }
    }

    async fn handle(&mut self, job: AofJob) -> Option<AofJob> {
        match job {
            AofJob::Append { bytes, ack } => self.handle_append(bytes, ack).await,
            AofJob::Flush { resp } => {
                let result = self.file.sync_data().await;
                let _ = resp.send(result);
                None
            }
            AofJob::FinishRewrite { tmp, side, done } => {
                let ok = self.swap_in_rewrite(&tmp, side).await;
                if !ok {
                    let _ = tokio::fs::remove_file(&tmp).await;
                }
                let _ = done.send(ok);
                None
            }
        }
    }

    /// Collect a batch, write it in one call, apply the sync policy,
    /// then release any durability acks. A control job pulled while
    /// draining is returned to the caller.
    async fn handle_append(
        &mut self,
        bytes: Bytes,
        ack: Option<oneshot::Sender<bool>>,
    ) -> Option<AofJob> {
        let large = bytes.len() >= LARGE_COMMAND;
        let mut total = bytes.len();
        let mut batch = vec![(bytes, ack)];
        let mut pending = None;

        if !large {
            while batch.len() < BATCH_MAX_COMMANDS && total < BATCH_MAX_BYTES {
                match self.rx.try_recv() {
                    Ok(AofJob::Append { bytes, ack }) => {
                        if bytes.len() >= LARGE_COMMAND {
                            pending = Some(AofJob::Append { bytes, ack });
                            break;
                        }
                        total += bytes.len();
                        batch.push((bytes, ack));
                    }
                    Ok(other) => {
                        pending = Some(other);
                        break;
                    }
                    Err(_) => break,
                }
            }
        }

        let mut buf = Vec::with_capacity(total);
        for (bytes, _) in &batch {
            buf.extend_from_slice(bytes);
        }
        let mut ok = self.file.write_all(&buf).await.is_ok();
        if ok {
            // SMART coalesces by batching: one fsync covers the whole
            // batch, and a large command forms its own batch.
            let need_sync = !matches!(self.policy, AofSyncPolicy::No);
            if need_sync {
                ok = self.file.sync_data().await.is_ok();
            }
        }
        if !ok {
            warn!("aof write failed; durability acks report failure");
        }
        for (_, ack) in batch {
            if let Some(ack) = ack {
                let _ = ack.send(ok);
            }
        }
        pending
    }

    async fn swap_in_rewrite(
        &mut self,
        tmp: &Path,
        mut side: mpsc::UnboundedReceiver<Bytes>,
    ) -> bool {
        let mut tmp_file = match OpenOptions::new().append(true).open(tmp).await {
            Ok(f) => f,
            Err(e) => {
                warn!("rewrite swap: cannot open {:?}: {}", tmp, e);
                return false;
            }
        };
        // the side buffer's sender was dropped before this job was
        // enqueued, so try_recv drains everything that was mirrored
        while let Ok(chunk) = side.try_recv() {
            if tmp_file.write_all(&chunk).await.is_err() {
                return false;
            }
        }
        if tmp_file.sync_all().await.is_err() {
            return false;
        }
        drop(tmp_file);

        let backup = format!("{}.bak", self.path);
        let had_original = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        if had_original {
            if let Err(e) = tokio::fs::rename(&self.path, &backup).await {
                warn!("rewrite swap: backup rename failed: {}", e);
                return false;
            }
        }
        if let Err(e) = tokio::fs::rename(tmp, &self.path).await {
            warn!("rewrite swap: rename failed: {}", e);
            if had_original {
                let _ = tokio::fs::rename(&backup, &self.path).await;
            }
            return false;
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            Ok(f) => {
                self.file = f;
                info!("append only file rewritten");
                true
            }
            Err(e) => {
                warn!("rewrite swap: reopen failed: {}", e);
                false
            }
        }
    }
}

fn emit(out: &mut Vec<u8>, argv: &[Vec<u8>]) {
    out.extend_from_slice(&encode_command(argv));
}

/// The minimal command sequence whose replay reconstructs the snapshot:
/// one constructor per key (chunked for big aggregates) plus PEXPIREAT
/// for volatile keys.
pub fn rewrite_commands(dbs: &Databases) -> Vec<u8> {
    use crate::obj::Value;

    let mut out = Vec::with_capacity(64 * 1024);
    for (index, db) in dbs.iter() {
        if db.is_empty() {
            continue;
        }
        emit(
            &mut out,
            &[b"select".to_vec(), index.to_string().into_bytes()],
        );
        for (key, value) in &db.dict {
            match value {
                Value::Str(s) => emit(
                    &mut out,
                    &[b"set".to_vec(), key.clone(), s.bytes().to_vec()],
                ),
                Value::List(list) => {
                    let items: Vec<Vec<u8>> = list.iter().cloned().collect();
                    for chunk in items.chunks(REWRITE_ITEMS_PER_CMD) {
                        let mut argv = vec![b"rpush".to_vec(), key.clone()];
                        argv.extend_from_slice(chunk);
                        emit(&mut out, &argv);
                    }
                }
                Value::Set(set) => {
                    let members: Vec<Vec<u8>> = set.iter().cloned().collect();
                    for chunk in members.chunks(REWRITE_ITEMS_PER_CMD) {
                        let mut argv = vec![b"sadd".to_vec(), key.clone()];
                        argv.extend_from_slice(chunk);
                        emit(&mut out, &argv);
                    }
                }
                Value::Hash(hash) => {
                    let pairs: Vec<(&Vec<u8>, &Vec<u8>)> = hash.iter().collect();
                    for chunk in pairs.chunks(REWRITE_ITEMS_PER_CMD / 2) {
                        let mut argv = vec![b"hset".to_vec(), key.clone()];
                        for (field, value) in chunk {
                            argv.push((*field).clone());
                            argv.push((*value).clone());
                        }
                        emit(&mut out, &argv);
                    }
                }
                Value::ZSet(zset) => {
                    let pairs: Vec<(Vec<u8>, f64)> =
                        zset.iter().map(|(m, s)| (m.to_vec(), s)).collect();
                    for chunk in pairs.chunks(REWRITE_ITEMS_PER_CMD / 2) {
                        let mut argv = vec![b"zadd".to_vec(), key.clone()];
                        for (member, score) in chunk {
                            argv.push(format_f64(*score).into_bytes());
                            argv.push(member.clone());
                        }
                        emit(&mut out, &argv);
                    }
                }
            }
            if let Some(&at) = db.expires.get(key) {
                emit(
                    &mut out,
                    &[
                        b"pexpireat".to_vec(),
                        key.clone(),
                        at.to_string().into_bytes(),
                    ],
                );
            }
        }
    }
    out
}

/// Serialize the snapshot on a blocking worker and report the written
/// temporary file (or the failure) through `done`.
pub fn spawn_rewrite(
    snapshot: Databases,
    tmp: PathBuf,
    done: oneshot::Sender<Result<PathBuf, String>>,
) {
    tokio::spawn(async move {
        let tmp_for_task = tmp.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<PathBuf, String> {
            let bytes = rewrite_commands(&snapshot);
            let mut file =
                std::fs::File::create(&tmp_for_task).map_err(|e| e.to_string())?;
            std::io::Write::write_all(&mut file, &bytes).map_err(|e| e.to_string())?;
            file.sync_all().map_err(|e| e.to_string())?;
            Ok(tmp_for_task)
        })
        .await
        .unwrap_or_else(|e| Err(format!("rewrite task panicked: {}", e)));
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        let _ = done.send(result);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::parse_command;
    use bytes::BytesMut;

    #[tokio::test]
    async fn writes_commands_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.aof");
        let path = path.to_str().unwrap();
        let handle = start(path, AofSyncPolicy::Smart).await.unwrap();

        let mut expected = Vec::new();
        for i in 0..200 {
            let argv = vec![
                b"set".to_vec(),
                format!("k{}", i).into_bytes(),
                format!("v{}", i).into_bytes(),
            ];
            let bytes = encode_command(&argv);
            expected.extend_from_slice(&bytes);
            handle.append(Bytes::from(bytes), None).await;
        }
        handle.flush(Duration::from_secs(5)).await.unwrap();
        let written = std::fs::read(path).unwrap();
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn always_policy_acks_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.aof");
        let handle = start(path.to_str().unwrap(), AofSyncPolicy::Always)
            .await
            .unwrap();
        let (tx, rx) = oneshot::channel();
        handle
            .append(Bytes::from_static(b"*1\r\n$4\r\nping\r\n"), Some(tx))
            .await;
        assert!(rx.await.unwrap());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn large_command_is_written_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.aof");
        let path = path.to_str().unwrap();
        let handle = start(path, AofSyncPolicy::Smart).await.unwrap();
        let big = vec![b'x'; LARGE_COMMAND + 1024];
        let argv = vec![b"set".to_vec(), b"big".to_vec(), big];
        let bytes = encode_command(&argv);
        handle.append(Bytes::from(bytes.clone()), None).await;
        handle.flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), bytes);
    }

    #[test]
    fn rewrite_commands_reconstruct_state() {
        use crate::dynstr::DynStr;
        use crate::obj::{SortedSet, Value};
        use std::collections::{HashMap, HashSet, VecDeque};

        let mut dbs = Databases::new(2);
        let db = dbs.get_mut(0);
        db.set_value(b"s".to_vec(), Value::Str(DynStr::from_bytes(b"v")));
        db.set_value(
            b"l".to_vec(),
            Value::List(VecDeque::from(vec![b"a".to_vec(), b"b".to_vec()])),
        );
        let mut set = HashSet::new();
        set.insert(b"m".to_vec());
        db.set_value(b"st".to_vec(), Value::Set(set));
        let mut hash = HashMap::new();
        hash.insert(b"f".to_vec(), b"v".to_vec());
        db.set_value(b"h".to_vec(), Value::Hash(hash));
        let mut zset = SortedSet::new();
        zset.insert(b"m".to_vec(), 1.5);
        db.set_value(b"z".to_vec(), Value::ZSet(zset));
        db.set_expire(b"s", 99_999);
        dbs.get_mut(1)
            .set_value(b"other".to_vec(), Value::Str(DynStr::from_bytes(b"1")));

        let stream = rewrite_commands(&dbs);
        let mut buf = BytesMut::from(&stream[..]);
        let mut names = Vec::new();
        while let Some(argv) = parse_command(&mut buf).unwrap() {
            if argv.is_empty() {
                break;
            }
            names.push(String::from_utf8(argv[0].clone()).unwrap());
        }
        assert!(buf.is_empty());
        // both databases announced, every kind constructed, expiry armed
        assert_eq!(names.iter().filter(|n| *n == "select").count(), 2);
        for expected in ["set", "rpush", "sadd", "hset", "zadd", "pexpireat"] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing {}",
                expected
            );
        }
    }
}
