use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::aof;
use crate::config::Config;
use crate::dispatcher::{
    Dispatcher, Message, Outcome, PsyncOutcome, Request, ServerStats, Source,
};
use crate::error::ServerError;
use crate::raft;
use crate::resp::{parse_command, Reply};

const MAX_CONNECTIONS: usize = 1024;
const CONNECTION_BUF: usize = 16 * 1024;

/// A running server. Dropping it does not stop the tasks; use `stop`
/// for a graceful shutdown or let the process exit.
pub struct ServerHandle {
    pub addr: SocketAddr,
    /// Fires when a client-issued SHUTDOWN completed its final flush
    /// and save.
    pub shutdown_signal: Arc<Notify>,
    dispatch: mpsc::Sender<Message>,
}

impl ServerHandle {
    pub fn dispatch(&self) -> mpsc::Sender<Message> {
        self.dispatch.clone()
    }

    /// Graceful stop: route a SHUTDOWN through the dispatcher so the
    /// final AOF flush and snapshot happen exactly like the command.
    pub async fn stop(&self, save: bool) {
        let (tx, rx) = oneshot::channel();
        let arg: &[u8] = if save { b"save" } else { b"nosave" };
        let request = Request {
            argv: vec![b"shutdown".to_vec(), arg.to_vec()],
            db_index: 0,
            source: Source::Client,
            resp: Some(tx),
        };
        if self
            .dispatch
            .send(Message::Request(request))
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Wire everything together: AOF writer, Raft node, dispatcher,
/// listener. Returns once the server is accepting connections.
pub async fn start(cfg: Config) -> Result<ServerHandle, ServerError> {
    let cfg = Arc::new(cfg);
    let (dispatch_tx, dispatch_rx) = mpsc::channel(1024);
    let stats = Arc::new(ServerStats::default());
    let shutdown_signal = Arc::new(Notify::new());

    let aof_handle = if cfg.aof_enabled {
        Some(aof::start(&cfg.aof_file, cfg.aof_sync_policy).await?)
    } else {
        None
    };
    let raft_handle = match &cfg.raft {
        Some(raft_cfg) => Some(raft::start(raft_cfg, dispatch_tx.clone()).await?),
        None => None,
    };

    let mut dispatcher = Dispatcher::new(
        cfg.clone(),
        dispatch_rx,
        dispatch_tx.clone(),
        aof_handle,
        raft_handle,
        stats.clone(),
        shutdown_signal.clone(),
    );
    dispatcher.bootstrap().await?;

    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
    let addr = listener.local_addr()?;
    info!("the server is now ready to accept connections on {}", addr);

    tokio::spawn(dispatcher.run());
    tokio::spawn(accept_loop(listener, dispatch_tx.clone(), stats));

    Ok(ServerHandle {
        addr,
        shutdown_signal,
        dispatch: dispatch_tx,
    })
}

async fn accept_loop(
    listener: TcpListener,
    dispatch: mpsc::Sender<Message>,
    stats: Arc<ServerStats>,
) {
    let limit = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    loop {
        let permit = match limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        match listener.accept().await {
            Ok((socket, peer)) => {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.connected.fetch_add(1, Ordering::Relaxed);
                let dispatch = dispatch.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_connection(socket, dispatch).await {
                        debug!("client {}: {}", peer, e);
                    }
                    stats.connected.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                drop(permit);
            }
        }
    }
}

/// Per-connection loop: decode frames, dispatch, encode replies.
/// Commands never interleave within a connection; the next frame is
/// only taken after the previous reply was delivered.
async fn handle_connection(
    mut socket: TcpStream,
    dispatch: mpsc::Sender<Message>,
) -> Result<(), String> {
    let mut buf = BytesMut::with_capacity(CONNECTION_BUF);
    let mut db_index = 0usize;
    loop {
        loop {
            let argv = match parse_command(&mut buf) {
                Ok(Some(argv)) => argv,
                Ok(None) => break,
                Err(e) => {
                    let reply = Reply::Error(format!("ERR {}", e));
                    let _ = socket.write_all(&reply.to_bytes()).await;
                    return Err(e.to_string());
                }
            };
            if argv.is_empty() {
                continue;
            }
            if argv[0].eq_ignore_ascii_case(b"quit") {
                let _ = socket.write_all(b"+OK\r\n").await;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let request = Request {
                argv,
                db_index,
                source: Source::Client,
                resp: Some(tx),
            };
            dispatch
                .send(Message::Request(request))
                .await
                .map_err(|_| "dispatcher is gone".to_string())?;
            // a dropped reply means the client is only losing its
            // response; the command itself already ran
            let outcome = rx.await.map_err(|_| "reply dropped".to_string())?;
            match outcome {
                Outcome::Reply(reply) => {
                    socket
                        .write_all(&reply.to_bytes())
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Outcome::Select(index) => {
                    db_index = index;
                    socket
                        .write_all(b"+OK\r\n")
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Outcome::Psync(psync) => {
                    return serve_replica(socket, psync).await;
                }
                Outcome::ShuttingDown => {
                    return Ok(());
                }
            }
        }
        match socket.read_buf(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// After PSYNC the socket stops being a command connection and becomes
/// a one-way stream: handshake, dump or backlog tail, then the live
/// feed until either side dies.
async fn serve_replica(
    mut socket: TcpStream,
    psync: PsyncOutcome,
) -> Result<(), String> {
    let mut feed = match psync {
        PsyncOutcome::Full {
            run_id,
            offset,
            dump,
            feed,
        } => {
            let header = format!("+FULLRESYNC {} {}\r\n${}\r\n", run_id, offset, dump.len());
            socket
                .write_all(header.as_bytes())
                .await
                .map_err(|e| e.to_string())?;
            socket.write_all(&dump).await.map_err(|e| e.to_string())?;
            info!("synchronization with replica started ({} byte dump)", dump.len());
            feed
        }
        PsyncOutcome::Partial { tail, feed } => {
            socket
                .write_all(b"+CONTINUE\r\n")
                .await
                .map_err(|e| e.to_string())?;
            socket.write_all(&tail).await.map_err(|e| e.to_string())?;
            info!("partial resynchronization with replica started");
            feed
        }
    };
    while let Some(chunk) = feed.recv().await {
        socket.write_all(&chunk).await.map_err(|e| e.to_string())?;
    }
    Ok(())
}
