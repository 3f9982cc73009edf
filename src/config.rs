use std::fs;

use crate::error::ServerError;
use crate::util::yes_no_to_bool;

/// AOF fsync policy.
///
/// ALWAYS fsyncs every batch and holds the client reply until the data
/// is on disk. SMART fsyncs after every non-empty batch but acknowledges
/// on enqueue. NO leaves flushing to the OS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AofSyncPolicy {
    Always,
    Smart,
    No,
}

/// Log verbosity, mapped onto tracing levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
}

impl LogLevel {
    pub fn tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::TRACE,
            LogLevel::Verbose => tracing::Level::DEBUG,
            LogLevel::Notice => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
        }
    }
}

/// A `save <seconds> <changes>` trigger: bgsave when at least `changes`
/// writes accumulated and `seconds` elapsed since the last save.
#[derive(Clone, Copy, Debug)]
pub struct SavePoint {
    pub seconds: u64,
    pub changes: u64,
}

/// Raft deployment description. Peers must list every member of the
/// cluster including this node; the node's own entry provides its listen
/// address.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    pub node_id: u32,
    pub peers: Vec<(u32, String)>,
    pub dir: String,
    pub heartbeat_ms: u64,
    pub election_min_ms: u64,
    pub election_max_ms: u64,
}

impl RaftConfig {
    pub fn self_addr(&self) -> Option<&str> {
        self.peers
            .iter()
            .find(|(id, _)| *id == self.node_id)
            .map(|(_, addr)| addr.as_str())
    }

    pub fn others(&self) -> impl Iterator<Item = &(u32, String)> {
        self.peers.iter().filter(move |(id, _)| *id != self.node_id)
    }

    /// Cluster size, for majority math.
    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }
}

/// Validated server configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_count: usize,
    pub aof_enabled: bool,
    pub aof_file: String,
    pub aof_sync_policy: AofSyncPolicy,
    pub rdb_enabled: bool,
    pub rdb_file: String,
    pub rdb_compression: bool,
    pub max_memory: u64,
    pub replication_enabled: bool,
    pub replication_buffer_size: usize,
    pub save_points: Vec<SavePoint>,
    pub master: Option<(String, u16)>,
    pub loglevel: LogLevel,
    pub logfile: String,
    pub daemonize: bool,
    pub pidfile: String,
    pub dir: Option<String>,
    pub raft: Option<RaftConfig>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database_count: 16,
            aof_enabled: false,
            aof_file: "appendonly.aof".to_string(),
            aof_sync_policy: AofSyncPolicy::Smart,
            rdb_enabled: true,
            rdb_file: "dump.rdb".to_string(),
            rdb_compression: true,
            max_memory: 0,
            replication_enabled: true,
            replication_buffer_size: 1024 * 1024,
            save_points: vec![
                SavePoint { seconds: 3600, changes: 1 },
                SavePoint { seconds: 300, changes: 100 },
                SavePoint { seconds: 60, changes: 10000 },
            ],
            master: None,
            loglevel: LogLevel::Notice,
            logfile: String::new(),
            daemonize: false,
            pidfile: "/var/run/raftis.pid".to_string(),
            dir: None,
            raft: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Config, ServerError> {
        let text = fs::read_to_string(path)?;
        Config::parse(&text)
    }

    /// Parse a directive-per-line configuration. The first `save`
    /// directive clears the built-in defaults; an explicit list
    /// replaces them entirely.
    pub fn parse(text: &str) -> Result<Config, ServerError> {
        let mut cfg = Config::default();
        let mut saw_save = false;
        let mut raft_enabled = false;
        let mut raft_node_id: Option<u32> = None;
        let mut raft_peers: Vec<(u32, String)> = Vec::new();
        let mut raft_dir = ".".to_string();
        let mut raft_heartbeat_ms = 500u64;
        let mut raft_election_min_ms = 3000u64;
        let mut raft_election_max_ms = 6000u64;

        let err = |line_num: usize, msg: &str| ServerError::Config {
            line: line_num,
            msg: msg.to_string(),
        };

        for (idx, raw) in text.lines().enumerate() {
            let line_num = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let argv: Vec<&str> = line.split_whitespace().collect();
            let argc = argv.len();
            match &argv[0].to_ascii_lowercase()[..] {
                "host" if argc == 2 => cfg.host = argv[1].to_string(),
                "port" if argc == 2 => {
                    cfg.port = argv[1]
                        .parse()
                        .map_err(|_| err(line_num, "invalid port"))?;
                }
                "database-count" if argc == 2 => {
                    cfg.database_count = argv[1]
                        .parse()
                        .map_err(|_| err(line_num, "invalid number of databases"))?;
                    if cfg.database_count < 1 {
                        return Err(err(line_num, "invalid number of databases"));
                    }
                }
                "aof-enabled" if argc == 2 => {
                    cfg.aof_enabled =
                        yes_no_to_bool(argv[1]).map_err(|e| err(line_num, &e))?;
                }
                "aof-file" if argc == 2 => cfg.aof_file = argv[1].to_string(),
                "aof-sync-policy" if argc == 2 => {
                    cfg.aof_sync_policy = match &argv[1].to_ascii_lowercase()[..] {
                        "always" => AofSyncPolicy::Always,
                        "smart" => AofSyncPolicy::Smart,
                        "no" => AofSyncPolicy::No,
                        _ => {
                            return Err(err(
                                line_num,
                                "argument must be 'always', 'smart' or 'no'",
                            ))
                        }
                    };
                }
                "rdb-enabled" if argc == 2 => {
                    cfg.rdb_enabled =
                        yes_no_to_bool(argv[1]).map_err(|e| err(line_num, &e))?;
                }
                "rdb-file" if argc == 2 => cfg.rdb_file = argv[1].to_string(),
                "rdb-compression" if argc == 2 => {
                    cfg.rdb_compression =
                        yes_no_to_bool(argv[1]).map_err(|e| err(line_num, &e))?;
                }
                "max-memory" if argc == 2 => {
                    cfg.max_memory = argv[1]
                        .parse()
                        .map_err(|_| err(line_num, "invalid max-memory"))?;
                }
                "replication-enabled" if argc == 2 => {
                    cfg.replication_enabled =
                        yes_no_to_bool(argv[1]).map_err(|e| err(line_num, &e))?;
                }
                "replication-buffer-size" if argc == 2 => {
                    cfg.replication_buffer_size = argv[1]
                        .parse()
                        .map_err(|_| err(line_num, "invalid replication-buffer-size"))?;
                    if cfg.replication_buffer_size < 1024 {
                        return Err(err(line_num, "replication buffer too small"));
                    }
                }
                "save" if argc == 3 => {
                    if !saw_save {
                        cfg.save_points.clear();
                        saw_save = true;
                    }
                    let seconds: u64 = argv[1]
                        .parse()
                        .map_err(|_| err(line_num, "invalid save parameters"))?;
                    let changes: u64 = argv[2]
                        .parse()
                        .map_err(|_| err(line_num, "invalid save parameters"))?;
                    if seconds < 1 {
                        return Err(err(line_num, "invalid save parameters"));
                    }
                    cfg.save_points.push(SavePoint { seconds, changes });
                }
                "slaveof" if argc == 3 => {
                    let port = argv[2]
                        .parse()
                        .map_err(|_| err(line_num, "invalid master port"))?;
                    cfg.master = Some((argv[1].to_string(), port));
                }
                "loglevel" if argc == 2 => {
                    cfg.loglevel = match &argv[1].to_ascii_lowercase()[..] {
                        "debug" => LogLevel::Debug,
                        "verbose" => LogLevel::Verbose,
                        "notice" => LogLevel::Notice,
                        "warning" => LogLevel::Warning,
                        _ => {
                            return Err(err(
                                line_num,
                                "Invalid log level. Must be one of debug, verbose, notice or warning",
                            ))
                        }
                    };
                }
                "logfile" if argc == 2 => {
                    cfg.logfile = match &argv[1].to_ascii_lowercase()[..] {
                        "stdout" => String::new(),
                        _ => argv[1].to_string(),
                    };
                }
                "daemonize" if argc == 2 => {
                    cfg.daemonize =
                        yes_no_to_bool(argv[1]).map_err(|e| err(line_num, &e))?;
                }
                "pidfile" if argc == 2 => cfg.pidfile = argv[1].to_string(),
                "dir" if argc == 2 => cfg.dir = Some(argv[1].to_string()),
                "raft-enabled" if argc == 2 => {
                    raft_enabled =
                        yes_no_to_bool(argv[1]).map_err(|e| err(line_num, &e))?;
                }
                "raft-node-id" if argc == 2 => {
                    raft_node_id = Some(
                        argv[1]
                            .parse()
                            .map_err(|_| err(line_num, "invalid raft-node-id"))?,
                    );
                }
                "raft-peer" if argc == 2 => {
                    let (id, addr) = argv[1]
                        .split_once('@')
                        .ok_or_else(|| err(line_num, "raft-peer must be <id>@<host:port>"))?;
                    let id: u32 = id
                        .parse()
                        .map_err(|_| err(line_num, "invalid raft peer id"))?;
                    raft_peers.push((id, addr.to_string()));
                }
                "raft-dir" if argc == 2 => raft_dir = argv[1].to_string(),
                "raft-heartbeat-ms" if argc == 2 => {
                    raft_heartbeat_ms = argv[1]
                        .parse()
                        .map_err(|_| err(line_num, "invalid raft-heartbeat-ms"))?;
                }
                "raft-election-min-ms" if argc == 2 => {
                    raft_election_min_ms = argv[1]
                        .parse()
                        .map_err(|_| err(line_num, "invalid raft-election-min-ms"))?;
                }
                "raft-election-max-ms" if argc == 2 => {
                    raft_election_max_ms = argv[1]
                        .parse()
                        .map_err(|_| err(line_num, "invalid raft-election-max-ms"))?;
                }
                _ => {
                    return Err(err(
                        line_num,
                        "Bad directive or wrong number of arguments",
                    ))
                }
            }
        }

        if raft_enabled {
            let node_id = raft_node_id.ok_or(ServerError::Config {
                line: 0,
                msg: "raft-enabled requires raft-node-id".to_string(),
            })?;
            if !raft_peers.iter().any(|(id, _)| *id == node_id) {
                return Err(ServerError::Config {
                    line: 0,
                    msg: "raft-peer list must include this node".to_string(),
                });
            }
            if raft_election_min_ms >= raft_election_max_ms {
                return Err(ServerError::Config {
                    line: 0,
                    msg: "raft-election-min-ms must be below raft-election-max-ms".to_string(),
                });
            }
            // Consensus mode owns both write propagation and durability:
            // the replicated log is the command log, so the
            // primary/replica stream and the standalone persistence
            // files are mutually exclusive with it.
            cfg.replication_enabled = false;
            cfg.master = None;
            cfg.aof_enabled = false;
            cfg.rdb_enabled = false;
            cfg.raft = Some(RaftConfig {
                node_id,
                peers: raft_peers,
                dir: raft_dir,
                heartbeat_ms: raft_heartbeat_ms,
                election_min_ms: raft_election_min_ms,
                election_max_ms: raft_election_max_ms,
            });
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 6379);
        assert_eq!(cfg.database_count, 16);
        assert_eq!(cfg.aof_sync_policy, AofSyncPolicy::Smart);
        assert_eq!(cfg.save_points.len(), 3);
    }

    #[test]
    fn parses_directives() {
        let cfg = Config::parse(
            "# comment\n\
             port 7000\n\
             database-count 4\n\
             aof-enabled yes\n\
             aof-sync-policy always\n\
             save 60 100\n\
             slaveof 10.0.0.1 6379\n",
        )
        .unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.database_count, 4);
        assert!(cfg.aof_enabled);
        assert_eq!(cfg.aof_sync_policy, AofSyncPolicy::Always);
        assert_eq!(cfg.save_points.len(), 1);
        assert_eq!(cfg.master, Some(("10.0.0.1".to_string(), 6379)));
    }

    #[test]
    fn rejects_unknown_directive() {
        assert!(Config::parse("bogus yes\n").is_err());
        assert!(Config::parse("port\n").is_err());
    }

    #[test]
    fn raft_config_requires_self_peer() {
        let text = "raft-enabled yes\n\
                    raft-node-id 1\n\
                    raft-peer 2@127.0.0.1:7002\n";
        assert!(Config::parse(text).is_err());

        let text = "raft-enabled yes\n\
                    raft-node-id 1\n\
                    raft-peer 1@127.0.0.1:7001\n\
                    raft-peer 2@127.0.0.1:7002\n";
        let cfg = Config::parse(text).unwrap();
        let raft = cfg.raft.unwrap();
        assert_eq!(raft.self_addr(), Some("127.0.0.1:7001"));
        assert_eq!(raft.others().count(), 1);
        assert!(!cfg.replication_enabled);
    }
}
