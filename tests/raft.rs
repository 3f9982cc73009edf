mod common;

use std::time::Duration;

use common::{free_port, info_field, wait_until, Client, TestServer, Value};
use raftis::config::{Config, RaftConfig};

/// Cluster timing is compressed for CI: 100 ms heartbeats, 300-600 ms
/// election windows.
fn cluster_configs(dir: &tempfile::TempDir, n: usize) -> Vec<Config> {
    let ports: Vec<u16> = (0..n).map(|_| free_port()).collect();
    let peers: Vec<(u32, String)> = ports
        .iter()
        .enumerate()
        .map(|(i, port)| ((i + 1) as u32, format!("127.0.0.1:{}", port)))
        .collect();
    (1..=n)
        .map(|id| {
            let mut cfg = Config::default();
            cfg.rdb_enabled = false;
            cfg.replication_enabled = false;
            cfg.rdb_file = dir
                .path()
                .join(format!("node{}.rdb", id))
                .to_str()
                .unwrap()
                .to_string();
            cfg.aof_file = dir
                .path()
                .join(format!("node{}.aof", id))
                .to_str()
                .unwrap()
                .to_string();
            cfg.raft = Some(RaftConfig {
                node_id: id as u32,
                peers: peers.clone(),
                dir: dir.path().join(format!("raft{}", id)).to_str().unwrap().to_string(),
                heartbeat_ms: 100,
                election_min_ms: 300,
                election_max_ms: 600,
            });
            cfg
        })
        .collect()
}

fn raft_role(client: &mut Client) -> String {
    info_field(client, "raft_role").unwrap_or_else(|| "unknown".to_string())
}

fn raft_term(client: &mut Client) -> i64 {
    info_field(client, "raft_term")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}

fn find_leader(clients: &mut [Client]) -> Option<usize> {
    let leaders: Vec<usize> = (0..clients.len())
        .filter(|&i| raft_role(&mut clients[i]) == "leader")
        .collect();
    if leaders.len() == 1 {
        Some(leaders[0])
    } else {
        None
    }
}

#[test]
fn three_node_cluster_elects_exactly_one_leader() {
    let dir = tempfile::tempdir().unwrap();
    let configs = cluster_configs(&dir, 3);
    let mut servers: Vec<TestServer> = configs.into_iter().map(TestServer::start).collect();
    let mut clients: Vec<Client> = servers.iter().map(|s| s.connect()).collect();

    // two election windows is the budget the protocol promises
    assert!(wait_until(Duration::from_secs(5), || {
        find_leader(&mut clients).is_some()
    }));
    let leader = find_leader(&mut clients).unwrap();
    let term = raft_term(&mut clients[leader]);
    assert!(term >= 1);
    for client in clients.iter_mut() {
        assert!(raft_term(client) >= 1);
    }

    // writes commit through the leader and apply everywhere
    assert_eq!(
        clients[leader].cmd(&["SET", "k", "consensus"]),
        Value::Simple("OK".to_string())
    );
    assert_eq!(clients[leader].cmd(&["GET", "k"]).as_bulk(), b"consensus");
    let followers: Vec<usize> = (0..3).filter(|&i| i != leader).collect();
    for &i in &followers {
        let client = &mut clients[i];
        assert!(wait_until(Duration::from_secs(5), || {
            client.cmd(&["GET", "k"]) == Value::Bulk(b"consensus".to_vec())
        }));
    }

    // a follower refuses writes with a leader hint
    let error = clients[followers[0]].cmd(&["SET", "k", "x"]);
    assert!(error.as_error().starts_with("NOTLEADER"));

    for server in servers.iter_mut() {
        server.stop(false);
    }
}

#[test]
fn killing_the_leader_elects_a_higher_term_successor() {
    let dir = tempfile::tempdir().unwrap();
    let configs = cluster_configs(&dir, 3);
    let mut servers: Vec<Option<TestServer>> = configs
        .into_iter()
        .map(|cfg| Some(TestServer::start(cfg)))
        .collect();
    let mut clients: Vec<Client> = servers
        .iter()
        .map(|s| s.as_ref().unwrap().connect())
        .collect();

    assert!(wait_until(Duration::from_secs(5), || {
        find_leader(&mut clients).is_some()
    }));
    let old_leader = find_leader(&mut clients).unwrap();
    let old_term = raft_term(&mut clients[old_leader]);

    // seed a committed write so the successor has it
    clients[old_leader].cmd(&["SET", "survivor", "value"]);
    let survivors: Vec<usize> = (0..3).filter(|&i| i != old_leader).collect();
    for &i in &survivors {
        let client = &mut clients[i];
        assert!(wait_until(Duration::from_secs(5), || {
            client.cmd(&["GET", "survivor"]) == Value::Bulk(b"value".to_vec())
        }));
    }

    servers[old_leader].take().unwrap().kill();

    // the surviving majority elects a new leader with a greater term
    assert!(wait_until(Duration::from_secs(10), || {
        survivors.iter().any(|&i| raft_role(&mut clients[i]) == "leader")
    }));
    let new_leader = *survivors
        .iter()
        .find(|&&i| raft_role(&mut clients[i]) == "leader")
        .unwrap();
    assert!(raft_term(&mut clients[new_leader]) > old_term);

    // committed state survived the failover and writes flow again
    assert_eq!(
        clients[new_leader].cmd(&["GET", "survivor"]).as_bulk(),
        b"value"
    );
    assert_eq!(
        clients[new_leader].cmd(&["SET", "post", "failover"]),
        Value::Simple("OK".to_string())
    );

    for mut server in servers.into_iter().flatten() {
        server.stop(false);
    }
}

#[test]
fn single_node_cluster_leads_itself() {
    let dir = tempfile::tempdir().unwrap();
    let configs = cluster_configs(&dir, 1);
    let mut server = TestServer::start(configs.into_iter().next().unwrap());
    let mut client = server.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        raft_role(&mut client) == "leader"
    }));
    assert_eq!(
        client.cmd(&["SET", "solo", "v"]),
        Value::Simple("OK".to_string())
    );
    assert_eq!(client.cmd(&["GET", "solo"]).as_bulk(), b"v");
    assert!(
        info_field(&mut client, "raft_commit_index")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            >= 1
    );

    server.stop(false);
}

#[test]
fn reads_are_served_locally_on_followers() {
    let dir = tempfile::tempdir().unwrap();
    let configs = cluster_configs(&dir, 3);
    let mut servers: Vec<TestServer> = configs.into_iter().map(TestServer::start).collect();
    let mut clients: Vec<Client> = servers.iter().map(|s| s.connect()).collect();

    assert!(wait_until(Duration::from_secs(5), || {
        find_leader(&mut clients).is_some()
    }));
    let leader = find_leader(&mut clients).unwrap();
    clients[leader].cmd(&["SET", "doc", "local-reads"]);

    for i in 0..3 {
        let client = &mut clients[i];
        assert!(wait_until(Duration::from_secs(5), || {
            client.cmd(&["GET", "doc"]) == Value::Bulk(b"local-reads".to_vec())
        }));
    }

    for server in servers.iter_mut() {
        server.stop(false);
    }
}
