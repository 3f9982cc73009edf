#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use raftis::config::Config;
use raftis::server::{self, ServerHandle};

/// A server running on its own runtime thread pool, driven from
/// blocking test code through plain TCP.
pub struct TestServer {
    pub addr: SocketAddr,
    runtime: tokio::runtime::Runtime,
    handle: Option<ServerHandle>,
}

impl TestServer {
    pub fn start(cfg: Config) -> TestServer {
        Self::try_start(cfg).expect("server failed to start")
    }

    pub fn try_start(mut cfg: Config) -> Result<TestServer, raftis::error::ServerError> {
        cfg.port = 0;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let handle = runtime.block_on(server::start(cfg))?;
        Ok(TestServer {
            addr: handle.addr,
            runtime,
            handle: Some(handle),
        })
    }

    pub fn connect(&self) -> Client {
        Client::connect(self.addr)
    }

    /// Graceful SHUTDOWN through the dispatcher.
    pub fn stop(&mut self, save: bool) {
        if let Some(handle) = self.handle.take() {
            self.runtime.block_on(handle.stop(save));
        }
    }

    /// Hard kill: drop the runtime, abandoning every task. Used to
    /// model a crashed node.
    pub fn kill(self) {
        drop(self);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Value>),
    NilArray,
}

impl Value {
    pub fn as_bulk(&self) -> &[u8] {
        match self {
            Value::Bulk(data) => data,
            other => panic!("expected bulk, got {:?}", other),
        }
    }

    pub fn as_integer(&self) -> i64 {
        match self {
            Value::Integer(n) => *n,
            other => panic!("expected integer, got {:?}", other),
        }
    }

    pub fn as_error(&self) -> &str {
        match self {
            Value::Error(e) => e,
            other => panic!("expected error, got {:?}", other),
        }
    }

    pub fn as_array(&self) -> &[Value] {
        match self {
            Value::Array(items) => items,
            other => panic!("expected array, got {:?}", other),
        }
    }
}

pub struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Client {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true).unwrap();
                    let reader = BufReader::new(stream.try_clone().unwrap());
                    return Client { stream, reader };
                }
                Err(e) => {
                    if Instant::now() > deadline {
                        panic!("cannot connect to {}: {}", addr, e);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }

    pub fn command(&mut self, args: &[&[u8]]) -> Value {
        let mut out = Vec::new();
        out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&out).unwrap();
        self.read_value()
    }

    pub fn cmd(&mut self, args: &[&str]) -> Value {
        let raw: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
        self.command(&raw)
    }

    /// Write raw bytes on the socket, for inline-command tests.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        self.reader.read_until(b'\n', &mut line).unwrap();
        assert!(line.ends_with(b"\r\n"), "short read: {:?}", line);
        line.truncate(line.len() - 2);
        String::from_utf8_lossy(&line).to_string()
    }

    pub fn read_value(&mut self) -> Value {
        let line = self.read_line();
        let (kind, rest) = line.split_at(1);
        match kind {
            "+" => Value::Simple(rest.to_string()),
            "-" => Value::Error(rest.to_string()),
            ":" => Value::Integer(rest.parse().unwrap()),
            "$" => {
                let len: i64 = rest.parse().unwrap();
                if len < 0 {
                    return Value::Nil;
                }
                let mut data = vec![0u8; len as usize + 2];
                self.reader.read_exact(&mut data).unwrap();
                data.truncate(len as usize);
                Value::Bulk(data)
            }
            "*" => {
                let count: i64 = rest.parse().unwrap();
                if count < 0 {
                    return Value::NilArray;
                }
                Value::Array((0..count).map(|_| self.read_value()).collect())
            }
            other => panic!("unexpected reply type {:?} in {:?}", other, line),
        }
    }
}

/// Poll `probe` until it returns true or the deadline passes.
pub fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Pull `field:` out of an INFO reply.
pub fn info_field(client: &mut Client, field: &str) -> Option<String> {
    let info = client.cmd(&["info"]);
    let text = String::from_utf8_lossy(info.as_bulk()).to_string();
    text.lines()
        .find(|line| line.starts_with(&format!("{}:", field)))
        .map(|line| line[field.len() + 1..].trim().to_string())
}

/// Reserve a localhost port by binding and immediately releasing it.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
