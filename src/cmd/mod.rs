use std::collections::HashMap;
use std::ops::BitOr;

use once_cell::sync::Lazy;

use crate::db::{Databases, Db};
use crate::error::CmdError;
use crate::resp::Reply;

mod generic;
mod hash;
mod list;
mod server;
mod set;
mod string;
mod zset;

/// Execution context handed to every command handler. The handler
/// mutates the keyspace through it and records how it wants the command
/// propagated to the AOF and to replicas.
pub struct ExecCtx<'a> {
    pub dbs: &'a mut Databases,
    pub db_index: usize,
    pub now_ms: u64,
    /// Number of keyspace changes this command performed. Zero means
    /// nothing is propagated.
    pub dirty: u64,
    /// Replacement argv for propagation, when the executed form is not
    /// deterministic (SPOP) or not absolute (EXPIRE).
    pub propagate: Option<Vec<Vec<u8>>>,
}

impl<'a> ExecCtx<'a> {
    pub fn db(&mut self) -> &mut Db {
        self.dbs.get_mut(self.db_index)
    }
}

pub type CommandProc = fn(&mut ExecCtx, &[Vec<u8>]) -> Result<Reply, CmdError>;

/// Commands the dispatcher executes itself because they touch server
/// state beyond the keyspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminCmd {
    Select,
    Info,
    Save,
    BgSave,
    BgRewriteAof,
    LastSave,
    Shutdown,
    SlaveOf,
    Psync,
}

pub enum CommandKind {
    Data(CommandProc),
    Admin(AdminCmd),
}

/// Command flags.
#[derive(Clone, Copy)]
pub struct CmdFlags(u8);

impl CmdFlags {
    /// Mutates the keyspace; subject to the replica read-only guard and
    /// routed through Raft in consensus mode.
    pub fn write() -> CmdFlags {
        CmdFlags(1)
    }
    pub fn readonly() -> CmdFlags {
        CmdFlags(2)
    }
    /// Denied when the server is over its soft memory limit.
    pub fn deny_oom() -> CmdFlags {
        CmdFlags(4)
    }
    pub fn is_write(&self) -> bool {
        (self.0 & Self::write().0) != 0
    }
    pub fn is_deny_oom(&self) -> bool {
        (self.0 & Self::deny_oom().0) != 0
    }
}

impl BitOr for CmdFlags {
    type Output = CmdFlags;
    fn bitor(self, rhs: CmdFlags) -> CmdFlags {
        CmdFlags(self.0 | rhs.0)
    }
}

pub struct Command {
    pub name: &'static str,
    pub kind: CommandKind,
    /// Expected argc including the command name; negative means "at
    /// least that many".
    pub arity: i32,
    pub flags: CmdFlags,
}

impl Command {
    pub fn arity_ok(&self, argc: usize) -> bool {
        if self.arity >= 0 {
            argc == self.arity as usize
        } else {
            argc >= (-self.arity) as usize
        }
    }
}

macro_rules! data {
    ($name:expr, $proc:path, $arity:expr, $flags:expr) => {
        (
            $name,
            Command {
                name: $name,
                kind: CommandKind::Data($proc),
                arity: $arity,
                flags: $flags,
            },
        )
    };
}

macro_rules! admin {
    ($name:expr, $which:expr, $arity:expr, $flags:expr) => {
        (
            $name,
            Command {
                name: $name,
                kind: CommandKind::Admin($which),
                arity: $arity,
                flags: $flags,
            },
        )
    };
}

/// Command table. Routing is by lowercased name.
static CMD_TABLE: Lazy<HashMap<&'static str, Command>> = Lazy::new(|| {
    use CmdFlags as F;
    HashMap::from([
        // connection
        data!("ping", server::ping_command, -1, F::readonly()),
        data!("echo", server::echo_command, 2, F::readonly()),
        // strings
        data!("set", string::set_command, 3, F::write() | F::deny_oom()),
        data!("setnx", string::setnx_command, 3, F::write() | F::deny_oom()),
        data!("get", string::get_command, 2, F::readonly()),
        data!("getset", string::getset_command, 3, F::write() | F::deny_oom()),
        data!("mget", string::mget_command, -2, F::readonly()),
        data!("mset", string::mset_command, -3, F::write() | F::deny_oom()),
        data!("msetnx", string::msetnx_command, -3, F::write() | F::deny_oom()),
        data!("append", string::append_command, 3, F::write() | F::deny_oom()),
        data!("strlen", string::strlen_command, 2, F::readonly()),
        data!("getrange", string::getrange_command, 4, F::readonly()),
        data!("incr", string::incr_command, 2, F::write() | F::deny_oom()),
        data!("decr", string::decr_command, 2, F::write() | F::deny_oom()),
        data!("incrby", string::incrby_command, 3, F::write() | F::deny_oom()),
        data!("decrby", string::decrby_command, 3, F::write() | F::deny_oom()),
        // keyspace
        data!("del", generic::del_command, -2, F::write()),
        data!("exists", generic::exists_command, -2, F::readonly()),
        data!("type", generic::type_command, 2, F::readonly()),
        data!("keys", generic::keys_command, 2, F::readonly()),
        data!("scan", generic::scan_command, -2, F::readonly()),
        data!("dbsize", generic::dbsize_command, 1, F::readonly()),
        data!("randomkey", generic::randomkey_command, 1, F::readonly()),
        data!("flushdb", generic::flushdb_command, 1, F::write()),
        data!("flushall", generic::flushall_command, 1, F::write()),
        data!("expire", generic::expire_command, 3, F::write()),
        data!("pexpire", generic::pexpire_command, 3, F::write()),
        data!("expireat", generic::expireat_command, 3, F::write()),
        data!("pexpireat", generic::pexpireat_command, 3, F::write()),
        data!("ttl", generic::ttl_command, 2, F::readonly()),
        data!("pttl", generic::pttl_command, 2, F::readonly()),
        data!("persist", generic::persist_command, 2, F::write()),
        // lists
        data!("lpush", list::lpush_command, -3, F::write() | F::deny_oom()),
        data!("rpush", list::rpush_command, -3, F::write() | F::deny_oom()),
        data!("lpop", list::lpop_command, 2, F::write()),
        data!("rpop", list::rpop_command, 2, F::write()),
        data!("llen", list::llen_command, 2, F::readonly()),
        data!("lrange", list::lrange_command, 4, F::readonly()),
        data!("lindex", list::lindex_command, 3, F::readonly()),
        data!("lset", list::lset_command, 4, F::write() | F::deny_oom()),
        data!("lrem", list::lrem_command, 4, F::write()),
        // hashes
        data!("hset", hash::hset_command, -4, F::write() | F::deny_oom()),
        data!("hsetnx", hash::hsetnx_command, 4, F::write() | F::deny_oom()),
        data!("hget", hash::hget_command, 3, F::readonly()),
        data!("hmget", hash::hmget_command, -3, F::readonly()),
        data!("hdel", hash::hdel_command, -3, F::write()),
        data!("hlen", hash::hlen_command, 2, F::readonly()),
        data!("hexists", hash::hexists_command, 3, F::readonly()),
        data!("hkeys", hash::hkeys_command, 2, F::readonly()),
        data!("hvals", hash::hvals_command, 2, F::readonly()),
        data!("hgetall", hash::hgetall_command, 2, F::readonly()),
        // sets
        data!("sadd", set::sadd_command, -3, F::write() | F::deny_oom()),
        data!("srem", set::srem_command, -3, F::write()),
        data!("scard", set::scard_command, 2, F::readonly()),
        data!("sismember", set::sismember_command, 3, F::readonly()),
        data!("smembers", set::smembers_command, 2, F::readonly()),
        data!("spop", set::spop_command, -2, F::write()),
        // sorted sets
        data!("zadd", zset::zadd_command, -4, F::write() | F::deny_oom()),
        data!("zrem", zset::zrem_command, -3, F::write()),
        data!("zscore", zset::zscore_command, 3, F::readonly()),
        data!("zcard", zset::zcard_command, 2, F::readonly()),
        data!("zrank", zset::zrank_command, 3, F::readonly()),
        data!("zrange", zset::zrange_command, -4, F::readonly()),
        data!("zrangebyscore", zset::zrangebyscore_command, -4, F::readonly()),
        // server / persistence / replication
        admin!("select", AdminCmd::Select, 2, F::readonly()),
        admin!("info", AdminCmd::Info, -1, F::readonly()),
        admin!("save", AdminCmd::Save, 1, F::readonly()),
        admin!("bgsave", AdminCmd::BgSave, 1, F::readonly()),
        admin!("bgrewriteaof", AdminCmd::BgRewriteAof, 1, F::readonly()),
        admin!("lastsave", AdminCmd::LastSave, 1, F::readonly()),
        admin!("shutdown", AdminCmd::Shutdown, -1, F::readonly()),
        admin!("slaveof", AdminCmd::SlaveOf, 3, F::readonly()),
        admin!("psync", AdminCmd::Psync, 3, F::readonly()),
    ])
});

pub fn lookup(name: &str) -> Option<&'static Command> {
    CMD_TABLE.get(name)
}
