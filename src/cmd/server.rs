//! Connection-level commands. The server-state commands listed in the
//! same table section (INFO, SAVE, BGSAVE, BGREWRITEAOF, LASTSAVE,
//! SHUTDOWN, SLAVEOF, PSYNC) are routed to the dispatcher as `AdminCmd`
//! entries: they read and mutate state no keyspace handler can see.

use crate::error::CmdError;
use crate::resp::Reply;

use super::ExecCtx;

pub fn ping_command(_ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    match argv.len() {
        1 => Ok(Reply::Simple("PONG".to_string())),
        2 => Ok(Reply::Bulk(argv[1].clone())),
        _ => Err(CmdError::WrongArity("ping".to_string())),
    }
}

pub fn echo_command(_ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    Ok(Reply::Bulk(argv[1].clone()))
}
