use std::collections::HashSet;

use rand::seq::IteratorRandom;

use crate::error::CmdError;
use crate::obj::Value;
use crate::resp::Reply;
use crate::util::parse_i64;

use super::ExecCtx;

pub fn sadd_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    db.expire_if_needed(&argv[1], now);
    let set = db
        .dict
        .entry(argv[1].clone())
        .or_insert_with(|| Value::Set(HashSet::new()))
        .as_set_mut()?;
    let mut added = 0i64;
    for member in &argv[2..] {
        if set.insert(member.clone()) {
            added += 1;
        }
    }
    if added > 0 {
        ctx.dirty += added as u64;
    }
    Ok(Reply::Integer(added))
}

pub fn srem_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let removed = match db.lookup_write(&argv[1], now) {
        Some(v) => {
            let set = v.as_set_mut()?;
            argv[2..]
                .iter()
                .filter(|member| set.remove(*member))
                .count()
        }
        None => 0,
    };
    if removed > 0 {
        let emptied = db
            .lookup_read(&argv[1], now)
            .map(|v| v.is_emptied_aggregate())
            .unwrap_or(false);
        if emptied {
            db.remove(&argv[1]);
        }
        ctx.dirty += removed as u64;
    }
    Ok(Reply::Integer(removed as i64))
}

pub fn scard_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Integer(v.as_set()?.len() as i64)),
        None => Ok(Reply::Integer(0)),
    }
}

pub fn sismember_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Integer(v.as_set()?.contains(&argv[2]) as i64)),
        None => Ok(Reply::Integer(0)),
    }
}

pub fn smembers_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Array(
            v.as_set()?
                .iter()
                .map(|member| Reply::Bulk(member.clone()))
                .collect(),
        )),
        None => Ok(Reply::Array(Vec::new())),
    }
}

/// SPOP removes a uniformly sampled subset without replacement. The
/// random choice must not reach the AOF or the replicas, so the command
/// propagates as an SREM naming exactly the popped members.
pub fn spop_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let with_count = argv.len() == 3;
    if argv.len() > 3 {
        return Err(CmdError::WrongArity("spop".to_string()));
    }
    let count = if with_count {
        let n = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
        if n < 0 {
            return Err(CmdError::IndexOutOfRange);
        }
        n as usize
    } else {
        1
    };

    let now = ctx.now_ms;
    let db = ctx.db();
    let popped: Vec<Vec<u8>> = match db.lookup_write(&argv[1], now) {
        Some(v) => {
            let set = v.as_set_mut()?;
            let chosen: Vec<Vec<u8>> = set
                .iter()
                .cloned()
                .choose_multiple(&mut rand::thread_rng(), count);
            for member in &chosen {
                set.remove(member);
            }
            chosen
        }
        None => Vec::new(),
    };

    if !popped.is_empty() {
        let emptied = db
            .lookup_read(&argv[1], now)
            .map(|v| v.is_emptied_aggregate())
            .unwrap_or(false);
        if emptied {
            db.remove(&argv[1]);
        }
        ctx.dirty += popped.len() as u64;
        let mut prop = vec![b"srem".to_vec(), argv[1].clone()];
        prop.extend(popped.iter().cloned());
        ctx.propagate = Some(prop);
    }

    if with_count {
        Ok(Reply::Array(
            popped.into_iter().map(Reply::Bulk).collect(),
        ))
    } else {
        Ok(match popped.into_iter().next() {
            Some(member) => Reply::Bulk(member),
            None => Reply::Nil,
        })
    }
}
