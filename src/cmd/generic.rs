use rand::Rng;

use crate::error::CmdError;
use crate::resp::Reply;
use crate::util::{glob_match, parse_i64};

use super::ExecCtx;

pub fn del_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let mut removed = 0i64;
    for key in &argv[1..] {
        db.expire_if_needed(key, now);
        if db.remove(key).is_some() {
            removed += 1;
        }
    }
    ctx.dirty += removed as u64;
    Ok(Reply::Integer(removed))
}

pub fn exists_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let count = argv[1..]
        .iter()
        .filter(|key| db.lookup_read(key, now).is_some())
        .count();
    Ok(Reply::Integer(count as i64))
}

pub fn type_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let name = match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => v.type_name(),
        None => "none",
    };
    Ok(Reply::Simple(name.to_string()))
}

pub fn keys_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let items = db
        .dict
        .keys()
        .filter(|key| match db.expires.get(*key) {
            Some(&at) => at > now,
            None => true,
        })
        .filter(|key| glob_match(&argv[1], key))
        .map(|key| Reply::Bulk(key.clone()))
        .collect();
    Ok(Reply::Array(items))
}

/// SCAN over a sorted snapshot of the keys. The cursor is the position
/// reached in that ordering; 0 means start (as input) and done (as
/// output). Keys present for the whole scan are guaranteed to be
/// visited.
pub fn scan_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let cursor = parse_i64(&argv[1]).ok_or(CmdError::NotInteger)? as usize;
    let mut pattern: Option<Vec<u8>> = None;
    let mut count = 10usize;
    let mut i = 2;
    while i < argv.len() {
        if argv[i].eq_ignore_ascii_case(b"match") && i + 1 < argv.len() {
            pattern = Some(argv[i + 1].clone());
            i += 2;
        } else if argv[i].eq_ignore_ascii_case(b"count") && i + 1 < argv.len() {
            let n = parse_i64(&argv[i + 1]).ok_or(CmdError::NotInteger)?;
            if n < 1 {
                return Err(CmdError::Syntax);
            }
            count = n as usize;
            i += 2;
        } else {
            return Err(CmdError::Syntax);
        }
    }

    let now = ctx.now_ms;
    let db = ctx.db();
    let mut keys: Vec<&Vec<u8>> = db
        .dict
        .keys()
        .filter(|key| match db.expires.get(*key) {
            Some(&at) => at > now,
            None => true,
        })
        .collect();
    keys.sort();

    let window: Vec<&Vec<u8>> = keys.iter().skip(cursor).take(count).copied().collect();
    let next_cursor = if cursor + window.len() >= keys.len() {
        0
    } else {
        cursor + window.len()
    };

    let items = window
        .into_iter()
        .filter(|key| match &pattern {
            Some(p) => glob_match(p, key),
            None => true,
        })
        .map(|key| Reply::Bulk(key.clone()))
        .collect();
    Ok(Reply::Array(vec![
        Reply::Bulk(next_cursor.to_string().into_bytes()),
        Reply::Array(items),
    ]))
}

pub fn dbsize_command(ctx: &mut ExecCtx, _argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    Ok(Reply::Integer(ctx.db().len() as i64))
}

pub fn randomkey_command(ctx: &mut ExecCtx, _argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let mut rng = rand::thread_rng();
    for _ in 0..16 {
        let len = db.dict.len();
        if len == 0 {
            return Ok(Reply::Nil);
        }
        let nth = rng.gen_range(0..len);
        let key = match db.dict.keys().nth(nth) {
            Some(k) => k.clone(),
            None => continue,
        };
        if !db.expire_if_needed(&key, now) {
            return Ok(Reply::Bulk(key));
        }
    }
    Ok(Reply::Nil)
}

pub fn flushdb_command(ctx: &mut ExecCtx, _argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let removed = ctx.db().flush();
    ctx.dirty += removed as u64;
    Ok(Reply::ok())
}

pub fn flushall_command(ctx: &mut ExecCtx, _argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let removed = ctx.dbs.flush_all();
    ctx.dirty += removed as u64;
    Ok(Reply::ok())
}

/// Shared EXPIRE family body: compute the absolute deadline, then either
/// arm it or, when it is already in the past, delete the key outright.
/// Propagation is rewritten to the absolute PEXPIREAT (or DEL) so that
/// the AOF and replicas replay deterministically.
fn expire_generic(ctx: &mut ExecCtx, argv: &[Vec<u8>], at_ms: i64) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    if db.lookup_read(&argv[1], now).is_none() {
        return Ok(Reply::Integer(0));
    }
    if at_ms <= now as i64 {
        db.remove(&argv[1]);
        ctx.dirty += 1;
        ctx.propagate = Some(vec![b"del".to_vec(), argv[1].clone()]);
        return Ok(Reply::Integer(1));
    }
    db.set_expire(&argv[1], at_ms as u64);
    ctx.dirty += 1;
    ctx.propagate = Some(vec![
        b"pexpireat".to_vec(),
        argv[1].clone(),
        at_ms.to_string().into_bytes(),
    ]);
    Ok(Reply::Integer(1))
}

pub fn expire_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let seconds = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    let at = ctx.now_ms as i64 + seconds.saturating_mul(1000);
    expire_generic(ctx, argv, at)
}

pub fn pexpire_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let ms = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    let at = ctx.now_ms as i64 + ms;
    expire_generic(ctx, argv, at)
}

pub fn expireat_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let at_secs = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    expire_generic(ctx, argv, at_secs.saturating_mul(1000))
}

pub fn pexpireat_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let at_ms = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    expire_generic(ctx, argv, at_ms)
}

fn ttl_generic(ctx: &mut ExecCtx, argv: &[Vec<u8>], in_ms: bool) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    if db.lookup_read(&argv[1], now).is_none() {
        return Ok(Reply::Integer(-2));
    }
    match db.expire_at(&argv[1]) {
        Some(at) => {
            let remaining = at.saturating_sub(now);
            Ok(Reply::Integer(if in_ms {
                remaining as i64
            } else {
                ((remaining + 999) / 1000) as i64
            }))
        }
        None => Ok(Reply::Integer(-1)),
    }
}

pub fn ttl_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    ttl_generic(ctx, argv, false)
}

pub fn pttl_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    ttl_generic(ctx, argv, true)
}

pub fn persist_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    if db.lookup_read(&argv[1], now).is_none() {
        return Ok(Reply::Integer(0));
    }
    if db.persist(&argv[1]) {
        ctx.dirty += 1;
        Ok(Reply::Integer(1))
    } else {
        Ok(Reply::Integer(0))
    }
}
