use crate::error::CmdError;
use crate::obj::{SortedSet, Value};
use crate::resp::Reply;
use crate::util::{format_f64, parse_f64, parse_i64};

use super::list::normalize_range;
use super::ExecCtx;

pub fn zadd_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    if (argv.len() - 2) % 2 != 0 {
        return Err(CmdError::Syntax);
    }
    // validate every score before touching the keyspace
    let mut pairs: Vec<(f64, &Vec<u8>)> = Vec::with_capacity((argv.len() - 2) / 2);
    for pair in argv[2..].chunks(2) {
        let score = parse_f64(&pair[0]).ok_or(CmdError::NotFloat)?;
        pairs.push((score, &pair[1]));
    }

    let now = ctx.now_ms;
    let db = ctx.db();
    db.expire_if_needed(&argv[1], now);
    let zset = db
        .dict
        .entry(argv[1].clone())
        .or_insert_with(|| Value::ZSet(SortedSet::new()))
        .as_zset_mut()?;
    let mut added = 0i64;
    for (score, member) in pairs {
        if zset.insert(member.clone(), score) {
            added += 1;
        }
    }
    ctx.dirty += ((argv.len() - 2) / 2) as u64;
    Ok(Reply::Integer(added))
}

pub fn zrem_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let removed = match db.lookup_write(&argv[1], now) {
        Some(v) => {
            let zset = v.as_zset_mut()?;
            argv[2..]
                .iter()
                .filter(|member| zset.remove(member))
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

pub fn zscore_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(match v.as_zset()?.score(&argv[2]) {
            Some(score) => Reply::Bulk(format_f64(score).into_bytes()),
            None => Reply::Nil,
        }),
        None => Ok(Reply::Nil),
    }
}

pub fn zcard_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Integer(v.as_zset()?.len() as i64)),
        None => Ok(Reply::Integer(0)),
    }
}

pub fn zrank_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(match v.as_zset()?.rank(&argv[2]) {
            Some(rank) => Reply::Integer(rank as i64),
            None => Reply::Nil,
        }),
        None => Ok(Reply::Nil),
    }
}

fn with_scores_flag(argv: &[Vec<u8>], at: usize) -> Result<bool, CmdError> {
    match argv.len() - at {
        0 => Ok(false),
        1 if argv[at].eq_ignore_ascii_case(b"withscores") => Ok(true),
        _ => Err(CmdError::Syntax),
    }
}

fn emit(entries: Vec<(&[u8], f64)>, with_scores: bool) -> Reply {
    let mut items = Vec::with_capacity(entries.len() * if with_scores { 2 } else { 1 });
    for (member, score) in entries {
        items.push(Reply::Bulk(member.to_vec()));
        if with_scores {
            items.push(Reply::Bulk(format_f64(score).into_bytes()));
        }
    }
    Reply::Array(items)
}

pub fn zrange_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let start = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    let end = parse_i64(&argv[3]).ok_or(CmdError::NotInteger)?;
    let with_scores = with_scores_flag(argv, 4)?;
    let now = ctx.now_ms;
    let zset = match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => v.as_zset()?,
        None => return Ok(Reply::Array(Vec::new())),
    };
    let (start, end) = match normalize_range(start, end, zset.len()) {
        Some(r) => r,
        None => return Ok(Reply::Array(Vec::new())),
    };
    Ok(emit(zset.range_by_rank(start, end), with_scores))
}

/// Parse a ZRANGEBYSCORE bound: `(` prefix makes it exclusive, -inf/+inf
/// are accepted.
fn parse_bound(arg: &[u8]) -> Result<(f64, bool), CmdError> {
    if let Some(rest) = arg.strip_prefix(b"(") {
        Ok((parse_f64(rest).ok_or(CmdError::NotFloat)?, true))
    } else {
        Ok((parse_f64(arg).ok_or(CmdError::NotFloat)?, false))
    }
}

pub fn zrangebyscore_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let (min, min_excl) = parse_bound(&argv[2])?;
    let (max, max_excl) = parse_bound(&argv[3])?;
    let with_scores = with_scores_flag(argv, 4)?;
    let now = ctx.now_ms;
    let zset = match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => v.as_zset()?,
        None => return Ok(Reply::Array(Vec::new())),
    };
    Ok(emit(
        zset.range_by_score(min, min_excl, max, max_excl),
        with_scores,
    ))
}
