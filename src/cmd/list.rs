use std::collections::VecDeque;

use crate::error::CmdError;
use crate::obj::Value;
use crate::resp::Reply;
use crate::util::parse_i64;

use super::ExecCtx;

fn push(ctx: &mut ExecCtx, argv: &[Vec<u8>], front: bool) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    db.expire_if_needed(&argv[1], now);
    let list = db
        .dict
        .entry(argv[1].clone())
        .or_insert_with(|| Value::List(VecDeque::new()))
        .as_list_mut()?;
    for item in &argv[2..] {
        if front {
            list.push_front(item.clone());
        } else {
            list.push_back(item.clone());
        }
    }
    let len = list.len();
    ctx.dirty += (argv.len() - 2) as u64;
    Ok(Reply::Integer(len as i64))
}

pub fn lpush_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    push(ctx, argv, true)
}

pub fn rpush_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    push(ctx, argv, false)
}

fn pop(ctx: &mut ExecCtx, argv: &[Vec<u8>], front: bool) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let popped = match db.lookup_write(&argv[1], now) {
        Some(v) => {
            let list = v.as_list_mut()?;
            if front {
                list.pop_front()
            } else {
                list.pop_back()
            }
        }
        None => None,
    };
    match popped {
        Some(item) => {
            let emptied = db
                .lookup_read(&argv[1], now)
                .map(|v| v.is_emptied_aggregate())
                .unwrap_or(false);
            if emptied {
                db.remove(&argv[1]);
            }
            ctx.dirty += 1;
            Ok(Reply::Bulk(item))
        }
        None => Ok(Reply::Nil),
    }
}

pub fn lpop_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    pop(ctx, argv, true)
}

pub fn rpop_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    pop(ctx, argv, false)
}

pub fn llen_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Integer(v.as_list()?.len() as i64)),
        None => Ok(Reply::Integer(0)),
    }
}

/// Normalize a [start, end] pair with Redis negative-index semantics
/// against a collection of `len` items. Returns None for an empty range.
pub(super) fn normalize_range(start: i64, end: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let mut start = if start < 0 { len + start } else { start };
    let mut end = if end < 0 { len + end } else { end };
    if start < 0 {
        start = 0;
    }
    if end >= len {
        end = len - 1;
    }
    if start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize))
}

pub fn lrange_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let start = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    let end = parse_i64(&argv[3]).ok_or(CmdError::NotInteger)?;
    let now = ctx.now_ms;
    let list = match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => v.as_list()?,
        None => return Ok(Reply::Array(Vec::new())),
    };
    let (start, end) = match normalize_range(start, end, list.len()) {
        Some(r) => r,
        None => return Ok(Reply::Array(Vec::new())),
    };
    let items = list
        .iter()
        .skip(start)
        .take(end - start + 1)
        .map(|item| Reply::Bulk(item.clone()))
        .collect();
    Ok(Reply::Array(items))
}

pub fn lindex_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let index = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    let now = ctx.now_ms;
    let list = match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => v.as_list()?,
        None => return Ok(Reply::Nil),
    };
    let len = list.len() as i64;
    let index = if index < 0 { len + index } else { index };
    if index < 0 || index >= len {
        return Ok(Reply::Nil);
    }
    Ok(Reply::Bulk(list[index as usize].clone()))
}

pub fn lset_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let index = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    let now = ctx.now_ms;
    let db = ctx.db();
    let list = match db.lookup_write(&argv[1], now) {
        Some(v) => v.as_list_mut()?,
        None => return Err(CmdError::NoSuchKey),
    };
    let len = list.len() as i64;
    let index = if index < 0 { len + index } else { index };
    if index < 0 || index >= len {
        return Err(CmdError::IndexOutOfRange);
    }
    list[index as usize] = argv[3].clone();
    ctx.dirty += 1;
    Ok(Reply::ok())
}

pub fn lrem_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let count = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    let target = &argv[3];
    let now = ctx.now_ms;
    let db = ctx.db();
    let list = match db.lookup_write(&argv[1], now) {
        Some(v) => v.as_list_mut()?,
        None => return Ok(Reply::Integer(0)),
    };

    let mut removed = 0usize;
    let limit = count.unsigned_abs() as usize;
    let items: Vec<Vec<u8>> = list.drain(..).collect();
    let mut kept: Vec<Vec<u8>> = Vec::with_capacity(items.len());
    if count >= 0 {
        for item in items {
            if item == *target && (count == 0 || removed < limit) {
                removed += 1;
            } else {
                kept.push(item);
            }
        }
    } else {
        for item in items.into_iter().rev() {
            if item == *target && removed < limit {
                removed += 1;
            } else {
                kept.push(item);
            }
        }
        kept.reverse();
    }
    *list = kept.into();

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Databases;

    fn run(dbs: &mut Databases, proc: super::super::CommandProc, argv: &[&[u8]]) -> Reply {
        let argv: Vec<Vec<u8>> = argv.iter().map(|a| a.to_vec()).collect();
        let mut ctx = ExecCtx {
            dbs,
            db_index: 0,
            now_ms: 1_000,
            dirty: 0,
            propagate: None,
        };
        proc(&mut ctx, &argv).unwrap()
    }

    #[test]
    fn push_pop_both_ends() {
        let mut dbs = Databases::new(1);
        run(&mut dbs, lpush_command, &[b"lpush" as &[u8], b"l", b"x"]);
        run(&mut dbs, lpush_command, &[b"lpush" as &[u8], b"l", b"y"]);
        run(&mut dbs, rpush_command, &[b"rpush" as &[u8], b"l", b"z"]);
        assert_eq!(
            run(&mut dbs, lrange_command, &[b"lrange" as &[u8], b"l", b"0", b"-1"]),
            Reply::Array(vec![
                Reply::Bulk(b"y".to_vec()),
                Reply::Bulk(b"x".to_vec()),
                Reply::Bulk(b"z".to_vec()),
            ])
        );
        assert_eq!(
            run(&mut dbs, lpop_command, &[b"lpop" as &[u8], b"l"]),
            Reply::Bulk(b"y".to_vec())
        );
        assert_eq!(
            run(&mut dbs, rpop_command, &[b"rpop" as &[u8], b"l"]),
            Reply::Bulk(b"z".to_vec())
        );
    }

    #[test]
    fn popping_last_item_removes_key() {
        let mut dbs = Databases::new(1);
        run(&mut dbs, rpush_command, &[b"rpush" as &[u8], b"l", b"only"]);
        run(&mut dbs, rpop_command, &[b"rpop" as &[u8], b"l"]);
        assert!(dbs.get(0).dict.get(b"l".as_slice()).is_none());
        assert_eq!(run(&mut dbs, lpop_command, &[b"lpop" as &[u8], b"l"]), Reply::Nil);
    }

    #[test]
    fn lrange_negative_indices() {
        let mut dbs = Databases::new(1);
        for item in [b"a", b"b", b"c", b"d"] {
            run(&mut dbs, rpush_command, &[b"rpush" as &[u8], b"l", item]);
        }
        assert_eq!(
            run(&mut dbs, lrange_command, &[b"lrange" as &[u8], b"l", b"-2", b"-1"]),
            Reply::Array(vec![Reply::Bulk(b"c".to_vec()), Reply::Bulk(b"d".to_vec())])
        );
        assert_eq!(
            run(&mut dbs, lrange_command, &[b"lrange" as &[u8], b"l", b"2", b"1"]),
            Reply::Array(Vec::new())
        );
    }

    #[test]
    fn lrem_count_directions() {
        let mut dbs = Databases::new(1);
        for item in [b"a", b"b", b"a", b"c", b"a"] {
            run(&mut dbs, rpush_command, &[b"rpush" as &[u8], b"l", item]);
        }
        assert_eq!(
            run(&mut dbs, lrem_command, &[b"lrem" as &[u8], b"l", b"1", b"a"]),
            Reply::Integer(1)
        );
        assert_eq!(
            run(&mut dbs, lrange_command, &[b"lrange" as &[u8], b"l", b"0", b"-1"]),
            Reply::Array(vec![
                Reply::Bulk(b"b".to_vec()),
                Reply::Bulk(b"a".to_vec()),
                Reply::Bulk(b"c".to_vec()),
                Reply::Bulk(b"a".to_vec()),
            ])
        );
        assert_eq!(
            run(&mut dbs, lrem_command, &[b"lrem" as &[u8], b"l", b"-1", b"a"]),
            Reply::Integer(1)
        );
        assert_eq!(
            run(&mut dbs, lrange_command, &[b"lrange" as &[u8], b"l", b"0", b"-1"]),
            Reply::Array(vec![
                Reply::Bulk(b"b".to_vec()),
                Reply::Bulk(b"a".to_vec()),
                Reply::Bulk(b"c".to_vec()),
            ])
        );
        assert_eq!(
            run(&mut dbs, lrem_command, &[b"lrem" as &[u8], b"l", b"0", b"a"]),
            Reply::Integer(1)
        );
    }

    #[test]
    fn lset_bounds() {
        let mut dbs = Databases::new(1);
        for item in [b"a", b"b"] {
            run(&mut dbs, rpush_command, &[b"rpush" as &[u8], b"l", item]);
        }
        assert_eq!(
            run(&mut dbs, lset_command, &[b"lset" as &[u8], b"l", b"-1", b"z"]),
            Reply::ok()
        );
        assert_eq!(
            run(&mut dbs, lindex_command, &[b"lindex" as &[u8], b"l", b"1"]),
            Reply::Bulk(b"z".to_vec())
        );
        let argv: Vec<Vec<u8>> = [b"lset" as &[u8], b"l", b"5", b"z"]
            .iter()
            .map(|a| a.to_vec())
            .collect();
        let mut ctx = ExecCtx {
            dbs: &mut dbs,
            db_index: 0,
            now_ms: 1_000,
            dirty: 0,
            propagate: None,
        };
        assert_eq!(
            lset_command(&mut ctx, &argv),
            Err(CmdError::IndexOutOfRange)
        );
    }
}
