use std::collections::HashMap;

use crate::error::CmdError;
use crate::obj::Value;
use crate::resp::Reply;

use super::ExecCtx;

pub fn hset_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    if (argv.len() - 2) % 2 != 0 {
        return Err(CmdError::WrongArity("hset".to_string()));
    }
    let now = ctx.now_ms;
    let db = ctx.db();
    db.expire_if_needed(&argv[1], now);
    let hash = db
        .dict
        .entry(argv[1].clone())
        .or_insert_with(|| Value::Hash(HashMap::new()))
        .as_hash_mut()?;
    let mut added = 0i64;
    for pair in argv[2..].chunks(2) {
        if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
            added += 1;
        }
    }
    ctx.dirty += ((argv.len() - 2) / 2) as u64;
    Ok(Reply::Integer(added))
}

pub fn hsetnx_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    db.expire_if_needed(&argv[1], now);
    let hash = db
        .dict
        .entry(argv[1].clone())
        .or_insert_with(|| Value::Hash(HashMap::new()))
        .as_hash_mut()?;
    if hash.contains_key(&argv[2]) {
        return Ok(Reply::Integer(0));
    }
    hash.insert(argv[2].clone(), argv[3].clone());
    ctx.dirty += 1;
    Ok(Reply::Integer(1))
}

pub fn hget_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(match v.as_hash()?.get(&argv[2]) {
            Some(value) => Reply::Bulk(value.clone()),
            None => Reply::Nil,
        }),
        None => Ok(Reply::Nil),
    }
}

pub fn hmget_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let empty = HashMap::new();
    let hash = match db.lookup_read(&argv[1], now) {
        Some(v) => v.as_hash()?,
        None => &empty,
    };
    let items = argv[2..]
        .iter()
        .map(|field| match hash.get(field) {
            Some(value) => Reply::Bulk(value.clone()),
            None => Reply::Nil,
        })
        .collect();
    Ok(Reply::Array(items))
}

pub fn hdel_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let removed = match db.lookup_write(&argv[1], now) {
        Some(v) => {
            let hash = v.as_hash_mut()?;
            argv[2..]
                .iter()
                .filter(|field| hash.remove(*field).is_some())
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

pub fn hlen_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Integer(v.as_hash()?.len() as i64)),
        None => Ok(Reply::Integer(0)),
    }
}

pub fn hexists_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Integer(v.as_hash()?.contains_key(&argv[2]) as i64)),
        None => Ok(Reply::Integer(0)),
    }
}

pub fn hkeys_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Array(
            v.as_hash()?
                .keys()
                .map(|field| Reply::Bulk(field.clone()))
                .collect(),
        )),
        None => Ok(Reply::Array(Vec::new())),
    }
}

pub fn hvals_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Array(
            v.as_hash()?
                .values()
                .map(|value| Reply::Bulk(value.clone()))
                .collect(),
        )),
        None => Ok(Reply::Array(Vec::new())),
    }
}

pub fn hgetall_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => {
            let mut items = Vec::new();
            for (field, value) in v.as_hash()? {
                items.push(Reply::Bulk(field.clone()));
                items.push(Reply::Bulk(value.clone()));
            }
            Ok(Reply::Array(items))
        }
        None => Ok(Reply::Array(Vec::new())),
    }
}
