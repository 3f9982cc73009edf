use crate::dynstr::DynStr;
use crate::error::CmdError;
use crate::obj::Value;
use crate::resp::Reply;
use crate::util::{parse_i64, parse_i64_strict};

use super::ExecCtx;

pub fn set_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    ctx.db()
        .set_value(argv[1].clone(), Value::Str(DynStr::from_bytes(&argv[2])));
    ctx.dirty += 1;
    Ok(Reply::ok())
}

pub fn setnx_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    if db.lookup_read(&argv[1], now).is_some() {
        return Ok(Reply::Integer(0));
    }
    db.set_value(argv[1].clone(), Value::Str(DynStr::from_bytes(&argv[2])));
    ctx.dirty += 1;
    Ok(Reply::Integer(1))
}

pub fn get_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Bulk(v.as_str()?.bytes().to_vec())),
        None => Ok(Reply::Nil),
    }
}

pub fn getset_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let old = match db.lookup_read(&argv[1], now) {
        Some(v) => Some(v.as_str()?.bytes().to_vec()),
        None => None,
    };
    db.set_value(argv[1].clone(), Value::Str(DynStr::from_bytes(&argv[2])));
    ctx.dirty += 1;
    Ok(match old {
        Some(bytes) => Reply::Bulk(bytes),
        None => Reply::Nil,
    })
}

pub fn mget_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let items = argv[1..]
        .iter()
        .map(|key| match db.lookup_read(key, now) {
            Some(Value::Str(s)) => Reply::Bulk(s.bytes().to_vec()),
            _ => Reply::Nil,
        })
        .collect();
    Ok(Reply::Array(items))
}

pub fn mset_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    if (argv.len() - 1) % 2 != 0 {
        return Err(CmdError::WrongArity("mset".to_string()));
    }
    for pair in argv[1..].chunks(2) {
        ctx.db()
            .set_value(pair[0].clone(), Value::Str(DynStr::from_bytes(&pair[1])));
        ctx.dirty += 1;
    }
    Ok(Reply::ok())
}

pub fn msetnx_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    if (argv.len() - 1) % 2 != 0 {
        return Err(CmdError::WrongArity("msetnx".to_string()));
    }
    let now = ctx.now_ms;
    let db = ctx.db();
    for pair in argv[1..].chunks(2) {
        if db.lookup_read(&pair[0], now).is_some() {
            return Ok(Reply::Integer(0));
        }
    }
    let mut set_count: u64 = 0;
    for pair in argv[1..].chunks(2) {
        db.set_value(pair[0].clone(), Value::Str(DynStr::from_bytes(&pair[1])));
        set_count += 1;
    }
    ctx.dirty += set_count;
    Ok(Reply::Integer(1))
}

pub fn append_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let len = match db.lookup_write(&argv[1], now) {
        Some(v) => {
            let s = v.as_str_mut()?;
            if s.len() + argv[2].len() > DynStr::MAX_LEN {
                return Err(CmdError::Custom(
                    "string exceeds maximum allowed size".to_string(),
                ));
            }
            // append consumes; take the string out and adopt the result
            let owned = std::mem::take(s);
            *s = owned.append(&argv[2]);
            s.len()
        }
        None => {
            db.set_value(argv[1].clone(), Value::Str(DynStr::from_bytes(&argv[2])));
            argv[2].len()
        }
    };
    ctx.dirty += 1;
    Ok(Reply::Integer(len as i64))
}

pub fn strlen_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => Ok(Reply::Integer(v.as_str()?.len() as i64)),
        None => Ok(Reply::Integer(0)),
    }
}

pub fn getrange_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let start = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    let end = parse_i64(&argv[3]).ok_or(CmdError::NotInteger)?;
    let now = ctx.now_ms;
    let bytes = match ctx.db().lookup_read(&argv[1], now) {
        Some(v) => v.as_str()?.bytes().to_vec(),
        None => return Ok(Reply::Bulk(Vec::new())),
    };
    let len = bytes.len() as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut end = if end < 0 { len + end } else { end };
    if start < 0 {
        start = 0;
    }
    if end >= len {
        end = len - 1;
    }
    if len == 0 || start > end || start >= len {
        return Ok(Reply::Bulk(Vec::new()));
    }
    Ok(Reply::Bulk(bytes[start as usize..=end as usize].to_vec()))
}

fn incr_decr(ctx: &mut ExecCtx, key: &[u8], delta: i64) -> Result<Reply, CmdError> {
    let now = ctx.now_ms;
    let db = ctx.db();
    let value = match db.lookup_write(key, now) {
        Some(v) => {
            let s = v.as_str_mut()?;
            let current = parse_i64_strict(s.bytes()).ok_or(CmdError::NotInteger)?;
            let next = current.wrapping_add(delta);
            *s = DynStr::from_bytes(next.to_string().as_bytes());
            next
        }
        None => {
            let next = delta;
            db.set_value(
                key.to_vec(),
                Value::Str(DynStr::from_bytes(next.to_string().as_bytes())),
            );
            next
        }
    };
    ctx.dirty += 1;
    Ok(Reply::Integer(value))
}

pub fn incr_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    incr_decr(ctx, &argv[1], 1)
}

pub fn decr_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    incr_decr(ctx, &argv[1], -1)
}

pub fn incrby_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let delta = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    incr_decr(ctx, &argv[1], delta)
}

pub fn decrby_command(ctx: &mut ExecCtx, argv: &[Vec<u8>]) -> Result<Reply, CmdError> {
    let delta = parse_i64(&argv[2]).ok_or(CmdError::NotInteger)?;
    incr_decr(ctx, &argv[1], delta.wrapping_neg())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Databases;

    fn ctx(dbs: &mut Databases) -> ExecCtx<'_> {
        ExecCtx {
            dbs,
            db_index: 0,
            now_ms: 1_000,
            dirty: 0,
            propagate: None,
        }
    }

    fn run(
        dbs: &mut Databases,
        proc: super::super::CommandProc,
        argv: &[&[u8]],
    ) -> Result<Reply, CmdError> {
        let argv: Vec<Vec<u8>> = argv.iter().map(|a| a.to_vec()).collect();
        let mut c = ctx(dbs);
        proc(&mut c, &argv)
    }

    #[test]
    fn set_get_round_trip() {
        let mut dbs = Databases::new(1);
        assert_eq!(run(&mut dbs, set_command, &[b"set" as &[u8], b"k", b"v"]), Ok(Reply::ok()));
        assert_eq!(
            run(&mut dbs, get_command, &[b"get" as &[u8], b"k"]),
            Ok(Reply::Bulk(b"v".to_vec()))
        );
    }

    #[test]
    fn binary_safe_set_get() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let mut dbs = Databases::new(1);
        run(&mut dbs, set_command, &[b"set" as &[u8], b"k", &payload]).unwrap();
        assert_eq!(
            run(&mut dbs, strlen_command, &[b"strlen" as &[u8], b"k"]),
            Ok(Reply::Integer(256))
        );
        assert_eq!(
            run(&mut dbs, get_command, &[b"get" as &[u8], b"k"]),
            Ok(Reply::Bulk(payload))
        );
    }

    #[test]
    fn append_accumulates() {
        let mut dbs = Databases::new(1);
        assert_eq!(
            run(&mut dbs, append_command, &[b"append" as &[u8], b"k", b"a"]),
            Ok(Reply::Integer(1))
        );
        assert_eq!(
            run(&mut dbs, append_command, &[b"append" as &[u8], b"k", b"b"]),
            Ok(Reply::Integer(2))
        );
        assert_eq!(
            run(&mut dbs, get_command, &[b"get" as &[u8], b"k"]),
            Ok(Reply::Bulk(b"ab".to_vec()))
        );
    }

    #[test]
    fn incr_requires_canonical_integer() {
        let mut dbs = Databases::new(1);
        run(&mut dbs, set_command, &[b"set" as &[u8], b"n", b"41"]).unwrap();
        assert_eq!(
            run(&mut dbs, incr_command, &[b"incr" as &[u8], b"n"]),
            Ok(Reply::Integer(42))
        );
        run(&mut dbs, set_command, &[b"set" as &[u8], b"n", b"012"]).unwrap();
        assert_eq!(
            run(&mut dbs, incr_command, &[b"incr" as &[u8], b"n"]),
            Err(CmdError::NotInteger)
        );
        run(&mut dbs, set_command, &[b"set" as &[u8], b"n", b"abc"]).unwrap();
        assert_eq!(
            run(&mut dbs, incr_command, &[b"incr" as &[u8], b"n"]),
            Err(CmdError::NotInteger)
        );
    }

    #[test]
    fn incr_missing_key_starts_from_zero() {
        let mut dbs = Databases::new(1);
        assert_eq!(
            run(&mut dbs, incr_command, &[b"incr" as &[u8], b"c"]),
            Ok(Reply::Integer(1))
        );
        assert_eq!(
            run(&mut dbs, decrby_command, &[b"decrby" as &[u8], b"c", b"3"]),
            Ok(Reply::Integer(-2))
        );
    }

    #[test]
    fn incr_wraps_on_overflow() {
        let mut dbs = Databases::new(1);
        run(
            &mut dbs,
            set_command,
            &[b"set" as &[u8], b"n", i64::MAX.to_string().as_bytes()],
        )
        .unwrap();
        assert_eq!(
            run(&mut dbs, incr_command, &[b"incr" as &[u8], b"n"]),
            Ok(Reply::Integer(i64::MIN))
        );
    }

    #[test]
    fn getrange_negative_indices() {
        let mut dbs = Databases::new(1);
        run(&mut dbs, set_command, &[b"set" as &[u8], b"k", b"Hello World"]).unwrap();
        assert_eq!(
            run(&mut dbs, getrange_command, &[b"getrange" as &[u8], b"k", b"0", b"4"]),
            Ok(Reply::Bulk(b"Hello".to_vec()))
        );
        assert_eq!(
            run(&mut dbs, getrange_command, &[b"getrange" as &[u8], b"k", b"-5", b"-1"]),
            Ok(Reply::Bulk(b"World".to_vec()))
        );
        assert_eq!(
            run(&mut dbs, getrange_command, &[b"getrange" as &[u8], b"k", b"5", b"1"]),
            Ok(Reply::Bulk(Vec::new()))
        );
        assert_eq!(
            run(&mut dbs, getrange_command, &[b"getrange" as &[u8], b"k", b"0", b"100"]),
            Ok(Reply::Bulk(b"Hello World".to_vec()))
        );
    }

    #[test]
    fn wrong_type_is_policed() {
        let mut dbs = Databases::new(1);
        let mut c = ctx(&mut dbs);
        crate::cmd::list::lpush_command(
            &mut c,
            &[b"lpush".to_vec(), b"l".to_vec(), b"x".to_vec()],
        )
        .unwrap();
        assert_eq!(
            run(&mut dbs, get_command, &[b"get" as &[u8], b"l"]),
            Err(CmdError::WrongType)
        );
        assert_eq!(
            run(&mut dbs, incr_command, &[b"incr" as &[u8], b"l"]),
            Err(CmdError::WrongType)
        );
    }

    #[test]
    fn msetnx_is_all_or_nothing() {
        let mut dbs = Databases::new(1);
        run(&mut dbs, set_command, &[b"set" as &[u8], b"b", b"1"]).unwrap();
        assert_eq!(
            run(
                &mut dbs,
                msetnx_command,
                &[b"msetnx" as &[u8], b"a", b"1", b"b", b"2"]
            ),
            Ok(Reply::Integer(0))
        );
        assert_eq!(run(&mut dbs, get_command, &[b"get" as &[u8], b"a"]), Ok(Reply::Nil));
    }
}
