use bytes::{Buf, BytesMut};

/// Ceiling on a single inline command line.
pub const MAX_INLINE: usize = 64 * 1024;
/// Ceiling on one bulk argument.
pub const MAX_BULK: usize = 256 * 1024 * 1024;
/// Ceiling on the element count of a command array.
pub const MAX_MULTIBULK: usize = 1024 * 1024;

/// A malformed frame. The connection that produced it is answered with
/// an error and may be dropped; during AOF load it is fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameError(pub String);

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Protocol error: {}", self.0)
    }
}
impl std::error::Error for FrameError {}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn parse_decimal(line: &[u8]) -> Result<i64, FrameError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError("invalid length".into()))
}

/// Incrementally parse one client command from `buf`.
///
/// Returns Ok(None) when the buffer holds only a prefix of a frame (read
/// more and retry), Ok(Some(argv)) when a full command was consumed. An
/// empty argv (blank inline line, `*0`) should be skipped by the caller.
/// Accepts both RESP arrays of bulk strings and inline commands.
pub fn parse_command(buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, FrameError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'*' {
        return parse_inline(buf);
    }

    let header_end = match find_crlf(buf, 1) {
        Some(i) => i,
        None => return Ok(None),
    };
    let count = parse_decimal(&buf[1..header_end])?;
    if count > MAX_MULTIBULK as i64 {
        return Err(FrameError("invalid multibulk length".into()));
    }
    let mut pos = header_end + 2;
    if count <= 0 {
        buf.advance(pos);
        return Ok(Some(Vec::new()));
    }

    let mut argv = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] != b'$' {
            return Err(FrameError("expected '$'".into()));
        }
        let line_end = match find_crlf(buf, pos + 1) {
            Some(i) => i,
            None => return Ok(None),
        };
        let len = parse_decimal(&buf[pos + 1..line_end])?;
        if len < 0 || len > MAX_BULK as i64 {
            return Err(FrameError("invalid bulk length".into()));
        }
        let len = len as usize;
        let data_start = line_end + 2;
        if data_start + len + 2 > buf.len() {
            return Ok(None);
        }
        if &buf[data_start + len..data_start + len + 2] != b"\r\n" {
            return Err(FrameError("bulk not terminated by CRLF".into()));
        }
        argv.push(buf[data_start..data_start + len].to_vec());
        pos = data_start + len + 2;
    }
    buf.advance(pos);
    Ok(Some(argv))
}

fn parse_inline(buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, FrameError> {
    let nl = match buf.iter().position(|&b| b == b'\n') {
        Some(i) => i,
        None => {
            if buf.len() > MAX_INLINE {
                return Err(FrameError("too big inline request".into()));
            }
            return Ok(None);
        }
    };
    if nl > MAX_INLINE {
        return Err(FrameError("too big inline request".into()));
    }
    let mut line_end = nl;
    if line_end > 0 && buf[line_end - 1] == b'\r' {
        line_end -= 1;
    }
    let argv: Vec<Vec<u8>> = buf[..line_end]
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_vec())
        .collect();
    buf.advance(nl + 1);
    Ok(Some(argv))
}

/// Consume one `\r\n`-terminated line, returned without the terminator.
/// Used for replication handshake replies.
pub fn parse_line(buf: &mut BytesMut) -> Option<Vec<u8>> {
    let end = find_crlf(buf, 0)?;
    let line = buf[..end].to_vec();
    buf.advance(end + 2);
    Some(line)
}

/// RESP-encode a command array of bulk strings. This is the byte form
/// appended to the AOF, streamed to replicas, and carried in Raft log
/// entries.
pub fn encode_command(argv: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + argv.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", argv.len()).as_bytes());
    for arg in argv {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// One protocol-level response.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
    NilArray,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Simple("OK".to_string())
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
            }
            Reply::Bulk(data) => {
                out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Reply::Nil => out.extend_from_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
            Reply::NilArray => out.extend_from_slice(b"*-1\r\n"),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multibulk_command() {
        let mut buf = BytesMut::from(&b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"[..]);
        let argv = parse_command(&mut buf).unwrap().unwrap();
        assert_eq!(argv, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn incremental_parse_waits_for_full_frame() {
        let full = b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n";
        for cut in 1..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(parse_command(&mut buf).unwrap(), None, "cut at {}", cut);
            buf.extend_from_slice(&full[cut..]);
            let argv = parse_command(&mut buf).unwrap().unwrap();
            assert_eq!(argv.len(), 2);
            assert_eq!(argv[1], b"hello");
        }
    }

    #[test]
    fn binary_safe_bulk() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let encoded = encode_command(&[b"SET".to_vec(), b"k".to_vec(), payload.clone()]);
        let mut buf = BytesMut::from(&encoded[..]);
        let argv = parse_command(&mut buf).unwrap().unwrap();
        assert_eq!(argv[2], payload);
    }

    #[test]
    fn inline_command() {
        let mut buf = BytesMut::from(&b"PING\r\nGET  k\r\n"[..]);
        assert_eq!(parse_command(&mut buf).unwrap().unwrap(), vec![b"PING".to_vec()]);
        assert_eq!(
            parse_command(&mut buf).unwrap().unwrap(),
            vec![b"GET".to_vec(), b"k".to_vec()]
        );
    }

    #[test]
    fn malformed_frame_is_an_error() {
        let mut buf = BytesMut::from(&b"*1\r\n#3\r\nfoo\r\n"[..]);
        assert!(parse_command(&mut buf).is_err());
        let mut buf = BytesMut::from(&b"*1\r\n$3\r\nfooXX"[..]);
        assert!(parse_command(&mut buf).is_err());
    }

    #[test]
    fn command_round_trip() {
        let argv = vec![b"LPUSH".to_vec(), b"list".to_vec(), b"a b".to_vec()];
        let mut buf = BytesMut::from(&encode_command(&argv)[..]);
        assert_eq!(parse_command(&mut buf).unwrap().unwrap(), argv);
    }

    #[test]
    fn reply_encodings() {
        assert_eq!(Reply::ok().to_bytes(), b"+OK\r\n");
        assert_eq!(Reply::Error("ERR x".into()).to_bytes(), b"-ERR x\r\n");
        assert_eq!(Reply::Integer(-5).to_bytes(), b":-5\r\n");
        assert_eq!(Reply::Bulk(b"hi".to_vec()).to_bytes(), b"$2\r\nhi\r\n");
        assert_eq!(Reply::Nil.to_bytes(), b"$-1\r\n");
        assert_eq!(Reply::NilArray.to_bytes(), b"*-1\r\n");
        assert_eq!(
            Reply::Array(vec![Reply::Integer(1), Reply::Nil]).to_bytes(),
            b"*2\r\n:1\r\n$-1\r\n"
        );
    }
}
