use thiserror::Error;

/// Client-visible command failures. Each renders as a RESP error line;
/// the variant text is the full error body after the leading '-'.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CmdError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR value is not an integer or out of range")]
    NotInteger,
    #[error("ERR value is not a valid float")]
    NotFloat,
    #[error("ERR index out of range")]
    IndexOutOfRange,
    #[error("ERR no such key")]
    NoSuchKey,
    #[error("ERR DB index is out of range")]
    InvalidDbIndex,
    #[error("ERR syntax error")]
    Syntax,
    #[error("READONLY You can't write against a read only replica")]
    ReadOnlyReplica,
    #[error("NOTLEADER {0}")]
    NotLeader(String),
    #[error("OOM command not allowed when used memory > 'max-memory'")]
    Oom,
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),
    #[error("ERR {0}")]
    Custom(String),
}

/// Server-side failures. Everything a subsystem can raise is caught at
/// its boundary and reclassified into one of these; raw I/O errors never
/// travel to a client.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error at line {line}: {msg}")]
    Config { line: usize, msg: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("replication error: {0}")]
    Replication(String),
    #[error("raft error: {0}")]
    Raft(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies() {
        assert_eq!(
            CmdError::WrongArity("get".into()).to_string(),
            "ERR wrong number of arguments for 'get' command"
        );
        assert!(CmdError::WrongType.to_string().starts_with("WRONGTYPE"));
        assert!(CmdError::ReadOnlyReplica.to_string().starts_with("READONLY"));
    }
}
