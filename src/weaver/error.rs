#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- code unit codec -------------------------------------------
    #[error("not a code unit (bad magic)")]
    BadMagic,
    #[error("unsupported code unit format version {0:#06x}")]
    Version(u16),
    #[error("truncated code unit")]
    Truncated,
    #[error("unknown opcode tag {0:#04x}")]
    UnknownOpcode(u8),
    #[error("malformed string in code unit: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    // --------------------------------- rewrite errors --------------------------------------------
    #[error("unknown location kind `{0}`")]
    UnknownLocationKind(String),
    #[error("unknown hook position `{0}`")]
    UnknownWhere(String),
    #[error("local slot space exhausted while rewriting `{0}`")]
    SlotOverflow(String),
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "agent", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "agent", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
