//! The tagged wire command model shared by both directions of a client
//! channel: one type byte, a fixed payload schema per tag, symmetric
//! encode/decode.

pub mod channel;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::{Read, Write};
use strum_macros::FromRepr;

/// Frames above this size are refused before allocation.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command tag {0:#04x}")]
    UnknownTag(u8),
    #[error("truncated command payload")]
    Truncated,
    #[error("command payload carries {0} undecoded bytes")]
    TrailingBytes(usize),
    #[error("command frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),
    #[error("malformed string in command: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wire tag of a command. Construction outside the defined range fails
/// right away; decode never sees a half-built tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum CommandTag {
    Error = 0,
    Event = 1,
    Exit = 2,
    Instrument = 3,
    Message = 4,
    Rename = 5,
    Success = 6,
    NumberMap = 7,
    StringMap = 8,
    Number = 9,
    GridData = 10,
    RetransformationStart = 11,
    RetransformClass = 12,
    SetParams = 13,
}

impl CommandTag {
    pub fn from_byte(byte: u8) -> Result<CommandTag, CommandError> {
        CommandTag::from_repr(byte).ok_or(CommandError::UnknownTag(byte))
    }
}

/// One protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Error { message: String },
    Event { name: String },
    Exit { code: i32 },
    Instrument { script: Vec<u8>, args: Vec<String> },
    Message { text: String },
    Rename { name: String },
    Success,
    NumberMap { name: String, entries: Vec<(String, i64)> },
    StringMap { name: String, entries: Vec<(String, String)> },
    Number { name: String, value: i64 },
    GridData { name: String, columns: Vec<String>, rows: Vec<Vec<String>> },
    RetransformationStart { unit_count: u32 },
    RetransformClass { name: String },
    SetParams { params: Vec<(String, String)> },
}

impl Command {
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::Error { .. } => CommandTag::Error,
            Command::Event { .. } => CommandTag::Event,
            Command::Exit { .. } => CommandTag::Exit,
            Command::Instrument { .. } => CommandTag::Instrument,
            Command::Message { .. } => CommandTag::Message,
            Command::Rename { .. } => CommandTag::Rename,
            Command::Success => CommandTag::Success,
            Command::NumberMap { .. } => CommandTag::NumberMap,
            Command::StringMap { .. } => CommandTag::StringMap,
            Command::Number { .. } => CommandTag::Number,
            Command::GridData { .. } => CommandTag::GridData,
            Command::RetransformationStart { .. } => CommandTag::RetransformationStart,
            Command::RetransformClass { .. } => CommandTag::RetransformClass,
            Command::SetParams { .. } => CommandTag::SetParams,
        }
    }

    /// Control-plane commands must never queue behind bulk data.
    pub fn is_urgent(&self) -> bool {
        !matches!(
            self,
            Command::Message { .. }
                | Command::NumberMap { .. }
                | Command::StringMap { .. }
                | Command::Number { .. }
                | Command::GridData { .. }
        )
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);
        match self {
            Command::Error { message } => put_str(buf, message),
            Command::Event { name } => put_str(buf, name),
            Command::Exit { code } => buf.put_i32(*code),
            Command::Instrument { script, args } => {
                buf.put_u32(script.len() as u32);
                buf.put_slice(script);
                buf.put_u32(args.len() as u32);
                for arg in args {
                    put_str(buf, arg);
                }
            }
            Command::Message { text } => put_str(buf, text),
            Command::Rename { name } => put_str(buf, name),
            Command::Success => {}
            Command::NumberMap { name, entries } => {
                put_str(buf, name);
                buf.put_u32(entries.len() as u32);
                for (key, value) in entries {
                    put_str(buf, key);
                    buf.put_i64(*value);
                }
            }
            Command::StringMap { name, entries } => {
                put_str(buf, name);
                buf.put_u32(entries.len() as u32);
                for (key, value) in entries {
                    put_str(buf, key);
                    put_str(buf, value);
                }
            }
            Command::Number { name, value } => {
                put_str(buf, name);
                buf.put_i64(*value);
            }
            Command::GridData {
                name,
                columns,
                rows,
            } => {
                put_str(buf, name);
                buf.put_u32(columns.len() as u32);
                for col in columns {
                    put_str(buf, col);
                }
                buf.put_u32(rows.len() as u32);
                for row in rows {
                    buf.put_u32(row.len() as u32);
                    for cell in row {
                        put_str(buf, cell);
                    }
                }
            }
            Command::RetransformationStart { unit_count } => buf.put_u32(*unit_count),
            Command::RetransformClass { name } => put_str(buf, name),
            Command::SetParams { params } => {
                buf.put_u32(params.len() as u32);
                for (key, value) in params {
                    put_str(buf, key);
                    put_str(buf, value);
                }
            }
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Command, CommandError> {
        let tag = CommandTag::from_byte(get_u8(buf)?)?;
        let cmd = match tag {
            CommandTag::Error => Command::Error {
                message: get_str(buf)?,
            },
            CommandTag::Event => Command::Event {
                name: get_str(buf)?,
            },
            CommandTag::Exit => Command::Exit {
                code: get_i32(buf)?,
            },
            CommandTag::Instrument => {
                let len = get_u32(buf)? as usize;
                if buf.remaining() < len {
                    return Err(CommandError::Truncated);
                }
                let script = buf.copy_to_bytes(len).to_vec();
                let arg_count = get_u32(buf)?;
                let mut args = Vec::with_capacity(arg_count as usize);
                for _ in 0..arg_count {
                    args.push(get_str(buf)?);
                }
                Command::Instrument { script, args }
            }
            CommandTag::Message => Command::Message {
                text: get_str(buf)?,
            },
            CommandTag::Rename => Command::Rename {
                name: get_str(buf)?,
            },
            CommandTag::Success => Command::Success,
            CommandTag::NumberMap => {
                let name = get_str(buf)?;
                let count = get_u32(buf)?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = get_str(buf)?;
                    let value = get_i64(buf)?;
                    entries.push((key, value));
                }
                Command::NumberMap { name, entries }
            }
            CommandTag::StringMap => {
                let name = get_str(buf)?;
                let count = get_u32(buf)?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = get_str(buf)?;
                    let value = get_str(buf)?;
                    entries.push((key, value));
                }
                Command::StringMap { name, entries }
            }
            CommandTag::Number => Command::Number {
                name: get_str(buf)?,
                value: get_i64(buf)?,
            },
            CommandTag::GridData => {
                let name = get_str(buf)?;
                let col_count = get_u32(buf)?;
                let mut columns = Vec::with_capacity(col_count as usize);
                for _ in 0..col_count {
                    columns.push(get_str(buf)?);
                }
                let row_count = get_u32(buf)?;
                let mut rows = Vec::with_capacity(row_count as usize);
                for _ in 0..row_count {
                    let cell_count = get_u32(buf)?;
                    let mut row = Vec::with_capacity(cell_count as usize);
                    for _ in 0..cell_count {
                        row.push(get_str(buf)?);
                    }
                    rows.push(row);
                }
                Command::GridData {
                    name,
                    columns,
                    rows,
                }
            }
            CommandTag::RetransformationStart => Command::RetransformationStart {
                unit_count: get_u32(buf)?,
            },
            CommandTag::RetransformClass => Command::RetransformClass {
                name: get_str(buf)?,
            },
            CommandTag::SetParams => {
                let count = get_u32(buf)?;
                let mut params = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = get_str(buf)?;
                    let value = get_str(buf)?;
                    params.push((key, value));
                }
                Command::SetParams { params }
            }
        };
        Ok(cmd)
    }

    /// Write one length-framed command.
    pub fn write_to(&self, w: &mut impl Write) -> Result<(), CommandError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        w.write_all(&(buf.len() as u32).to_be_bytes())?;
        w.write_all(&buf)?;
        w.flush()?;
        Ok(())
    }

    /// Read one length-framed command. The frame must decode completely;
    /// leftover payload bytes are a protocol error.
    pub fn read_from(r: &mut impl Read) -> Result<Command, CommandError> {
        let mut len = [0u8; 4];
        r.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len);
        if len > MAX_FRAME {
            return Err(CommandError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload)?;
        let mut buf = Bytes::from(payload);
        let cmd = Command::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(CommandError::TrailingBytes(buf.remaining()));
        }
        Ok(cmd)
    }
}

/// Human rendering used by local script clients writing to a console or
/// an output file.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Error { message } => write!(f, "error: {message}"),
            Command::Event { name } => write!(f, "event: {name}"),
            Command::Exit { code } => write!(f, "exit: {code}"),
            Command::Instrument { script, args } => {
                write!(f, "instrument request ({} bytes, {:?})", script.len(), args)
            }
            Command::Message { text } => write!(f, "{text}"),
            Command::Rename { name } => write!(f, "client renamed to {name}"),
            Command::Success => write!(f, "ok"),
            Command::NumberMap { name, entries } => {
                write!(f, "{name}:")?;
                for (key, value) in entries {
                    write!(f, " {key}={value}")?;
                }
                Ok(())
            }
            Command::StringMap { name, entries } => {
                write!(f, "{name}:")?;
                for (key, value) in entries {
                    write!(f, " {key}={value}")?;
                }
                Ok(())
            }
            Command::Number { name, value } => write!(f, "{name} = {value}"),
            Command::GridData { name, rows, .. } => {
                write!(f, "{name}: {} rows", rows.len())
            }
            Command::RetransformationStart { unit_count } => {
                write!(f, "retransforming {unit_count} units")
            }
            Command::RetransformClass { name } => write!(f, "retransform {name}"),
            Command::SetParams { params } => {
                write!(f, "params:")?;
                for (key, value) in params {
                    write!(f, " {key}={value}")?;
                }
                Ok(())
            }
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Result<String, CommandError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(CommandError::Truncated);
    }
    let raw = buf.copy_to_bytes(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CommandError> {
    if buf.remaining() < 1 {
        return Err(CommandError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, CommandError> {
    if buf.remaining() < 4 {
        return Err(CommandError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, CommandError> {
    if buf.remaining() < 4 {
        return Err(CommandError::Truncated);
    }
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut Bytes) -> Result<i64, CommandError> {
    if buf.remaining() < 8 {
        return Err(CommandError::Truncated);
    }
    Ok(buf.get_i64())
}
