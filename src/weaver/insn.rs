use crate::weaver::error::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Branch target identifier. Jumps reference labels, not instruction
/// offsets, so splicing new instructions into a stream never invalidates
/// a branch target.
pub type LabelId = u32;

/// Local variable slot index.
pub type Slot = u16;

const UNIT_MAGIC: [u8; 4] = *b"TWUC";
const UNIT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOp {
    Enter,
    Exit,
}

/// One instruction of a method body.
///
/// The set covers every structural point the rewriting engine can
/// instrument plus the plumbing (constants, locals, jumps) instrumentation
/// fragments are assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    Const(i64),
    Load(Slot),
    Store(Slot),
    ArrayLoad { elem: String },
    ArrayStore { elem: String },
    FieldGet { owner: String, field: String, value_type: String },
    FieldSet { owner: String, field: String, value_type: String },
    Call { owner: String, name: String, sig: String },
    Jump { target: LabelId },
    JumpIfZero { target: LabelId },
    Label(LabelId),
    Line(u32),
    MonitorEnter,
    MonitorExit,
    Return,
    Throw,
}

impl Insn {
    /// True for instructions that end one logical invocation of the body.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Insn::Return | Insn::Throw)
    }

    /// Net operand stack effect of this instruction.
    pub fn stack_effect(&self) -> i32 {
        match self {
            Insn::Const(_) | Insn::Load(_) => 1,
            Insn::Store(_) => -1,
            // array ref + index replaced by the value
            Insn::ArrayLoad { .. } => -1,
            // array ref + index + value consumed
            Insn::ArrayStore { .. } => -3,
            // object ref replaced by the value
            Insn::FieldGet { .. } => 0,
            Insn::FieldSet { .. } => -2,
            Insn::Call { sig, .. } => sig_stack_effect(sig),
            Insn::Jump { .. } | Insn::Label(_) | Insn::Line(_) => 0,
            Insn::JumpIfZero { .. } => -1,
            Insn::MonitorEnter | Insn::MonitorExit => -1,
            Insn::Return => 0,
            Insn::Throw => -1,
        }
    }
}

/// Stack effect of a call signature like `(II)I`: one stack word per
/// argument character, `V` for a void result. Signatures without an
/// argument list are treated as balanced.
fn sig_stack_effect(sig: &str) -> i32 {
    let Some(rest) = sig.strip_prefix('(') else {
        return 0;
    };
    let Some((args, ret)) = rest.split_once(')') else {
        return 0;
    };
    let ret = if ret == "V" || ret.is_empty() { 0 } else { 1 };
    ret - args.chars().count() as i32
}

/// One method body of a code unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    pub name: String,
    pub sig: String,
    pub max_locals: Slot,
    pub max_stack: u16,
    pub insns: Vec<Insn>,
}

/// One loaded type: owner name plus compiled method bodies, with a
/// symmetric binary encoding. This is the blob the host runtime hands to
/// the transformer on load and retransform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    pub owner: String,
    pub methods: Vec<MethodBody>,
}

impl CodeUnit {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_slice(&UNIT_MAGIC);
        buf.put_u16(UNIT_VERSION);
        put_str(&mut buf, &self.owner);
        buf.put_u16(self.methods.len() as u16);
        for m in &self.methods {
            put_str(&mut buf, &m.name);
            put_str(&mut buf, &m.sig);
            buf.put_u16(m.max_locals);
            buf.put_u16(m.max_stack);
            buf.put_u32(m.insns.len() as u32);
            for insn in &m.insns {
                encode_insn(&mut buf, insn);
            }
        }
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<CodeUnit, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let owner = decode_header(&mut buf)?;
        let method_count = get_u16(&mut buf)?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let name = get_str(&mut buf)?;
            let sig = get_str(&mut buf)?;
            let max_locals = get_u16(&mut buf)?;
            let max_stack = get_u16(&mut buf)?;
            let insn_count = get_u32(&mut buf)?;
            let mut insns = Vec::with_capacity(insn_count as usize);
            for _ in 0..insn_count {
                insns.push(decode_insn(&mut buf)?);
            }
            methods.push(MethodBody {
                name,
                sig,
                max_locals,
                max_stack,
                insns,
            });
        }
        Ok(CodeUnit { owner, methods })
    }

    /// Read only the owner type name from an encoded unit.
    pub fn peek_owner(bytes: &[u8]) -> Result<String, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        decode_header(&mut buf)
    }
}

fn decode_header(buf: &mut Bytes) -> Result<String, Error> {
    if buf.remaining() < UNIT_MAGIC.len() {
        return Err(Error::Truncated);
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != UNIT_MAGIC {
        return Err(Error::BadMagic);
    }
    let version = get_u16(buf)?;
    if version != UNIT_VERSION {
        return Err(Error::Version(version));
    }
    get_str(buf)
}

mod op {
    pub const CONST: u8 = 0;
    pub const LOAD: u8 = 1;
    pub const STORE: u8 = 2;
    pub const ARRAY_LOAD: u8 = 3;
    pub const ARRAY_STORE: u8 = 4;
    pub const FIELD_GET: u8 = 5;
    pub const FIELD_SET: u8 = 6;
    pub const CALL: u8 = 7;
    pub const JUMP: u8 = 8;
    pub const JUMP_IF_ZERO: u8 = 9;
    pub const LABEL: u8 = 10;
    pub const LINE: u8 = 11;
    pub const MONITOR_ENTER: u8 = 12;
    pub const MONITOR_EXIT: u8 = 13;
    pub const RETURN: u8 = 14;
    pub const THROW: u8 = 15;
}

fn encode_insn(buf: &mut BytesMut, insn: &Insn) {
    match insn {
        Insn::Const(v) => {
            buf.put_u8(op::CONST);
            buf.put_i64(*v);
        }
        Insn::Load(slot) => {
            buf.put_u8(op::LOAD);
            buf.put_u16(*slot);
        }
        Insn::Store(slot) => {
            buf.put_u8(op::STORE);
            buf.put_u16(*slot);
        }
        Insn::ArrayLoad { elem } => {
            buf.put_u8(op::ARRAY_LOAD);
            put_str(buf, elem);
        }
        Insn::ArrayStore { elem } => {
            buf.put_u8(op::ARRAY_STORE);
            put_str(buf, elem);
        }
        Insn::FieldGet {
            owner,
            field,
            value_type,
        } => {
            buf.put_u8(op::FIELD_GET);
            put_str(buf, owner);
            put_str(buf, field);
            put_str(buf, value_type);
        }
        Insn::FieldSet {
            owner,
            field,
            value_type,
        } => {
            buf.put_u8(op::FIELD_SET);
            put_str(buf, owner);
            put_str(buf, field);
            put_str(buf, value_type);
        }
        Insn::Call { owner, name, sig } => {
            buf.put_u8(op::CALL);
            put_str(buf, owner);
            put_str(buf, name);
            put_str(buf, sig);
        }
        Insn::Jump { target } => {
            buf.put_u8(op::JUMP);
            buf.put_u32(*target);
        }
        Insn::JumpIfZero { target } => {
            buf.put_u8(op::JUMP_IF_ZERO);
            buf.put_u32(*target);
        }
        Insn::Label(id) => {
            buf.put_u8(op::LABEL);
            buf.put_u32(*id);
        }
        Insn::Line(n) => {
            buf.put_u8(op::LINE);
            buf.put_u32(*n);
        }
        Insn::MonitorEnter => buf.put_u8(op::MONITOR_ENTER),
        Insn::MonitorExit => buf.put_u8(op::MONITOR_EXIT),
        Insn::Return => buf.put_u8(op::RETURN),
        Insn::Throw => buf.put_u8(op::THROW),
    }
}

fn decode_insn(buf: &mut Bytes) -> Result<Insn, Error> {
    let tag = get_u8(buf)?;
    let insn = match tag {
        op::CONST => Insn::Const(get_i64(buf)?),
        op::LOAD => Insn::Load(get_u16(buf)?),
        op::STORE => Insn::Store(get_u16(buf)?),
        op::ARRAY_LOAD => Insn::ArrayLoad {
            elem: get_str(buf)?,
        },
        op::ARRAY_STORE => Insn::ArrayStore {
            elem: get_str(buf)?,
        },
        op::FIELD_GET => Insn::FieldGet {
            owner: get_str(buf)?,
            field: get_str(buf)?,
            value_type: get_str(buf)?,
        },
        op::FIELD_SET => Insn::FieldSet {
            owner: get_str(buf)?,
            field: get_str(buf)?,
            value_type: get_str(buf)?,
        },
        op::CALL => Insn::Call {
            owner: get_str(buf)?,
            name: get_str(buf)?,
            sig: get_str(buf)?,
        },
        op::JUMP => Insn::Jump {
            target: get_u32(buf)?,
        },
        op::JUMP_IF_ZERO => Insn::JumpIfZero {
            target: get_u32(buf)?,
        },
        op::LABEL => Insn::Label(get_u32(buf)?),
        op::LINE => Insn::Line(get_u32(buf)?),
        op::MONITOR_ENTER => Insn::MonitorEnter,
        op::MONITOR_EXIT => Insn::MonitorExit,
        op::RETURN => Insn::Return,
        op::THROW => Insn::Throw,
        unknown => return Err(Error::UnknownOpcode(unknown)),
    };
    Ok(insn)
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Result<String, Error> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Truncated);
    }
    let raw = buf.copy_to_bytes(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

fn get_u8(buf: &mut Bytes) -> Result<u8, Error> {
    if buf.remaining() < 1 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, Error> {
    if buf.remaining() < 2 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, Error> {
    if buf.remaining() < 4 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_i64(buf: &mut Bytes) -> Result<i64, Error> {
    if buf.remaining() < 8 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_i64())
}

/// Kind of structural point reached during a rewrite pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MethodEntry,
    MethodReturn,
    ArrayAccess(Access),
    FieldAccess(Access),
    Sync(SyncOp),
    Throw,
    Line,
}

/// Transient description of one structural point reached during a rewrite
/// pass. Borrowed from the method body under rewrite, never persisted.
#[derive(Debug, Clone)]
pub struct InsnEvent<'a> {
    pub kind: EventKind,
    /// Type owning the method under rewrite.
    pub owner: &'a str,
    pub method: &'a str,
    pub sig: &'a str,
    /// Accessed member name (field name, or the method name itself for
    /// entry/return events). Empty when the point has no member.
    pub member: &'a str,
    /// Value type moved by the instruction (array element or field type).
    /// Empty when the point carries none.
    pub value_type: &'a str,
    /// Last line marker seen before this point.
    pub line: u32,
}

/// Derive the structural event for an instruction, if it produces one.
pub fn event_for<'a>(
    insn: &'a Insn,
    owner: &'a str,
    body: &'a MethodBody,
    line: u32,
) -> Option<InsnEvent<'a>> {
    let (kind, member, value_type, line) = match insn {
        Insn::ArrayLoad { elem } => (EventKind::ArrayAccess(Access::Load), "", elem.as_str(), line),
        Insn::ArrayStore { elem } => {
            (EventKind::ArrayAccess(Access::Store), "", elem.as_str(), line)
        }
        Insn::FieldGet {
            field, value_type, ..
        } => (
            EventKind::FieldAccess(Access::Load),
            field.as_str(),
            value_type.as_str(),
            line,
        ),
        Insn::FieldSet {
            field, value_type, ..
        } => (
            EventKind::FieldAccess(Access::Store),
            field.as_str(),
            value_type.as_str(),
            line,
        ),
        Insn::MonitorEnter => (EventKind::Sync(SyncOp::Enter), "", "", line),
        Insn::MonitorExit => (EventKind::Sync(SyncOp::Exit), "", "", line),
        Insn::Return => (EventKind::MethodReturn, body.name.as_str(), "", line),
        Insn::Throw => (EventKind::Throw, "", "", line),
        Insn::Line(n) => (EventKind::Line, "", "", *n),
        _ => return None,
    };
    Some(InsnEvent {
        kind,
        owner,
        method: &body.name,
        sig: &body.sig,
        member,
        value_type,
        line,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_unit() -> CodeUnit {
        CodeUnit {
            owner: "acme/Storage".to_string(),
            methods: vec![MethodBody {
                name: "put".to_string(),
                sig: "(II)V".to_string(),
                max_locals: 3,
                max_stack: 4,
                insns: vec![
                    Insn::Line(10),
                    Insn::Load(0),
                    Insn::Load(1),
                    Insn::Const(42),
                    Insn::ArrayStore {
                        elem: "int".to_string(),
                    },
                    Insn::Label(1),
                    Insn::Load(2),
                    Insn::JumpIfZero { target: 1 },
                    Insn::FieldGet {
                        owner: "acme/Storage".to_string(),
                        field: "size".to_string(),
                        value_type: "int".to_string(),
                    },
                    Insn::Store(2),
                    Insn::Call {
                        owner: "acme/Storage".to_string(),
                        name: "grow".to_string(),
                        sig: "(I)V".to_string(),
                    },
                    Insn::Return,
                ],
            }],
        }
    }

    #[test]
    fn test_unit_codec_round_trip() {
        let unit = sample_unit();
        let bytes = unit.encode();
        let decoded = CodeUnit::decode(&bytes).unwrap();
        assert_eq!(unit, decoded);
        assert_eq!(CodeUnit::peek_owner(&bytes).unwrap(), "acme/Storage");
    }

    #[test]
    fn test_unit_decode_rejects_garbage() {
        assert!(matches!(
            CodeUnit::decode(b"XXXX0000"),
            Err(Error::BadMagic)
        ));
        assert!(matches!(CodeUnit::decode(b"TW"), Err(Error::Truncated)));

        let mut bytes = sample_unit().encode();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(CodeUnit::decode(&bytes), Err(Error::Truncated)));

        // format version from the future
        let mut bytes = sample_unit().encode();
        bytes[4] = 0xff;
        assert!(matches!(
            CodeUnit::decode(&bytes),
            Err(Error::Version(0xff01))
        ));
    }

    #[test]
    fn test_unit_decode_rejects_unknown_opcode() {
        let unit = CodeUnit {
            owner: "T".to_string(),
            methods: vec![MethodBody {
                name: "m".to_string(),
                sig: "()V".to_string(),
                max_locals: 0,
                max_stack: 0,
                insns: vec![Insn::Return],
            }],
        };
        let mut bytes = unit.encode();
        let last = bytes.len() - 1;
        bytes[last] = 0xAB;
        assert!(matches!(
            CodeUnit::decode(&bytes),
            Err(Error::UnknownOpcode(0xAB))
        ));
    }

    #[test]
    fn test_call_stack_effect() {
        struct TestCase {
            sig: &'static str,
            effect: i32,
        }
        let cases = [
            TestCase {
                sig: "()V",
                effect: 0,
            },
            TestCase {
                sig: "()I",
                effect: 1,
            },
            TestCase {
                sig: "(I)V",
                effect: -1,
            },
            TestCase {
                sig: "(II)I",
                effect: -1,
            },
            TestCase {
                sig: "no-args",
                effect: 0,
            },
        ];
        for case in cases {
            let insn = Insn::Call {
                owner: "o".to_string(),
                name: "n".to_string(),
                sig: case.sig.to_string(),
            };
            assert_eq!(insn.stack_effect(), case.effect, "sig {}", case.sig);
        }
    }
}
