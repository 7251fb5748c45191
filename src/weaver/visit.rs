use crate::weaver::error::Error;
use crate::weaver::insn::{Insn, InsnEvent, Slot};
use crate::weaver::location::{LocationDescriptor, Where};
use crate::weaver::template;
use smallvec::SmallVec;

/// Allocates fresh local slots above the original method locals, so
/// instrumentation never clobbers a live slot.
pub struct SlotAlloc {
    next: u32,
    high: u32,
}

impl SlotAlloc {
    pub fn new(max_locals: Slot) -> Self {
        Self {
            next: max_locals as u32,
            high: max_locals as u32,
        }
    }

    pub fn alloc(&mut self, method: &str) -> Result<Slot, Error> {
        if self.next > Slot::MAX as u32 {
            return Err(Error::SlotOverflow(method.to_string()));
        }
        let slot = self.next as Slot;
        self.next += 1;
        self.high = self.high.max(self.next);
        Ok(slot)
    }

    /// Slot count the rewritten body needs, saturating at the slot limit.
    pub fn high_water(&self) -> Slot {
        self.high.min(Slot::MAX as u32) as Slot
    }
}

/// Emission buffer a visitor writes instrumentation fragments into.
/// Fragments are spliced around the original instruction by the pass;
/// most events emit a single marker, so the buffer lives inline.
#[derive(Default)]
pub struct Assembler {
    insns: SmallVec<[Insn; 4]>,
}

impl Assembler {
    pub fn emit(&mut self, insn: Insn) -> &mut Self {
        self.insns.push(insn);
        self
    }

    pub fn call(&mut self, owner: &str, name: &str, sig: &str) -> &mut Self {
        self.emit(Insn::Call {
            owner: owner.to_string(),
            name: name.to_string(),
            sig: sig.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn take(&mut self) -> SmallVec<[Insn; 4]> {
        std::mem::take(&mut self.insns)
    }
}

/// Capability set of a rewrite visitor: a before and an after hook per
/// structural event kind. Behavior is composed from an ordered list of
/// visitors, one hook invocation per matched descriptor, never from
/// subclassing.
#[allow(unused_variables)]
pub trait InsnVisitor {
    fn before_method_entry(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_method_entry(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_method_return(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_method_return(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_array_load(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_array_load(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_array_store(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_array_store(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_field_get(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_field_get(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_field_set(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_field_set(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_sync_enter(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_sync_enter(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_sync_exit(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_sync_exit(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_throw(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_throw(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn before_line(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
    fn after_line(&mut self, ev: &InsnEvent, asm: &mut Assembler) {}
}

/// Route a structural event to the matching capability of a visitor.
pub fn dispatch(v: &mut dyn InsnVisitor, ev: &InsnEvent, at: Where, asm: &mut Assembler) {
    use crate::weaver::insn::{Access, EventKind, SyncOp};
    match (ev.kind, at) {
        (EventKind::MethodEntry, Where::Before) => v.before_method_entry(ev, asm),
        (EventKind::MethodEntry, Where::After) => v.after_method_entry(ev, asm),
        (EventKind::MethodReturn, Where::Before) => v.before_method_return(ev, asm),
        (EventKind::MethodReturn, Where::After) => v.after_method_return(ev, asm),
        (EventKind::ArrayAccess(Access::Load), Where::Before) => v.before_array_load(ev, asm),
        (EventKind::ArrayAccess(Access::Load), Where::After) => v.after_array_load(ev, asm),
        (EventKind::ArrayAccess(Access::Store), Where::Before) => v.before_array_store(ev, asm),
        (EventKind::ArrayAccess(Access::Store), Where::After) => v.after_array_store(ev, asm),
        (EventKind::FieldAccess(Access::Load), Where::Before) => v.before_field_get(ev, asm),
        (EventKind::FieldAccess(Access::Load), Where::After) => v.after_field_get(ev, asm),
        (EventKind::FieldAccess(Access::Store), Where::Before) => v.before_field_set(ev, asm),
        (EventKind::FieldAccess(Access::Store), Where::After) => v.after_field_set(ev, asm),
        (EventKind::Sync(SyncOp::Enter), Where::Before) => v.before_sync_enter(ev, asm),
        (EventKind::Sync(SyncOp::Enter), Where::After) => v.after_sync_enter(ev, asm),
        (EventKind::Sync(SyncOp::Exit), Where::Before) => v.before_sync_exit(ev, asm),
        (EventKind::Sync(SyncOp::Exit), Where::After) => v.after_sync_exit(ev, asm),
        (EventKind::Throw, Where::Before) => v.before_throw(ev, asm),
        (EventKind::Throw, Where::After) => v.after_throw(ev, asm),
        (EventKind::Line, Where::Before) => v.before_line(ev, asm),
        (EventKind::Line, Where::After) => v.after_line(ev, asm),
    }
}

/// The standard hook compiled from one location descriptor. On a matched
/// point it emits a single template marker; the expander turns markers
/// into concrete fragments later in the pass.
pub struct TraceHook {
    descriptor: LocationDescriptor,
    tag: String,
}

impl TraceHook {
    pub fn new(descriptor: LocationDescriptor, tag: String) -> Self {
        Self { descriptor, tag }
    }

    fn hit(&mut self, ev: &InsnEvent, at: Where, asm: &mut Assembler) {
        if self.descriptor.matches(ev, at) {
            asm.emit(template::marker(ev.kind, &self.tag));
        }
    }
}

impl InsnVisitor for TraceHook {
    fn before_method_entry(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_method_entry(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_method_return(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_method_return(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_array_load(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_array_load(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_array_store(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_array_store(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_field_get(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_field_get(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_field_set(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_field_set(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_sync_enter(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_sync_enter(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_sync_exit(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_sync_exit(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_throw(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_throw(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
    fn before_line(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::Before, asm)
    }
    fn after_line(&mut self, ev: &InsnEvent, asm: &mut Assembler) {
        self.hit(ev, Where::After, asm)
    }
}
