use crate::weaver::error::Error;
use crate::weaver::insn::{event_for, CodeUnit, Insn, InsnEvent, MethodBody};
use crate::weaver::location::{LocationDescriptor, LocationKind, Where};
use crate::weaver::template::{ExpandCtx, TemplateExpander};
use crate::weaver::visit::{dispatch, Assembler, SlotAlloc, TraceHook};
use itertools::Itertools;

/// One probe of a client script: a location descriptor plus the tag that
/// identifies it in emitted trace calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub location: LocationDescriptor,
    pub tag: String,
}

/// The ordered hook list applied to one method body for one client.
/// Built right before the pass, discarded with it.
pub struct RewriteChain {
    hooks: Vec<TraceHook>,
}

impl RewriteChain {
    /// Compile the probes that can possibly fire inside `method` into a
    /// hook chain, preserving registration order. Entry/return probes are
    /// prefiltered against the method identity; probes over member
    /// accesses stay in and match per event, since the types they touch
    /// are only known at each instruction.
    pub fn build(probes: &[Probe], owner: &str, method: &MethodBody) -> RewriteChain {
        let hooks = probes
            .iter()
            .filter(|p| applies_to_method(&p.location, owner, method))
            .map(|p| TraceHook::new(p.location.clone(), p.tag.clone()))
            .collect_vec();
        RewriteChain { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn run(&mut self, ev: &InsnEvent, at: Where, asm: &mut Assembler) {
        for hook in &mut self.hooks {
            dispatch(hook, ev, at, asm);
        }
    }
}

fn applies_to_method(loc: &LocationDescriptor, owner: &str, method: &MethodBody) -> bool {
    match loc.kind {
        LocationKind::MethodEntry | LocationKind::MethodReturn => {
            (loc.type_filter.is_empty() || loc.type_filter == owner)
                && (loc.member_filter.is_empty() || loc.member_filter == method.name)
        }
        _ => true,
    }
}

/// Rewrite one method body against a client's probe set.
///
/// Returns `None` when no hook fired; the caller keeps the original body.
/// Hooks only ever observe the original instruction stream: fragments
/// emitted by earlier hooks are routed through the expander straight into
/// the output and never produce events of their own.
pub fn rewrite_method(
    owner: &str,
    body: &MethodBody,
    probes: &[Probe],
) -> Result<Option<MethodBody>, Error> {
    let mut chain = RewriteChain::build(probes, owner, body);
    if chain.is_empty() {
        return Ok(None);
    }

    let mut slots = SlotAlloc::new(body.max_locals);
    let mut ctx = ExpandCtx {
        owner,
        method: &body.name,
        slots: &mut slots,
    };
    let mut expander = TemplateExpander::standard();
    let mut asm = Assembler::default();
    let mut out = Vec::with_capacity(body.insns.len());
    let mut touched = false;
    let mut line = 0u32;

    // method entry fires once, ahead of the first instruction
    let entry = InsnEvent {
        kind: crate::weaver::insn::EventKind::MethodEntry,
        owner,
        method: &body.name,
        sig: &body.sig,
        member: &body.name,
        value_type: "",
        line,
    };
    chain.run(&entry, Where::Before, &mut asm);
    chain.run(&entry, Where::After, &mut asm);
    touched |= flush(&mut asm, &mut expander, &mut ctx, &mut out)?;

    for insn in &body.insns {
        if let Insn::Line(n) = insn {
            line = *n;
        }
        let Some(ev) = event_for(insn, owner, body, line) else {
            expander.process(insn.clone(), &mut ctx, &mut out)?;
            continue;
        };

        chain.run(&ev, Where::Before, &mut asm);
        if insn.is_terminal() {
            // a fragment placed behind a terminal would be unreachable;
            // after-hooks of return/throw land ahead of the instruction,
            // following the before-hooks
            chain.run(&ev, Where::After, &mut asm);
            touched |= flush(&mut asm, &mut expander, &mut ctx, &mut out)?;
            expander.process(insn.clone(), &mut ctx, &mut out)?;
        } else {
            touched |= flush(&mut asm, &mut expander, &mut ctx, &mut out)?;
            expander.process(insn.clone(), &mut ctx, &mut out)?;
            chain.run(&ev, Where::After, &mut asm);
            touched |= flush(&mut asm, &mut expander, &mut ctx, &mut out)?;
        }
    }

    if !touched {
        return Ok(None);
    }

    let max_locals = slots.high_water();
    let max_stack = max_stack_of(&out).max(body.max_stack);
    Ok(Some(MethodBody {
        name: body.name.clone(),
        sig: body.sig.clone(),
        max_locals,
        max_stack,
        insns: out,
    }))
}

fn flush(
    asm: &mut Assembler,
    expander: &mut TemplateExpander,
    ctx: &mut ExpandCtx,
    out: &mut Vec<Insn>,
) -> Result<bool, Error> {
    if asm.is_empty() {
        return Ok(false);
    }
    for insn in asm.take() {
        expander.process(insn, ctx, out)?;
    }
    Ok(true)
}

/// Rewrite a whole decoded unit for one client. The unit is only mutated
/// when every touched method rewrites cleanly; a failure leaves it as the
/// caller handed it in.
pub fn rewrite_unit(owner: &str, unit: &mut CodeUnit, probes: &[Probe]) -> Result<bool, Error> {
    let mut staged: Vec<(usize, MethodBody)> = Vec::new();
    for (idx, method) in unit.methods.iter().enumerate() {
        if let Some(rewritten) = rewrite_method(owner, method, probes)? {
            staged.push((idx, rewritten));
        }
    }
    let changed = !staged.is_empty();
    for (idx, rewritten) in staged {
        unit.methods[idx] = rewritten;
    }
    Ok(changed)
}

/// Worst-case operand stack depth over a linear scan. Depth is clamped at
/// zero where control merges make the linear estimate undershoot; the
/// result only ever grows against the original.
fn max_stack_of(insns: &[Insn]) -> u16 {
    let mut depth: i32 = 0;
    let mut max: i32 = 0;
    for insn in insns {
        depth = (depth + insn.stack_effect()).max(0);
        max = max.max(depth);
    }
    max.min(u16::MAX as i32) as u16
}
