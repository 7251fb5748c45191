//! Stateful template expansion.
//!
//! Hooks do not emit trace sequences directly. They emit *markers* (calls
//! against the reserved hook owner), and every instruction of the pass
//! flows through a [`TemplateExpander`] that substitutes a concrete
//! fragment for each marker. Keeping the substitution in one state
//! machine lets a single hook expand into different sequences depending
//! on what the expander has already seen on the current code path.

use crate::weaver::error::Error;
use crate::weaver::insn::{Access, EventKind, Insn, Slot, SyncOp};
use crate::weaver::visit::SlotAlloc;

/// Owner name reserved for template markers. Never survives expansion.
pub const HOOK_OWNER: &str = "traceweaver/hook";

/// Owner name of the trace runtime that rewritten code calls into.
pub const RT_OWNER: &str = "traceweaver/rt";

const ENTRY_TEMPLATE: &str = "entry";
const RETURN_TEMPLATE: &str = "ret";

/// Build the marker instruction a hook emits for a structural point.
/// The probe tag rides in the signature field.
pub fn marker(kind: EventKind, tag: &str) -> Insn {
    let name = match kind {
        EventKind::MethodEntry => ENTRY_TEMPLATE,
        EventKind::MethodReturn => RETURN_TEMPLATE,
        EventKind::ArrayAccess(Access::Load) => "array-load",
        EventKind::ArrayAccess(Access::Store) => "array-store",
        EventKind::FieldAccess(Access::Load) => "field-get",
        EventKind::FieldAccess(Access::Store) => "field-set",
        EventKind::Sync(SyncOp::Enter) => "sync-enter",
        EventKind::Sync(SyncOp::Exit) => "sync-exit",
        EventKind::Throw => "throw",
        EventKind::Line => "line",
    };
    Insn::Call {
        owner: HOOK_OWNER.to_string(),
        name: name.to_string(),
        sig: tag.to_string(),
    }
}

/// A marker recognized in the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCall {
    pub name: String,
    pub tag: String,
}

impl TemplateCall {
    pub fn from_insn(insn: &Insn) -> Option<TemplateCall> {
        match insn {
            Insn::Call { owner, name, sig } if owner == HOOK_OWNER => Some(TemplateCall {
                name: name.clone(),
                tag: sig.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Expansion {
    /// The rule has nothing to say; the instruction passes through.
    Ignored,
    /// Replace the instruction with this fragment.
    Expanded(Vec<Insn>),
}

/// Identity of the body under rewrite plus fresh slot allocation,
/// available to rules while they expand.
pub struct ExpandCtx<'a> {
    pub owner: &'a str,
    pub method: &'a str,
    pub slots: &'a mut SlotAlloc,
}

/// A named expansion rule. Rules hold per-pass state describing the code
/// *shape* built so far; [`TemplateRule::reset`] rolls it back to the
/// initial state at the end of every code path.
pub trait TemplateRule {
    fn name(&self) -> &'static str;
    fn expand(&mut self, tpl: Option<&TemplateCall>, ctx: &mut ExpandCtx)
        -> Result<Expansion, Error>;
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    Idle,
    TrackingEntry { token_slot: Slot },
}

/// Expands entry/return markers and tracks whether an entry sequence was
/// already emitted on the current code path. A second entry marker on the
/// same path expands to nothing, so re-entrant return paths cannot emit
/// duplicate entry sequences; a return marker picks up the entry token
/// when one exists.
pub struct MethodTrackingRule {
    state: TrackState,
}

impl MethodTrackingRule {
    pub fn new() -> Self {
        Self {
            state: TrackState::Idle,
        }
    }
}

impl Default for MethodTrackingRule {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRule for MethodTrackingRule {
    fn name(&self) -> &'static str {
        "method-tracking"
    }

    fn expand(
        &mut self,
        tpl: Option<&TemplateCall>,
        ctx: &mut ExpandCtx,
    ) -> Result<Expansion, Error> {
        let Some(tpl) = tpl else {
            return Ok(Expansion::Ignored);
        };
        match tpl.name.as_str() {
            ENTRY_TEMPLATE => match self.state {
                TrackState::Idle => {
                    let token_slot = ctx.slots.alloc(ctx.method)?;
                    self.state = TrackState::TrackingEntry { token_slot };
                    Ok(Expansion::Expanded(vec![
                        Insn::Call {
                            owner: RT_OWNER.to_string(),
                            name: format!("{ENTRY_TEMPLATE}${}", tpl.tag),
                            sig: "()I".to_string(),
                        },
                        Insn::Store(token_slot),
                    ]))
                }
                // entry already fired on this path, suppress the duplicate
                TrackState::TrackingEntry { .. } => Ok(Expansion::Expanded(Vec::new())),
            },
            RETURN_TEMPLATE => match self.state {
                TrackState::Idle => Ok(Expansion::Expanded(vec![Insn::Call {
                    owner: RT_OWNER.to_string(),
                    name: format!("{RETURN_TEMPLATE}${}", tpl.tag),
                    sig: "()V".to_string(),
                }])),
                TrackState::TrackingEntry { token_slot } => Ok(Expansion::Expanded(vec![
                    Insn::Load(token_slot),
                    Insn::Call {
                        owner: RT_OWNER.to_string(),
                        name: format!("{RETURN_TEMPLATE}${}", tpl.tag),
                        sig: "(I)V".to_string(),
                    },
                ])),
            },
            _ => Ok(Expansion::Ignored),
        }
    }

    fn reset(&mut self) {
        self.state = TrackState::Idle;
    }
}

/// Fallback rule: any marker not claimed by a stateful rule expands into
/// a plain call against the trace runtime.
pub struct ProbeEmitRule;

impl TemplateRule for ProbeEmitRule {
    fn name(&self) -> &'static str {
        "probe-emit"
    }

    fn expand(
        &mut self,
        tpl: Option<&TemplateCall>,
        _ctx: &mut ExpandCtx,
    ) -> Result<Expansion, Error> {
        let Some(tpl) = tpl else {
            return Ok(Expansion::Ignored);
        };
        Ok(Expansion::Expanded(vec![Insn::Call {
            owner: RT_OWNER.to_string(),
            name: format!("{}${}", tpl.name, tpl.tag),
            sig: "()V".to_string(),
        }]))
    }

    fn reset(&mut self) {}
}

/// The per-pass expansion state machine. Consulted for every instruction
/// the pass emits; terminal instructions reset all rules so state never
/// leaks from one code path into the next.
pub struct TemplateExpander {
    rules: Vec<Box<dyn TemplateRule>>,
    last_ignored: bool,
    expanding: bool,
}

impl TemplateExpander {
    pub fn new(rules: Vec<Box<dyn TemplateRule>>) -> Self {
        Self {
            rules,
            last_ignored: true,
            expanding: false,
        }
    }

    /// The rule set every rewrite pass starts from.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(MethodTrackingRule::new()),
            Box::new(ProbeEmitRule),
        ])
    }

    /// Run one instruction through the expander, appending the outcome
    /// (the instruction itself, or its expansion) to `out`.
    pub fn process(
        &mut self,
        insn: Insn,
        ctx: &mut ExpandCtx,
        out: &mut Vec<Insn>,
    ) -> Result<(), Error> {
        let tpl = TemplateCall::from_insn(&insn);
        match self.expand(tpl.as_ref(), ctx)? {
            Expansion::Ignored => {
                if insn.is_terminal() && !self.expanding {
                    self.reset();
                }
                out.push(insn);
            }
            Expansion::Expanded(fragment) => {
                // expanded output re-enters the pipeline, but nested
                // markers are refused by the recursion guard
                self.expanding = true;
                let res = fragment
                    .into_iter()
                    .try_for_each(|f| self.process(f, ctx, out));
                self.expanding = false;
                res?;
            }
        }
        Ok(())
    }

    fn expand(
        &mut self,
        tpl: Option<&TemplateCall>,
        ctx: &mut ExpandCtx,
    ) -> Result<Expansion, Error> {
        if self.expanding {
            return Ok(Expansion::Ignored);
        }
        if tpl.is_none() && self.last_ignored {
            // nothing to expand and no rule mid-flight, skip rule scan
            return Ok(Expansion::Ignored);
        }
        for rule in &mut self.rules {
            match rule.expand(tpl, ctx)? {
                Expansion::Ignored => continue,
                expanded => {
                    self.last_ignored = false;
                    return Ok(expanded);
                }
            }
        }
        self.last_ignored = true;
        Ok(Expansion::Ignored)
    }

    fn reset(&mut self) {
        for rule in &mut self.rules {
            rule.reset();
        }
    }
}
