use crate::weaver::insn::{EventKind, InsnEvent};
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Kind of instrumentation point a descriptor selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, IntoStaticStr)]
pub enum LocationKind {
    #[strum(serialize = "method-entry")]
    MethodEntry,
    #[strum(serialize = "method-return")]
    MethodReturn,
    #[strum(serialize = "array-access")]
    ArrayAccess,
    #[strum(serialize = "field-access")]
    FieldAccess,
    #[strum(serialize = "sync")]
    Sync,
    #[strum(serialize = "line")]
    Line,
    #[strum(serialize = "error")]
    Error,
}

impl LocationKind {
    fn covers(self, event: EventKind) -> bool {
        matches!(
            (self, event),
            (LocationKind::MethodEntry, EventKind::MethodEntry)
                | (LocationKind::MethodReturn, EventKind::MethodReturn)
                | (LocationKind::ArrayAccess, EventKind::ArrayAccess(_))
                | (LocationKind::FieldAccess, EventKind::FieldAccess(_))
                | (LocationKind::Sync, EventKind::Sync(_))
                | (LocationKind::Error, EventKind::Throw)
                | (LocationKind::Line, EventKind::Line)
        )
    }

    /// True for kinds where the type filter may also match the value type
    /// moved by the instruction, not only the owning type.
    fn matches_value_type(self) -> bool {
        matches!(self, LocationKind::ArrayAccess | LocationKind::FieldAccess)
    }
}

/// Hook position relative to the matched instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, IntoStaticStr)]
pub enum Where {
    #[strum(serialize = "before")]
    Before,
    #[strum(serialize = "after")]
    After,
}

/// Declarative instrumentation-point descriptor. Parsed once per client
/// script; empty filters are wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationDescriptor {
    pub kind: LocationKind,
    pub type_filter: String,
    pub member_filter: String,
    pub r#where: Where,
}

impl LocationDescriptor {
    /// Exact-equality match of a descriptor against a structural point.
    pub fn matches(&self, event: &InsnEvent, at: Where) -> bool {
        if self.r#where != at || !self.kind.covers(event.kind) {
            return false;
        }
        if !self.type_filter.is_empty()
            && self.type_filter != event.owner
            && !(self.kind.matches_value_type() && self.type_filter == event.value_type)
        {
            return false;
        }
        if !self.member_filter.is_empty() && self.member_filter != event.member {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::weaver::insn::Access;

    fn event(kind: EventKind, member: &'static str, value_type: &'static str) -> InsnEvent<'static> {
        InsnEvent {
            kind,
            owner: "acme/Storage",
            method: "put",
            sig: "(II)V",
            member,
            value_type,
            line: 0,
        }
    }

    fn descriptor(
        kind: LocationKind,
        type_filter: &str,
        member_filter: &str,
        r#where: Where,
    ) -> LocationDescriptor {
        LocationDescriptor {
            kind,
            type_filter: type_filter.to_string(),
            member_filter: member_filter.to_string(),
            r#where,
        }
    }

    #[test]
    fn test_matching() {
        struct TestCase {
            descriptor: LocationDescriptor,
            event: InsnEvent<'static>,
            at: Where,
            matched: bool,
        }
        let cases = [
            // wildcard filters match every event of the kind
            TestCase {
                descriptor: descriptor(LocationKind::ArrayAccess, "", "", Where::Before),
                event: event(EventKind::ArrayAccess(Access::Store), "", "int"),
                at: Where::Before,
                matched: true,
            },
            // kind mismatch is never a match, whatever the filters say
            TestCase {
                descriptor: descriptor(LocationKind::MethodEntry, "", "", Where::Before),
                event: event(EventKind::ArrayAccess(Access::Load), "", "int"),
                at: Where::Before,
                matched: false,
            },
            // hook position must agree
            TestCase {
                descriptor: descriptor(LocationKind::ArrayAccess, "", "", Where::After),
                event: event(EventKind::ArrayAccess(Access::Load), "", "int"),
                at: Where::Before,
                matched: false,
            },
            // type filter against the owning type
            TestCase {
                descriptor: descriptor(LocationKind::FieldAccess, "acme/Storage", "", Where::Before),
                event: event(EventKind::FieldAccess(Access::Load), "size", "int"),
                at: Where::Before,
                matched: true,
            },
            // type filter against the moved value type
            TestCase {
                descriptor: descriptor(LocationKind::FieldAccess, "int", "", Where::Before),
                event: event(EventKind::FieldAccess(Access::Load), "size", "int"),
                at: Where::Before,
                matched: true,
            },
            TestCase {
                descriptor: descriptor(LocationKind::FieldAccess, "float", "", Where::Before),
                event: event(EventKind::FieldAccess(Access::Load), "size", "int"),
                at: Where::Before,
                matched: false,
            },
            // member filter is exact
            TestCase {
                descriptor: descriptor(LocationKind::FieldAccess, "", "size", Where::Before),
                event: event(EventKind::FieldAccess(Access::Store), "size", "int"),
                at: Where::Before,
                matched: true,
            },
            TestCase {
                descriptor: descriptor(LocationKind::FieldAccess, "", "len", Where::Before),
                event: event(EventKind::FieldAccess(Access::Store), "size", "int"),
                at: Where::Before,
                matched: false,
            },
            // value type never substitutes for the owner outside array/field kinds
            TestCase {
                descriptor: descriptor(LocationKind::MethodReturn, "int", "", Where::After),
                event: event(EventKind::MethodReturn, "put", ""),
                at: Where::After,
                matched: false,
            },
        ];

        for (i, case) in cases.iter().enumerate() {
            assert_eq!(
                case.descriptor.matches(&case.event, case.at),
                case.matched,
                "case {i}"
            );
        }
    }

    #[test]
    fn test_kind_string_forms() {
        assert_eq!(
            "array-access".parse::<LocationKind>().unwrap(),
            LocationKind::ArrayAccess
        );
        assert_eq!(LocationKind::MethodEntry.to_string(), "method-entry");
        assert!("arrayaccess".parse::<LocationKind>().is_err());
        assert_eq!("after".parse::<Where>().unwrap(), Where::After);
    }
}
