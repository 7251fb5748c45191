use std::time::{Duration, Instant};
use traceweaver::weaver::insn::{CodeUnit, Insn, MethodBody};
use traceweaver::weaver::template::RT_OWNER;

pub fn method(name: &str, insns: Vec<Insn>) -> MethodBody {
    MethodBody {
        name: name.to_string(),
        sig: "()V".to_string(),
        max_locals: 1,
        max_stack: 1,
        insns,
    }
}

/// A unit whose methods all carry the same trivial body.
pub fn simple_unit(owner: &str, methods: &[&str]) -> CodeUnit {
    CodeUnit {
        owner: owner.to_string(),
        methods: methods
            .iter()
            .map(|name| method(name, vec![Insn::Const(1), Insn::Return]))
            .collect(),
    }
}

/// Names of the trace-runtime calls woven into a method body.
pub fn rt_call_names(body: &MethodBody) -> Vec<String> {
    body.insns
        .iter()
        .filter_map(|insn| match insn {
            Insn::Call { owner, name, .. } if owner == RT_OWNER => Some(name.clone()),
            _ => None,
        })
        .collect()
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
