use crate::common::{rt_call_names, simple_unit};
use std::sync::Arc;
use traceweaver::agent::Agent;
use traceweaver::host::InMemoryHost;
use traceweaver::settings::Settings;
use traceweaver::weaver::chain::{Probe, RewriteChain};
use traceweaver::weaver::insn::CodeUnit;
use traceweaver::weaver::location::{LocationDescriptor, LocationKind, Where};

fn local_settings() -> Settings {
    let mut settings = Settings::default();
    settings.no_server = true;
    settings.stdout = true;
    settings
}

fn agent_with_script(script: &str, settings: Settings) -> (Arc<Agent>, Arc<InMemoryHost>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.twv");
    std::fs::write(&path, script).unwrap();
    let mut settings = settings;
    settings.scripts = vec![path.display().to_string()];

    let host = Arc::new(InMemoryHost::new());
    let agent = Arc::new(Agent::new(settings, host.clone()));
    agent.start().unwrap();
    (agent, host)
}

const ENTRY_SCRIPT: &str = r#"
name = "entry-trace"

[[probe]]
kind = "method-entry"
tag = "e"
"#;

#[test]
fn test_wildcard_entry_hooks_every_method() {
    let (agent, host) = agent_with_script(ENTRY_SCRIPT, local_settings());

    let unit = simple_unit("acme/Storage", &["alpha", "beta", "gamma"]);

    // every method gets a chain with exactly one entry hook
    let probes = vec![Probe {
        location: LocationDescriptor {
            kind: LocationKind::MethodEntry,
            type_filter: String::new(),
            member_filter: String::new(),
            r#where: Where::Before,
        },
        tag: "e".to_string(),
    }];
    for m in &unit.methods {
        assert_eq!(RewriteChain::build(&probes, &unit.owner, m).len(), 1);
    }

    host.load_unit(unit.encode(), &agent.transformer()).unwrap();
    let installed = host.installed_bytes("acme/Storage").unwrap();
    let rewritten = CodeUnit::decode(&installed).unwrap();
    for m in &rewritten.methods {
        assert_eq!(rt_call_names(m), vec!["entry$e".to_string()], "{}", m.name);
    }
}

#[test]
fn test_unmatched_unit_keeps_identical_bytes() {
    let script = r#"
name = "scoped"
class-filter = "^acme/"

[[probe]]
kind = "method-entry"
"#;
    let (agent, host) = agent_with_script(script, local_settings());

    let bytes = simple_unit("vendor/Widget", &["draw"]).encode();
    host.load_unit(bytes.clone(), &agent.transformer()).unwrap();
    assert_eq!(host.installed_bytes("vendor/Widget").unwrap(), bytes);

    let matched = simple_unit("acme/Storage", &["put"]).encode();
    host.load_unit(matched.clone(), &agent.transformer()).unwrap();
    assert_ne!(host.installed_bytes("acme/Storage").unwrap(), matched);
}

#[test]
fn test_entry_before_return_after_order() {
    let script = r#"
name = "edges"

[[probe]]
kind = "method-entry"
tag = "in"

[[probe]]
kind = "method-return"
where = "after"
tag = "out"
"#;
    let (agent, host) = agent_with_script(script, local_settings());

    host.load_unit(
        simple_unit("acme/Storage", &["work"]).encode(),
        &agent.transformer(),
    )
    .unwrap();
    let rewritten =
        CodeUnit::decode(&host.installed_bytes("acme/Storage").unwrap()).unwrap();
    let calls = rt_call_names(&rewritten.methods[0]);
    assert_eq!(calls, vec!["entry$in".to_string(), "ret$out".to_string()]);
}

#[test]
fn test_retransform_never_stacks_instrumentation() {
    let (agent, host) = agent_with_script(ENTRY_SCRIPT, local_settings());

    host.load_unit(
        simple_unit("acme/Storage", &["work"]).encode(),
        &agent.transformer(),
    )
    .unwrap();
    let first = host.installed_bytes("acme/Storage").unwrap();

    // retransforming an already-instrumented unit starts from pristine
    // bytes again and lands on the same result
    host.retransform_unit("acme/Storage", &agent.transformer())
        .unwrap();
    assert_eq!(host.installed_bytes("acme/Storage").unwrap(), first);
}

#[test]
fn test_rewritten_units_are_dumped() {
    let dump = tempfile::tempdir().unwrap();
    let mut settings = local_settings();
    settings.dump_units = true;
    settings.dump_dir = Some(dump.path().display().to_string());
    let (agent, host) = agent_with_script(ENTRY_SCRIPT, settings);

    host.load_unit(
        simple_unit("acme/Storage", &["work"]).encode(),
        &agent.transformer(),
    )
    .unwrap();

    let dumped: Vec<_> = std::fs::read_dir(dump.path())
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(dumped.len(), 1);
    let contents = std::fs::read(dumped[0].path()).unwrap();
    assert_eq!(contents, host.installed_bytes("acme/Storage").unwrap());
}
