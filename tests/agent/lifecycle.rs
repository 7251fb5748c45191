use crate::common::simple_unit;
use std::sync::Arc;
use traceweaver::agent::client::ClientState;
use traceweaver::agent::Agent;
use traceweaver::host::InMemoryHost;
use traceweaver::script::TraceScript;
use traceweaver::settings::Settings;
use traceweaver::weaver::chain::Probe;
use traceweaver::weaver::location::{LocationDescriptor, LocationKind, Where};

fn local_agent() -> (Arc<Agent>, Arc<InMemoryHost>) {
    let mut settings = Settings::default();
    settings.no_server = true;
    settings.stdout = true;
    let host = Arc::new(InMemoryHost::new());
    let agent = Arc::new(Agent::new(settings, host.clone()));
    (agent, host)
}

fn entry_script(name: &str) -> TraceScript {
    TraceScript {
        name: name.to_string(),
        class_filter: None,
        probes: vec![Probe {
            location: LocationDescriptor {
                kind: LocationKind::MethodEntry,
                type_filter: String::new(),
                member_filter: String::new(),
                r#where: Where::Before,
            },
            tag: "e".to_string(),
        }],
    }
}

#[test]
fn test_concurrent_onboarding_serializes_mutations() {
    let (agent, _host) = local_agent();
    let transformer = agent.transformer();
    assert_eq!(transformer.mutation_count(), 0);

    let attachers: Vec<_> = (0..6)
        .map(|i| {
            let agent = agent.clone();
            std::thread::spawn(move || agent.attach_script(entry_script(&format!("probe-{i}"))))
        })
        .collect();
    for attacher in attachers {
        attacher.join().unwrap().unwrap();
    }

    // one mutation per onboarding, no lost updates
    assert_eq!(transformer.mutation_count(), 6);
    assert_eq!(transformer.snapshot().len(), 6);
    assert_eq!(agent.clients().len(), 6);
}

#[test]
fn test_colliding_client_names_get_renamed() {
    let (agent, _host) = local_agent();
    let first = agent.attach_script(entry_script("dup")).unwrap();
    let second = agent.attach_script(entry_script("dup")).unwrap();
    assert_eq!(first.name(), "dup");
    assert_eq!(second.name(), "dup-1");

    let names = agent.transformer().snapshot().client_names();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"dup".to_string()));
    assert!(names.contains(&"dup-1".to_string()));
}

#[test]
fn test_client_walks_to_active() {
    let (agent, _host) = local_agent();
    let client = agent.attach_script(entry_script("walker")).unwrap();
    assert_eq!(client.state(), ClientState::Active);
}

#[test]
fn test_disconnect_deregisters_before_closed() {
    let (agent, host) = local_agent();
    let client = agent.attach_script(entry_script("leaver")).unwrap();

    let bytes = simple_unit("acme/Storage", &["work"]).encode();
    host.load_unit(bytes.clone(), &agent.transformer()).unwrap();
    assert_ne!(host.installed_bytes("acme/Storage").unwrap(), bytes);

    agent.disconnect_client(&client);
    assert_eq!(client.state(), ClientState::Closed);
    assert!(agent.transformer().snapshot().is_empty());
    assert!(agent.clients().is_empty());

    // future loads and retransforms no longer match the departed client
    host.retransform_unit("acme/Storage", &agent.transformer())
        .unwrap();
    assert_eq!(host.installed_bytes("acme/Storage").unwrap(), bytes);
}

#[test]
fn test_disconnect_leaves_other_clients_alone() {
    let (agent, host) = local_agent();
    let leaving = agent.attach_script(entry_script("leaving")).unwrap();
    let staying = agent.attach_script(entry_script("staying")).unwrap();

    agent.disconnect_client(&leaving);
    assert_eq!(staying.state(), ClientState::Active);
    assert_eq!(agent.transformer().snapshot().len(), 1);

    let bytes = simple_unit("acme/Storage", &["work"]).encode();
    host.load_unit(bytes.clone(), &agent.transformer()).unwrap();
    assert_ne!(host.installed_bytes("acme/Storage").unwrap(), bytes);
}

#[test]
fn test_shutdown_closes_every_client() {
    let (agent, _host) = local_agent();
    let a = agent.attach_script(entry_script("a")).unwrap();
    let b = agent.attach_script(entry_script("b")).unwrap();

    agent.shutdown();
    assert_eq!(a.state(), ClientState::Closed);
    assert_eq!(b.state(), ClientState::Closed);
    assert!(agent.transformer().snapshot().is_empty());
}
