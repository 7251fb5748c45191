use crate::common::{simple_unit, wait_until};
use serial_test::serial;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use traceweaver::agent::Agent;
use traceweaver::comm::{Command, CommandError};
use traceweaver::host::InMemoryHost;
use traceweaver::settings::Settings;

const REMOTE_SCRIPT: &str = r#"
name = "remote-probe"
class-filter = "^acme/"

[[probe]]
kind = "method-entry"
tag = "rentry"
"#;

fn serving_agent() -> (Arc<Agent>, Arc<InMemoryHost>, TcpStream) {
    let mut settings = Settings::default();
    settings.port = 0;
    let host = Arc::new(InMemoryHost::new());
    let agent = Arc::new(Agent::new(settings, host.clone()));

    let bytes = simple_unit("acme/Storage", &["work"]).encode();
    host.load_unit(bytes, &agent.transformer()).unwrap();

    let addr = agent.start().unwrap().expect("server must come up");
    let stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    (agent, host, stream)
}

fn instrument_request() -> Command {
    Command::Instrument {
        script: REMOTE_SCRIPT.as_bytes().to_vec(),
        args: vec!["depth=3".to_string()],
    }
}

#[test]
#[serial]
fn test_remote_client_onboarding_round_trip() {
    let (agent, host, mut stream) = serving_agent();
    let pristine = host.installed_bytes("acme/Storage").unwrap();

    instrument_request().write_to(&mut stream).unwrap();

    // onboarding announces the retransformation sweep, then reports done
    assert_eq!(
        Command::read_from(&mut stream).unwrap(),
        Command::RetransformationStart { unit_count: 1 }
    );
    assert_eq!(Command::read_from(&mut stream).unwrap(), Command::Success);

    assert_ne!(host.installed_bytes("acme/Storage").unwrap(), pristine);
    assert_eq!(agent.transformer().snapshot().len(), 1);
    assert_eq!(agent.clients().len(), 1);

    // parameter updates are acknowledged
    Command::SetParams {
        params: vec![("depth".to_string(), "7".to_string())],
    }
    .write_to(&mut stream)
    .unwrap();
    assert_eq!(Command::read_from(&mut stream).unwrap(), Command::Success);
    let client = agent.clients().remove(0);
    wait_until("param update", || client.param("depth").as_deref() == Some("7"));

    // a unit the runtime refuses to retransform costs an error report,
    // not the connection
    host.set_modifiable("acme/Storage", false);
    Command::RetransformClass {
        name: "acme/Storage".to_string(),
    }
    .write_to(&mut stream)
    .unwrap();
    match Command::read_from(&mut stream).unwrap() {
        Command::Error { message } => assert!(message.contains("not modifiable")),
        other => panic!("expected an error report, got {other:?}"),
    }
    assert_eq!(agent.transformer().snapshot().len(), 1);

    // exit deregisters the client so future loads no longer match
    Command::Exit { code: 0 }.write_to(&mut stream).unwrap();
    let transformer = agent.transformer();
    wait_until("client deregistration", || {
        transformer.snapshot().is_empty()
    });
}

#[test]
#[serial]
fn test_garbage_opening_drops_the_connection() {
    let (agent, _host, mut stream) = serving_agent();

    // a frame with an unknown command tag
    stream.write_all(&1u32.to_be_bytes()).unwrap();
    stream.write_all(&[200u8]).unwrap();
    stream.flush().unwrap();

    assert!(matches!(
        Command::read_from(&mut stream),
        Err(CommandError::Io(_))
    ));
    assert!(agent.transformer().snapshot().is_empty());
    assert!(agent.clients().is_empty());
}

#[test]
#[serial]
fn test_protocol_error_tears_down_only_that_client() {
    let (agent, _host, mut stream) = serving_agent();

    instrument_request().write_to(&mut stream).unwrap();
    Command::read_from(&mut stream).unwrap();
    Command::read_from(&mut stream).unwrap();

    // another, healthy client against the same listener
    let mut second =
        TcpStream::connect(("127.0.0.1", stream.peer_addr().unwrap().port())).unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    instrument_request().write_to(&mut second).unwrap();
    // the second client gets renamed on top of the onboarding commands,
    // so drain until the onboarding acknowledgement
    loop {
        if Command::read_from(&mut second).unwrap() == Command::Success {
            break;
        }
    }
    assert_eq!(agent.transformer().snapshot().len(), 2);

    // malformed frame on the first connection
    stream.write_all(&1u32.to_be_bytes()).unwrap();
    stream.write_all(&[200u8]).unwrap();
    stream.flush().unwrap();

    let transformer = agent.transformer();
    wait_until("teardown of the broken client", || {
        transformer.snapshot().len() == 1
    });

    // the healthy client still answers
    Command::SetParams { params: vec![] }
        .write_to(&mut second)
        .unwrap();
    assert_eq!(Command::read_from(&mut second).unwrap(), Command::Success);
}
