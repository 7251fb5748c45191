use clap::Parser;
use std::sync::Arc;
use traceweaver::agent::Agent;
use traceweaver::host::InMemoryHost;
use traceweaver::settings::Settings;
use traceweaver::{twr_info, twr_warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent options as comma separated key=value pairs
    /// (script=..., scriptdir=..., port=..., debug, ...).
    options: Option<String>,

    /// Pre-built code units (*.twu files) loaded into the in-process
    /// host before scripts onboard, standing in for already-loaded code.
    #[arg(long = "unit")]
    units: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::parse(args.options.as_deref().unwrap_or(""));

    let mut logger = env_logger::Builder::from_default_env();
    if settings.debug {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let host = Arc::new(InMemoryHost::new());
    let no_server = settings.no_server;
    let agent = Arc::new(Agent::new(settings, host.clone()));

    for unit in &args.units {
        let bytes = std::fs::read(unit)?;
        match host.load_unit(bytes, &agent.transformer()) {
            Ok(owner) => twr_info!(target: "agent", "loaded unit `{owner}` from {unit}"),
            Err(e) => twr_warn!(target: "agent", "unit {unit} not loaded: {e}"),
        }
    }

    let addr = agent.start()?;
    if no_server {
        return Ok(());
    }
    twr_info!(target: "agent", "agent up at {:?}", addr);
    loop {
        std::thread::park();
    }
}
