//! Attach-time agent configuration: a flat `key=value,key=value` string,
//! optionally merged with packaged defaults.

use indexmap::IndexMap;
use log::warn;

pub const DEFAULT_PORT: u16 = 2020;
pub const DEFAULT_CMD_QUEUE_LIMIT: usize = 100;

/// Resolved agent settings. Shared read-only by every client context;
/// per-client copies carry the client-specific output overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Initial script paths.
    pub scripts: Vec<String>,
    /// Directory scanned (non-recursively) for additional scripts.
    pub script_dir: Option<String>,
    pub output_file: Option<String>,
    pub output_dir: Option<String>,
    /// Local scripts trace to the console instead of files.
    pub stdout: bool,
    pub debug: bool,
    /// Retransform already-loaded units when a client onboards.
    pub startup_retransform: bool,
    /// Report every retransformed unit back to the client.
    pub track_retransforms: bool,
    pub dump_units: bool,
    pub dump_dir: Option<String>,
    pub cmd_queue_limit: usize,
    pub trusted: bool,
    pub port: u16,
    pub no_server: bool,
    pub probe_desc_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scripts: Vec::new(),
            script_dir: None,
            output_file: None,
            output_dir: None,
            stdout: false,
            debug: false,
            startup_retransform: true,
            track_retransforms: false,
            dump_units: false,
            dump_dir: None,
            cmd_queue_limit: DEFAULT_CMD_QUEUE_LIMIT,
            trusted: false,
            port: DEFAULT_PORT,
            no_server: false,
            probe_desc_path: ".".to_string(),
        }
    }
}

impl Settings {
    pub fn parse(args: &str) -> Settings {
        Self::from_map(&parse_kv(args))
    }

    pub fn from_map(map: &IndexMap<String, String>) -> Settings {
        let mut settings = Settings::default();

        if let Some(script) = map.get("script") {
            settings.scripts = script
                .split(':')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        settings.script_dir = map.get("scriptdir").cloned();
        settings.output_file = non_empty(map.get("scriptOutputFile"));
        settings.output_dir = non_empty(map.get("scriptOutputDir"));
        settings.stdout = flag(map, "stdout");
        settings.debug = flag(map, "debug");
        // retransform-on-start stays on unless explicitly switched off
        settings.startup_retransform = map
            .get("startupRetransform")
            .map(|v| v != "false")
            .unwrap_or(true);
        settings.track_retransforms = flag(map, "trackRetransforms");
        settings.dump_units = flag(map, "dumpUnits");
        if settings.dump_units {
            settings.dump_dir = Some(map.get("dumpDir").cloned().unwrap_or_else(|| ".".to_string()));
        }
        if let Some(raw) = map.get("cmdQueueLimit") {
            match raw.parse() {
                Ok(limit) => settings.cmd_queue_limit = limit,
                Err(_) => warn!(
                    target: "agent",
                    "invalid cmdQueueLimit `{raw}`, keeping {DEFAULT_CMD_QUEUE_LIMIT}"
                ),
            }
        }
        settings.trusted = flag(map, "trusted") || flag(map, "unsafe");
        if let Some(raw) = map.get("port") {
            match raw.parse() {
                Ok(port) => settings.port = port,
                Err(_) => warn!(target: "agent", "invalid port `{raw}`, assuming default"),
            }
        }
        settings.no_server = flag(map, "noServer");
        if let Some(path) = map.get("probeDescPath") {
            settings.probe_desc_path = path.clone();
        }

        settings
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

fn flag(map: &IndexMap<String, String>, key: &str) -> bool {
    map.get(key).map(|v| v != "false").unwrap_or(false)
}

/// Split a `k=v,k=v` argument string. A pair without `=` becomes a bare
/// flag with an empty value.
pub fn parse_kv(args: &str) -> IndexMap<String, String> {
    let mut map = IndexMap::new();
    for pair in args.split(',') {
        if pair.trim().is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => map.insert(key.trim().to_string(), value.trim().to_string()),
            None => map.insert(pair.trim().to_string(), String::new()),
        };
    }
    map
}

/// Merge packaged default arguments under explicit ones.
///
/// Most keys apply only when absent. The `script` key is special: a
/// default starting with `!` replaces the explicit value outright, any
/// other default is appended to a non-empty explicit value with `:`.
/// That augment-vs-replace asymmetry is kept as the original behaved.
pub fn apply_defaults(map: &mut IndexMap<String, String>, defaults: &IndexMap<String, String>) {
    for (key, default) in defaults {
        if key == "script" {
            let merged = match default.strip_prefix('!') {
                Some(replacement) => replacement.to_string(),
                None => match map.get("script").filter(|old| !old.is_empty()) {
                    Some(old) => format!("{old}:{default}"),
                    None => default.clone(),
                },
            };
            map.insert(key.clone(), merged);
        } else if !map.contains_key(key) {
            map.insert(key.clone(), default.clone());
        }
    }
}
