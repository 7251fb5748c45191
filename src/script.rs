//! Trace-script loading. A script is a pre-built `.twv` unit declaring
//! the probes one client wants woven into loaded code.

use crate::probe::{ProbeDef, ProbeRegistry};
use crate::weaver::chain::Probe;
use crate::weaver::location::{LocationDescriptor, LocationKind, Where};
use crate::weaver::Error;
use log::info;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

pub const SCRIPT_EXTENSION: &str = "twv";

/// Raw script file shape.
#[derive(Debug, Deserialize)]
pub struct ScriptFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "class-filter")]
    pub class_filter: Option<String>,
    /// Probe descriptor namespaces whose probes join the script's own.
    #[serde(default, rename = "namespace")]
    pub namespaces: Vec<String>,
    #[serde(default, rename = "probe")]
    pub probes: Vec<ProbeDef>,
}

/// A compiled script: what one client traces.
#[derive(Debug)]
pub struct TraceScript {
    pub name: String,
    pub class_filter: Option<Regex>,
    pub probes: Vec<Probe>,
}

impl TraceScript {
    /// Load and compile a script file. `Ok(None)` means the path is not a
    /// trace script (wrong extension) and was skipped; only real parse
    /// failures propagate.
    pub fn load(path: &Path, registry: &ProbeRegistry) -> anyhow::Result<Option<TraceScript>> {
        if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION) {
            info!(
                target: "agent",
                "refusing {} - scripts carry the .{SCRIPT_EXTENSION} extension",
                path.display()
            );
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        let file: ScriptFile = toml::from_str(&raw)?;
        let fallback_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("anonymous")
            .to_string();
        Ok(Some(Self::compile(file, fallback_name, registry)?))
    }

    /// Compile an already-parsed script, resolving namespace references
    /// through the probe registry.
    pub fn compile(
        file: ScriptFile,
        fallback_name: String,
        registry: &ProbeRegistry,
    ) -> anyhow::Result<TraceScript> {
        let mut defs = file.probes;
        for namespace in &file.namespaces {
            match registry.load(namespace) {
                Some(descriptor) => defs.extend(descriptor.probes.iter().cloned()),
                None => log::warn!(
                    target: "agent",
                    "probe namespace `{namespace}` not found, skipped"
                ),
            }
        }

        let probes = defs
            .into_iter()
            .map(compile_probe)
            .collect::<Result<Vec<_>, _>>()?;

        let class_filter = file
            .class_filter
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        Ok(TraceScript {
            name: file.name.unwrap_or(fallback_name),
            class_filter,
            probes,
        })
    }
}

fn compile_probe(def: ProbeDef) -> Result<Probe, Error> {
    let kind: LocationKind = def
        .kind
        .parse()
        .map_err(|_| Error::UnknownLocationKind(def.kind.clone()))?;
    let r#where: Where = def
        .r#where
        .parse()
        .map_err(|_| Error::UnknownWhere(def.r#where.clone()))?;
    let tag = if def.tag.is_empty() {
        kind.to_string()
    } else {
        def.tag
    };
    Ok(Probe {
        location: LocationDescriptor {
            kind,
            type_filter: def.r#type,
            member_filter: def.member,
            r#where,
        },
        tag,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn empty_registry() -> ProbeRegistry {
        ProbeRegistry::new("")
    }

    #[test]
    fn test_wrong_extension_is_skipped_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "whatever").unwrap();
        assert!(TraceScript::load(&path, &empty_registry())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_script_compiles_probes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc.twv");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
name = "alloc-trace"
class-filter = "^acme/"

[[probe]]
kind = "method-entry"

[[probe]]
kind = "array-access"
type = "int"
where = "after"
tag = "int-arrays"
"#
        )
        .unwrap();

        let script = TraceScript::load(&path, &empty_registry())
            .unwrap()
            .expect("script must load");
        assert_eq!(script.name, "alloc-trace");
        assert!(script.class_filter.as_ref().unwrap().is_match("acme/T"));
        assert_eq!(script.probes.len(), 2);
        assert_eq!(script.probes[0].location.kind, LocationKind::MethodEntry);
        // a missing tag falls back to the kind name
        assert_eq!(script.probes[0].tag, "method-entry");
        assert_eq!(script.probes[1].location.r#where, Where::After);
        assert_eq!(script.probes[1].tag, "int-arrays");
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let file = ScriptFile {
            name: None,
            class_filter: None,
            namespaces: Vec::new(),
            probes: vec![ProbeDef {
                kind: "method-exit".to_string(),
                r#type: String::new(),
                member: String::new(),
                r#where: "before".to_string(),
                tag: String::new(),
            }],
        };
        assert!(TraceScript::compile(file, "x".to_string(), &empty_registry()).is_err());
    }

    #[test]
    fn test_namespace_probes_join_in() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("acme.io.toml"),
            r#"
namespace = "acme.io"

[[probe]]
kind = "field-access"
member = "size"
"#,
        )
        .unwrap();
        let registry = ProbeRegistry::new(&dir.path().display().to_string());

        let file = ScriptFile {
            name: Some("io".to_string()),
            class_filter: None,
            namespaces: vec!["acme.io".to_string()],
            probes: vec![],
        };
        let script = TraceScript::compile(file, "io".to_string(), &registry).unwrap();
        assert_eq!(script.probes.len(), 1);
        assert_eq!(script.probes[0].location.member_filter, "size");
    }
}
