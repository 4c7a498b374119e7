//! Module manifest parsing and discovery.
//!
//! One module per `*.toml` file:
//!
//! ```toml
//! id = "P50"
//! name = "Binwalk extractor"
//! phase = "pre_extract"
//! depends_on = ["P02"]
//! timeout_secs = 3600
//! exclusive_mount = true
//!
//! [backend]
//! kind = "container"
//! image = "firmorch/binwalk:latest"
//! command = ["binwalk", "-e", "-C", "/scratch", "/firmware/image.bin"]
//! ```

use super::ModuleSpec;
use crate::backend::{ContainerSpec, ModuleEntry, MountSpec, NativeCatalog};
use crate::error::DescriptorError;
use crate::models::{BackendKind, ModuleDescriptor, Phase, ResourceHints};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    description: String,
    phase: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    soft_depends_on: Vec<String>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    exclusive_mount: bool,
    backend: Option<BackendManifest>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendManifest {
    kind: Option<String>,
    entry: Option<String>,
    image: Option<String>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    mounts: Vec<MountSpec>,
}

/// Parse a phase name or its single-letter prefix.
pub fn parse_phase(value: &str) -> Option<Phase> {
    let phase = match value.trim().to_ascii_lowercase().as_str() {
        "pre_extract" | "pre-extract" | "p" => Phase::PreExtract,
        "static" | "s" => Phase::Static,
        "live" | "l" => Phase::Live,
        "ai" | "q" => Phase::Ai,
        "diff" | "d" => Phase::Diff,
        "report" | "f" => Phase::Report,
        _ => return None,
    };
    Some(phase)
}

fn valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse one manifest document. `origin` names it in errors.
pub fn parse_manifest(
    content: &str,
    origin: &str,
    catalog: &NativeCatalog,
    default_timeout: Duration,
) -> Result<ModuleSpec, DescriptorError> {
    let invalid = |reason: String| DescriptorError::Invalid {
        origin: origin.to_string(),
        reason,
    };

    let manifest: Manifest = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;

    let id = manifest
        .id
        .map(|id| id.trim().to_string())
        .ok_or_else(|| invalid("missing 'id'".to_string()))?;
    if !valid_identifier(&id) {
        return Err(invalid(format!("invalid identifier '{}'", id)));
    }

    let phase_name = manifest
        .phase
        .ok_or_else(|| invalid("missing 'phase'".to_string()))?;
    let phase =
        parse_phase(&phase_name).ok_or_else(|| invalid(format!("unknown phase '{}'", phase_name)))?;

    let timeout = match manifest.timeout_secs {
        Some(0) => return Err(invalid("timeout_secs must be at least 1".to_string())),
        Some(secs) => Duration::from_secs(secs),
        None => default_timeout,
    };

    let mut depends_on = BTreeSet::new();
    let mut soft_depends_on = BTreeSet::new();
    for (list, target) in [
        (manifest.depends_on, &mut depends_on),
        (manifest.soft_depends_on, &mut soft_depends_on),
    ] {
        for dep in list {
            let dep = dep.trim().to_string();
            if dep == id {
                return Err(invalid(format!("module '{}' depends on itself", id)));
            }
            if !valid_identifier(&dep) {
                return Err(invalid(format!("invalid dependency '{}'", dep)));
            }
            target.insert(dep);
        }
    }
    // A module listed as both is a hard dependency.
    soft_depends_on.retain(|dep| !depends_on.contains(dep));

    let backend = manifest
        .backend
        .ok_or_else(|| invalid("missing [backend] table".to_string()))?;
    let kind = backend
        .kind
        .ok_or_else(|| invalid("missing backend.kind".to_string()))?;

    let entry = match kind.as_str() {
        "native" => {
            let name = backend
                .entry
                .ok_or_else(|| invalid("native backend requires 'entry'".to_string()))?;
            let module = catalog
                .get(&name)
                .ok_or_else(|| invalid(format!("unknown native entry '{}'", name)))?;
            ModuleEntry::Native(module)
        }
        "container" => {
            let image = backend.image.unwrap_or_default();
            if image.trim().is_empty() {
                return Err(invalid("container backend requires 'image'".to_string()));
            }
            if backend.command.is_empty() {
                return Err(invalid("container backend requires 'command'".to_string()));
            }
            for mount in &backend.mounts {
                if mount.source.is_absolute()
                    || mount
                        .source
                        .components()
                        .any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    return Err(invalid(format!(
                        "mount source {} must stay inside the run directory",
                        mount.source.display()
                    )));
                }
                if !mount.target.starts_with('/') {
                    return Err(invalid(format!(
                        "mount target '{}' must be absolute",
                        mount.target
                    )));
                }
            }
            ModuleEntry::Container(ContainerSpec {
                image,
                command: backend.command,
                env: backend.env,
                mounts: backend.mounts,
            })
        }
        other => return Err(invalid(format!("unknown backend kind '{}'", other))),
    };

    let backend_kind: BackendKind = entry.kind();
    let descriptor = ModuleDescriptor {
        name: manifest.name.unwrap_or_else(|| id.clone()),
        id,
        description: manifest.description,
        phase,
        backend: backend_kind,
        depends_on,
        soft_depends_on,
        hints: ResourceHints {
            exclusive_mount: manifest.exclusive_mount,
        },
        timeout,
        critical: manifest.critical,
    };

    Ok(ModuleSpec { descriptor, entry })
}

/// Scan a directory for module manifests, in file-name order.
pub fn discover(
    source: &Path,
    catalog: &NativeCatalog,
    default_timeout: Duration,
) -> Result<Vec<ModuleSpec>, DescriptorError> {
    if !source.is_dir() {
        return Err(DescriptorError::Source {
            path: source.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let mut specs = Vec::new();
    let walker = WalkDir::new(source)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| DescriptorError::Source {
            path: e.path().unwrap_or(source).to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
        })?;

        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("toml")
        {
            continue;
        }

        let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::Source {
            path: path.to_path_buf(),
            source,
        })?;
        let spec = parse_manifest(&content, &path.display().to_string(), catalog, default_timeout)?;
        debug!(module = %spec.descriptor.id, "Discovered module in {}", path.display());
        specs.push(spec);
    }

    Ok(specs)
}
