//! Built-in native modules.
//!
//! These are the in-process entry points manifests can reference with
//! `kind = "native"`. They only inspect the firmware and the run
//! directory; extraction itself is left to containerized modules.

use crate::backend::{native_fn, ModuleOutcome, NativeCatalog, NativeContext};
use crate::models::ModuleState;
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

/// Catalog of every built-in entry point.
pub fn catalog() -> NativeCatalog {
    let mut catalog = NativeCatalog::new();
    catalog.register("test_module", native_fn(test_module));
    catalog.register("firmware_bin_file_check", native_fn(firmware_bin_file_check));
    catalog.register("prepare_analyzer", native_fn(prepare_analyzer));
    catalog
}

/// Smoke-test module: succeeds without touching anything.
async fn test_module(ctx: NativeContext) -> Result<ModuleOutcome, String> {
    Ok(ModuleOutcome::ok(format!(
        "test module {} ran (attempt {})",
        ctx.module, ctx.attempt
    )))
}

/// Magic numbers checked at offset 0, first match wins.
const MAGICS: &[(&[u8], &str)] = &[
    (b"\x7fELF", "elf"),
    (b"\x1f\x8b", "gzip"),
    (b"hsqs", "squashfs"),
    (b"sqsh", "squashfs"),
    (b"\x27\x05\x19\x56", "uimage"),
    (b"PK\x03\x04", "zip"),
    (b"UBI#", "ubi"),
    (b"\x85\x19", "jffs2"),
    (b"070701", "cpio"),
    (b"HDR0", "trx"),
    (b"\xd0\x0d\xfe\xed", "device-tree"),
    (b"BZh", "bzip2"),
    (b"\xfd7zXZ\x00", "xz"),
    (b"\x5d\x00\x00", "lzma"),
];

/// Best-effort firmware type from the leading bytes.
pub fn detect_format(header: &[u8]) -> &'static str {
    MAGICS
        .iter()
        .find(|(magic, _)| header.starts_with(magic))
        .map(|(_, name)| *name)
        .unwrap_or("unknown")
}

#[derive(Debug, Serialize)]
struct FirmwareInfo {
    path: String,
    size: u64,
    format: &'static str,
    header_hex: String,
}

/// Size and type check of the firmware image, written to scratch.
async fn firmware_bin_file_check(ctx: NativeContext) -> Result<ModuleOutcome, String> {
    let metadata = tokio::fs::metadata(&ctx.firmware)
        .await
        .map_err(|e| format!("cannot stat {}: {}", ctx.firmware.display(), e))?;
    if metadata.len() == 0 {
        return Err(format!("firmware {} is empty", ctx.firmware.display()));
    }

    let mut file = tokio::fs::File::open(&ctx.firmware)
        .await
        .map_err(|e| format!("cannot open {}: {}", ctx.firmware.display(), e))?;
    let mut header = [0u8; 16];
    let read = file
        .read(&mut header)
        .await
        .map_err(|e| format!("cannot read {}: {}", ctx.firmware.display(), e))?;
    let header = &header[..read];

    let info = FirmwareInfo {
        path: ctx.firmware.display().to_string(),
        size: metadata.len(),
        format: detect_format(header),
        header_hex: header.iter().map(|b| format!("{:02x}", b)).collect(),
    };

    let artifact = ctx.scratch_dir.join("firmware_info.json");
    write_json(&artifact, &info).await?;

    Ok(ModuleOutcome::ok(format!(
        "{} bytes, detected format: {}",
        info.size, info.format
    ))
    .with_artifact(artifact))
}

#[derive(Debug, Serialize)]
struct Inventory {
    /// Modules that had succeeded when this one was admitted.
    succeeded_before: Vec<String>,
    outputs: Vec<ModuleOutput>,
    total_files: usize,
    total_bytes: u64,
}

#[derive(Debug, Serialize)]
struct ModuleOutput {
    module: String,
    files: usize,
    bytes: u64,
}

/// Inventory of every upstream module's scratch output.
async fn prepare_analyzer(ctx: NativeContext) -> Result<ModuleOutcome, String> {
    let scratch_root = ctx.work_dir.join("scratch");
    let own = ctx.module.clone();
    let succeeded_before: Vec<String> = ctx
        .prior
        .modules
        .values()
        .filter(|r| r.state == ModuleState::Succeeded)
        .map(|r| r.id.clone())
        .collect();

    let outputs = tokio::task::spawn_blocking(move || inventory(&scratch_root, &own))
        .await
        .map_err(|e| format!("inventory task failed: {}", e))?;

    let inventory = Inventory {
        total_files: outputs.iter().map(|o| o.files).sum(),
        total_bytes: outputs.iter().map(|o| o.bytes).sum(),
        succeeded_before,
        outputs,
    };

    let artifact = ctx.scratch_dir.join("inventory.json");
    write_json(&artifact, &inventory).await?;

    Ok(ModuleOutcome::ok(format!(
        "{} file(s) across {} module output(s)",
        inventory.total_files,
        inventory.outputs.iter().filter(|o| o.files > 0).count()
    ))
    .with_artifact(artifact))
}

fn inventory(scratch_root: &Path, own: &str) -> Vec<ModuleOutput> {
    let Ok(entries) = std::fs::read_dir(scratch_root) else {
        return Vec::new();
    };
    let mut dirs: Vec<_> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != own)
        .collect();
    dirs.sort();

    dirs.into_iter()
        .map(|module| {
            let (files, bytes) = WalkDir::new(scratch_root.join(&module))
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
                .fold((0usize, 0u64), |(files, bytes), e| {
                    let size = e.metadata().map(|m| m.len()).unwrap_or(0);
                    (files + 1, bytes + size)
                });
            ModuleOutput {
                module,
                files,
                bytes,
            }
        })
        .collect()
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| format!("cannot write {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunSnapshot, RunStatus};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir, module: &str, firmware: PathBuf) -> NativeContext {
        NativeContext {
            module: module.to_string(),
            attempt: 1,
            firmware,
            work_dir: dir.path().to_path_buf(),
            scratch_dir: dir.path().join("scratch").join(module),
            prior: Arc::new(RunSnapshot {
                status: RunStatus::Running,
                abort_reason: None,
                started_at: None,
                finished_at: None,
                modules: Default::default(),
                admission_order: Vec::new(),
                peak_running: 0,
            }),
        }
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b"hsqs\x00\x01"), "squashfs");
        assert_eq!(detect_format(b"\x27\x05\x19\x56rest"), "uimage");
        assert_eq!(detect_format(b"\x7fELF\x02"), "elf");
        assert_eq!(detect_format(b"nothing"), "unknown");
        assert_eq!(detect_format(b""), "unknown");
    }

    #[test]
    fn test_catalog_contains_builtins() {
        let catalog = catalog();
        let names: Vec<_> = catalog.names().collect();
        assert_eq!(
            names,
            vec!["firmware_bin_file_check", "prepare_analyzer", "test_module"]
        );
    }

    #[tokio::test]
    async fn test_firmware_check_writes_info() {
        let dir = TempDir::new().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"hsqs-squashfs-image").unwrap();

        let outcome = firmware_bin_file_check(ctx(&dir, "P02", firmware))
            .await
            .unwrap();
        assert!(outcome.summary.contains("squashfs"));

        let artifact = outcome.artifact.unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(artifact).unwrap()).unwrap();
        assert_eq!(json["size"], 19);
        assert_eq!(json["format"], "squashfs");
    }

    #[tokio::test]
    async fn test_firmware_check_rejects_empty() {
        let dir = TempDir::new().unwrap();
        let firmware = dir.path().join("empty.bin");
        std::fs::write(&firmware, b"").unwrap();

        let err = firmware_bin_file_check(ctx(&dir, "P02", firmware))
            .await
            .unwrap_err();
        assert!(err.contains("empty"));
    }

    #[tokio::test]
    async fn test_prepare_analyzer_inventory() {
        let dir = TempDir::new().unwrap();
        let extracted = dir.path().join("scratch").join("P50").join("root");
        std::fs::create_dir_all(&extracted).unwrap();
        std::fs::write(extracted.join("passwd"), b"root:x:0:0").unwrap();
        std::fs::write(extracted.join("busybox"), b"\x7fELF").unwrap();
        std::fs::create_dir_all(dir.path().join("scratch").join("P55")).unwrap();

        let outcome = prepare_analyzer(ctx(&dir, "P99", dir.path().join("fw.bin")))
            .await
            .unwrap();
        assert_eq!(outcome.summary, "2 file(s) across 1 module output(s)");

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(outcome.artifact.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(json["total_bytes"], 14);
        assert_eq!(json["outputs"][0]["module"], "P50");
        assert_eq!(json["outputs"].as_array().unwrap().len(), 2);
    }
}
