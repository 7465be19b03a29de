//! `.ngbak` backup/restore bundles (spec.md §6 "Backup bundle").
//!
//! A backup stages the working directory's file-backed surfaces
//! (`kv_store_*.json`, `vdb_*.json`, `graph_chunk_entity_relation.json`)
//! into one subdirectory per storage surface, writes a manifest, computes
//! a deterministic checksum over the staged tree, and tars+gzips it. The
//! checksum protocol writes the manifest twice: once with a placeholder
//! so the manifest itself is part of what gets hashed, then again with
//! the real value, so the archive is only ever created once.

use std::path::{Path, PathBuf};

use chrono::Utc;
use graphrag_core::error::{GraphRagError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const KV_SUBDIR: &str = "kv";
const VECTOR_SUBDIR: &str = "vector";
const GRAPH_SUBDIR: &str = "graph";
const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: String,
    pub created_at: chrono::DateTime<Utc>,
    pub engine_version: String,
    pub backends: BackendNames,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendNames {
    pub kv: String,
    pub vector: String,
    pub graph: String,
}

/// Stages `working_dir`'s file-backed surfaces into `dest` (a `.ngbak`
/// path) as a gzipped tar archive.
pub async fn create_backup(working_dir: &Path, dest: &Path, backends: BackendNames) -> Result<()> {
    let working_dir = working_dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || create_backup_blocking(&working_dir, &dest, backends))
        .await
        .map_err(|e| GraphRagError::Internal(format!("join error: {e}")))?
}

fn create_backup_blocking(working_dir: &Path, dest: &Path, backends: BackendNames) -> Result<()> {
    let staging = tempfile::tempdir().map_err(io_err)?;
    stage_working_dir(working_dir, staging.path())?;

    let mut manifest = BackupManifest {
        backup_id: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        backends,
        checksum: String::new(),
    };
    write_manifest(staging.path(), &manifest)?;

    manifest.checksum = compute_directory_checksum(staging.path())?;
    write_manifest(staging.path(), &manifest)?;

    write_archive(staging.path(), dest)
}

/// Extracts `archive`, verifies its checksum, and restores the staged
/// subdirectories back into `working_dir` using the original file-backend
/// naming convention.
pub async fn restore_backup(archive: &Path, working_dir: &Path) -> Result<BackupManifest> {
    let archive = archive.to_path_buf();
    let working_dir = working_dir.to_path_buf();
    tokio::task::spawn_blocking(move || restore_backup_blocking(&archive, &working_dir))
        .await
        .map_err(|e| GraphRagError::Internal(format!("join error: {e}")))?
}

fn restore_backup_blocking(archive: &Path, working_dir: &Path) -> Result<BackupManifest> {
    let extracted = tempfile::tempdir().map_err(io_err)?;
    let file = std::fs::File::open(archive).map_err(io_err)?;
    let decoder = flate2::read::GzDecoder::new(file);
    tar::Archive::new(decoder).unpack(extracted.path()).map_err(io_err)?;

    let manifest: BackupManifest = read_manifest(extracted.path())?;
    let recomputed = compute_directory_checksum(extracted.path())?;
    if recomputed != manifest.checksum {
        return Err(GraphRagError::data_integrity(format!(
            "backup checksum mismatch: manifest says {}, recomputed {recomputed}",
            manifest.checksum
        )));
    }

    unstage_into_working_dir(extracted.path(), working_dir)?;
    Ok(manifest)
}

/// Copies `working_dir`'s flat file layout into `staging`'s
/// surface-named subdirectories (spec.md §6 "one subdirectory per
/// storage surface").
fn stage_working_dir(working_dir: &Path, staging: &Path) -> Result<()> {
    std::fs::create_dir_all(staging.join(KV_SUBDIR)).map_err(io_err)?;
    std::fs::create_dir_all(staging.join(VECTOR_SUBDIR)).map_err(io_err)?;
    std::fs::create_dir_all(staging.join(GRAPH_SUBDIR)).map_err(io_err)?;

    if !working_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(working_dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let subdir = if name.starts_with("kv_store_") {
            KV_SUBDIR
        } else if name.starts_with("vdb_") {
            VECTOR_SUBDIR
        } else if name.starts_with("graph_") {
            GRAPH_SUBDIR
        } else {
            continue;
        };
        std::fs::copy(&path, staging.join(subdir).join(&*name)).map_err(io_err)?;
    }
    Ok(())
}

/// Reverses [`stage_working_dir`]: flattens the surface subdirectories
/// back into `working_dir`.
fn unstage_into_working_dir(extracted: &Path, working_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(working_dir).map_err(io_err)?;
    for subdir in [KV_SUBDIR, VECTOR_SUBDIR, GRAPH_SUBDIR] {
        let src = extracted.join(subdir);
        if !src.exists() {
            continue;
        }
        for entry in std::fs::read_dir(&src).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if path.is_file() {
                std::fs::copy(&path, working_dir.join(entry.file_name())).map_err(io_err)?;
            }
        }
    }
    Ok(())
}

fn write_manifest(staging: &Path, manifest: &BackupManifest) -> Result<()> {
    let content = serde_json::to_vec_pretty(manifest).map_err(|e| GraphRagError::Internal(format!("manifest serialization failed: {e}")))?;
    std::fs::write(staging.join(MANIFEST_NAME), content).map_err(io_err)
}

fn read_manifest(dir: &Path) -> Result<BackupManifest> {
    let content = std::fs::read_to_string(dir.join(MANIFEST_NAME)).map_err(io_err)?;
    serde_json::from_str(&content).map_err(|e| GraphRagError::data_integrity(format!("malformed manifest.json: {e}")))
}

/// Deterministic checksum over every file in `dir`: sorted relative
/// paths, each file's bytes — except `manifest.json`, whose `checksum`
/// field is cleared before hashing so the manifest can describe its own
/// checksum without that value feeding back into itself.
fn compute_directory_checksum(dir: &Path) -> Result<String> {
    let mut files = collect_files(dir, dir)?;
    files.sort();

    let mut hasher = Sha256::new();
    for relative in files {
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let bytes = if relative == Path::new(MANIFEST_NAME) {
            let mut manifest: BackupManifest = read_manifest(dir)?;
            manifest.checksum = String::new();
            serde_json::to_vec(&manifest).map_err(|e| GraphRagError::Internal(format!("manifest serialization failed: {e}")))?
        } else {
            std::fs::read(dir.join(&relative)).map_err(io_err)?
        };
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(collect_files(root, &path)?);
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.push(relative);
        }
    }
    Ok(out)
}

fn write_archive(staging: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = std::fs::File::create(dest).map_err(io_err)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", staging).map_err(io_err)?;
    builder.into_inner().map_err(io_err)?.finish().map_err(io_err)?;
    Ok(())
}

fn io_err(err: std::io::Error) -> GraphRagError {
    GraphRagError::Internal(format!("backup/restore I/O error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_backends() -> BackendNames {
        BackendNames { kv: "json".to_string(), vector: "nano".to_string(), graph: "networkx".to_string() }
    }

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("kv_store_full_docs.json"), r#"{"doc-1":{"content":"hi"}}"#).unwrap();
        std::fs::write(dir.join("vdb_entities.json"), r#"{"ALICE":{"content":"Alice","embedding":[1.0,0.0],"extra_payload":{}}}"#).unwrap();
        std::fs::write(dir.join("graph_chunk_entity_relation.json"), r#"{"nodes":[],"edges":[]}"#).unwrap();
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips_every_file() {
        let source = tempfile::tempdir().unwrap();
        populate(source.path());
        let archive_dir = tempfile::tempdir().unwrap();
        let archive = archive_dir.path().join("backup.ngbak");

        create_backup(source.path(), &archive, sample_backends()).await.unwrap();

        let restored = tempfile::tempdir().unwrap();
        let manifest = restore_backup(&archive, restored.path()).await.unwrap();
        assert!(!manifest.checksum.is_empty());

        let original = std::fs::read_to_string(source.path().join("kv_store_full_docs.json")).unwrap();
        let round_tripped = std::fs::read_to_string(restored.path().join("kv_store_full_docs.json")).unwrap();
        assert_eq!(original, round_tripped);
    }

    #[tokio::test]
    async fn tampered_archive_is_rejected_on_restore() {
        let source = tempfile::tempdir().unwrap();
        populate(source.path());
        let archive_dir = tempfile::tempdir().unwrap();
        let archive = archive_dir.path().join("backup.ngbak");
        create_backup(source.path(), &archive, sample_backends()).await.unwrap();

        // Re-stage the same source with one extra byte appended to a
        // data file, then hand-assemble an archive whose manifest still
        // claims the original checksum.
        let staging = tempfile::tempdir().unwrap();
        stage_working_dir(source.path(), staging.path()).unwrap();
        let mut manifest = read_manifest(staging.path()).unwrap();
        manifest.checksum = "0000000000000000000000000000000000000000000000000000000000000000".to_string();
        write_manifest(staging.path(), &manifest).unwrap();
        std::fs::write(staging.path().join(KV_SUBDIR).join("kv_store_full_docs.json"), "tampered").unwrap();
        let tampered = archive_dir.path().join("tampered.ngbak");
        write_archive(staging.path(), &tampered).unwrap();

        let restored = tempfile::tempdir().unwrap();
        let err = restore_backup(&tampered, restored.path()).await.unwrap_err();
        assert!(matches!(err, GraphRagError::DataIntegrity(_)));
    }

    #[test]
    fn checksum_is_stable_across_recomputation() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());
        let manifest = BackupManifest {
            backup_id: "b".to_string(),
            created_at: Utc::now(),
            engine_version: "0.1.0".to_string(),
            backends: sample_backends(),
            checksum: String::new(),
        };
        write_manifest(dir.path(), &manifest).unwrap();
        let a = compute_directory_checksum(dir.path()).unwrap();
        let b = compute_directory_checksum(dir.path()).unwrap();
        assert_eq!(a, b);
    }
}
