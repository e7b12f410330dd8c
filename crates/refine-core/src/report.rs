//! Run report persistence.
//!
//! A finished [`RefinementReport`] is written to
//! `<dir>/<run_id>/refinement.json` together with a companion
//! `<dir>/<run_id>/refinement.digest` holding the SHA-256 of the exact bytes
//! written to `refinement.json`. Reading checks the bytes against the digest
//! before parsing them and rejects tampered files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::digest::{digest_of, sha256_hex, verify_digest};
use crate::domain::error::Result;
use crate::domain::outcome::RefinementReport;

const REPORT_FILE: &str = "refinement.json";
const DIGEST_FILE: &str = "refinement.digest";

/// A report plus the digest it was written with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementArtifact {
    pub run_id: String,
    pub written_at: DateTime<Utc>,
    pub report: RefinementReport,
    /// SHA-256 hex of the canonical JSON of `report` at write time.
    pub report_digest: String,
}

impl RefinementArtifact {
    pub fn new(report: RefinementReport) -> Result<Self> {
        let report_digest = digest_of(&report)?;
        Ok(Self {
            run_id: report.run_id.clone(),
            written_at: Utc::now(),
            report,
            report_digest,
        })
    }
}

/// Write `report` under `dir` and return the path to `refinement.json`.
pub fn write_report_artifact(report: &RefinementReport, dir: &Path) -> Result<PathBuf> {
    let artifact = RefinementArtifact::new(report.clone())?;
    let run_dir = dir.join(&artifact.run_id);
    std::fs::create_dir_all(&run_dir)?;

    let bytes = serde_json::to_vec_pretty(&artifact)?;
    let report_path = run_dir.join(REPORT_FILE);
    std::fs::write(&report_path, &bytes)?;
    std::fs::write(run_dir.join(DIGEST_FILE), sha256_hex(&bytes))?;
    Ok(report_path)
}

/// Read and integrity-check the artifact of `run_id` under `dir`.
///
/// Fails with [`RefineError::DigestMismatch`](crate::RefineError::DigestMismatch)
/// when the companion `.digest` file disagrees with the bytes on disk.
pub fn read_report_artifact(run_id: &str, dir: &Path) -> Result<RefinementArtifact> {
    let run_dir = dir.join(run_id);
    let bytes = std::fs::read(run_dir.join(REPORT_FILE))?;
    let stored = std::fs::read_to_string(run_dir.join(DIGEST_FILE))?;
    verify_digest(&stored, &bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}
