use crate::bootstrap::BootstrapState;
use crate::candidates::CandidateRecord;
use crate::error::{ForgeError, ForgeResult};
use crate::optimizer::iqp::IqpState;
use crate::stop_rule::StopRuleState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SearchPhase {
    InitialPopulation,
    Optimization,
    Finished,
}

/// Everything needed to pick a run up where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub fingerprint: String,
    pub phase: SearchPhase,
    pub stop_rule: StopRuleState,
    pub candidates: Vec<CandidateRecord>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapState>,
    pub iqp: IqpState,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    digest: String,
    state: CheckpointState,
}

fn digest_of(state: &CheckpointState) -> ForgeResult<String> {
    let body = serde_json::to_string(state)?;
    Ok(hex::encode(Sha256::digest(body.as_bytes())))
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    fingerprint: String,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(prefix: P, rank: usize, fingerprint: &str) -> Self {
        Self {
            path: Self::path_for(prefix, rank),
            fingerprint: fingerprint.to_string(),
        }
    }

    /// `<prefix>.ckp.json` for the coordinator, `<prefix>.rank<r>.ckp.json` otherwise.
    pub fn path_for<P: AsRef<Path>>(prefix: P, rank: usize) -> PathBuf {
        let prefix = prefix.as_ref().display().to_string();
        if rank == 0 {
            PathBuf::from(format!("{}.ckp.json", prefix))
        } else {
            PathBuf::from(format!("{}.rank{}.ckp.json", prefix, rank))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Writes `<path>.tmp` and renames it over the checkpoint.
    pub fn save(&self, state: &CheckpointState) -> ForgeResult<()> {
        let file = CheckpointFile {
            digest: digest_of(state)?,
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        {
            let mut out = fs::File::create(&tmp)?;
            out.write_all(json.as_bytes())?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(
            "Checkpoint saved to {} ({} candidates, iteration {})",
            self.path.display(),
            state.candidates.len(),
            state.stop_rule.cur_it
        );
        Ok(())
    }

    /// A usable checkpoint of this run, or `None` after a warning.
    pub fn load(&self) -> Option<CheckpointState> {
        if !self.path.exists() {
            return None;
        }
        let state = match Self::read(&self.path) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    "⚠️  Ignoring checkpoint {}: {}. Starting fresh.",
                    self.path.display(),
                    e
                );
                return None;
            }
        };
        if state.fingerprint != self.fingerprint {
            warn!(
                "⚠️  Checkpoint {} belongs to another run. Starting fresh.",
                self.path.display()
            );
            return None;
        }
        info!(
            "♻️  Resuming from {} (phase {}, iteration {})",
            self.path.display(),
            state.phase,
            state.stop_rule.cur_it
        );
        Some(state)
    }

    /// Parses a checkpoint file and verifies its digest, whatever run it belongs to.
    pub fn read<P: AsRef<Path>>(path: P) -> ForgeResult<CheckpointState> {
        let content = fs::read_to_string(path.as_ref())?;
        let file: CheckpointFile = serde_json::from_str(&content)?;
        let expected = digest_of(&file.state)?;
        if expected != file.digest {
            return Err(ForgeError::Validation(format!(
                "checkpoint digest mismatch (stored {}, computed {})",
                file.digest, expected
            )));
        }
        Ok(file.state)
    }
}
