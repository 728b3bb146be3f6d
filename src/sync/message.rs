use super::{SyncError, SyncResult};
use crate::bootstrap::ReplicateSlice;
use crate::candidates::CandidateRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: usize,
    pub round: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Once per iteration from a worker. `tree: None` means the iteration produced nothing.
    Report {
        tree: Option<String>,
        score: f64,
        leaving: bool,
        bootstrap: Option<ReplicateSlice>,
    },
    CandidateBatch {
        trees: Vec<CandidateRecord>,
    },
    /// `candidates: None` tells the worker its view is still current.
    Reply {
        candidates: Option<Vec<CandidateRecord>>,
        logl_cutoff: Option<f64>,
    },
    Stop,
    /// First line a worker sends over a fresh TCP connection.
    Hello {
        rank: usize,
    },
}

impl Envelope {
    pub fn new(source: usize, round: u64, payload: Payload) -> Self {
        Self {
            source,
            round,
            payload,
        }
    }

    /// One line of JSON, newline included.
    pub fn to_line(&self) -> SyncResult<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| SyncError::Malformed(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> SyncResult<Self> {
        serde_json::from_str(line.trim_end()).map_err(|e| SyncError::Malformed(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            Payload::Report { .. } => "report",
            Payload::CandidateBatch { .. } => "candidate_batch",
            Payload::Reply { .. } => "reply",
            Payload::Stop => "stop",
            Payload::Hello { .. } => "hello",
        }
    }
}
