use crate::config::Config;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies the search landscape a checkpoint belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFingerprint {
    pub hash: String,
}

impl RunFingerprint {
    /// Hashes everything that changes which trees the search can reach.
    /// Thread count, stop limits and sync timing may differ between sessions.
    pub fn from_parts(config: &Config, names: &[String], data_digest: &str) -> Self {
        let mut hasher = Sha256::new();

        let mut search = config.search.clone();
        search.threads = 0;
        hasher.update(serde_json::to_string(&search).unwrap_or_default().as_bytes());
        hasher.update(serde_json::to_string(&config.perturb).unwrap_or_default().as_bytes());
        hasher.update(
            serde_json::to_string(&config.bootstrap)
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(config.stop.condition.to_string().as_bytes());

        for name in names {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(data_digest.as_bytes());

        Self {
            hash: hex::encode(hasher.finalize()),
        }
    }

    pub fn short(&self) -> &str {
        &self.hash[..self.hash.len().min(8)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_count_does_not_change_the_fingerprint() {
        let names: Vec<String> = (0..4).map(|i| format!("t{}", i)).collect();
        let a = RunFingerprint::from_parts(&Config::default(), &names, "abc");
        let mut cfg = Config::default();
        cfg.search.threads = 7;
        cfg.stop.max_iterations = 5;
        assert_eq!(a, RunFingerprint::from_parts(&cfg, &names, "abc"));
        cfg.perturb.strength = 0.25;
        assert_ne!(a, RunFingerprint::from_parts(&cfg, &names, "abc"));
        assert_eq!(a.short().len(), 8);
    }
}
