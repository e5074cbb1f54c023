//! Deterministic identity of a worker configuration, used as the pool key.
//!
//! Only behaviour-relevant fields take part. The API key contributes a
//! `blake3::derive_key` digest rather than the secret itself, so two
//! credentials still pool apart while the key never reaches a log line.

use std::fmt;

use crate::config::WorkerConfig;

const CREDENTIAL_CONTEXT: &str = "heavy-swarm 2025 worker credential fingerprint";
const SHORT_LEN: usize = 12;

/// Hex blake3 digest of a [`WorkerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigFingerprint(String);

impl ConfigFingerprint {
    pub fn of(config: &WorkerConfig) -> Self {
        let mut hasher = blake3::Hasher::new();
        absorb(&mut hasher, "provider", &config.provider.to_string());
        absorb(&mut hasher, "model", &config.model);
        // Bit pattern, so `0.1` always hashes identically.
        let temperature = config
            .temperature
            .map(|t| t.to_bits().to_string())
            .unwrap_or_default();
        absorb(&mut hasher, "temperature", &temperature);
        absorb(&mut hasher, "system_prompt", &config.system_prompt);
        absorb(&mut hasher, "max_iterations", &config.max_iterations.to_string());
        // BTreeSet iterates sorted.
        for tool in &config.tools {
            absorb(&mut hasher, "tool", tool);
        }
        absorb(&mut hasher, "base_url", config.base_url.as_deref().unwrap_or_default());
        absorb(&mut hasher, "cli_path", config.cli_path.as_deref().unwrap_or_default());
        if let Some(key) = &config.api_key {
            let digest = blake3::derive_key(CREDENTIAL_CONTEXT, key.expose().as_bytes());
            hasher.update(b"credential");
            hasher.update(&digest);
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log fields.
    pub fn short(&self) -> &str {
        self.0.get(..SHORT_LEN).unwrap_or(&self.0)
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Length-prefixed so adjacent fields cannot run into each other.
fn absorb(hasher: &mut blake3::Hasher, label: &str, value: &str) {
    hasher.update(label.as_bytes());
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}
