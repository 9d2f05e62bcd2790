// SecretMasker: keeps broker credentials and other secret values out of logs.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// Secrets shorter than this are not masked; they would blank out ordinary words.
const MIN_SECRET_LENGTH: usize = 3;

/// A thread-safe set of secret values that are replaced with `***` in output.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value. Blank and very short values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.len() < MIN_SECRET_LENGTH {
            return;
        }

        let mut secrets = self.secrets.write();
        if secrets.iter().any(|s| s == trimmed) {
            return;
        }
        secrets.push(trimmed.to_string());
        // Longest first, so a secret containing another is masked whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Replace every registered secret in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        secrets.iter().fold(input.to_string(), |acc, secret| {
            if acc.contains(secret.as_str()) {
                acc.replace(secret.as_str(), MASK)
            } else {
                acc
            }
        })
    }
}
