use std::collections::HashMap;

use crate::{CheckResult, SecurityCheck, Severity};

/// Weak values that show up constantly in development configs.
pub const WEAK_SECRETS: &[&str] = &[
    "123456",
    "12345678",
    "123456789",
    "password",
    "secret",
    "admin",
    "root",
    "changeme",
    "default",
    "actuator",
    "manager",
    "111111",
    "qwerty",
    "1234567890",
    "system",
    "service",
    "auth",
    "token",
    "key",
];

const DEFAULT_MIN_LENGTH: usize = 8;
// "12345678" scores about 2.0, a random 8-char string about 4.0.
const DEFAULT_MIN_ENTROPY: f64 = 2.5;

/// Shannon entropy over character frequencies: −Σ pᵢ·log₂(pᵢ).
pub fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let len = s.chars().count() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Rejects secrets that are empty, short, on the weak list, low-entropy,
/// or lacking a letter + digit/symbol mix (the mix is only a warning).
pub struct SecretStrengthCheck {
    /// Which secret this is, e.g. `jwt_signing_key`.
    pub label: String,
    pub secret: String,
    /// Minimum byte length; 0 means the default of 8.
    pub min_length: usize,
    /// Minimum Shannon entropy; 0.0 means the default of 2.5.
    pub min_entropy: f64,
}

impl SecretStrengthCheck {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
            min_length: 0,
            min_entropy: 0.0,
        }
    }
}

#[async_trait::async_trait]
impl SecurityCheck for SecretStrengthCheck {
    fn name(&self) -> String {
        format!("secret_strength:{}", self.label)
    }

    async fn check(&self) -> CheckResult {
        if self.secret.is_empty() {
            return CheckResult::fail(self.name(), Severity::Fatal, "Secret is empty");
        }

        let min_length = if self.min_length == 0 {
            DEFAULT_MIN_LENGTH
        } else {
            self.min_length
        };
        if self.secret.len() < min_length {
            return CheckResult::fail(
                self.name(),
                Severity::Fatal,
                format!(
                    "Secret is too short ({} chars), must be at least {} chars",
                    self.secret.len(),
                    min_length
                ),
            );
        }

        for weak in WEAK_SECRETS {
            if self.secret.eq_ignore_ascii_case(weak) {
                return CheckResult::fail(
                    self.name(),
                    Severity::Fatal,
                    format!("Secret uses a common weak value: '{weak}'"),
                );
            }
        }

        // Length alone does not reject "aaaaaaaa"; entropy does.
        let min_entropy = if self.min_entropy == 0.0 {
            DEFAULT_MIN_ENTROPY
        } else {
            self.min_entropy
        };
        let entropy = shannon_entropy(&self.secret);
        if entropy < min_entropy {
            return CheckResult::fail(
                self.name(),
                Severity::Fatal,
                format!(
                    "Secret entropy is too low ({entropy:.2} < {min_entropy:.2}). \
                     Avoid repeating characters or simple sequences."
                ),
            );
        }

        let has_letter = self.secret.chars().any(|c| c.is_alphabetic());
        let has_digit_or_symbol = self
            .secret
            .chars()
            .any(|c| c.is_ascii_digit() || c.is_ascii_punctuation());
        if !has_letter || !has_digit_or_symbol {
            return CheckResult::fail(
                self.name(),
                Severity::Warn,
                "Secret should contain a mix of letters and numbers/symbols",
            );
        }

        CheckResult::pass(self.name())
    }
}
