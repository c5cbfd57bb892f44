use std::path::PathBuf;

use crate::{CheckResult, SecurityCheck, Severity};

/// Verifies that a sensitive file (key material, credentials) carries no
/// permission bits beyond `max_mode`, e.g. `0o600`.
pub struct FilePermissionsCheck {
    pub path: PathBuf,
    pub max_mode: u32,
    pub severity: Severity,
}

impl FilePermissionsCheck {
    pub fn new(path: impl Into<PathBuf>, max_mode: u32, severity: Severity) -> Self {
        Self {
            path: path.into(),
            max_mode,
            severity,
        }
    }
}

#[async_trait::async_trait]
impl SecurityCheck for FilePermissionsCheck {
    fn name(&self) -> String {
        format!("file_perm:{}", self.path.display())
    }

    #[cfg(unix)]
    async fn check(&self) -> CheckResult {
        use std::os::unix::fs::PermissionsExt;

        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(err) => {
                return CheckResult::fail(
                    self.name(),
                    self.severity,
                    format!("File not found or not readable: {}", self.path.display()),
                )
                .with_error(err.into());
            }
        };

        let mode = metadata.permissions().mode() & 0o777;
        if mode & !self.max_mode != 0 {
            return CheckResult::fail(
                self.name(),
                self.severity,
                format!(
                    "Insecure permissions: got {:o}, max allowed {:o}",
                    mode, self.max_mode
                ),
            );
        }
        CheckResult::pass(self.name())
    }

    #[cfg(not(unix))]
    async fn check(&self) -> CheckResult {
        CheckResult::skip(self.name(), "Skipped on non-unix OS")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn tight_permissions_pass() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        let check = FilePermissionsCheck::new(file.path(), 0o600, Severity::Fatal);
        assert!(check.check().await.passed);
    }

    #[tokio::test]
    async fn world_readable_key_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();
        let check = FilePermissionsCheck::new(file.path(), 0o600, Severity::Fatal);
        let result = check.check().await;
        assert!(!result.passed);
        assert!(result.message.contains("Insecure permissions"));
    }

    #[tokio::test]
    async fn missing_file_fails_with_error() {
        let check =
            FilePermissionsCheck::new("/nonexistent/keel-test-key", 0o600, Severity::Warn);
        let result = check.check().await;
        assert!(!result.passed);
        assert!(result.error.is_some());
    }
}
