use crate::{CheckResult, SecurityCheck, Severity};

/// Flags processes running with an effective UID of 0. Skipped on
/// Windows, where the concept does not map.
pub struct RootUserCheck {
    pub severity: Severity,
}

impl RootUserCheck {
    pub fn new(severity: Severity) -> Self {
        Self { severity }
    }
}

#[async_trait::async_trait]
impl SecurityCheck for RootUserCheck {
    fn name(&self) -> String {
        "root_user".to_string()
    }

    #[cfg(unix)]
    async fn check(&self) -> CheckResult {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };
        if euid == 0 {
            return CheckResult::fail(
                self.name(),
                self.severity,
                "Application is running as root (UID 0). This is insecure.",
            );
        }
        CheckResult::pass(self.name())
    }

    #[cfg(not(unix))]
    async fn check(&self) -> CheckResult {
        CheckResult::pass(self.name())
    }
}

/// Checks the soft file-descriptor limit against a minimum suitable for
/// the expected connection volume.
pub struct UlimitCheck {
    pub min_limit: u64,
    pub severity: Severity,
}

impl UlimitCheck {
    pub fn new(min_limit: u64, severity: Severity) -> Self {
        Self {
            min_limit,
            severity,
        }
    }
}

#[async_trait::async_trait]
impl SecurityCheck for UlimitCheck {
    fn name(&self) -> String {
        "os_ulimit".to_string()
    }

    #[cfg(target_os = "linux")]
    async fn check(&self) -> CheckResult {
        let mut rlimit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: rlimit is a plain out-parameter struct.
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlimit) };
        if rc != 0 {
            return CheckResult::fail(
                self.name(),
                Severity::Warn,
                "Failed to get RLIMIT_NOFILE",
            )
            .with_error(std::io::Error::last_os_error().into());
        }

        if rlimit.rlim_cur < self.min_limit {
            return CheckResult::fail(
                self.name(),
                self.severity,
                format!(
                    "Soft FD limit is too low: {} (recommended >= {}). May affect high concurrency.",
                    rlimit.rlim_cur, self.min_limit
                ),
            );
        }
        CheckResult::pass(self.name())
    }

    #[cfg(not(target_os = "linux"))]
    async fn check(&self) -> CheckResult {
        CheckResult::skip(self.name(), "Skipped on non-linux OS")
    }
}

/// Compares a kernel tunable under `/proc/sys` against a minimum, e.g.
/// `net.core.somaxconn`. Unreadable tunables (unprivileged containers)
/// are skipped rather than failed.
pub struct SysctlCheck {
    pub key: String,
    pub min_value: i64,
    pub severity: Severity,
}

impl SysctlCheck {
    pub fn new(key: impl Into<String>, min_value: i64, severity: Severity) -> Self {
        Self {
            key: key.into(),
            min_value,
            severity,
        }
    }
}

#[async_trait::async_trait]
impl SecurityCheck for SysctlCheck {
    fn name(&self) -> String {
        format!("os_sysctl:{}", self.key)
    }

    #[cfg(target_os = "linux")]
    async fn check(&self) -> CheckResult {
        let path = format!("/proc/sys/{}", self.key.replace('.', "/"));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => {
                return CheckResult::skip(
                    self.name(),
                    format!("Skipped: cannot read sysctl {}", self.key),
                );
            }
        };

        let value: i64 = match content.trim().parse() {
            Ok(v) => v,
            Err(err) => {
                return CheckResult::fail(
                    self.name(),
                    Severity::Warn,
                    "Invalid sysctl value format",
                )
                .with_error(anyhow::Error::new(err));
            }
        };

        if value < self.min_value {
            return CheckResult::fail(
                self.name(),
                self.severity,
                format!(
                    "Kernel param {} is {} (recommended >= {}). Performance may be throttled.",
                    self.key, value, self.min_value
                ),
            );
        }
        CheckResult::pass(self.name())
    }

    #[cfg(not(target_os = "linux"))]
    async fn check(&self) -> CheckResult {
        CheckResult::skip(self.name(), "Skipped on non-linux OS")
    }
}

/// Detects enabled swap devices. Swapping a latency-sensitive service is
/// usually a misconfiguration worth surfacing.
pub struct SwapCheck {
    pub severity: Severity,
}

impl SwapCheck {
    pub fn new(severity: Severity) -> Self {
        Self { severity }
    }
}

#[async_trait::async_trait]
impl SecurityCheck for SwapCheck {
    fn name(&self) -> String {
        "os_swap".to_string()
    }

    #[cfg(target_os = "linux")]
    async fn check(&self) -> CheckResult {
        let content = match tokio::fs::read_to_string("/proc/swaps").await {
            Ok(c) => c,
            Err(_) => {
                return CheckResult::skip(self.name(), "Cannot read /proc/swaps");
            }
        };

        let devices = content
            .lines()
            .filter(|line| !line.starts_with("Filename") && !line.trim().is_empty())
            .count();

        if devices > 0 {
            return CheckResult::fail(
                self.name(),
                self.severity,
                "System swap is enabled. This may cause latency spikes.",
            );
        }
        CheckResult::pass(self.name())
    }

    #[cfg(not(target_os = "linux"))]
    async fn check(&self) -> CheckResult {
        CheckResult::skip(self.name(), "Skipped on non-linux OS")
    }
}
