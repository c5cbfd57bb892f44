use crate::{CheckResult, SecurityCheck, Severity};

/// Flags listen addresses that expose the service on every interface.
///
/// Matches IPv4 and IPv6 wildcard forms as well as the bare `:port`
/// shorthand. Set `allow_public` when the exposure is intended (e.g. the
/// service sits behind its own edge).
pub struct BindAddrCheck {
    pub addr: String,
    pub allow_public: bool,
}

impl BindAddrCheck {
    pub fn new(addr: impl Into<String>, allow_public: bool) -> Self {
        Self {
            addr: addr.into(),
            allow_public,
        }
    }
}

#[async_trait::async_trait]
impl SecurityCheck for BindAddrCheck {
    fn name(&self) -> String {
        format!("network_bind:{}", self.addr)
    }

    async fn check(&self) -> CheckResult {
        let is_public = self.addr.contains("0.0.0.0")
            || self.addr.contains("[::]")
            || self.addr.starts_with(':');

        if is_public && !self.allow_public {
            return CheckResult::fail(
                self.name(),
                Severity::Warn,
                format!(
                    "Service is listening on all interfaces ({}). Ensure this is intended.",
                    self.addr
                ),
            );
        }
        CheckResult::pass(self.name())
    }
}
