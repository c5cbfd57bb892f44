//! Reference checkers for the security gate.

mod fs;
mod net;
mod os;
mod secret;

pub use fs::FilePermissionsCheck;
pub use net::BindAddrCheck;
pub use os::{RootUserCheck, SwapCheck, SysctlCheck, UlimitCheck};
pub use secret::{shannon_entropy, SecretStrengthCheck, WEAK_SECRETS};
