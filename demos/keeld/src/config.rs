use envconfig::Envconfig;
use serde::Serialize;

#[derive(Envconfig, Clone, Serialize)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: String,

    #[envconfig(default = "127.0.0.1:9090")]
    pub monitor_address: String,

    /// PEM certificate chain; empty disables TLS.
    #[envconfig(default = "")]
    pub cert_file: String,

    #[envconfig(default = "")]
    pub key_file: String,

    #[envconfig(default = "false")]
    pub enable_http3: bool,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    /// Allow binding on 0.0.0.0 without a gate warning.
    #[envconfig(default = "false")]
    pub allow_public_bind: bool,

    /// Demo secret, checked by the security gate.
    #[envconfig(default = "d3m0-Secret-8231")]
    pub api_secret: String,
}
