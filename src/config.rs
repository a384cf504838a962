//! Configuration surface (§6): a TOML file is the source of truth; the CLI
//! names only its path, following the teacher's `Config`/`ConfigFile` split
//! but trimmed to this gateway's narrower option set.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "meshgate", about = "Client-side multiplexed tunnel proxy gateway")]
pub struct Cli {
    /// Path to the TOML config file.
    pub config: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub server: ServerConfig,
    #[serde(default)]
    pub socks5: Socks5Config,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub local_http_server: LocalHttpServerConfig,
    pub tun: TunConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub user_name: String,
    pub password: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Socks5Config {
    #[serde(rename = "listenAddress", default = "default_socks5_addr")]
    pub listen_address: String,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            listen_address: default_socks5_addr(),
        }
    }
}

fn default_socks5_addr() -> String {
    "127.0.0.1:1080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(rename = "listenAddress", default = "default_http_addr")]
    pub listen_address: String,
    /// Whether non-CONNECT requests are forwarded (§4.6); CONNECT is always
    /// handled. Not named in spec.md §6 as a literal TOML key, but the
    /// acceptor needs a switch, so it lives here rather than as a hidden
    /// constant.
    #[serde(default = "default_true")]
    pub allow_plain_http: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: default_http_addr(),
            allow_plain_http: true,
        }
    }
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalHttpServerConfig {
    #[serde(rename = "listenAddress", default = "default_admin_addr")]
    pub listen_address: String,
}

impl Default for LocalHttpServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_admin_addr(),
        }
    }
}

fn default_admin_addr() -> String {
    "127.0.0.1:9000".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunConfig {
    #[serde(default = "default_tun_count")]
    pub count: usize,
    #[serde(default = "default_tun_cap")]
    pub cap: u16,
    /// Used only by a `fix` selector as its sole candidate; ignored by
    /// `auto`/`web`.
    #[serde(default)]
    pub url: String,
    #[serde(rename = "authKey", default)]
    pub auth_key: String,
}

fn default_tun_count() -> usize {
    4
}

fn default_tun_cap() -> u16 {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    Auto,
    Fix,
    /// Single user-pinned node, updated later by `POST /change` (§4.5,
    /// §4.7). Not one of spec.md §6's literal `{auto, fix}` pair, but the
    /// legacy `node.id` pin and the admin surface both need a selector that
    /// can hold exactly one entry and be hot-swapped.
    Web,
}

impl Default for SelectorType {
    fn default() -> Self {
        SelectorType::Auto
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectorConfig {
    #[serde(rename = "type", default)]
    pub selector_type: SelectorType,
    #[serde(default)]
    pub area_id: String,
    #[serde(default)]
    pub default_node_id: String,
    /// AutoSelector connectivity-probe timeout; spec.md §9 flags the 30s
    /// default as wanting to be configurable (SPEC_FULL.md §6).
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_probe_timeout_secs() -> u64 {
    30
}

impl SelectorConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Legacy single-node pin (§6: "`node.id` — legacy single-node pin").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    NotFound(PathBuf),
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("server.user_name, server.password and server.url are required")]
    MissingCredentials,
    #[error("tun.count must be at least 1")]
    InvalidTunCount,
}

pub fn load(path: &Path) -> Result<ConfigFile, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    let cfg: ConfigFile =
        toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &ConfigFile) -> Result<(), ConfigError> {
    if cfg.server.user_name.is_empty() || cfg.server.password.is_empty() || cfg.server.url.is_empty()
    {
        return Err(ConfigError::MissingCredentials);
    }
    if cfg.tun.count == 0 {
        return Err(ConfigError::InvalidTunCount);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempPath(PathBuf);

    impl TempPath {
        fn new(contents: &str) -> Self {
            let mut path = std::env::temp_dir();
            let unique = format!(
                "meshgate-test-{}-{:?}.toml",
                std::process::id(),
                std::thread::current().id()
            );
            path.push(unique);
            std::fs::write(&path, contents).expect("write temp config");
            Self(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn parses_minimal_config() {
        let toml_text = r#"
            [server]
            user_name = "alice"
            password = "secret"
            url = "https://catalog.example.com"

            [tun]
            count = 3
            cap = 32
        "#;
        let tmp = TempPath::new(toml_text);
        let cfg = load(tmp.path()).unwrap();
        assert_eq!(cfg.tun.count, 3);
        assert_eq!(cfg.tun.cap, 32);
        assert_eq!(cfg.socks5.listen_address, "127.0.0.1:1080");
        assert_eq!(cfg.selector.selector_type, SelectorType::Auto);
        assert_eq!(cfg.selector.probe_timeout_secs, 30);
    }

    #[test]
    fn missing_credentials_is_rejected() {
        let toml_text = r#"
            [server]
            user_name = ""
            password = ""
            url = ""

            [tun]
            count = 1
        "#;
        let tmp = TempPath::new(toml_text);
        assert!(matches!(
            load(tmp.path()),
            Err(ConfigError::MissingCredentials)
        ));
    }

    #[test]
    fn nonexistent_path_is_rejected() {
        assert!(matches!(
            load(Path::new("/nonexistent/path/meshgate.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }
}
