use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Result, SyncError};

pub const DEFAULT_HOSTS: &[&str] = &["ln.hako.vn", "docln.net", "docln.sbs"];
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_COOLDOWN_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CATALOG_FILE: &str = "ln_info.json";
pub const HOSTS_ENV: &str = "HAKO2EPUB_HOSTS";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/96.0.4664.97 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interchangeable origins, primary first.
    pub hosts: Vec<Url>,
    pub output_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_cooldown: Duration,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub user_agent: String,
    /// BCP-47 language tag written into artifacts.
    pub lang: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let hosts = DEFAULT_HOSTS
            .iter()
            .filter_map(|host| parse_host(host).ok())
            .collect();
        Self {
            hosts,
            output_dir: PathBuf::from("."),
            catalog_path: PathBuf::from(DEFAULT_CATALOG_FILE),
            workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_cooldown: Duration::from_secs(DEFAULT_RETRY_COOLDOWN_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            user_agent: USER_AGENT.to_string(),
            lang: "vi".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn with_hosts<S: AsRef<str>>(mut self, hosts: &[S]) -> Result<Self> {
        if hosts.is_empty() {
            return Err(SyncError::config("at least one host is required"));
        }
        self.hosts = hosts
            .iter()
            .map(|raw| parse_host(raw.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }
}

/// Reads the comma separated host override, if set and non-empty.
pub fn hosts_from_env() -> Option<Vec<String>> {
    let raw = std::env::var(HOSTS_ENV).ok()?;
    let hosts = split_host_list(&raw);
    if hosts.is_empty() { None } else { Some(hosts) }
}

pub fn split_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `ln.hako.vn`, `https://ln.hako.vn/` or `http://127.0.0.1:8080` into an origin URL.
pub fn parse_host(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SyncError::config("empty host"));
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|err| SyncError::config(format!("invalid host {raw:?}: {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(SyncError::config(format!("host must be http/https: {raw}")));
    }
    if url.host_str().is_none() {
        return Err(SyncError::config(format!("host must have a host name: {raw}")));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_accepts_bare_names_and_origins() {
        assert_eq!(
            parse_host("ln.hako.vn").unwrap().as_str(),
            "https://ln.hako.vn/"
        );
        assert_eq!(
            parse_host("http://127.0.0.1:8080/some/path?q=1").unwrap().as_str(),
            "http://127.0.0.1:8080/"
        );
        assert!(parse_host("ftp://example.com").is_err());
        assert!(parse_host("  ").is_err());
    }

    #[test]
    fn default_config_has_three_hosts() {
        let config = SyncConfig::default();
        assert_eq!(config.hosts.len(), 3);
        assert_eq!(config.hosts[0].host_str(), Some("ln.hako.vn"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn split_host_list_skips_blanks() {
        assert_eq!(
            split_host_list(" a.example , ,b.example"),
            vec!["a.example".to_string(), "b.example".to_string()]
        );
    }
}
