//! Resilient fetching across interchangeable hosts.
//!
//! [`HostPool`] is probed once per run and never mutated afterwards. [`Fetcher`]
//! rewrites every request for a known host onto each active host in turn, retrying
//! transient failures with a fixed cooldown before failing over.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::REFERER;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{AttemptError, Result, SyncError};

/// The set of interchangeable origins for one run.
#[derive(Debug, Clone)]
pub struct HostPool {
    known: Vec<Url>,
    active: Vec<Url>,
}

impl HostPool {
    /// Uses every host without probing.
    pub fn from_hosts(hosts: Vec<Url>) -> Self {
        Self {
            active: hosts.clone(),
            known: hosts,
        }
    }

    /// Probes each host once and keeps the ones that answer with a success status.
    pub async fn probe(client: &Client, hosts: &[Url], timeout: Duration) -> Result<Self> {
        let mut active = Vec::with_capacity(hosts.len());
        for host in hosts {
            let outcome = client
                .get(host.clone())
                .timeout(timeout)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            match outcome {
                Ok(_) => {
                    debug!(host = %host, "host is reachable");
                    active.push(host.clone());
                }
                Err(err) => {
                    warn!(host = %host, error = %err, "host is not reachable; dropping it for this run");
                }
            }
        }

        if active.is_empty() {
            return Err(SyncError::NoReachableHost {
                hosts: hosts
                    .iter()
                    .map(|h| h.as_str().trim_end_matches('/').to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        info!(
            active = active.len(),
            configured = hosts.len(),
            "host probe finished"
        );
        Ok(Self {
            known: hosts.to_vec(),
            active,
        })
    }

    pub fn active(&self) -> &[Url] {
        &self.active
    }

    /// The first configured host; canonical URLs are expressed against it.
    pub fn primary(&self) -> Option<&Url> {
        self.known.first()
    }

    pub fn is_known(&self, url: &Url) -> bool {
        self.known.iter().any(|host| same_host(host, url))
    }

    /// Rewrites a URL on any known host onto the primary host.
    pub fn canonicalize(&self, url: &Url) -> Url {
        match self.primary() {
            Some(primary) if self.is_known(url) => rebase(url, primary),
            _ => url.clone(),
        }
    }

    /// Turns user or page supplied text into an absolute URL.
    ///
    /// Scheme-less input gets `https://`; root-relative paths resolve against the
    /// primary host.
    pub fn resolve(&self, raw: &str) -> Result<Url> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SyncError::invalid_url(raw));
        }
        if raw.starts_with('/') && !raw.starts_with("//") {
            let primary = self
                .primary()
                .ok_or_else(|| SyncError::config("no host configured"))?;
            return primary
                .join(raw)
                .map_err(|_| SyncError::invalid_url(raw));
        }
        let candidate = if raw.starts_with("//") {
            format!("https:{raw}")
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };
        Url::parse(&candidate).map_err(|_| SyncError::invalid_url(raw))
    }

    /// Every concrete URL to try, in failover order.
    pub(crate) fn candidates(&self, url: &Url) -> Vec<Url> {
        if self.is_known(url) {
            self.active.iter().map(|host| rebase(url, host)).collect()
        } else {
            vec![url.clone()]
        }
    }
}

fn same_host(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port() == b.port()
}

fn rebase(url: &Url, host: &Url) -> Url {
    let mut out = host.clone();
    out.set_path(url.path());
    out.set_query(url.query());
    out.set_fragment(None);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// HTML page, decoded as text.
    Page,
    /// Raw bytes (images).
    Binary,
}

#[derive(Debug, Clone)]
pub enum Document {
    Page { url: Url, html: String },
    Binary { url: Url, bytes: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            cooldown: config.retry_cooldown,
        }
    }
}

enum AttemptOutcome {
    NotFound,
    Retryable(AttemptError),
}

/// Single request contract over the host pool. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Fetcher {
    client: Client,
    hosts: Arc<HostPool>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(client: Client, hosts: Arc<HostPool>, policy: RetryPolicy) -> Self {
        Self {
            client,
            hosts,
            policy,
        }
    }

    pub fn build_client(config: &SyncConfig) -> Result<Client> {
        Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|err| SyncError::config(format!("build http client: {err}")))
    }

    pub fn hosts(&self) -> &HostPool {
        &self.hosts
    }

    pub async fn fetch(&self, url: &Url, kind: FetchKind) -> Result<Document> {
        let mut attempts = 0_u32;
        let mut last: Option<AttemptError> = None;

        for candidate in self.hosts.candidates(url) {
            let referer = candidate.origin().ascii_serialization();
            for attempt in 1..=self.policy.max_attempts {
                attempts += 1;
                match self.attempt(&candidate, &referer, kind).await {
                    Ok(document) => return Ok(document),
                    Err(AttemptOutcome::NotFound) => {
                        return Err(SyncError::NotFound {
                            url: candidate.to_string(),
                        });
                    }
                    Err(AttemptOutcome::Retryable(err)) => {
                        debug!(
                            url = %candidate,
                            attempt,
                            max_attempts = self.policy.max_attempts,
                            error = %err,
                            "request failed"
                        );
                        last = Some(err);
                        if attempt < self.policy.max_attempts {
                            tokio::time::sleep(self.policy.cooldown).await;
                        }
                    }
                }
            }
            debug!(url = %candidate, "host exhausted; trying next host");
        }

        match last {
            Some(last) => Err(SyncError::NetworkExhausted {
                url: url.to_string(),
                attempts,
                last,
            }),
            None => Err(SyncError::NoReachableHost {
                hosts: String::new(),
            }),
        }
    }

    pub async fn fetch_page(&self, url: &Url) -> Result<(Url, String)> {
        match self.fetch(url, FetchKind::Page).await? {
            Document::Page { url, html } => Ok((url, html)),
            Document::Binary { url, bytes } => {
                Ok((url, String::from_utf8_lossy(&bytes).into_owned()))
            }
        }
    }

    pub async fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        match self.fetch(url, FetchKind::Binary).await? {
            Document::Binary { bytes, .. } => Ok(bytes),
            Document::Page { html, .. } => Ok(html.into_bytes()),
        }
    }

    async fn attempt(
        &self,
        url: &Url,
        referer: &str,
        kind: FetchKind,
    ) -> std::result::Result<Document, AttemptOutcome> {
        let response = self
            .client
            .get(url.clone())
            .header(REFERER, referer)
            .send()
            .await
            .map_err(|err| AttemptOutcome::Retryable(err.into()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AttemptOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(AttemptOutcome::Retryable(AttemptError::Status(status)));
        }

        let final_url = response.url().clone();
        match kind {
            FetchKind::Page => {
                let html = response
                    .text()
                    .await
                    .map_err(|err| AttemptOutcome::Retryable(err.into()))?;
                Ok(Document::Page {
                    url: final_url,
                    html,
                })
            }
            FetchKind::Binary => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| AttemptOutcome::Retryable(err.into()))?;
                Ok(Document::Binary {
                    url: final_url,
                    bytes: bytes.to_vec(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_host;

    fn pool(hosts: &[&str]) -> HostPool {
        HostPool::from_hosts(hosts.iter().map(|h| parse_host(h).unwrap()).collect())
    }

    #[test]
    fn known_urls_fan_out_over_active_hosts() {
        let pool = pool(&["ln.hako.vn", "docln.net"]);
        let url = Url::parse("https://docln.net/truyen/123-abc?x=1").unwrap();
        let candidates = pool.candidates(&url);
        assert_eq!(
            candidates.iter().map(Url::as_str).collect::<Vec<_>>(),
            vec![
                "https://ln.hako.vn/truyen/123-abc?x=1",
                "https://docln.net/truyen/123-abc?x=1",
            ]
        );
    }

    #[test]
    fn foreign_urls_are_not_rewritten() {
        let pool = pool(&["ln.hako.vn", "docln.net"]);
        let url = Url::parse("https://i.imgur.com/abc.jpg").unwrap();
        assert_eq!(pool.candidates(&url), vec![url]);
    }

    #[test]
    fn canonicalize_maps_mirrors_onto_primary() {
        let pool = pool(&["ln.hako.vn", "docln.net"]);
        let url = Url::parse("http://docln.net/truyen/1#top").unwrap();
        assert_eq!(
            pool.canonicalize(&url).as_str(),
            "https://ln.hako.vn/truyen/1"
        );
    }

    #[test]
    fn resolve_handles_relative_and_schemeless_input() {
        let pool = pool(&["ln.hako.vn"]);
        assert_eq!(
            pool.resolve("/truyen/1/c2").unwrap().as_str(),
            "https://ln.hako.vn/truyen/1/c2"
        );
        assert_eq!(
            pool.resolve("docln.net/truyen/1").unwrap().as_str(),
            "https://docln.net/truyen/1"
        );
        assert_eq!(
            pool.resolve("//i.imgur.com/a.png").unwrap().as_str(),
            "https://i.imgur.com/a.png"
        );
        assert!(pool.resolve("").is_err());
    }

    #[test]
    fn hosts_differ_by_port() {
        let pool = pool(&["http://127.0.0.1:8080"]);
        assert!(pool.is_known(&Url::parse("http://127.0.0.1:8080/a").unwrap()));
        assert!(!pool.is_known(&Url::parse("http://127.0.0.1:9090/a").unwrap()));
    }
}
