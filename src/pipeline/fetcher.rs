//! Bounded, cached fetch of a brand's homepage.
//!
//! The analyzer consults the brand domain for a reference term corpus and
//! reachability. One fetch per host per process; hits and failures are both
//! cached so a dead domain costs one timeout, not one per response.

use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub host: String,
    pub reachable: bool,
    /// Salient lowercase terms from the homepage (title, meta description,
    /// top headings); used for the entity-completeness check.
    pub terms: Vec<String>,
}

impl DomainSnapshot {
    pub fn unreachable(host: String) -> Self {
        Self { host, reachable: false, terms: vec![] }
    }
}

pub struct DomainFetcher {
    client: reqwest::Client,
    cache: DashMap<String, DomainSnapshot>,
}

impl DomainFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        // Separate client from the provider pool: short timeout, tiny pool.
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(16)
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()?;
        Ok(Self { client, cache: DashMap::new() })
    }

    /// Fetch (or recall) the snapshot for a domain. Cache writes are
    /// last-writer-wins; concurrent first fetches of the same host are
    /// harmless duplicates.
    pub async fn snapshot(&self, domain: &str) -> DomainSnapshot {
        let Some(host) = normalize_host(domain) else {
            return DomainSnapshot::unreachable(domain.trim().to_lowercase());
        };

        if let Some(cached) = self.cache.get(&host) {
            return cached.clone();
        }

        let snapshot = match self.fetch(&host).await {
            Ok(html) => DomainSnapshot { host: host.clone(), reachable: true, terms: extract_terms(&html) },
            Err(e) => {
                tracing::debug!(host, "domain fetch failed: {e}");
                DomainSnapshot::unreachable(host.clone())
            }
        };
        self.cache.insert(host, snapshot.clone());
        snapshot
    }

    async fn fetch(&self, host: &str) -> Result<String, reqwest::Error> {
        let resp = self.client.get(format!("https://{host}/")).send().await?;
        let resp = resp.error_for_status()?;
        resp.text().await
    }
}

/// Canonical cache key for a user-supplied domain: lowercased host with any
/// scheme, path, and leading `www.` stripped.
pub fn normalize_host(domain: &str) -> Option<String> {
    let raw = domain.trim().to_lowercase();
    if raw.is_empty() {
        return None;
    }
    let with_scheme =
        if raw.contains("://") { raw.clone() } else { format!("https://{raw}") };
    let host = Url::parse(&with_scheme).ok()?.host_str()?.to_string();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.contains('.') {
        Some(host)
    } else {
        None
    }
}

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static regex"));
static META_DESC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<meta[^>]+name=["']description["'][^>]+content=["']([^"']*)["']"#)
        .expect("static regex")
});
static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h[12][^>]*>(.*?)</h[12]>").expect("static regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"));

/// Pull a small reference vocabulary out of homepage HTML.
pub fn extract_terms(html: &str) -> Vec<String> {
    let mut fragments: Vec<String> = Vec::new();
    if let Some(c) = TITLE_RE.captures(html) {
        fragments.push(c[1].to_string());
    }
    if let Some(c) = META_DESC_RE.captures(html) {
        fragments.push(c[1].to_string());
    }
    for c in HEADING_RE.captures_iter(html).take(8) {
        fragments.push(c[1].to_string());
    }

    let mut terms: Vec<String> = Vec::new();
    for fragment in fragments {
        let text = TAG_RE.replace_all(&fragment, " ");
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            let w = word.trim().to_lowercase();
            if w.len() >= 4 && !terms.contains(&w) {
                terms.push(w);
            }
        }
    }
    terms.truncate(40);
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_host_strips_scheme_path_and_www() {
        assert_eq!(normalize_host("https://www.acme.com/about"), Some("acme.com".into()));
        assert_eq!(normalize_host("Acme.COM"), Some("acme.com".into()));
        assert_eq!(normalize_host("http://shop.acme.co.uk"), Some("shop.acme.co.uk".into()));
        assert_eq!(normalize_host(""), None);
        assert_eq!(normalize_host("localhost"), None);
    }

    #[test]
    fn extract_terms_reads_title_meta_and_headings() {
        let html = r#"
            <html><head>
            <title>Acme — Widget Automation Platform</title>
            <meta name="description" content="Automate widget pipelines with Acme.">
            </head><body>
            <h1>Ship <b>widgets</b> faster</h1>
            <h2>Integrations</h2>
            </body></html>
        "#;
        let terms = extract_terms(html);
        assert!(terms.contains(&"widget".to_string()));
        assert!(terms.contains(&"automation".to_string()));
        assert!(terms.contains(&"integrations".to_string()));
        // tags are stripped, short words dropped
        assert!(!terms.iter().any(|t| t.contains('<')));
        assert!(!terms.contains(&"the".to_string()));
    }

    #[test]
    fn extract_terms_deduplicates() {
        let html = "<title>widgets widgets widgets</title>";
        let terms = extract_terms(html);
        assert_eq!(terms.iter().filter(|t| *t == "widgets").count(), 1);
    }

    #[tokio::test]
    async fn snapshot_caches_failures_per_host() {
        let fetcher = DomainFetcher::new(Duration::from_millis(200)).unwrap();
        let first = fetcher.snapshot("definitely-not-resolvable.invalid").await;
        assert!(!first.reachable);

        // The failure is cached; a second call is answered without a fetch.
        let second = fetcher.snapshot("www.definitely-not-resolvable.invalid").await;
        assert!(!second.reachable);
        assert_eq!(fetcher.cache.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_handles_invalid_domains_without_caching() {
        let fetcher = DomainFetcher::new(Duration::from_millis(200)).unwrap();
        let snap = fetcher.snapshot("not a domain").await;
        assert!(!snap.reachable);
        assert!(snap.terms.is_empty());
    }
}
