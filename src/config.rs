use serde::Deserialize;

use crate::providers::ProviderId;

/// Per-provider limits and credentials.
///
/// A provider only appears in the registry when its API key is present, so a
/// missing key means the provider is simply unavailable for audits rather
/// than silently calling upstream with an empty credential.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub id: ProviderId,
    pub api_key: String,
    /// Requests per minute allowed against this provider, process-wide.
    pub rpm: u32,
    /// Tokens per minute allowed against this provider, process-wide.
    pub tpm: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    /// Number of concurrent audit workers. Default: 2.
    pub worker_count: usize,
    /// Width of the orchestrator fan-out semaphore. Default: 16.
    pub orchestrator_concurrency: usize,
    /// Width of the analyzer semaphore. Default: 10.
    pub analyzer_concurrency: usize,
    /// Target query count when an audit does not specify one. Default: 48.
    pub default_query_count: usize,
    /// Heartbeat write cadence while an audit is in-flight. Default: 30s.
    pub heartbeat_interval_secs: u64,
    /// Age after which the surrounding service may reap an audit. Default: 300s.
    /// Parsed here so the whole deployment reads one knob; the reaper itself
    /// lives outside this crate.
    pub stuck_audit_secs: u64,
    /// Timeout for brand-domain reference fetches. Default: 5s.
    pub domain_fetch_timeout_secs: u64,
    pub providers: Vec<ProviderSettings>,
}

/// Default RPM/TPM caps applied when the env does not override them.
/// Conservative enough to stay under every provider's entry-tier limits.
fn default_limits(id: ProviderId) -> (u32, u32) {
    match id {
        ProviderId::OpenAi => (500, 200_000),
        ProviderId::Anthropic => (300, 100_000),
        ProviderId::Google => (360, 120_000),
        ProviderId::Perplexity => (60, 50_000),
    }
}

/// Build the process configuration. This is the only place the environment is
/// read; every component receives its settings through constructors.
pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let mut providers = Vec::new();
    for id in ProviderId::ALL {
        let prefix = id.env_prefix();
        let Ok(api_key) = std::env::var(format!("PROVIDER_{prefix}_API_KEY")) else {
            continue;
        };
        if api_key.trim().is_empty() {
            anyhow::bail!(
                "PROVIDER_{prefix}_API_KEY is set but empty; unset it or provide a real key"
            );
        }
        let (default_rpm, default_tpm) = default_limits(id);
        providers.push(ProviderSettings {
            id,
            api_key,
            rpm: env_u32(&format!("PROVIDER_{prefix}_RPM"), default_rpm),
            tpm: env_u32(&format!("PROVIDER_{prefix}_TPM"), default_tpm),
        });
    }

    if providers.is_empty() {
        tracing::warn!("no PROVIDER_*_API_KEY set — audits will fail until at least one provider is configured");
    }

    Ok(Config {
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/brandscope".into()),
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
        worker_count: env_usize("WORKER_COUNT", 2).max(1),
        orchestrator_concurrency: env_usize("C_ORCHESTRATOR", 16).max(1),
        analyzer_concurrency: env_usize("C_ANALYZER", 10).max(1),
        default_query_count: env_usize("DEFAULT_QUERY_COUNT", 48).max(1),
        heartbeat_interval_secs: env_u64("HEARTBEAT_INTERVAL_SECONDS", 30).max(1),
        stuck_audit_secs: env_u64("STUCK_AUDIT_SECONDS", 300),
        domain_fetch_timeout_secs: env_u64("DOMAIN_FETCH_TIMEOUT_SECONDS", 5).clamp(1, 5),
        providers,
    })
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
