//! Token-bucket throttle and bounded-retry wrapper around any adapter.
//!
//! One `RateLimitedCaller` exists per provider and is shared process-wide,
//! so the combined concurrency of every running audit still honors the
//! provider's declared requests/min and tokens/min.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::{
    Completion, CompletionBackend, CompletionRequest, FinishReason, ProviderAdapter, ProviderError,
    ProviderErrorKind, ProviderId,
};

// ── Token bucket ────────────────────────────────────────────────

/// Continuously-refilling token bucket. Callers take tokens under the lock
/// and sleep outside it, so the mutex is held only for arithmetic.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(limit: u32) -> Self {
        let capacity = f64::from(limit.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `n` tokens, or return how long to wait before trying again.
    fn try_take(&mut self, n: f64, now: Instant) -> Option<Duration> {
        self.refill(now);
        let n = n.min(self.capacity);
        if self.tokens >= n {
            self.tokens -= n;
            return None;
        }
        let deficit = n - self.tokens;
        Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }
}

// ── Retry policy ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Quota failures back off this many times longer before the next try.
    pub quota_backoff_multiplier: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 10_000,
            quota_backoff_multiplier: 4,
        }
    }
}

impl RetryPolicy {
    /// Full-jitter exponential backoff: uniform in [0, min(cap, base·2^attempt)].
    fn delay(&self, attempt: u32, quota: bool) -> Duration {
        let exp = self.base_backoff_ms.saturating_mul(1u64 << attempt.min(16));
        let mut cap = exp.min(self.max_backoff_ms);
        if quota {
            cap = cap.saturating_mul(self.quota_backoff_multiplier);
        }
        let jittered = rand::thread_rng().gen_range(0..=cap);
        Duration::from_millis(jittered)
    }
}

// ── Rate-limited caller ─────────────────────────────────────────

pub struct RateLimitedCaller {
    adapter: Arc<dyn ProviderAdapter>,
    requests: Mutex<TokenBucket>,
    tokens: Mutex<TokenBucket>,
    policy: RetryPolicy,
}

impl RateLimitedCaller {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, rpm: u32, tpm: u32, policy: RetryPolicy) -> Self {
        Self {
            adapter,
            requests: Mutex::new(TokenBucket::per_minute(rpm)),
            tokens: Mutex::new(TokenBucket::per_minute(tpm)),
            policy,
        }
    }

    pub fn id(&self) -> ProviderId {
        self.adapter.id()
    }

    async fn acquire(&self, estimated_tokens: f64) {
        loop {
            let wait = {
                let mut bucket = self.requests.lock().await;
                bucket.try_take(1.0, Instant::now())
            };
            match wait {
                None => break,
                Some(d) => sleep(d).await,
            }
        }
        loop {
            let wait = {
                let mut bucket = self.tokens.lock().await;
                bucket.try_take(estimated_tokens, Instant::now())
            };
            match wait {
                None => break,
                Some(d) => sleep(d).await,
            }
        }
    }

    /// Throttled, retried completion. `Transient` and `Quota` failures are
    /// retried with jittered backoff; `Permanent` propagates immediately. A
    /// capped request that returns empty text with `finish_reason = length`
    /// is retried without the cap.
    pub async fn call(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let mut req = request.clone();
        let mut attempt: u32 = 0;

        loop {
            self.acquire(f64::from(req.estimated_tokens())).await;

            let outcome = match timeout(req.timeout, self.adapter.complete(&req)).await {
                Err(_) => Err(ProviderError::transient(format!(
                    "request timed out after {:?}",
                    req.timeout
                ))),
                Ok(res) => res,
            };

            let err = match outcome {
                Ok(completion) => {
                    if completion.finish_reason == FinishReason::Length
                        && completion.text.trim().is_empty()
                        && req.max_output_tokens.is_some()
                    {
                        // The cap ate the whole reply; retry uncapped.
                        debug!(provider = %self.id(), "empty completion under output cap, retrying uncapped");
                        req.max_output_tokens = None;
                        ProviderError::transient("empty completion with finish_reason=length")
                    } else {
                        return Ok(completion);
                    }
                }
                Err(e) if e.kind == ProviderErrorKind::Permanent => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.policy.max_retries {
                warn!(provider = %self.id(), attempts = attempt + 1, error = %err, "retries exhausted");
                return Err(err);
            }

            let delay = self.policy.delay(attempt, err.kind == ProviderErrorKind::Quota);
            debug!(provider = %self.id(), attempt, error = %err, ?delay, "retrying provider call");
            sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl CompletionBackend for RateLimitedCaller {
    fn provider(&self) -> ProviderId {
        self.id()
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.call(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedAdapter {
        calls: AtomicU32,
        script: Vec<Result<Completion, ProviderError>>,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<Result<Completion, ProviderError>>) -> Self {
            Self { calls: AtomicU32::new(0), script }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> ProviderId {
            ProviderId::OpenAi
        }

        async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.script.get(n) {
                Some(Ok(c)) => {
                    // A scripted "empty under cap" completion only stays empty
                    // while the cap is present.
                    if c.finish_reason == FinishReason::Length
                        && c.text.is_empty()
                        && req.max_output_tokens.is_none()
                    {
                        Ok(ok_completion("full answer after cap removed"))
                    } else {
                        Ok(c.clone())
                    }
                }
                Some(Err(e)) => Err(e.clone()),
                None => Ok(ok_completion("default")),
            }
        }
    }

    fn ok_completion(text: &str) -> Completion {
        Completion {
            text: text.to_string(),
            finish_reason: FinishReason::Stop,
            input_tokens: 10,
            output_tokens: 5,
            latency_ms: 1,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy { max_retries: 3, base_backoff_ms: 1, max_backoff_ms: 5, quota_backoff_multiplier: 2 }
    }

    fn caller(adapter: Arc<ScriptedAdapter>) -> RateLimitedCaller {
        RateLimitedCaller::new(adapter, 6_000, 6_000_000, fast_policy())
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Err(ProviderError::transient("503")),
            Err(ProviderError::transient("503")),
            Ok(ok_completion("hello")),
        ]));
        let caller = caller(adapter.clone());

        let result = caller.call(&CompletionRequest::text("hi")).await.unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_propagate_without_retry() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![Err(ProviderError::permanent("400"))]));
        let caller = caller(adapter.clone());

        let err = caller.call(&CompletionRequest::text("hi")).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Permanent);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn retries_exhaust_with_last_error() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Err(ProviderError::transient("a")),
            Err(ProviderError::transient("b")),
            Err(ProviderError::transient("c")),
            Err(ProviderError::transient("d")),
            Err(ProviderError::transient("e")),
        ]));
        let caller = caller(adapter.clone());

        let err = caller.call(&CompletionRequest::text("hi")).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Transient);
        assert_eq!(err.message, "d");
        // 1 initial try + 3 retries
        assert_eq!(adapter.calls(), 4);
    }

    #[tokio::test]
    async fn empty_length_completion_retries_without_cap() {
        let empty_under_cap = Completion {
            text: String::new(),
            finish_reason: FinishReason::Length,
            input_tokens: 2_000,
            output_tokens: 0,
            latency_ms: 1,
        };
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Ok(empty_under_cap.clone()),
            Ok(empty_under_cap),
        ]));
        let caller = caller(adapter.clone());

        let mut req = CompletionRequest::text("very long prompt");
        req.max_output_tokens = Some(16);

        let result = caller.call(&req).await.unwrap();
        assert_eq!(result.text, "full answer after cap removed");
        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test]
    async fn uncapped_empty_length_is_returned_as_is() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(Completion {
            text: String::new(),
            finish_reason: FinishReason::Length,
            input_tokens: 10,
            output_tokens: 0,
            latency_ms: 1,
        })]));
        let caller = caller(adapter.clone());

        // No cap was set, so there is nothing to strip; the completion stands.
        let result = caller.call(&CompletionRequest::text("hi")).await.unwrap();
        assert_eq!(result.finish_reason, FinishReason::Length);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn request_bucket_paces_bursts() {
        // 60 rpm = 1 request/second refill with a burst capacity of 60.
        let mut bucket = TokenBucket::per_minute(60);
        let now = Instant::now();
        for _ in 0..60 {
            assert!(bucket.try_take(1.0, now).is_none());
        }
        let wait = bucket.try_take(1.0, now).expect("bucket should be empty");
        assert!(wait > Duration::from_millis(900), "expected ~1s wait, got {wait:?}");
    }

    #[tokio::test]
    async fn oversized_token_draw_is_clamped_to_capacity() {
        let mut bucket = TokenBucket::per_minute(100);
        let now = Instant::now();
        // A request estimated above capacity must not deadlock forever.
        assert!(bucket.try_take(10_000.0, now).is_none());
    }

    #[test]
    fn backoff_stays_within_cap() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            let d = policy.delay(attempt, false);
            assert!(d <= Duration::from_millis(policy.max_backoff_ms));
            let q = policy.delay(attempt, true);
            assert!(
                q <= Duration::from_millis(policy.max_backoff_ms * policy.quota_backoff_multiplier)
            );
        }
    }
}
