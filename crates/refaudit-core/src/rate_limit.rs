//! Per-service rate limiting with adaptive governor instances.
//!
//! Each outbound request waits for its governor permit via `until_ready()`,
//! which spaces requests at the configured rate. On 429 the governor is
//! slowed and the error is returned to the caller's retry policy.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::registry::RegistryError;

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Slowdown factor ceiling after repeated 429s.
const MAX_SLOWDOWN: u32 = 16;

/// Time without a 429 after which the base rate is restored.
const DECAY_AFTER: Duration = Duration::from_secs(60);

fn quota_for(period: Duration) -> Quota {
    Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
}

/// Per-service rate limiter with adaptive rate adjustment via ArcSwap.
///
/// When a 429 is received, the governor is atomically swapped to a slower rate.
/// After a cooldown period with no 429s, the original rate is restored.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    /// Base period between allowed requests.
    base_period: Duration,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    current_factor: AtomicU32,
    last_429: std::sync::Mutex<Option<Instant>>,
}

impl AdaptiveLimiter {
    /// Create a new limiter with the given period between requests.
    pub fn new(period: Duration) -> Self {
        let limiter = Arc::new(DirectLimiter::direct(quota_for(period)));
        Self {
            limiter: ArcSwap::from(limiter),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: std::sync::Mutex::new(None),
        }
    }

    /// Create a limiter allowing `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        let ms = 1000 / n.max(1) as u64;
        Self::new(Duration::from_millis(ms))
    }

    /// Period between requests when not slowed down.
    pub fn base_period(&self) -> Duration {
        self.base_period
    }

    /// Wait until the rate limiter allows a request.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load_full();
        limiter.until_ready().await;
    }

    /// Called when a 429 is received. Doubles the slowdown factor and swaps the governor.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(MAX_SLOWDOWN))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor)
            && let Some(quota) = Quota::with_period(scaled)
        {
            tracing::debug!(factor, "rate limited, slowing governor");
            self.limiter.store(Arc::new(DirectLimiter::direct(quota)));
        }
    }

    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed() >= DECAY_AFTER))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            let limiter = Arc::new(DirectLimiter::direct(quota_for(self.base_period)));
            self.limiter.store(limiter);
        }
    }

    /// Run `request` after acquiring a permit, slowing the governor if it
    /// comes back rate limited.
    pub async fn run<T, Fut>(&self, request: Fut) -> Result<T, RegistryError>
    where
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        self.acquire().await;
        let result = request.await;
        if matches!(result, Err(RegistryError::RateLimited { .. })) {
            self.on_rate_limited();
        }
        result
    }
}

/// Collection of per-service rate limiters, keyed by service name.
pub struct RateLimiters {
    limiters: HashMap<&'static str, AdaptiveLimiter>,
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl RateLimiters {
    /// Build rate limiters based on whether a CrossRef mailto and an NCBI key
    /// are configured.
    pub fn new(has_crossref_mailto: bool, has_ncbi_api_key: bool) -> Self {
        let mut limiters = HashMap::new();

        // CrossRef: 1/s anonymous, 3/s in the polite pool
        let crossref_rate = if has_crossref_mailto { 3 } else { 1 };
        limiters.insert("CrossRef", AdaptiveLimiter::per_second(crossref_rate));

        // NCBI E-utilities: 3/s without key, 10/s with key
        let pubmed_rate = if has_ncbi_api_key { 10 } else { 3 };
        limiters.insert("PubMed", AdaptiveLimiter::per_second(pubmed_rate));

        // Classification model endpoint: conservative 2/s
        limiters.insert("Model", AdaptiveLimiter::per_second(2));

        Self { limiters }
    }

    /// Get the rate limiter for a given service, if one exists.
    pub fn get(&self, name: &str) -> Option<&AdaptiveLimiter> {
        self.limiters.get(name)
    }
}

impl std::fmt::Debug for RateLimiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.limiters.keys().collect();
        names.sort();
        f.debug_struct("RateLimiters")
            .field("services", &names)
            .finish()
    }
}

/// Check if an HTTP response is a 429 and extract Retry-After if present.
pub fn check_rate_limit_response(resp: &reqwest::Response) -> Result<(), RegistryError> {
    if resp.status().as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(RegistryError::RateLimited { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date (e.g. "Wed, 21 Oct 2015 07:28:00 GMT"): conservative fallback
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}
