use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{FailureKind, GenerationError};

pub const PRIMARY_KEY_VAR: &str = "GEMINI_API_KEY";
const MAX_SECONDARY_KEYS: usize = 9;

/// Exponential cooldown applied to a key after a rate-limit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(15 * 60),
        }
    }
}

impl CooldownPolicy {
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_failures);
        self.base.saturating_mul(factor).min(self.max)
    }
}

struct Credential {
    key: Arc<str>,
    consecutive_failures: u32,
    last_used_at: Option<Instant>,
    disabled_until: Option<Instant>,
    revoked: bool,
    uses: u64,
}

impl Credential {
    fn new(key: Arc<str>) -> Self {
        Self {
            key,
            consecutive_failures: 0,
            last_used_at: None,
            disabled_until: None,
            revoked: false,
            uses: 0,
        }
    }

    fn is_available(&self) -> bool {
        !self.revoked && self.disabled_until.is_none()
    }

    fn health(&self, now: Instant) -> KeyHealth {
        if self.revoked {
            return KeyHealth::Revoked;
        }
        match self.disabled_until {
            Some(until) if until > now => KeyHealth::CoolingDown {
                remaining: until - now,
            },
            _ => KeyHealth::Available,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHealth {
    Available,
    CoolingDown { remaining: Duration },
    Revoked,
}

/// Handle to one credential, valid for a single call attempt.
#[derive(Clone)]
pub struct KeyLease {
    slot: usize,
    key: Arc<str>,
}

impl KeyLease {
    pub fn api_key(&self) -> &str {
        &self.key
    }

    pub fn masked(&self) -> String {
        mask_key(&self.key)
    }
}

impl fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLease")
            .field("slot", &self.slot)
            .field("key", &self.masked())
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    credentials: Vec<Credential>,
    success_reports: u64,
    failure_reports: u64,
}

impl PoolState {
    fn release_expired(&mut self, now: Instant) {
        for cred in &mut self.credentials {
            if cred.disabled_until.is_some_and(|until| until <= now) {
                cred.disabled_until = None;
                tracing::info!(key = %mask_key(&cred.key), "api key cooldown elapsed");
            }
        }
    }
}

/// Rotating pool of API keys shared by every model call in the process.
///
/// All state transitions happen under one lock, so concurrent
/// `acquire`/`report_*` calls from independent section requests are safe.
pub struct KeyPool {
    state: Mutex<PoolState>,
    cooldown: CooldownPolicy,
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl KeyPool {
    pub fn new<I, K>(keys: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut unique: Vec<Arc<str>> = Vec::new();
        for key in keys {
            let key = key.as_ref().trim();
            if key.is_empty() || unique.iter().any(|k| k.as_ref() == key) {
                continue;
            }
            unique.push(Arc::from(key));
        }
        if unique.is_empty() {
            anyhow::bail!("no API keys configured (set {PRIMARY_KEY_VAR})");
        }

        tracing::info!(keys = unique.len(), "api key pool ready");
        Ok(Self {
            state: Mutex::new(PoolState {
                credentials: unique.into_iter().map(Credential::new).collect(),
                ..PoolState::default()
            }),
            cooldown: CooldownPolicy::default(),
        })
    }

    /// Reads `GEMINI_API_KEY` and `GEMINI_API_KEY_1` ..= `GEMINI_API_KEY_9`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let names = std::iter::once(PRIMARY_KEY_VAR.to_owned())
            .chain((1..=MAX_SECONDARY_KEYS).map(|i| format!("{PRIMARY_KEY_VAR}_{i}")));
        let keys = names.filter_map(|name| lookup(&name)).collect::<Vec<_>>();
        Self::new(keys)
    }

    pub fn with_cooldown(mut self, cooldown: CooldownPolicy) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    /// Leases the available key that was used least recently.
    pub async fn acquire(&self) -> Result<KeyLease, GenerationError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.release_expired(now);

        let selected = state
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, cred)| cred.is_available())
            .min_by_key(|(_, cred)| cred.last_used_at)
            .map(|(slot, _)| slot);

        let Some(slot) = selected else {
            let retry_after = state
                .credentials
                .iter()
                .filter(|cred| !cred.revoked)
                .filter_map(|cred| cred.disabled_until)
                .min()
                .map(|until| until.saturating_duration_since(now));
            tracing::warn!(?retry_after, "api key pool exhausted");
            return Err(GenerationError::PoolExhausted { retry_after });
        };

        let cred = &mut state.credentials[slot];
        cred.last_used_at = Some(now);
        cred.uses += 1;
        tracing::debug!(key = %mask_key(&cred.key), uses = cred.uses, "api key leased");

        Ok(KeyLease {
            slot,
            key: Arc::clone(&cred.key),
        })
    }

    pub async fn report_success(&self, lease: &KeyLease) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.success_reports += 1;
        let Some(cred) = state.credentials.get_mut(lease.slot) else {
            return;
        };
        cred.consecutive_failures = 0;
        cred.last_used_at = Some(now);
    }

    /// Records a failed call. Rate limits start a cooldown; auth failures
    /// revoke the key for the rest of the run; other kinds leave it untouched.
    pub async fn report_failure(&self, lease: &KeyLease, kind: FailureKind) -> KeyHealth {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.failure_reports += 1;
        let Some(cred) = state.credentials.get_mut(lease.slot) else {
            return KeyHealth::Revoked;
        };

        match kind {
            FailureKind::RateLimited => {
                let wait = self.cooldown.backoff(cred.consecutive_failures);
                cred.disabled_until = Some(now + wait);
                cred.consecutive_failures = cred.consecutive_failures.saturating_add(1);
                tracing::warn!(
                    key = %mask_key(&cred.key),
                    consecutive_failures = cred.consecutive_failures,
                    cooldown_secs = wait.as_secs(),
                    "api key rate limited; cooling down"
                );
            }
            FailureKind::Auth => {
                cred.revoked = true;
                tracing::error!(
                    key = %mask_key(&cred.key),
                    "api key rejected by provider; removed from rotation for this run"
                );
            }
            FailureKind::Transient | FailureKind::Malformed => {
                tracing::debug!(key = %mask_key(&cred.key), ?kind, "api key failure ignored");
            }
        }

        cred.health(now)
    }

    pub async fn statistics(&self) -> PoolStatistics {
        let now = Instant::now();
        let state = self.state.lock().await;
        let keys = state
            .credentials
            .iter()
            .map(|cred| {
                let (state, cooldown_remaining_secs) = match cred.health(now) {
                    KeyHealth::Available => (KeyState::Available, None),
                    KeyHealth::CoolingDown { remaining } => {
                        (KeyState::CoolingDown, Some(remaining.as_secs()))
                    }
                    KeyHealth::Revoked => (KeyState::Revoked, None),
                };
                KeyStatistics {
                    key: mask_key(&cred.key),
                    uses: cred.uses,
                    consecutive_failures: cred.consecutive_failures,
                    state,
                    cooldown_remaining_secs,
                }
            })
            .collect::<Vec<_>>();

        PoolStatistics {
            total_keys: keys.len(),
            available_keys: keys
                .iter()
                .filter(|k| k.state == KeyState::Available)
                .count(),
            success_reports: state.success_reports,
            failure_reports: state.failure_reports,
            keys,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Available,
    CoolingDown,
    Revoked,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatistics {
    pub key: String,
    pub uses: u64,
    pub consecutive_failures: u32,
    pub state: KeyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub total_keys: usize,
    pub available_keys: usize,
    pub success_reports: u64,
    pub failure_reports: u64,
    pub keys: Vec<KeyStatistics>,
}

pub fn mask_key(key: &str) -> String {
    let chars = key.chars().collect::<Vec<_>>();
    if chars.len() <= 8 {
        return "***".to_owned();
    }
    let head = chars[..4].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("{head}***{tail}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn pool(keys: &[&str]) -> KeyPool {
        KeyPool::new(keys.iter().copied()).unwrap()
    }

    #[test]
    fn new_dedupes_and_rejects_empty() {
        let err = KeyPool::new(Vec::<String>::new()).unwrap_err();
        assert!(err.to_string().contains("no API keys"));

        let err = KeyPool::new(["", "   "]).unwrap_err();
        assert!(err.to_string().contains("no API keys"));
    }

    #[tokio::test]
    async fn from_lookup_reads_primary_and_numbered_keys() {
        let vars = HashMap::from([
            ("GEMINI_API_KEY", "key-primary-0001"),
            ("GEMINI_API_KEY_2", "key-second-0002"),
            ("GEMINI_API_KEY_9", "key-primary-0001"),
        ]);
        let pool = KeyPool::from_lookup(|name| vars.get(name).map(|v| (*v).to_owned())).unwrap();
        assert_eq!(pool.len().await, 2);
    }

    #[test]
    fn mask_key_hides_middle() {
        assert_eq!(mask_key("short"), "***");
        assert_eq!(mask_key("12345678"), "***");
        assert_eq!(mask_key("AIzaSyExampleKey1234"), "AIza***1234");
    }

    #[test]
    fn cooldown_backoff_is_exponential_and_capped() {
        let policy = CooldownPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(60));
        assert_eq!(policy.backoff(1), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(480));
        assert_eq!(policy.backoff(10), Duration::from_secs(900));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_rotates_by_least_recent_use() {
        let pool = pool(&["key-a-000000", "key-b-000000", "key-c-000000"]);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let lease = pool.acquire().await.unwrap();
            seen.push(lease.api_key().to_owned());
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(
            seen,
            vec![
                "key-a-000000",
                "key-b-000000",
                "key-c-000000",
                "key-a-000000",
                "key-b-000000",
                "key-c-000000",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_key_is_skipped_until_cooldown_elapses() {
        let pool = pool(&["key-a-000000", "key-b-000000", "key-c-000000"]);
        let a = pool.acquire().await.unwrap();
        assert_eq!(a.api_key(), "key-a-000000");
        let health = pool.report_failure(&a, FailureKind::RateLimited).await;
        assert!(matches!(health, KeyHealth::CoolingDown { .. }));

        for _ in 0..10 {
            let lease = pool.acquire().await.unwrap();
            assert_ne!(lease.api_key(), "key-a-000000");
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        tokio::time::advance(Duration::from_secs(60)).await;
        // `a` now has the oldest timestamp among available keys.
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.api_key(), "key-a-000000");
    }

    #[tokio::test(start_paused = true)]
    async fn all_keys_cooling_down_exhausts_pool() {
        let pool = pool(&["key-a-000000", "key-b-000000", "key-c-000000"]);
        for _ in 0..3 {
            let lease = pool.acquire().await.unwrap();
            pool.report_failure(&lease, FailureKind::RateLimited).await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::PoolExhausted {
                retry_after: Some(Duration::from_secs(57)),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_rate_limits_lengthen_cooldown_and_success_resets() {
        let pool = pool(&["key-a-000000"]);
        let lease = pool.acquire().await.unwrap();
        pool.report_failure(&lease, FailureKind::RateLimited).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let lease = pool.acquire().await.unwrap();
        let health = pool.report_failure(&lease, FailureKind::RateLimited).await;
        assert_eq!(
            health,
            KeyHealth::CoolingDown {
                remaining: Duration::from_secs(120)
            }
        );

        tokio::time::advance(Duration::from_secs(120)).await;
        let lease = pool.acquire().await.unwrap();
        pool.report_success(&lease).await;
        let stats = pool.statistics().await;
        assert_eq!(stats.keys[0].consecutive_failures, 0);
        assert_eq!(stats.success_reports, 1);
        assert_eq!(stats.failure_reports, 2);
    }

    #[tokio::test]
    async fn auth_failure_revokes_permanently() {
        let pool = pool(&["key-a-000000", "key-b-000000"]);
        let a = pool.acquire().await.unwrap();
        assert_eq!(
            pool.report_failure(&a, FailureKind::Auth).await,
            KeyHealth::Revoked
        );
        let b = pool.acquire().await.unwrap();
        assert_eq!(b.api_key(), "key-b-000000");
        pool.report_failure(&b, FailureKind::Auth).await;

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err, GenerationError::PoolExhausted { retry_after: None });

        let stats = pool.statistics().await;
        assert_eq!(stats.available_keys, 0);
        assert!(stats.keys.iter().all(|k| k.state == KeyState::Revoked));
    }

    #[tokio::test]
    async fn transient_failure_leaves_key_available() {
        let pool = pool(&["key-a-000000"]);
        let lease = pool.acquire().await.unwrap();
        let health = pool.report_failure(&lease, FailureKind::Transient).await;
        assert_eq!(health, KeyHealth::Available);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_leases_keep_counts_consistent() {
        let pool = Arc::new(pool(&["key-a-000000", "key-b-000000", "key-c-000000"]));
        let mut handles = Vec::new();
        for i in 0..32 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                if i % 2 == 0 {
                    pool.report_success(&lease).await;
                } else {
                    pool.report_failure(&lease, FailureKind::Transient).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = pool.statistics().await;
        assert_eq!(stats.keys.iter().map(|k| k.uses).sum::<u64>(), 32);
        assert_eq!(stats.success_reports, 16);
        assert_eq!(stats.failure_reports, 16);
        assert_eq!(stats.available_keys, 3);
    }
}
