// ===========================================
// Two-tier admission control + adaptive delay
// ===========================================
// Every connection attempt spends one token from the global bucket and,
// if that succeeds, one from its source's bucket. A denied per-IP take
// does not refund the global token: every attempt costs global capacity
// as seen by an attacker.
use crate::config_loader::Config;
use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Which tier turned the request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    Global,
    Ip,
}

// ===========================================
// Token bucket
// ===========================================

/// Classic token bucket: tokens refill continuously at a fixed rate up
/// to a cap; each admission spends one. Refill is lazy against a
/// monotonic clock, so no background task is needed.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    inner: Mutex<BucketInner>,
}

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            inner: Mutex::new(BucketInner {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, returning false when the bucket is empty.
    pub fn try_take(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        Self::refill(&mut inner, self.capacity, self.refill_per_sec);
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current token count after a lazy refill. Pure read as far as
    /// admission behavior is concerned.
    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        Self::refill(&mut inner, self.capacity, self.refill_per_sec);
        inner.tokens
    }

    fn refill(inner: &mut BucketInner, capacity: f64, refill_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            inner.tokens = (inner.tokens + elapsed * refill_per_sec).min(capacity);
            inner.last_refill = now;
        }
    }
}

// ===========================================
// Per-source records
// ===========================================

#[derive(Debug)]
struct IpRecord {
    bucket: TokenBucket,
    request_count: AtomicU64,
    first_seen: Instant,
    last_seen: Mutex<Instant>,
}

impl IpRecord {
    fn new(ip_limit: u32) -> Self {
        let now = Instant::now();
        Self {
            bucket: TokenBucket::new(ip_limit, ip_limit),
            request_count: AtomicU64::new(0),
            first_seen: now,
            last_seen: Mutex::new(now),
        }
    }
}

/// Point-in-time limiter counters, for periodic diagnostics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_admitted: u64,
    pub active_ips: usize,
    pub uptime: Duration,
}

// ===========================================
// Rate limiter
// ===========================================

pub struct RateLimiter {
    config: Arc<Config>,
    global_bucket: TokenBucket,
    ip_records: DashMap<String, Arc<IpRecord>>,
    admitted_total: AtomicU64,
    started_at: Instant,
}

impl RateLimiter {
    pub fn new(config: Arc<Config>) -> Self {
        let global_limit = config.rate_limit.global_limit;
        Self {
            config,
            global_bucket: TokenBucket::new(global_limit, global_limit),
            ip_records: DashMap::new(),
            admitted_total: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Admits or rejects one connection attempt from `ip`. Takes the
    /// global token first, then the per-IP token; counters and
    /// timestamps move only on admission.
    pub fn allow(&self, ip: &str) -> Result<(), Denied> {
        if !self.global_bucket.try_take() {
            debug!("global rate limit denied {}", ip);
            return Err(Denied::Global);
        }

        let record = self.record_for(ip);
        if !record.bucket.try_take() {
            // the global token stays spent
            debug!("per-ip rate limit denied {}", ip);
            return Err(Denied::Ip);
        }

        record.request_count.fetch_add(1, Ordering::Relaxed);
        *record.last_seen.lock().unwrap() = Instant::now();
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Adaptive tar-pit delay for `ip`, bounded by
    /// `base_delay + max_ip_penalty + max_global_penalty`. A source with
    /// no measurable history pays exactly the base delay.
    pub fn calculate_delay(&self, ip: &str) -> Duration {
        let delay_cfg = &self.config.delay;
        let base = delay_cfg.base_delay().as_secs_f64();

        let ip_penalty = (self.ip_penalty_factor(ip) * delay_cfg.ip_rate_multiplier * base)
            .min(delay_cfg.max_ip_penalty().as_secs_f64());
        let global_penalty = (self.global_load_factor() * delay_cfg.global_rate_multiplier * base)
            .min(delay_cfg.max_global_penalty().as_secs_f64());

        Duration::from_secs_f64(base + ip_penalty + global_penalty)
    }

    /// Raw requests per second observed from `ip`; 0 for an unseen
    /// address or one whose record has no measurable age yet. Callers
    /// must not read 0 as "first contact" in any admission decision.
    pub fn ip_frequency(&self, ip: &str) -> f64 {
        match self.ip_records.get(ip) {
            Some(record) => {
                let elapsed = record.first_seen.elapsed().as_secs_f64();
                if elapsed <= 0.0 {
                    return 0.0;
                }
                record.request_count.load(Ordering::Relaxed) as f64 / elapsed
            }
            None => 0.0,
        }
    }

    /// Pure read used only as a telemetry signal, never to change
    /// admission behavior.
    pub fn is_circuit_breaker_triggered(&self) -> bool {
        self.global_bucket.available() < 1.0
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_admitted: self.admitted_total.load(Ordering::Relaxed),
            active_ips: self.ip_records.len(),
            uptime: self.started_at.elapsed(),
        }
    }

    /// Drops records whose last admission is older than the cleanup
    /// interval. Holds only shard locks and a per-record timestamp
    /// mutex, never anything across I/O.
    pub fn cleanup_expired(&self) {
        let idle = self.config.rate_limit.cleanup_interval();
        let now = Instant::now();
        let before = self.ip_records.len();
        self.ip_records.retain(|_, record| {
            let last = *record.last_seen.lock().unwrap();
            now.duration_since(last) <= idle
        });
        let removed = before.saturating_sub(self.ip_records.len());
        if removed > 0 {
            debug!("pruned {} idle source records", removed);
        }
    }

    /// Background sweeper loop, one tick per cleanup interval.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.rate_limit.cleanup_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup_expired(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn record_for(&self, ip: &str) -> Arc<IpRecord> {
        if let Some(record) = self.ip_records.get(ip) {
            return record.clone();
        }
        // racing inserters are fine: the loser's candidate is discarded
        let candidate = Arc::new(IpRecord::new(self.config.rate_limit.ip_limit));
        self.ip_records
            .entry(ip.to_string())
            .or_insert(candidate)
            .value()
            .clone()
    }

    // Frequency factor for the delay formula. Zero until the source has
    // observable history (more than one admission and a nonzero age),
    // then floored at 1 so the penalty never shrinks below one base
    // multiplier under sustained traffic.
    fn ip_penalty_factor(&self, ip: &str) -> f64 {
        let record = match self.ip_records.get(ip) {
            Some(record) => record.clone(),
            None => return 0.0,
        };
        let count = record.request_count.load(Ordering::Relaxed);
        let elapsed = record.first_seen.elapsed().as_secs_f64();
        if count <= 1 || elapsed <= 0.0 {
            return 0.0;
        }
        let requests_per_second = count as f64 / elapsed;
        (requests_per_second / self.config.rate_limit.ip_limit as f64
            * self.config.delay.ip_frequency_factor)
            .max(1.0)
    }

    fn global_load_factor(&self) -> f64 {
        let admitted = self.admitted_total.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if admitted <= 1 || elapsed <= 0.0 {
            return 0.0;
        }
        let requests_per_second = admitted as f64 / elapsed;
        (requests_per_second / self.config.rate_limit.global_limit as f64
            * self.config.delay.global_load_factor)
            .max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn limiter_config(ip_limit: u32, global_limit: u32) -> Arc<Config> {
        let mut config = Config::default();
        config.rate_limit.ip_limit = ip_limit;
        config.rate_limit.global_limit = global_limit;
        Arc::new(config)
    }

    #[test]
    fn token_bucket_spends_and_refills() {
        let bucket = TokenBucket::new(2, 2);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
        thread::sleep(Duration::from_millis(600));
        assert!(bucket.try_take());
    }

    #[test]
    fn admission_spends_global_before_ip() {
        let limiter = RateLimiter::new(limiter_config(1, 10));
        let global_before = limiter.global_bucket.available();
        assert!(limiter.allow("198.51.100.1").is_ok());
        assert!(limiter.global_bucket.available() < global_before);

        // the per-ip bucket is exhausted; the global token is still spent
        let global_before = limiter.global_bucket.available();
        assert_eq!(limiter.allow("198.51.100.1"), Err(Denied::Ip));
        assert!(limiter.global_bucket.available() < global_before);
    }

    #[test]
    fn global_saturation_denies_the_second_source() {
        let limiter = RateLimiter::new(limiter_config(5, 1));
        assert!(limiter.allow("198.51.100.1").is_ok());
        assert_eq!(limiter.allow("198.51.100.2"), Err(Denied::Global));
    }

    #[test]
    fn counters_move_only_on_admission() {
        let limiter = RateLimiter::new(limiter_config(1, 10));
        assert!(limiter.allow("198.51.100.1").is_ok());
        assert_eq!(limiter.allow("198.51.100.1"), Err(Denied::Ip));
        let record = limiter.record_for("198.51.100.1");
        assert_eq!(record.request_count.load(Ordering::Relaxed), 1);
        assert_eq!(limiter.stats().total_admitted, 1);
    }

    #[test]
    fn first_contact_pays_exactly_the_base_delay() {
        let limiter = RateLimiter::new(limiter_config(5, 100));
        assert!(limiter.allow("198.51.100.1").is_ok());
        let delay = limiter.calculate_delay("198.51.100.1");
        assert_eq!(delay.as_millis(), 100);
    }

    #[test]
    fn delay_stays_within_the_configured_envelope() {
        let limiter = RateLimiter::new(limiter_config(100, 1_000));
        for _ in 0..50 {
            let _ = limiter.allow("198.51.100.1");
        }
        let delay = limiter.calculate_delay("198.51.100.1");
        let base = Duration::from_millis(100);
        let ceiling = base + Duration::from_millis(5_000) + Duration::from_millis(2_000);
        assert!(delay >= base, "delay {:?} under base", delay);
        assert!(delay <= ceiling, "delay {:?} over ceiling", delay);
    }

    #[test]
    fn hammered_source_is_penalized_beyond_base() {
        let limiter = RateLimiter::new(limiter_config(1_000, 10_000));
        for _ in 0..200 {
            let _ = limiter.allow("198.51.100.1");
        }
        thread::sleep(Duration::from_millis(20));
        let delay = limiter.calculate_delay("198.51.100.1");
        assert!(delay > Duration::from_millis(100), "got {:?}", delay);
    }

    #[test]
    fn frequency_is_zero_for_unseen_sources() {
        let limiter = RateLimiter::new(limiter_config(5, 100));
        assert_eq!(limiter.ip_frequency("203.0.113.9"), 0.0);
    }

    #[test]
    fn sweeper_forgets_idle_sources() {
        let mut config = Config::default();
        config.rate_limit.cleanup_interval_secs = 0;
        let limiter = RateLimiter::new(Arc::new(config));
        assert!(limiter.allow("198.51.100.1").is_ok());
        assert_eq!(limiter.stats().active_ips, 1);

        thread::sleep(Duration::from_millis(20));
        limiter.cleanup_expired();
        assert_eq!(limiter.stats().active_ips, 0);
        assert_eq!(limiter.ip_frequency("198.51.100.1"), 0.0);

        // the next request is treated as first-seen again
        assert!(limiter.allow("198.51.100.1").is_ok());
        let record = limiter.record_for("198.51.100.1");
        assert_eq!(record.request_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn circuit_breaker_reads_the_global_bucket() {
        let limiter = RateLimiter::new(limiter_config(5, 1));
        assert!(!limiter.is_circuit_breaker_triggered());
        assert!(limiter.allow("198.51.100.1").is_ok());
        assert!(limiter.is_circuit_breaker_triggered());
    }
}
