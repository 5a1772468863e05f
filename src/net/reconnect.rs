//! Outbound connection loop with a growing cycle timeout

use super::error::NetError;
use super::types::{DEFAULT_PORT, RECONNECT_MAX_TIMEOUT_MS, RECONNECT_TIMEOUT_MS};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// TARGETS
// =============================================================================

/// Host and port to dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

impl FromStr for Target {
    type Err = NetError;

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`; the port defaults
    /// to 8768.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || NetError::Config(format!("invalid target: {:?}", s));

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(bad)?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(bad()),
            }
        } else {
            match s.rsplit_once(':') {
                // Bare IPv6 address without brackets
                Some((host, _)) if host.contains(':') => (s, None),
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(bad());
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| bad())?,
            None => DEFAULT_PORT,
        };
        Ok(Target::new(host, port))
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Tried in order every iteration.
    pub targets: Vec<Target>,
    /// Budget of the first iteration, split evenly across targets.
    pub timeout_ms: u64,
    /// Upper bound the budget grows toward.
    pub max_timeout_ms: u64,
    /// How slowly the budget approaches the maximum; 0 keeps it fixed.
    pub flatness: f64,
    /// Stop after this many iterations; `None` or 0 retries forever.
    pub max_iterations: Option<u32>,
    /// Fraction in `[0, 1)` by which a wait may be randomly shortened.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            timeout_ms: RECONNECT_TIMEOUT_MS,
            max_timeout_ms: RECONNECT_MAX_TIMEOUT_MS,
            flatness: 8.0,
            max_iterations: None,
            jitter: 0.0,
        }
    }
}

impl ReconnectConfig {
    pub fn with_targets(targets: Vec<Target>) -> Self {
        Self {
            targets,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if self.targets.is_empty() {
            return Err(NetError::Config("no reconnect targets".into()));
        }
        if self.timeout_ms == 0 {
            return Err(NetError::Config("reconnect timeout must be positive".into()));
        }
        if self.max_timeout_ms < self.timeout_ms {
            return Err(NetError::Config(format!(
                "max timeout {}ms below initial timeout {}ms",
                self.max_timeout_ms, self.timeout_ms
            )));
        }
        if !self.flatness.is_finite() || self.flatness < 0.0 {
            return Err(NetError::Config(format!("invalid flatness {}", self.flatness)));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(NetError::Config(format!("jitter {} outside [0, 1)", self.jitter)));
        }
        Ok(())
    }
}

// =============================================================================
// CYCLE TIMEOUT
// =============================================================================

/// Per-iteration timeout budget.
///
/// `max - (max - min) * e^(-n / flatness)` after `n` iterations: starts at
/// `min`, never decreases, never exceeds `max`.
#[derive(Debug, Clone)]
pub struct Cycle {
    min_ms: u64,
    max_ms: u64,
    flatness: f64,
    iteration: u32,
}

impl Cycle {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            min_ms: config.timeout_ms,
            max_ms: config.max_timeout_ms,
            flatness: config.flatness,
            iteration: 0,
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms_at(self.iteration))
    }

    pub fn advance(&mut self) {
        self.iteration = self.iteration.saturating_add(1);
    }

    fn timeout_ms_at(&self, iteration: u32) -> u64 {
        if self.flatness == 0.0 || self.max_ms <= self.min_ms {
            return self.min_ms;
        }
        let span = (self.max_ms - self.min_ms) as f64;
        let grown = self.max_ms as f64 - span * (-(iteration as f64) / self.flatness).exp();
        (grown as u64).clamp(self.min_ms, self.max_ms)
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Retries `connect` over the configured targets until one succeeds, the
/// iteration cap is reached, or it is cancelled.
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    cancel: CancellationToken,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Result<Self, NetError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop the loop with `token` instead of a private one, e.g. a child of
    /// a node-wide shutdown token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the loop; usable from any task or thread.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Run the loop. Attempt failures are logged and swallowed; the result is
    /// `None` when the cap is reached or the loop is cancelled.
    pub async fn run<F, Fut, T>(&self, mut connect: F) -> Option<T>
    where
        F: FnMut(Target) -> Fut,
        Fut: Future<Output = Result<T, NetError>>,
    {
        let targets = &self.config.targets;
        let mut cycle = Cycle::new(&self.config);

        loop {
            let per_target = cycle.timeout() / targets.len() as u32;
            let last_iteration = self
                .config
                .max_iterations
                .is_some_and(|max| max > 0 && cycle.iteration() + 1 >= max);

            for (i, target) in targets.iter().enumerate() {
                let started = Instant::now();
                debug!(
                    "Connecting to {} (iteration {}, timeout {:?})",
                    target,
                    cycle.iteration(),
                    per_target
                );

                let attempt = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    r = tokio::time::timeout(per_target, connect(target.clone())) => r,
                };
                match attempt {
                    Ok(Ok(conn)) => {
                        info!("Connected to {}", target);
                        return Some(conn);
                    }
                    Ok(Err(e)) => debug!("Connection to {} failed: {}", target, e),
                    Err(_) => debug!("Connection to {} timed out", target),
                }

                if last_iteration && i + 1 == targets.len() {
                    break;
                }

                let wait = self.jittered(per_target.saturating_sub(started.elapsed()));
                if !wait.is_zero() {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }

            if last_iteration {
                info!(
                    "Giving up after {} iterations over {} targets",
                    cycle.iteration() + 1,
                    targets.len()
                );
                return None;
            }
            cycle.advance();
        }
    }

    fn jittered(&self, wait: Duration) -> Duration {
        if self.config.jitter == 0.0 || wait.is_zero() {
            return wait;
        }
        let cut = rand::thread_rng().gen_range(0.0..self.config.jitter);
        wait.mul_f64(1.0 - cut)
    }

    /// Run the loop on a background task.
    pub fn spawn<F, Fut, T>(self, connect: F) -> ReconnectHandle<T>
    where
        F: FnMut(Target) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, NetError>> + Send,
        T: Send + 'static,
    {
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move { self.run(connect).await });
        ReconnectHandle { task, cancel }
    }
}

/// Background reconnect loop.
pub struct ReconnectHandle<T> {
    task: JoinHandle<Option<T>>,
    cancel: CancellationToken,
}

impl<T> ReconnectHandle<T> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop's result.
    pub async fn join(self) -> Option<T> {
        self.task.await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(targets: &[&str], timeout_ms: u64, max_iterations: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            targets: targets.iter().map(|t| t.parse().unwrap()).collect(),
            timeout_ms,
            max_timeout_ms: timeout_ms * 10,
            flatness: 2.0,
            max_iterations,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_target_parse() {
        assert_eq!("example.com".parse::<Target>().unwrap(), Target::new("example.com", 8768));
        assert_eq!("10.0.0.1:9000".parse::<Target>().unwrap(), Target::new("10.0.0.1", 9000));
        assert_eq!("[::1]:9000".parse::<Target>().unwrap(), Target::new("::1", 9000));
        assert_eq!("[::1]".parse::<Target>().unwrap(), Target::new("::1", 8768));
        assert_eq!("::1".parse::<Target>().unwrap(), Target::new("::1", 8768));
        assert_eq!(Target::new("::1", 1).to_string(), "[::1]:1");
        assert!("".parse::<Target>().is_err());
        assert!("host:notaport".parse::<Target>().is_err());
        assert!("[::1]x".parse::<Target>().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(config(&["a"], 100, None).validate().is_ok());
        assert!(ReconnectConfig::default().validate().is_err());

        let mut bad = config(&["a"], 100, None);
        bad.jitter = 1.0;
        assert!(bad.validate().is_err());

        let mut bad = config(&["a"], 100, None);
        bad.max_timeout_ms = 50;
        assert!(bad.validate().is_err());

        assert!(config(&["a"], 100, Some(0)).validate().is_ok());
    }

    #[test]
    fn test_fixed_cycle() {
        let mut cfg = config(&["a"], 500, None);
        cfg.flatness = 0.0;
        let mut cycle = Cycle::new(&cfg);
        for _ in 0..10 {
            assert_eq!(cycle.timeout(), Duration::from_millis(500));
            cycle.advance();
        }
    }

    #[test]
    fn test_cycle_approaches_max() {
        let cfg = config(&["a"], 1000, None);
        let mut cycle = Cycle::new(&cfg);
        assert_eq!(cycle.timeout(), Duration::from_millis(1000));
        for _ in 0..200 {
            cycle.advance();
        }
        assert!(cycle.timeout() >= Duration::from_millis(9_990));
        assert!(cycle.timeout() <= Duration::from_millis(10_000));
    }

    proptest! {
        #[test]
        fn prop_cycle_monotone_and_capped(
            min in 1u64..100_000,
            extra in 0u64..1_000_000,
            flatness in 0.0f64..100.0,
        ) {
            let cfg = ReconnectConfig {
                targets: vec![Target::new("a", 1)],
                timeout_ms: min,
                max_timeout_ms: min + extra,
                flatness,
                max_iterations: None,
                jitter: 0.0,
            };
            let mut cycle = Cycle::new(&cfg);
            let mut previous = cycle.timeout();
            for _ in 0..64 {
                cycle.advance();
                let current = cycle.timeout();
                prop_assert!(current >= previous);
                prop_assert!(current <= Duration::from_millis(min + extra));
                previous = current;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_iteration_gives_up() {
        let scheduler = ReconnectScheduler::new(config(&["a", "b"], 1000, Some(1))).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = attempts.clone();
        let result: Option<()> = scheduler
            .run(|_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(NetError::ConnectionClosed) }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() <= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_target_succeeds() {
        let scheduler = ReconnectScheduler::new(config(&["a:1", "b:2"], 1000, None)).unwrap();

        let result = scheduler
            .run(|target| async move {
                if target.host == "b" {
                    Ok(target.port)
                } else {
                    Err(NetError::ConnectionClosed)
                }
            })
            .await;
        assert_eq!(result, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_attempt_is_timed_out() {
        let scheduler = ReconnectScheduler::new(config(&["a"], 200, Some(2))).unwrap();
        let started = Instant::now();

        let result: Option<()> = scheduler
            .run(|_| futures::future::pending::<Result<(), NetError>>())
            .await;

        assert!(result.is_none());
        // Two iterations: 200ms, then the grown budget
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(started.elapsed() <= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let scheduler = ReconnectScheduler::new(config(&["a"], 100, None)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result = scheduler
            .run(|_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n >= 4 {
                        Ok(n)
                    } else {
                        Err(NetError::ConnectionClosed)
                    }
                }
            })
            .await;
        assert_eq!(result, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_from_another_task() {
        let scheduler = ReconnectScheduler::new(config(&["a"], 60_000, None)).unwrap();
        let handle = scheduler.spawn(|_| async { Err::<(), _>(NetError::ConnectionClosed) });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        let started = Instant::now();
        handle.cancel();
        assert!(handle.join().await.is_none());
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
