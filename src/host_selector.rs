//! Host failover: runs a request against tiered hosts, freezing hosts that
//! fail and falling through the tiers before giving up

use crate::dns::{HostResolver, InOrderChooser, IpChooser};
use crate::endpoint::{host_key, host_to_url, Endpoints};
use crate::error::{AttemptVerdict, ResolveError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Default time a failed host stays frozen
pub const DEFAULT_HOST_FREEZE_DURATION: Duration = Duration::from_secs(600);

/// Upper bound for a single backoff between attempts on one host
pub const MAX_BACKOFF_MS: u64 = 10_000;

/// Backoff between attempts on the same host
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per host, including the first
    pub max_attempts: usize,
    /// Backoff durations in milliseconds before each retry
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Create a new retry policy with exponential backoff
    pub fn new(max_attempts: usize) -> Self {
        // 100ms, 200ms, 400ms, ... capped at MAX_BACKOFF_MS
        let backoff_ms = (0..max_attempts.saturating_sub(1))
            .map(|i| {
                let factor = u32::try_from(i)
                    .ok()
                    .and_then(|shift| 1u64.checked_shl(shift))
                    .unwrap_or(u64::MAX);
                100u64.saturating_mul(factor).min(MAX_BACKOFF_MS)
            })
            .collect();

        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff_ms,
        }
    }

    /// Policy with fixed backoff, mostly for tests
    pub fn with_backoff(max_attempts: usize, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff_ms: vec![backoff.as_millis() as u64; max_attempts.saturating_sub(1)],
        }
    }

    /// Get the backoff duration before retry number `retry` (0-based)
    pub fn backoff_duration(&self, retry: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(retry)
            .copied()
            .unwrap_or_else(|| *self.backoff_ms.last().unwrap_or(&0));
        Duration::from_millis(ms)
    }
}

/// Decides what a failed attempt means for the host it ran against
pub trait FreezePolicy: Send + Sync {
    fn classify(&self, error: &ResolveError) -> AttemptVerdict;
}

/// Freezes on transport failures and misbehaving servers, see
/// [`ResolveError::verdict`]
#[derive(Debug, Clone, Default)]
pub struct DefaultFreezePolicy;

impl FreezePolicy for DefaultFreezePolicy {
    fn classify(&self, error: &ResolveError) -> AttemptVerdict {
        error.verdict()
    }
}

/// One attempt handed to the caller's request function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTarget {
    /// Host as listed in the endpoints
    pub host: String,
    /// Base URL (scheme and host) to send the request to
    pub url: String,
    /// Address chosen for this attempt when the DNS layer is enabled
    pub ip: Option<IpAddr>,
    /// Attempt number on this host, starting at 0
    pub retry: usize,
}

/// Hooks invoked at fixed points of a selection, in registration order
///
/// Every method defaults to doing nothing.
pub trait SelectorObserver: Send + Sync {
    fn on_host_selected(&self, _host: &str) {}
    fn before_attempt(&self, _target: &AttemptTarget) {}
    fn after_attempt(&self, _target: &AttemptTarget, _error: Option<&ResolveError>) {}
    fn on_backoff(&self, _target: &AttemptTarget, _delay: Duration) {}
    fn on_host_frozen(&self, _host: &str, _until: Instant) {}
}

/// Tunables for a [`HostSelector`]
#[derive(Debug, Clone)]
pub struct SelectorOptions {
    pub use_https: bool,
    pub host_freeze_duration: Duration,
    /// Hosts tried per call; `None` tries every candidate once
    pub retry_max: Option<usize>,
    pub per_host_retry: RetryPolicy,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        SelectorOptions {
            use_https: true,
            host_freeze_duration: DEFAULT_HOST_FREEZE_DURATION,
            retry_max: None,
            per_host_retry: RetryPolicy::new(1),
        }
    }
}

enum HostFailure {
    /// Stop everything and return this error
    Terminal(ResolveError),
    /// This host is done; move on
    Exhausted(ResolveError),
}

/// Runs requests against a tiered host list with temporary blacklisting
///
/// Freeze records live in memory for the lifetime of the selector.
pub struct HostSelector {
    options: SelectorOptions,
    freezes: Mutex<HashMap<String, Instant>>,
    policy: Arc<dyn FreezePolicy>,
    resolver: Option<Arc<dyn HostResolver>>,
    chooser: Arc<dyn IpChooser>,
    observers: Vec<Arc<dyn SelectorObserver>>,
}

impl HostSelector {
    pub fn new(options: SelectorOptions) -> Self {
        HostSelector {
            options,
            freezes: Mutex::new(HashMap::new()),
            policy: Arc::new(DefaultFreezePolicy),
            resolver: None,
            chooser: Arc::new(InOrderChooser),
            observers: Vec::new(),
        }
    }

    /// Replace the failure classification
    pub fn with_policy(mut self, policy: Arc<dyn FreezePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Enable the intra-host address layer
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>, chooser: Arc<dyn IpChooser>) -> Self {
        self.resolver = Some(resolver);
        self.chooser = chooser;
        self
    }

    /// Append an observer; observers run in the order they were added
    pub fn with_observer(mut self, observer: Arc<dyn SelectorObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn options(&self) -> &SelectorOptions {
        &self.options
    }

    /// Freeze `host` for the configured duration; returns when it thaws
    pub fn freeze(&self, host: &str) -> Instant {
        let until = Instant::now() + self.options.host_freeze_duration;
        self.freezes
            .lock()
            .unwrap()
            .insert(host_key(host).to_string(), until);
        warn!("Froze host {} for {:?}", host, self.options.host_freeze_duration);
        for observer in &self.observers {
            observer.on_host_frozen(host, until);
        }
        until
    }

    /// Lift a freeze early
    pub fn unfreeze(&self, host: &str) -> bool {
        self.freezes.lock().unwrap().remove(host_key(host)).is_some()
    }

    /// Whether `host` is frozen at `at`
    pub fn is_frozen_at(&self, host: &str, at: Instant) -> bool {
        self.freezes
            .lock()
            .unwrap()
            .get(host_key(host))
            .map_or(false, |until| *until > at)
    }

    pub fn is_frozen(&self, host: &str) -> bool {
        self.is_frozen_at(host, Instant::now())
    }

    /// Base URLs that would be tried right now, in order
    pub fn candidates(&self, endpoints: &Endpoints) -> Vec<String> {
        self.attempt_order(endpoints, Instant::now())
            .into_iter()
            .map(|(_, url)| url)
            .collect()
    }

    /// Hosts in tier order without the frozen ones
    ///
    /// If every host is frozen, the one thawing soonest is returned alone so
    /// a call still gets one attempt.
    fn attempt_order(&self, endpoints: &Endpoints, now: Instant) -> Vec<(String, String)> {
        let freezes = self.freezes.lock().unwrap();
        let frozen_until = |host: &str| freezes.get(host_key(host)).copied().filter(|u| *u > now);

        let available: Vec<(String, String)> = endpoints
            .hosts()
            .filter(|host| frozen_until(*host).is_none())
            .map(|host| (host.to_string(), host_to_url(host, self.options.use_https)))
            .collect();

        if !available.is_empty() || endpoints.is_empty() {
            return available;
        }

        endpoints
            .hosts()
            .min_by_key(|host| frozen_until(*host))
            .map(|host| vec![(host.to_string(), host_to_url(host, self.options.use_https))])
            .unwrap_or_default()
    }

    /// Run `attempt` against `endpoints` with failover
    ///
    /// Hosts are tried preferred tier first, in the order given. A host whose
    /// failure the policy classifies as freeze-worthy is frozen and the next
    /// host is tried; retryable failures are retried on the same host up to
    /// the per-host limit; terminal failures are returned at once.
    ///
    /// # Returns
    /// * `Ok(T)` from the first successful attempt
    /// * `Err(ResolveError::NoEndpoints)` if there is no host at all
    /// * `Err(e)` with the last attempt's error once every host is exhausted
    pub async fn select_and_do<T, F, Fut>(&self, endpoints: &Endpoints, mut attempt: F) -> Result<T>
    where
        F: FnMut(AttemptTarget) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let order = self.attempt_order(endpoints, Instant::now());
        if order.is_empty() {
            return Err(ResolveError::NoEndpoints);
        }

        let max_hosts = self.options.retry_max.unwrap_or(order.len()).clamp(1, order.len());
        let mut last_error = None;

        for (host, url) in order.into_iter().take(max_hosts) {
            for observer in &self.observers {
                observer.on_host_selected(&host);
            }
            debug!("Selected host {}", host);

            match self.try_host(&host, &url, &mut attempt).await {
                Ok(value) => return Ok(value),
                Err(HostFailure::Terminal(e)) => return Err(e),
                Err(HostFailure::Exhausted(e)) => {
                    debug!("Host {} exhausted: {}", host, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ResolveError::NoEndpoints))
    }

    async fn try_host<T, F, Fut>(
        &self,
        host: &str,
        url: &str,
        attempt: &mut F,
    ) -> std::result::Result<T, HostFailure>
    where
        F: FnMut(AttemptTarget) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ips: Vec<Option<IpAddr>> = match &self.resolver {
            Some(resolver) => {
                let chosen = match resolver.resolve(host).await {
                    Ok(ips) if !ips.is_empty() => self.chooser.choose(host, ips),
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        self.freeze(host);
                        return Err(HostFailure::Exhausted(e));
                    }
                };
                // An empty answer from either the resolver or the chooser
                // leaves nothing to dial
                if chosen.is_empty() {
                    self.freeze(host);
                    return Err(HostFailure::Exhausted(ResolveError::Transport(format!(
                        "No addresses for {}",
                        host
                    ))));
                }
                chosen.into_iter().map(Some).collect()
            }
            None => vec![None],
        };

        let policy = &self.options.per_host_retry;
        let mut retry = 0;
        loop {
            let target = AttemptTarget {
                host: host.to_string(),
                url: url.to_string(),
                ip: ips[retry % ips.len()],
                retry,
            };
            for observer in &self.observers {
                observer.before_attempt(&target);
            }

            let result = attempt(target.clone()).await;
            for observer in &self.observers {
                observer.after_attempt(&target, result.as_ref().err());
            }

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.policy.classify(&error) {
                AttemptVerdict::Terminal => return Err(HostFailure::Terminal(error)),
                AttemptVerdict::FreezeHost => {
                    self.freeze(host);
                    return Err(HostFailure::Exhausted(error));
                }
                AttemptVerdict::RetrySameHost => {
                    if retry + 1 >= policy.max_attempts {
                        return Err(HostFailure::Exhausted(error));
                    }
                    let delay = policy.backoff_duration(retry);
                    warn!(
                        "Attempt {} on {} failed, retrying after {:?}: {}",
                        retry + 1,
                        host,
                        delay,
                        error
                    );
                    for observer in &self.observers {
                        observer.on_backoff(&target, delay);
                    }
                    sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}
