//! DFS referral resolution
//!
//! A redirect status on tree connect means the path lives under a DFS
//! namespace. [`ReferralResolver`] maps such a path to an ordered
//! [`ReferralChain`] of concrete targets, caching chains for their TTL and
//! falling back to an expired chain when the namespace server cannot be
//! reached.

pub mod wire;

use crate::config::DfsConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use wire::ClientReferralSource;

/// One referral target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Referral {
    /// Target server
    pub server: String,
    /// Target share
    pub share: String,
    /// Path below the target share, without leading separator
    pub path: String,
    /// Namespace the referral came from when it is domain based
    pub domain: Option<String>,
    pub ttl: Duration,
    /// DFS path prefix this referral replaces, e.g. `\domain\root\link`
    pub link: String,
}

impl Referral {
    /// `\\server\share[\path]`
    pub fn target(&self) -> String {
        let mut target = format!(r"\\{}\{}", self.server, self.share);
        if !self.path.is_empty() {
            target.push('\\');
            target.push_str(&self.path);
        }
        target
    }

    /// Rewrite `original` so that the referral's link prefix points at its
    /// target. Paths outside the link are returned unchanged.
    pub fn resolve_path(&self, original: &str) -> String {
        let original = normalize(original);
        let link = normalize(&self.link);
        match strip_prefix_ci(&original, &link) {
            Some(rest) => format!("{}{}", self.target(), rest),
            None => original,
        }
    }
}

impl fmt::Display for Referral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} (ttl {}s)", self.link, self.target(), self.ttl.as_secs())
    }
}

/// Non-empty, ordered set of alternative targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralChain(Vec<Referral>);

impl ReferralChain {
    pub fn new(referrals: Vec<Referral>) -> Result<Self> {
        if referrals.is_empty() {
            return Err(Error::NoReferral("empty referral list".into()));
        }
        Ok(Self(referrals))
    }

    pub fn first(&self) -> &Referral {
        &self.0[0]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Referral> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Shortest TTL in the chain
    pub fn ttl(&self) -> Duration {
        self.0.iter().map(|r| r.ttl).min().unwrap_or_default()
    }
}

impl<'a> IntoIterator for &'a ReferralChain {
    type Item = &'a Referral;
    type IntoIter = std::slice::Iter<'a, Referral>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Where referrals come from
#[async_trait]
pub trait ReferralSource: Send + Sync {
    /// Ask a namespace server for the targets of `path`.
    async fn fetch(&self, path: &str) -> Result<Vec<Referral>>;
}

/// Whether a cached but expired chain may be returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    AllowStale,
    RequireFresh,
}

/// Cap for TTLs that do not fit an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct CacheEntry {
    chain: ReferralChain,
    expires: Instant,
}

pub struct ReferralResolver {
    config: DfsConfig,
    source: Arc<dyn ReferralSource>,
    /// Keyed by upper-cased link path
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ReferralResolver {
    pub fn new(config: DfsConfig, source: Arc<dyn ReferralSource>) -> Self {
        Self {
            config,
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, path: &str) -> Result<ReferralChain> {
        self.resolve_with(path, Freshness::AllowStale).await
    }

    /// Resolve `path`, going to the source when no fresh chain is cached.
    pub async fn resolve_with(&self, path: &str, freshness: Freshness) -> Result<ReferralChain> {
        if !self.config.enabled {
            return Err(Error::NotDfsPath(format!("{} (DFS disabled)", path)));
        }
        let path = normalize(path);
        if components(&path).len() < 2 {
            return Err(Error::NotDfsPath(path));
        }

        let cached = self.lookup(&path);
        if let Some((chain, expires)) = &cached {
            if *expires > Instant::now() {
                debug!(path = %path, targets = chain.len(), "Referral cache hit");
                return Ok(chain.clone());
            }
        }

        match self.source.fetch(&path).await {
            Ok(referrals) => {
                let chain = ReferralChain::new(referrals)
                    .map_err(|_| Error::NoReferral(path.clone()))?;
                self.store(&path, chain.clone());
                Ok(chain)
            }
            Err(e) => match cached {
                Some((chain, expires)) if self.may_serve_stale(expires, freshness) => {
                    warn!(
                        path = %path,
                        error = %e,
                        "Referral refresh failed, serving expired entry"
                    );
                    Ok(chain)
                }
                _ => Err(e),
            },
        }
    }

    fn may_serve_stale(&self, expires: Instant, freshness: Freshness) -> bool {
        freshness == Freshness::AllowStale
            && self.config.serve_stale
            && expires.elapsed() <= self.config.max_stale
    }

    /// Longest cached link that is a component prefix of `path`.
    fn lookup(&self, path: &str) -> Option<(ReferralChain, Instant)> {
        let cache = self.cache.lock();
        let upper = path.to_uppercase();
        cache
            .iter()
            .filter(|(key, _)| is_component_prefix(key, &upper))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, entry)| (entry.chain.clone(), entry.expires))
    }

    fn store(&self, path: &str, chain: ReferralChain) {
        let link = normalize(&chain.first().link);
        let key = if !link.is_empty() && is_component_prefix(&link.to_uppercase(), &path.to_uppercase())
        {
            link
        } else {
            path.to_string()
        };
        let ttl = self.config.ttl_override.unwrap_or_else(|| chain.ttl());
        info!(link = %key, targets = chain.len(), ttl_secs = ttl.as_secs(), "Caching referral");
        let now = Instant::now();
        let expires = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, entry| !self.is_dead(entry, now));
        if cache.len() < before {
            debug!(evicted = before - cache.len(), "Evicted expired referrals");
        }
        cache.insert(key.to_uppercase(), CacheEntry { chain, expires });
    }

    /// Expired and past any stale serving window.
    fn is_dead(&self, entry: &CacheEntry, now: Instant) -> bool {
        if entry.expires > now {
            return false;
        }
        !self.config.serve_stale || now.duration_since(entry.expires) > self.config.max_stale
    }

    /// Drop every cached chain covering `path`.
    pub fn invalidate(&self, path: &str) {
        let upper = normalize(path).to_uppercase();
        self.cache
            .lock()
            .retain(|key, _| !is_component_prefix(key, &upper));
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Backslash separated, single leading `\`, no trailing separator.
pub(crate) fn normalize(path: &str) -> String {
    let parts = components(path);
    if parts.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('\\');
        out.push_str(part);
    }
    out
}

fn components(path: &str) -> Vec<&str> {
    path.split(['\\', '/']).filter(|c| !c.is_empty()).collect()
}

/// `prefix` equals `path` or ends at a separator inside it.
pub(crate) fn is_component_prefix(prefix: &str, path: &str) -> bool {
    strip_prefix_ci(path, prefix).is_some()
}

fn strip_prefix_ci<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() || path.len() < prefix.len() || !path.is_char_boundary(prefix.len()) {
        return None;
    }
    let (head, rest) = path.split_at(prefix.len());
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    (rest.is_empty() || rest.starts_with('\\')).then_some(rest)
}
