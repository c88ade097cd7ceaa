use std::collections::HashMap;
use std::time::Duration;

/// Freshness and fetch deadline settings for the partition manager.
#[derive(Debug, Clone)]
pub struct CacheSettings {
  /// How long a fetched payload stays fresh unless the domain overrides it
  pub default_ttl: Duration,
  /// Deadline for a single domain fetch
  pub fetch_timeout: Duration,
  /// Per-domain TTL overrides
  pub domain_ttls: HashMap<String, Duration>,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      default_ttl: Duration::from_secs(5 * 60),
      fetch_timeout: Duration::from_secs(10),
      domain_ttls: HashMap::new(),
    }
  }
}

impl CacheSettings {
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
    self.fetch_timeout = timeout;
    self
  }

  pub fn with_domain_ttl(mut self, domain: impl Into<String>, ttl: Duration) -> Self {
    self.domain_ttls.insert(domain.into(), ttl);
    self
  }

  pub fn ttl_for(&self, domain: &str) -> Duration {
    self
      .domain_ttls
      .get(domain)
      .copied()
      .unwrap_or(self.default_ttl)
  }
}
