//! Distributed lock collaborator
//!
//! Singleton pipelines hold a named lease while they run. Failing to get
//! the lease means another node is running the pipeline; it is not an
//! error.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{OrchestratorError, Result};

/// A lease service keyed by `(domain, key)`
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes or extends the lease for `holder`.
    ///
    /// Returns `Ok(false)` when another holder owns an unexpired lease.
    async fn hold(
        &self,
        domain: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
        renew: bool,
    ) -> Result<bool>;

    /// Gives the lease up. Releasing a lease owned by someone else fails.
    async fn release(&self, domain: &str, key: &str, holder: &str) -> Result<()>;
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Process-local lock, shared between modules of one process
#[derive(Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<(String, String), Lease>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of an unexpired lease
    pub fn holder(&self, domain: &str, key: &str) -> Option<String> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases
            .get(&(domain.to_string(), key.to_string()))
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.holder.clone())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn hold(
        &self,
        domain: &str,
        key: &str,
        holder: &str,
        ttl: Duration,
        renew: bool,
    ) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let id = (domain.to_string(), key.to_string());

        match leases.get_mut(&id) {
            Some(lease) if lease.expires_at > now && lease.holder != holder => {
                trace!("Lock {}/{} is held by {}", domain, key, lease.holder);
                Ok(false)
            }
            Some(lease) if lease.expires_at > now => {
                if renew {
                    lease.expires_at = now + ttl;
                }
                Ok(true)
            }
            _ => {
                leases.insert(
                    id,
                    Lease {
                        holder: holder.to_string(),
                        expires_at: now + ttl,
                    },
                );
                trace!("Lock {}/{} acquired by {}", domain, key, holder);
                Ok(true)
            }
        }
    }

    async fn release(&self, domain: &str, key: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let id = (domain.to_string(), key.to_string());

        match leases.get(&id) {
            None => Ok(()),
            Some(lease) if lease.holder == holder => {
                leases.remove(&id);
                Ok(())
            }
            Some(lease) if lease.expires_at <= Instant::now() => {
                leases.remove(&id);
                Ok(())
            }
            Some(lease) => Err(OrchestratorError::Lock(format!(
                "{}/{} is held by {}, not {}",
                domain, key, lease.holder, holder
            ))),
        }
    }
}
