//! Exclusive locks on abstract resource tokens.
//!
//! Jobs declare the tokens they touch; the scope manager guarantees that a
//! token has at most one holder. Acquisition is all-or-nothing, so a job never
//! holds part of its scope while waiting for the rest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{DroverError, Result};

/// Maps each held token to the id of the job holding it.
#[derive(Debug, Default)]
pub struct ScopeManager {
    holders: Mutex<HashMap<String, String>>,
    released: Notify,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every token for `job_id`, or none of them.
    ///
    /// Tokens already held by `job_id` are accepted again.
    pub fn acquire(&self, job_id: &str, tokens: &[String]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }

        let mut holders = self.holders();
        if let Some((token, holder)) = tokens.iter().find_map(|t| {
            holders
                .get(t)
                .filter(|holder| holder.as_str() != job_id)
                .map(|holder| (t, holder))
        }) {
            return Err(DroverError::Scope(format!(
                "token '{}' is held by job '{}'",
                token, holder
            )));
        }

        for token in tokens {
            holders.insert(token.clone(), job_id.to_string());
        }
        Ok(())
    }

    /// Wait until every token can be taken, or until `ctx` is cancelled.
    pub async fn acquire_wait(
        &self,
        job_id: &str,
        tokens: &[String],
        ctx: &CancellationToken,
    ) -> Result<()> {
        loop {
            // Register before trying so a release in between is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.acquire(job_id, tokens).is_ok() {
                return Ok(());
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(DroverError::Cancelled),
                _ = &mut released => {}
            }
        }
    }

    /// Release the tokens `job_id` holds. Tokens held by others are untouched.
    pub fn release(&self, job_id: &str, tokens: &[String]) {
        if tokens.is_empty() {
            return;
        }

        let mut holders = self.holders();
        let mut freed = false;
        for token in tokens {
            if holders.get(token).is_some_and(|holder| holder == job_id) {
                holders.remove(token);
                freed = true;
            }
        }
        drop(holders);

        if freed {
            self.released.notify_waiters();
        }
    }

    /// Release every token held by `job_id`.
    pub fn release_all(&self, job_id: &str) {
        let mut holders = self.holders();
        let before = holders.len();
        holders.retain(|_, holder| holder != job_id);
        let freed = holders.len() != before;
        drop(holders);

        if freed {
            self.released.notify_waiters();
        }
    }

    /// Current holder of `token`.
    pub fn holder(&self, token: &str) -> Option<String> {
        self.holders().get(token).cloned()
    }

    /// Number of tokens currently held.
    pub fn held(&self) -> usize {
        self.holders().len()
    }

    fn holders(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a job's tokens and releases them when dropped.
#[derive(Debug)]
pub struct ScopeGuard {
    manager: Arc<ScopeManager>,
    job_id: String,
    tokens: Vec<String>,
}

impl ScopeGuard {
    /// Acquire without waiting.
    pub fn try_acquire(
        manager: Arc<ScopeManager>,
        job_id: &str,
        tokens: &[String],
    ) -> Result<Self> {
        manager.acquire(job_id, tokens)?;
        Ok(Self {
            manager,
            job_id: job_id.to_string(),
            tokens: tokens.to_vec(),
        })
    }

    /// Acquire, waiting for current holders to release.
    pub async fn acquire(
        manager: Arc<ScopeManager>,
        job_id: &str,
        tokens: &[String],
        ctx: &CancellationToken,
    ) -> Result<Self> {
        manager.acquire_wait(job_id, tokens, ctx).await?;
        Ok(Self {
            manager,
            job_id: job_id.to_string(),
            tokens: tokens.to_vec(),
        })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.manager.release(&self.job_id, &self.tokens);
    }
}
