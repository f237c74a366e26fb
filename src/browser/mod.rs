//! Bounded per-worker browser pool with exclusive leases.
//!
//! Contexts are reused across tasks until they hit the configured use count,
//! then torn down and replaced. Acquisition is FIFO with a wait and is
//! cancellable. A lease released after a failure discards its context rather
//! than returning it; a recycled lease destroys all page state.

pub mod profile;
pub mod setup;

pub use profile::{BrowserProfile, CookiesPolicy, Fingerprint, ProfileDir};

use chromiumoxide::Page;
use chromiumoxide::browser::Browser;
use chromiumoxide_cdp::cdp::browser_protocol::storage::ClearCookiesParams;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrowserPoolConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No context became available within the acquire window; the task
    /// should be queued back with reason=contention.
    #[error("browser pool acquire timed out")]
    Timeout,
    /// The context's CDP connection is gone; it was torn down and replaced.
    #[error("browser context crashed: {0}")]
    CrashedContext(String),
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("acquire cancelled")]
    Cancelled,
}

impl From<PoolError> for EngineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout => EngineError::new(ErrorKind::Timeout, err.to_string()),
            PoolError::Cancelled => EngineError::cancelled(),
            other => EngineError::new(ErrorKind::Internal, other.to_string()),
        }
    }
}

/// A live browser context plus pool bookkeeping.
#[derive(Debug)]
pub struct PooledContext {
    pub id: u64,
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
    profile: BrowserProfile,
    /// Task leases served so far; contexts retire at `max_context_uses`.
    uses: u32,
    last_used: Instant,
}

impl PooledContext {
    async fn teardown(mut self) {
        if let Some(browser) = Arc::get_mut(&mut self.browser) {
            if let Err(e) = browser.close().await {
                warn!("failed to close browser {}: {e}", self.id);
            }
            let _ = browser.wait().await;
        } else {
            warn!(
                "browser {} still has outstanding references at teardown",
                self.id
            );
        }
        self.handler.abort();
        profile::remove_profile_dir(&self.user_data_dir);
        debug!("browser context {} torn down", self.id);
    }
}

#[derive(Debug)]
pub struct BrowserPool {
    config: BrowserPoolConfig,
    available: Mutex<VecDeque<PooledContext>>,
    /// Live contexts, available plus leased.
    total: AtomicUsize,
    next_id: AtomicU64,
    released: Notify,
    shutdown: AtomicBool,
}

impl BrowserPool {
    #[must_use]
    pub fn new(config: BrowserPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            available: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            released: Notify::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Acquire a context matching `profile`. FIFO among waiters; cancellable
    /// through `cancel`; bounded by the configured acquire timeout.
    pub async fn acquire(
        self: &Arc<Self>,
        profile: &BrowserProfile,
        cancel: &CancellationToken,
    ) -> Result<BrowserLease, PoolError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.acquire_timeout_secs);

        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(PoolError::Cancelled);
            }

            // Reuse an idle context when its identity-relevant profile bits
            // match; a proxy or user-agent change forces a fresh launch.
            {
                let mut available = self.available.lock().await;
                if let Some(pos) = available.iter().position(|ctx| {
                    ctx.profile.proxy == profile.proxy
                        && ctx.profile.fingerprint.user_agent == profile.fingerprint.user_agent
                }) {
                    let mut ctx = available.remove(pos).expect("position just found");
                    drop(available);
                    // Health check before handing out.
                    match ctx.browser.version().await {
                        Ok(_) => {
                            ctx.uses += 1;
                            ctx.last_used = Instant::now();
                            debug!("leased browser context {} (use {})", ctx.id, ctx.uses);
                            return Ok(BrowserLease::new(ctx, Arc::clone(self)));
                        }
                        Err(e) => {
                            warn!("context {} failed health check: {e}", ctx.id);
                            self.total.fetch_sub(1, Ordering::Relaxed);
                            tokio::spawn(ctx.teardown());
                            continue;
                        }
                    }
                }
            }

            // Room to grow: launch a fresh context for this profile.
            if self.total.load(Ordering::Relaxed) < self.config.pool_size {
                let ctx = self.launch(profile).await?;
                self.total.fetch_add(1, Ordering::Relaxed);
                return Ok(BrowserLease::new(ctx, Arc::clone(self)));
            }

            // Pool saturated with mismatched contexts: retire the oldest
            // idle one to make room rather than waiting forever.
            {
                let mut available = self.available.lock().await;
                if let Some(ctx) = available.pop_front() {
                    drop(available);
                    self.total.fetch_sub(1, Ordering::Relaxed);
                    tokio::spawn(ctx.teardown());
                    continue;
                }
            }

            // All contexts are leased out; wait for a release.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::Timeout);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = self.released.notified() => {}
                _ = tokio::time::sleep(remaining) => return Err(PoolError::Timeout),
            }
        }
    }

    async fn launch(&self, profile: &BrowserProfile) -> Result<PooledContext, PoolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (browser, handler, user_data_dir) =
            setup::launch_context(profile, self.config.headless)
                .await
                .map_err(|e| PoolError::Launch(format!("{e:#}")))?;
        info!("launched browser context {id}");
        Ok(PooledContext {
            id,
            browser: Arc::new(browser),
            handler,
            user_data_dir,
            profile: profile.clone(),
            uses: 1,
            last_used: Instant::now(),
        })
    }

    /// Return a context to the pool, or retire it when discarded or worn out.
    fn release(self: &Arc<Self>, ctx: PooledContext, discard: bool) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let retire = discard
                || ctx.uses >= pool.config.max_context_uses
                || pool.shutdown.load(Ordering::Relaxed);
            if retire {
                debug!(
                    "retiring context {} (uses={}, discard={discard})",
                    ctx.id, ctx.uses
                );
                pool.total.fetch_sub(1, Ordering::Relaxed);
                ctx.teardown().await;
            } else {
                pool.available.lock().await.push_back(ctx);
            }
            pool.released.notify_one();
        });
    }

    pub async fn shutdown(&self) {
        info!("shutting down browser pool");
        self.shutdown.store(true, Ordering::Relaxed);
        let mut available = self.available.lock().await;
        while let Some(ctx) = available.pop_front() {
            self.total.fetch_sub(1, Ordering::Relaxed);
            ctx.teardown().await;
        }
        self.released.notify_waiters();
    }

    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Exclusive hold on one browser context for the duration of a task.
pub struct BrowserLease {
    ctx: parking_lot::Mutex<Option<PooledContext>>,
    pool: Arc<BrowserPool>,
    page: Mutex<Option<Page>>,
    discard: AtomicBool,
}

impl BrowserLease {
    fn new(ctx: PooledContext, pool: Arc<BrowserPool>) -> Self {
        Self {
            ctx: parking_lot::Mutex::new(Some(ctx)),
            pool,
            page: Mutex::new(None),
            discard: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn context_id(&self) -> u64 {
        self.ctx.lock().as_ref().map_or(0, |c| c.id)
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.ctx
            .lock()
            .as_ref()
            .map(|c| c.profile.fingerprint.clone())
            .unwrap_or_default()
    }

    fn browser(&self) -> Result<Arc<Browser>, PoolError> {
        self.ctx
            .lock()
            .as_ref()
            .map(|c| Arc::clone(&c.browser))
            .ok_or(PoolError::Cancelled)
    }

    /// The lease's page, created on first use. `Page` is cheap to clone.
    pub async fn page(&self) -> Result<Page, PoolError> {
        let mut slot = self.page.lock().await;
        if let Some(page) = slot.as_ref() {
            return Ok(page.clone());
        }
        let browser = self.browser()?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| PoolError::CrashedContext(e.to_string()))?;
        *slot = Some(page.clone());
        Ok(page)
    }

    /// Navigate the lease's page and wait for the load, classified on error.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> EngineResult<Page> {
        let page = self.page().await.map_err(EngineError::from)?;

        let nav = async {
            page.goto(url)
                .await
                .map_err(|e| EngineError::classified(e.to_string()))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| EngineError::classified(e.to_string()))?;
            Ok::<_, EngineError>(())
        };
        match tokio::time::timeout(timeout, nav).await {
            Ok(Ok(())) => Ok(page),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::timeout(format!(
                "navigation to {url} timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Wipe the context's cookie jar.
    pub async fn clear_cookies(&self) -> EngineResult<()> {
        let page = self.page().await.map_err(EngineError::from)?;
        let params = ClearCookiesParams {
            browser_context_id: None,
        };
        page.execute(params)
            .await
            .map_err(|e| EngineError::internal(format!("clear cookies: {e}")))?;
        Ok(())
    }

    /// Return the context to the pool. Equivalent to dropping the lease.
    pub fn release(self) {}

    /// Mark the context for teardown on release (failure path).
    pub fn mark_discard(&self) {
        self.discard.store(true, Ordering::Relaxed);
    }

    /// Destroy all page state and retire the context immediately.
    pub async fn recycle(self) {
        if let Some(page) = self.page.lock().await.take() {
            let _ = page.close().await;
        }
        self.discard.store(true, Ordering::Relaxed);
        // Drop runs the release path with discard set.
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.lock().take() {
            // Close the task's page before the context goes back; page state
            // must not leak across leases.
            if let Ok(mut slot) = self.page.try_lock() {
                if let Some(page) = slot.take() {
                    tokio::spawn(async move {
                        let _ = page.close().await;
                    });
                }
            }
            self.pool.release(ctx, self.discard.load(Ordering::Relaxed));
        }
    }
}
