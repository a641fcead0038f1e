//! Browser sessions and the page contexts opened inside them.
//!
//! A [`Session`] is one engine process; a [`PageContext`] is one tab used for
//! exactly one render. The [`SessionManager`] owns every session it starts,
//! either launching a fresh one per request or keeping a small warm pool.
//!
//! Cleanup is tied to ownership: dropping a [`PageContext`] closes its tab,
//! dropping a [`SessionLease`] without releasing it closes the session. That
//! keeps cancelled or timed-out requests from leaking tabs or processes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::BrowserConfig;
use crate::engine::{Engine, EngineProcess, LaunchSpec, Surface};
use crate::error::{ForgeError, RenderFailure, Result};
use crate::fetcher::BinaryFetcher;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// Run blocking cleanup off the async workers when a runtime is around.
fn run_detached<F: FnOnce() + Send + 'static>(f: F) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(f);
        }
        Err(_) => f(),
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle of one browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    FetchingBinary,
    Launching,
    Ready,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `self → next` is a legal step.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, FetchingBinary)
                | (FetchingBinary, Launching)
                | (Launching, Ready)
                | (Uninitialized | FetchingBinary | Launching | Ready, Closing)
                | (Closing, Closed)
        )
    }

    /// Not yet closing or closed.
    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One engine process and the pages currently open in it.
pub struct Session {
    id: u64,
    state: Mutex<SessionState>,
    process: Mutex<Option<Arc<dyn EngineProcess>>>,
    pages: Mutex<HashMap<u64, Arc<dyn Surface>>>,
    next_page: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("open_pages", &self.open_pages())
            .finish()
    }
}

impl Session {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(SessionState::Uninitialized),
            process: Mutex::new(None),
            pages: Mutex::new(HashMap::new()),
            next_page: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Number of page contexts opened and not yet closed.
    pub fn open_pages(&self) -> usize {
        lock(&self.pages).len()
    }

    pub fn process_id(&self) -> Option<u32> {
        lock(&self.process).as_ref().and_then(|p| p.process_id())
    }

    fn transition(&self, next: SessionState) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            return Err(ForgeError::BrowserUnavailable(format!(
                "session {}: cannot move from {} to {next}",
                self.id, *state
            )));
        }
        log::trace!("session {}: {} -> {next}", self.id, *state);
        *state = next;
        Ok(())
    }

    // Hand the launched process to the session. If the session was closed
    // while launching, the process is terminated instead.
    fn attach(&self, process: Arc<dyn EngineProcess>) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Launching {
                *lock(&self.process) = Some(process);
                *state = SessionState::Ready;
                return Ok(());
            }
        }
        process.terminate();
        Err(ForgeError::BrowserUnavailable(format!(
            "session {} closed during launch",
            self.id
        )))
    }

    fn current_process(&self) -> Option<Arc<dyn EngineProcess>> {
        lock(&self.process).clone()
    }

    /// Blocking liveness check: ready, and the process still answers.
    pub fn is_healthy(&self) -> bool {
        self.state() == SessionState::Ready
            && self.current_process().is_some_and(|p| p.is_alive())
    }

    /// Open a fresh page context in this session.
    pub async fn new_page(self: &Arc<Self>) -> Result<PageContext> {
        if self.state() != SessionState::Ready {
            return Err(ForgeError::BrowserUnavailable(format!(
                "session {} is {}",
                self.id,
                self.state()
            )));
        }
        let process = self.current_process().ok_or_else(|| {
            ForgeError::BrowserUnavailable(format!("session {} has no process", self.id))
        })?;

        let surface = tokio::task::spawn_blocking(move || process.open_surface())
            .await
            .map_err(|e| ForgeError::render(RenderFailure::Crash, format!("opening page: {e}")))?
            .map_err(|e| ForgeError::BrowserUnavailable(format!("opening page: {e}")))?;

        let id = self.next_page.fetch_add(1, Ordering::Relaxed);
        {
            // Register under the state lock so a concurrent close cannot miss it.
            let state = lock(&self.state);
            if *state != SessionState::Ready {
                drop(state);
                surface.close();
                return Err(ForgeError::BrowserUnavailable(format!(
                    "session {} closed while opening a page",
                    self.id
                )));
            }
            lock(&self.pages).insert(id, surface.clone());
        }
        log::debug!("session {}: opened page {id}", self.id);

        Ok(PageContext {
            id,
            surface,
            session: Arc::clone(self),
            closed: AtomicBool::new(false),
        })
    }

    fn forget_page(&self, page_id: u64) {
        lock(&self.pages).remove(&page_id);
    }

    /// Close every open page, then terminate the process. Idempotent.
    pub async fn close(self: &Arc<Self>) {
        let session = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || session.close_blocking()).await {
            log::warn!("session {}: close task failed: {e}", self.id);
        }
    }

    /// Blocking form of [`Session::close`].
    pub fn close_blocking(&self) {
        let previous = {
            let mut state = lock(&self.state);
            let previous = *state;
            if !previous.is_live() {
                return;
            }
            *state = SessionState::Closing;
            previous
        };

        let pages: Vec<(u64, Arc<dyn Surface>)> = lock(&self.pages).drain().collect();
        if !pages.is_empty() {
            log::debug!("session {}: force-closing {} open page(s)", self.id, pages.len());
        }
        for (_, surface) in pages {
            surface.close();
        }
        if let Some(process) = lock(&self.process).take() {
            process.terminate();
        }

        *lock(&self.state) = SessionState::Closed;
        log::debug!("session {}: closed (was {previous})", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state().is_live() {
            self.close_blocking();
        }
    }
}

// ---------------------------------------------------------------------------
// Page context
// ---------------------------------------------------------------------------

/// One tab, used for one render and then closed.
pub struct PageContext {
    id: u64,
    surface: Arc<dyn Surface>,
    session: Arc<Session>,
    closed: AtomicBool,
}

impl fmt::Debug for PageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageContext")
            .field("id", &self.id)
            .field("session", &self.session.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PageContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The engine surface, or `ContextClosed` once the page is closed.
    pub(crate) fn surface(&self) -> Result<Arc<dyn Surface>> {
        if self.is_closed() {
            return Err(ForgeError::render(
                RenderFailure::ContextClosed,
                format!("page {} is closed", self.id),
            ));
        }
        Ok(Arc::clone(&self.surface))
    }

    /// Close the tab. Idempotent; in-flight engine calls on it fail.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let surface = Arc::clone(&self.surface);
        if let Err(e) = tokio::task::spawn_blocking(move || surface.close()).await {
            log::warn!("page {}: close task failed: {e}", self.id);
        }
        self.session.forget_page(self.id);
        log::debug!("session {}: closed page {}", self.session.id, self.id);
    }
}

impl Drop for PageContext {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("page {} dropped while open; closing", self.id);
        let surface = Arc::clone(&self.surface);
        let session = Arc::clone(&self.session);
        let id = self.id;
        run_detached(move || {
            surface.close();
            session.forget_page(id);
        });
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Whether sessions are reused between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// Launch a fresh process per request and close it afterwards.
    OneShot,
    /// Keep up to `max_sessions` processes; at most that many are checked out.
    Pooled { max_sessions: usize },
}

/// Starts, hands out and tears down browser sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    engine: Arc<dyn Engine>,
    fetcher: BinaryFetcher,
    launch: LaunchSpec,
    launch_timeout: Duration,
    policy: SessionPolicy,
    checkout: Option<Arc<Semaphore>>,
    idle: Mutex<Vec<Arc<Session>>>,
    live: Mutex<Vec<Weak<Session>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

enum LaunchWait {
    Done(std::result::Result<LaunchResult, JoinError>),
    Cancelled,
    TimedOut,
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn Engine>,
        fetcher: BinaryFetcher,
        launch: LaunchSpec,
        launch_timeout: Duration,
        policy: SessionPolicy,
    ) -> Self {
        let checkout = match policy {
            SessionPolicy::OneShot => None,
            SessionPolicy::Pooled { max_sessions } => Some(Arc::new(Semaphore::new(max_sessions.max(1)))),
        };
        Self {
            inner: Arc::new(ManagerInner {
                engine,
                fetcher,
                launch,
                launch_timeout,
                policy,
                checkout,
                idle: Mutex::new(Vec::new()),
                live: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Build from configuration, with `engine` doing the launching.
    pub fn from_config(engine: Arc<dyn Engine>, config: &BrowserConfig) -> Self {
        let launch = LaunchSpec {
            executable: None,
            sandbox: config.sandbox,
            args: config.extra_args.clone(),
            call_timeout: config.launch_timeout().max(config.font_ready_timeout()),
        };
        let policy = if config.pool.enabled {
            SessionPolicy::Pooled {
                max_sessions: config.pool.max_sessions,
            }
        } else {
            SessionPolicy::OneShot
        };
        Self::new(
            engine,
            BinaryFetcher::from_config(config),
            launch,
            config.launch_timeout(),
            policy,
        )
    }

    pub fn policy(&self) -> SessionPolicy {
        self.inner.policy
    }

    /// Sessions that are neither closing nor closed.
    pub fn live_sessions(&self) -> usize {
        let mut live = lock(&self.inner.live);
        live.retain(|w| w.strong_count() > 0);
        live.iter()
            .filter_map(Weak::upgrade)
            .filter(|s| s.state().is_live())
            .count()
    }

    /// Warm sessions waiting in the pool.
    pub fn idle_sessions(&self) -> usize {
        lock(&self.inner.idle).len()
    }

    /// Get a ready session: a healthy pooled one, or a newly launched one.
    pub async fn acquire_session(&self, cancel: &CancellationToken) -> Result<SessionLease> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ForgeError::BrowserUnavailable("session manager is shut down".into()));
        }

        let permit = match &self.inner.checkout {
            Some(semaphore) => {
                let semaphore = Arc::clone(semaphore);
                let permit = tokio::select! {
                    p = semaphore.acquire_owned() => p.map_err(|_| {
                        ForgeError::BrowserUnavailable("session manager is shut down".into())
                    })?,
                    _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
                };
                Some(permit)
            }
            None => None,
        };

        if let Some(session) = self.checkout_idle().await {
            return Ok(self.lease(session, permit));
        }
        let session = self.launch(cancel).await?;
        Ok(self.lease(session, permit))
    }

    fn lease(&self, session: Arc<Session>, permit: Option<OwnedSemaphorePermit>) -> SessionLease {
        SessionLease {
            session,
            manager: Arc::clone(&self.inner),
            _permit: permit,
            released: false,
        }
    }

    async fn checkout_idle(&self) -> Option<Arc<Session>> {
        loop {
            let candidate = lock(&self.inner.idle).pop()?;
            let checked = Arc::clone(&candidate);
            let healthy = tokio::task::spawn_blocking(move || checked.is_healthy())
                .await
                .unwrap_or(false);
            if healthy {
                log::debug!("session {}: checked out from pool", candidate.id);
                return Some(candidate);
            }
            log::warn!("session {}: unhealthy in pool, discarding", candidate.id);
            candidate.close().await;
        }
    }

    async fn launch(&self, cancel: &CancellationToken) -> Result<Arc<Session>> {
        let inner = &self.inner;
        let session = Session::new(inner.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut live = lock(&inner.live);
            live.retain(|w| w.strong_count() > 0);
            live.push(Arc::downgrade(&session));
        }

        session.transition(SessionState::FetchingBinary)?;
        let executable = match inner.fetcher.executable(cancel).await {
            Ok(exe) => exe,
            Err(e) => {
                session.close_blocking();
                return Err(e);
            }
        };

        session.transition(SessionState::Launching)?;
        let spec = LaunchSpec {
            executable,
            ..inner.launch.clone()
        };
        let engine = Arc::clone(&inner.engine);
        let mut pending = PendingLaunch(Some(tokio::task::spawn_blocking(move || engine.launch(&spec))));

        let wait = tokio::select! {
            joined = &mut pending => LaunchWait::Done(joined),
            _ = cancel.cancelled() => LaunchWait::Cancelled,
            _ = tokio::time::sleep(inner.launch_timeout) => LaunchWait::TimedOut,
        };

        let process = match wait {
            LaunchWait::Done(Ok(Ok(process))) => process,
            LaunchWait::Done(Ok(Err(msg))) => {
                session.close_blocking();
                return Err(ForgeError::BrowserUnavailable(format!(
                    "{} failed to launch: {msg}",
                    inner.engine.name()
                )));
            }
            LaunchWait::Done(Err(e)) => {
                session.close_blocking();
                return Err(ForgeError::BrowserUnavailable(format!("launch task failed: {e}")));
            }
            LaunchWait::Cancelled => {
                drop(pending);
                session.close_blocking();
                return Err(ForgeError::Cancelled);
            }
            LaunchWait::TimedOut => {
                drop(pending);
                session.close_blocking();
                return Err(ForgeError::BrowserUnavailable(format!(
                    "{} did not start within {:?}",
                    inner.engine.name(),
                    inner.launch_timeout
                )));
            }
        };

        session.attach(Arc::from(process))?;
        log::info!(
            "session {}: ready (pid {:?})",
            session.id,
            session.process_id()
        );
        Ok(session)
    }

    /// Close idle and checked-out sessions. Later acquisitions fail.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(semaphore) = &self.inner.checkout {
            semaphore.close();
        }
        let idle: Vec<Arc<Session>> = lock(&self.inner.idle).drain(..).collect();
        let live: Vec<Arc<Session>> = lock(&self.inner.live)
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        log::info!("shutting down {} live session(s)", live.len());
        for session in idle.iter().chain(live.iter()) {
            session.close().await;
        }
    }
}

type LaunchResult = std::result::Result<Box<dyn EngineProcess>, String>;

/// A launch running on the blocking pool.
///
/// If it is dropped before completing (cancel, launch timeout, or the
/// whole request future going away) the process it may still produce is
/// terminated as soon as it appears.
struct PendingLaunch(Option<JoinHandle<LaunchResult>>);

impl Future for PendingLaunch {
    type Output = std::result::Result<LaunchResult, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(task) = self.0.as_mut() else {
            return Poll::Pending;
        };
        let joined = ready!(Pin::new(task).poll(cx));
        self.0 = None;
        Poll::Ready(joined)
    }
}

impl Drop for PendingLaunch {
    fn drop(&mut self) {
        let Some(task) = self.0.take() else { return };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Ok(Ok(process)) = task.await {
                log::debug!(
                    "terminating process from abandoned launch (pid {:?})",
                    process.process_id()
                );
                let _ = tokio::task::spawn_blocking(move || process.terminate()).await;
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A session checked out for one request.
///
/// Call [`SessionLease::release`] when done. A lease dropped without release
/// closes its session.
pub struct SessionLease {
    session: Arc<Session>,
    manager: Arc<ManagerInner>,
    _permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn new_page(&self) -> Result<PageContext> {
        self.session.new_page().await
    }

    /// Return the session. Pooled, healthy sessions with no open pages go
    /// back to the pool when `reusable`; anything else is closed.
    pub async fn release(mut self, reusable: bool) {
        self.released = true;
        let manager = &self.manager;
        let keep = reusable
            && matches!(manager.policy, SessionPolicy::Pooled { .. })
            && !manager.shut_down.load(Ordering::SeqCst)
            && self.session.state() == SessionState::Ready
            && self.session.open_pages() == 0;

        if keep {
            if let SessionPolicy::Pooled { max_sessions } = manager.policy {
                let mut idle = lock(&manager.idle);
                if idle.len() < max_sessions {
                    log::debug!("session {}: returned to pool", self.session.id);
                    idle.push(Arc::clone(&self.session));
                    return;
                }
            }
        }
        self.session.close().await;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        log::debug!("session {}: lease dropped without release; closing", self.session.id);
        let session = Arc::clone(&self.session);
        run_detached(move || session.close_blocking());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn happy_path_transitions() {
        let path = [Uninitialized, FetchingBinary, Launching, Ready, Closing, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn any_live_state_may_close() {
        for s in [Uninitialized, FetchingBinary, Launching, Ready] {
            assert!(s.is_live());
            assert!(s.can_transition_to(Closing));
        }
        assert!(!Closing.is_live());
        assert!(!Closed.is_live());
    }

    #[test]
    fn illegal_transitions_rejected() {
        assert!(!Uninitialized.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Launching));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Closed.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Closed));
    }

    #[test]
    fn session_rejects_out_of_order_steps() {
        let session = Session::new(7);
        assert_eq!(session.state(), Uninitialized);
        assert!(session.transition(Launching).is_err());
        session.transition(FetchingBinary).unwrap();
        session.close_blocking();
        assert_eq!(session.state(), Closed);
        // Closing twice is a no-op.
        session.close_blocking();
        assert_eq!(session.state(), Closed);
        assert!(session.transition(Launching).is_err());
    }
}
