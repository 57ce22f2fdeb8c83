//! Per-upstream connection lifecycle.
//!
//! One [`UpstreamLifecycle`] owns the connection for one alias. Callers ask
//! for a ready client with [`UpstreamLifecycle::connection`]; concurrent
//! callers share a single in-flight attempt, which runs as its own task so a
//! caller giving up does not abort it. State changes are published on a
//! `watch` channel that waiters poll with a bounded deadline.
//!
//! ```text
//! idle -> initializing -> ready -> shutting_down -> terminated
//!           |                                           |
//!           +--(failure)--> idle <----(next request)----+
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::Serialize,
    tokio::{
        sync::{Mutex, watch},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use {bundler_common::definitions::upstream as upstream_metrics, metrics::counter};

use crate::{
    client::McpClient,
    credentials::{NoCredentials, SharedCredentialResolver},
    error::{Error, LifecycleError, Result},
    traits::McpClientTrait,
    transport::SpawnSpec,
    upstream::{ConnectionParams, UpstreamDescriptor},
};

/// Delays between background reconnect attempts; the loop gives up after the last.
pub const DEFAULT_BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Initializing,
    Ready,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Opens a client for a descriptor. Swapped out in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &UpstreamDescriptor) -> Result<Arc<dyn McpClientTrait>>;
}

/// Connects local upstreams over stdio and remote ones over streamable HTTP.
pub struct ProcessConnector {
    request_timeout: Duration,
    credentials: SharedCredentialResolver,
}

impl ProcessConnector {
    pub fn new(request_timeout: Duration, credentials: SharedCredentialResolver) -> Self {
        Self {
            request_timeout,
            credentials,
        }
    }
}

impl Default for ProcessConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT, Arc::new(NoCredentials))
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self, descriptor: &UpstreamDescriptor) -> Result<Arc<dyn McpClientTrait>> {
        let alias = descriptor.alias.as_str();
        let misconfigured = |reason: String| LifecycleError::Configuration {
            alias: alias.to_string(),
            reason,
        };

        match &descriptor.connection {
            ConnectionParams::Local {
                command,
                args,
                cwd,
                env,
            } => {
                if command.trim().is_empty() {
                    return Err(misconfigured("no command configured".into()).into());
                }
                let spec = SpawnSpec {
                    command,
                    args,
                    cwd: cwd.as_deref(),
                    env,
                };
                match McpClient::connect_stdio(alias, spec, self.request_timeout).await {
                    Ok(client) => Ok(Arc::new(client)),
                    Err(e) if e.is_not_found() => {
                        Err(misconfigured(format!("executable '{command}' not found")).into())
                    },
                    Err(e) => Err(e),
                }
            },
            ConnectionParams::Remote { url, headers } => {
                if url.trim().is_empty() {
                    return Err(misconfigured("no url configured".into()).into());
                }
                if let Err(e) = url::Url::parse(url) {
                    return Err(misconfigured(format!("invalid url '{url}': {e}")).into());
                }
                let credentials = if descriptor.requires_auth {
                    if self.credentials.resolve_token(alias).await.is_none() {
                        return Err(LifecycleError::CredentialsPending {
                            alias: alias.to_string(),
                        }
                        .into());
                    }
                    Some(Arc::clone(&self.credentials))
                } else {
                    None
                };
                let client = McpClient::connect_http(
                    alias,
                    url,
                    headers.clone(),
                    self.request_timeout,
                    credentials,
                )
                .await?;
                Ok(Arc::new(client))
            },
        }
    }
}

/// Timing and credential settings shared by every lifecycle of a manager.
#[derive(Clone)]
pub struct LifecycleSettings {
    pub ready_timeout: Duration,
    pub backoff: Vec<Duration>,
    pub credentials: SharedCredentialResolver,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            backoff: DEFAULT_BACKOFF.to_vec(),
            credentials: Arc::new(NoCredentials),
        }
    }
}

#[derive(Debug, Clone)]
struct AttemptStatus {
    state: ConnectionState,
    /// Attempt the state belongs to; bumped each time an attempt starts.
    generation: u64,
    failure: Option<LifecycleError>,
}

struct Inner {
    descriptor: UpstreamDescriptor,
    client: Option<Arc<dyn McpClientTrait>>,
    /// Signature of the descriptor the live client was opened with.
    live_signature: Option<String>,
    generation: u64,
}

/// Connection state machine for one upstream alias.
pub struct UpstreamLifecycle {
    alias: String,
    connector: Arc<dyn Connector>,
    settings: LifecycleSettings,
    inner: Mutex<Inner>,
    status: watch::Sender<AttemptStatus>,
    cancel: CancellationToken,
    reconnecting: AtomicBool,
}

impl UpstreamLifecycle {
    pub fn new(
        descriptor: UpstreamDescriptor,
        connector: Arc<dyn Connector>,
        settings: LifecycleSettings,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(AttemptStatus {
            state: ConnectionState::Idle,
            generation: 0,
            failure: None,
        });
        Arc::new(Self {
            alias: descriptor.alias.clone(),
            connector,
            settings,
            inner: Mutex::new(Inner {
                descriptor,
                client: None,
                live_signature: None,
                generation: 0,
            }),
            status,
            cancel,
            reconnecting: AtomicBool::new(false),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Error from the most recent failed attempt, if the upstream is idle because of it.
    pub fn last_failure(&self) -> Option<LifecycleError> {
        self.status.borrow().failure.clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    pub async fn descriptor(&self) -> UpstreamDescriptor {
        self.inner.lock().await.descriptor.clone()
    }

    /// Signature of the live connection, `None` unless ready.
    pub async fn live_signature(&self) -> Option<String> {
        self.inner.lock().await.live_signature.clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn publish(&self, state: ConnectionState, generation: u64, failure: Option<LifecycleError>) {
        self.status.send_replace(AttemptStatus {
            state,
            generation,
            failure,
        });
    }

    /// Return a ready client, connecting if needed.
    ///
    /// Waits at most the configured ready timeout. A timed-out wait leaves
    /// the attempt running so the next caller can pick it up.
    pub async fn connection(self: &Arc<Self>) -> std::result::Result<Arc<dyn McpClientTrait>, LifecycleError> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        let mut rx = self.status.subscribe();

        loop {
            if self.cancel.is_cancelled() {
                return Err(LifecycleError::Stopped);
            }

            let waiting_for = {
                let mut inner = self.inner.lock().await;
                let status = self.status.borrow().clone();
                match status.state {
                    ConnectionState::Ready => match &inner.client {
                        Some(client) => return Ok(Arc::clone(client)),
                        None => Some(self.start_attempt(&mut inner)),
                    },
                    ConnectionState::Initializing => Some(status.generation),
                    ConnectionState::Idle | ConnectionState::Terminated => {
                        Some(self.start_attempt(&mut inner))
                    },
                    ConnectionState::ShuttingDown => None,
                }
            };

            match waiting_for {
                Some(generation) => {
                    return self.wait_for_attempt(generation, deadline, &mut rx).await;
                },
                None => self.wait_step(deadline, &mut rx).await?,
            }
        }
    }

    fn start_attempt(self: &Arc<Self>, inner: &mut Inner) -> u64 {
        inner.generation += 1;
        let generation = inner.generation;
        self.publish(ConnectionState::Initializing, generation, None);

        let this = Arc::clone(self);
        let descriptor = inner.descriptor.clone();
        tokio::spawn(async move { this.run_attempt(generation, descriptor).await });
        generation
    }

    async fn run_attempt(self: Arc<Self>, generation: u64, descriptor: UpstreamDescriptor) {
        #[cfg(feature = "metrics")]
        counter!(upstream_metrics::CONNECTION_ATTEMPTS_TOTAL, "alias" => self.alias.clone())
            .increment(1);
        debug!(alias = %self.alias, generation, "starting upstream connection attempt");

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(LifecycleError::Stopped),
            result = self.connector.connect(&descriptor) => {
                result.map_err(|e| lifecycle_error(&self.alias, e))
            },
        };

        let mut inner = self.inner.lock().await;
        let still_wanted = inner.generation == generation
            && self.status.borrow().state == ConnectionState::Initializing;
        if !still_wanted {
            drop(inner);
            if let Ok(client) = result {
                debug!(alias = %self.alias, generation, "discarding superseded connection");
                client.shutdown().await;
            }
            return;
        }

        match result {
            Ok(client) => {
                inner.client = Some(client);
                inner.live_signature = Some(descriptor.identity_signature());
                self.publish(ConnectionState::Ready, generation, None);
                info!(alias = %self.alias, generation, "upstream ready");
            },
            Err(err) => {
                #[cfg(feature = "metrics")]
                counter!(upstream_metrics::CONNECTION_FAILURES_TOTAL, "alias" => self.alias.clone())
                    .increment(1);
                warn!(alias = %self.alias, generation, error = %err, "upstream connection attempt failed");
                self.publish(ConnectionState::Idle, generation, Some(err));
            },
        }
    }

    async fn wait_for_attempt(
        &self,
        generation: u64,
        deadline: Instant,
        rx: &mut watch::Receiver<AttemptStatus>,
    ) -> std::result::Result<Arc<dyn McpClientTrait>, LifecycleError> {
        loop {
            let status = rx.borrow_and_update().clone();
            if status.generation != generation {
                return Err(self.connection_error("connection attempt was superseded"));
            }
            match status.state {
                ConnectionState::Initializing => {},
                ConnectionState::Ready => {
                    if let Some(client) = self.inner.lock().await.client.clone() {
                        return Ok(client);
                    }
                },
                ConnectionState::Idle => {
                    return Err(status
                        .failure
                        .unwrap_or_else(|| self.connection_error("connection attempt failed")));
                },
                ConnectionState::ShuttingDown | ConnectionState::Terminated => {
                    return Err(self.connection_error("disconnected while connecting"));
                },
            }
            self.wait_step(deadline, rx).await?;
        }
    }

    /// Sleep until the status changes, a poll interval passes, or the deadline hits.
    async fn wait_step(
        &self,
        deadline: Instant,
        rx: &mut watch::Receiver<AttemptStatus>,
    ) -> std::result::Result<(), LifecycleError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(LifecycleError::ReadyTimeout {
                alias: self.alias.clone(),
                secs: self.settings.ready_timeout.as_secs(),
            });
        }
        let step = READY_POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(LifecycleError::Stopped),
            _ = tokio::time::timeout(step, rx.changed()) => Ok(()),
        }
    }

    fn connection_error(&self, reason: &str) -> LifecycleError {
        LifecycleError::Connection {
            alias: self.alias.clone(),
            reason: reason.to_string(),
        }
    }

    /// Close the live connection (if any) and move to `terminated`.
    pub async fn disconnect(&self) {
        let (client, generation) = {
            let mut inner = self.inner.lock().await;
            let status = self.status.borrow().clone();
            match status.state {
                ConnectionState::ShuttingDown => return,
                ConnectionState::Idle | ConnectionState::Terminated if inner.client.is_none() => {
                    return;
                },
                _ => {},
            }
            inner.live_signature = None;
            self.publish(ConnectionState::ShuttingDown, status.generation, None);
            (inner.client.take(), status.generation)
        };

        if let Some(client) = client {
            client.shutdown().await;
        }

        let _inner = self.inner.lock().await;
        self.publish(ConnectionState::Terminated, generation, None);
        info!(alias = %self.alias, "upstream disconnected");
    }

    /// Apply a new descriptor. Returns `true` when the identity signature
    /// changed and the live connection was torn down.
    pub async fn update(&self, descriptor: UpstreamDescriptor) -> bool {
        let changed = {
            let mut inner = self.inner.lock().await;
            let changed =
                inner.descriptor.identity_signature() != descriptor.identity_signature();
            inner.descriptor = descriptor;
            changed
        };

        if changed {
            info!(alias = %self.alias, "upstream configuration changed, reconnecting on next use");
            self.disconnect().await;
        } else {
            debug!(alias = %self.alias, "upstream bookkeeping updated in place");
        }
        changed
    }

    /// True when the descriptor needs a token the resolver cannot provide yet.
    pub async fn credentials_pending(&self) -> bool {
        let descriptor = self.descriptor().await;
        descriptor.requires_auth
            && matches!(descriptor.connection, ConnectionParams::Remote { .. })
            && self
                .settings
                .credentials
                .resolve_token(&self.alias)
                .await
                .is_none()
    }

    async fn warm_eligible(&self) -> bool {
        self.descriptor().await.keep_warm && !self.credentials_pending().await
    }

    /// Connect in the background if the upstream is flagged keep-warm.
    ///
    /// Returns `true` when a warm-up task was spawned.
    pub async fn warm_up(self: &Arc<Self>) -> bool {
        if !self.descriptor().await.keep_warm {
            return false;
        }
        if self.credentials_pending().await {
            debug!(alias = %self.alias, "skipping warm-up, credentials pending");
            return false;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.connection().await {
                Ok(_) => debug!(alias = %this.alias, "upstream warmed up"),
                Err(LifecycleError::Stopped) => {},
                Err(e) => warn!(alias = %this.alias, error = %e, "upstream warm-up failed"),
            }
        });
        true
    }

    /// Tear down after a failed dispatch and, for keep-warm upstreams,
    /// reconnect in the background.
    pub async fn report_failure(self: &Arc<Self>) {
        self.disconnect().await;
        if self.warm_eligible().await {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.reconnect_loop().await;
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        for (attempt, delay) in self.settings.backoff.iter().enumerate() {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(*delay) => {},
            }
            if !self.warm_eligible().await {
                debug!(alias = %self.alias, "upstream no longer warm-eligible, stopping reconnect");
                return;
            }
            match self.connection().await {
                Ok(_) => {
                    #[cfg(feature = "metrics")]
                    counter!(upstream_metrics::RECONNECTS_TOTAL, "alias" => self.alias.clone())
                        .increment(1);
                    info!(alias = %self.alias, attempt = attempt + 1, "upstream reconnected");
                    return;
                },
                Err(LifecycleError::Stopped) => return,
                Err(e) => {
                    warn!(
                        alias = %self.alias,
                        attempt = attempt + 1,
                        error = %e,
                        "background reconnect failed"
                    );
                },
            }
        }
        warn!(alias = %self.alias, "giving up background reconnect");
    }
}

fn lifecycle_error(alias: &str, err: Error) -> LifecycleError {
    match err {
        Error::Lifecycle(inner) => inner,
        other => LifecycleError::Connection {
            alias: alias.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use {
        super::*,
        crate::{
            client::McpClientState,
            types::{McpToolDef, ToolsCallResult},
        },
    };

    /// Client that answers every call and records shutdowns.
    pub(crate) struct StubClient {
        pub alias: String,
        pub shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl McpClientTrait for StubClient {
        fn server_name(&self) -> &str {
            &self.alias
        }

        fn state(&self) -> McpClientState {
            McpClientState::Ready
        }

        async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
            Ok(vec![McpToolDef::named("echo")])
        }

        async fn call_tool(&self, _name: &str, _arguments: serde_json::Value) -> Result<ToolsCallResult> {
            Ok(ToolsCallResult::text("ok"))
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Counts attempts; optionally slow and optionally failing the first N.
    pub(crate) struct CountingConnector {
        pub attempts: AtomicUsize,
        pub shutdowns: Arc<AtomicUsize>,
        pub delay: Duration,
        pub fail_first: usize,
    }

    impl CountingConnector {
        pub(crate) fn new() -> Arc<Self> {
            Self::with(Duration::ZERO, 0)
        }

        pub(crate) fn with(delay: Duration, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                delay,
                fail_first,
            })
        }

        pub(crate) fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, descriptor: &UpstreamDescriptor) -> Result<Arc<dyn McpClientTrait>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.fail_first {
                return Err(LifecycleError::Connection {
                    alias: descriptor.alias.clone(),
                    reason: format!("scripted failure {n}"),
                }
                .into());
            }
            Ok(Arc::new(StubClient {
                alias: descriptor.alias.clone(),
                shutdowns: Arc::clone(&self.shutdowns),
            }))
        }
    }

    fn fast_settings() -> LifecycleSettings {
        LifecycleSettings {
            ready_timeout: Duration::from_secs(2),
            backoff: vec![Duration::from_millis(10), Duration::from_millis(10)],
            credentials: Arc::new(NoCredentials),
        }
    }

    fn lifecycle(
        descriptor: UpstreamDescriptor,
        connector: Arc<CountingConnector>,
    ) -> Arc<UpstreamLifecycle> {
        UpstreamLifecycle::new(descriptor, connector, fast_settings(), CancellationToken::new())
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn not_warm_never_connects_on_its_own() {
        let connector = CountingConnector::new();
        let lc = lifecycle(UpstreamDescriptor::local("a", "run"), connector.clone());
        assert!(!lc.warm_up().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.attempts(), 0);
        assert_eq!(lc.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_attempt() {
        let connector = CountingConnector::with(Duration::from_millis(100), 0);
        let lc = lifecycle(UpstreamDescriptor::local("a", "run"), connector.clone());

        let (a, b) = tokio::join!(lc.connection(), lc.connection());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(connector.attempts(), 1);
        assert_eq!(lc.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn failure_is_surfaced_and_next_request_retries() {
        let connector = CountingConnector::with(Duration::ZERO, 1);
        let lc = lifecycle(UpstreamDescriptor::local("a", "run"), connector.clone());

        let err = lc.connection().await.err().unwrap();
        assert!(matches!(err, LifecycleError::Connection { .. }));
        assert_eq!(lc.state(), ConnectionState::Idle);
        assert!(lc.last_failure().is_some());

        assert!(lc.connection().await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn ready_wait_is_bounded() {
        let connector = CountingConnector::with(Duration::from_secs(5), 0);
        let mut settings = fast_settings();
        settings.ready_timeout = Duration::from_millis(200);
        let lc = UpstreamLifecycle::new(
            UpstreamDescriptor::local("slow", "run"),
            connector,
            settings,
            CancellationToken::new(),
        );
        let err = lc.connection().await.err().unwrap();
        assert!(matches!(err, LifecycleError::ReadyTimeout { .. }));
        assert_eq!(lc.state(), ConnectionState::Initializing);
    }

    #[tokio::test]
    async fn unchanged_signature_keeps_connection() {
        let connector = CountingConnector::new();
        let desc = UpstreamDescriptor::local("a", "run");
        let lc = lifecycle(desc.clone(), connector.clone());
        lc.connection().await.unwrap();

        let mut bookkeeping = desc.with_keep_warm(true);
        bookkeeping.include_tools = vec!["echo".into()];
        assert!(!lc.update(bookkeeping).await);
        assert_eq!(lc.state(), ConnectionState::Ready);
        assert!(lc.descriptor().await.keep_warm);
        assert_eq!(connector.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn changed_signature_tears_down() {
        let connector = CountingConnector::new();
        let lc = lifecycle(UpstreamDescriptor::local("a", "run"), connector.clone());
        lc.connection().await.unwrap();
        assert!(lc.live_signature().await.is_some());

        assert!(lc.update(UpstreamDescriptor::local("a", "run-v2")).await);
        assert_eq!(lc.state(), ConnectionState::Terminated);
        assert_eq!(connector.shutdowns.load(Ordering::SeqCst), 1);
        assert!(lc.live_signature().await.is_none());

        lc.connection().await.unwrap();
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn disconnect_during_attempt_discards_the_result() {
        let connector = CountingConnector::with(Duration::from_millis(100), 0);
        let lc = lifecycle(UpstreamDescriptor::local("a", "run"), connector.clone());

        let waiter = {
            let lc = Arc::clone(&lc);
            tokio::spawn(async move { lc.connection().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        lc.disconnect().await;

        assert!(waiter.await.unwrap().is_err());
        let shutdowns = Arc::clone(&connector.shutdowns);
        wait_until(|| shutdowns.load(Ordering::SeqCst) == 1).await;
        assert_eq!(lc.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn failure_on_warm_upstream_reconnects_in_background() {
        let connector = CountingConnector::new();
        let lc = lifecycle(
            UpstreamDescriptor::local("warm", "run").with_keep_warm(true),
            connector.clone(),
        );
        lc.connection().await.unwrap();

        lc.report_failure().await;
        let lc2 = Arc::clone(&lc);
        wait_until(move || lc2.state() == ConnectionState::Ready).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn failure_on_cold_upstream_stays_down() {
        let connector = CountingConnector::new();
        let lc = lifecycle(UpstreamDescriptor::local("cold", "run"), connector.clone());
        lc.connection().await.unwrap();

        lc.report_failure().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lc.state(), ConnectionState::Terminated);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_backoff_is_exhausted() {
        let connector = CountingConnector::with(Duration::ZERO, usize::MAX);
        let lc = lifecycle(
            UpstreamDescriptor::local("flaky", "run").with_keep_warm(true),
            connector.clone(),
        );
        lc.report_failure().await;
        let lc2 = Arc::clone(&lc);
        wait_until(move || !lc2.is_reconnecting()).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn warm_up_skips_pending_credentials() {
        let connector = CountingConnector::new();
        let mut desc = UpstreamDescriptor::remote("linear", "https://example.invalid/mcp")
            .with_keep_warm(true);
        desc.requires_auth = true;
        let lc = lifecycle(desc, connector.clone());
        assert!(lc.credentials_pending().await);
        assert!(!lc.warm_up().await);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn cancelled_lifecycle_refuses_connections() {
        let connector = CountingConnector::new();
        let cancel = CancellationToken::new();
        let lc = UpstreamLifecycle::new(
            UpstreamDescriptor::local("a", "run"),
            connector,
            fast_settings(),
            cancel.clone(),
        );
        cancel.cancel();
        assert_eq!(lc.connection().await.err(), Some(LifecycleError::Stopped));
    }

    #[tokio::test]
    async fn process_connector_reports_missing_executable_as_configuration() {
        let connector = ProcessConnector::default();
        let desc = UpstreamDescriptor::local("ghost", "definitely-not-installed-xyz");
        let err = connector.connect(&desc).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn process_connector_rejects_empty_url() {
        let connector = ProcessConnector::default();
        let desc = UpstreamDescriptor::remote("r", "");
        let err = connector.connect(&desc).await.err().unwrap();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::Configuration { .. })
        ));
    }
}
