//! Interception hooks.
//!
//! Domain services subscribe to message-type ranges and are called for every
//! matching frame the proxy relays, either before the frame is forwarded or
//! after. Hooks observe; they cannot alter or veto a frame, and a failing,
//! slow or panicking hook never stalls the relay beyond its timeout.
//!
//! The hook table is copy-on-write: readers take a snapshot per frame, writers
//! publish a new table. Registration never blocks relay loops.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ucrelay_core::{ConnectionId, Frame, MessageType, ProxyId, ServerId};

/// Inclusive range of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRange {
    pub start: u16,
    pub end: u16,
}

impl TypeRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn single(message_type: u16) -> Self {
        Self::new(message_type, message_type)
    }

    pub fn contains(&self, message_type: MessageType) -> bool {
        (self.start..=self.end).contains(&message_type.0)
    }
}

impl fmt::Display for TypeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

fn parse_type(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid message type: {s:?}"))
}

/// Accepts `5`, `0x0100`, `5-10` and `0x0100-0x01ff`.
impl FromStr for TypeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((start, end)) => Ok(Self::new(parse_type(start)?, parse_type(end)?)),
            None => Ok(Self::single(parse_type(s)?)),
        }
    }
}

/// When a hook runs relative to forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    /// Awaited (bounded by the hook timeout) before the frame is forwarded.
    Before,
    /// Spawned after the frame is forwarded.
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// What a hook sees for one frame.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub proxy_id: ProxyId,
    pub connection_id: ConnectionId,
    pub direction: Direction,
    /// Server the originating connection belongs to.
    pub server_id: ServerId,
    /// False when the target is not a bound peer and hooks are the only consumers.
    pub delivered: bool,
    pub frame: Frame,
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),
}

/// A domain service attached to the proxy.
#[async_trait]
pub trait InterceptHook: Send + Sync {
    /// Unique name; registering a second hook with the same name replaces it.
    fn name(&self) -> &str;

    fn message_types(&self) -> Vec<TypeRange>;

    /// `None` uses the registry default (`[hooks] order`).
    fn phase(&self) -> Option<HookPhase> {
        None
    }

    /// Higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// `None` uses the registry default (`[hooks] timeout_ms`).
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn on_message(&self, ctx: &HookContext) -> Result<(), HookError>;
}

struct Registered {
    hook: Arc<dyn InterceptHook>,
    name: String,
    ranges: Vec<TypeRange>,
    phase: HookPhase,
    priority: i32,
    timeout: Duration,
    seq: u64,
}

impl Registered {
    fn matches(&self, message_type: MessageType) -> bool {
        self.ranges.iter().any(|r| r.contains(message_type))
    }
}

/// Hooks matching one frame, in execution order.
#[derive(Clone, Default)]
pub struct HookPlan {
    before: Vec<Arc<Registered>>,
    after: Vec<Arc<Registered>>,
}

impl HookPlan {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }
}

/// Table of registered hooks, ordered by priority then registration order.
pub struct HookRegistry {
    table: ArcSwap<Vec<Arc<Registered>>>,
    default_phase: HookPhase,
    default_timeout: Duration,
    next_seq: AtomicU64,
}

impl HookRegistry {
    pub fn new(default_phase: HookPhase, default_timeout: Duration) -> Self {
        Self {
            table: ArcSwap::from_pointee(Vec::new()),
            default_phase,
            default_timeout,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn register(&self, hook: Arc<dyn InterceptHook>) {
        let entry = Arc::new(Registered {
            name: hook.name().to_string(),
            ranges: hook.message_types(),
            phase: hook.phase().unwrap_or(self.default_phase),
            priority: hook.priority(),
            timeout: hook.timeout().unwrap_or(self.default_timeout),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            hook,
        });
        info!(
            hook = %entry.name,
            phase = ?entry.phase,
            priority = entry.priority,
            types = %format_ranges(&entry.ranges),
            "hook registered"
        );

        self.table.rcu(|current| {
            let mut next: Vec<Arc<Registered>> = current
                .iter()
                .filter(|h| h.name != entry.name)
                .cloned()
                .collect();
            next.push(entry.clone());
            next.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            next
        });
    }

    /// Returns whether a hook with that name was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let previous = self.table.rcu(|current| {
            current
                .iter()
                .filter(|h| h.name != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        let removed = previous.iter().any(|h| h.name == name);
        if removed {
            info!(hook = %name, "hook unregistered");
        }
        removed
    }

    /// Registered hook names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.table.load().iter().map(|h| h.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Hooks to run for a frame of this type.
    pub fn resolve(&self, message_type: MessageType) -> HookPlan {
        let table = self.table.load();
        let mut plan = HookPlan::default();
        for entry in table.iter().filter(|h| h.matches(message_type)) {
            match entry.phase {
                HookPhase::Before => plan.before.push(entry.clone()),
                HookPhase::After => plan.after.push(entry.clone()),
            }
        }
        plan
    }
}

fn format_ranges(ranges: &[TypeRange]) -> String {
    ranges
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn log_outcome(name: &str, outcome: Result<Result<(), HookError>, tokio::task::JoinError>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(hook = %name, error = %e, "hook failed"),
        Err(e) if e.is_cancelled() => debug!(hook = %name, "hook cancelled"),
        Err(e) => warn!(hook = %name, error = %e, "hook panicked"),
    }
}

/// Runs hooks for one connection.
///
/// Before-hooks are awaited one at a time, each in its own task so a panic
/// stays contained. After-hooks get one task per hook on the connection's
/// [`JoinSet`]; when the connection is cancelled they get `grace` to finish
/// before being aborted.
pub struct HookDispatcher {
    registry: Arc<HookRegistry>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    grace: Duration,
}

impl HookDispatcher {
    pub fn new(registry: Arc<HookRegistry>, cancel: CancellationToken, grace: Duration) -> Self {
        Self {
            registry,
            tasks: JoinSet::new(),
            cancel,
            grace,
        }
    }

    pub fn resolve(&self, message_type: MessageType) -> HookPlan {
        self.registry.resolve(message_type)
    }

    pub async fn run_before(&self, plan: &HookPlan, ctx: &Arc<HookContext>) {
        for entry in &plan.before {
            if self.cancel.is_cancelled() {
                return;
            }
            let hook = entry.hook.clone();
            let hook_ctx = ctx.clone();
            let mut handle = tokio::spawn(async move { hook.on_message(&hook_ctx).await });

            let joined = tokio::select! {
                res = tokio::time::timeout(entry.timeout, &mut handle) => res,
                _ = self.cancel.cancelled() => {
                    tokio::time::timeout(self.grace.min(entry.timeout), &mut handle).await
                }
            };
            match joined {
                Ok(outcome) => log_outcome(&entry.name, outcome),
                Err(_) => {
                    handle.abort();
                    warn!(
                        hook = %entry.name,
                        timeout_ms = entry.timeout.as_millis() as u64,
                        "hook timed out"
                    );
                }
            }
        }
    }

    pub fn spawn_after(&mut self, plan: &HookPlan, ctx: Arc<HookContext>) {
        if plan.after.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        self.reap();
        for entry in plan.after.iter().cloned() {
            let ctx = ctx.clone();
            self.tasks.spawn(async move {
                match tokio::time::timeout(entry.timeout, entry.hook.on_message(&ctx)).await {
                    Ok(outcome) => log_outcome(&entry.name, Ok(outcome)),
                    Err(_) => warn!(
                        hook = %entry.name,
                        timeout_ms = entry.timeout.as_millis() as u64,
                        "hook timed out"
                    ),
                }
            });
        }
    }

    /// After-hook tasks still running.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    fn reap(&mut self) {
        while let Some(res) = self.tasks.try_join_next() {
            if let Err(e) = res {
                if e.is_panic() {
                    warn!(error = %e, "after-relay hook panicked");
                }
            }
        }
    }

    /// Give in-flight after-hooks `grace` to finish, then abort them.
    pub async fn shutdown(mut self) {
        let grace = self.grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = self.tasks.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        warn!(error = %e, "after-relay hook panicked");
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(aborted = self.tasks.len(), "aborting hooks after grace period");
            self.tasks.abort_all();
        }
    }
}

/// Logs every matched frame at `info`.
pub struct TrafficLog {
    ranges: Vec<TypeRange>,
}

impl TrafficLog {
    pub fn new(ranges: Vec<TypeRange>) -> Self {
        Self { ranges }
    }
}

#[async_trait]
impl InterceptHook for TrafficLog {
    fn name(&self) -> &str {
        "traffic-log"
    }

    fn message_types(&self) -> Vec<TypeRange> {
        self.ranges.clone()
    }

    fn phase(&self) -> Option<HookPhase> {
        Some(HookPhase::After)
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    async fn on_message(&self, ctx: &HookContext) -> Result<(), HookError> {
        info!(
            conn_id = %ctx.connection_id,
            server_id = %ctx.server_id,
            direction = ?ctx.direction,
            sender = %ctx.frame.sender(),
            target = %ctx.frame.target(),
            message_type = %ctx.frame.message_type(),
            payload_len = ctx.frame.header().payload_len,
            delivered = ctx.delivered,
            "frame"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;
    use ucrelay_core::{Envelope, DEFAULT_MAX_PAYLOAD};

    struct Recorder {
        name: String,
        ranges: Vec<TypeRange>,
        phase: Option<HookPhase>,
        priority: i32,
        delay: Duration,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
        calls: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.into(),
                ranges: vec![TypeRange::single(5)],
                phase: None,
                priority: 0,
                delay: Duration::ZERO,
                fail: false,
                log,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl InterceptHook for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        fn message_types(&self) -> Vec<TypeRange> {
            self.ranges.clone()
        }
        fn phase(&self) -> Option<HookPhase> {
            self.phase
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn on_message(&self, _ctx: &HookContext) -> Result<(), HookError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().await.push(self.name.clone());
            if self.fail {
                return Err(HookError::Failed("boom".into()));
            }
            Ok(())
        }
    }

    struct Panicker;

    #[async_trait]
    impl InterceptHook for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }
        fn message_types(&self) -> Vec<TypeRange> {
            vec![TypeRange::single(5)]
        }
        async fn on_message(&self, _ctx: &HookContext) -> Result<(), HookError> {
            panic!("hook bug");
        }
    }

    fn context(message_type: u16) -> Arc<HookContext> {
        let raw = Envelope::new("phone-1", "srv-a", message_type, &b"ping"[..])
            .encode()
            .unwrap();
        Arc::new(HookContext {
            proxy_id: ProxyId::new("p1").unwrap(),
            connection_id: ConnectionId(1),
            direction: Direction::ClientToServer,
            server_id: ServerId::new("srv-a").unwrap(),
            delivered: true,
            frame: Frame::parse_exact(raw, DEFAULT_MAX_PAYLOAD).unwrap(),
        })
    }

    fn registry() -> Arc<HookRegistry> {
        Arc::new(HookRegistry::new(HookPhase::Before, Duration::from_secs(1)))
    }

    #[test]
    fn type_ranges_parse() {
        assert_eq!("5".parse::<TypeRange>().unwrap(), TypeRange::single(5));
        assert_eq!(
            "0x0100-0x01ff".parse::<TypeRange>().unwrap(),
            TypeRange::new(0x100, 0x1ff)
        );
        assert_eq!("10-3".parse::<TypeRange>().unwrap(), TypeRange::new(3, 10));
        assert!("ping".parse::<TypeRange>().is_err());
        assert!("70000".parse::<TypeRange>().is_err());

        let r = TypeRange::new(10, 20);
        assert!(r.contains(MessageType(10)));
        assert!(r.contains(MessageType(20)));
        assert!(!r.contains(MessageType(21)));
    }

    #[test]
    fn resolve_orders_by_priority_then_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reg = registry();

        reg.register(Arc::new(Recorder::new("first", log.clone())));
        let mut high = Recorder::new("high", log.clone());
        high.priority = 10;
        reg.register(Arc::new(high));
        reg.register(Arc::new(Recorder::new("second", log.clone())));
        let mut other_type = Recorder::new("other", log.clone());
        other_type.ranges = vec![TypeRange::single(6)];
        reg.register(Arc::new(other_type));

        assert_eq!(reg.names(), vec!["high", "first", "second", "other"]);
        let plan = reg.resolve(MessageType(5));
        let names: Vec<_> = plan.before.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["high", "first", "second"]);
        assert!(reg.resolve(MessageType(7)).is_empty());
    }

    #[test]
    fn register_replaces_by_name_and_unregister_removes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reg = registry();
        reg.register(Arc::new(Recorder::new("audit", log.clone())));
        let mut replacement = Recorder::new("audit", log.clone());
        replacement.phase = Some(HookPhase::After);
        reg.register(Arc::new(replacement));

        assert_eq!(reg.len(), 1);
        let plan = reg.resolve(MessageType(5));
        assert!(plan.before.is_empty());
        assert_eq!(plan.after.len(), 1);

        assert!(reg.unregister("audit"));
        assert!(!reg.unregister("audit"));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn failing_hook_does_not_stop_later_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reg = registry();
        let mut bad = Recorder::new("bad", log.clone());
        bad.fail = true;
        bad.priority = 1;
        reg.register(Arc::new(bad));
        reg.register(Arc::new(Panicker));
        reg.register(Arc::new(Recorder::new("good", log.clone())));

        let dispatcher = HookDispatcher::new(reg, CancellationToken::new(), Duration::from_millis(100));
        let plan = dispatcher.resolve(MessageType(5));
        dispatcher.run_before(&plan, &context(5)).await;

        assert_eq!(*log.lock().await, vec!["bad", "good"]);
    }

    #[tokio::test]
    async fn panicking_after_hook_does_not_skip_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reg = Arc::new(HookRegistry::new(HookPhase::After, Duration::from_secs(1)));
        reg.register(Arc::new(Panicker));
        let mut bad = Recorder::new("bad", log.clone());
        bad.fail = true;
        reg.register(Arc::new(bad));
        let good = Recorder::new("good", log.clone());
        let calls = good.calls.clone();
        reg.register(Arc::new(good));

        let cancel = CancellationToken::new();
        let mut dispatcher = HookDispatcher::new(reg, cancel.clone(), Duration::from_secs(1));
        let plan = dispatcher.resolve(MessageType(5));
        assert_eq!(plan.after.len(), 3);
        dispatcher.spawn_after(&plan, context(5));
        assert_eq!(dispatcher.pending(), 3);

        cancel.cancel();
        dispatcher.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let mut seen = log.lock().await.clone();
        seen.sort();
        assert_eq!(seen, vec!["bad", "good"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_before_hook_is_bounded_by_timeout() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reg = Arc::new(HookRegistry::new(HookPhase::Before, Duration::from_millis(50)));
        let mut slow = Recorder::new("slow", log.clone());
        slow.delay = Duration::from_secs(60);
        let calls = slow.calls.clone();
        reg.register(Arc::new(slow));

        let dispatcher = HookDispatcher::new(reg, CancellationToken::new(), Duration::from_millis(100));
        let plan = dispatcher.resolve(MessageType(5));
        let started = tokio::time::Instant::now();
        dispatcher.run_before(&plan, &context(5)).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn after_hooks_run_in_background() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reg = registry();
        let mut after = Recorder::new("after", log.clone());
        after.phase = Some(HookPhase::After);
        let calls = after.calls.clone();
        reg.register(Arc::new(after));

        let cancel = CancellationToken::new();
        let mut dispatcher = HookDispatcher::new(reg, cancel.clone(), Duration::from_secs(1));
        let plan = dispatcher.resolve(MessageType(5));
        dispatcher.spawn_after(&plan, context(5));
        dispatcher.spawn_after(&plan, context(5));

        cancel.cancel();
        dispatcher.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_after_hooks_are_aborted_after_grace() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reg = Arc::new(HookRegistry::new(HookPhase::After, Duration::from_secs(3600)));
        let mut stuck = Recorder::new("stuck", log.clone());
        stuck.delay = Duration::from_secs(600);
        let calls = stuck.calls.clone();
        reg.register(Arc::new(stuck));

        let cancel = CancellationToken::new();
        let mut dispatcher = HookDispatcher::new(reg, cancel.clone(), Duration::from_millis(200));
        let plan = dispatcher.resolve(MessageType(5));
        dispatcher.spawn_after(&plan, context(5));
        assert_eq!(dispatcher.pending(), 1);

        cancel.cancel();
        let started = tokio::time::Instant::now();
        dispatcher.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Nothing new is spawned once cancelled.
        let reg = registry();
        let mut dispatcher = HookDispatcher::new(reg, cancel, Duration::from_millis(200));
        dispatcher.spawn_after(&plan, context(5));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn traffic_log_matches_configured_types() {
        let reg = registry();
        reg.register(Arc::new(TrafficLog::new(vec!["1-9".parse().unwrap()])));
        let plan = reg.resolve(MessageType(5));
        assert_eq!(plan.after.len(), 1);
        assert!(plan.before.is_empty());
        assert!(reg.resolve(MessageType(10)).is_empty());

        let hook = TrafficLog::new(Vec::new());
        assert!(hook.on_message(&context(5)).await.is_ok());
    }
}
