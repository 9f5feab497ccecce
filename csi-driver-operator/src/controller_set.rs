use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use csi_driver_operator_apis::{
    ClusterCSIDriver, ManagementState, OperatorCondition, OperatorSpec, OperatorStatus,
};
use futures::{FutureExt, StreamExt};
use kube::api::DynamicObject;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use tokio::{
    sync::Notify,
    task::JoinSet,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::OperatorError,
    events::EventRecorder,
    operator_state::OperatorStateAccessor,
    store::{ObjectCache, WatchKey},
    utils::metric_name,
};

/// Reason of conditions reporting that everything is fine.
pub(crate) const AS_EXPECTED: &'static str = "AsExpected";

const CONTROLLER_SET: &'static str = "controller_set";
const MIN_RESYNC: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncResult {
    Applied,
    NoChangeNeeded,
    Failed,
}

impl SyncResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResult::Applied => "applied",
            SyncResult::NoChangeNeeded => "no_change_needed",
            SyncResult::Failed => "failed",
        }
    }
}

/// What a single reconciliation did.
#[derive(Debug, Default)]
pub(crate) struct ReconcileOutcome {
    pub changed: bool,
    pub conditions: Vec<OperatorCondition>,
    pub error: Option<OperatorError>,
}

impl ReconcileOutcome {
    pub fn failed(error: OperatorError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// Outcome of a reconciliation returning whether anything changed.
    pub fn from_result(result: Result<bool, OperatorError>) -> Self {
        match result {
            Ok(changed) => Self {
                changed,
                ..Default::default()
            },
            Err(e) => Self::failed(e),
        }
    }

    pub fn with_condition(mut self, condition: OperatorCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn result(&self) -> SyncResult {
        match (&self.error, self.changed) {
            (Some(_), _) => SyncResult::Failed,
            (None, true) => SyncResult::Applied,
            (None, false) => SyncResult::NoChangeNeeded,
        }
    }
}

/// The operator instance a reconciliation works on.
pub(crate) struct SyncContext {
    pub instance: Arc<DynamicObject>,
    pub driver: ClusterCSIDriver,
}

impl SyncContext {
    pub fn spec(&self) -> &OperatorSpec {
        &self.driver.spec
    }
}

/// An independent reconciliation unit of a [`ControllerSet`].
#[async_trait]
pub(crate) trait Controller: Send + Sync {
    /// Unique name, also used as field manager and condition prefix.
    fn name(&self) -> &str;

    /// Cached objects whose changes trigger a reconciliation, besides the
    /// operator instance itself.
    fn watches(&self) -> Vec<WatchKey> {
        vec![]
    }

    /// Whether to pause while the operator is `Unmanaged` or `Removed`.
    fn honors_management_state(&self) -> bool {
        true
    }

    async fn sync(&self, ctx: &SyncContext) -> ReconcileOutcome;
}

struct Metrics {
    sync_count: Counter<u64>,
    sync_duration: Histogram<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter: Meter = global::meter(CONTROLLER_SET);
        let sync_count = meter
            .u64_counter(metric_name("controller_sync_count"))
            .with_description("Count of controller reconciliations")
            .build();
        let sync_duration = meter
            .u64_histogram(metric_name("controller_sync_duration_ms"))
            .with_description("Controller reconciliation duration in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            sync_count,
            sync_duration,
        }
    }

    fn record(&self, controller: &str, result: SyncResult, elapsed: Duration) {
        let attributes = [
            KeyValue::new("controller", controller.to_string()),
            KeyValue::new("result", result.as_str()),
        ];
        self.sync_count.add(1, &attributes);
        self.sync_duration
            .record(elapsed.as_millis() as u64, &attributes);
    }
}

/// Ordered collection of controllers sharing one operator instance and one cache.
pub(crate) struct ControllerSet {
    state: Arc<OperatorStateAccessor>,
    cache: Arc<dyn ObjectCache>,
    recorder: Arc<dyn EventRecorder>,
    resync: Duration,
    controllers: Vec<Arc<dyn Controller>>,
    metrics: Metrics,
}

pub(crate) struct ControllerSetHandle {
    tasks: JoinSet<()>,
}

impl ControllerSetHandle {
    /// Wait for all workers, which only stop once the token is cancelled.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("controller task failed: {}", e);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ControllerSet {
    pub fn new(
        state: Arc<OperatorStateAccessor>,
        cache: Arc<dyn ObjectCache>,
        recorder: Arc<dyn EventRecorder>,
        resync: Duration,
    ) -> Self {
        Self {
            state,
            cache,
            recorder,
            resync: resync.max(MIN_RESYNC),
            controllers: vec![],
            metrics: Metrics::new(),
        }
    }

    pub fn register(&mut self, controller: Arc<dyn Controller>) -> Result<(), OperatorError> {
        if self.controllers.iter().any(|c| c.name() == controller.name()) {
            return Err(OperatorError::DuplicateName(format!(
                "controller {} is already registered",
                controller.name()
            )));
        }
        self.controllers.push(controller);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    /// Reconcile once with `controller` and report the outcome.
    pub async fn tick(&self, controller: &dyn Controller) -> SyncResult {
        let start = Instant::now();
        let result = self.reconcile(controller).await;
        self.metrics.record(controller.name(), result, start.elapsed());
        result
    }

    async fn reconcile(&self, controller: &dyn Controller) -> SyncResult {
        let name = controller.name();
        let instance = match self.state.get().await {
            Ok(instance) => instance,
            Err(e) => {
                warn!("{}: failed to read {}: {}", name, self.state.key(), e);
                return SyncResult::Failed;
            }
        };
        let driver = match self.state.convert(&instance) {
            Ok(driver) => driver,
            Err(e) => {
                error!("{}: {}", name, e);
                return SyncResult::Failed;
            }
        };
        let management_state = driver.spec.management_state();
        if controller.honors_management_state()
            && matches!(
                management_state,
                ManagementState::Unmanaged | ManagementState::Removed
            )
        {
            debug!("{}: skipped, operator is {:?}", name, management_state);
            return SyncResult::NoChangeNeeded;
        }
        let ctx = SyncContext { instance, driver };
        let outcome = match AssertUnwindSafe(controller.sync(&ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => ReconcileOutcome::failed(OperatorError::Panic(format!(
                "{} panicked: {}",
                name,
                panic_message(panic.as_ref())
            ))),
        };
        let mut result = outcome.result();
        let mut conditions = outcome.conditions;
        let degraded = format!("{}Degraded", name);
        conditions.push(match &outcome.error {
            Some(e) => {
                warn!("{} failed: {}", name, e);
                self.recorder
                    .warning(e.reason(), format!("{}: {}", name, e));
                OperatorCondition::new(&degraded, Some(true), e.reason(), e.to_string())
            }
            None => {
                if outcome.changed {
                    info!("{} applied changes", name);
                }
                OperatorCondition::new(&degraded, Some(false), AS_EXPECTED, String::new())
            }
        });
        let patch = OperatorStatus {
            conditions: Some(conditions),
            ..Default::default()
        };
        if let Err(e) = self
            .state
            .update_status_with_retry(&ctx.instance, patch, name)
            .await
        {
            error!("{}: failed to update status: {}", name, e);
            result = SyncResult::Failed;
        }
        result
    }

    /// Start every controller, returning immediately. Each controller gets
    /// `workers` workers, woken by changes of its watches and by the resync timer.
    pub fn run(self, token: CancellationToken, workers: usize) -> ControllerSetHandle {
        let set = Arc::new(self);
        let mut tasks = JoinSet::new();
        for controller in set.controllers.iter().cloned() {
            let notify = Arc::new(Notify::new());
            let mut watches = vec![set.state.watch_key()];
            for watch in controller.watches() {
                if !watches.contains(&watch) {
                    watches.push(watch);
                }
            }
            for watch in watches {
                let mut changes = set.cache.subscribe(&watch);
                let notify = notify.clone();
                let token = token.clone();
                tasks.spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            change = changes.next() => match change {
                                Some(()) => notify.notify_one(),
                                None => break,
                            },
                        }
                    }
                });
            }
            {
                let notify = notify.clone();
                let token = token.clone();
                let resync = set.resync;
                tasks.spawn(async move {
                    // first tick is immediate
                    let mut interval = tokio::time::interval(resync);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = interval.tick() => notify.notify_one(),
                        }
                    }
                });
            }
            for worker in 0..workers.max(1) {
                let set = set.clone();
                let controller = controller.clone();
                let notify = notify.clone();
                let token = token.clone();
                tasks.spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = notify.notified() => (),
                        }
                        tokio::select! {
                            _ = token.cancelled() => break,
                            result = set.tick(controller.as_ref()) => {
                                trace!("{} worker {}: {:?}", controller.name(), worker, result)
                            },
                        }
                    }
                    debug!("{} worker {} stopped", controller.name(), worker);
                });
            }
            info!("started controller {}", controller.name());
        }
        ControllerSetHandle { tasks }
    }
}
