//! The top-level scheduling loop.
//!
//! `schedule_one` drives a single task through the pipeline:
//! schedule → reserve → permit → assume → (async) prebind/bind/postbind.
//! The loop assumes the placement in the cache and immediately moves on
//! to the next task; a background worker finishes the binding and rolls
//! the cache back if it fails.
//!
//! The scheduler is also the cluster event sink: node and task events
//! mutate the cache and wake parked tasks whose rejecting plugins
//! subscribed to the event.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use berth_cache::Cache;
use berth_core::{ActionType, ClusterEvent, EventResource, Node, Task};
use berth_framework::{
    CancelToken, CycleState, Framework, PluginSet, QueuedTaskInfo, Recorder, SchedulerProfile,
    Status, TaskNominator,
};
use berth_plugins::{balanced_allocation, default_binder, inter_task_affinity, priority_sort};

use crate::error::{Diagnosis, FitError, SchedulerError, DEFAULT_REASON_TRUNCATION};
use crate::extender::Extender;
use crate::generic::GenericScheduler;
use crate::metrics::SchedulingMetrics;
use crate::queue::SchedulingQueue;

/// Profile wiring up the built-in plugins: priority queue ordering,
/// inter-task affinity filtering, balanced-allocation scoring, and the
/// default binder. Pairs with `berth_plugins::default_registry`.
pub fn default_profile(scheduler_name: &str) -> SchedulerProfile {
    let mut profile = SchedulerProfile::new(scheduler_name);
    profile.plugins.queue_sort = PluginSet::enable(&[priority_sort::NAME]);
    profile.plugins.pre_filter = PluginSet::enable(&[inter_task_affinity::NAME]);
    profile.plugins.filter = PluginSet::enable(&[inter_task_affinity::NAME]);
    profile.plugins.score = PluginSet::enable(&[balanced_allocation::NAME]);
    profile.plugins.bind = PluginSet::enable(&[default_binder::NAME]);
    profile
}

/// The control loop matching pending tasks to nodes.
pub struct Scheduler {
    cache: Arc<Cache>,
    queue: Arc<SchedulingQueue>,
    profiles: HashMap<String, Arc<Framework>>,
    generic: Arc<GenericScheduler>,
    recorder: Arc<dyn Recorder>,
    metrics: Arc<SchedulingMetrics>,
    cancel: CancelToken,
}

impl Scheduler {
    /// Build the scheduler. Profile names must be unique.
    pub fn new(
        cache: Arc<Cache>,
        queue: Arc<SchedulingQueue>,
        frameworks: Vec<Arc<Framework>>,
        generic: Arc<GenericScheduler>,
        recorder: Arc<dyn Recorder>,
        metrics: Arc<SchedulingMetrics>,
    ) -> Result<Self, SchedulerError> {
        let mut profiles = HashMap::new();
        for framework in frameworks {
            let name = framework.profile_name().to_string();
            if profiles.insert(name.clone(), framework).is_some() {
                return Err(SchedulerError::Internal(anyhow::anyhow!(
                    "duplicate profile with scheduler name {name}"
                )));
            }
        }
        Ok(Self {
            cache,
            queue,
            profiles,
            generic,
            recorder,
            metrics,
            cancel: CancelToken::new(),
        })
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn metrics(&self) -> &Arc<SchedulingMetrics> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    /// Pop and schedule tasks until the cancel token fires.
    pub async fn run(&self) {
        info!("scheduling loop started");
        loop {
            let queued = tokio::select! {
                _ = self.cancel.cancelled() => break,
                queued = self.queue.pop() => queued,
            };
            self.schedule_one(queued).await;
        }
        info!("scheduling loop stopped");
    }

    /// One full scheduling attempt for one task.
    pub async fn schedule_one(&self, queued: QueuedTaskInfo) {
        let task = Arc::clone(&queued.task);
        if task.is_terminating() {
            debug!(task = %task.uid, "skipping task marked for deletion");
            return;
        }
        let Some(framework) = self.profiles.get(&task.scheduler_name).cloned() else {
            error!(
                task = %task.uid,
                profile = %task.scheduler_name,
                "no profile for task; dropping"
            );
            self.recorder.eventf(
                &task,
                "FailedScheduling",
                &format!("no profile registered for scheduler name {}", task.scheduler_name),
            );
            return;
        };

        let cycle_start = Instant::now();
        let ctx = CancelToken::new();
        let state = CycleState::new();

        let result = match self.generic.schedule(&ctx, &framework, &state, &task) {
            Ok(result) => result,
            Err(failure) => {
                handle_scheduling_failure(
                    &self.queue,
                    self.recorder.as_ref(),
                    &self.metrics,
                    &framework,
                    &ctx,
                    &state,
                    queued,
                    failure,
                    true,
                );
                return;
            }
        };
        let node = result.suggested_host.clone();
        debug!(
            task = %task.uid,
            node = %node,
            evaluated = result.evaluated_nodes,
            feasible = result.feasible_nodes,
            "scheduling decision made"
        );

        // Reserve; the framework unwinds partial reservations itself.
        let status = framework.run_reserve_plugins(&ctx, &state, &task, &node);
        if !status.is_success() {
            handle_scheduling_failure(
                &self.queue,
                self.recorder.as_ref(),
                &self.metrics,
                &framework,
                &ctx,
                &state,
                queued,
                SchedulerError::Internal(anyhow::anyhow!(
                    "running reserve plugins: {}",
                    status.message()
                )),
                false,
            );
            return;
        }

        // Permit; Wait parks the task for the bind worker to await.
        let status = framework.run_permit_plugins(&ctx, &state, &task, &node);
        if !status.is_success() && !status.is_wait() {
            framework.run_unreserve_plugins(&ctx, &state, &task, &node);
            let failure = if status.is_unschedulable() {
                unschedulable_on_node(&task, &node, &status)
            } else {
                SchedulerError::Internal(anyhow::anyhow!(
                    "running permit plugins: {}",
                    status.message()
                ))
            };
            handle_scheduling_failure(
                &self.queue,
                self.recorder.as_ref(),
                &self.metrics,
                &framework,
                &ctx,
                &state,
                queued,
                failure,
                false,
            );
            return;
        }

        // Assume: the cache sees the placement before binding confirms,
        // so the next cycle schedules against it.
        let mut assumed = (*task).clone();
        assumed.node_name = Some(node.clone());
        let assumed = Arc::new(assumed);
        if let Err(cache_error) = self.cache.assume(Arc::clone(&assumed)) {
            framework.run_unreserve_plugins(&ctx, &state, &task, &node);
            handle_scheduling_failure(
                &self.queue,
                self.recorder.as_ref(),
                &self.metrics,
                &framework,
                &ctx,
                &state,
                queued,
                SchedulerError::Internal(anyhow::anyhow!("assuming task: {cache_error}")),
                false,
            );
            return;
        }
        self.queue.delete_nominated_task(&task);

        // Bind in the background; the loop is free for the next task.
        let worker = BindWorker {
            cache: Arc::clone(&self.cache),
            queue: Arc::clone(&self.queue),
            recorder: Arc::clone(&self.recorder),
            metrics: Arc::clone(&self.metrics),
            framework,
            extenders: self.generic.extenders().to_vec(),
        };
        tokio::spawn(async move {
            worker
                .bind_and_finish(ctx, state, queued, assumed, node, cycle_start)
                .await;
        });
    }

    // ── Cluster event handlers ─────────────────────────────────────

    pub fn on_node_added(&self, node: Node) {
        self.cache.add_node(node);
        self.broadcast(ClusterEvent::new(EventResource::Node, ActionType::Add));
    }

    pub fn on_node_updated(&self, node: Node) {
        self.cache.update_node(node);
        self.broadcast(ClusterEvent::new(EventResource::Node, ActionType::Update));
    }

    pub fn on_node_removed(&self, name: &str) {
        self.cache.remove_node(name);
        self.broadcast(ClusterEvent::new(EventResource::Node, ActionType::Delete));
    }

    /// A task appeared. Placed tasks go to the cache (confirming an
    /// assumed copy if present); pending ones enter the queue.
    pub fn on_task_added(&self, task: Arc<Task>) {
        if task.node_name.is_some() {
            if let Err(cache_error) = self.cache.add_task(Arc::clone(&task)) {
                warn!(task = %task.uid, error = %cache_error, "adding task to cache");
            }
        } else {
            self.queue.add(task);
        }
        self.broadcast(ClusterEvent::new(EventResource::Task, ActionType::Add));
    }

    pub fn on_task_updated(&self, old: &Task, new: Arc<Task>) {
        if new.node_name.is_some() {
            if let Err(cache_error) = self.cache.update_task(old, Arc::clone(&new)) {
                warn!(task = %new.uid, error = %cache_error, "updating task in cache");
            }
        } else {
            self.queue.update(old, new);
        }
        self.broadcast(ClusterEvent::new(EventResource::Task, ActionType::Update));
    }

    pub fn on_task_removed(&self, task: &Task) {
        if task.node_name.is_some() {
            self.cache.remove_task(task);
        } else {
            self.queue.delete(task);
        }
        self.queue.delete_nominated_task(task);
        self.broadcast(ClusterEvent::new(EventResource::Task, ActionType::Delete));
    }

    /// Wake unschedulable tasks whose rejecting plugins subscribed to
    /// the event. Tasks with no recorded rejecting plugin wake on
    /// everything.
    fn broadcast(&self, event: ClusterEvent) {
        let moved = self.queue.move_on_event(|info| {
            if info.unschedulable_plugins.is_empty() {
                return true;
            }
            let Some(framework) = self.profiles.get(&info.task.scheduler_name) else {
                return true;
            };
            let woken = framework.plugins_for_event(&event);
            info.unschedulable_plugins
                .iter()
                .any(|plugin| woken.contains(plugin))
        });
        if moved > 0 {
            debug!(?event, moved, "cluster event woke parked tasks");
        }
    }
}

/// Everything the asynchronous binding path needs, detached from the
/// main loop's lifetime.
struct BindWorker {
    cache: Arc<Cache>,
    queue: Arc<SchedulingQueue>,
    recorder: Arc<dyn Recorder>,
    metrics: Arc<SchedulingMetrics>,
    framework: Arc<Framework>,
    extenders: Vec<Arc<dyn Extender>>,
}

impl BindWorker {
    async fn bind_and_finish(
        &self,
        ctx: CancelToken,
        state: CycleState,
        queued: QueuedTaskInfo,
        assumed: Arc<Task>,
        node: String,
        cycle_start: Instant,
    ) {
        let waited = self.framework.waiting_tasks().get(&assumed.uid).is_some();
        let wait_start = Instant::now();
        let status = self.framework.wait_on_permit(&ctx, &assumed).await;
        if waited {
            let label = permit_result_label(&status);
            self.metrics
                .observe_permit_wait(label, wait_start.elapsed());
        }
        if !status.is_success() {
            let failure = if status.is_unschedulable() {
                unschedulable_on_node(&assumed, &node, &status)
            } else {
                SchedulerError::Internal(anyhow::anyhow!(
                    "waiting on permit: {}",
                    status.message()
                ))
            };
            self.roll_back(&ctx, &state, queued, &assumed, &node, failure);
            return;
        }

        let status = self
            .framework
            .run_pre_bind_plugins(&ctx, &state, &assumed, &node);
        if !status.is_success() {
            self.roll_back(
                &ctx,
                &state,
                queued,
                &assumed,
                &node,
                SchedulerError::Internal(anyhow::anyhow!(
                    "running prebind plugins: {}",
                    status.message()
                )),
            );
            return;
        }

        let status = self.bind(&ctx, &state, &assumed, &node);
        if !status.is_success() {
            self.roll_back(
                &ctx,
                &state,
                queued,
                &assumed,
                &node,
                SchedulerError::Internal(anyhow::anyhow!(
                    "binding rejected: {}",
                    status.message()
                )),
            );
            return;
        }

        self.framework
            .run_post_bind_plugins(&ctx, &state, &assumed, &node);
        if let Err(cache_error) = self.cache.finish_binding(&assumed.uid) {
            warn!(task = %assumed.uid, error = %cache_error, "confirming binding in cache");
        }
        self.metrics.record_scheduled();
        self.metrics.observe_e2e(cycle_start.elapsed());
        self.recorder.eventf(
            &assumed,
            "Scheduled",
            &format!("successfully bound to node {node}"),
        );
        info!(task = %assumed.uid, node = %node, "task bound");
    }

    /// Extender binders take over for tasks they are interested in;
    /// otherwise the framework's bind chain runs.
    fn bind(&self, ctx: &CancelToken, state: &CycleState, task: &Task, node: &str) -> Status {
        for extender in &self.extenders {
            if extender.is_binder() && extender.is_interested(task) {
                return match extender.bind(task, node) {
                    Ok(()) => Status::success(),
                    Err(source) => {
                        Status::error(format!("extender {}: {source}", extender.name()))
                    }
                };
            }
        }
        self.framework.run_bind_plugins(ctx, state, task, node)
    }

    /// A failure after assume: forget the optimistic placement, unwind
    /// reservations, and report.
    fn roll_back(
        &self,
        ctx: &CancelToken,
        state: &CycleState,
        queued: QueuedTaskInfo,
        assumed: &Task,
        node: &str,
        failure: SchedulerError,
    ) {
        if let Err(cache_error) = self.cache.forget(assumed) {
            warn!(task = %assumed.uid, error = %cache_error, "forgetting assumed task");
        }
        self.framework
            .run_unreserve_plugins(ctx, state, &queued.task, node);
        handle_scheduling_failure(
            &self.queue,
            self.recorder.as_ref(),
            &self.metrics,
            &self.framework,
            ctx,
            state,
            queued,
            failure,
            false,
        );
    }
}

fn permit_result_label(status: &Status) -> &'static str {
    if status.is_success() {
        "Success"
    } else if status.is_unschedulable() {
        "Unschedulable"
    } else {
        "Error"
    }
}

/// A permit-style rejection scoped to the one node the cycle chose.
fn unschedulable_on_node(task: &Task, node: &str, status: &Status) -> SchedulerError {
    let mut diagnosis = Diagnosis::default();
    diagnosis
        .node_to_status
        .insert(node.to_string(), status.clone());
    if let Some(plugin) = status.plugin() {
        diagnosis.unschedulable_plugins.insert(plugin.to_string());
    }
    SchedulerError::Unschedulable(FitError {
        task: Arc::new(task.clone()),
        num_all_nodes: 1,
        diagnosis,
    })
}

/// Route a failed cycle: feasibility failures park the task with
/// event-based wakeup (running PostFilter first when the cycle asked for
/// it); everything else re-enqueues with backoff.
#[allow(clippy::too_many_arguments)]
fn handle_scheduling_failure(
    queue: &Arc<SchedulingQueue>,
    recorder: &dyn Recorder,
    metrics: &SchedulingMetrics,
    framework: &Framework,
    ctx: &CancelToken,
    state: &CycleState,
    mut queued: QueuedTaskInfo,
    failure: SchedulerError,
    run_post_filter: bool,
) {
    let task = Arc::clone(&queued.task);
    match failure {
        SchedulerError::Unschedulable(fit) => {
            metrics.record_unschedulable();
            if run_post_filter && framework.has_post_filter_plugins() {
                let (result, status) = framework.run_post_filter_plugins(
                    ctx,
                    state,
                    &task,
                    &fit.diagnosis.node_to_status,
                );
                debug!(task = %task.uid, %status, "postfilter finished");
                if let Some(nominated) = result.and_then(|r| r.nominated_node_name) {
                    // Remember the nomination for the next attempt.
                    let mut updated = (*task).clone();
                    updated.nominated_node_name = Some(nominated.clone());
                    queued.task = Arc::new(updated);
                    queue.add_nominated_task(Arc::clone(&queued.task), &nominated);
                }
            }
            let message = fit.render(DEFAULT_REASON_TRUNCATION);
            warn!(task = %task.uid, %message, "task is unschedulable");
            recorder.eventf(&task, "FailedScheduling", &message);
            let plugins: HashSet<String> =
                fit.diagnosis.unschedulable_plugins.iter().cloned().collect();
            queue.add_unschedulable(queued, plugins);
        }
        SchedulerError::NoNodesAvailable => {
            metrics.record_unschedulable();
            recorder.eventf(&task, "FailedScheduling", "no nodes available");
            queue.add_unschedulable(queued, HashSet::new());
        }
        other => {
            metrics.record_error();
            error!(task = %task.uid, error = %other, "scheduling attempt failed");
            recorder.eventf(&task, "FailedScheduling", &other.to_string());
            queue.add_backoff(queued);
        }
    }
}
