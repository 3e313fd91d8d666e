//! The generic scheduler: one task in, one node (or a FitError) out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use berth_cache::{Cache, NodeInfo, Snapshot};
use berth_core::Task;
use berth_framework::{
    parallelize::parallelize, CancelToken, CycleState, Framework, NodeScore, NodeScoreList,
    NodeToStatusMap, SnapshotRef, Status,
};

use crate::error::{Diagnosis, FitError, SchedulerError, SchedulerResult};
use crate::extender::Extender;

/// Below this cluster size every node is always examined.
pub const MIN_FEASIBLE_NODES_TO_FIND: i32 = 100;
/// Floor for the adaptive sampling percentage.
pub const MIN_FEASIBLE_NODES_PERCENTAGE_TO_FIND: i32 = 5;

/// Outcome of a successful scheduling cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleResult {
    pub suggested_host: String,
    /// Nodes the cycle looked at (feasible plus rejected).
    pub evaluated_nodes: usize,
    pub feasible_nodes: usize,
}

/// Stateless-per-task driver of filter → extenders → score → select.
///
/// The only state that survives a cycle is the fairness cursor, which
/// rotates the starting offset so consecutive cycles examine different
/// nodes on large clusters. It is lock-guarded: profiles schedule
/// serially today, but nothing here depends on that.
pub struct GenericScheduler {
    cache: Arc<Cache>,
    snapshot_ref: Arc<SnapshotRef>,
    extenders: Vec<Arc<dyn Extender>>,
    /// Fallback when the profile leaves the percentage unset.
    percentage_of_nodes_to_score: i32,
    next_start_node_index: Mutex<usize>,
    prefer_nominated: bool,
}

impl GenericScheduler {
    pub fn new(
        cache: Arc<Cache>,
        snapshot_ref: Arc<SnapshotRef>,
        percentage_of_nodes_to_score: i32,
    ) -> Self {
        Self {
            cache,
            snapshot_ref,
            extenders: Vec::new(),
            percentage_of_nodes_to_score,
            next_start_node_index: Mutex::new(0),
            prefer_nominated: false,
        }
    }

    pub fn with_extenders(mut self, extenders: Vec<Arc<dyn Extender>>) -> Self {
        self.extenders = extenders;
        self
    }

    /// Try the task's nominated node alone before the full sweep.
    pub fn with_prefer_nominated(mut self, enabled: bool) -> Self {
        self.prefer_nominated = enabled;
        self
    }

    pub fn extenders(&self) -> &[Arc<dyn Extender>] {
        &self.extenders
    }

    /// Schedule one task against the current cluster state.
    pub fn schedule(
        &self,
        ctx: &CancelToken,
        fwk: &Framework,
        state: &CycleState,
        task: &Arc<Task>,
    ) -> SchedulerResult<ScheduleResult> {
        let snapshot = self.refresh_snapshot();
        if snapshot.num_nodes() == 0 {
            return Err(SchedulerError::NoNodesAvailable);
        }

        let (feasible, diagnosis) = self.find_nodes_that_fit(ctx, fwk, state, task, &snapshot)?;
        if feasible.is_empty() {
            return Err(FitError {
                task: Arc::clone(task),
                num_all_nodes: snapshot.num_nodes(),
                diagnosis,
            }
            .into());
        }

        if feasible.len() == 1 {
            let host = feasible[0]
                .node_name()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("feasible node without a node object"))?;
            return Ok(ScheduleResult {
                suggested_host: host,
                evaluated_nodes: 1 + diagnosis.node_to_status.len(),
                feasible_nodes: 1,
            });
        }

        let scores = self.prioritize_nodes(ctx, fwk, state, task, &feasible)?;
        let host = self.select_host(&scores)?;
        debug!(task = %task.uid, node = %host, "selected host");
        Ok(ScheduleResult {
            suggested_host: host,
            evaluated_nodes: feasible.len() + diagnosis.node_to_status.len(),
            feasible_nodes: feasible.len(),
        })
    }

    /// Refresh the shared cycle snapshot from the cache and publish it
    /// for plugins reading through their handle.
    pub fn refresh_snapshot(&self) -> Arc<Snapshot> {
        let mut snapshot = (*self.snapshot_ref.get()).clone();
        self.cache.update_snapshot(&mut snapshot);
        let snapshot = Arc::new(snapshot);
        self.snapshot_ref.set(Arc::clone(&snapshot));
        snapshot
    }

    // ── Feasibility ────────────────────────────────────────────────

    fn find_nodes_that_fit(
        &self,
        ctx: &CancelToken,
        fwk: &Framework,
        state: &CycleState,
        task: &Arc<Task>,
        snapshot: &Snapshot,
    ) -> SchedulerResult<(Vec<Arc<NodeInfo>>, Diagnosis)> {
        let mut diagnosis = Diagnosis::default();

        let status = fwk.run_pre_filter_plugins(ctx, state, task);
        if !status.is_success() {
            if status.is_unschedulable() {
                // Every node shares the verdict.
                for info in snapshot.list() {
                    if let Some(name) = info.node_name() {
                        diagnosis.node_to_status.insert(name.clone(), status.clone());
                    }
                }
                if let Some(plugin) = status.plugin() {
                    diagnosis.unschedulable_plugins.insert(plugin.to_string());
                }
                return Ok((Vec::new(), diagnosis));
            }
            return Err(SchedulerError::Internal(anyhow::anyhow!(
                "running prefilter plugins: {}",
                status.message()
            )));
        }

        let mut feasible = None;
        if self.prefer_nominated && task.nominated_node_name.is_some() {
            feasible = self.evaluate_nominated_node(ctx, fwk, state, task, snapshot, &mut diagnosis);
        }
        let feasible = match feasible {
            Some(nodes) => nodes,
            None => self.find_nodes_that_pass_filters(ctx, fwk, state, task, snapshot, &mut diagnosis)?,
        };

        let feasible = find_nodes_that_pass_extenders(
            &self.extenders,
            task,
            feasible,
            &mut diagnosis.node_to_status,
        )?;
        Ok((feasible, diagnosis))
    }

    /// Fast path: a node nominated by a prior attempt is checked alone;
    /// when it still fits, the sweep is skipped entirely.
    fn evaluate_nominated_node(
        &self,
        ctx: &CancelToken,
        fwk: &Framework,
        state: &CycleState,
        task: &Task,
        snapshot: &Snapshot,
        diagnosis: &mut Diagnosis,
    ) -> Option<Vec<Arc<NodeInfo>>> {
        let name = task.nominated_node_name.as_deref()?;
        let info = snapshot.get(name)?;

        let status = fwk.run_filter_plugins_with_nominated_tasks(ctx, state, task, info);
        if status.is_success() {
            return Some(vec![Arc::clone(info)]);
        }
        debug!(task = %task.uid, node = name, %status, "nominated node no longer fits");
        if status.is_unschedulable() {
            if let Some(plugin) = status.plugin() {
                diagnosis.unschedulable_plugins.insert(plugin.to_string());
            }
            diagnosis.node_to_status.insert(name.to_string(), status);
        }
        None
    }

    fn find_nodes_that_pass_filters(
        &self,
        ctx: &CancelToken,
        fwk: &Framework,
        state: &CycleState,
        task: &Task,
        snapshot: &Snapshot,
        diagnosis: &mut Diagnosis,
    ) -> SchedulerResult<Vec<Arc<NodeInfo>>> {
        let all_nodes = snapshot.list();
        let num_to_find = self.num_feasible_nodes_to_find(
            fwk.percentage_of_nodes_to_score(),
            all_nodes.len() as i32,
        ) as usize;
        let start = *self.next_start_node_index.lock();

        let feasible: Mutex<Vec<Arc<NodeInfo>>> = Mutex::new(Vec::with_capacity(num_to_find));
        let statuses: Mutex<NodeToStatusMap> = Mutex::new(NodeToStatusMap::new());
        let first_error: Mutex<Option<Status>> = Mutex::new(None);
        let found = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);

        parallelize(all_nodes.len(), fwk.parallelism(), |index| {
            if stop.load(Ordering::Relaxed) || ctx.is_cancelled() {
                return;
            }
            let info = &all_nodes[(start + index) % all_nodes.len()];
            let status = fwk.run_filter_plugins_with_nominated_tasks(ctx, state, task, info);
            if status.is_success() {
                let count = found.fetch_add(1, Ordering::Relaxed) + 1;
                if count > num_to_find {
                    // Enough candidates; stop the sweep.
                    stop.store(true, Ordering::Relaxed);
                    found.fetch_sub(1, Ordering::Relaxed);
                } else {
                    feasible.lock().push(Arc::clone(info));
                }
            } else if status.is_unschedulable() {
                if let Some(name) = info.node_name() {
                    statuses.lock().insert(name.clone(), status);
                }
            } else {
                *first_error.lock() = Some(status);
                stop.store(true, Ordering::Relaxed);
            }
        });

        if let Some(status) = first_error.into_inner() {
            return Err(SchedulerError::Internal(anyhow::anyhow!(
                "running filter plugins: {}",
                status.message()
            )));
        }

        let feasible = feasible.into_inner();
        let statuses = statuses.into_inner();

        // Advance the fairness cursor past everything examined this cycle.
        let processed = feasible.len() + statuses.len();
        *self.next_start_node_index.lock() = (start + processed) % all_nodes.len();

        for status in statuses.values() {
            if let Some(plugin) = status.plugin() {
                diagnosis.unschedulable_plugins.insert(plugin.to_string());
            }
        }
        diagnosis.node_to_status.extend(statuses);
        Ok(feasible)
    }

    /// How many feasible nodes to look for in a cluster of
    /// `num_all_nodes`. The profile's percentage wins when set; 0 selects
    /// the adaptive formula `max(5, 50 − N/125)` percent. Results are
    /// floored at `MIN_FEASIBLE_NODES_TO_FIND`.
    fn num_feasible_nodes_to_find(&self, profile_percentage: i32, num_all_nodes: i32) -> i32 {
        let percentage = if profile_percentage > 0 {
            profile_percentage
        } else {
            self.percentage_of_nodes_to_score
        };
        if num_all_nodes < MIN_FEASIBLE_NODES_TO_FIND || percentage >= 100 {
            return num_all_nodes;
        }
        let effective = if percentage <= 0 {
            (50 - num_all_nodes / 125).max(MIN_FEASIBLE_NODES_PERCENTAGE_TO_FIND)
        } else {
            percentage
        };
        (num_all_nodes * effective / 100).max(MIN_FEASIBLE_NODES_TO_FIND)
    }

    // ── Scoring and selection ──────────────────────────────────────

    fn prioritize_nodes(
        &self,
        ctx: &CancelToken,
        fwk: &Framework,
        state: &CycleState,
        task: &Task,
        nodes: &[Arc<NodeInfo>],
    ) -> SchedulerResult<NodeScoreList> {
        let mut totals: NodeScoreList = nodes
            .iter()
            .filter_map(|info| info.node_name().cloned())
            .map(|name| NodeScore { name, score: 0 })
            .collect();

        // With nothing to rank on, every node is equally good.
        if !fwk.has_score_plugins() && self.extenders.is_empty() {
            for entry in totals.iter_mut() {
                entry.score = 1;
            }
            return Ok(totals);
        }

        let status = fwk.run_pre_score_plugins(ctx, state, task, nodes);
        if !status.is_success() {
            return Err(SchedulerError::Internal(anyhow::anyhow!(
                "running prescore plugins: {}",
                status.message()
            )));
        }

        let plugin_scores = fwk
            .run_score_plugins(ctx, state, task, nodes)
            .map_err(|status| {
                SchedulerError::Internal(anyhow::anyhow!(
                    "running score plugins: {}",
                    status.message()
                ))
            })?;
        for scores in plugin_scores.values() {
            for (index, node_score) in scores.iter().enumerate() {
                totals[index].score += node_score.score;
            }
        }

        for extender in &self.extenders {
            if !extender.is_interested(task) {
                continue;
            }
            match extender.prioritize(task, nodes) {
                Ok((scores, weight)) => {
                    for host_priority in scores {
                        if let Some(total) =
                            totals.iter_mut().find(|t| t.name == host_priority.host)
                        {
                            total.score += host_priority.score * weight;
                        }
                    }
                }
                // Prioritize failures cost ranking signal, not the cycle.
                Err(source) => {
                    warn!(extender = extender.name(), error = %source, "extender prioritize failed");
                }
            }
        }

        Ok(totals)
    }

    /// Pick the best-scoring node; ties break by reservoir sampling so
    /// each of k tied nodes wins with probability 1/k.
    fn select_host(&self, scores: &NodeScoreList) -> SchedulerResult<String> {
        let first = scores
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty priority list"))?;
        let mut rng = rand::thread_rng();
        let mut selected = first.name.clone();
        let mut max_score = first.score;
        let mut ties = 1;
        for node_score in &scores[1..] {
            if node_score.score > max_score {
                max_score = node_score.score;
                selected = node_score.name.clone();
                ties = 1;
            } else if node_score.score == max_score {
                ties += 1;
                if rng.gen_range(0..ties) == 0 {
                    selected = node_score.name.clone();
                }
            }
        }
        Ok(selected)
    }
}

/// Run the surviving node set through every configured extender.
///
/// Extender failure annotations merge into `statuses` by concatenating
/// reasons; an unresolvable verdict upgrades the node's code. Transport
/// errors abort unless the extender is ignorable.
pub(crate) fn find_nodes_that_pass_extenders(
    extenders: &[Arc<dyn Extender>],
    task: &Task,
    mut feasible: Vec<Arc<NodeInfo>>,
    statuses: &mut NodeToStatusMap,
) -> SchedulerResult<Vec<Arc<NodeInfo>>> {
    for extender in extenders {
        if feasible.is_empty() {
            break;
        }
        if !extender.is_interested(task) {
            continue;
        }
        let result = match extender.filter(task, &feasible) {
            Ok(result) => result,
            Err(source) if extender.is_ignorable() => {
                warn!(
                    extender = extender.name(),
                    error = %source,
                    "ignoring failure from ignorable extender"
                );
                continue;
            }
            Err(source) => {
                return Err(SchedulerError::Internal(anyhow::anyhow!(
                    "extender {}: {source}",
                    extender.name()
                )));
            }
        };

        for (node, reason) in &result.failed_and_unresolvable {
            let mut reasons: Vec<String> = statuses
                .remove(node)
                .map(|status| status.reasons().to_vec())
                .unwrap_or_default();
            reasons.push(reason.clone());
            let mut status = Status::unschedulable_and_unresolvable(reasons.remove(0));
            for extra in reasons {
                status.append_reason(extra);
            }
            statuses.insert(node.clone(), status);
        }
        for (node, reason) in &result.failed {
            if result.failed_and_unresolvable.contains_key(node) {
                continue;
            }
            match statuses.get_mut(node) {
                Some(status) => status.append_reason(reason.clone()),
                None => {
                    statuses.insert(node.clone(), Status::unschedulable(reason.clone()));
                }
            }
        }

        let surviving: HashSet<&String> = result.node_names.iter().collect();
        feasible.retain(|info| {
            info.node_name().is_some_and(|name| surviving.contains(name))
        });
    }
    Ok(feasible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{ContainerSpec, Node, ResourceList};
    use berth_framework::{
        Code, FilterPlugin, FrameworkOptions, Handle, Plugin, PluginSet, Registry,
        SchedulerProfile,
    };
    use berth_plugins::{default_binder, priority_sort};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    // ── Test plugins ───────────────────────────────────────────────

    struct TrueFilter;
    impl Plugin for TrueFilter {
        fn name(&self) -> &str {
            "TrueFilter"
        }
        fn filter(&self) -> Option<&dyn FilterPlugin> {
            Some(self)
        }
    }
    impl FilterPlugin for TrueFilter {
        fn filter(&self, _: &CancelToken, _: &CycleState, _: &Task, _: &NodeInfo) -> Status {
            Status::success()
        }
    }

    /// Rejects nodes whose free cpu cannot hold the task.
    struct CapacityFilter;
    impl Plugin for CapacityFilter {
        fn name(&self) -> &str {
            "CapacityFilter"
        }
        fn filter(&self) -> Option<&dyn FilterPlugin> {
            Some(self)
        }
    }
    impl FilterPlugin for CapacityFilter {
        fn filter(
            &self,
            _: &CancelToken,
            _: &CycleState,
            task: &Task,
            node_info: &NodeInfo,
        ) -> Status {
            let Some(node) = node_info.node.as_ref() else {
                return Status::error("no node");
            };
            let free = node.allocatable.milli_cpu - node_info.requested.milli_cpu;
            if task.total_requests().milli_cpu > free {
                return Status::unschedulable("Insufficient cpu");
            }
            Status::success()
        }
    }

    /// Counts calls and fails configured nodes.
    struct CountingFilter {
        calls: Arc<AtomicU32>,
        failures: HashMap<String, Code>,
    }
    impl Plugin for CountingFilter {
        fn name(&self) -> &str {
            "CountingFilter"
        }
        fn filter(&self) -> Option<&dyn FilterPlugin> {
            Some(self)
        }
    }
    impl FilterPlugin for CountingFilter {
        fn filter(
            &self,
            _: &CancelToken,
            _: &CycleState,
            _: &Task,
            node_info: &NodeInfo,
        ) -> Status {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let name = node_info.node_name().cloned().unwrap_or_default();
            match self.failures.get(&name) {
                Some(code) => Status::new(*code, "rejected by test filter"),
                None => Status::success(),
            }
        }
    }

    // ── Fake extender ──────────────────────────────────────────────

    type Predicate = Box<dyn Fn(&Task, &str) -> Status + Send + Sync>;

    struct FakeExtender {
        name: String,
        predicate: Option<Predicate>,
        errors: bool,
        ignorable: bool,
    }

    impl Extender for FakeExtender {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_ignorable(&self) -> bool {
            self.ignorable
        }
        fn is_interested(&self, _task: &Task) -> bool {
            true
        }
        fn filter(
            &self,
            task: &Task,
            nodes: &[Arc<NodeInfo>],
        ) -> anyhow::Result<crate::extender::ExtenderFilterResult> {
            if self.errors {
                anyhow::bail!("extender transport error");
            }
            let mut result = crate::extender::ExtenderFilterResult::default();
            for info in nodes {
                let name = info.node_name().cloned().unwrap_or_default();
                let status = match &self.predicate {
                    Some(predicate) => predicate(task, &name),
                    None => Status::success(),
                };
                match status.code() {
                    Code::Success => result.node_names.push(name),
                    Code::UnschedulableAndUnresolvable => {
                        result.failed_and_unresolvable.insert(
                            name.clone(),
                            format!("{}: node {name} failed and unresolvable", self.name),
                        );
                    }
                    _ => {
                        result
                            .failed
                            .insert(name.clone(), format!("{}: node {name} failed", self.name));
                    }
                }
            }
            Ok(result)
        }
    }

    // ── Harness ────────────────────────────────────────────────────

    fn make_node(name: &str, milli_cpu: i64, memory: i64) -> Node {
        Node::new(name).with_allocatable(ResourceList::new(milli_cpu, memory))
    }

    fn requesting(uid: &str, milli_cpu: i64) -> Arc<Task> {
        Arc::new(Task {
            uid: uid.to_string(),
            name: uid.to_string(),
            scheduler_name: "default".to_string(),
            containers: vec![ContainerSpec {
                name: "main".to_string(),
                requests: ResourceList::new(milli_cpu, 0),
                host_ports: vec![],
            }],
            ..Task::default()
        })
    }

    struct Harness {
        cache: Arc<Cache>,
        handle: Handle,
        framework: Framework,
        scheduler: GenericScheduler,
    }

    fn registry_with(extra: Vec<(&'static str, Arc<dyn Plugin>)>) -> Registry {
        let mut registry = Registry::new();
        registry
            .register(priority_sort::NAME, priority_sort::factory)
            .unwrap();
        registry
            .register(default_binder::NAME, default_binder::factory)
            .unwrap();
        for (name, plugin) in extra {
            let plugin = Arc::clone(&plugin);
            registry
                .register(name, move |_, _| Ok(Arc::clone(&plugin)))
                .unwrap();
        }
        registry
    }

    fn harness(
        nodes: Vec<Node>,
        filters: &[&str],
        extra: Vec<(&'static str, Arc<dyn Plugin>)>,
        percentage: i32,
    ) -> Harness {
        harness_with_options(nodes, filters, extra, percentage, FrameworkOptions::default())
    }

    fn harness_with_options(
        nodes: Vec<Node>,
        filters: &[&str],
        extra: Vec<(&'static str, Arc<dyn Plugin>)>,
        percentage: i32,
        options: FrameworkOptions,
    ) -> Harness {
        let cache = Arc::new(Cache::new(Duration::from_secs(30)));
        for node in nodes {
            cache.add_node(node);
        }
        let handle = Handle::new(Arc::clone(&cache));

        let mut profile = SchedulerProfile::new("default");
        profile.plugins.queue_sort = PluginSet::enable(&[priority_sort::NAME]);
        profile.plugins.bind = PluginSet::enable(&[default_binder::NAME]);
        profile.plugins.filter = PluginSet::enable(filters);
        profile.percentage_of_nodes_to_score = percentage;

        let framework = Framework::new(
            &registry_with(extra),
            &profile,
            handle.clone(),
            options,
        )
        .unwrap();

        let scheduler =
            GenericScheduler::new(Arc::clone(&cache), Arc::clone(&handle.snapshot), 0);
        Harness {
            cache,
            handle,
            framework,
            scheduler,
        }
    }

    // ── numFeasibleNodesToFind ─────────────────────────────────────

    #[test]
    fn num_feasible_nodes_to_find_table() {
        let cache = Arc::new(Cache::new(Duration::from_secs(30)));
        let cases: &[(i32, i32, i32)] = &[
            // (percentage, num_all_nodes, want)
            (0, 10, 10),
            (40, 10, 10),
            (0, 1000, 420),
            (40, 1000, 400),
            (0, 6000, 300),
            (40, 6000, 2400),
        ];
        for (percentage, num_all, want) in cases {
            let scheduler = GenericScheduler::new(
                Arc::clone(&cache),
                Arc::new(SnapshotRef::new()),
                *percentage,
            );
            assert_eq!(
                scheduler.num_feasible_nodes_to_find(0, *num_all),
                *want,
                "percentage={percentage} nodes={num_all}"
            );
        }
    }

    // ── selectHost ─────────────────────────────────────────────────

    #[test]
    fn select_host_picks_among_top_scores() {
        let cache = Arc::new(Cache::new(Duration::from_secs(30)));
        let scheduler = GenericScheduler::new(cache, Arc::new(SnapshotRef::new()), 0);

        let cases: &[(&str, Vec<(&str, i64)>, Vec<&str>)] = &[
            (
                "unique properly ordered scores",
                vec![("machine1.1", 1), ("machine2.1", 2)],
                vec!["machine2.1"],
            ),
            (
                "equal scores",
                vec![
                    ("machine1.1", 1),
                    ("machine1.2", 2),
                    ("machine1.3", 2),
                    ("machine2.1", 2),
                ],
                vec!["machine1.2", "machine1.3", "machine2.1"],
            ),
            (
                "out of order scores",
                vec![
                    ("machine1.1", 3),
                    ("machine1.2", 3),
                    ("machine2.1", 2),
                    ("machine3.1", 1),
                    ("machine1.3", 3),
                ],
                vec!["machine1.1", "machine1.2", "machine1.3"],
            ),
        ];

        for (name, scores, possible) in cases {
            let list: NodeScoreList = scores
                .iter()
                .map(|(node, score)| NodeScore {
                    name: (*node).to_string(),
                    score: *score,
                })
                .collect();
            for _ in 0..10 {
                let got = scheduler.select_host(&list).unwrap();
                assert!(possible.contains(&got.as_str()), "{name}: got {got}");
            }
        }

        assert!(scheduler.select_host(&NodeScoreList::new()).is_err());
    }

    #[test]
    fn select_host_tie_break_is_roughly_uniform() {
        let cache = Arc::new(Cache::new(Duration::from_secs(30)));
        let scheduler = GenericScheduler::new(cache, Arc::new(SnapshotRef::new()), 0);
        let list: NodeScoreList = ["a", "b", "c"]
            .iter()
            .map(|n| NodeScore {
                name: (*n).to_string(),
                score: 7,
            })
            .collect();

        let mut wins: HashMap<String, u32> = HashMap::new();
        for _ in 0..3000 {
            *wins.entry(scheduler.select_host(&list).unwrap()).or_insert(0) += 1;
        }
        for node in ["a", "b", "c"] {
            let count = wins.get(node).copied().unwrap_or(0);
            // 1/3 ± a generous margin.
            assert!((600..=1400).contains(&count), "{node} won {count} times");
        }
    }

    // ── Extender merging ───────────────────────────────────────────

    fn extender_nodes(names: &[&str]) -> Vec<Arc<NodeInfo>> {
        names
            .iter()
            .map(|name| Arc::new(NodeInfo::new(Arc::new(Node::new(name)))))
            .collect()
    }

    #[test]
    fn extender_error_aborts_cycle() {
        let extenders: Vec<Arc<dyn Extender>> = vec![Arc::new(FakeExtender {
            name: "FakeExtender".to_string(),
            predicate: None,
            errors: true,
            ignorable: false,
        })];
        let mut statuses = NodeToStatusMap::new();
        let result = find_nodes_that_pass_extenders(
            &extenders,
            &Task::default(),
            extender_nodes(&["a"]),
            &mut statuses,
        );
        assert!(result.is_err());
    }

    #[test]
    fn ignorable_extender_error_is_skipped() {
        let extenders: Vec<Arc<dyn Extender>> = vec![Arc::new(FakeExtender {
            name: "FakeExtender".to_string(),
            predicate: None,
            errors: true,
            ignorable: true,
        })];
        let mut statuses = NodeToStatusMap::new();
        let survivors = find_nodes_that_pass_extenders(
            &extenders,
            &Task::default(),
            extender_nodes(&["a"]),
            &mut statuses,
        )
        .unwrap();
        assert_eq!(survivors.len(), 1);
    }

    #[test]
    fn extender_shrinks_set_and_annotates_statuses() {
        let extenders: Vec<Arc<dyn Extender>> = vec![Arc::new(FakeExtender {
            name: "FakeExtender".to_string(),
            predicate: Some(Box::new(|_, node| match node {
                "a" => Status::success(),
                "b" => Status::unschedulable("not allowed"),
                _ => Status::unschedulable_and_unresolvable("not allowed"),
            })),
            errors: false,
            ignorable: false,
        })];
        let mut statuses = NodeToStatusMap::new();
        let survivors = find_nodes_that_pass_extenders(
            &extenders,
            &Task::default(),
            extender_nodes(&["a", "b", "c"]),
            &mut statuses,
        )
        .unwrap();

        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].node_name().unwrap(), "a");
        assert_eq!(statuses["b"].code(), Code::Unschedulable);
        assert_eq!(
            statuses["b"].reasons(),
            &["FakeExtender: node b failed".to_string()]
        );
        assert_eq!(statuses["c"].code(), Code::UnschedulableAndUnresolvable);
    }

    #[test]
    fn extender_merges_with_existing_statuses() {
        let extenders: Vec<Arc<dyn Extender>> = vec![Arc::new(FakeExtender {
            name: "FakeExtender".to_string(),
            predicate: Some(Box::new(|_, node| match node {
                "a" => Status::success(),
                "b" => Status::unschedulable("not allowed"),
                _ => Status::unschedulable_and_unresolvable("not allowed"),
            })),
            errors: false,
            ignorable: false,
        })];
        let mut statuses = NodeToStatusMap::new();
        statuses.insert(
            "c".to_string(),
            Status::unschedulable("FakeFilterPlugin: node c failed"),
        );

        let survivors = find_nodes_that_pass_extenders(
            &extenders,
            &Task::default(),
            extender_nodes(&["a", "b", "c"]),
            &mut statuses,
        )
        .unwrap();

        assert_eq!(survivors.len(), 1);
        // The filter's reason is kept, the extender's appended, and the
        // code upgraded to unresolvable.
        assert_eq!(statuses["c"].code(), Code::UnschedulableAndUnresolvable);
        assert_eq!(
            statuses["c"].reasons(),
            &[
                "FakeFilterPlugin: node c failed".to_string(),
                "FakeExtender: node c failed and unresolvable".to_string(),
            ]
        );
    }

    #[test]
    fn multiple_extenders_apply_in_sequence() {
        let first: Arc<dyn Extender> = Arc::new(FakeExtender {
            name: "Extender1".to_string(),
            predicate: Some(Box::new(|_, node| match node {
                "a" | "b" => Status::success(),
                _ => Status::unschedulable_and_unresolvable("no"),
            })),
            errors: false,
            ignorable: false,
        });
        let second: Arc<dyn Extender> = Arc::new(FakeExtender {
            name: "Extender2".to_string(),
            predicate: Some(Box::new(|_, node| match node {
                "a" => Status::success(),
                _ => Status::unschedulable("no"),
            })),
            errors: false,
            ignorable: false,
        });
        let mut statuses = NodeToStatusMap::new();
        let survivors = find_nodes_that_pass_extenders(
            &[first, second],
            &Task::default(),
            extender_nodes(&["a", "b", "c"]),
            &mut statuses,
        )
        .unwrap();

        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].node_name().unwrap(), "a");
        assert_eq!(statuses["b"].code(), Code::Unschedulable);
        assert_eq!(statuses["c"].code(), Code::UnschedulableAndUnresolvable);
    }

    // ── End-to-end schedule ────────────────────────────────────────

    #[test]
    fn schedules_onto_the_only_fitting_node() {
        let h = harness(
            vec![make_node("m1", 8000, 16_000), make_node("m2", 4000, 16_000)],
            &["CapacityFilter"],
            vec![("CapacityFilter", Arc::new(CapacityFilter))],
            0,
        );
        let task = requesting("t1", 6000);

        let result = h
            .scheduler
            .schedule(&CancelToken::new(), &h.framework, &CycleState::new(), &task)
            .unwrap();

        assert_eq!(result.suggested_host, "m1");
        assert_eq!(result.evaluated_nodes, 2);
        assert_eq!(result.feasible_nodes, 1);
    }

    #[test]
    fn no_nodes_available() {
        let h = harness(vec![], &["TrueFilter"], vec![("TrueFilter", Arc::new(TrueFilter))], 0);
        let task = requesting("t1", 100);
        let err = h
            .scheduler
            .schedule(&CancelToken::new(), &h.framework, &CycleState::new(), &task)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoNodesAvailable));
    }

    #[test]
    fn infeasible_everywhere_returns_fit_error() {
        let h = harness(
            vec![make_node("m1", 1000, 1000), make_node("m2", 1000, 1000)],
            &["CapacityFilter"],
            vec![("CapacityFilter", Arc::new(CapacityFilter))],
            0,
        );
        let task = requesting("t1", 64_000);

        let err = h
            .scheduler
            .schedule(&CancelToken::new(), &h.framework, &CycleState::new(), &task)
            .unwrap_err();
        let SchedulerError::Unschedulable(fit) = err else {
            panic!("expected fit error, got {err}");
        };
        assert_eq!(fit.num_all_nodes, 2);
        assert_eq!(fit.diagnosis.node_to_status.len(), 2);
        assert!(fit
            .diagnosis
            .unschedulable_plugins
            .contains("CapacityFilter"));
        assert_eq!(
            fit.to_string(),
            "0/2 nodes are available: 2 Insufficient cpu."
        );
    }

    #[test]
    fn feasibility_soundness_of_the_chosen_node() {
        let h = harness(
            vec![make_node("m1", 8000, 16_000), make_node("m2", 4000, 16_000)],
            &["CapacityFilter"],
            vec![("CapacityFilter", Arc::new(CapacityFilter))],
            0,
        );
        let task = requesting("t1", 3000);

        let state = CycleState::new();
        let result = h
            .scheduler
            .schedule(&CancelToken::new(), &h.framework, &state, &task)
            .unwrap();

        // Re-running the filter on the chosen node alone must pass.
        let snapshot = h.handle.snapshot.get();
        let info = snapshot.get(&result.suggested_host).unwrap();
        let status =
            h.framework
                .run_filter_plugins(&CancelToken::new(), &state, &task, info);
        assert!(status.is_success());
    }

    // ── Fairness cursor ────────────────────────────────────────────

    #[test]
    fn cursor_rotates_across_cycles() {
        let num_all_nodes = 500usize;
        let nodes: Vec<Node> = (0..num_all_nodes)
            .map(|i| make_node(&format!("node-{i:03}"), 1000, 1000))
            .collect();
        let h = harness_with_options(
            nodes,
            &["TrueFilter"],
            vec![("TrueFilter", Arc::new(TrueFilter))],
            30,
            FrameworkOptions {
                parallelism: 1,
                ..FrameworkOptions::default()
            },
        );
        let task = requesting("t1", 0);

        let nodes_to_find = h
            .scheduler
            .num_feasible_nodes_to_find(30, num_all_nodes as i32) as usize;
        assert_eq!(nodes_to_find, 150);

        let cycles = 2 * (num_all_nodes / nodes_to_find + 1);
        for i in 0..cycles {
            let snapshot = h.scheduler.refresh_snapshot();
            let mut diagnosis = Diagnosis::default();
            let feasible = h
                .scheduler
                .find_nodes_that_pass_filters(
                    &CancelToken::new(),
                    &h.framework,
                    &CycleState::new(),
                    &task,
                    &snapshot,
                    &mut diagnosis,
                )
                .unwrap();
            assert_eq!(feasible.len(), nodes_to_find, "cycle {i}");
            assert_eq!(
                *h.scheduler.next_start_node_index.lock(),
                (i + 1) * nodes_to_find % num_all_nodes,
                "cycle {i}"
            );
        }
    }

    #[test]
    fn every_node_is_eventually_considered() {
        let num_all_nodes = 300usize;
        let nodes: Vec<Node> = (0..num_all_nodes)
            .map(|i| make_node(&format!("node-{i:03}"), 1000, 1000))
            .collect();
        let h = harness_with_options(
            nodes,
            &["TrueFilter"],
            vec![("TrueFilter", Arc::new(TrueFilter))],
            50,
            FrameworkOptions {
                parallelism: 1,
                ..FrameworkOptions::default()
            },
        );
        let task = requesting("t1", 0);

        let nodes_to_find = h
            .scheduler
            .num_feasible_nodes_to_find(50, num_all_nodes as i32)
            as usize;
        let cycles = num_all_nodes.div_ceil(nodes_to_find);

        let mut seen: HashSet<String> = HashSet::new();
        for _ in 0..cycles {
            let snapshot = h.scheduler.refresh_snapshot();
            let mut diagnosis = Diagnosis::default();
            let feasible = h
                .scheduler
                .find_nodes_that_pass_filters(
                    &CancelToken::new(),
                    &h.framework,
                    &CycleState::new(),
                    &task,
                    &snapshot,
                    &mut diagnosis,
                )
                .unwrap();
            for info in feasible {
                seen.insert(info.node_name().unwrap().clone());
            }
        }
        assert_eq!(seen.len(), num_all_nodes);
    }

    // ── Nominated-node fast path ───────────────────────────────────

    fn nominated_task(node: Option<&str>) -> Arc<Task> {
        Arc::new(Task {
            uid: "p".to_string(),
            name: "p".to_string(),
            scheduler_name: "default".to_string(),
            priority: 1000,
            nominated_node_name: node.map(str::to_string),
            ..Task::default()
        })
    }

    fn nominated_case(
        prefer: bool,
        task: Arc<Task>,
        failures: HashMap<String, Code>,
    ) -> u32 {
        let calls = Arc::new(AtomicU32::new(0));
        let filter = Arc::new(CountingFilter {
            calls: Arc::clone(&calls),
            failures,
        });
        let h = harness(
            vec![
                make_node("node1", 1000, 1000),
                make_node("node2", 1000, 1000),
                make_node("node3", 1000, 1000),
            ],
            &["CountingFilter"],
            vec![("CountingFilter", filter as Arc<dyn Plugin>)],
            0,
        );
        let scheduler = GenericScheduler::new(
            Arc::clone(&h.cache),
            Arc::clone(&h.handle.snapshot),
            0,
        )
        .with_prefer_nominated(prefer);

        let snapshot = scheduler.refresh_snapshot();
        scheduler
            .find_nodes_that_fit(
                &CancelToken::new(),
                &h.framework,
                &CycleState::new(),
                &task,
                &snapshot,
            )
            .unwrap();
        calls.load(Ordering::Relaxed)
    }

    #[test]
    fn nominated_node_is_filtered_alone_when_preferred() {
        let calls = nominated_case(true, nominated_task(Some("node1")), HashMap::new());
        assert_eq!(calls, 1);
    }

    #[test]
    fn nomination_ignored_when_feature_disabled() {
        let calls = nominated_case(false, nominated_task(Some("node1")), HashMap::new());
        assert_eq!(calls, 3);
    }

    #[test]
    fn no_nomination_filters_every_node() {
        let calls = nominated_case(true, nominated_task(None), HashMap::new());
        assert_eq!(calls, 3);
    }

    #[test]
    fn failing_nominated_node_falls_back_to_full_sweep() {
        let mut failures = HashMap::new();
        failures.insert("node1".to_string(), Code::Unschedulable);
        let calls = nominated_case(true, nominated_task(Some("node1")), failures);
        assert_eq!(calls, 4);
    }
}
