use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::TraversalError;
use crate::graph::TestGraph;
use crate::node::{NodeId, TestNode, TestResult, WorkerId};
use crate::restriction::{Params, ParamsExt as _};
use crate::runner::{run_test_node, TestRunner};
use crate::states::StatePool;
use crate::util::ResultExt as _;
use crate::worker::TestWorker;

// Drives the cooperative traversal of one shared graph by all workers. The
// graph is the only shared mutable structure; workers coordinate through
// node occupancy and per-worker edge bookkeeping, never through blocking on
// each other.
pub struct Traverser {
    pub graph: Arc<TestGraph>,
    pub runner: Arc<dyn TestRunner>,
    pub pool: Arc<StatePool>,
    // Runtime parameter overlay, applied to synthesized nodes.
    pub params: Params,
    // Results of a previous job, matched against nodes on first visit.
    pub prior_results: Vec<TestResult>,
    pub ct: CancellationToken,
    // When set, every traversal step dumps a DOT snapshot here.
    pub dump_dir: Option<PathBuf>,
}

impl Traverser {
    pub fn new(
        graph: Arc<TestGraph>,
        runner: Arc<dyn TestRunner>,
        pool: Arc<StatePool>,
        params: Params,
    ) -> Self {
        Self {
            graph,
            runner,
            pool,
            params,
            prior_results: Vec::new(),
            ct: CancellationToken::new(),
            dump_dir: None,
        }
    }

    // Run every worker's traversal loop to completion. A failing worker
    // takes only itself down; its siblings keep traversing. The first error
    // is reported once everyone stopped.
    pub async fn run_workers(self: &Arc<Self>) -> anyhow::Result<()> {
        for swarm in self.graph.swarms.values() {
            info!("Swarm {} drives workers {:?}", swarm.id, swarm.workers);
        }
        let mut join_set = JoinSet::new();
        for worker in self.graph.workers.clone() {
            let zelf = self.clone();
            join_set.spawn(async move {
                let id = worker.id.clone();
                (id, zelf.traverse_object_trees(worker).await)
            });
        }
        let mut final_result = Ok(());
        while let Some(joined) = join_set.join_next().await {
            let (id, result) = joined.expect("joining worker tasks");
            if let Err(err) = result {
                error!("Worker {id} failed its traversal: {err:#}");
                if final_result.is_ok() {
                    final_result = Err(err);
                }
            }
        }
        final_result
    }

    // One worker's cooperative DFS over the shared graph. The path stack's
    // top is the node under examination, the second-from-top is where we
    // came from; the relation between the two tells the direction.
    pub async fn traverse_object_trees(&self, worker: Arc<TestWorker>) -> anyhow::Result<()> {
        debug!(
            "Worker {} starting complete graph traversal with parameters {:?}",
            worker.id, self.params
        );
        worker.set_up();
        let root = self.graph.root();
        let mut traverse_path: Vec<NodeId> = vec![root.id];
        let mut occupied_at: BTreeSet<NodeId> = BTreeSet::new();
        let mut occupied_wait = 0.0f64;
        let mut step = 0u64;

        while !root.is_cleanup_ready(&worker.id) {
            if self.ct.is_cancelled() {
                bail!("worker {} canceled", worker.id);
            }
            step += 1;
            let next = self.graph.node(*traverse_path.last().expect("path starts at root"));
            if traverse_path.len() < 2 {
                // A cleanup-unready root is guaranteed a child to descend to.
                if let Some(child) = self.graph.pick_child(&next, &worker.id) {
                    traverse_path.push(child.id);
                }
                continue;
            }
            let prev = self.graph.node(traverse_path[traverse_path.len() - 2]);

            // Dynamic expansion: flat nodes unroll on first encounter per
            // worker, growing the graph under them.
            if next.is_flat() && !next.is_unrolled(&worker.id) {
                self.graph
                    .unroll_flat_node(&next, &worker)
                    .with_context(|| format!("unrolling {} for {}", next.shortname(), worker.id))?;
                self.dump_step(&worker.id, step);
                continue;
            }

            // Ending at an occupied node means waiting a permill of its
            // duration, and looking elsewhere for work in the meantime.
            if next.is_occupied_by_other(&worker.id) {
                let test_timeout = next.param("test_timeout").and_then(|t| t.parse().ok())
                    .unwrap_or_else(|| self.graph.suite.test_timeout.as_secs_f64());
                let occupied_timeout = (test_timeout / 1000.0).max(0.1);
                if occupied_at.contains(&next.id) {
                    // Despite ergodicity we ended at the same node (no other work).
                    if occupied_wait > test_timeout {
                        let nodes = occupied_at
                            .iter()
                            .map(|id| self.graph.node(*id).node_id())
                            .collect::<Vec<_>>()
                            .join(", ");
                        return Err(TraversalError::StuckOnOccupied {
                            worker: worker.id.clone(),
                            waited: occupied_wait,
                            timeout: test_timeout,
                            nodes,
                        }
                        .into());
                    }
                    occupied_wait += occupied_timeout;
                } else {
                    // Waiting for a different node now.
                    occupied_wait = 0.0;
                }
                occupied_at.insert(next.id);
                debug!(
                    "Worker {} stepping back from already occupied test node {} for a period \
                     of {occupied_timeout}s (total time spent: {occupied_wait:.2})",
                    worker.id,
                    next.node_id()
                );
                // Reset the path to improve overall ergodicity: the worker
                // will look for other work instead of busy-spinning here.
                traverse_path = vec![root.id];
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(occupied_timeout)) => {}
                    _ = self.ct.cancelled() => bail!("worker {} canceled", worker.id),
                }
                continue;
            }

            let prev_is_child = next.inner().cleanup_nodes.contains_key(&prev.id);
            let prev_is_parent = next.inner().setup_nodes.contains_key(&prev.id);
            debug!(
                "Worker {} at test node {} which is {}ready with setup and {}ready with cleanup",
                worker.id,
                next.shortname(),
                if next.is_setup_ready(&worker.id) { "" } else { "not " },
                if next.is_cleanup_ready(&worker.id) { "" } else { "not " },
            );

            if prev_is_child {
                // The path is reversed looking for setup: run the parent if
                // its own setup is in place, else keep climbing.
                if next.is_setup_ready(&worker.id) {
                    self.traverse_node(&next, &worker).await?;
                    if !self.should_run(&next, &worker).await? {
                        self.graph.drop_parent(&prev, &next, &worker.id);
                    }
                    traverse_path.pop();
                } else {
                    // Inverse DFS.
                    let parent = self
                        .graph
                        .pick_parent(&next, &worker.id)
                        .expect("setup-unready node has an unconsumed parent");
                    traverse_path.push(parent.id);
                }
            } else if prev_is_parent {
                // Parents have higher priority than children: stop if the
                // node is not a setup leaf.
                if !next.is_setup_ready(&worker.id) {
                    let parent = self
                        .graph
                        .pick_parent(&next, &worker.id)
                        .expect("setup-unready node has an unconsumed parent");
                    traverse_path.push(parent.id);
                    continue;
                }
                self.traverse_node(&next, &worker).await?;
                if self.should_run(&next, &worker).await? {
                    // Still runnable (e.g. lost an occupancy race), postpone
                    // descending through it.
                    traverse_path.pop();
                    continue;
                }

                if next.is_cleanup_ready(&worker.id) {
                    self.graph.report_progress();
                    let unexplored = self.graph.unexplored_nodes();
                    if !next.is_flat() && !unexplored.is_empty() {
                        // The node might still grow new children out of the
                        // unexplored leaves, so postpone its cleanup and go
                        // do that real work first.
                        info!(
                            "Worker {} postponing the cleanup for {} due to {} unexplored nodes",
                            worker.id,
                            next.shortname(),
                            unexplored.len()
                        );
                        traverse_path = vec![root.id, unexplored[0].id];
                        continue;
                    }
                    let setup_ids: Vec<NodeId> = next.inner().setup_nodes.keys().cloned().collect();
                    for pid in setup_ids {
                        self.graph.drop_child(&self.graph.node(pid), &next, &worker.id);
                    }
                    self.reverse_node(&next, &worker).await;
                    traverse_path.pop();
                } else {
                    // Normal DFS.
                    let child = self
                        .graph
                        .pick_child(&next, &worker.id)
                        .expect("cleanup-unready node has an unconsumed child");
                    traverse_path.push(child.id);
                }
            } else {
                return Err(TraversalError::DiscontinuousPath {
                    at: next.node_id(),
                }
                .into());
            }
            self.dump_step(&worker.id, step);
        }

        assert!(
            traverse_path == vec![root.id],
            "unfinished traverse path detected for worker {}",
            worker.id
        );
        debug!("Worker {} ending at the shared root", worker.id);
        Ok(())
    }

    // Whether this worker ought to execute the node now. Overridable by the
    // manual flagging tools; the default derives from net binding, bridged
    // completion, and state availability.
    async fn should_run(&self, node: &Arc<TestNode>, worker: &TestWorker) -> anyhow::Result<bool> {
        if node.is_flat() || node.is_shared_root() || !node.inner().cloned_nodes.is_empty() {
            return Ok(false);
        }
        // A node is only ever executed by the worker whose net it is bound
        // to; everyone else just consumes bookkeeping.
        if node.objects[0].suffix != worker.id {
            return Ok(false);
        }
        if !node.inner().finished_workers.is_empty() {
            return Ok(false);
        }
        if let Some(flag) = node.inner().should_run_override {
            return Ok(flag);
        }
        // A prior job already ran this test fine.
        if node.inner().results.iter().any(|r| r.status.is_ok()) {
            return Ok(false);
        }

        let stateful = node.stateful_objects();
        if stateful.is_empty() {
            // Leaves run exactly once across the whole pool: a bridged twin
            // having run (or running right now) satisfies everyone.
            let bridged: Vec<NodeId> = node.inner().bridged_nodes.iter().cloned().collect();
            for peer_id in bridged {
                let peer = self.graph.node(peer_id);
                let inner = peer.inner();
                if !inner.finished_workers.is_empty() || inner.started_worker.is_some() {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        // Setup nodes run unless everything they would produce is already
        // obtainable from somewhere this worker can reach.
        let available = self
            .pool
            .provided_states_available(node, worker, &self.graph.workers)
            .await?;
        Ok(!available)
    }

    fn should_clean(&self, node: &Arc<TestNode>, worker: &TestWorker) -> bool {
        if node.is_flat() || node.is_shared_root() || !node.inner().cloned_nodes.is_empty() {
            return false;
        }
        if node.objects[0].suffix != worker.id {
            return false;
        }
        if let Some(flag) = node.inner().should_clean_override {
            return flag;
        }
        !node.stateful_objects().is_empty()
    }

    // Traverse (possibly run) one node under the occupancy lock.
    async fn traverse_node(&self, node: &Arc<TestNode>, worker: &TestWorker) -> anyhow::Result<()> {
        if !node.try_occupy(&worker.id) {
            return Ok(());
        }

        // First visit: attach any previous results matching this node's
        // worker-independent form.
        if node.inner().results.is_empty() && !self.prior_results.is_empty() {
            let form = node.bridged_form();
            let previous: Vec<TestResult> = self
                .prior_results
                .iter()
                .filter(|r| r.name.starts_with(&form))
                .cloned()
                .collect();
            if !previous.is_empty() {
                info!(
                    "Found {} previous test results for {}",
                    previous.len(),
                    node.shortname()
                );
                node.inner().results.extend(previous);
            }
        }
        // Record where each required state will be obtained from. Only the
        // owning worker's perspective matters, it is the one that will run.
        let own_node = node.objects.first().map(|net| net.suffix == worker.id) == Some(true);
        if own_node && node.inner().pulled_locations.insert(worker.id.clone()) {
            self.pool
                .pull_locations(node, worker, &self.graph.workers)
                .await?;
        }

        if self.should_run(node, worker).await? {
            let ok = if node.is_object_root() {
                self.traverse_terminal_node(node, worker).await?
            } else {
                info!("Worker {} running the test node {}", worker.id, node.shortname());
                run_test_node(self.runner.as_ref(), node, true).await?
            };
            if !ok {
                error!(
                    "Worker {} got nonzero status from the test {}",
                    worker.id,
                    node.shortname()
                );
                if node.param("abort_on_error").as_deref() == Some("yes") {
                    node.release();
                    bail!(
                        "aborting worker {} on error from {}",
                        worker.id,
                        node.shortname()
                    );
                }
            }
            // If a state was set it is final, else the retrieved one stands.
            let params = node.params();
            for object in &node.objects {
                let object_params = object.object_typed_params(&params);
                let state = object_params
                    .get("set_state")
                    .or_else(|| object_params.get("get_state"));
                if let Some(state) = state.filter(|s| !s.is_empty()) {
                    object.set_current_state(state);
                    debug!("{object} now at state {:?}", object.current_state());
                }
            }
            node.finish(&worker.id);
        } else {
            debug!(
                "Worker {} skipping test {} as it should not run",
                worker.id,
                node.shortname()
            );
            // Only a skip of the worker's own node means "satisfied for me";
            // passing through another worker's subgraph proves nothing.
            if own_node {
                node.inner()
                    .shared_finished_workers
                    .insert(worker.id.clone());
            }
            node.release();
        }
        Ok(())
    }

    // An object root is "install/create this vm from scratch": a two-test
    // sequence of a preparation node followed by the actual install node.
    async fn traverse_terminal_node(
        &self,
        node: &Arc<TestNode>,
        worker: &TestWorker,
    ) -> anyhow::Result<bool> {
        let object = node
            .terminal_object()
            .context("object root without its terminal object")?;
        if object.permanent && node.param("create_permanent_vm").as_deref() != Some("yes") {
            return Err(TraversalError::PermanentRootMisconfigured {
                suffix: object.suffix.clone(),
            }
            .into());
        }

        info!(
            "Configuring creation/installation for {} on {}",
            worker.id, object.long_suffix
        );
        let mut setup_params = node.params();
        for (k, v) in &self.params {
            setup_params.insert(k.clone(), v.clone());
        }
        let vms = node.param("vms").unwrap_or_default();
        let noop_name = format!("internal.stateless.noop.{}", vms.replace(' ', "."));
        setup_params.insert("name".to_owned(), format!("{noop_name}.{}", worker.id));
        setup_params.insert("shortname".to_owned(), noop_name);
        setup_params.insert("type".to_owned(), "shared_configure_install".to_owned());
        // Explicit root handling, overwriting params inherited from the
        // modified install node.
        setup_params.insert("check_mode".to_owned(), "rr".to_owned());
        setup_params.insert(
            format!("set_state_{}", object.state_suffixes()),
            "root".to_owned(),
        );
        setup_params.insert("start_vm".to_owned(), "no".to_owned());

        let mut pre_node = TestNode::new("0", node.set.clone(), setup_params);
        pre_node.set_objects_from_net(node.objects[0].clone());
        let pre_node = Arc::new(pre_node);
        pre_node.try_occupy(&worker.id);
        if !run_test_node(self.runner.as_ref(), &pre_node, true).await? {
            error!(
                "Could not configure the installation for {} on {}",
                worker.id, object.long_suffix
            );
            return Ok(false);
        }

        info!("Installing virtual machine {}", object.long_suffix);
        if let Some(install_type) = node.param("configure_install") {
            node.set_param("type", &install_type);
        }
        run_test_node(self.runner.as_ref(), node, true).await
    }

    // Reverse a node: clean up or pool-sync the states it created. Cleanup
    // reports failures and proceeds, it never takes the traversal down.
    async fn reverse_node(&self, node: &Arc<TestNode>, worker: &TestWorker) {
        if !node.try_occupy(&worker.id) {
            return;
        }
        if self.should_clean(node, worker) {
            let params = node.params();
            let mut any_nonforced = false;
            for object in node.stateful_objects() {
                let object_params = object.object_typed_params(&params);
                let state = object_params.get_str("set_state", "");
                let unset_mode = object_params.get_str("unset_mode", "ri");
                if unset_mode.starts_with('f') {
                    info!(
                        "Worker {} force-removing state {state:?} of {object}",
                        worker.id
                    );
                    let location = StatePool::worker_location(worker);
                    self.pool
                        .backend
                        .unset(&object.id(), &state, &location)
                        .await
                        .or_log_error("state cleanup failed");
                } else {
                    any_nonforced = true;
                }
            }
            if any_nonforced {
                self.pool
                    .sync_to_pool(node, worker)
                    .await
                    .or_log_error("state pool sync failed");
            }
        } else {
            debug!(
                "Worker {} should not clean up {}",
                worker.id,
                node.shortname()
            );
        }
        node.release();
    }

    fn dump_step(&self, worker: &WorkerId, step: u64) {
        if let Some(dir) = &self.dump_dir {
            if log::log_enabled!(log::Level::Debug) {
                self.graph
                    .visualize(dir, &format!("{step:06}_{worker}"))
                    .or_log_error("graph visualization failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::node::TestStatus;
    use crate::runner::test_utils::MockRunner;
    use crate::states::test_utils::MockBackend;
    use crate::states::StatePool;
    use crate::test_utils::{graph_with_pool, graph_with_workers, restr};

    fn traverser(
        graph: TestGraph,
        runner: MockRunner,
        backend: MockBackend,
    ) -> (Arc<Traverser>, Arc<MockRunner>, Arc<MockBackend>) {
        let runner = Arc::new(runner);
        let backend = Arc::new(backend);
        let shared_pool = graph.suite.shared_pool.clone();
        let pool = Arc::new(StatePool::new(backend.clone(), shared_pool));
        let traverser = Arc::new(Traverser::new(
            Arc::new(graph),
            runner.clone(),
            pool,
            Params::new(),
        ));
        (traverser, runner, backend)
    }

    async fn run_single(traverser: &Arc<Traverser>) {
        let worker = traverser.graph.workers[0].clone();
        traverser.traverse_object_trees(worker).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_leaf_no_cached_state() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only tutorial1"), false)
            .unwrap();
        let (traverser, runner, _backend) = traverser(graph, MockRunner::default(), MockBackend::default());
        run_single(&traverser).await;
        assert_eq!(
            runner.shortnames(),
            vec![
                "internal.stateless.noop.vm1",
                "internal.automated.install.vm1",
                "internal.automated.customize.vm1",
                "internal.automated.on_customize.vm1",
                "normal.quicktest.tutorial1.vm1",
            ]
        );
    }

    #[tokio::test]
    async fn test_one_leaf_cached_install() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only tutorial1"), false)
            .unwrap();
        let backend = MockBackend::with_states(&[(
            "image1_vm1-CentOS.8",
            "install",
            "net1:images",
        )]);
        let (traverser, runner, _backend) = traverser(graph, MockRunner::default(), backend);
        run_single(&traverser).await;
        assert_eq!(
            runner.shortnames(),
            vec![
                "internal.automated.customize.vm1",
                "internal.automated.on_customize.vm1",
                "normal.quicktest.tutorial1.vm1",
            ]
        );
    }

    #[tokio::test]
    async fn test_one_leaf_cached_customize() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only tutorial1"), false)
            .unwrap();
        // The cached customize state skips only its own node: install re-runs
        // since its own state is nowhere to be found.
        let backend = MockBackend::with_states(&[(
            "image1_vm1-CentOS.8",
            "customize",
            "net1:images",
        )]);
        let (traverser, runner, _backend) = traverser(graph, MockRunner::default(), backend);
        run_single(&traverser).await;
        assert_eq!(
            runner.shortnames(),
            vec![
                "internal.stateless.noop.vm1",
                "internal.automated.install.vm1",
                "internal.automated.on_customize.vm1",
                "normal.quicktest.tutorial1.vm1",
            ]
        );
    }

    #[tokio::test]
    async fn test_two_objects_concatenated_chains() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only tutorial3"), false)
            .unwrap();
        let (traverser, runner, _backend) = traverser(graph, MockRunner::default(), MockBackend::default());
        run_single(&traverser).await;
        assert_eq!(
            runner.shortnames(),
            vec![
                "internal.stateless.noop.vm1",
                "internal.automated.install.vm1",
                "internal.automated.customize.vm1",
                "internal.automated.on_customize.vm1",
                "internal.stateless.noop.vm2",
                "internal.automated.install.vm2",
                "internal.automated.customize.vm2",
                "internal.automated.connect.vm2",
                "normal.tutorial3.vm1.vm2",
            ]
        );
    }

    #[tokio::test]
    async fn test_diverging_workers_reuse_pool_states() {
        let graph = graph_with_pool(2, "/mnt/shared/pool");
        graph
            .parse_object_trees(&restr("only tutorial1"), false)
            .unwrap();
        // Image states cached in the shared pool: nobody installs anything,
        // but vm states are worker-local so each worker runs on_customize.
        let backend = MockBackend::with_states(&[
            ("image1_vm1-CentOS.8", "install", ":/mnt/shared/pool"),
            ("image1_vm1-CentOS.8", "customize", ":/mnt/shared/pool"),
        ]);
        let (traverser, runner, backend) = traverser(graph, MockRunner::default(), backend);
        let w1 = traverser.graph.workers[0].clone();
        let w2 = traverser.graph.workers[1].clone();
        let (r1, r2) = tokio::join!(
            traverser.traverse_object_trees(w1),
            traverser.traverse_object_trees(w2),
        );
        r1.unwrap();
        r2.unwrap();

        let names = runner.shortnames();
        let count = |name: &str| names.iter().filter(|n| *n == name).count();
        // One on_customize per worker, the leaf exactly once, no installs.
        assert_eq!(count("internal.automated.on_customize.vm1"), 2, "{names:?}");
        assert_eq!(count("normal.quicktest.tutorial1.vm1"), 1, "{names:?}");
        assert_eq!(count("internal.automated.install.vm1"), 0, "{names:?}");
        assert_eq!(count("internal.automated.customize.vm1"), 0, "{names:?}");
        assert_eq!(count("internal.stateless.noop.vm1"), 0, "{names:?}");
        // The pool was only ever read, never written to or cleaned.
        assert_eq!(backend.calls_of("set").len(), 0);
        assert_eq!(backend.calls_of("unset").len(), 0);
    }

    #[tokio::test]
    async fn test_prior_results_skip_leaf() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only tutorial1"), false)
            .unwrap();
        let backend = MockBackend::with_states(&[
            ("image1_vm1-CentOS.8", "install", "net1:images"),
            ("image1_vm1-CentOS.8", "customize", "net1:images"),
            ("vm1-CentOS.8", "on_customize", "net1:images"),
        ]);
        let (mut traverser, runner) = {
            let (t, r, _b) = traverser(graph, MockRunner::default(), backend);
            (Arc::try_unwrap(t).ok().expect("sole owner"), r)
        };
        traverser.prior_results = vec![TestResult {
            uid: "1-net1".to_owned(),
            name: "normal.quicktest.tutorial1.vm1.CentOS.8.net1".to_owned(),
            status: TestStatus::Pass,
            logdir: None,
        }];
        let traverser = Arc::new(traverser);
        run_single(&traverser).await;
        // Every setup state cached and the leaf already passed before: a
        // whole lot of nothing to execute.
        assert_eq!(runner.shortnames(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_fan_in_clones_both_run() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only tutorial_get"), false)
            .unwrap();
        let (traverser, runner, _backend) = traverser(graph, MockRunner::default(), MockBackend::default());
        run_single(&traverser).await;
        let names = runner.shortnames();
        let count = |name: &str| names.iter().filter(|n| *n == name).count();
        // Both guisetup variants run, each followed by its own pinned clone
        // of the leaf; the shared setup chain runs once.
        assert_eq!(count("internal.automated.guisetup.noop.vm2"), 1, "{names:?}");
        assert_eq!(count("internal.automated.guisetup.clicked.vm2"), 1, "{names:?}");
        assert_eq!(count("normal.tutorial_get.guisetup.noop.vm2"), 1, "{names:?}");
        assert_eq!(count("normal.tutorial_get.guisetup.clicked.vm2"), 1, "{names:?}");
        assert_eq!(count("internal.automated.customize.vm2"), 1, "{names:?}");
        assert_eq!(count("internal.automated.install.vm2"), 1, "{names:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_on_occupied_fails_worker() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only tutorial1"), true)
            .unwrap();
        // Some absent worker holds the leaf's whole setup chain hostage.
        for node in graph.nodes() {
            if !node.is_flat() && !node.is_shared_root() {
                assert!(node.try_occupy("net9"));
            }
        }
        let (traverser, _runner, _backend) = traverser(graph, MockRunner::default(), MockBackend::default());
        let worker = traverser.graph.workers[0].clone();
        let err = traverser
            .traverse_object_trees(worker)
            .await
            .expect_err("worker should give up on the occupied graph");
        assert!(
            err.to_string().contains("waiting for occupied nodes"),
            "unexpected error: {err:#}"
        );
    }

    #[tokio::test]
    async fn test_abort_on_error_escalates() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only tutorial1"), false)
            .unwrap();
        let runner = MockRunner::with_statuses(&[(
            "internal.automated.customize.vm1",
            vec![TestStatus::Error],
        )]);
        let (traverser, _runner, _backend) = traverser(graph, runner, MockBackend::default());
        // Make the failing node abort-worthy.
        let worker = traverser.graph.workers[0].clone();
        traverser
            .graph
            .unroll_flat_node(&traverser.graph.nodes()[0], &worker)
            .unwrap();
        let customize = traverser
            .graph
            .node_by_name("internal.automated.customize.vm1.CentOS.8.net1")
            .unwrap();
        customize.set_param("abort_on_error", "yes");
        let err = traverser
            .traverse_object_trees(worker)
            .await
            .expect_err("abort_on_error should fail the worker");
        assert!(
            err.to_string().contains("aborting worker"),
            "unexpected error: {err:#}"
        );
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_traversal() {
        let graph = graph_with_workers(1, None);
        graph
            .parse_object_trees(&restr("only quicktest"), false)
            .unwrap();
        // tutorial1 fails, tutorial2 still runs.
        let runner = MockRunner::with_statuses(&[(
            "normal.quicktest.tutorial1.vm1",
            vec![TestStatus::Fail],
        )]);
        let (traverser, runner, _backend) = traverser(graph, runner, MockBackend::default());
        run_single(&traverser).await;
        let names = runner.shortnames();
        assert!(
            names.contains(&"normal.quicktest.tutorial2.vm1".to_owned()),
            "{names:?}"
        );
    }
}
