use core::fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::hash::Hash as _;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::config::{RetryStop, TestSet};
use crate::object::{ObjectKind, TestObject};
use crate::restriction::Params;
use crate::util::DigestHasher;

pub type NodeId = usize;

// Worker identity is its net suffix, e.g. "net1".
pub type WorkerId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Warn,
    Fail,
    Error,
    Skip,
    Interrupted,
    Cancel,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Skip => "SKIP",
            Self::Interrupted => "INTERRUPTED",
            Self::Cancel => "CANCEL",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Pass | Self::Warn | Self::Skip)
    }

    // Statuses that make a retry meaningful at all.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Pass | Self::Warn | Self::Fail | Self::Error)
    }

    // Whether a retry_stop policy short-circuits on this status.
    pub fn stops(&self, stop: RetryStop) -> bool {
        match stop {
            RetryStop::None => false,
            RetryStop::Pass => matches!(self, Self::Pass),
            RetryStop::Warn => matches!(self, Self::Warn),
            RetryStop::Fail => matches!(self, Self::Fail),
            RetryStop::Error => matches!(self, Self::Error),
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Self::Pass),
            "WARN" => Ok(Self::Warn),
            "FAIL" => Ok(Self::Fail),
            "ERROR" => Ok(Self::Error),
            "SKIP" => Ok(Self::Skip),
            "INTERRUPTED" => Ok(Self::Interrupted),
            "CANCEL" => Ok(Self::Cancel),
            _ => anyhow::bail!("unknown test status {s:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    // Prefix-derived uid the run was reported under (retries append "r<k>").
    pub uid: String,
    // Full node name at the time of running.
    pub name: String,
    pub status: TestStatus,
    pub logdir: Option<PathBuf>,
}

// Per-node mutable state, guarded by one short-lived lock. The occupancy
// field doubles as the inter-worker "lock": it is just data here, workers
// back off instead of blocking on it.
#[derive(Debug, Default)]
pub struct NodeInner {
    // Edges to parents/children with the component objects (by long suffix)
    // that induced each edge. An edge may be induced by several objects.
    pub setup_nodes: BTreeMap<NodeId, Vec<String>>,
    pub cleanup_nodes: BTreeMap<NodeId, Vec<String>>,
    // Per-worker consumed edges; a consumed edge is gone for that worker but
    // still visible to everyone else.
    pub dropped_setup: BTreeMap<WorkerId, BTreeSet<NodeId>>,
    pub dropped_cleanup: BTreeMap<WorkerId, BTreeSet<NodeId>>,
    // Equivalence links to the same node in other workers' subgraphs.
    pub bridged_nodes: BTreeSet<NodeId>,
    // Clones produced from this node by branch duplication.
    pub cloned_nodes: Vec<NodeId>,
    pub started_worker: Option<WorkerId>,
    pub finished_workers: BTreeSet<WorkerId>,
    // Workers for which this node counts as done without having run it
    // themselves (bridged completion or pool-provided states).
    pub shared_finished_workers: BTreeSet<WorkerId>,
    pub incompatible_workers: BTreeSet<WorkerId>,
    // Workers that have unrolled this flat node into composites already.
    pub unrolled_for: BTreeSet<WorkerId>,
    // Manual-policy overrides from the flagging tools; None means derive the
    // decision from state availability when the node is reached.
    pub should_run_override: Option<bool>,
    pub should_clean_override: Option<bool>,
    // Workers whose state-location scan already ran for this node.
    pub pulled_locations: BTreeSet<WorkerId>,
    pub results: Vec<TestResult>,
}

// A runnable test bound to a tuple of objects: a vertex in the dependency
// DAG. The first object is always the worker-level net, followed by its vms
// and their images. Flat nodes (not yet bound to a net) have no objects.
pub struct TestNode {
    pub id: NodeId,
    pub prefix: String,
    pub set: Option<Arc<TestSet>>,
    pub objects: Vec<Arc<TestObject>>,
    params: Mutex<Params>,
    inner: Mutex<NodeInner>,
}

impl Debug for TestNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[node] id='{}', name='{}'", self.node_id(), self.name())
    }
}

impl TestNode {
    pub fn new(prefix: &str, set: Option<Arc<TestSet>>, params: Params) -> Self {
        Self {
            id: NodeId::MAX, // assigned when inserted into a graph
            prefix: prefix.to_owned(),
            set,
            objects: Vec::new(),
            params: Mutex::new(params),
            inner: Mutex::new(NodeInner::default()),
        }
    }

    // Bind the node to a composite net, flattening the composition into the
    // canonical object list: net first, then each vm followed by its images.
    pub fn set_objects_from_net(&mut self, net: Arc<TestObject>) {
        assert!(
            net.kind == ObjectKind::Net,
            "test nodes are composed only from net-level objects"
        );
        let mut objects = vec![net.clone()];
        for vm in &net.components {
            objects.push(vm.clone());
            objects.extend(vm.components.iter().cloned());
        }
        self.objects = objects;
    }

    pub fn inner(&self) -> MutexGuard<'_, NodeInner> {
        self.inner.lock()
    }

    pub fn params(&self) -> Params {
        self.params.lock().clone()
    }

    pub fn param(&self, key: &str) -> Option<String> {
        self.params.lock().get(key).cloned()
    }

    pub fn set_param(&self, key: &str, value: &str) {
        self.params.lock().insert(key.to_owned(), value.to_owned());
    }

    pub fn name(&self) -> String {
        self.param("name").unwrap_or_default()
    }

    pub fn shortname(&self) -> String {
        self.param("shortname").unwrap_or_default()
    }

    // Sufficiently unique ID within a graph.
    pub fn node_id(&self) -> String {
        let vms = self.param("vms").unwrap_or_default().replace(' ', "");
        format!("{}-{}", self.prefix, vms)
    }

    // Long form used for persisted run/clean decisions: stable across runs
    // of the same suite, distinct across worker subgraphs.
    pub fn long_prefix(&self) -> String {
        match self.objects.first() {
            Some(net) => format!("{}-{}", self.prefix, net.suffix),
            None => self.prefix.clone(),
        }
    }

    // Content fingerprint of the node's parameter dictionary.
    pub fn fingerprint(&self) -> String {
        let mut hasher = DigestHasher {
            digest: Sha3_256::new(),
        };
        self.params.lock().hash(&mut hasher);
        hex::encode(hasher.digest.finalize())
    }

    // The node's identity modulo worker: its name with the trailing net
    // suffix removed. Two nodes in different workers' subgraphs bridge when
    // these match.
    pub fn bridged_form(&self) -> String {
        let name = self.name();
        match self.objects.first() {
            Some(net) => name
                .strip_suffix(&format!(".{}", net.suffix))
                .unwrap_or(&name)
                .to_owned(),
            None => name,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.objects.is_empty() && !self.is_shared_root()
    }

    pub fn is_shared_root(&self) -> bool {
        self.param("shared_root").as_deref() == Some("yes")
    }

    pub fn is_object_root(&self) -> bool {
        self.param("object_root").is_some()
    }

    // Any object that this node is the install-from-scratch root of.
    pub fn terminal_object(&self) -> Option<Arc<TestObject>> {
        let object_root = self.param("object_root")?;
        self.objects.iter().find(|o| o.id() == object_root).cloned()
    }

    pub fn is_occupied_by_other(&self, worker: &str) -> bool {
        self.inner
            .lock()
            .started_worker
            .as_deref()
            .is_some_and(|w| w != worker)
    }

    // Claim the single-slot occupancy field. Returns false when some other
    // worker already holds the node.
    pub fn try_occupy(&self, worker: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.started_worker.as_deref() {
            Some(w) if w != worker => false,
            _ => {
                inner.started_worker = Some(worker.to_owned());
                true
            }
        }
    }

    pub fn finish(&self, worker: &str) {
        let mut inner = self.inner.lock();
        inner.finished_workers.insert(worker.to_owned());
        inner.started_worker = None;
    }

    pub fn release(&self) {
        self.inner.lock().started_worker = None;
    }

    pub fn is_finished_by_any(&self) -> bool {
        !self.inner.lock().finished_workers.is_empty()
    }

    // No remaining unconsumed parents for this worker.
    pub fn is_setup_ready(&self, worker: &str) -> bool {
        let inner = self.inner.lock();
        let dropped = inner.dropped_setup.get(worker);
        inner
            .setup_nodes
            .keys()
            .all(|id| dropped.is_some_and(|d| d.contains(id)))
    }

    // No remaining unconsumed children for this worker.
    pub fn is_cleanup_ready(&self, worker: &str) -> bool {
        let inner = self.inner.lock();
        let dropped = inner.dropped_cleanup.get(worker);
        inner
            .cleanup_nodes
            .keys()
            .all(|id| dropped.is_some_and(|d| d.contains(id)))
    }

    pub fn is_unrolled(&self, worker: &str) -> bool {
        self.inner.lock().unrolled_for.contains(worker)
    }

    pub fn retry_attempts(&self) -> u64 {
        self.set.as_ref().map(|s| s.retry_attempts).unwrap_or(0)
    }

    pub fn retry_stop(&self) -> RetryStop {
        self.set
            .as_ref()
            .map(|s| s.retry_stop)
            .unwrap_or(RetryStop::None)
    }

    // Objects of this node that produce a state when it runs.
    pub fn stateful_objects(&self) -> Vec<Arc<TestObject>> {
        let params = self.params();
        self.objects
            .iter()
            .filter(|o| {
                let object_params = o.object_typed_params(&params);
                object_params
                    .get("set_state")
                    .is_some_and(|s| !s.is_empty())
            })
            .cloned()
            .collect()
    }

    // Validate sane attribute-parameter correspondence; a node violating
    // these is a graph construction bug.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.is_flat() || self.is_shared_root() {
            return Ok(());
        }
        let nets: Vec<_> = self
            .objects
            .iter()
            .filter(|o| o.kind == ObjectKind::Net)
            .collect();
        anyhow::ensure!(
            nets.len() == 1,
            "test node {:?} must have exactly one net, found {}",
            self.shortname(),
            nets.len()
        );
        anyhow::ensure!(
            self.objects[0].kind == ObjectKind::Net,
            "the net must be the first object of {:?}",
            self.shortname()
        );
        let param_vms: BTreeSet<String> = self
            .param("vms")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        let attr_vms: BTreeSet<String> = self
            .objects
            .iter()
            .filter(|o| o.kind == ObjectKind::Vm)
            .map(|o| o.suffix.clone())
            .collect();
        anyhow::ensure!(
            param_vms == attr_vms,
            "parametric vms {:?} and attribute vms {:?} differ for {:?}",
            param_vms,
            attr_vms,
            self.shortname()
        );
        let inner = self.inner.lock();
        anyhow::ensure!(
            !inner.setup_nodes.contains_key(&self.id) && !inner.cleanup_nodes.contains_key(&self.id),
            "reflexive dependency of {:?} to itself",
            self.shortname()
        );
        Ok(())
    }
}

// Advisory ordering between node prefixes: numeric leaf ordinals first, then
// the appended letters with parents ("a") ahead and cleanups ("c") behind,
// recursing into the remainder. This only drives tie-breaks in parent/child
// selection, never correctness.
pub fn comes_before(prefix1: &str, prefix2: &str) -> bool {
    fn split(part: &str) -> (Option<u64>, Option<char>, &str) {
        let digits_len = part.chars().take_while(|c| c.is_ascii_digit()).count();
        let digits = part[..digits_len].parse().ok();
        let mut chars = part[digits_len..].chars();
        (digits, chars.next(), chars.as_str())
    }

    fn compare_part(c1: &str, c2: &str) -> bool {
        let (d1, l1, r1) = split(c1);
        let (d2, l2, r2) = split(c2);
        match (d1, d2) {
            (Some(d1), Some(d2)) if d1 != d2 => return d1 < d2,
            (Some(_), Some(_)) => {}
            // Non-numeric lead, nothing smarter to do than lexicographic.
            _ => return c1 < c2,
        }
        if l1 != l2 {
            match (l1, l2) {
                (Some('a'), _) => true,
                (_, Some('a')) => false,
                (None, _) => true,
                (_, None) => false,
                (Some(l1), Some(l2)) => l1 < l2,
            }
        } else {
            compare_part(r1, r2)
        }
    }
    compare_part(prefix1, prefix2)
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("1", "2", true; "plain ordinals")]
    #[test_case("2", "1", false; "plain ordinals reversed")]
    #[test_case("1a", "1", true; "parent before its leaf")]
    #[test_case("1", "1a", false; "leaf after its parent")]
    #[test_case("1a", "1b1", true; "parent before bridged twin")]
    #[test_case("1c", "1", false; "cleanup after its leaf")]
    #[test_case("1a1", "1a2", true; "recursion into remainder")]
    #[test_case("2a", "10a", true; "numeric not lexicographic")]
    #[test_case("1d0", "1d1", true; "clone ordinals")]
    fn test_comes_before(p1: &str, p2: &str, want: bool) {
        assert_eq!(comes_before(p1, p2), want, "{p1} vs {p2}");
    }

    fn node_with_params(pairs: &[(&str, &str)]) -> TestNode {
        let params = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TestNode::new("1", None, params)
    }

    #[googletest::test]
    fn test_node_id_includes_vms() {
        let node = node_with_params(&[("vms", "vm1 vm2")]);
        assert_that!(node.node_id(), eq("1-vm1vm2"));
    }

    #[googletest::test]
    fn test_occupancy_single_slot() {
        let node = node_with_params(&[]);
        assert_that!(node.try_occupy("net1"), eq(true));
        // Re-claiming by the same worker is fine, it is a slot not a count.
        assert_that!(node.try_occupy("net1"), eq(true));
        assert_that!(node.try_occupy("net2"), eq(false));
        assert_that!(node.is_occupied_by_other("net2"), eq(true));
        node.finish("net1");
        assert_that!(node.try_occupy("net2"), eq(true));
        expect_that!(node.is_finished_by_any(), eq(true));
    }

    #[googletest::test]
    fn test_per_worker_edge_consumption() {
        let node = node_with_params(&[]);
        {
            let mut inner = node.inner();
            inner.setup_nodes.insert(7, vec!["vm1".to_owned()]);
        }
        assert_that!(node.is_setup_ready("net1"), eq(false));
        node.inner()
            .dropped_setup
            .entry("net1".to_owned())
            .or_default()
            .insert(7);
        assert_that!(node.is_setup_ready("net1"), eq(true));
        // net2 still sees the edge.
        assert_that!(node.is_setup_ready("net2"), eq(false));
    }

    #[googletest::test]
    fn test_fingerprint_tracks_params() {
        let node = node_with_params(&[("name", "a.b.vm1")]);
        let before = node.fingerprint();
        assert_that!(node.fingerprint(), eq(&before.clone()));
        node.set_param("get_state_vms_vm1", "customize");
        expect_that!(node.fingerprint(), not(eq(&before)));
    }

    #[googletest::test]
    fn test_status_round_trip() {
        for status in [
            TestStatus::Pass,
            TestStatus::Warn,
            TestStatus::Fail,
            TestStatus::Error,
            TestStatus::Skip,
            TestStatus::Interrupted,
            TestStatus::Cancel,
        ] {
            assert_that!(status.as_str().parse::<TestStatus>().unwrap(), eq(status));
        }
        expect_that!("BOGUS".parse::<TestStatus>(), err(anything()));
    }

    #[googletest::test]
    fn test_retry_stop_matching() {
        expect_that!(TestStatus::Pass.stops(RetryStop::Pass), eq(true));
        expect_that!(TestStatus::Warn.stops(RetryStop::Pass), eq(false));
        expect_that!(TestStatus::Error.stops(RetryStop::Error), eq(true));
        expect_that!(TestStatus::Fail.stops(RetryStop::None), eq(false));
        expect_that!(TestStatus::Skip.is_retriable(), eq(false));
    }
}
