use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use itertools::Itertools as _;
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use regex::Regex;

use crate::config::{StateScope, SuiteConfig, TestSet};
use crate::errors::TraversalError;
use crate::node::{comes_before, NodeId, TestNode};
use crate::object::{parse_composite_net, parse_full_vm, ObjectKind, TestObject};
use crate::restriction::{Params, ParamsExt as _, Restriction};
use crate::worker::{parse_workers, TestSwarm, TestWorker};

// The shared dependency graph of test nodes over test objects. Workers
// traverse it concurrently; all growth is additive (nodes are never deleted
// during a run, completion is per-worker bookkeeping on the nodes).
pub struct TestGraph {
    pub suite: Arc<SuiteConfig>,
    pub workers: Vec<Arc<TestWorker>>,
    pub swarms: BTreeMap<String, TestSwarm>,
    // User-level object restrictions per vm suffix.
    pub restrs: BTreeMap<String, Restriction>,
    nodes: RwLock<Vec<Arc<TestNode>>>,
    // Full node name -> id; names are unique within a graph.
    name_index: RwLock<BTreeMap<String, NodeId>>,
    // Prefix -> ids; prefixes repeat across vm tuples, hence the Vec. The
    // BTreeMap doubles as the prefix-trie for range lookups.
    prefix_index: RwLock<BTreeMap<String, Vec<NodeId>>>,
    objects: RwLock<BTreeMap<String, Arc<TestObject>>>,
    root: RwLock<Option<NodeId>>,
    // Serializes dynamic graph expansion; traversal bookkeeping does not
    // take this.
    parse_lock: Mutex<()>,
}

impl TestGraph {
    pub fn new(
        suite: Arc<SuiteConfig>,
        restrs: BTreeMap<String, Restriction>,
        params: &Params,
    ) -> anyhow::Result<Self> {
        let (workers, swarms) = parse_workers(&suite, params)?;
        Ok(Self {
            suite,
            workers,
            swarms,
            restrs,
            nodes: RwLock::new(Vec::new()),
            name_index: RwLock::new(BTreeMap::new()),
            prefix_index: RwLock::new(BTreeMap::new()),
            objects: RwLock::new(BTreeMap::new()),
            root: RwLock::new(None),
            parse_lock: Mutex::new(()),
        })
    }

    /* registry */

    pub fn node(&self, id: NodeId) -> Arc<TestNode> {
        self.nodes.read()[id].clone()
    }

    pub fn nodes(&self) -> Vec<Arc<TestNode>> {
        self.nodes.read().clone()
    }

    pub fn root(&self) -> Arc<TestNode> {
        let id = self.root.read().expect("graph has no shared root yet");
        self.node(id)
    }

    fn insert_node(&self, mut node: TestNode) -> Arc<TestNode> {
        let mut nodes = self.nodes.write();
        node.id = nodes.len();
        let node = Arc::new(node);
        nodes.push(node.clone());
        self.name_index.write().insert(node.name(), node.id);
        self.prefix_index
            .write()
            .entry(node.prefix.clone())
            .or_default()
            .push(node.id);
        node
    }

    pub fn node_by_name(&self, name: &str) -> Option<Arc<TestNode>> {
        let id = *self.name_index.read().get(name)?;
        Some(self.node(id))
    }

    pub fn nodes_by_bridged_form(&self, form: &str) -> Vec<Arc<TestNode>> {
        self.nodes()
            .into_iter()
            .filter(|n| !n.is_flat() && !n.is_shared_root() && n.bridged_form() == form)
            .collect()
    }

    // All nodes whose prefix starts with the given one, via the index.
    pub fn nodes_by_prefix(&self, prefix: &str) -> Vec<Arc<TestNode>> {
        let index = self.prefix_index.read();
        index
            .range(prefix.to_owned()..)
            .take_while(|(p, _)| p.starts_with(prefix))
            .flat_map(|(_, ids)| ids.iter().map(|id| self.node(*id)))
            .collect()
    }

    pub fn objects(&self) -> Vec<Arc<TestObject>> {
        self.objects.read().values().cloned().collect()
    }

    fn get_or_create_vm(&self, suffix: &str, variant: &str) -> anyhow::Result<Arc<TestObject>> {
        let key = format!("{suffix}-{variant}");
        if let Some(vm) = self.objects.read().get(&key) {
            return Ok(vm.clone());
        }
        let vm = parse_full_vm(&self.suite, suffix, variant)?;
        let mut objects = self.objects.write();
        let vm = objects.entry(key).or_insert(vm).clone();
        for image in &vm.components {
            objects.insert(image.id(), image.clone());
        }
        Ok(vm)
    }

    fn get_or_create_net(
        &self,
        net_suffix: &str,
        vms: &[Arc<TestObject>],
    ) -> Result<Arc<TestObject>, TraversalError> {
        let variant = vms
            .iter()
            .map(|vm| format!("{}.{}", vm.suffix, vm.variant))
            .join(".");
        let key = format!("{net_suffix}-{variant}");
        if let Some(net) = self.objects.read().get(&key) {
            return Ok(net.clone());
        }
        let net = parse_composite_net(&self.suite, net_suffix, vms)?;
        Ok(self.objects.write().entry(key).or_insert(net).clone())
    }

    /* edges */

    // Add a setup edge child -> parent induced by the given component; the
    // reciprocal cleanup edge is always kept in sync.
    pub fn descend_from(&self, child: &TestNode, parent: &TestNode, component: &str) {
        assert_ne!(child.id, parent.id, "a node cannot descend from itself");
        {
            let mut inner = child.inner();
            let comps = inner.setup_nodes.entry(parent.id).or_default();
            if !comps.iter().any(|c| c == component) {
                comps.push(component.to_owned());
            }
        }
        let mut inner = parent.inner();
        let comps = inner.cleanup_nodes.entry(child.id).or_default();
        if !comps.iter().any(|c| c == component) {
            comps.push(component.to_owned());
        }
    }

    // Whether the child already has a setup edge induced by this object.
    fn has_dependency(&self, child: &TestNode, object: &TestObject) -> bool {
        child
            .inner()
            .setup_nodes
            .values()
            .any(|comps| comps.iter().any(|c| *c == object.long_suffix))
    }

    // Whether an edge's inducing components carry states that could reach
    // another worker at all. Vm states never leave the environment that made
    // them, so their edges must be consumed by each worker on its own.
    fn components_transferable(child: &TestNode, comps: &[String]) -> bool {
        comps.iter().all(|comp| {
            child
                .objects
                .iter()
                .find(|o| o.long_suffix == *comp)
                .map(|o| o.kind != ObjectKind::Vm)
                .unwrap_or(true)
        })
    }

    // Consume the child -> parent edge for one worker, replicating the
    // consumption over the child's whole bridge equivalence class so that
    // parallel workers observe the same completion. Replication only applies
    // to completion that actually transfers: a parent somebody really
    // finished (or this worker saw satisfied), over an edge whose states are
    // not worker-local.
    pub fn drop_parent(&self, child: &TestNode, parent: &TestNode, worker: &str) {
        let comps = child
            .inner()
            .setup_nodes
            .get(&parent.id)
            .cloned()
            .unwrap_or_default();
        child
            .inner()
            .dropped_setup
            .entry(worker.to_owned())
            .or_default()
            .insert(parent.id);
        let satisfied = parent.is_finished_by_any()
            || parent.inner().shared_finished_workers.contains(worker);
        if !satisfied || !Self::components_transferable(child, &comps) {
            return;
        }
        let parent_form = parent.bridged_form();
        let bridged: Vec<NodeId> = child.inner().bridged_nodes.iter().cloned().collect();
        for peer_id in bridged {
            let peer = self.node(peer_id);
            let peer_parents: Vec<NodeId> = peer.inner().setup_nodes.keys().cloned().collect();
            for pid in peer_parents {
                if self.node(pid).bridged_form() == parent_form {
                    peer.inner()
                        .dropped_setup
                        .entry(worker.to_owned())
                        .or_default()
                        .insert(pid);
                }
            }
        }
    }

    // Consume the parent -> child edge for one worker, bridge-replicated
    // under the same conditions as drop_parent.
    pub fn drop_child(&self, parent: &TestNode, child: &TestNode, worker: &str) {
        let comps = parent
            .inner()
            .cleanup_nodes
            .get(&child.id)
            .cloned()
            .unwrap_or_default();
        parent
            .inner()
            .dropped_cleanup
            .entry(worker.to_owned())
            .or_default()
            .insert(child.id);
        let satisfied = child.is_finished_by_any()
            || child.inner().shared_finished_workers.contains(worker);
        if !satisfied || !Self::components_transferable(child, &comps) {
            return;
        }
        let child_form = child.bridged_form();
        let bridged: Vec<NodeId> = parent.inner().bridged_nodes.iter().cloned().collect();
        for peer_id in bridged {
            let peer = self.node(peer_id);
            let peer_children: Vec<NodeId> = peer.inner().cleanup_nodes.keys().cloned().collect();
            for cid in peer_children {
                if self.node(cid).bridged_form() == child_form {
                    peer.inner()
                        .dropped_cleanup
                        .entry(worker.to_owned())
                        .or_default()
                        .insert(cid);
                }
            }
        }
    }

    // Symmetrically bridge two nodes, merging their equivalence classes.
    pub fn bridge_nodes(&self, a: &TestNode, b: &TestNode) {
        if a.id == b.id {
            return;
        }
        let mut class: std::collections::BTreeSet<NodeId> = [a.id, b.id].into();
        class.extend(a.inner().bridged_nodes.iter());
        class.extend(b.inner().bridged_nodes.iter());
        for id in &class {
            let member = self.node(*id);
            let mut inner = member.inner();
            inner.bridged_nodes = class.iter().filter(|i| **i != *id).cloned().collect();
        }
    }

    fn bridge_matching(&self, node: &TestNode) {
        for peer in self.nodes_by_bridged_form(&node.bridged_form()) {
            if peer.id != node.id {
                self.bridge_nodes(node, &peer);
            }
        }
    }

    // The ordering tie-break for traversal: the "smallest" unconsumed parent
    // or child edge of a node for a worker.
    pub fn pick_parent(&self, node: &TestNode, worker: &str) -> Option<Arc<TestNode>> {
        let inner = node.inner();
        let dropped = inner.dropped_setup.get(worker);
        let ids: Vec<NodeId> = inner
            .setup_nodes
            .keys()
            .filter(|id| !dropped.is_some_and(|d| d.contains(id)))
            .cloned()
            .collect();
        drop(inner);
        self.pick_by_prefix(ids)
    }

    pub fn pick_child(&self, node: &TestNode, worker: &str) -> Option<Arc<TestNode>> {
        let inner = node.inner();
        let dropped = inner.dropped_cleanup.get(worker);
        let ids: Vec<NodeId> = inner
            .cleanup_nodes
            .keys()
            .filter(|id| !dropped.is_some_and(|d| d.contains(id)))
            .cloned()
            .collect();
        drop(inner);
        self.pick_by_prefix(ids)
    }

    fn pick_by_prefix(&self, ids: Vec<NodeId>) -> Option<Arc<TestNode>> {
        ids.into_iter().map(|id| self.node(id)).fold(None, |best, node| match best {
            None => Some(node),
            Some(best) => {
                if comes_before(&node.prefix, &best.prefix) {
                    Some(node)
                } else {
                    Some(best)
                }
            }
        })
    }

    /* construction */

    // Parse the flat leaf nodes selected by the user restriction; internal
    // sets are only reachable through dependency resolution.
    pub fn parse_flat_nodes(&self, restriction: &Restriction) -> anyhow::Result<Vec<Arc<TestNode>>> {
        if restriction.is_empty() {
            debug!("No test restriction, selecting every non-internal set");
        }
        let names: Vec<String> = self
            .suite
            .sets
            .iter()
            .filter(|s| !s.is_internal())
            .map(|s| s.full_name())
            .collect();
        let selected = restriction
            .filter(names.iter().map(String::as_str))
            .map_err(anyhow::Error::from)?;
        let mut leaves = Vec::new();
        for (i, name) in selected.iter().enumerate() {
            let set = self
                .suite
                .set_by_full_name(name)
                .expect("selected names come from the suite");
            let params = Params::from([
                ("name".to_owned(), set.full_name()),
                ("shortname".to_owned(), set.full_name()),
                ("vms".to_owned(), set.vms.join(" ")),
            ]);
            let node = TestNode::new(&(i + 1).to_string(), Some(set), params);
            leaves.push(self.insert_node(node));
        }
        Ok(leaves)
    }

    fn composite_name(set: &TestSet, net: &TestObject) -> String {
        format!("{}.{}.{}", set.full_name(), net.variant, net.suffix)
    }

    // The object a state of the given scope lives on, for one vm of a node.
    fn scope_object(vm: &Arc<TestObject>, scope: StateScope) -> Arc<TestObject> {
        match scope {
            StateScope::Vms => vm.clone(),
            StateScope::Images => vm
                .components
                .first()
                .cloned()
                .unwrap_or_else(|| vm.clone()),
        }
    }

    // Build a composite node binding a set to a concrete net.
    fn compose_node(
        &self,
        set: &Arc<TestSet>,
        net: &Arc<TestObject>,
        prefix: &str,
        extra: &Params,
    ) -> anyhow::Result<TestNode> {
        let mut params = set.params.clone();
        for (k, v) in extra {
            params.insert(k.clone(), v.clone());
        }
        params.insert("name".to_owned(), Self::composite_name(set, net));
        params.insert(
            "shortname".to_owned(),
            format!("{}.{}", set.full_name(), set.vms.join(".")),
        );
        params.insert("vms".to_owned(), set.vms.join(" "));
        params.insert("nets".to_owned(), net.suffix.clone());
        params.insert("type".to_owned(), set.test_type.clone());
        params.insert(
            "test_timeout".to_owned(),
            self.suite.test_timeout_for(set).as_secs().to_string(),
        );

        for (suffix, requires) in &set.requires {
            let vm = net
                .components
                .iter()
                .find(|o| o.suffix == *suffix)
                .with_context(|| format!("net {net} misses required vm {suffix:?}"))?;
            let object = Self::scope_object(vm, requires.scope);
            if let Some(get) = &requires.get {
                params.insert(format!("get_{suffix}"), get.clone());
            }
            if let Some(state) = &requires.state {
                params.insert(format!("get_state_{}", object.state_suffixes()), state.clone());
                if state == "root" {
                    params.insert("object_root".to_owned(), object.id());
                }
            }
        }
        for (suffix, provides) in &set.provides {
            let vm = net
                .components
                .iter()
                .find(|o| o.suffix == *suffix)
                .with_context(|| format!("net {net} misses providing vm {suffix:?}"))?;
            let object = Self::scope_object(vm, provides.scope);
            params.insert(
                format!("set_state_{}", object.state_suffixes()),
                provides.state.clone(),
            );
        }
        for vm in &net.components {
            if vm.permanent {
                params.insert(format!("permanent_vm_{}", vm.suffix), "yes".to_owned());
            }
        }

        let mut node = TestNode::new(prefix, Some(set.clone()), params);
        node.set_objects_from_net(net.clone());
        Ok(node)
    }

    // Expand a flat leaf into composite nodes for one worker and resolve the
    // full dependency closure under them. Serves both the eager per-worker
    // parse and the lazy unroll during traversal. Returns all newly parsed
    // nodes.
    pub fn unroll_flat_node(
        &self,
        flat: &Arc<TestNode>,
        worker: &TestWorker,
    ) -> anyhow::Result<Vec<Arc<TestNode>>> {
        let _guard = self.parse_lock.lock();
        if flat.is_unrolled(&worker.id) {
            return Ok(Vec::new());
        }
        flat.inner().unrolled_for.insert(worker.id.clone());
        let set = flat.set.clone().expect("flat nodes carry their set");

        let net_def = &self.suite.nets[&worker.id];
        if !set.vms.iter().all(|s| net_def.vms.contains(s)) {
            debug!(
                "Flat node {} not compatible with worker {}: net does not host all of {:?}",
                flat.shortname(),
                worker.id,
                set.vms
            );
            flat.inner().incompatible_workers.insert(worker.id.clone());
            return Ok(Vec::new());
        }

        // One axis of compatible variants per required vm.
        let mut axes: Vec<Vec<Arc<TestObject>>> = Vec::new();
        for suffix in &set.vms {
            let mut restr = set.restrs.get(suffix).cloned().unwrap_or_default();
            if let Some(user) = self.restrs.get(suffix) {
                restr = restr.and_also(user);
            }
            let variants: Vec<&String> = self.suite.vms[suffix]
                .variants
                .iter()
                .filter(|v| restr.allows(v))
                .collect();
            if variants.is_empty() {
                warn!(
                    "Could not compose flat node {} with worker {} due to test object incompatibility",
                    flat.shortname(),
                    worker.id
                );
                flat.inner().incompatible_workers.insert(worker.id.clone());
                return Ok(Vec::new());
            }
            let mut axis = Vec::new();
            for variant in variants {
                axis.push(self.get_or_create_vm(suffix, variant)?);
            }
            axes.push(axis);
        }

        let mut new_nodes = Vec::new();
        let mut unresolved = Vec::new();
        let mut any_composite = false;
        for combo in axes.into_iter().multi_cartesian_product() {
            let net = match self.get_or_create_net(&worker.id, &combo) {
                Ok(net) => net,
                Err(TraversalError::IncompatibleRestriction { suffix, restriction }) => {
                    debug!(
                        "Skipping variant combination for {}: {suffix} fails {restriction:?}",
                        flat.shortname()
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            any_composite = true;
            let name = Self::composite_name(&set, &net);
            if let Some(existing) = self.node_by_name(&name) {
                let targets = self.clones_or_self(&existing);
                for target in targets {
                    self.descend_from(&target, flat, &worker.net.long_suffix);
                }
                continue;
            }
            // The n-th composite expansion of a leaf gets a "b<n>" twin
            // prefix; typically these are the same node on other workers.
            let expansions = flat.inner().cloned_nodes.len() + flat.inner().cleanup_nodes.len();
            let prefix = if expansions == 0 {
                flat.prefix.clone()
            } else {
                format!("{}b{expansions}", flat.prefix)
            };
            let node = self.compose_node(&set, &net, &prefix, &Params::new())?;
            let node = self.insert_node(node);
            self.descend_from(&node, flat, &worker.net.long_suffix);
            self.bridge_matching(&node);
            unresolved.push(node.clone());
            new_nodes.push(node);
        }
        if !any_composite {
            flat.inner().incompatible_workers.insert(worker.id.clone());
            return Ok(Vec::new());
        }

        // Dependency closure: keep popping unresolved composites and parsing
        // their parents (and fan-in clones) until the object roots.
        while let Some(child) = unresolved.pop() {
            let (parents, replaced_by) = self.resolve_parents(&child, worker)?;
            unresolved.extend(parents.iter().cloned());
            new_nodes.extend(parents);
            if let Some(clones) = replaced_by {
                unresolved.extend(clones.iter().cloned());
                new_nodes.extend(clones);
            } else {
                child.validate()?;
            }
        }

        // Newly parsed object roots hang off the shared root.
        if let Some(root_id) = *self.root.read() {
            let root = self.node(root_id);
            for node in &new_nodes {
                if node.is_object_root() && node.inner().cloned_nodes.is_empty() {
                    let component = node
                        .terminal_object()
                        .map(|o| o.long_suffix.clone())
                        .unwrap_or_else(|| "shared".to_owned());
                    self.descend_from(node, &root, &component);
                }
            }
        }
        Ok(new_nodes)
    }

    fn clones_or_self(&self, node: &Arc<TestNode>) -> Vec<Arc<TestNode>> {
        let clones = node.inner().cloned_nodes.clone();
        if clones.is_empty() {
            vec![node.clone()]
        } else {
            clones.into_iter().map(|id| self.node(id)).collect()
        }
    }

    // Resolve (get or parse) the parents of one composite node, object by
    // object. Returns newly parsed parents, plus the clone replacements of
    // the node itself when some object hit state fan-in.
    #[expect(clippy::type_complexity)]
    fn resolve_parents(
        &self,
        child: &Arc<TestNode>,
        worker: &TestWorker,
    ) -> anyhow::Result<(Vec<Arc<TestNode>>, Option<Vec<Arc<TestNode>>>)> {
        let set = child.set.clone().expect("composite nodes carry their set");
        let mut newly = Vec::new();

        for (suffix, requires) in &set.requires {
            if requires.state.as_deref() == Some("root") {
                // Install-from-scratch, nothing above but the shared root.
                continue;
            }
            let vm = child
                .objects
                .iter()
                .find(|o| o.kind == ObjectKind::Vm && o.suffix == *suffix)
                .with_context(|| format!("node {} misses vm {suffix:?}", child.shortname()))?
                .clone();
            let object = Self::scope_object(&vm, requires.scope);
            if self.has_dependency(child, &object) {
                continue;
            }

            let get = requires
                .get
                .as_ref()
                .expect("validated: non-root requires name their setup set");
            let pinned = child
                .param(&format!("get_state_{}", object.state_suffixes()))
                .or_else(|| requires.state.clone());
            let mut providers = self.suite.providers(get, suffix);
            if let Some(state) = &pinned {
                providers.retain(|p| p.provides.get(suffix).map(|d| &d.state) == Some(state));
            }
            providers.retain(|p| {
                p.restrs
                    .get(suffix)
                    .map(|r| r.allows(&vm.variant))
                    .unwrap_or(true)
            });
            if providers.is_empty() {
                bail!(
                    "no setup variant of {get:?} provides state {pinned:?} for {suffix:?} \
                     required by {}",
                    child.shortname()
                );
            }

            let mut parents: Vec<Arc<TestNode>> = Vec::new();
            for provider in &providers {
                // Setup runs on the same net, narrowed to the vms it uses.
                let pvms: Vec<Arc<TestObject>> = provider
                    .vms
                    .iter()
                    .map(|s| {
                        child
                            .objects
                            .iter()
                            .find(|o| o.kind == ObjectKind::Vm && o.suffix == *s)
                            .cloned()
                            .with_context(|| {
                                format!("setup set {:?} uses vm {s:?} foreign to {}",
                                    provider.full_name(), child.shortname())
                            })
                    })
                    .collect::<anyhow::Result<_>>()?;
                let pnet = self
                    .get_or_create_net(&child.objects[0].suffix, &pvms)
                    .map_err(anyhow::Error::from)?;
                let name = Self::composite_name(provider, &pnet);
                match self.node_by_name(&name) {
                    Some(existing) => {
                        for node in self.clones_or_self(&existing) {
                            if !parents.iter().any(|p| p.id == node.id) {
                                parents.push(node);
                            }
                        }
                    }
                    None => {
                        let mut extra = Params::new();
                        extra.insert("require_existence".to_owned(), "yes".to_owned());
                        let parent = self.compose_node(
                            provider,
                            &pnet,
                            &format!("{}a", child.prefix),
                            &extra,
                        )?;
                        let parent = self.insert_node(parent);
                        self.bridge_matching(&parent);
                        newly.push(parent.clone());
                        parents.push(parent);
                    }
                }
            }

            self.descend_from(child, &parents[0], &object.long_suffix);
            if parents.len() == 1 {
                // Record the resolved state so the scan knows what to check.
                if pinned.is_none() {
                    if let Some(provides) = providers[0].provides.get(suffix) {
                        child.set_param(
                            &format!("get_state_{}", object.state_suffixes()),
                            &provides.state,
                        );
                    }
                }
            } else {
                info!(
                    "State fan-in on {} of {}: cloning one branch per parent",
                    object.long_suffix,
                    child.shortname()
                );
                let clones = self.clone_branches(child, &object, &parents)?;
                return Ok((newly, Some(clones)));
            }
        }
        Ok((newly, None))
    }

    // Duplicate the descendant subtree at state fan-in: one branch per
    // parent, each clone pinned to its parent's produced state so the
    // branches stay distinguishable. Iterative over a queue of
    // (source, parents, parent-source) triples, propagating to
    // grandchildren.
    fn clone_branches(
        &self,
        source: &Arc<TestNode>,
        object: &Arc<TestObject>,
        parents: &[Arc<TestNode>],
    ) -> anyhow::Result<Vec<Arc<TestNode>>> {
        let mut queue = vec![(
            source.clone(),
            parents.to_vec(),
            parents[0].id,
            object.clone(),
        )];
        let mut first_level = Vec::new();

        while let Some((src, parents, parent_src_id, object)) = queue.pop() {
            debug!(
                "Duplicating test node {} for {} parents",
                src.shortname(),
                parents.len()
            );
            let set = src.set.clone().expect("cloned nodes carry their set");
            let set_full = set.full_name();
            let mut clones = Vec::new();

            for (k, parent) in parents.iter().enumerate() {
                let prefix = if k == 0 {
                    src.prefix.clone()
                } else {
                    format!("{}d{k}", src.prefix)
                };
                let parent_params = object.object_typed_params(&parent.params());
                let parent_state = parent_params.get_str("set_state", "");

                let mut params = src.params();
                // Prepend the parent state to the identity so each clone is
                // unique per parent.
                for key in ["name", "shortname"] {
                    let old = params.get_str(key, "");
                    params.insert(
                        key.to_owned(),
                        old.replacen(&set_full, &format!("{set_full}.{parent_state}"), 1),
                    );
                }
                params.insert(
                    format!("get_state_{}", object.state_suffixes()),
                    parent_state.clone(),
                );
                // Chain this branch's own produced state off the parent's so
                // descendants of different branches stay apart.
                let set_key = format!("set_state_{}", object.state_suffixes());
                if let Some(own) = params.get(&set_key).filter(|s| !s.is_empty()).cloned() {
                    params.insert(set_key, format!("{own}.{parent_state}"));
                }

                let name = params.get_str("name", "");
                let clone = match self.node_by_name(&name) {
                    Some(existing) => {
                        debug!("Reusing previously cloned node {}", existing.shortname());
                        existing
                    }
                    None => {
                        let mut clone = TestNode::new(&prefix, Some(set.clone()), params);
                        clone.set_objects_from_net(src.objects[0].clone());
                        let clone = self.insert_node(clone);
                        // Copy setup edges, redirecting the fan-in edge to
                        // this clone's own parent.
                        let edges: Vec<(NodeId, Vec<String>)> = src
                            .inner()
                            .setup_nodes
                            .iter()
                            .map(|(id, comps)| (*id, comps.clone()))
                            .collect();
                        for (pid, comps) in edges {
                            let target = if pid == parent_src_id {
                                parent.clone()
                            } else {
                                self.node(pid)
                            };
                            for comp in comps {
                                self.descend_from(&clone, &target, &comp);
                            }
                        }
                        self.bridge_matching(&clone);
                        clone
                    }
                };
                clones.push(clone);
            }

            // Grandchildren fan out over the new clones next round.
            let grandchildren: Vec<(NodeId, Vec<String>)> = src
                .inner()
                .cleanup_nodes
                .iter()
                .map(|(id, comps)| (*id, comps.clone()))
                .collect();
            for (gcid, comps) in grandchildren {
                let gc = self.node(gcid);
                let gobj = gc
                    .objects
                    .iter()
                    .find(|o| comps.iter().any(|c| *c == o.long_suffix))
                    .cloned()
                    .unwrap_or_else(|| object.clone());
                queue.push((gc, clones.clone(), src.id, gobj));
            }

            self.retire_clone_source(&src, &clones);
            if src.id == source.id {
                first_level = clones;
            }
        }
        Ok(first_level)
    }

    // Detach a cloned-over node from the graph: its clones took over its
    // edges, it stays only as a lookup alias via cloned_nodes.
    fn retire_clone_source(&self, src: &Arc<TestNode>, clones: &[Arc<TestNode>]) {
        let setup: Vec<NodeId> = src.inner().setup_nodes.keys().cloned().collect();
        for pid in setup {
            self.node(pid).inner().cleanup_nodes.remove(&src.id);
        }
        let cleanup: Vec<NodeId> = src.inner().cleanup_nodes.keys().cloned().collect();
        for cid in cleanup {
            self.node(cid).inner().setup_nodes.remove(&src.id);
        }
        let mut inner = src.inner();
        inner.setup_nodes.clear();
        inner.cleanup_nodes.clear();
        inner.cloned_nodes = clones.iter().map(|c| c.id).collect();
    }

    // Introduce the synthetic origin bounding the traversal: every node with
    // no parents descends from it and it never runs.
    pub fn parse_shared_root(&self) -> Arc<TestNode> {
        if let Some(id) = *self.root.read() {
            return self.node(id);
        }
        let params = Params::from([
            ("name".to_owned(), "internal.stateless.noop".to_owned()),
            ("shortname".to_owned(), "internal.stateless.noop".to_owned()),
            ("shared_root".to_owned(), "yes".to_owned()),
            ("vms".to_owned(), String::new()),
        ]);
        let root = self.insert_node(TestNode::new("0s", None, params));
        *self.root.write() = Some(root.id);
        for node in self.nodes() {
            if node.id == root.id || !node.inner().cloned_nodes.is_empty() {
                continue;
            }
            if node.inner().setup_nodes.is_empty() {
                let component = node
                    .terminal_object()
                    .map(|o| o.long_suffix.clone())
                    .unwrap_or_else(|| "shared".to_owned());
                self.descend_from(&node, &root, &component);
            }
        }
        root
    }

    // Parse a complete test graph: user leaves, shared root, and (eagerly,
    // when requested) the per-worker object trees. Lazy callers let the
    // traversal unroll flat nodes on first encounter instead.
    pub fn parse_object_trees(&self, restriction: &Restriction, eager: bool) -> anyhow::Result<()> {
        let mut leaves = self.parse_flat_nodes(restriction)?;
        self.parse_shared_root();
        if eager {
            leaves.sort_by_key(|l| l.prefix.parse::<u64>().unwrap_or(u64::MAX));
            for worker in self.workers.clone() {
                info!("Parsing a copy of the object trees for {}", worker.id);
                for leaf in &leaves {
                    self.unroll_flat_node(leaf, &worker)?;
                }
            }
        }
        Ok(())
    }

    // Flat nodes nobody has unrolled yet; cleanup is premature while any
    // remain since they may grow new children anywhere.
    pub fn unexplored_nodes(&self) -> Vec<Arc<TestNode>> {
        self.nodes()
            .into_iter()
            .filter(|n| n.is_flat() && n.inner().unrolled_for.is_empty())
            .collect()
    }

    /* manual policy flagging */

    // Force run/clean decisions on the subtree below the node(s) producing
    // the given state on the given object. The state matches as a dot
    // component so chained clone states are caught too.
    pub fn flag_children(
        &self,
        state_name: Option<&str>,
        object_suffix: Option<&str>,
        flag_run: Option<bool>,
        flag_clean: Option<bool>,
        skip_roots: bool,
    ) {
        let state_pattern = state_name.map(|state| {
            Regex::new(&format!(r"(\.|^){}(\.|$)", regex::escape(state)))
                .expect("escaped state pattern compiles")
        });
        let mut queue: Vec<Arc<TestNode>> = self
            .nodes()
            .into_iter()
            .filter(|n| !n.is_flat() && !n.is_shared_root())
            .filter(|n| match &state_pattern {
                None => n.inner().setup_nodes.is_empty() || n.is_object_root(),
                Some(pattern) => n.objects.iter().any(|o| {
                    let params = o.object_typed_params(&n.params());
                    params.get("set_state").is_some_and(|s| pattern.is_match(s))
                        && object_suffix.map_or(true, |s| o.suffix == s || o.long_suffix == s)
                }),
            })
            .collect();
        let mut seen: std::collections::BTreeSet<NodeId> = Default::default();
        while let Some(node) = queue.pop() {
            if !seen.insert(node.id) {
                continue;
            }
            if !(skip_roots && (node.is_object_root() || node.is_shared_root())) {
                let mut inner = node.inner();
                if let Some(flag) = flag_run {
                    inner.should_run_override = Some(flag);
                }
                if let Some(flag) = flag_clean {
                    inner.should_clean_override = Some(flag);
                }
            }
            let children: Vec<NodeId> = node.inner().cleanup_nodes.keys().cloned().collect();
            queue.extend(children.into_iter().map(|id| self.node(id)));
        }
    }

    // Force decisions on the nodes this graph shares with another graph
    // (matched by bridged form), e.g. to avoid redoing setup a previous
    // manual step already performed.
    pub fn flag_intersection(
        &self,
        other: &TestGraph,
        flag_run: Option<bool>,
        flag_clean: Option<bool>,
        skip_roots: bool,
    ) {
        let other_forms: std::collections::BTreeSet<String> = other
            .nodes()
            .iter()
            .filter(|n| !n.is_flat() && !n.is_shared_root())
            .map(|n| n.bridged_form())
            .collect();
        for node in self.nodes() {
            if node.is_flat() || node.is_shared_root() {
                continue;
            }
            if skip_roots && node.is_object_root() {
                continue;
            }
            if other_forms.contains(&node.bridged_form()) {
                let mut inner = node.inner();
                if let Some(flag) = flag_run {
                    inner.should_run_override = Some(flag);
                }
                if let Some(flag) = flag_clean {
                    inner.should_clean_override = Some(flag);
                }
            }
        }
    }

    /* persistence, reporting, visualization */

    // One line per composite node, in prefix order:
    // "<long-prefix> <should_run> <should_clean>".
    pub fn save_setup_list(&self, dump_dir: &Path, filename: &str) -> anyhow::Result<()> {
        let mut lines = String::new();
        for node in self.nodes_by_prefix("") {
            if node.is_flat() || node.is_shared_root() {
                continue;
            }
            let inner = node.inner();
            if !inner.cloned_nodes.is_empty() {
                continue;
            }
            let run = inner.should_run_override.unwrap_or(true);
            let clean = inner.should_clean_override.unwrap_or(true);
            lines.push_str(&format!(
                "{} {} {}\n",
                node.long_prefix(),
                run as u8,
                clean as u8
            ));
        }
        let path = dump_dir.join(filename);
        std::fs::write(&path, lines).with_context(|| format!("writing setup list {path:?}"))?;
        Ok(())
    }

    pub fn load_setup_list(&self, dump_dir: &Path, filename: &str) -> anyhow::Result<()> {
        let path = dump_dir.join(filename);
        let text =
            std::fs::read_to_string(&path).with_context(|| format!("reading setup list {path:?}"))?;
        let mut by_long_prefix: BTreeMap<String, Arc<TestNode>> = BTreeMap::new();
        for node in self.nodes() {
            by_long_prefix.insert(node.long_prefix(), node);
        }
        for (i, line) in text.lines().enumerate() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let &[prefix, run, clean] = parts.as_slice() else {
                bail!("setup list line {} is malformed: {line:?}", i + 1);
            };
            let Some(node) = by_long_prefix.get(prefix) else {
                debug!("Setup list entry {prefix:?} matches no parsed node, skipping");
                continue;
            };
            let mut inner = node.inner();
            inner.should_run_override = Some(run == "1");
            inner.should_clean_override = Some(clean == "1");
        }
        Ok(())
    }

    pub fn report_progress(&self) {
        let nodes = self.nodes();
        let composite: Vec<_> = nodes
            .iter()
            .filter(|n| !n.is_flat() && !n.is_shared_root())
            .filter(|n| n.inner().cloned_nodes.is_empty())
            .collect();
        let finished = composite.iter().filter(|n| n.is_finished_by_any()).count();
        let incompatible = nodes
            .iter()
            .filter(|n| !n.inner().incompatible_workers.is_empty())
            .count();
        info!(
            "Finished {finished}/{} composite test nodes \
             ({} total vertices, {incompatible} partially incompatible)",
            composite.len(),
            nodes.len()
        );
    }

    // DOT dump of the current graph: red setup edges, blue cleanup, green
    // bridge, black clone.
    pub fn visualize(&self, dump_dir: &Path, tag: &str) -> anyhow::Result<()> {
        let mut dot = String::from("digraph cartesian_graph {\n");
        for node in self.nodes() {
            let label = if node.shortname().is_empty() {
                node.prefix.clone()
            } else {
                format!("{}-{}", node.prefix, node.shortname())
            };
            dot.push_str(&format!("  n{} [label=\"{}\"];\n", node.id, label));
            let inner = node.inner();
            for parent in inner.setup_nodes.keys() {
                dot.push_str(&format!("  n{} -> n{} [color=red];\n", node.id, parent));
            }
            for child in inner.cleanup_nodes.keys() {
                dot.push_str(&format!("  n{} -> n{} [color=blue];\n", node.id, child));
            }
            for peer in &inner.bridged_nodes {
                if node.id < *peer {
                    dot.push_str(&format!(
                        "  n{} -> n{} [color=green, dir=none];\n",
                        node.id, peer
                    ));
                }
            }
            for clone in &inner.cloned_nodes {
                dot.push_str(&format!("  n{} -> n{} [color=black];\n", node.id, clone));
            }
        }
        dot.push_str("}\n");
        std::fs::create_dir_all(dump_dir)
            .with_context(|| format!("creating dump dir {dump_dir:?}"))?;
        let path = dump_dir.join(format!("cartesian_graph_{tag}.dot"));
        std::fs::write(&path, dot).with_context(|| format!("writing graph dump {path:?}"))?;
        Ok(())
    }
}
