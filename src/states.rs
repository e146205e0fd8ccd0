use core::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use futures::future::BoxFuture;
use futures::FutureExt as _;
#[allow(unused_imports)]
use log::{debug, info, warn};

use crate::node::TestNode;
use crate::object::{ObjectKind, TestObject};
use crate::restriction::ParamsExt as _;
use crate::worker::TestWorker;

// Two-char mode word from {r,a,i,f}²: first char is the action when the
// state is present, second when it is missing. r=reuse, a=abort, i=ignore,
// f=force.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateMode {
    pub present: char,
    pub missing: char,
}

impl Default for StateMode {
    fn default() -> Self {
        Self {
            present: 'r',
            missing: 'i',
        }
    }
}

impl FromStr for StateMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.chars().collect();
        let [present, missing] = chars.as_slice() else {
            bail!("state mode {s:?} is not a two-char word");
        };
        for c in [present, missing] {
            if !"raif".contains(*c) {
                bail!("state mode {s:?} contains char outside {{r,a,i,f}}");
            }
        }
        Ok(Self {
            present: *present,
            missing: *missing,
        })
    }
}

impl fmt::Display for StateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.present, self.missing)
    }
}

// Where a state can be obtained from: a worker id (or the empty id for the
// shared pool) and a path inside that worker's environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateLocation {
    pub worker: String,
    pub path: PathBuf,
}

impl StateLocation {
    pub fn shared(path: impl Into<PathBuf>) -> Self {
        Self {
            worker: String::new(),
            path: path.into(),
        }
    }

    pub fn is_shared_pool(&self) -> bool {
        self.worker.is_empty()
    }
}

impl FromStr for StateLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (worker, path) = s
            .split_once(':')
            .with_context(|| format!("state location {s:?} is not of the form worker:path"))?;
        Ok(Self {
            worker: worker.to_owned(),
            path: PathBuf::from(path),
        })
    }
}

impl fmt::Display for StateLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.worker, self.path.display())
    }
}

// Parse a space-separated location list.
pub fn parse_locations(list: &str) -> anyhow::Result<Vec<StateLocation>> {
    list.split_whitespace().map(str::parse).collect()
}

// The backend performing actual snapshot operations on an object. The real
// work (QEMU snapshots, LVM, whatever) happens behind this seam; the
// orchestrator only decides what to call and where.
pub trait StateBackend: Send + Sync {
    // Whether the named state of the object exists at the location.
    fn check<'a>(
        &'a self,
        object_id: &'a str,
        state: &'a str,
        location: &'a StateLocation,
    ) -> BoxFuture<'a, anyhow::Result<bool>>;

    // Transfer the state from one location to another.
    fn get<'a>(
        &'a self,
        object_id: &'a str,
        state: &'a str,
        from: &'a StateLocation,
        to: &'a StateLocation,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    // Register the state as present at the location.
    fn set<'a>(
        &'a self,
        object_id: &'a str,
        state: &'a str,
        location: &'a StateLocation,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    // Remove the state from the location.
    fn unset<'a>(
        &'a self,
        object_id: &'a str,
        state: &'a str,
        location: &'a StateLocation,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

// Trivial filesystem-marker backend: a state is a file
// <path>/<object>/<state> and transfers are file copies. Enough for the
// shared-pool plumbing and the manual tools; a virtualization backend
// implements the same trait out of tree.
pub struct FsPoolBackend;

impl FsPoolBackend {
    fn marker(object_id: &str, state: &str, location: &StateLocation) -> PathBuf {
        location.path.join(object_id).join(state)
    }
}

impl StateBackend for FsPoolBackend {
    fn check<'a>(
        &'a self,
        object_id: &'a str,
        state: &'a str,
        location: &'a StateLocation,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        async move { Ok(Self::marker(object_id, state, location).exists()) }.boxed()
    }

    fn get<'a>(
        &'a self,
        object_id: &'a str,
        state: &'a str,
        from: &'a StateLocation,
        to: &'a StateLocation,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let source = Self::marker(object_id, state, from);
            let target = Self::marker(object_id, state, to);
            tokio::fs::create_dir_all(target.parent().expect("marker has a parent"))
                .await
                .context("creating state directory")?;
            tokio::fs::copy(&source, &target)
                .await
                .with_context(|| format!("transferring state {state:?} from {from}"))?;
            Ok(())
        }
        .boxed()
    }

    fn set<'a>(
        &'a self,
        object_id: &'a str,
        state: &'a str,
        location: &'a StateLocation,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let marker = Self::marker(object_id, state, location);
            tokio::fs::create_dir_all(marker.parent().expect("marker has a parent"))
                .await
                .context("creating state directory")?;
            tokio::fs::write(&marker, b"")
                .await
                .with_context(|| format!("registering state {state:?} at {location}"))?;
            Ok(())
        }
        .boxed()
    }

    fn unset<'a>(
        &'a self,
        object_id: &'a str,
        state: &'a str,
        location: &'a StateLocation,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            tokio::fs::remove_file(Self::marker(object_id, state, location))
                .await
                .with_context(|| format!("removing state {state:?} at {location}"))?;
            Ok(())
        }
        .boxed()
    }
}

// Decides where a required state is obtained (self, peer worker, shared
// pool) and requests transfers. Scan order encodes the preference: local
// states are free, peer states cost a transfer, the shared pool is the
// fallback everyone can rely on.
pub struct StatePool {
    pub backend: Arc<dyn StateBackend>,
    pub shared_pool: Option<StateLocation>,
}

impl StatePool {
    pub fn new(backend: Arc<dyn StateBackend>, shared_pool: Option<PathBuf>) -> Self {
        Self {
            backend,
            shared_pool: shared_pool.map(StateLocation::shared),
        }
    }

    // The worker-local location states of this worker live at.
    pub fn worker_location(worker: &TestWorker) -> StateLocation {
        StateLocation {
            worker: worker.id.clone(),
            path: PathBuf::from(worker.params.get_str("state_path", "images")),
        }
    }

    // All locations the state is currently available at, most preferred
    // first. Only image states travel: vm and net states are bound to the
    // environment that produced them, so peers and the pool don't count.
    pub async fn scan_locations(
        &self,
        object: &TestObject,
        state: &str,
        worker: &TestWorker,
        peers: &[Arc<TestWorker>],
    ) -> anyhow::Result<Vec<StateLocation>> {
        let object_id = object.id();
        let mut available = Vec::new();
        let own = Self::worker_location(worker);
        if self.backend.check(&object_id, state, &own).await? {
            available.push(own);
        }
        if object.kind != ObjectKind::Image {
            return Ok(available);
        }
        // Direct peer transfers only make sense inside one swarm; everyone
        // else is reachable through the shared pool.
        for peer in peers {
            if peer.id == worker.id || peer.swarm_id != worker.swarm_id {
                continue;
            }
            let location = Self::worker_location(peer);
            if self.backend.check(&object_id, state, &location).await? {
                available.push(location);
            }
        }
        if let Some(pool) = &self.shared_pool {
            if self.backend.check(&object_id, state, pool).await? {
                available.push(pool.clone());
            }
        }
        Ok(available)
    }

    // Record where each required input state of the node will be obtained
    // from, as get_location_<scope>_<suffix> parameters. Missing states are
    // left unrecorded; whether that is fatal is the run policy's call.
    pub async fn pull_locations(
        &self,
        node: &TestNode,
        worker: &TestWorker,
        peers: &[Arc<TestWorker>],
    ) -> anyhow::Result<()> {
        let params = node.params();
        for object in &node.objects {
            let object_params = object.object_typed_params(&params);
            let Some(state) = object_params.get("get_state").filter(|s| !s.is_empty()) else {
                continue;
            };
            if state == "root" {
                continue;
            }
            let key = format!("get_location_{}", object.state_suffixes());
            if let Some(existing) = params.get(&key) {
                // A user-pinned location wins, as long as it parses.
                parse_locations(existing)
                    .with_context(|| format!("invalid location list in {key}"))?;
                continue;
            }
            let locations = self.scan_locations(object, state, worker, peers).await?;
            match locations.first() {
                Some(location) => {
                    debug!(
                        "State {state:?} of {object} for {} available at {location}{}",
                        worker.id,
                        if location.is_shared_pool() {
                            " (shared pool)"
                        } else {
                            ""
                        }
                    );
                    node.set_param(&key, &location.to_string());
                }
                None => debug!(
                    "State {state:?} of {object} not yet available anywhere for {}",
                    worker.id
                ),
            }
        }
        Ok(())
    }

    // Whether every state this node would produce is already available from
    // the perspective of the given worker. Such a node has nothing to do.
    pub async fn provided_states_available(
        &self,
        node: &TestNode,
        worker: &TestWorker,
        peers: &[Arc<TestWorker>],
    ) -> anyhow::Result<bool> {
        let params = node.params();
        let mut any_state = false;
        for object in &node.objects {
            let object_params = object.object_typed_params(&params);
            let Some(state) = object_params.get("set_state").filter(|s| !s.is_empty()) else {
                continue;
            };
            any_state = true;
            let check_mode: StateMode = object_params
                .get("check_mode")
                .map(|m| m.parse())
                .transpose()?
                .unwrap_or_default();
            if check_mode.present == 'f' {
                // Forced re-creation, availability is irrelevant.
                return Ok(false);
            }
            if self
                .scan_locations(object, state, worker, peers)
                .await?
                .is_empty()
            {
                return Ok(false);
            }
        }
        Ok(any_state)
    }

    // Make the node's produced states available to everyone by pushing them
    // to the shared pool, where configured.
    pub async fn sync_to_pool(&self, node: &TestNode, worker: &TestWorker) -> anyhow::Result<()> {
        let Some(pool) = &self.shared_pool else {
            return Ok(());
        };
        let params = node.params();
        for object in &node.objects {
            // Only image states survive outside their environment.
            if object.kind != ObjectKind::Image {
                continue;
            }
            let object_params = object.object_typed_params(&params);
            let Some(state) = object_params.get("set_state").filter(|s| !s.is_empty()) else {
                continue;
            };
            let own = Self::worker_location(worker);
            if !self.backend.check(&object.id(), state, &own).await? {
                continue;
            }
            if self.backend.check(&object.id(), state, pool).await? {
                continue;
            }
            info!("Syncing state {state:?} of {object} to the shared pool");
            self.backend.get(&object.id(), state, &own, pool).await?;
        }
        Ok(())
    }
}

// Mock backend recording calls, shared by tests across modules.
#[cfg(test)]
pub mod test_utils {
    use std::collections::BTreeSet;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockBackend {
        // (object_id, state, location) triples that exist.
        pub present: Mutex<BTreeSet<(String, String, String)>>,
        // Call journal of (op, object_id, state, location).
        pub calls: Mutex<Vec<(String, String, String, String)>>,
    }

    impl MockBackend {
        pub fn with_states(states: &[(&str, &str, &str)]) -> Self {
            let zelf = Self::default();
            for (object, state, location) in states {
                zelf.present.lock().insert((
                    object.to_string(),
                    state.to_string(),
                    location.to_string(),
                ));
            }
            zelf
        }

        pub fn calls_of(&self, op: &str) -> Vec<(String, String, String, String)> {
            self.calls
                .lock()
                .iter()
                .filter(|(o, _, _, _)| o == op)
                .cloned()
                .collect()
        }
    }

    impl StateBackend for MockBackend {
        fn check<'a>(
            &'a self,
            object_id: &'a str,
            state: &'a str,
            location: &'a StateLocation,
        ) -> BoxFuture<'a, anyhow::Result<bool>> {
            async move {
                self.calls.lock().push((
                    "check".to_owned(),
                    object_id.to_owned(),
                    state.to_owned(),
                    location.to_string(),
                ));
                Ok(self.present.lock().contains(&(
                    object_id.to_owned(),
                    state.to_owned(),
                    location.to_string(),
                )))
            }
            .boxed()
        }

        fn get<'a>(
            &'a self,
            object_id: &'a str,
            state: &'a str,
            from: &'a StateLocation,
            to: &'a StateLocation,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            async move {
                self.calls.lock().push((
                    "get".to_owned(),
                    object_id.to_owned(),
                    state.to_owned(),
                    format!("{from} -> {to}"),
                ));
                self.present.lock().insert((
                    object_id.to_owned(),
                    state.to_owned(),
                    to.to_string(),
                ));
                Ok(())
            }
            .boxed()
        }

        fn set<'a>(
            &'a self,
            object_id: &'a str,
            state: &'a str,
            location: &'a StateLocation,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            async move {
                self.calls.lock().push((
                    "set".to_owned(),
                    object_id.to_owned(),
                    state.to_owned(),
                    location.to_string(),
                ));
                self.present.lock().insert((
                    object_id.to_owned(),
                    state.to_owned(),
                    location.to_string(),
                ));
                Ok(())
            }
            .boxed()
        }

        fn unset<'a>(
            &'a self,
            object_id: &'a str,
            state: &'a str,
            location: &'a StateLocation,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            async move {
                self.calls.lock().push((
                    "unset".to_owned(),
                    object_id.to_owned(),
                    state.to_owned(),
                    location.to_string(),
                ));
                self.present.lock().remove(&(
                    object_id.to_owned(),
                    state.to_owned(),
                    location.to_string(),
                ));
                Ok(())
            }
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;

    #[test_case("rr", 'r', 'r'; "reuse both")]
    #[test_case("fi", 'f', 'i'; "force present ignore missing")]
    #[test_case("ra", 'r', 'a'; "abort when missing")]
    fn test_mode_parses(s: &str, present: char, missing: char) {
        let mode: StateMode = s.parse().unwrap();
        assert_eq!((mode.present, mode.missing), (present, missing));
    }

    #[googletest::test]
    fn test_mode_rejects_garbage() {
        expect_that!("xx".parse::<StateMode>(), err(anything()));
        expect_that!("r".parse::<StateMode>(), err(anything()));
        expect_that!("rrr".parse::<StateMode>(), err(anything()));
    }

    #[googletest::test]
    fn test_location_round_trip() {
        let location: StateLocation = "net2:/mnt/local/images".parse().unwrap();
        assert_that!(location.worker, eq("net2"));
        assert_that!(location.to_string(), eq("net2:/mnt/local/images"));
        expect_that!(location.is_shared_pool(), eq(false));
        let pool: StateLocation = ":/mnt/shared".parse().unwrap();
        expect_that!(pool.is_shared_pool(), eq(true));
        expect_that!("nocolon".parse::<StateLocation>(), err(anything()));
    }

    #[googletest::test]
    fn test_parse_location_list() {
        let locations = parse_locations("net1:/a net2:/b").unwrap();
        assert_that!(locations.len(), eq(2));
        expect_that!(locations[1].worker, eq("net2"));
    }

    #[tokio::test]
    async fn test_fs_pool_backend_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = FsPoolBackend;
        let here = StateLocation {
            worker: "net1".to_owned(),
            path: dir.path().join("local"),
        };
        let pool = StateLocation::shared(dir.path().join("shared"));
        assert!(!backend.check("vm1-CentOS", "install", &here).await.unwrap());
        backend.set("vm1-CentOS", "install", &here).await.unwrap();
        assert!(backend.check("vm1-CentOS", "install", &here).await.unwrap());
        backend
            .get("vm1-CentOS", "install", &here, &pool)
            .await
            .unwrap();
        assert!(backend.check("vm1-CentOS", "install", &pool).await.unwrap());
        backend.unset("vm1-CentOS", "install", &here).await.unwrap();
        assert!(!backend.check("vm1-CentOS", "install", &here).await.unwrap());
    }
}
