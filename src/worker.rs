use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::{debug, info, warn};

use crate::config::SuiteConfig;
use crate::node::WorkerId;
use crate::object::{parse_flat_net, TestObject};
use crate::restriction::{Params, ParamsExt as _};

// How work gets launched inside a worker's environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnerKind {
    // Plain subprocess on the host, no isolation. This is also the serial
    // fallback when no slots are configured at all.
    Process,
    // Local container, addressed by a container id.
    Container,
    // Remote host behind a gateway, addressed by a forwarded port.
    Remote,
}

impl fmt::Display for SpawnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Process => "process",
            Self::Container => "container",
            Self::Remote => "remote",
        };
        write!(f, "{s}")
    }
}

// An execution environment driving one traversal loop: a worker-level net
// object plus the transport identity needed to reach the environment.
#[derive(Debug)]
pub struct TestWorker {
    pub id: WorkerId,
    pub net: Arc<TestObject>,
    pub spawner: SpawnerKind,
    pub swarm_id: String,
    pub params: Params,
}

impl fmt::Display for TestWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[worker] id='{}', spawner='{}'", self.id, self.spawner)
    }
}

impl TestWorker {
    pub fn new(net: Arc<TestObject>) -> Self {
        let params = net.params.clone();
        Self {
            id: net.suffix.clone(),
            net,
            spawner: SpawnerKind::Process,
            swarm_id: "localhost".to_owned(),
            params,
        }
    }

    // Overwrite worker parameters with configuration extrapolated from a
    // slot string of the form "<gateway>/<host>" or plain "<host>".
    pub fn overwrite_with_slot(&mut self, slot: &str) -> anyhow::Result<()> {
        let parts: Vec<&str> = slot.split('/').collect();
        match parts.as_slice() {
            [host] => {
                // An empty environment id (lack of slots) indicates using
                // non-isolated serial runs via the process spawner.
                if host.is_empty() {
                    self.spawner = SpawnerKind::Process;
                    self.params.insert("shell_host".to_owned(), "localhost".to_owned());
                    self.params.insert("host".to_owned(), "".to_owned());
                } else {
                    // The host identifier carries the PREFIX contribution so
                    // several deployments can share one container host.
                    let id_prefix = self.params.get_str("prefix", "");
                    let container = format!("{id_prefix}c{host}");
                    let ip_prefix = self.params.get_str("ip_prefix", "192.168.254");
                    self.spawner = SpawnerKind::Container;
                    self.params
                        .insert("shell_host".to_owned(), format!("{ip_prefix}.{host}"));
                    self.params.insert("host".to_owned(), container);
                }
                self.params.insert("gateway".to_owned(), "".to_owned());
            }
            [gateway, host] => {
                if !host.chars().all(|c| c.is_ascii_digit()) {
                    bail!(
                        "invalid remote host {host:?}, only numbers (as forwarded ports) accepted"
                    );
                }
                self.spawner = SpawnerKind::Remote;
                self.params.insert("gateway".to_owned(), gateway.to_string());
                self.params.insert("host".to_owned(), host.to_string());
                self.params
                    .insert("shell_host".to_owned(), gateway.to_string());
                self.params
                    .insert("shell_port".to_owned(), format!("22{host}"));
            }
            _ => bail!("slot string {slot:?} could not be parsed"),
        }
        self.params
            .insert("spawner".to_owned(), self.spawner.to_string());
        self.swarm_id = match self.spawner {
            SpawnerKind::Remote => self.params.get_str("gateway", "remote"),
            _ => "localhost".to_owned(),
        };
        Ok(())
    }

    // Start the environment backing this worker. Containers and remote hosts
    // are managed outside this process, so the most we do is report.
    pub fn set_up(&self) -> bool {
        info!("Setting up worker {} environment", self.id);
        match self.spawner {
            SpawnerKind::Process => {
                debug!("Serial runs do not have any bootable environment");
                true
            }
            SpawnerKind::Container => {
                info!(
                    "Assuming container {} is running",
                    self.params.get_str("host", "?")
                );
                true
            }
            SpawnerKind::Remote => {
                warn!("Assuming the remote host is running for now");
                true
            }
        }
    }
}

// A named group of workers sharing locality or a pool.
#[derive(Debug)]
pub struct TestSwarm {
    pub id: String,
    pub workers: Vec<WorkerId>,
}

// Parse all workers from the configured nets, applying runtime slot strings
// when provided. Slots truncate the net selection: no point in keeping
// workers around that have no environment to run in.
pub fn parse_workers(
    suite: &SuiteConfig,
    params: &Params,
) -> anyhow::Result<(Vec<Arc<TestWorker>>, BTreeMap<String, TestSwarm>)> {
    let mut suffixes: Vec<String> = suite.nets.keys().cloned().collect();
    let slots: Vec<String> = match params.get("slots") {
        Some(slots) => {
            let slots: Vec<String> = slots.split(' ').map(str::to_owned).collect();
            suffixes.truncate(slots.len());
            slots
        }
        None => vec!["".to_owned(); suffixes.len()],
    };

    let mut workers = Vec::new();
    let mut swarms: BTreeMap<String, TestSwarm> = BTreeMap::new();
    for (suffix, slot) in suffixes.iter().zip(slots) {
        let net = parse_flat_net(suite, suffix)
            .with_context(|| format!("parsing worker net {suffix:?}"))?;
        let mut worker = TestWorker::new(net);
        if let Some(prefix) = params.get("prefix") {
            worker.params.insert("prefix".to_owned(), prefix.clone());
        }
        worker
            .overwrite_with_slot(&slot)
            .with_context(|| format!("applying slot to worker {suffix:?}"))?;
        let worker = Arc::new(worker);
        swarms
            .entry(worker.swarm_id.clone())
            .or_insert_with(|| TestSwarm {
                id: worker.swarm_id.clone(),
                workers: Vec::new(),
            })
            .workers
            .push(worker.id.clone());
        workers.push(worker);
    }
    Ok((workers, swarms))
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use indoc::indoc;

    use super::*;

    fn suite() -> SuiteConfig {
        SuiteConfig::new(
            toml::from_str(indoc! {r#"
                [vms.vm1]

                [nets.net1]
                [nets.net2]
                [nets.net3]
            "#})
            .unwrap(),
            "/fake",
        )
        .unwrap()
    }

    #[googletest::test]
    fn test_empty_slot_is_serial_process() {
        let suite = suite();
        let params = Params::from([("slots".to_owned(), "".to_owned())]);
        let (workers, swarms) = parse_workers(&suite, &params).unwrap();
        assert_that!(workers.len(), eq(1));
        expect_that!(workers[0].spawner, eq(SpawnerKind::Process));
        expect_that!(workers[0].id, eq("net1"));
        assert_that!(swarms.len(), eq(1));
    }

    #[googletest::test]
    fn test_container_slots() {
        let suite = suite();
        let params = Params::from([("slots".to_owned(), "1 2".to_owned())]);
        let (workers, _) = parse_workers(&suite, &params).unwrap();
        assert_that!(workers.len(), eq(2));
        expect_that!(workers[0].spawner, eq(SpawnerKind::Container));
        expect_that!(
            workers[0].params.get("host"),
            some(eq(&"c1".to_owned()))
        );
        expect_that!(
            workers[1].params.get("shell_host"),
            some(eq(&"192.168.254.2".to_owned()))
        );
    }

    #[googletest::test]
    fn test_remote_slots_group_by_gateway() {
        let suite = suite();
        let params = Params::from([(
            "slots".to_owned(),
            "doors.example/1 doors.example/2 1".to_owned(),
        )]);
        let (workers, swarms) = parse_workers(&suite, &params).unwrap();
        assert_that!(workers.len(), eq(3));
        expect_that!(workers[0].spawner, eq(SpawnerKind::Remote));
        expect_that!(
            workers[0].params.get("shell_port"),
            some(eq(&"221".to_owned()))
        );
        assert_that!(swarms.len(), eq(2));
        assert_eq!(swarms["doors.example"].workers, vec!["net1", "net2"]);
    }

    #[googletest::test]
    fn test_bad_remote_host_rejected() {
        let suite = suite();
        let mut worker = TestWorker::new(parse_flat_net(&suite, "net1").unwrap());
        expect_that!(
            worker.overwrite_with_slot("gateway/abc"),
            err(displays_as(contains_substring("forwarded ports")))
        );
        expect_that!(worker.overwrite_with_slot("a/b/c"), err(anything()));
    }

    #[googletest::test]
    fn test_no_slots_param_uses_all_nets() {
        let suite = suite();
        let (workers, _) = parse_workers(&suite, &Params::new()).unwrap();
        assert_that!(workers.len(), eq(3));
    }
}
