use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use futures::future::BoxFuture;
use futures::FutureExt as _;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::Executor;
use crate::node::{TestNode, TestResult, TestStatus};
use crate::restriction::{Params, ParamsExt as _};

// Runs one parameter dictionary and reports a status. Implementations must
// be safe to invoke concurrently across distinct workers; the occupancy
// discipline guarantees they are never invoked concurrently for one node.
pub trait TestRunner: Send + Sync {
    fn run_test<'a>(
        &'a self,
        uid: &'a str,
        params: &'a Params,
    ) -> BoxFuture<'a, anyhow::Result<TestResult>>;
}

// Default implementation: spawn the configured control program in a
// subprocess, feed it the parameter dictionary as JSON on stdin, and map
// its exit code to a status.
pub struct ProcessRunner {
    pub executor: Executor,
    pub logdir: PathBuf,
}

impl ProcessRunner {
    // Exit code convention of control programs. Anything unrecognized is an
    // ERROR: the test did not even manage to report a verdict.
    fn status_from_code(code: i32) -> TestStatus {
        match code {
            0 => TestStatus::Pass,
            1 => TestStatus::Fail,
            4 => TestStatus::Warn,
            77 => TestStatus::Skip,
            _ => TestStatus::Error,
        }
    }

    async fn shut_down(&self, pid: u32) {
        let pgid = Pid::from_raw(pid as i32);
        // The child got its own process group, take the whole thing down.
        if killpg(pgid, Signal::SIGTERM).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(self.executor.shutdown_grace_period_s)).await;
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

impl TestRunner for ProcessRunner {
    fn run_test<'a>(
        &'a self,
        uid: &'a str,
        params: &'a Params,
    ) -> BoxFuture<'a, anyhow::Result<TestResult>> {
        async move {
            let name = params.get_str("name", "<unnamed>");
            let logdir = self.logdir.join(uid);
            tokio::fs::create_dir_all(&logdir)
                .await
                .with_context(|| format!("creating log directory {logdir:?}"))?;

            let mut cmd = Command::new(&self.executor.program);
            cmd.args(&self.executor.args)
                .arg(params.get_str("type", "noop"))
                .env("CARTWHEEL_UID", uid)
                .env("CARTWHEEL_LOGDIR", &logdir)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            // Separate process group so the test doesn't get SIGINT when the
            // user Ctrl-C's the terminal, and so we can kill its whole tree.
            cmd.process_group(0);

            debug!("Running {uid} ({name}) via {:?}", self.executor.program);
            let mut child = cmd.spawn().context("spawning test executor")?;
            let pid = child.id();
            let mut stdin = child.stdin.take().expect("stdin was piped");
            let dict = serde_json::to_vec(params).expect("params serialize to JSON");
            stdin.write_all(&dict).await.context("writing params")?;
            drop(stdin);

            let test_timeout = Duration::from_secs(params.get_numeric("test_timeout", 3600));
            let status = match timeout(test_timeout, child.wait_with_output()).await {
                Ok(output) => {
                    let output = output.context("collecting test output")?;
                    tokio::fs::write(logdir.join("output.txt"), &output.stdout)
                        .await
                        .context("writing test log")?;
                    if !output.stderr.is_empty() {
                        tokio::fs::write(logdir.join("stderr.txt"), &output.stderr)
                            .await
                            .context("writing test stderr")?;
                    }
                    match output.status.code() {
                        Some(code) => Self::status_from_code(code),
                        // Killed by a signal.
                        None => TestStatus::Cancel,
                    }
                }
                Err(_) => {
                    warn!("Test {uid} exceeded its timeout of {test_timeout:?}");
                    if let Some(pid) = pid {
                        self.shut_down(pid).await;
                    }
                    TestStatus::Interrupted
                }
            };

            Ok(TestResult {
                uid: uid.to_owned(),
                name,
                status,
                logdir: Some(logdir),
            })
        }
        .boxed()
    }
}

// Run a node once, and optionally re-run it depending on its retry policy.
//
// The retry parameters are retry_attempts (the maximum number of retries)
// and retry_stop (the status class that ends retrying early). Only tests
// ending in pass, warn, fail or error are ever retried; other statuses make
// another attempt meaningless. Returns whether the final status is not a
// failure.
pub async fn run_test_node(
    runner: &dyn TestRunner,
    node: &TestNode,
    can_retry: bool,
) -> anyhow::Result<bool> {
    let retry_stop = node.retry_stop();
    let runs_left = if can_retry {
        1 + node.retry_attempts()
    } else {
        1
    };
    if runs_left > 1 {
        debug!("Running test with retry_stop={retry_stop:?} and {runs_left} allowed runs");
    }

    let mut params = node.params();
    params.insert("_uid".to_owned(), node.fingerprint());
    let mut last_status = TestStatus::Error;
    for r in 0..runs_left {
        // Retries get a distinguishable uid so results can be told apart.
        let uid = if r > 0 {
            format!("{}r{r}", node.long_prefix())
        } else {
            node.long_prefix()
        };

        let result = runner.run_test(&uid, &params).await?;
        last_status = result.status;
        node.inner().results.push(result);

        if !last_status.is_retriable() {
            info!("Will not attempt to retry test with status {last_status}");
            break;
        }
        if last_status.stops(retry_stop) {
            info!("Stopping retries after a {last_status} run");
            break;
        }
    }
    info!(
        "Finished running test {} with status {last_status}",
        node.long_prefix()
    );

    Ok(!matches!(last_status, TestStatus::Fail | TestStatus::Error))
}

// Scripted runner for tests of the orchestration itself: records every
// invocation and answers with configured statuses.
#[cfg(test)]
pub mod test_utils {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockRunner {
        // (uid, shortname) of every invocation, in order.
        pub invocations: Mutex<Vec<(String, String)>>,
        // Status script per shortname; missing means PASS. Each entry is
        // consumed front to back, the last one sticking.
        pub statuses: Mutex<BTreeMap<String, Vec<TestStatus>>>,
    }

    impl MockRunner {
        pub fn with_statuses(statuses: &[(&str, Vec<TestStatus>)]) -> Self {
            Self {
                invocations: Default::default(),
                statuses: Mutex::new(
                    statuses
                        .iter()
                        .map(|(name, seq)| (name.to_string(), seq.clone()))
                        .collect(),
                ),
            }
        }

        pub fn shortnames(&self) -> Vec<String> {
            self.invocations
                .lock()
                .iter()
                .map(|(_, name)| name.clone())
                .collect()
        }

        pub fn uids(&self) -> Vec<String> {
            self.invocations
                .lock()
                .iter()
                .map(|(uid, _)| uid.clone())
                .collect()
        }
    }

    impl TestRunner for MockRunner {
        fn run_test<'a>(
            &'a self,
            uid: &'a str,
            params: &'a Params,
        ) -> BoxFuture<'a, anyhow::Result<TestResult>> {
            async move {
                let shortname = params.get_str("shortname", "<unnamed>");
                self.invocations
                    .lock()
                    .push((uid.to_owned(), shortname.clone()));
                let status = {
                    let mut statuses = self.statuses.lock();
                    match statuses.get_mut(&shortname) {
                        Some(seq) if seq.len() > 1 => seq.remove(0),
                        Some(seq) => *seq.first().unwrap_or(&TestStatus::Pass),
                        None => TestStatus::Pass,
                    }
                };
                Ok(TestResult {
                    uid: uid.to_owned(),
                    name: params.get_str("name", ""),
                    status,
                    logdir: None,
                })
            }
            .boxed()
        }
    }
}
