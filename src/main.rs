use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use flexi_logger::{FileSpec, Logger};
#[allow(unused_imports)]
use log::{debug, error, info, warn};

mod config;
mod errors;
mod graph;
mod node;
mod object;
mod restriction;
mod runner;
mod states;
mod traversal;
mod util;
mod worker;

#[cfg(test)]
mod test_utils;

use config::SuiteConfig;
use errors::TraversalError;
use graph::TestGraph;
use node::{TestNode, TestResult};
use restriction::{overlay, params_from_pairs, Params, ParamsExt as _, Restriction};
use runner::{run_test_node, ProcessRunner};
use states::{FsPoolBackend, StateBackend, StateLocation, StatePool};
use traversal::Traverser;
use util::DisplayablePathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Matrix test orchestrator with setup-state reuse across workers")]
struct Args {
    /// Suite configuration file. Defaults to $SUITE_PATH/suite.toml.
    #[arg(long, global = true)]
    suite: Option<DisplayablePathBuf>,

    /// Where test logs, results and graph dumps go.
    #[arg(long, global = true, default_value = "cartwheel-results")]
    logdir: DisplayablePathBuf,

    /// flexi_logger spec, e.g. "debug" or "cartwheel=debug,info".
    #[arg(long, global = true, default_value = "info")]
    log: String,

    /// Build the complete dependency graph eagerly up front instead of
    /// expanding it lazily during traversal.
    #[arg(long, global = true)]
    auto: bool,

    /// Runtime parameter overrides, repeatable.
    #[arg(short = 'p', long = "param", global = true, value_name = "KEY=VALUE")]
    params: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the selected tests over the pool of workers.
    Run {
        /// Test restriction, e.g. "only tutorial1".
        #[arg(long, default_value = "")]
        tests: String,
    },
    /// List the selected tests and the setup graph they would induce.
    List {
        #[arg(long, default_value = "")]
        tests: String,
    },
    /// Update all stateful objects against the current configuration.
    Update,
    /// Create all vm objects from scratch.
    Create,
    /// Remove all states and images of the selected vms.
    Clean,
    /// Boot the selected vms.
    Boot,
    /// Shut the selected vms down.
    Shutdown,
    /// Retrieve a state from the shared pool to the local worker.
    Download,
    /// Publish a state from the local worker to the shared pool.
    Upload,
    /// Retrieve a state for the selected vms.
    Get,
    /// Save a state for the selected vms.
    Set,
    /// Remove a state for the selected vms.
    Unset,
    /// Check state availability for the selected vms.
    Check,
    /// Pop a state off the shared pool (retrieve and remove).
    Pop,
    /// Push a state onto the shared pool.
    Push,
    /// Collect the vm images of the selected vms from the shared pool.
    Collect,
    /// Run an empty test on the selected vms.
    Noop,
}

fn suite_path(args: &Args) -> PathBuf {
    match &args.suite {
        Some(path) => path.0.clone(),
        None => {
            let base = env::var("SUITE_PATH").unwrap_or_else(|_| ".".to_owned());
            PathBuf::from(base).join("suite.toml")
        }
    }
}

// Runtime params: CLI overrides on top of ambient environment contributions.
fn runtime_params(args: &Args) -> anyhow::Result<Params> {
    let mut params = Params::new();
    if let Ok(prefix) = env::var("PREFIX") {
        params.insert("prefix".to_owned(), prefix);
    }
    if let Ok(sshkey) = env::var("SSHKEY") {
        params.insert("sshkey".to_owned(), sshkey);
    }
    let overrides = params_from_pairs(&args.params)?;
    Ok(overlay(&params, &overrides))
}

// User-level object restrictions, e.g. -p only_vm1=CentOS.
fn object_restrs(params: &Params) -> anyhow::Result<BTreeMap<String, Restriction>> {
    let mut restrs: BTreeMap<String, Restriction> = BTreeMap::new();
    for (suffix, token) in params.suffixed("only") {
        let restr = Restriction::only(token);
        let merged = match restrs.remove(&suffix) {
            Some(existing) => existing.and_also(&restr),
            None => restr,
        };
        restrs.insert(suffix, merged);
    }
    for (suffix, token) in params.suffixed("no") {
        let restr = Restriction::parse(&format!("no {token}"))?;
        let merged = match restrs.remove(&suffix) {
            Some(existing) => existing.and_also(&restr),
            None => restr,
        };
        restrs.insert(suffix, merged);
    }
    Ok(restrs)
}

fn build_graph(
    suite: Arc<SuiteConfig>,
    params: &Params,
    restriction: &Restriction,
    eager: bool,
) -> anyhow::Result<Arc<TestGraph>> {
    let graph = TestGraph::new(suite, object_restrs(params)?, params)?;
    graph.parse_object_trees(restriction, eager)?;
    Ok(Arc::new(graph))
}

fn load_prior_results(logdir: &PathBuf) -> Vec<TestResult> {
    let path = logdir.join("results.json");
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Ignoring unreadable prior results at {path:?}: {e}");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

fn save_results(logdir: &PathBuf, results: &[TestResult]) -> anyhow::Result<()> {
    std::fs::create_dir_all(logdir).with_context(|| format!("creating logdir {logdir:?}"))?;
    let path = logdir.join("results.json");
    std::fs::write(&path, serde_json::to_vec_pretty(results)?)
        .with_context(|| format!("writing results to {path:?}"))?;
    Ok(())
}

// Traverse an already parsed (and possibly policy-flagged) graph with the
// full worker pool, persist results, and derive the exit code.
async fn traverse_graph(
    args: &Args,
    params: &Params,
    suite: &Arc<SuiteConfig>,
    graph: Arc<TestGraph>,
) -> anyhow::Result<ExitCode> {
    info!("Running suite {}", suite.source_path.display());
    let runner = Arc::new(ProcessRunner {
        executor: suite.executor.clone(),
        logdir: args.logdir.0.clone(),
    });
    let pool = Arc::new(StatePool::new(
        Arc::new(FsPoolBackend),
        suite.shared_pool.clone(),
    ));
    let mut traverser = Traverser::new(graph.clone(), runner, pool, params.clone());
    traverser.prior_results = load_prior_results(&args.logdir.0);
    if log::log_enabled!(log::Level::Debug) {
        traverser.dump_dir = Some(args.logdir.join("graph_traverse"));
    }
    let ct = traverser.ct.clone();
    let traverser = Arc::new(traverser);

    // Job-wide cancellation: Ctrl-C and an optional deadline.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, canceling all workers");
            ct.cancel();
        }
    });
    if let Some(deadline) = params.get("job_timeout").and_then(|t| t.parse().ok()) {
        let ct = traverser.ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(deadline)).await;
            warn!("Job deadline of {deadline}s reached, canceling all workers");
            ct.cancel();
        });
    }

    let traversal_result = traverser.run_workers().await;
    graph.visualize(&args.logdir.0, "final").ok();

    // Collect and persist every result the graph accumulated.
    let mut results: Vec<TestResult> = Vec::new();
    for node in graph.nodes() {
        results.extend(node.inner().results.iter().cloned());
    }
    save_results(&args.logdir.0, &results)?;
    let failed: Vec<&TestResult> = results.iter().filter(|r| !r.status.is_ok()).collect();
    for result in &failed {
        info!("{}: {}", result.uid, result.status);
    }
    traversal_result?;

    if failed.is_empty() {
        info!("All {} test results OK", results.len());
        Ok(ExitCode::SUCCESS)
    } else {
        error!("{} of {} test results not OK", failed.len(), results.len());
        Ok(ExitCode::from(1))
    }
}

async fn command_run(args: &Args, params: Params, tests: &str) -> anyhow::Result<ExitCode> {
    let suite = Arc::new(SuiteConfig::from_path(&suite_path(args))?);
    let restriction = Restriction::parse(tests)?;
    let graph = build_graph(suite.clone(), &params, &restriction, args.auto)?;
    traverse_graph(args, &params, &suite, graph).await
}

// The graph-driven manual tools: flag run/clean policy over the full graph,
// then traverse it like a normal job.
async fn command_setup_tool(
    args: &Args,
    params: Params,
    command: &Command,
) -> anyhow::Result<ExitCode> {
    let suite = Arc::new(SuiteConfig::from_path(&suite_path(args))?);
    let restriction = Restriction::parse(&params.get_str("tests", ""))?;
    let graph = build_graph(suite.clone(), &params, &restriction, true)?;
    match command {
        Command::Update => {
            // Redo every setup below the install level, but neither
            // reinstall vms nor run the actual tests.
            graph.flag_children(Some("install"), None, Some(true), Some(false), true);
            for node in graph.nodes() {
                if !node.is_flat() && !node.is_shared_root() && node.stateful_objects().is_empty() {
                    node.inner().should_run_override = Some(false);
                }
            }
            // Setup shared with an explicitly kept subsuite stays untouched.
            if let Some(keep) = params.get("keep_tests") {
                let keep_graph =
                    build_graph(suite.clone(), &params, &Restriction::parse(keep)?, true)?;
                graph.flag_intersection(&keep_graph, Some(false), Some(false), true);
            }
        }
        Command::Create => {
            // Only the install-from-scratch roots run.
            for node in graph.nodes() {
                if node.is_flat() || node.is_shared_root() {
                    continue;
                }
                let mut inner = node.inner();
                inner.should_run_override = Some(node.is_object_root());
                inner.should_clean_override = Some(false);
            }
        }
        Command::Clean => {
            // Run nothing, force-remove every state the graph would create.
            for node in graph.nodes() {
                if node.is_flat() || node.is_shared_root() {
                    continue;
                }
                node.set_param("unset_mode", "fi");
                let mut inner = node.inner();
                inner.should_run_override = Some(false);
                inner.should_clean_override = Some(true);
            }
        }
        _ => unreachable!("only setup tools are dispatched here"),
    }
    traverse_graph(args, &params, &suite, graph).await
}

async fn command_list(args: &Args, params: Params, tests: &str) -> anyhow::Result<ExitCode> {
    let suite = Arc::new(SuiteConfig::from_path(&suite_path(args))?);
    let restriction = Restriction::parse(tests)?;
    let graph = build_graph(suite, &params, &restriction, true)?;

    let mut tests_count = 0;
    for node in graph.nodes() {
        if node.is_flat() || node.is_shared_root() || !node.inner().cloned_nodes.is_empty() {
            continue;
        }
        println!("test    {}:  {}", node.prefix, node.shortname());
        tests_count += 1;
    }
    let vms: Vec<String> = graph
        .objects()
        .into_iter()
        .filter(|o| o.kind == object::ObjectKind::Vm)
        .map(|o| o.id())
        .collect();
    println!("{tests_count} selected test variant(s)");
    println!("{} selected vm variant(s)", vms.len());
    Ok(ExitCode::SUCCESS)
}

// The manual tools act per worker and vm: each builds a single one-shot node
// and hands it to the executor, or talks to the state backend directly.
struct ManualContext {
    suite: Arc<SuiteConfig>,
    params: Params,
    runner: ProcessRunner,
    pool: StatePool,
}

impl ManualContext {
    fn new(args: &Args, params: Params) -> anyhow::Result<Self> {
        let suite = Arc::new(SuiteConfig::from_path(&suite_path(args))?);
        let runner = ProcessRunner {
            executor: suite.executor.clone(),
            logdir: args.logdir.0.clone(),
        };
        let pool = StatePool::new(Arc::new(FsPoolBackend), suite.shared_pool.clone());
        Ok(Self {
            suite,
            params,
            runner,
            pool,
        })
    }

    fn selected_vms(&self) -> Vec<String> {
        match self.params.get("vms") {
            Some(vms) => vms.split_whitespace().map(str::to_owned).collect(),
            None => self.suite.vms.keys().cloned().collect(),
        }
    }

    // Run one tool test per selected vm, sequentially, in the process
    // spawner manner of a single worker.
    async fn run_tool_nodes(&self, tool: &str) -> anyhow::Result<ExitCode> {
        let mut all_ok = true;
        for (i, suffix) in self.selected_vms().iter().enumerate() {
            let shortname = format!("internal.manual.{tool}.{suffix}");
            let mut params = self.params.clone();
            params.insert("name".to_owned(), shortname.clone());
            params.insert("shortname".to_owned(), shortname);
            params.insert("vms".to_owned(), suffix.clone());
            params.insert("type".to_owned(), format!("shared_{tool}"));
            params.insert(
                "test_timeout".to_owned(),
                self.suite.test_timeout.as_secs().to_string(),
            );
            let node = TestNode::new(&format!("m{i}"), None, params);
            info!("Running manual tool {tool} for {suffix}");
            if !run_test_node(&self.runner, &node, false).await? {
                all_ok = false;
            }
        }
        Ok(if all_ok {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        })
    }

    // Target object id and local/pool locations of one vm for state ops.
    fn state_target(&self, suffix: &str) -> anyhow::Result<(String, StateLocation, StateLocation)> {
        let def = self
            .suite
            .vms
            .get(suffix)
            .with_context(|| format!("no vm configured under suffix {suffix:?}"))?;
        let variant = def
            .variants
            .first()
            .with_context(|| format!("vm {suffix:?} has no variants"))?;
        let vm = object::parse_full_vm(&self.suite, suffix, variant)?;
        // Image states are the only transferable ones, target the image.
        let object_id = vm
            .components
            .first()
            .map(|image| image.id())
            .unwrap_or_else(|| vm.id());
        let local = StateLocation {
            worker: self.params.get_str("worker", "net1"),
            path: PathBuf::from(self.params.get_str("state_path", "images")),
        };
        let pool = self
            .pool
            .shared_pool
            .clone()
            .with_context(|| "no shared pool configured in the suite")?;
        Ok((object_id, local, pool))
    }

    async fn run_state_op(&self, op: &str) -> anyhow::Result<ExitCode> {
        let state = self.params.get_str("state", "customize");
        let backend = &self.pool.backend;
        let mut all_ok = true;
        for suffix in self.selected_vms() {
            let (object_id, local, pool) = self.state_target(&suffix)?;
            match op {
                // Transfers from the shared pool into the local worker.
                "get" | "download" | "collect" => {
                    backend.get(&object_id, &state, &pool, &local).await?
                }
                // Transfers from the local worker onto the shared pool.
                "upload" | "push" => backend.get(&object_id, &state, &local, &pool).await?,
                "set" => backend.set(&object_id, &state, &local).await?,
                "unset" => backend.unset(&object_id, &state, &local).await?,
                "pop" => {
                    backend.get(&object_id, &state, &pool, &local).await?;
                    backend.unset(&object_id, &state, &pool).await?;
                }
                "check" => {
                    let present = backend.check(&object_id, &state, &local).await?;
                    println!("{object_id} {state}: {}", if present { "present" } else { "absent" });
                    all_ok &= present;
                }
                _ => bail!("unhandled state operation {op:?}"),
            }
        }
        Ok(if all_ok {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        })
    }
}

async fn command_manual(args: &Args, params: Params, command: &Command) -> anyhow::Result<ExitCode> {
    let context = ManualContext::new(args, params)?;
    match command {
        Command::Boot => context.run_tool_nodes("boot").await,
        Command::Shutdown => context.run_tool_nodes("shutdown").await,
        Command::Noop => context.run_tool_nodes("noop").await,
        Command::Download => context.run_state_op("download").await,
        Command::Upload => context.run_state_op("upload").await,
        Command::Get => context.run_state_op("get").await,
        Command::Set => context.run_state_op("set").await,
        Command::Unset => context.run_state_op("unset").await,
        Command::Check => context.run_state_op("check").await,
        Command::Pop => context.run_state_op("pop").await,
        Command::Push => context.run_state_op("push").await,
        Command::Collect => context.run_state_op("collect").await,
        _ => unreachable!("dispatched before"),
    }
}

async fn dispatch(args: Args) -> anyhow::Result<ExitCode> {
    let params = runtime_params(&args)?;
    match args.command.clone() {
        Command::Run { tests } => command_run(&args, params, &tests).await,
        Command::List { tests } => command_list(&args, params, &tests).await,
        tool @ (Command::Update | Command::Create | Command::Clean) => {
            command_setup_tool(&args, params, &tool).await
        }
        other => command_manual(&args, params, &other).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // The handle must stay alive for the whole run or logging stops.
    let _logger = match Logger::try_with_str(&args.log).and_then(|logger| {
        logger
            .log_to_file(
                FileSpec::default()
                    .directory(args.logdir.0.clone())
                    .basename("cartwheel"),
            )
            .duplicate_to_stderr(flexi_logger::Duplicate::Info)
            .start()
    }) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::from(2);
        }
    };

    match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            // Configuration errors get their own exit code so scripts can
            // tell them apart from test failures.
            let code = e
                .downcast_ref::<TraversalError>()
                .map(|te| te.exit_code())
                .unwrap_or(2);
            ExitCode::from(code as u8)
        }
    }
}
