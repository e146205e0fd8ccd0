use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::debug;
use serde::Deserialize;

use crate::restriction::{Params, Restriction};

// Where a named state lives on an object: on the vm itself (e.g. a running
// snapshot) or on one of its images (e.g. a qcow2 backing chain entry).
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateScope {
    #[default]
    Vms,
    Images,
}

// When to stop re-running a test that has retries configured.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryStop {
    #[default]
    None,
    Pass,
    Warn,
    Fail,
    Error,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Requires {
    /// Name of the test set that provides this dependency. Not needed when
    /// the state is the "root" sentinel (install-from-scratch).
    #[serde(default)]
    pub get: Option<String>,
    /// The state to consume. Left empty it means "whatever the get set
    /// provides", which is where branch cloning comes from when the get set
    /// has several variants.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub scope: StateScope,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Provides {
    pub state: String,
    #[serde(default)]
    pub scope: StateScope,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct SetVariant {
    name: String,
    #[serde(default)]
    provides: BTreeMap<String, Provides>,
    #[serde(default)]
    params: Params,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct Set {
    name: String,
    /// Dotted variant path the set sits under, e.g. "normal.quicktest" or
    /// "internal.automated". The full name is "<variant>.<name>".
    variant: String,
    /// Test type handed to the executor. Defaults to the set name.
    #[serde(default)]
    r#type: Option<String>,
    /// Vm suffixes the set binds to. An empty list makes the set generic:
    /// it is instantiated per object on demand (the internal setup sets),
    /// with requires/provides keyed under the placeholder "object".
    #[serde(default)]
    vms: Vec<String>,
    #[serde(default)]
    requires: BTreeMap<String, Requires>,
    #[serde(default)]
    provides: BTreeMap<String, Provides>,
    /// Per-suffix compatibility restrictions, e.g. only = { vm1 = "CentOS" }.
    #[serde(default)]
    only: BTreeMap<String, String>,
    #[serde(default)]
    no: BTreeMap<String, String>,
    #[serde(default)]
    retry_attempts: u64,
    #[serde(default)]
    retry_stop: RetryStop,
    #[serde(default)]
    test_timeout_s: Option<u64>,
    #[serde(default)]
    params: Params,
    /// Sub-variants of the set; each one becomes its own parsable flat node.
    #[serde(default)]
    variants: Vec<SetVariant>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct Vm {
    #[serde(default = "default_variants")]
    variants: Vec<String>,
    #[serde(default = "default_images")]
    images: Vec<String>,
    #[serde(default)]
    permanent: bool,
    #[serde(default)]
    params: Params,
}

fn default_variants() -> Vec<String> {
    vec!["default".to_owned()]
}

fn default_images() -> Vec<String> {
    vec!["image1".to_owned()]
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct Net {
    /// Which vm suffixes this net can host. Empty means all of them.
    #[serde(default)]
    vms: Vec<String>,
    #[serde(default)]
    params: Params,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Executor {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_shutdown_grace_period")]
    /// When a test is no longer wanted it's SIGTERMed. If it doesn't respond
    /// (by dying) after this duration it will then be SIGKILLed.
    pub shutdown_grace_period_s: u64,
}

fn default_program() -> String {
    "bash".to_owned()
}

fn default_shutdown_grace_period() -> u64 {
    60
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            shutdown_grace_period_s: default_shutdown_grace_period(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_test_timeout")]
    pub test_timeout_s: u64,
    /// Path of the shared state pool, if any. Workers fall back to it when
    /// no peer has the state they need.
    #[serde(default)]
    pub shared_pool: Option<PathBuf>,
    #[serde(default)]
    pub executor: Executor,
    // Default is just here to make testing snippets easier.
    #[serde(default)]
    sets: Vec<Set>,
    #[serde(default)]
    vms: BTreeMap<String, Vm>,
    #[serde(default)]
    nets: BTreeMap<String, Net>,
}

fn default_test_timeout() -> u64 {
    3600
}

// The "real" objects the raw deserialized config is converted into.

#[derive(Debug, Clone, PartialEq)]
pub struct TestSet {
    pub name: String,
    pub variant: String,
    pub test_type: String,
    pub vms: Vec<String>,
    pub requires: BTreeMap<String, Requires>,
    pub provides: BTreeMap<String, Provides>,
    pub restrs: BTreeMap<String, Restriction>,
    pub retry_attempts: u64,
    pub retry_stop: RetryStop,
    pub test_timeout_s: Option<u64>,
    pub params: Params,
    /// Sub-variant tag when this set was expanded from a variant list.
    pub tag: Option<String>,
}

impl TestSet {
    // Full dotted name, unique within the suite.
    pub fn full_name(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}.{}.{}", self.variant, self.name, tag),
            None => format!("{}.{}", self.variant, self.name),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.variant.split('.').next() == Some("internal")
    }

    // Generic sets bind to no vm until a dependency instantiates them for a
    // concrete object.
    pub fn is_generic(&self) -> bool {
        self.vms.is_empty()
    }

    // Whether this set is an install-from-scratch root for some object.
    pub fn is_terminal(&self) -> bool {
        self.requires
            .values()
            .any(|r| r.state.as_deref() == Some("root"))
    }

    // Bind a generic set to one concrete vm suffix, re-keying the "object"
    // placeholder entries. A no-op for sets that are already concrete.
    pub fn materialize_for(&self, suffix: &str) -> TestSet {
        if !self.is_generic() {
            return self.clone();
        }
        fn rekey<V: Clone>(map: &BTreeMap<String, V>, suffix: &str) -> BTreeMap<String, V> {
            map.iter()
                .map(|(k, v)| {
                    let k = if k == "object" { suffix } else { k };
                    (k.to_owned(), v.clone())
                })
                .collect()
        }
        let mut bound = self.clone();
        bound.vms = vec![suffix.to_owned()];
        bound.requires = rekey(&self.requires, suffix);
        bound.provides = rekey(&self.provides, suffix);
        bound
    }
}

#[derive(Debug, Clone)]
pub struct VmDef {
    pub suffix: String,
    pub variants: Vec<String>,
    pub images: Vec<String>,
    pub permanent: bool,
    pub params: Params,
}

#[derive(Debug, Clone)]
pub struct NetDef {
    pub suffix: String,
    pub vms: Vec<String>,
    pub params: Params,
}

#[derive(Debug)]
pub struct SuiteConfig {
    pub source_path: PathBuf,
    pub sets: Vec<Arc<TestSet>>,
    pub vms: BTreeMap<String, VmDef>,
    pub nets: BTreeMap<String, NetDef>,
    pub executor: Executor,
    pub shared_pool: Option<PathBuf>,
    pub test_timeout: Duration,
}

impl SuiteConfig {
    pub fn new(config: Config, source_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut sets: Vec<Arc<TestSet>> = Vec::new();
        let vms: BTreeMap<String, VmDef> = config
            .vms
            .iter()
            .map(|(suffix, vm)| {
                (
                    suffix.clone(),
                    VmDef {
                        suffix: suffix.clone(),
                        variants: vm.variants.clone(),
                        images: vm.images.clone(),
                        permanent: vm.permanent,
                        params: vm.params.clone(),
                    },
                )
            })
            .collect();

        for set in &config.sets {
            for suffix in &set.vms {
                if !vms.contains_key(suffix) {
                    bail!("test set {:?} uses undefined vm {:?}", set.name, suffix);
                }
            }
            // The simple parsing shortcut from older configurations is not
            // emulated, reject it loudly rather than guessing what it meant.
            if set.params.get("get_parse").map(String::as_str) == Some("simple") {
                bail!(
                    "test set {:?} requests get_parse=simple which is not supported; \
                     drop the parameter to use full dependency resolution",
                    set.name
                );
            }
            let mut restrs = BTreeMap::new();
            for (suffix, token) in &set.only {
                restrs.insert(suffix.clone(), Restriction::only(token.clone()));
            }
            for (suffix, token) in &set.no {
                let no_restr = Restriction::parse(&format!("no {token}"))?;
                let merged = match restrs.remove(suffix) {
                    Some(existing) => existing.and_also(&no_restr),
                    None => no_restr,
                };
                restrs.insert(suffix.clone(), merged);
            }
            let base = TestSet {
                name: set.name.clone(),
                variant: set.variant.clone(),
                test_type: set.r#type.clone().unwrap_or_else(|| set.name.clone()),
                vms: set.vms.clone(),
                requires: set.requires.clone(),
                provides: set.provides.clone(),
                restrs,
                retry_attempts: set.retry_attempts,
                retry_stop: set.retry_stop,
                test_timeout_s: set.test_timeout_s,
                params: set.params.clone(),
                tag: None,
            };
            if set.variants.is_empty() {
                sets.push(Arc::new(base));
            } else {
                for variant in &set.variants {
                    let mut expanded = base.clone();
                    expanded.tag = Some(variant.name.clone());
                    for (suffix, provides) in &variant.provides {
                        expanded.provides.insert(suffix.clone(), provides.clone());
                    }
                    for (k, v) in &variant.params {
                        expanded.params.insert(k.clone(), v.clone());
                    }
                    sets.push(Arc::new(expanded));
                }
            }
        }

        // Dependency references must resolve to parsable sets.
        for set in &sets {
            for (suffix, requires) in &set.requires {
                let generic_entry = set.is_generic() && suffix == "object";
                if !generic_entry && !set.vms.contains(suffix) {
                    bail!(
                        "set {:?} requires state on {:?} which it does not use",
                        set.full_name(),
                        suffix
                    );
                }
                if requires.state.as_deref() == Some("root") {
                    continue;
                }
                let get = requires.get.as_ref().with_context(|| {
                    format!(
                        "set {:?} names no setup set for its dependency on {:?}",
                        set.full_name(),
                        suffix
                    )
                })?;
                if !sets.iter().any(|s| &s.name == get) {
                    bail!("set {:?} requires unknown setup set {:?}", set.name, get);
                }
            }
            if set.is_terminal() && set.provides.is_empty() {
                bail!(
                    "terminal set {:?} must provide the state it installs",
                    set.full_name()
                );
            }
        }

        let mut nets: BTreeMap<String, NetDef> = config
            .nets
            .iter()
            .map(|(suffix, net)| {
                let net_vms = if net.vms.is_empty() {
                    vms.keys().cloned().collect()
                } else {
                    net.vms.clone()
                };
                (
                    suffix.clone(),
                    NetDef {
                        suffix: suffix.clone(),
                        vms: net_vms,
                        params: net.params.clone(),
                    },
                )
            })
            .collect();
        // A suite with no nets still has exactly one implicit worker net.
        if nets.is_empty() {
            nets.insert(
                "net1".to_owned(),
                NetDef {
                    suffix: "net1".to_owned(),
                    vms: vms.keys().cloned().collect(),
                    params: Params::new(),
                },
            );
        }
        for net in nets.values() {
            for suffix in &net.vms {
                if !vms.contains_key(suffix) {
                    bail!("net {:?} hosts undefined vm {:?}", net.suffix, suffix);
                }
            }
        }

        Ok(Self {
            source_path: source_path.into(),
            sets,
            vms,
            nets,
            executor: config.executor,
            shared_pool: config.shared_pool,
            test_timeout: Duration::from_secs(config.test_timeout_s),
        })
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading suite config {path:?}"))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("parsing suite config {path:?}"))?;
        Self::new(config, path)
    }

    pub fn set_by_full_name(&self, full_name: &str) -> Option<Arc<TestSet>> {
        self.sets
            .iter()
            .find(|s| s.full_name() == full_name)
            .cloned()
    }

    // All expansions of a named setup set that provide some state for the
    // given vm suffix, generic sets materialized for it. More than one here
    // is what triggers branch cloning.
    pub fn providers(&self, set_name: &str, suffix: &str) -> Vec<Arc<TestSet>> {
        self.sets
            .iter()
            .filter(|s| s.name == set_name)
            .filter(|s| {
                s.provides.contains_key(suffix)
                    || (s.is_generic() && s.provides.contains_key("object"))
            })
            .map(|s| Arc::new(s.materialize_for(suffix)))
            .collect()
    }

    pub fn test_timeout_for(&self, set: &TestSet) -> Duration {
        set.test_timeout_s
            .map(Duration::from_secs)
            .unwrap_or(self.test_timeout)
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(toml: &str) -> anyhow::Result<SuiteConfig> {
        SuiteConfig::new(toml::from_str(toml).unwrap(), "/fake/suite.toml")
    }

    #[googletest::test]
    fn test_minimal_suite() {
        let suite = parse(indoc! {r#"
            [vms.vm1]
            variants = ["CentOS.8"]

            [[sets]]
            name = "tutorial1"
            variant = "normal.quicktest"
            vms = ["vm1"]
        "#})
        .unwrap();
        assert_eq!(suite.sets.len(), 1);
        assert_eq!(suite.sets[0].full_name(), "normal.quicktest.tutorial1");
        assert_eq!(suite.sets[0].test_type, "tutorial1");
        // One implicit net hosting everything.
        assert_eq!(suite.nets.keys().cloned().collect::<Vec<_>>(), vec!["net1"]);
        assert_eq!(suite.nets["net1"].vms, vec!["vm1"]);
    }

    #[googletest::test]
    fn test_undefined_vm_reference_fails() {
        let res = parse(indoc! {r#"
            [[sets]]
            name = "tutorial1"
            variant = "normal"
            vms = ["vm9"]
        "#});
        expect_that!(res, err(displays_as(contains_substring("undefined vm"))));
    }

    #[googletest::test]
    fn test_unknown_setup_set_fails() {
        let res = parse(indoc! {r#"
            [vms.vm1]

            [[sets]]
            name = "tutorial1"
            variant = "normal"
            vms = ["vm1"]
            [sets.requires.vm1]
            get = "no_such_setup"
            state = "whatever"
        "#});
        expect_that!(
            res,
            err(displays_as(contains_substring("unknown setup set")))
        );
    }

    #[googletest::test]
    fn test_simple_parse_mode_rejected() {
        let res = parse(indoc! {r#"
            [vms.vm1]

            [[sets]]
            name = "tutorial1"
            variant = "normal"
            vms = ["vm1"]
            [sets.params]
            get_parse = "simple"
        "#});
        expect_that!(
            res,
            err(displays_as(contains_substring("get_parse=simple")))
        );
    }

    #[googletest::test]
    fn test_variant_expansion_multiplies_sets() {
        let suite = parse(indoc! {r#"
            [vms.vm1]

            [[sets]]
            name = "guisetup"
            variant = "internal.automated"
            vms = ["vm1"]

            [[sets.variants]]
            name = "noop"
            [sets.variants.provides.vm1]
            state = "guisetup.noop"

            [[sets.variants]]
            name = "clicked"
            [sets.variants.provides.vm1]
            state = "guisetup.clicked"
        "#})
        .unwrap();
        assert_eq!(suite.sets.len(), 2);
        assert_eq!(suite.sets[0].full_name(), "internal.automated.guisetup.noop");
        assert_eq!(suite.providers("guisetup", "vm1").len(), 2);
    }

    #[googletest::test]
    fn test_terminal_set_needs_no_get() {
        let suite = parse(indoc! {r#"
            [vms.vm1]

            [[sets]]
            name = "install"
            variant = "internal.automated"
            vms = ["vm1"]
            [sets.requires.vm1]
            state = "root"
            scope = "images"
            [sets.provides.vm1]
            state = "install"
            scope = "images"
        "#})
        .unwrap();
        assert_that!(suite.sets[0].is_terminal(), eq(true));
    }

    #[googletest::test]
    fn test_compat_restrictions_parsed() {
        let suite = parse(indoc! {r#"
            [vms.vm1]
            variants = ["CentOS.8", "Win10"]

            [[sets]]
            name = "tutorial1"
            variant = "normal.quicktest"
            vms = ["vm1"]
            [sets.only]
            vm1 = "CentOS"
        "#})
        .unwrap();
        let restr = &suite.sets[0].restrs["vm1"];
        expect_that!(restr.allows("CentOS.8"), eq(true));
        expect_that!(restr.allows("Win10"), eq(false));
    }
}
