// Shared fixtures: a small but complete tutorial suite exercising the whole
// setup chain, state fan-in, and multi-vm leaves.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use indoc::indoc;

use crate::config::{Config, SuiteConfig};
use crate::graph::TestGraph;
use crate::restriction::{Params, Restriction};

const FIXTURE_SETS: &str = indoc! {r#"
    test_timeout_s = 3600

    [vms.vm1]
    variants = ["CentOS.8"]

    [vms.vm2]
    variants = ["Win10"]

    [[sets]]
    name = "install"
    variant = "internal.automated"
    [sets.requires.object]
    state = "root"
    scope = "images"
    [sets.provides.object]
    state = "install"
    scope = "images"

    [[sets]]
    name = "customize"
    variant = "internal.automated"
    [sets.requires.object]
    get = "install"
    state = "install"
    scope = "images"
    [sets.provides.object]
    state = "customize"
    scope = "images"

    [[sets]]
    name = "on_customize"
    variant = "internal.automated"
    [sets.requires.object]
    get = "customize"
    state = "customize"
    scope = "images"
    [sets.provides.object]
    state = "on_customize"
    scope = "vms"

    [[sets]]
    name = "connect"
    variant = "internal.automated"
    [sets.requires.object]
    get = "customize"
    state = "customize"
    scope = "images"
    [sets.provides.object]
    state = "connect"
    scope = "vms"

    [[sets]]
    name = "guisetup"
    variant = "internal.automated"
    [sets.requires.object]
    get = "customize"
    state = "customize"
    scope = "images"

    [[sets.variants]]
    name = "noop"
    [sets.variants.provides.object]
    state = "guisetup.noop"

    [[sets.variants]]
    name = "clicked"
    [sets.variants.provides.object]
    state = "guisetup.clicked"

    [[sets]]
    name = "tutorial1"
    variant = "normal.quicktest"
    vms = ["vm1"]
    [sets.requires.vm1]
    get = "on_customize"
    state = "on_customize"

    [[sets]]
    name = "tutorial2"
    variant = "normal.quicktest"
    vms = ["vm1"]
    [sets.requires.vm1]
    get = "on_customize"
    state = "on_customize"

    [[sets]]
    name = "tutorial3"
    variant = "normal"
    vms = ["vm1", "vm2"]
    [sets.requires.vm1]
    get = "on_customize"
    state = "on_customize"
    [sets.requires.vm2]
    get = "connect"
    state = "connect"

    [[sets]]
    name = "tutorial_get"
    variant = "normal"
    vms = ["vm2"]
    [sets.requires.vm2]
    get = "guisetup"
"#};

pub fn fixture_config(
    nets: usize,
    net1_extra: Option<&str>,
    shared_pool: Option<&str>,
) -> Arc<SuiteConfig> {
    let mut toml = String::new();
    if let Some(pool) = shared_pool {
        writeln!(toml, "shared_pool = \"{pool}\"").unwrap();
    }
    toml.push_str(FIXTURE_SETS);
    for n in 1..=nets {
        writeln!(toml, "\n[nets.net{n}]").unwrap();
        if n == 1 {
            if let Some(extra) = net1_extra {
                writeln!(toml, "{extra}").unwrap();
            }
        }
    }
    let config: Config = toml::from_str(&toml).expect("fixture config parses");
    Arc::new(SuiteConfig::new(config, "/fixture/suite.toml").expect("fixture config is valid"))
}

pub fn graph_with_workers(nets: usize, net1_extra: Option<&str>) -> TestGraph {
    let suite = fixture_config(nets, net1_extra, None);
    TestGraph::new(suite, BTreeMap::new(), &Params::new()).expect("fixture workers parse")
}

pub fn graph_with_pool(nets: usize, shared_pool: &str) -> TestGraph {
    let suite = fixture_config(nets, None, Some(shared_pool));
    TestGraph::new(suite, BTreeMap::new(), &Params::new()).expect("fixture workers parse")
}

pub fn restr(text: &str) -> Restriction {
    Restriction::parse(text).expect("fixture restriction parses")
}
