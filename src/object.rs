use core::fmt;
use std::fmt::{Debug, Display};
use std::sync::{Arc, Weak};

#[allow(unused_imports)]
use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::{SuiteConfig, VmDef};
use crate::errors::TraversalError;
use crate::restriction::{Params, Restriction};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Image,
    Vm,
    Net,
}

impl ObjectKind {
    // The parameter-suffix family the kind belongs to.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Vm => "vms",
            Self::Net => "nets",
        }
    }
}

// A configuration-identified vm/image/net with a variant and parameters,
// used by one or more test nodes. Nets are composed of vms, vms of images;
// the up-links are weak so the composition tree owns downwards only.
pub struct TestObject {
    pub suffix: String,
    // Suffix qualified by the composition chain, e.g. "image1_vm1".
    pub long_suffix: String,
    pub kind: ObjectKind,
    pub variant: String,
    pub params: Params,
    // Compatibility with peers: {peer-suffix -> restriction on its variant}.
    pub restrs: std::collections::BTreeMap<String, Restriction>,
    pub components: Vec<Arc<TestObject>>,
    pub composites: Mutex<Vec<Weak<TestObject>>>,
    pub permanent: bool,
    current_state: Mutex<String>,
}

impl Debug for TestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[object] longsuffix='{}', variant='{}'",
            self.long_suffix, self.variant
        )
    }
}

impl Display for TestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl PartialEq for TestObject {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TestObject {}

impl TestObject {
    fn new(suffix: &str, long_suffix: &str, kind: ObjectKind, variant: &str) -> Self {
        Self {
            suffix: suffix.to_owned(),
            long_suffix: long_suffix.to_owned(),
            kind,
            variant: variant.to_owned(),
            params: Params::new(),
            restrs: Default::default(),
            components: Vec::new(),
            composites: Mutex::new(Vec::new()),
            permanent: false,
            current_state: Mutex::new("unknown".to_owned()),
        }
    }

    // Unique within a suite parse.
    pub fn id(&self) -> String {
        format!("{}-{}", self.long_suffix, self.variant)
    }

    pub fn is_flat(&self) -> bool {
        self.components.is_empty() && self.kind != ObjectKind::Image
    }

    pub fn current_state(&self) -> String {
        self.current_state.lock().clone()
    }

    pub fn set_current_state(&self, state: &str) {
        *self.current_state.lock() = state.to_owned();
    }

    // The form the object contributes to node names: its variant for vms and
    // nets, the owning vm's variant for images.
    pub fn component_form(&self) -> String {
        match self.kind {
            ObjectKind::Image => {
                let composites = self.composites.lock();
                debug_assert!(composites.len() == 1, "image objects need a unique composite");
                composites[0]
                    .upgrade()
                    .map(|vm| vm.component_form())
                    .unwrap_or_default()
            }
            _ => self.variant.clone(),
        }
    }

    // Strip "_<name>"-suffixed keys down to their base form, suffixed values
    // overriding unsuffixed ones. This is how every parameter is resolved in
    // the scope of one object out of a flat multi-object dictionary.
    fn strip_suffix_level(params: &Params, name: &str) -> Params {
        let mut scoped = Params::new();
        let tail = format!("_{name}");
        for (key, value) in params {
            if let Some(base) = key.strip_suffix(&tail) {
                scoped.insert(base.to_owned(), value.clone());
            } else {
                scoped.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        scoped
    }

    // View of a node's parameters filtered through the composition chain so
    // that every parameter is resolved in this object's scope, e.g. for an
    // image "image1" of "vm1": set_state_images_image1_vm1 -> set_state.
    pub fn object_typed_params(&self, params: &Params) -> Params {
        let mut scoped = params.clone();
        for composite in self.composites.lock().iter() {
            if let Some(composite) = composite.upgrade() {
                scoped = Self::strip_suffix_level(&scoped, &composite.suffix);
            }
        }
        scoped = Self::strip_suffix_level(&scoped, &self.suffix);
        Self::strip_suffix_level(&scoped, self.kind.key())
    }

    // The parameter-key fragment states of this object live under, e.g.
    // "vms_vm1" or "images_image1_vm1".
    pub fn state_suffixes(&self) -> String {
        match self.kind {
            ObjectKind::Image => {
                let composites = self.composites.lock();
                let vm = composites
                    .first()
                    .and_then(|w| w.upgrade())
                    .map(|vm| vm.suffix.clone())
                    .unwrap_or_default();
                format!("images_{}_{}", self.suffix, vm)
            }
            _ => format!("{}_{}", self.kind.key(), self.suffix),
        }
    }

    // Append further per-peer restrictions, skipping duplicates.
    pub fn update_restrs(&mut self, restrs: &std::collections::BTreeMap<String, Restriction>) {
        for (suffix, restr) in restrs {
            let merged = match self.restrs.remove(suffix) {
                Some(existing) => existing.and_also(restr),
                None => restr.clone(),
            };
            self.restrs.insert(suffix.clone(), merged);
        }
    }
}

// Parse the objects carrying only the suffix-level variant axis: one vm
// object per configured variant, without any composition.
pub fn parse_flat_vms(suite: &SuiteConfig, suffix: &str) -> anyhow::Result<Vec<Arc<TestObject>>> {
    let def = suite
        .vms
        .get(suffix)
        .ok_or_else(|| anyhow::anyhow!("no vm configured under suffix {suffix:?}"))?;
    Ok(def
        .variants
        .iter()
        .map(|variant| Arc::new(vm_from_def(def, variant)))
        .collect())
}

fn vm_from_def(def: &VmDef, variant: &str) -> TestObject {
    let mut vm = TestObject::new(&def.suffix, &def.suffix, ObjectKind::Vm, variant);
    vm.params = def.params.clone();
    vm.params.insert("main_vm".to_owned(), def.suffix.clone());
    vm.permanent = def.permanent;
    // Lift peer-compatibility parameters into the restriction map, e.g.
    // only_vm2 = "Win10" says this object tolerates only Win10 peers on vm2.
    let mut lifted: std::collections::BTreeMap<String, Restriction> = Default::default();
    for (key, value) in def.params.iter() {
        let restr = if let Some(peer) = key.strip_prefix("only_") {
            Some((peer, Restriction::only(value.clone())))
        } else {
            key.strip_prefix("no_").and_then(|peer| {
                Restriction::parse(&format!("no {value}"))
                    .ok()
                    .map(|r| (peer, r))
            })
        };
        if let Some((peer, restr)) = restr {
            vm.params.remove(key);
            let merged = match lifted.remove(peer) {
                Some(existing) => existing.and_also(&restr),
                None => restr,
            };
            lifted.insert(peer.to_owned(), merged);
        }
    }
    vm.update_restrs(&lifted);
    vm
}

// Fully composed vm (with images) for one concrete variant.
pub fn parse_full_vm(
    suite: &SuiteConfig,
    suffix: &str,
    variant: &str,
) -> anyhow::Result<Arc<TestObject>> {
    let flat = parse_flat_vms(suite, suffix)?
        .into_iter()
        .find(|vm| vm.variant == variant)
        .ok_or_else(|| anyhow::anyhow!("vm {suffix:?} has no variant {variant:?}"))?;
    unflatten_vm(suite, &flat)
}

// Derive the image objects of a vm. Images carry the vm's variant identity
// since they cannot be parsed on their own.
pub fn parse_components_for_vm(
    suite: &SuiteConfig,
    vm: &Arc<TestObject>,
) -> anyhow::Result<Vec<Arc<TestObject>>> {
    let def = suite
        .vms
        .get(&vm.suffix)
        .ok_or_else(|| anyhow::anyhow!("no vm configured under suffix {:?}", vm.suffix))?;
    let mut images = Vec::new();
    for image_suffix in &def.images {
        let long_suffix = format!("{}_{}", image_suffix, vm.suffix);
        let image = Arc::new(TestObject::new(
            image_suffix,
            &long_suffix,
            ObjectKind::Image,
            &vm.variant,
        ));
        image.composites.lock().push(Arc::downgrade(vm));
        images.push(image);
    }
    Ok(images)
}

// Unroll a vm into a full composite (vm plus its images), wiring the
// composition links both ways. The images only hold weak up-links, so the
// freshly created Arc is still uniquely ours to finish off.
pub fn unflatten_vm(suite: &SuiteConfig, vm: &TestObject) -> anyhow::Result<Arc<TestObject>> {
    let def = suite
        .vms
        .get(&vm.suffix)
        .ok_or_else(|| anyhow::anyhow!("no vm configured under suffix {:?}", vm.suffix))?;
    let mut full = vm_from_def(def, &vm.variant);
    full.restrs = vm.restrs.clone();
    let mut full = Arc::new(full);
    let images = parse_components_for_vm(suite, &full)?;
    Arc::get_mut(&mut full)
        .expect("no other strong reference to a freshly composed vm")
        .components = images;
    Ok(full)
}

// Join pre-selected vm variants into one net object. The join is empty (and
// therefore incompatible) when some required vm has no variant surviving its
// peers' restrictions.
pub fn parse_composite_net(
    suite: &SuiteConfig,
    net_suffix: &str,
    vm_objects: &[Arc<TestObject>],
) -> Result<Arc<TestObject>, TraversalError> {
    for vm in vm_objects {
        for peer in vm_objects {
            if vm.suffix == peer.suffix {
                continue;
            }
            if let Some(restr) = vm.restrs.get(&peer.suffix) {
                if !restr.allows(&peer.variant) {
                    return Err(TraversalError::IncompatibleRestriction {
                        suffix: peer.suffix.clone(),
                        restriction: restr.parsable_form(),
                    });
                }
            }
        }
    }
    let variant = vm_objects
        .iter()
        .map(|vm| format!("{}.{}", vm.suffix, vm.variant))
        .collect::<Vec<_>>()
        .join(".");
    let net_def = suite.nets.get(net_suffix);
    let mut net = TestObject::new(net_suffix, net_suffix, ObjectKind::Net, &variant);
    if let Some(def) = net_def {
        net.params = def.params.clone();
    }
    net.params.insert(
        "vms".to_owned(),
        vm_objects
            .iter()
            .map(|vm| vm.suffix.clone())
            .collect::<Vec<_>>()
            .join(" "),
    );
    net.components = vm_objects.to_vec();
    let net = Arc::new(net);
    for vm in vm_objects {
        vm.composites.lock().push(Arc::downgrade(&net));
    }
    Ok(net)
}

// A flat worker-level net: no components yet, just the suffix axis.
pub fn parse_flat_net(suite: &SuiteConfig, net_suffix: &str) -> anyhow::Result<Arc<TestObject>> {
    let def = suite
        .nets
        .get(net_suffix)
        .ok_or_else(|| anyhow::anyhow!("no net configured under suffix {net_suffix:?}"))?;
    let mut net = TestObject::new(net_suffix, net_suffix, ObjectKind::Net, net_suffix);
    net.params = def.params.clone();
    net.params.insert("vms".to_owned(), def.vms.join(" "));
    Ok(Arc::new(net))
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use indoc::indoc;

    use super::*;
    use crate::config::SuiteConfig;

    fn suite() -> SuiteConfig {
        SuiteConfig::new(
            toml::from_str(indoc! {r#"
                [vms.vm1]
                variants = ["CentOS.8", "Win10"]

                [vms.vm2]
                variants = ["Win10"]

                [nets.net1]
            "#})
            .unwrap(),
            "/fake",
        )
        .unwrap()
    }

    #[googletest::test]
    fn test_parse_flat_vms_one_per_variant() {
        let vms = parse_flat_vms(&suite(), "vm1").unwrap();
        assert_that!(vms.len(), eq(2));
        expect_that!(vms[0].id(), eq("vm1-CentOS.8"));
        expect_that!(vms[1].id(), eq("vm1-Win10"));
        expect_that!(vms[0].is_flat(), eq(true));
    }

    #[googletest::test]
    fn test_unflatten_wires_composition_links() {
        let suite = suite();
        let vms = parse_flat_vms(&suite, "vm1").unwrap();
        let full = unflatten_vm(&suite, &vms[0]).unwrap();
        assert_that!(full.components.len(), eq(1));
        let image = &full.components[0];
        expect_that!(image.long_suffix, eq("image1_vm1"));
        expect_that!(image.component_form(), eq("CentOS.8"));
        expect_that!(image.state_suffixes(), eq("images_image1_vm1"));
        let up = image.composites.lock()[0].upgrade().unwrap();
        expect_that!(up.suffix, eq("vm1"));
    }

    #[googletest::test]
    fn test_composite_net_joins_variants() {
        let suite = suite();
        let vm1 = unflatten_vm(&suite, &parse_flat_vms(&suite, "vm1").unwrap()[0]).unwrap();
        let vm2 = unflatten_vm(&suite, &parse_flat_vms(&suite, "vm2").unwrap()[0]).unwrap();
        let net = parse_composite_net(&suite, "net1", &[vm1, vm2]).unwrap();
        expect_that!(net.variant, eq("vm1.CentOS.8.vm2.Win10"));
        expect_that!(
            net.params.get("vms"),
            some(eq(&"vm1 vm2".to_owned()))
        );
    }

    #[googletest::test]
    fn test_incompatible_join_fails() {
        let suite = suite();
        let mut centos = vm_from_def(&suite.vms["vm1"], "CentOS.8");
        centos.restrs.insert("vm2".to_owned(), Restriction::only("Fedora"));
        let centos = unflatten_vm(&suite, &centos).unwrap();
        assert_that!(centos.restrs.len(), eq(1));
        let vm2 = unflatten_vm(&suite, &parse_flat_vms(&suite, "vm2").unwrap()[0]).unwrap();
        let res = parse_composite_net(&suite, "net1", &[centos, vm2]);
        expect_that!(
            res.err().map(|e| e.to_string()),
            some(contains_substring("no valid variants"))
        );
    }

    #[googletest::test]
    fn test_object_typed_params_resolves_scopes() {
        let suite = suite();
        let full = unflatten_vm(&suite, &parse_flat_vms(&suite, "vm1").unwrap()[0]).unwrap();
        let image = &full.components[0];
        let params = Params::from([
            ("set_state_images_image1_vm1".to_owned(), "install".to_owned()),
            ("get_state_vms_vm1".to_owned(), "on_customize".to_owned()),
            ("plain".to_owned(), "kept".to_owned()),
        ]);
        let image_view = image.object_typed_params(&params);
        expect_that!(
            image_view.get("set_state"),
            some(eq(&"install".to_owned()))
        );
        expect_that!(image_view.get("plain"), some(eq(&"kept".to_owned())));
        // The vm-scoped state is not visible at image scope as a state of ours.
        expect_that!(image_view.get("get_state"), none());
        let vm_view = full.object_typed_params(&params);
        expect_that!(
            vm_view.get("get_state"),
            some(eq(&"on_customize".to_owned()))
        );
    }
}
