//! Device graph construction and instantiation ordering.
//!
//! [`DeviceGraph::build`] flattens the devices of all resolved setups into
//! one namespace, hoists anonymous inline devices to synthetic hidden
//! names, derives dependency edges from reference-carrying parameters, and
//! computes a topological instantiation order.
//!
//! Edges come only from parameters already classified as references at
//! parse time — a literal string that happens to equal a device name never
//! produces an edge. A reference to a name that is not in the graph is not
//! an error here: on a delta load it may point at a device that is already
//! live, so dangling references are enforced at bind time instead.
//!
//! The topological sort is Kahn's algorithm with a min-heap keyed on
//! declaration order, so devices without any dependency relation
//! instantiate in the order the merged setups declare them. That ordering
//! carries no correctness requirement beyond "dependencies first"; it
//! keeps logs and startup side effects repeatable.

use crate::error::{SetupError, SetupResult};
use crate::resolver::ResolvedSetup;
use crate::setup::descriptor::{DeviceSpec, ParamValue};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::warn;

/// One node of the device graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Device name. Anonymous inline devices get the synthetic name
    /// `<owner>.<param>`, which cannot collide with declared identifiers.
    pub name: String,
    /// Name of the setup that declared the device.
    pub setup: String,
    /// The device specification, with inline params rewritten to
    /// references to the hoisted synthetic nodes.
    pub spec: DeviceSpec,
    /// Whether this node was hoisted from an inline declaration. Anonymous
    /// nodes are owned by their enclosing device and never exported.
    pub anonymous: bool,
}

/// Directed acyclic device dependency graph with a valid instantiation
/// order.
#[derive(Debug, Clone)]
pub struct DeviceGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    /// Direct dependencies per node (indices into `nodes`).
    deps: Vec<Vec<usize>>,
    /// Topological instantiation order (indices into `nodes`).
    order: Vec<usize>,
}

impl DeviceGraph {
    /// Build the graph for a resolved setup.
    ///
    /// Fails with [`SetupError::DuplicateDevice`] when two setups declare
    /// differing devices under one name, and with
    /// [`SetupError::DependencyCycle`] when references form a cycle.
    pub fn build(resolved: &ResolvedSetup) -> SetupResult<Self> {
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        // declaration-order sort key per node; hoisted devices inherit
        // their owner's key so they instantiate next to it
        let mut keys: Vec<usize> = Vec::new();

        // flatten all named devices into one namespace
        for descriptor in &resolved.descriptors {
            for (name, spec) in &descriptor.devices {
                if let Some(&prior) = index.get(name) {
                    let prior_node = &nodes[prior];
                    if prior_node.spec == *spec {
                        warn!(
                            device = %name,
                            first = %prior_node.setup,
                            second = %descriptor.name,
                            "device respecified identically, keeping one instance"
                        );
                        continue;
                    }
                    return Err(SetupError::DuplicateDevice {
                        device: name.clone(),
                        first: prior_node.setup.clone(),
                        second: descriptor.name.clone(),
                    });
                }
                index.insert(name.clone(), nodes.len());
                keys.push(nodes.len());
                nodes.push(GraphNode {
                    name: name.clone(),
                    setup: descriptor.name.clone(),
                    spec: spec.clone(),
                    anonymous: false,
                });
            }
        }

        // hoist inline devices; nodes pushed here are revisited by the
        // loop, so arbitrarily nested declarations unfold iteratively
        let mut current = 0;
        while current < nodes.len() {
            let mut hoisted: Vec<GraphNode> = Vec::new();
            {
                let node = &mut nodes[current];
                for (pname, pvalue) in &mut node.spec.params {
                    if let ParamValue::Inline(inner) = pvalue {
                        let synthetic = format!("{}.{}", node.name, pname);
                        hoisted.push(GraphNode {
                            name: synthetic.clone(),
                            setup: node.setup.clone(),
                            spec: (**inner).clone(),
                            anonymous: true,
                        });
                        // the owner now depends on the hoisted device like
                        // on any other reference
                        *pvalue = ParamValue::Reference(synthetic);
                    }
                }
            }
            for node in hoisted {
                index.insert(node.name.clone(), nodes.len());
                keys.push(keys[current]);
                nodes.push(node);
            }
            current += 1;
        }

        // dependency edges from reference parameters
        let count = nodes.len();
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut in_degree: Vec<usize> = vec![0; count];
        for (idx, node) in nodes.iter().enumerate() {
            for target in node_references(node) {
                if let Some(&dep) = index.get(target) {
                    deps[idx].push(dep);
                    dependents[dep].push(idx);
                    in_degree[idx] += 1;
                }
                // unknown targets may be live from a previous load;
                // checked at bind time
            }
        }

        // Kahn's algorithm; min-heap on (declaration key, index) keeps
        // independent devices in declaration order
        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = BinaryHeap::new();
        for (idx, &degree) in in_degree.iter().enumerate() {
            if degree == 0 {
                ready.push(Reverse((keys[idx], idx)));
            }
        }
        let mut order: Vec<usize> = Vec::with_capacity(count);
        let mut remaining = in_degree.clone();
        while let Some(Reverse((_, idx))) = ready.pop() {
            order.push(idx);
            for &next in &dependents[idx] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    ready.push(Reverse((keys[next], next)));
                }
            }
        }

        if order.len() != count {
            let members = cycle_members(&nodes, &dependents, &order);
            return Err(SetupError::DependencyCycle { members });
        }

        Ok(Self {
            nodes,
            index,
            deps,
            order,
        })
    }

    /// Number of nodes, anonymous ones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a device of this name is part of the graph.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).map(|&idx| &self.nodes[idx])
    }

    /// Nodes in instantiation order (dependencies before dependents).
    pub fn instantiation_order(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().map(|&idx| &self.nodes[idx])
    }

    /// Names of the direct dependencies of a device.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        match self.index.get(name) {
            Some(&idx) => self.deps[idx]
                .iter()
                .map(|&dep| self.nodes[dep].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All reference targets of a node that are neither in this graph nor
    /// satisfied elsewhere, according to `is_known`.
    pub fn dangling_references<F>(&self, is_known: F) -> Vec<(String, String)>
    where
        F: Fn(&str) -> bool,
    {
        let mut dangling = Vec::new();
        for node in &self.nodes {
            for target in node_references(node) {
                if !self.index.contains_key(target) && !is_known(target) {
                    dangling.push((node.name.clone(), target.to_string()));
                }
            }
        }
        dangling
    }
}

/// All reference targets named by a node's parameters.
fn node_references(node: &GraphNode) -> impl Iterator<Item = &str> {
    node.spec.params.iter().flat_map(|(_, value)| match value {
        ParamValue::Reference(target) => std::slice::from_ref(target),
        ParamValue::References(targets) => targets.as_slice(),
        _ => &[],
    })
    .map(String::as_str)
}

/// Isolate the cycle members from Kahn leftovers.
///
/// Leftover nodes are the cycle(s) plus everything downstream of them.
/// Repeatedly trimming leftovers that no other leftover depends on peels
/// off the downstream tail and keeps the cycles.
fn cycle_members(nodes: &[GraphNode], dependents: &[Vec<usize>], order: &[usize]) -> Vec<String> {
    let mut leftover: Vec<bool> = vec![true; nodes.len()];
    for &idx in order {
        leftover[idx] = false;
    }
    loop {
        let mut changed = false;
        for idx in 0..nodes.len() {
            if leftover[idx] && !dependents[idx].iter().any(|&dep| leftover[dep]) {
                leftover[idx] = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    nodes
        .iter()
        .enumerate()
        .filter(|(idx, _)| leftover[*idx])
        .map(|(_, node)| node.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolvedSetup;
    use crate::setup::descriptor::SetupDescriptor;
    use crate::setup::schema::Sysconfig;
    use std::collections::HashMap;

    fn resolved_from(sources: &[(&str, &str)]) -> ResolvedSetup {
        ResolvedSetup {
            descriptors: sources
                .iter()
                .map(|(name, src)| SetupDescriptor::parse(name, src).unwrap())
                .collect(),
            sysconfig: Sysconfig::default(),
            startupcode: Vec::new(),
            alias_config: HashMap::new(),
        }
    }

    #[test]
    fn dependencies_order_before_dependents() {
        let resolved = resolved_from(&[(
            "table",
            r#"
[devices.omega]
class = "generic.Axis"
[devices.omega.params]
motor = "omega_mot"

[devices.omega_mot]
class = "virtual.Motor"
"#,
        )]);
        let graph = DeviceGraph::build(&resolved).unwrap();
        let order: Vec<&str> = graph.instantiation_order().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["omega_mot", "omega"]);
        assert_eq!(graph.dependencies("omega"), vec!["omega_mot"]);
    }

    #[test]
    fn independent_devices_keep_declaration_order() {
        let resolved = resolved_from(&[(
            "s",
            r#"
[devices.zebra]
class = "virtual.Motor"
[devices.alpha]
class = "virtual.Motor"
[devices.mike]
class = "virtual.Motor"
"#,
        )]);
        let graph = DeviceGraph::build(&resolved).unwrap();
        let order: Vec<&str> = graph.instantiation_order().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["zebra", "alpha", "mike"]);
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let resolved = resolved_from(&[(
            "s",
            r#"
[devices.dev1]
class = "generic.Axis"
[devices.dev1.params]
motor = "dev2"

[devices.dev2]
class = "generic.Axis"
[devices.dev2.params]
coder = "dev1"
"#,
        )]);
        match DeviceGraph::build(&resolved) {
            Err(SetupError::DependencyCycle { members }) => {
                assert_eq!(members, vec!["dev1", "dev2"]);
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_report_excludes_downstream_devices() {
        let resolved = resolved_from(&[(
            "s",
            r#"
[devices.a]
class = "generic.Axis"
[devices.a.params]
motor = "b"

[devices.b]
class = "generic.Axis"
[devices.b.params]
motor = "a"

[devices.tail]
class = "generic.Axis"
[devices.tail.params]
motor = "a"
"#,
        )]);
        match DeviceGraph::build(&resolved) {
            Err(SetupError::DependencyCycle { members }) => {
                assert_eq!(members, vec!["a", "b"]);
            }
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }

    #[test]
    fn literal_lookalike_adds_no_edge() {
        let resolved = resolved_from(&[(
            "s",
            r#"
[devices.display]
class = "generic.Display"
[devices.display.params]
fmtstr = "shutter"

[devices.shutter]
class = "generic.Switch"
"#,
        )]);
        let graph = DeviceGraph::build(&resolved).unwrap();
        assert!(graph.dependencies("display").is_empty());
    }

    #[test]
    fn inline_device_is_hoisted_and_ordered_first() {
        let resolved = resolved_from(&[(
            "s",
            r#"
[devices.axis1]
class = "generic.Axis"
[devices.axis1.params.motor]
class = "virtual.Motor"
params = { speed = 1.5 }
"#,
        )]);
        let graph = DeviceGraph::build(&resolved).unwrap();
        assert_eq!(graph.len(), 2);

        let anon = graph.node("axis1.motor").unwrap();
        assert!(anon.anonymous);
        assert_eq!(anon.spec.class_path, "virtual.Motor");

        let order: Vec<&str> = graph.instantiation_order().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["axis1.motor", "axis1"]);
        assert_eq!(graph.dependencies("axis1"), vec!["axis1.motor"]);
    }

    #[test]
    fn nested_inline_devices_unfold() {
        let resolved = resolved_from(&[(
            "s",
            r#"
[devices.axis1]
class = "generic.Axis"
[devices.axis1.params.motor]
class = "generic.Slave"
[devices.axis1.params.motor.params.device]
class = "virtual.Motor"
"#,
        )]);
        let graph = DeviceGraph::build(&resolved).unwrap();
        let order: Vec<&str> = graph.instantiation_order().map(|n| n.name.as_str()).collect();
        assert_eq!(
            order,
            vec!["axis1.motor.device", "axis1.motor", "axis1"]
        );
    }

    #[test]
    fn duplicate_device_across_setups_is_rejected() {
        let resolved = resolved_from(&[
            (
                "s1",
                "[devices.shutter]\nclass = \"generic.Switch\"\n[devices.shutter.params]\nfmtstr = \"%s\"\n",
            ),
            (
                "s2",
                "[devices.shutter]\nclass = \"tango.Switch\"\n",
            ),
        ]);
        match DeviceGraph::build(&resolved) {
            Err(SetupError::DuplicateDevice { device, first, second }) => {
                assert_eq!(device, "shutter");
                assert_eq!(first, "s1");
                assert_eq!(second, "s2");
            }
            other => panic!("expected DuplicateDevice, got {other:?}"),
        }
    }

    #[test]
    fn identical_respecification_is_tolerated() {
        let src = "[devices.shutter]\nclass = \"generic.Switch\"\n";
        let resolved = resolved_from(&[("s1", src), ("s2", src)]);
        let graph = DeviceGraph::build(&resolved).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.node("shutter").unwrap().setup, "s1");
    }

    #[test]
    fn dangling_reference_is_not_a_build_error() {
        let resolved = resolved_from(&[(
            "s",
            r#"
[devices.omega]
class = "generic.Axis"
[devices.omega.params]
motor = "ghost"
"#,
        )]);
        let graph = DeviceGraph::build(&resolved).unwrap();
        assert_eq!(
            graph.dangling_references(|_| false),
            vec![("omega".to_string(), "ghost".to_string())]
        );
        assert!(graph.dangling_references(|name| name == "ghost").is_empty());
    }

    #[test]
    fn reference_lists_produce_edges() {
        let resolved = resolved_from(&[(
            "s",
            r#"
[devices.scan]
class = "generic.Scanner"
[devices.scan.params]
moveables = ["x", "y"]

[devices.x]
class = "virtual.Motor"
[devices.y]
class = "virtual.Motor"
"#,
        )]);
        let graph = DeviceGraph::build(&resolved).unwrap();
        let order: Vec<&str> = graph.instantiation_order().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["x", "y", "scan"]);
    }
}
