//! Load-setup orchestration.
//!
//! A [`Session`] owns the search roots, the factory catalog, and the live
//! device registry, and drives the full pipeline for one "load setup"
//! request:
//!
//! 1. resolve the include closure ([`Resolver`](crate::resolver::Resolver))
//! 2. build the device graph ([`DeviceGraph`](crate::graph::DeviceGraph))
//! 3. construct devices in dependency order, staged outside the registry
//! 4. commit — register devices, record failures, apply aliases
//!
//! Resolution-phase errors abort before step 3, so a failed load never
//! mutates the live registry. Construction-phase errors follow the
//! configured [`DeviceErrorPolicy`](crate::resolver::DeviceErrorPolicy):
//! by default a failing device is recorded as unavailable and its
//! dependents fail to bind, while the rest of the graph still loads.
//!
//! Loads are incremental: a second `load` call adds setups on top of the
//! already-active ones, honoring exclusions declared by live setups.
//! `unload` tears everything down in reverse instantiation order.

use crate::error::{SetupError, SetupResult};
use crate::factory::{BoundParam, BoundParams, Device, FactoryCatalog};
use crate::graph::{DeviceGraph, GraphNode};
use crate::registry::{ConstructionFailure, DeviceRegistry};
use crate::resolver::{ActiveSetups, DeviceErrorPolicy, LoadOptions, ResolvedSetup, Resolver};
use crate::setup::descriptor::ParamValue;
use crate::setup::loader::SetupRoots;
use crate::setup::schema::Sysconfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result summary of one successful load operation.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Setups newly loaded, in resolution order.
    pub setups: Vec<String>,
    /// Devices created, in instantiation order (anonymous ones included).
    pub created: Vec<String>,
    /// Devices that failed to construct (empty under `Abort` policy).
    pub failed: Vec<ConstructionFailure>,
    /// Aliases applied as `(alias, target)`.
    pub aliases: Vec<(String, String)>,
    /// Startup code fragments as `(setup, code)` for the integrating
    /// system to execute; this crate only collects them.
    pub startupcode: Vec<(String, String)>,
}

/// Result of a dry-run configuration check.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Setups that would be loaded, in resolution order.
    pub setups: Vec<String>,
    /// Number of devices in the graph, anonymous ones included.
    pub devices: usize,
    /// Problems a real load would run into.
    pub problems: Vec<String>,
}

impl CheckReport {
    /// Whether the checked request would load cleanly.
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Owns the configuration surface and the live device graph of one
/// process.
pub struct Session {
    roots: SetupRoots,
    catalog: FactoryCatalog,
    registry: Arc<DeviceRegistry>,
    active: ActiveSetups,
    sysconfig: Sysconfig,
}

impl Session {
    /// A session over the given search roots and factory catalog.
    pub fn new(roots: SetupRoots, catalog: FactoryCatalog) -> Self {
        Self {
            roots,
            catalog,
            registry: Arc::new(DeviceRegistry::new()),
            active: ActiveSetups::default(),
            sysconfig: Sysconfig::default(),
        }
    }

    /// The live device registry, shared with consumers.
    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    /// The configured search roots.
    pub fn roots(&self) -> &SetupRoots {
        &self.roots
    }

    /// The factory catalog.
    pub fn catalog(&self) -> &FactoryCatalog {
        &self.catalog
    }

    /// Names of currently loaded setups, in load order.
    pub fn loaded_setups(&self) -> &[String] {
        &self.active.loaded
    }

    /// The merged system configuration of all loaded setups.
    pub fn sysconfig(&self) -> &Sysconfig {
        &self.sysconfig
    }

    /// Load one or more setups and construct their devices.
    pub fn load(&mut self, names: &[&str], options: &LoadOptions) -> SetupResult<LoadReport> {
        let request: Vec<String> = names
            .iter()
            .filter(|name| {
                if self.active.loaded.iter().any(|loaded| loaded == *name) {
                    warn!(setup = %name, "setup is already loaded, skipping");
                    false
                } else {
                    true
                }
            })
            .map(|name| name.to_string())
            .collect();
        if request.is_empty() && !names.is_empty() {
            return Ok(LoadReport::default());
        }

        let resolved = Resolver::new(&self.roots).resolve_against(&request, options, &self.active)?;
        let graph = DeviceGraph::build(&resolved)?;
        self.reject_live_collisions(&graph)?;

        // construct devices into a staging area; the live registry is not
        // touched until the whole request has succeeded
        let mut staged: Vec<(GraphNode, Arc<dyn Device>)> = Vec::new();
        let mut staged_index: HashMap<String, Arc<dyn Device>> = HashMap::new();
        let mut failed: HashMap<String, ConstructionFailure> = HashMap::new();

        for node in graph.instantiation_order() {
            match self.construct(node, &staged_index) {
                Ok(device) => {
                    debug!(device = %node.name, class_path = %node.spec.class_path, "device created");
                    staged_index.insert(node.name.clone(), device.clone());
                    staged.push((node.clone(), device));
                }
                Err(err) => match options.on_device_error {
                    DeviceErrorPolicy::Abort => {
                        for (_, device) in staged.iter().rev() {
                            device.shutdown();
                        }
                        return Err(err);
                    }
                    DeviceErrorPolicy::CollectAndContinue => {
                        failed.insert(
                            node.name.clone(),
                            ConstructionFailure {
                                device: node.name.clone(),
                                class_path: node.spec.class_path.clone(),
                                setup: node.setup.clone(),
                                error: err.to_string(),
                            },
                        );
                    }
                },
            }
        }

        // commit
        let mut report = LoadReport {
            setups: resolved.names().iter().map(|s| s.to_string()).collect(),
            startupcode: resolved.startupcode.clone(),
            ..LoadReport::default()
        };
        for (node, device) in staged {
            let exported = !node.anonymous && !node.spec.lowlevel;
            self.registry.insert(
                device,
                node.spec.class_path.clone(),
                node.setup.clone(),
                exported,
            );
            report.created.push(node.name);
        }
        for failure in failed.into_values() {
            report.failed.push(failure.clone());
            self.registry.record_failure(failure);
        }
        report.failed.sort_by(|a, b| a.device.cmp(&b.device));

        report.aliases = self.apply_aliases(&resolved);
        self.remember(&resolved);

        if report.failed.is_empty() {
            info!(setups = ?report.setups, devices = report.created.len(), "setups loaded");
        } else {
            let failed: Vec<&str> = report.failed.iter().map(|f| f.device.as_str()).collect();
            error!(
                setups = ?report.setups,
                devices = report.created.len(),
                ?failed,
                "setups loaded with unavailable devices"
            );
        }
        Ok(report)
    }

    /// Dry-run a load request: resolve, build the graph and audit it
    /// without constructing anything.
    pub fn check(&self, names: &[&str], options: &LoadOptions) -> SetupResult<CheckReport> {
        let request: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        let resolved = Resolver::new(&self.roots).resolve_against(&request, options, &self.active)?;
        let graph = DeviceGraph::build(&resolved)?;

        let mut problems = Vec::new();
        for node in graph.instantiation_order() {
            if self.registry.info(&node.name).is_some() {
                problems.push(format!(
                    "device '{}' (setup '{}') is already live",
                    node.name, node.setup
                ));
            }
            // without a populated catalog this is a pure configuration
            // check, so class paths cannot be audited
            if !self.catalog.is_empty() && !self.catalog.contains(&node.spec.class_path) {
                problems.push(format!(
                    "device '{}': no factory registered for class '{}'",
                    node.name, node.spec.class_path
                ));
            }
        }
        for (device, target) in graph.dangling_references(|name| self.registry.contains(name)) {
            problems.push(format!(
                "device '{device}' references unknown device '{target}'"
            ));
        }

        Ok(CheckReport {
            setups: resolved.names().iter().map(|s| s.to_string()).collect(),
            devices: graph.len(),
            problems,
        })
    }

    /// Unload everything: shut down all devices in reverse instantiation
    /// order and reset the session state.
    pub fn unload(&mut self) {
        info!(setups = ?self.active.loaded, "unloading setups");
        self.registry.teardown_all();
        self.registry.clear_failures();
        self.active = ActiveSetups::default();
        self.sysconfig = Sysconfig::default();
    }

    /// A device name may not collide with a live device from an earlier
    /// load; re-loading the same setup is skipped before resolution, so
    /// any collision here is a genuine conflict.
    fn reject_live_collisions(&self, graph: &DeviceGraph) -> SetupResult<()> {
        for node in graph.instantiation_order() {
            if let Some(live) = self.registry.info(&node.name) {
                return Err(SetupError::DuplicateDevice {
                    device: node.name.clone(),
                    first: live.setup,
                    second: node.setup.clone(),
                });
            }
        }
        Ok(())
    }

    fn construct(
        &self,
        node: &GraphNode,
        staged: &HashMap<String, Arc<dyn Device>>,
    ) -> SetupResult<Arc<dyn Device>> {
        let factory =
            self.catalog
                .get(&node.spec.class_path)
                .ok_or_else(|| SetupError::ClassLoad {
                    device: node.name.clone(),
                    class_path: node.spec.class_path.clone(),
                })?;

        let mut bound = Vec::with_capacity(node.spec.params.len());
        for (pname, pvalue) in &node.spec.params {
            let value = match pvalue {
                ParamValue::Literal(value) => BoundParam::Literal(value.clone()),
                ParamValue::Reference(target) => {
                    BoundParam::Device(self.bind(node, pname, target, staged)?)
                }
                ParamValue::References(targets) => {
                    let mut devices = Vec::with_capacity(targets.len());
                    for target in targets {
                        devices.push(self.bind(node, pname, target, staged)?);
                    }
                    BoundParam::Devices(devices)
                }
                ParamValue::Inline(_) => {
                    // graph construction hoists every inline declaration
                    return Err(SetupError::Construction {
                        device: node.name.clone(),
                        class_path: node.spec.class_path.clone(),
                        source: anyhow::anyhow!("inline device left unhoisted in parameter '{pname}'"),
                    });
                }
            };
            bound.push((pname.clone(), value));
        }

        let params = BoundParams::new(bound);
        factory
            .create(&node.name, &params)
            .map_err(|source| SetupError::Construction {
                device: node.name.clone(),
                class_path: node.spec.class_path.clone(),
                source,
            })
    }

    /// Resolve a reference against the staging area first, then against
    /// devices already live from previous loads.
    fn bind(
        &self,
        node: &GraphNode,
        param: &str,
        target: &str,
        staged: &HashMap<String, Arc<dyn Device>>,
    ) -> SetupResult<Arc<dyn Device>> {
        if let Some(device) = staged.get(target) {
            return Ok(device.clone());
        }
        if let Some(device) = self.registry.get(target) {
            return Ok(device);
        }
        Err(SetupError::UnresolvedReference {
            device: node.name.clone(),
            param: param.to_string(),
            target: target.to_string(),
        })
    }

    /// Point each alias at its highest-priority target that actually
    /// constructed.
    fn apply_aliases(&self, resolved: &ResolvedSetup) -> Vec<(String, String)> {
        let mut aliases: Vec<&String> = resolved.alias_config.keys().collect();
        aliases.sort();

        let mut applied = Vec::new();
        for alias in aliases {
            let candidates = &resolved.alias_config[alias];
            match candidates
                .iter()
                .find(|(target, _)| self.registry.info(target).is_some())
            {
                Some((target, priority)) => {
                    debug!(alias = %alias, target = %target, priority, "applying alias");
                    self.registry.set_alias(alias, target);
                    applied.push((alias.clone(), target.clone()));
                }
                None => {
                    warn!(alias = %alias, "no alias target available, alias not set");
                }
            }
        }
        applied
    }

    fn remember(&mut self, resolved: &ResolvedSetup) {
        for descriptor in &resolved.descriptors {
            self.active.loaded.push(descriptor.name.clone());
            for exclude in &descriptor.excludes {
                self.active
                    .excluded
                    .entry(exclude.clone())
                    .or_insert_with(|| descriptor.name.clone());
            }
        }
        self.sysconfig.absorb(&resolved.sysconfig);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("roots", &self.roots)
            .field("loaded_setups", &self.active.loaded)
            .field("devices", &self.registry.len())
            .finish()
    }
}
