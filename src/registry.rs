//! Live device registry.
//!
//! The registry is the process-wide, named lookup of constructed device
//! objects, with lifecycle "live until explicit unload". It is an explicit
//! object passed by reference to consumers (command layer, poller,
//! daemon), never ambient global state.
//!
//! # Thread Safety
//!
//! The device map uses `DashMap`, so concurrent readers of already
//! constructed devices never contend on a global lock. During a load the
//! session is the sole writer: devices are staged outside the registry and
//! committed only after construction succeeds, so a failed load leaves the
//! live state untouched.

use crate::factory::Device;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// A registered device with its bookkeeping metadata.
struct RegisteredDevice {
    device: Arc<dyn Device>,
    class_path: String,
    setup: String,
    exported: bool,
}

/// Information about a registered device (returned by list operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name.
    pub name: String,
    /// Dotted path of the implementing class.
    pub class_path: String,
    /// Setup that declared the device.
    pub setup: String,
    /// Whether the device is visible in the user namespace. Lowlevel and
    /// anonymous devices are registered hidden.
    pub exported: bool,
}

/// Record of a device that failed to construct.
///
/// Failures are kept so UIs and operators can see which configured
/// hardware is unavailable without digging through logs.
#[derive(Debug, Clone)]
pub struct ConstructionFailure {
    /// Device that failed to construct.
    pub device: String,
    /// Its class path.
    pub class_path: String,
    /// Setup that declared it.
    pub setup: String,
    /// Error message describing the failure.
    pub error: String,
}

/// Central registry of live devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, RegisteredDevice>,
    /// Alias name -> target device name.
    aliases: DashMap<String, String>,
    /// Devices that failed to construct in the most recent loads.
    failures: DashMap<String, ConstructionFailure>,
    /// Instantiation order, used for reverse-order teardown.
    order: Mutex<Vec<String>>,
}

impl DeviceRegistry {
    /// A new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live device by name, following one alias hop.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Device>> {
        if let Some(entry) = self.devices.get(name) {
            return Some(entry.device.clone());
        }
        let target = self.aliases.get(name)?.clone();
        self.devices.get(&target).map(|entry| entry.device.clone())
    }

    /// Whether a device (or alias) of this name is live.
    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name) || self.aliases.contains_key(name)
    }

    /// The device a given alias currently points at.
    pub fn alias_target(&self, alias: &str) -> Option<String> {
        self.aliases.get(alias).map(|target| target.clone())
    }

    /// Bookkeeping information for a live device.
    pub fn info(&self, name: &str) -> Option<DeviceInfo> {
        self.devices.get(name).map(|entry| DeviceInfo {
            name: name.to_string(),
            class_path: entry.class_path.clone(),
            setup: entry.setup.clone(),
            exported: entry.exported,
        })
    }

    /// Number of live devices (aliases not counted).
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are live.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All live devices in instantiation order.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let order = self.order.lock().unwrap_or_else(|p| p.into_inner());
        order
            .iter()
            .filter_map(|name| {
                self.devices.get(name).map(|entry| DeviceInfo {
                    name: name.clone(),
                    class_path: entry.class_path.clone(),
                    setup: entry.setup.clone(),
                    exported: entry.exported,
                })
            })
            .collect()
    }

    /// Devices visible in the user namespace, in instantiation order.
    pub fn list_exported(&self) -> Vec<DeviceInfo> {
        self.list_devices()
            .into_iter()
            .filter(|info| info.exported)
            .collect()
    }

    /// Insert a constructed device. Called by the session when committing
    /// a successful load.
    pub(crate) fn insert(
        &self,
        device: Arc<dyn Device>,
        class_path: String,
        setup: String,
        exported: bool,
    ) {
        let name = device.name().to_string();
        debug!(device = %name, class_path = %class_path, "registering device");
        self.devices.insert(
            name.clone(),
            RegisteredDevice {
                device,
                class_path,
                setup,
                exported,
            },
        );
        self.order
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(name);
    }

    /// Point an alias at a live device.
    pub(crate) fn set_alias(&self, alias: &str, target: &str) {
        if !self.devices.contains_key(target) {
            warn!(alias = %alias, target = %target, "alias target is not live, skipping");
            return;
        }
        debug!(alias = %alias, target = %target, "setting device alias");
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    /// Record a construction failure for later inspection.
    pub(crate) fn record_failure(&self, failure: ConstructionFailure) {
        warn!(
            device = %failure.device,
            class_path = %failure.class_path,
            setup = %failure.setup,
            error = %failure.error,
            "device failed to construct"
        );
        self.failures.insert(failure.device.clone(), failure);
    }

    /// Devices that failed to construct.
    pub fn list_failures(&self) -> Vec<ConstructionFailure> {
        self.failures
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Whether any device failed to construct.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Number of recorded construction failures.
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Forget recorded failures (e.g. after the operator acknowledged
    /// them).
    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Shut down all devices in reverse instantiation order and clear the
    /// registry.
    ///
    /// Reverse order guarantees every device is torn down before the
    /// devices it depends on.
    pub(crate) fn teardown_all(&self) {
        let mut order = self.order.lock().unwrap_or_else(|p| p.into_inner());
        for name in order.iter().rev() {
            if let Some((_, entry)) = self.devices.remove(name) {
                info!(device = %name, "shutting down device");
                entry.device.shutdown();
            }
        }
        order.clear();
        self.devices.clear();
        self.aliases.clear();
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .field("aliases", &self.aliases.len())
            .field("failures", &self.failures.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Device for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        fn class_path(&self) -> &str {
            "test.Recorder"
        }
        fn shutdown(&self) {
            self.log
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(self.name.clone());
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Device> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
        })
    }

    #[test]
    fn lookup_follows_alias() {
        let registry = DeviceRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.insert(recorder("t_ccr", &log), "tango.Sensor".into(), "ccr".into(), true);
        registry.set_alias("T", "t_ccr");

        assert!(registry.contains("T"));
        assert_eq!(registry.get("T").map(|d| d.name().to_string()), Some("t_ccr".into()));
        assert_eq!(registry.alias_target("T"), Some("t_ccr".into()));
    }

    #[test]
    fn alias_to_missing_target_is_skipped() {
        let registry = DeviceRegistry::new();
        registry.set_alias("T", "ghost");
        assert!(!registry.contains("T"));
    }

    #[test]
    fn teardown_runs_in_reverse_instantiation_order() {
        let registry = DeviceRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.insert(recorder("motor", &log), "virtual.Motor".into(), "s".into(), true);
        registry.insert(recorder("axis", &log), "generic.Axis".into(), "s".into(), true);

        registry.teardown_all();
        let shutdowns = log.lock().unwrap_or_else(|p| p.into_inner()).clone();
        assert_eq!(shutdowns, vec!["axis", "motor"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn exported_filter_hides_lowlevel() {
        let registry = DeviceRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.insert(recorder("axis", &log), "generic.Axis".into(), "s".into(), true);
        registry.insert(recorder("axis_mot", &log), "virtual.Motor".into(), "s".into(), false);

        assert_eq!(registry.list_devices().len(), 2);
        let exported = registry.list_exported();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].name, "axis");
    }
}
