//! Device construction interface: the boundary between the configuration
//! subsystem and the device-class framework.
//!
//! A device class is identified by its dotted `class` path. Instead of
//! resolving that path through any import machinery, implementations
//! register a [`DeviceFactory`] per class path in a [`FactoryCatalog`] at
//! process startup. A class path without a registered factory is then a
//! simple lookup miss ([`SetupError::ClassLoad`](crate::error::SetupError)),
//! reported per device.
//!
//! Factories receive their parameters as [`BoundParams`]: literals pass
//! through untouched, while reference-carrying parameters arrive with the
//! referenced devices already constructed and bound.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A live device object.
///
/// The construction pipeline only needs identity and a teardown hook;
/// everything else (moving, reading, polling) is between the device class
/// and its consumers.
pub trait Device: Send + Sync {
    /// The device's name in the registry namespace.
    fn name(&self) -> &str;

    /// Dotted path of the implementing class.
    fn class_path(&self) -> &str;

    /// Release resources on unload. Called in reverse instantiation
    /// order, so dependents shut down before their dependencies.
    fn shutdown(&self) {}
}

/// One constructor parameter as seen by a factory.
#[derive(Clone)]
pub enum BoundParam {
    /// An opaque configuration value.
    Literal(toml::Value),
    /// A reference parameter, bound to the live device it named.
    Device(Arc<dyn Device>),
    /// A list reference parameter, bound in declaration order.
    Devices(Vec<Arc<dyn Device>>),
}

impl std::fmt::Debug for BoundParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundParam::Literal(value) => write!(f, "Literal({value})"),
            BoundParam::Device(device) => write!(f, "Device({})", device.name()),
            BoundParam::Devices(devices) => {
                let names: Vec<&str> = devices.iter().map(|d| d.name()).collect();
                write!(f, "Devices({names:?})")
            }
        }
    }
}

/// The fully bound parameter set handed to a factory.
#[derive(Debug, Clone, Default)]
pub struct BoundParams {
    values: Vec<(String, BoundParam)>,
}

impl BoundParams {
    pub(crate) fn new(values: Vec<(String, BoundParam)>) -> Self {
        Self { values }
    }

    /// Look up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&BoundParam> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Parameter names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    /// A literal parameter value, if present.
    pub fn literal(&self, name: &str) -> Option<&toml::Value> {
        match self.get(name)? {
            BoundParam::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// A literal string parameter.
    pub fn str(&self, name: &str) -> Option<&str> {
        self.literal(name)?.as_str()
    }

    /// A literal integer parameter.
    pub fn integer(&self, name: &str) -> Option<i64> {
        self.literal(name)?.as_integer()
    }

    /// A literal float parameter; integer literals are widened.
    pub fn float(&self, name: &str) -> Option<f64> {
        let value = self.literal(name)?;
        value.as_float().or_else(|| value.as_integer().map(|i| i as f64))
    }

    /// A literal boolean parameter.
    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.literal(name)?.as_bool()
    }

    /// A bound device reference.
    pub fn device(&self, name: &str) -> Option<Arc<dyn Device>> {
        match self.get(name)? {
            BoundParam::Device(device) => Some(device.clone()),
            _ => None,
        }
    }

    /// A bound device list reference.
    pub fn devices(&self, name: &str) -> Option<Vec<Arc<dyn Device>>> {
        match self.get(name)? {
            BoundParam::Devices(devices) => Some(devices.clone()),
            _ => None,
        }
    }
}

/// Constructs devices of one class.
pub trait DeviceFactory: Send + Sync {
    /// The dotted class path this factory implements.
    fn class_path(&self) -> &str;

    /// Construct a device. Errors are wrapped into
    /// [`SetupError::Construction`](crate::error::SetupError) with the
    /// device and class names attached.
    fn create(&self, name: &str, params: &BoundParams) -> anyhow::Result<Arc<dyn Device>>;
}

/// Registry of device factories keyed by class path.
///
/// Populated by explicit registration at startup; the resolver and graph
/// builder never touch it, only the instantiation step does.
#[derive(Default)]
pub struct FactoryCatalog {
    factories: HashMap<String, Box<dyn DeviceFactory>>,
}

impl FactoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its class path.
    ///
    /// Returns the factory previously registered for the same class path,
    /// if any.
    pub fn register(&mut self, factory: Box<dyn DeviceFactory>) -> Option<Box<dyn DeviceFactory>> {
        let class_path = factory.class_path().to_string();
        info!(class_path = %class_path, "registering device factory");
        self.factories.insert(class_path, factory)
    }

    /// Whether a factory is registered for this class path.
    pub fn contains(&self, class_path: &str) -> bool {
        self.factories.contains_key(class_path)
    }

    /// Look up the factory for a class path.
    pub fn get(&self, class_path: &str) -> Option<&dyn DeviceFactory> {
        self.factories.get(class_path).map(Box::as_ref)
    }

    /// All registered class paths, sorted.
    pub fn class_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the catalog has no factories.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for FactoryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryCatalog")
            .field("class_paths", &self.class_paths())
            .finish()
    }
}
