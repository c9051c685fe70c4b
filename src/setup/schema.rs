//! Schema definitions for the declarative setup file format.
//!
//! This module defines the Rust types for TOML-based setup files. A setup
//! file declares a named unit of instrument configuration: which setups it
//! includes or excludes, the devices it provides, and auxiliary payloads
//! (sysconfig, startup code, alias preferences) that downstream subsystems
//! interpret.
//!
//! # File Structure
//!
//! ```toml
//! description = "Sample table motors"
//! group = "optional"
//! includes = ["system"]
//! excludes = ["tablesmall"]
//!
//! [sysconfig]
//! cache = "localhost"
//! datasinks = ["conssink", "filesink"]
//!
//! [devices.omega]
//! class = "generic.Axis"
//! [devices.omega.params]
//! motor = "omega_mot"
//! precision = 0.01
//! ```
//!
//! The types here capture the raw on-disk shape only. Conversion into the
//! validated in-memory form lives in
//! [`descriptor`](crate::setup::descriptor).

use serde::Deserialize;
use std::collections::HashMap;

/// Setup group tag controlling default visibility and loadability.
///
/// Groups do not express ownership; they tell the loading UI and the
/// resolver how a setup may be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupGroup {
    /// Infrastructure setups pulled in via `includes`, never selected
    /// directly.
    Lowlevel,
    /// One of the instrument's primary operation modes.
    Basic,
    /// Freely combinable add-on (default when the file gives no group).
    #[default]
    Optional,
    /// Configuration for a standalone service process; only that service
    /// may load it.
    Special,
    /// Sample-environment setup announced by plug-and-play detection.
    Plugplay,
    /// Data-only setup holding constants for other setups; never loadable.
    Configdata,
    /// Loaded automatically at session start.
    Startup,
    /// Valid but not offered in selection UIs.
    Hidden,
}

impl SetupGroup {
    /// The on-disk tag for this group.
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupGroup::Lowlevel => "lowlevel",
            SetupGroup::Basic => "basic",
            SetupGroup::Optional => "optional",
            SetupGroup::Special => "special",
            SetupGroup::Plugplay => "plugplay",
            SetupGroup::Configdata => "configdata",
            SetupGroup::Startup => "startup",
            SetupGroup::Hidden => "hidden",
        }
    }
}

impl std::fmt::Display for SetupGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Raw on-disk shape of one setup file.
///
/// All keys are optional except that `devices`, when present, must be a
/// table. Unknown top-level keys are rejected so that typos like `include`
/// for `includes` surface as parse errors instead of being silently
/// ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSetup {
    /// Human-readable description shown in setup selection.
    #[serde(default)]
    pub description: String,

    /// Group tag; `optional` when omitted.
    #[serde(default)]
    pub group: Option<SetupGroup>,

    /// Ordered list of setups to load alongside this one.
    #[serde(default)]
    pub includes: Vec<String>,

    /// Setups that must not be loaded at the same time as this one.
    #[serde(default)]
    pub excludes: Vec<String>,

    /// User command modules to import for this setup (opaque payload).
    #[serde(default)]
    pub modules: Vec<String>,

    /// Device declarations, keyed by device name. Declaration order is
    /// preserved and later used as the instantiation tie-break.
    #[serde(default)]
    pub devices: toml::Table,

    /// System configuration merged across all resolved setups.
    #[serde(default)]
    pub sysconfig: Option<RawSysconfig>,

    /// Code to run once the setup is loaded (collected, not executed by
    /// this crate).
    #[serde(default)]
    pub startupcode: String,

    /// Preferred alias targets: alias name to `{ target = priority }`.
    #[serde(default)]
    pub alias_config: HashMap<String, HashMap<String, i64>>,

    /// Monitor display blocks (opaque payload for the monitor service).
    #[serde(default)]
    pub monitor_blocks: Option<toml::Table>,

    /// Watchdog conditions (opaque payload for the watchdog service).
    #[serde(default)]
    pub watch_conditions: Vec<toml::Value>,

    /// Free-form extension data.
    #[serde(default)]
    pub extended: Option<toml::Table>,

    /// Relative position in setup selection lists.
    #[serde(default)]
    pub display_order: Option<i64>,
}

/// Raw shape of one device declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDevice {
    /// Dotted path naming the implementing class. Never resolved here;
    /// passed through to the factory catalog at construction time.
    pub class: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Whether the device is hidden from the user namespace.
    #[serde(default)]
    pub lowlevel: bool,

    /// Constructor parameters; values may be literals, device references,
    /// or nested anonymous device declarations.
    #[serde(default)]
    pub params: toml::Table,
}

/// Raw `[sysconfig]` section of one setup file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSysconfig {
    /// Cache server address.
    #[serde(default)]
    pub cache: Option<String>,

    /// Name of the instrument device.
    #[serde(default)]
    pub instrument: Option<String>,

    /// Name of the experiment device.
    #[serde(default)]
    pub experiment: Option<String>,

    /// Data sink device names (union-merged across setups).
    #[serde(default)]
    pub datasinks: Vec<String>,

    /// Notifier device names (union-merged across setups).
    #[serde(default)]
    pub notifiers: Vec<String>,
}

/// System configuration merged across all setups of one resolution.
///
/// Scalar entries are overwritten by later setups; `datasinks` and
/// `notifiers` are accumulated as insertion-ordered unions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sysconfig {
    /// Cache server address.
    pub cache: Option<String>,
    /// Name of the instrument device.
    pub instrument: Option<String>,
    /// Name of the experiment device.
    pub experiment: Option<String>,
    /// Data sink device names in first-seen order.
    pub datasinks: Vec<String>,
    /// Notifier device names in first-seen order.
    pub notifiers: Vec<String>,
}

impl Sysconfig {
    /// Merge another aggregate into this one (same rules as [`merge`]
    /// applied entry-wise).
    ///
    /// [`merge`]: Sysconfig::merge
    pub fn absorb(&mut self, other: &Sysconfig) {
        self.merge(&RawSysconfig {
            cache: other.cache.clone(),
            instrument: other.instrument.clone(),
            experiment: other.experiment.clone(),
            datasinks: other.datasinks.clone(),
            notifiers: other.notifiers.clone(),
        });
    }

    /// Merge one setup's raw sysconfig into the aggregate.
    pub fn merge(&mut self, raw: &RawSysconfig) {
        if raw.cache.is_some() {
            self.cache = raw.cache.clone();
        }
        if raw.instrument.is_some() {
            self.instrument = raw.instrument.clone();
        }
        if raw.experiment.is_some() {
            self.experiment = raw.experiment.clone();
        }
        for sink in &raw.datasinks {
            if !self.datasinks.contains(sink) {
                self.datasinks.push(sink.clone());
            }
        }
        for notifier in &raw.notifiers {
            if !self.notifiers.contains(notifier) {
                self.notifiers.push(notifier.clone());
            }
        }
    }
}
