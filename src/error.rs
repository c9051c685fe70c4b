//! Custom error types for setup resolution and device construction.
//!
//! This module defines the primary error type, [`SetupError`], for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a setup load can
//! run into, from malformed files to reference cycles in the device graph.
//!
//! ## Error Phases
//!
//! Errors fall into two phases with different blast radii:
//!
//! 1. **Resolution-phase errors** — `MalformedSetup`, `SetupNotFound`,
//!    `SetupConflict`, `SpecialSetup`, `DataOnlySetup`, `DuplicateDevice`,
//!    `DependencyCycle`. These abort the whole load operation before any
//!    device is constructed; the live registry is left untouched.
//!
//! 2. **Construction-phase errors** — `UnresolvedReference`, `ClassLoad`,
//!    `Construction`. These are scoped to the failing device (and its
//!    dependents). Whether they abort the load or leave the device marked
//!    unavailable is controlled by
//!    [`DeviceErrorPolicy`](crate::resolver::DeviceErrorPolicy).
//!
//! Every variant carries the offending setup and/or device name so the
//! operator can locate the configuration problem without reading a stack
//! trace.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SetupResult<T> = std::result::Result<T, SetupError>;

/// Primary error type for setup loading and device graph construction.
#[derive(Error, Debug)]
pub enum SetupError {
    /// A setup file violates the minimal shape contract.
    ///
    /// Covers TOML syntax errors, wrong container types for the recognized
    /// top-level keys, device entries without a string `class`, and
    /// unreadable files. Not recoverable; the load is aborted.
    #[error("setup '{setup}' is malformed: {reason}")]
    MalformedSetup {
        /// Logical name of the offending setup.
        setup: String,
        /// What exactly is wrong with the file.
        reason: String,
    },

    /// A requested or transitively included setup has no file in any
    /// search root.
    #[error("setup '{setup}' does not exist (search roots: {roots})")]
    SetupNotFound {
        /// The name that could not be located.
        setup: String,
        /// Display form of the configured search roots.
        roots: String,
    },

    /// Two resolved setups mutually exclude each other.
    ///
    /// Raised when setup `first` declares `second` in its `excludes` list
    /// (or vice versa) and both end up in the same resolution. The operator
    /// must deselect one of them.
    #[error("cannot load setup '{first}' together with setup '{second}': they are mutually exclusive")]
    SetupConflict {
        /// The setup whose exclusion constraint fired.
        first: String,
        /// The setup it conflicts with.
        second: String,
    },

    /// A setup in the `special` group was resolved without explicit
    /// permission.
    ///
    /// Special setups configure standalone services (cache, daemon,
    /// watchdog) and are only loadable by those services themselves.
    #[error("cannot load special setup '{setup}'")]
    SpecialSetup {
        /// Name of the special setup.
        setup: String,
    },

    /// A setup in the `configdata` group was resolved as a load target.
    ///
    /// Data-only setups hold constants for other setups to import and carry
    /// no loadable devices.
    #[error("cannot load data-only setup '{setup}'")]
    DataOnlySetup {
        /// Name of the data-only setup.
        setup: String,
    },

    /// Two distinct resolved setups declare a device of the same name with
    /// differing specifications.
    #[error("device '{device}' is declared by both setup '{first}' and setup '{second}'")]
    DuplicateDevice {
        /// The colliding device name.
        device: String,
        /// Setup that declared the device first (in resolution order).
        first: String,
        /// Setup that declared it again.
        second: String,
    },

    /// The device reference graph contains a cycle.
    ///
    /// Indicates a configuration authoring bug; the cycle members are
    /// listed in declaration order.
    #[error("device reference cycle involving: {}", .members.join(", "))]
    DependencyCycle {
        /// Devices participating in the cycle.
        members: Vec<String>,
    },

    /// A reference-carrying parameter names a device that is neither in the
    /// graph nor already live.
    ///
    /// Fatal for the referencing device only; under the default error
    /// policy the rest of the graph still constructs.
    #[error("device '{device}': parameter '{param}' references unknown device '{target}'")]
    UnresolvedReference {
        /// The device whose parameter could not be bound.
        device: String,
        /// The parameter naming the missing device.
        param: String,
        /// The name that could not be resolved.
        target: String,
    },

    /// No factory is registered for a device's class path.
    ///
    /// With an explicitly populated factory catalog this is a simple
    /// lookup miss, not an import failure. Fatal for that device only.
    #[error("device '{device}': no factory registered for class '{class_path}'")]
    ClassLoad {
        /// The device that could not be constructed.
        device: String,
        /// The class path with no registered factory.
        class_path: String,
    },

    /// A device factory failed while constructing a device.
    #[error("device '{device}' ({class_path}) failed to construct: {source}")]
    Construction {
        /// The device that failed.
        device: String,
        /// Its class path.
        class_path: String,
        /// The underlying factory error.
        #[source]
        source: anyhow::Error,
    },
}

impl SetupError {
    /// Whether this error belongs to the resolution phase.
    ///
    /// Resolution-phase errors always abort the whole load; construction
    /// errors may be collected per device depending on the error policy.
    pub fn is_resolution_error(&self) -> bool {
        !matches!(
            self,
            SetupError::UnresolvedReference { .. }
                | SetupError::ClassLoad { .. }
                | SetupError::Construction { .. }
        )
    }

    /// The device name this error is scoped to, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            SetupError::DuplicateDevice { device, .. }
            | SetupError::UnresolvedReference { device, .. }
            | SetupError::ClassLoad { device, .. }
            | SetupError::Construction { device, .. } => Some(device),
            _ => None,
        }
    }
}
