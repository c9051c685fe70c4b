//! Declarative setup resolution and device graph construction for
//! instrument control systems.
//!
//! An instrument is configured as a tree of *setups*: named TOML files
//! declaring devices (motors, sensors, detectors, notifiers) wired
//! together by name references, organized into includable and mutually
//! exclusive groups. This crate turns a set of requested setup names into
//! a running device graph:
//!
//! 1. [`SetupRoots`](setup::loader::SetupRoots) locates setup files across
//!    layered search roots (facility overrides shared defaults).
//! 2. [`Resolver`](resolver::Resolver) expands the include closure,
//!    deduplicates, and enforces exclusion constraints.
//! 3. [`DeviceGraph`](graph::DeviceGraph) flattens device declarations,
//!    derives dependency edges from reference-carrying parameters, and
//!    computes a topological instantiation order.
//! 4. [`Session`](session::Session) constructs devices through a
//!    [`FactoryCatalog`](factory::FactoryCatalog) and commits them to the
//!    live [`DeviceRegistry`](registry::DeviceRegistry).
//!
//! # Example
//!
//! ```rust,ignore
//! use instrument_setups::{FactoryCatalog, LoadOptions, Session, SetupRoots};
//!
//! let roots = SetupRoots::new(["/opt/shared/setups", "/opt/facility/setups"]);
//! let mut catalog = FactoryCatalog::new();
//! catalog.register(Box::new(MotorFactory));
//!
//! let mut session = Session::new(roots, catalog);
//! let report = session.load(&["table"], &LoadOptions::standard())?;
//! println!("loaded {} devices", report.created.len());
//! ```

pub mod error;
pub mod factory;
pub mod graph;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod setup;

pub use error::{SetupError, SetupResult};
pub use factory::{BoundParam, BoundParams, Device, DeviceFactory, FactoryCatalog};
pub use graph::{DeviceGraph, GraphNode};
pub use registry::{ConstructionFailure, DeviceInfo, DeviceRegistry};
pub use resolver::{
    ActiveSetups, DeviceErrorPolicy, LoadOptions, ResolvedSetup, Resolver,
};
pub use session::{CheckReport, LoadReport, Session};
pub use setup::descriptor::{DeviceSpec, ParamValue, ReferenceParams, SetupDescriptor};
pub use setup::loader::SetupRoots;
pub use setup::schema::{SetupGroup, Sysconfig};
