//! Validated in-memory form of one setup file.
//!
//! [`SetupDescriptor::parse`] converts the raw on-disk shape from
//! [`schema`](crate::setup::schema) into the structure the resolver and
//! graph builder work with. Parameter values are classified once, here,
//! into the tagged [`ParamValue`] form so later stages never have to
//! re-infer whether a string is a device reference or a plain literal.
//!
//! Classification is driven by a whitelist of reference-carrying parameter
//! names ([`ReferenceParams`]): configuration values are untyped, and a
//! parameter like `fmtstr` may well hold a string that coincides with a
//! device name without meaning one.

use crate::error::{SetupError, SetupResult};
use crate::setup::schema::{RawDevice, RawSetup, RawSysconfig, SetupGroup};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::collections::HashSet;

/// Parameter names whose string values are resolved to live device
/// references at bind time. All other parameters are opaque literals even
/// if their value coincides with a device name.
static BUILTIN_REFERENCE_PARAMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "moveable",
        "moveables",
        "motor",
        "coder",
        "device",
        "devices",
        "switcher",
        "flipper",
        "alias",
        "lockdevice",
    ]
    .into_iter()
    .collect()
});

/// The set of reference-carrying parameter names used during parsing.
///
/// Starts from the builtin whitelist; facilities with custom device
/// classes can extend it per load via
/// [`LoadOptions`](crate::resolver::LoadOptions).
#[derive(Debug, Clone, Default)]
pub struct ReferenceParams {
    extra: HashSet<String>,
}

impl ReferenceParams {
    /// Whitelist extended with additional parameter names.
    pub fn with_extra<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extra: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a parameter of this name carries device references.
    pub fn is_reference(&self, param: &str) -> bool {
        BUILTIN_REFERENCE_PARAMS.contains(param) || self.extra.contains(param)
    }
}

/// One parameter value, classified at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// An opaque configuration value passed through to the factory as-is.
    Literal(toml::Value),
    /// The name of another device, to be bound to its live object.
    Reference(String),
    /// An ordered list of device names, each bound to its live object.
    References(Vec<String>),
    /// An anonymous device declared inline as this parameter's value,
    /// owned exclusively by the enclosing device.
    Inline(Box<DeviceSpec>),
}

/// One device declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    /// Dotted path naming the implementing class.
    pub class_path: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Whether the device is hidden from the user namespace.
    pub lowlevel: bool,
    /// Constructor parameters in declaration order.
    pub params: Vec<(String, ParamValue)>,
}

impl DeviceSpec {
    /// Look up a parameter by name.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// One parsed configuration unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupDescriptor {
    /// Logical setup name, derived from the file path relative to its
    /// search root.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Group tag controlling visibility and loadability.
    pub group: SetupGroup,
    /// Setups to load alongside this one, in declaration order.
    pub includes: Vec<String>,
    /// Setups that must not be loaded together with this one.
    pub excludes: Vec<String>,
    /// User command modules to import (opaque payload).
    pub modules: Vec<String>,
    /// Devices in declaration order.
    pub devices: Vec<(String, DeviceSpec)>,
    /// This setup's contribution to the merged system configuration.
    pub sysconfig: RawSysconfig,
    /// Startup code, collected in resolution order but never executed by
    /// this crate.
    pub startupcode: String,
    /// Preferred alias targets: alias name to `(target, priority)` pairs.
    pub alias_config: HashMap<String, HashMap<String, i64>>,
    /// Monitor display blocks (opaque).
    pub monitor_blocks: Option<toml::Table>,
    /// Watchdog conditions (opaque).
    pub watch_conditions: Vec<toml::Value>,
    /// Free-form extension data (opaque).
    pub extended: Option<toml::Table>,
    /// Relative position in setup selection lists.
    pub display_order: Option<i64>,
}

impl SetupDescriptor {
    /// Parse one setup file using the builtin reference whitelist.
    pub fn parse(name: &str, source: &str) -> SetupResult<Self> {
        Self::parse_with(name, source, &ReferenceParams::default())
    }

    /// Parse one setup file, classifying parameters against `refs`.
    ///
    /// This is a pure transform: shape is validated, semantics (include
    /// existence, exclusion consistency, reference targets) are not.
    pub fn parse_with(name: &str, source: &str, refs: &ReferenceParams) -> SetupResult<Self> {
        let raw: RawSetup = toml::from_str(source).map_err(|err| SetupError::MalformedSetup {
            setup: name.to_string(),
            reason: err.message().to_string(),
        })?;

        let mut devices = Vec::with_capacity(raw.devices.len());
        for (devname, value) in &raw.devices {
            validate_device_name(name, devname)?;
            let spec = parse_device(name, devname, value, refs)?;
            devices.push((devname.clone(), spec));
        }

        Ok(SetupDescriptor {
            name: name.to_string(),
            description: raw.description,
            group: raw.group.unwrap_or_default(),
            includes: raw.includes,
            excludes: raw.excludes,
            modules: raw.modules,
            devices,
            sysconfig: raw.sysconfig.unwrap_or_default(),
            startupcode: raw.startupcode,
            alias_config: raw.alias_config,
            monitor_blocks: raw.monitor_blocks,
            watch_conditions: raw.watch_conditions,
            extended: raw.extended,
            display_order: raw.display_order,
        })
    }

    /// Look up a device declaration by name.
    pub fn device(&self, name: &str) -> Option<&DeviceSpec> {
        self.devices.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }
}

/// Device names become namespace entries, so they must be identifiers.
/// This also keeps them disjoint from the synthetic `owner.param` names
/// given to anonymous inline devices.
fn validate_device_name(setup: &str, devname: &str) -> SetupResult<()> {
    let mut chars = devname.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SetupError::MalformedSetup {
            setup: setup.to_string(),
            reason: format!("device name '{devname}' is not a valid identifier"),
        })
    }
}

fn parse_device(
    setup: &str,
    devname: &str,
    value: &toml::Value,
    refs: &ReferenceParams,
) -> SetupResult<DeviceSpec> {
    let raw: RawDevice =
        value
            .clone()
            .try_into()
            .map_err(|err: toml::de::Error| SetupError::MalformedSetup {
                setup: setup.to_string(),
                reason: format!("device '{}': {}", devname, err.message()),
            })?;

    let mut params = Vec::with_capacity(raw.params.len());
    for (pname, pvalue) in &raw.params {
        params.push((pname.clone(), classify(setup, devname, pname, pvalue, refs)?));
    }

    Ok(DeviceSpec {
        class_path: raw.class,
        description: raw.description,
        lowlevel: raw.lowlevel,
        params,
    })
}

fn classify(
    setup: &str,
    devname: &str,
    param: &str,
    value: &toml::Value,
    refs: &ReferenceParams,
) -> SetupResult<ParamValue> {
    match value {
        // A table carrying a string `class` key is an inline device
        // declaration, whatever the parameter name.
        toml::Value::Table(table) if table.get("class").and_then(toml::Value::as_str).is_some() => {
            let spec = parse_device(setup, &format!("{devname}.{param}"), value, refs)?;
            Ok(ParamValue::Inline(Box::new(spec)))
        }
        toml::Value::String(target) if refs.is_reference(param) => {
            // an empty string means "no device attached"
            if target.is_empty() {
                Ok(ParamValue::Literal(value.clone()))
            } else {
                Ok(ParamValue::Reference(target.clone()))
            }
        }
        toml::Value::Array(items) if refs.is_reference(param) => {
            let mut targets = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(target) if !target.is_empty() => targets.push(target.to_string()),
                    _ => {
                        return Err(SetupError::MalformedSetup {
                            setup: setup.to_string(),
                            reason: format!(
                                "device '{devname}': parameter '{param}' must be a list of \
                                 device names"
                            ),
                        })
                    }
                }
            }
            Ok(ParamValue::References(targets))
        }
        _ => Ok(ParamValue::Literal(value.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE_SETUP: &str = r#"
description = "Sample table"
group = "optional"
includes = ["system"]
excludes = ["tablesmall"]

[devices.omega]
class = "generic.Axis"
description = "sample rotation"
[devices.omega.params]
motor = "omega_mot"
coder = "omega_enc"
precision = 0.01
fmtstr = "%.2f"

[devices.omega_mot]
class = "tango.Motor"
lowlevel = true
[devices.omega_mot.params]
tangodevice = "tango://box/omega/mot"

[devices.omega_enc]
class = "tango.Coder"
lowlevel = true
[devices.omega_enc.params]
tangodevice = "tango://box/omega/enc"
"#;

    #[test]
    fn parses_references_and_literals() {
        let setup = SetupDescriptor::parse("table", TABLE_SETUP).unwrap();
        assert_eq!(setup.group, SetupGroup::Optional);
        assert_eq!(setup.includes, vec!["system"]);

        let omega = setup.device("omega").unwrap();
        assert_eq!(omega.class_path, "generic.Axis");
        assert_eq!(
            omega.param("motor"),
            Some(&ParamValue::Reference("omega_mot".into()))
        );
        // a string parameter outside the whitelist stays a literal even
        // when its value looks like a device name
        assert_eq!(
            omega.param("fmtstr"),
            Some(&ParamValue::Literal(toml::Value::String("%.2f".into())))
        );
        assert_eq!(
            omega.param("precision"),
            Some(&ParamValue::Literal(toml::Value::Float(0.01)))
        );
    }

    #[test]
    fn whitelist_miss_keeps_device_like_string_literal() {
        let src = r#"
[devices.display]
class = "generic.Display"
[devices.display.params]
fmtstr = "shutter"

[devices.shutter]
class = "generic.Switch"
"#;
        let setup = SetupDescriptor::parse("vis", src).unwrap();
        let display = setup.device("display").unwrap();
        assert!(matches!(
            display.param("fmtstr"),
            Some(ParamValue::Literal(_))
        ));
    }

    #[test]
    fn inline_device_becomes_nested_spec() {
        let src = r#"
[devices.axis1]
class = "generic.Axis"
[devices.axis1.params]
precision = 0.01
[devices.axis1.params.motor]
class = "virtual.Motor"
params = { speed = 2.5 }
"#;
        let setup = SetupDescriptor::parse("demo", src).unwrap();
        let axis = setup.device("axis1").unwrap();
        match axis.param("motor") {
            Some(ParamValue::Inline(inner)) => {
                assert_eq!(inner.class_path, "virtual.Motor");
                assert_eq!(
                    inner.param("speed"),
                    Some(&ParamValue::Literal(toml::Value::Float(2.5)))
                );
            }
            other => panic!("expected inline device, got {other:?}"),
        }
    }

    #[test]
    fn reference_list_parameter() {
        let src = r#"
[devices.scanner]
class = "generic.Scanner"
[devices.scanner.params]
moveables = ["x", "y"]
"#;
        let setup = SetupDescriptor::parse("scan", src).unwrap();
        let scanner = setup.device("scanner").unwrap();
        assert_eq!(
            scanner.param("moveables"),
            Some(&ParamValue::References(vec!["x".into(), "y".into()]))
        );
    }

    #[test]
    fn extra_reference_params_extend_whitelist() {
        let src = r#"
[devices.sel]
class = "custom.Selector"
[devices.sel.params]
chopper = "chopper1"
"#;
        let plain = SetupDescriptor::parse("sel", src).unwrap();
        assert!(matches!(
            plain.device("sel").unwrap().param("chopper"),
            Some(ParamValue::Literal(_))
        ));

        let refs = ReferenceParams::with_extra(["chopper"]);
        let extended = SetupDescriptor::parse_with("sel", src, &refs).unwrap();
        assert_eq!(
            extended.device("sel").unwrap().param("chopper"),
            Some(&ParamValue::Reference("chopper1".into()))
        );
    }

    #[test]
    fn missing_class_is_malformed() {
        let src = r#"
[devices.omega]
description = "no class here"
"#;
        let err = SetupDescriptor::parse("broken", src).unwrap_err();
        match err {
            SetupError::MalformedSetup { setup, reason } => {
                assert_eq!(setup, "broken");
                assert!(reason.contains("omega"), "reason was: {reason}");
            }
            other => panic!("expected MalformedSetup, got {other}"),
        }
    }

    #[test]
    fn non_identifier_device_name_rejected() {
        let src = r#"
[devices."om ega"]
class = "generic.Axis"
"#;
        assert!(SetupDescriptor::parse("broken", src).is_err());
    }

    #[test]
    fn empty_devices_table_is_valid() {
        let setup =
            SetupDescriptor::parse("aggregate", "description = \"combiner\"\nincludes = [\"a\"]")
                .unwrap();
        assert!(setup.devices.is_empty());
        assert_eq!(setup.includes, vec!["a"]);
    }
}
