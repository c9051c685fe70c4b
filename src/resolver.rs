//! Include-closure resolution for requested setups.
//!
//! Given a list of requested setup names, the [`Resolver`] computes the
//! transitive closure over `includes`, deduplicates by setup identity,
//! enforces `excludes` constraints and group policy, and aggregates the
//! auxiliary payloads (sysconfig, startup code, alias preferences) into a
//! [`ResolvedSetup`].
//!
//! Resolution is breadth-first: the requested setups come first, then
//! their includes in declaration order. Diamond-shaped include graphs are
//! expected and legal — many setups include `notifiers` or an alias setup —
//! and resolve each setup exactly once. For fixed search roots and a fixed
//! request list the resolved order is deterministic and repeatable.
//!
//! Resolution never constructs devices; every error raised here aborts the
//! load before the live registry is touched.

use crate::error::{SetupError, SetupResult};
use crate::setup::descriptor::{ReferenceParams, SetupDescriptor};
use crate::setup::loader::SetupRoots;
use crate::setup::schema::{SetupGroup, Sysconfig};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// What to do when a single device fails to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceErrorPolicy {
    /// Record the failure, mark the device unavailable and keep going.
    /// Dependents of the failed device fail with an unresolved reference.
    /// Facilities routinely run with some hardware unreachable.
    #[default]
    CollectAndContinue,
    /// Abort the whole load on the first construction failure, leaving the
    /// live registry untouched.
    Abort,
}

/// Options controlling one load or check operation.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Allow setups in the `special` group to be resolved. Only the
    /// service a special setup configures should set this.
    pub allow_special: bool,
    /// Automatically prepend the `system` setup to the request when it
    /// exists and is not already loaded.
    pub autoload_system: bool,
    /// Per-device construction failure policy.
    pub on_device_error: DeviceErrorPolicy,
    /// Reference-carrying parameter whitelist used while parsing.
    pub reference_params: ReferenceParams,
}

impl LoadOptions {
    /// Options for a normal user-facing load: system autoload on, special
    /// setups refused, failures collected per device.
    pub fn standard() -> Self {
        Self {
            autoload_system: true,
            ..Self::default()
        }
    }
}

/// Setups already active in a session, carried into delta resolutions.
///
/// A fresh resolution starts from the default (empty) state. On a delta
/// load, setups that are already live are skipped instead of re-resolved,
/// and exclusions declared by live setups still apply.
#[derive(Debug, Clone, Default)]
pub struct ActiveSetups {
    /// Names of setups already loaded, in load order.
    pub loaded: Vec<String>,
    /// Exclusion constraints declared by loaded setups: excluded name to
    /// the setup that declared the exclusion.
    pub excluded: HashMap<String, String>,
}

impl ActiveSetups {
    fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|n| n == name)
    }
}

/// The ordered, conflict-free result of resolving a request.
#[derive(Debug, Clone)]
pub struct ResolvedSetup {
    /// Deduplicated descriptors with the include closure fully expanded,
    /// in resolution order.
    pub descriptors: Vec<SetupDescriptor>,
    /// System configuration merged across all descriptors.
    pub sysconfig: Sysconfig,
    /// Startup code fragments as `(setup, code)`, in resolution order.
    /// Collected for the integrating system; never executed here.
    pub startupcode: Vec<(String, String)>,
    /// Alias preferences: alias name to `(target, priority)` candidates,
    /// highest priority first.
    pub alias_config: HashMap<String, Vec<(String, i64)>>,
}

impl ResolvedSetup {
    /// Resolved setup names in resolution order.
    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    /// Look up a resolved descriptor by name.
    pub fn descriptor(&self, name: &str) -> Option<&SetupDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// Total number of declared (named) devices across all descriptors.
    pub fn device_count(&self) -> usize {
        self.descriptors.iter().map(|d| d.devices.len()).sum()
    }
}

/// Computes include closures against a set of search roots.
#[derive(Debug)]
pub struct Resolver<'a> {
    roots: &'a SetupRoots,
}

impl<'a> Resolver<'a> {
    /// A resolver over the given search roots.
    pub fn new(roots: &'a SetupRoots) -> Self {
        Self { roots }
    }

    /// Resolve a fresh request with no setups previously active.
    pub fn resolve(&self, requested: &[String], options: &LoadOptions) -> SetupResult<ResolvedSetup> {
        self.resolve_against(requested, options, &ActiveSetups::default())
    }

    /// Resolve a request on top of already-active setups (delta load).
    ///
    /// Already-loaded setups reached through `includes` are skipped;
    /// exclusions declared by them still apply to the new setups.
    pub fn resolve_against(
        &self,
        requested: &[String],
        options: &LoadOptions,
        active: &ActiveSetups,
    ) -> SetupResult<ResolvedSetup> {
        let mut queue: VecDeque<String> = VecDeque::new();

        if options.autoload_system
            && self.roots.contains("system")
            && !active.is_loaded("system")
            && !requested.iter().any(|n| n == "system")
        {
            debug!("autoloading 'system' setup");
            queue.push_back("system".to_string());
        }
        queue.extend(requested.iter().cloned());

        let mut descriptors: Vec<SetupDescriptor> = Vec::new();
        let mut resolved: HashSet<String> = HashSet::new();
        // excluded name -> setup declaring the exclusion
        let mut excluded: HashMap<String, String> = active.excluded.clone();

        while let Some(name) = queue.pop_front() {
            if resolved.contains(&name) || active.is_loaded(&name) {
                continue;
            }

            let descriptor = self
                .roots
                .load_with(&name, &options.reference_params)?;

            match descriptor.group {
                SetupGroup::Special if !options.allow_special => {
                    return Err(SetupError::SpecialSetup { setup: name });
                }
                SetupGroup::Configdata => {
                    return Err(SetupError::DataOnlySetup { setup: name });
                }
                _ => {}
            }

            if let Some(excluder) = excluded.get(&name) {
                return Err(SetupError::SetupConflict {
                    first: excluder.clone(),
                    second: name,
                });
            }
            for exclude in &descriptor.excludes {
                if resolved.contains(exclude) || active.is_loaded(exclude) {
                    return Err(SetupError::SetupConflict {
                        first: name.clone(),
                        second: exclude.clone(),
                    });
                }
                excluded
                    .entry(exclude.clone())
                    .or_insert_with(|| name.clone());
            }

            if !requested.iter().any(|n| n == &name) {
                debug!(setup = %name, "resolving included setup");
            }

            queue.extend(descriptor.includes.iter().cloned());
            resolved.insert(name);
            descriptors.push(descriptor);
        }

        let mut sysconfig = Sysconfig::default();
        let mut startupcode = Vec::new();
        let mut alias_config: HashMap<String, Vec<(String, i64)>> = HashMap::new();
        for descriptor in &descriptors {
            sysconfig.merge(&descriptor.sysconfig);
            if !descriptor.startupcode.trim().is_empty() {
                startupcode.push((descriptor.name.clone(), descriptor.startupcode.clone()));
            }
            for (alias, targets) in &descriptor.alias_config {
                let entry = alias_config.entry(alias.clone()).or_default();
                for (target, priority) in targets {
                    entry.push((target.clone(), *priority));
                }
            }
        }
        // first candidate has the highest priority; stable sort keeps
        // resolution order for equal priorities
        for candidates in alias_config.values_mut() {
            candidates.sort_by(|a, b| b.1.cmp(&a.1));
        }

        info!(
            setups = ?descriptors.iter().map(|d| &d.name).collect::<Vec<_>>(),
            devices = descriptors.iter().map(|d| d.devices.len()).sum::<usize>(),
            "resolved setups"
        );

        Ok(ResolvedSetup {
            descriptors,
            sysconfig,
            startupcode,
            alias_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write_setup(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(format!("{name}.toml"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn opts() -> LoadOptions {
        LoadOptions::default()
    }

    #[test]
    fn include_closure_is_breadth_first() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "s1", "includes = [\"s2\"]");
        write_setup(dir.path(), "s2", "description = \"leaf\"");

        let roots = SetupRoots::single(dir.path());
        let resolved = Resolver::new(&roots)
            .resolve(&["s1".into()], &opts())
            .unwrap();
        assert_eq!(resolved.names(), vec!["s1", "s2"]);
    }

    #[test]
    fn diamond_include_resolves_once() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "a", "includes = [\"b\", \"c\"]");
        write_setup(dir.path(), "b", "includes = [\"d\"]");
        write_setup(dir.path(), "c", "includes = [\"d\"]");
        write_setup(dir.path(), "d", "description = \"shared leaf\"");

        let roots = SetupRoots::single(dir.path());
        let resolved = Resolver::new(&roots)
            .resolve(&["a".into()], &opts())
            .unwrap();
        assert_eq!(resolved.names(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn resolution_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "a", "includes = [\"b\", \"c\"]");
        write_setup(dir.path(), "b", "description = \"\"");
        write_setup(dir.path(), "c", "includes = [\"b\"]");

        let roots = SetupRoots::single(dir.path());
        let resolver = Resolver::new(&roots);
        let first = resolver.resolve(&["a".into()], &opts()).unwrap();
        let second = resolver.resolve(&["a".into()], &opts()).unwrap();
        assert_eq!(first.names(), second.names());
    }

    #[test]
    fn exclusion_fails_in_either_request_order() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "s1", "excludes = [\"s2\"]");
        write_setup(dir.path(), "s2", "excludes = [\"s1\"]");

        let roots = SetupRoots::single(dir.path());
        let resolver = Resolver::new(&roots);
        for request in [["s1", "s2"], ["s2", "s1"]] {
            let request: Vec<String> = request.iter().map(|s| s.to_string()).collect();
            match resolver.resolve(&request, &opts()) {
                Err(SetupError::SetupConflict { first, second }) => {
                    let mut pair = [first, second];
                    pair.sort();
                    assert_eq!(pair, ["s1".to_string(), "s2".to_string()]);
                }
                other => panic!("expected SetupConflict, got {other:?}"),
            }
        }
    }

    #[test]
    fn one_sided_exclusion_is_symmetric() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "big", "excludes = [\"small\"]");
        write_setup(dir.path(), "small", "description = \"\"");

        let roots = SetupRoots::single(dir.path());
        let resolver = Resolver::new(&roots);
        assert!(resolver
            .resolve(&["big".into(), "small".into()], &opts())
            .is_err());
        assert!(resolver
            .resolve(&["small".into(), "big".into()], &opts())
            .is_err());
    }

    #[test]
    fn special_refused_without_permission() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "special/cache", "group = \"special\"");

        let roots = SetupRoots::single(dir.path());
        let resolver = Resolver::new(&roots);
        match resolver.resolve(&["special/cache".into()], &opts()) {
            Err(SetupError::SpecialSetup { setup }) => assert_eq!(setup, "special/cache"),
            other => panic!("expected SpecialSetup, got {other:?}"),
        }

        let allowed = LoadOptions {
            allow_special: true,
            ..opts()
        };
        assert!(resolver
            .resolve(&["special/cache".into()], &allowed)
            .is_ok());
    }

    #[test]
    fn configdata_never_resolves() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "constants", "group = \"configdata\"");

        let roots = SetupRoots::single(dir.path());
        match Resolver::new(&roots).resolve(&["constants".into()], &opts()) {
            Err(SetupError::DataOnlySetup { setup }) => assert_eq!(setup, "constants"),
            other => panic!("expected DataOnlySetup, got {other:?}"),
        }
    }

    #[test]
    fn system_autoloads_first() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "system", "group = \"lowlevel\"");
        write_setup(dir.path(), "table", "description = \"\"");

        let roots = SetupRoots::single(dir.path());
        let resolved = Resolver::new(&roots)
            .resolve(&["table".into()], &LoadOptions::standard())
            .unwrap();
        assert_eq!(resolved.names(), vec!["system", "table"]);
    }

    #[test]
    fn missing_include_fails_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "a", "includes = [\"ghost\"]");

        let roots = SetupRoots::single(dir.path());
        match Resolver::new(&roots).resolve(&["a".into()], &opts()) {
            Err(SetupError::SetupNotFound { setup, .. }) => assert_eq!(setup, "ghost"),
            other => panic!("expected SetupNotFound, got {other:?}"),
        }
    }

    #[test]
    fn startupcode_and_aliases_aggregate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(
            dir.path(),
            "a",
            r#"
includes = ["b"]
startupcode = "printinfo('a')"

[alias_config]
T = { T_a = 100 }
"#,
        );
        write_setup(
            dir.path(),
            "b",
            r#"
startupcode = "printinfo('b')"

[alias_config]
T = { T_b = 200 }
"#,
        );

        let roots = SetupRoots::single(dir.path());
        let resolved = Resolver::new(&roots)
            .resolve(&["a".into()], &opts())
            .unwrap();
        assert_eq!(
            resolved.startupcode,
            vec![
                ("a".to_string(), "printinfo('a')".to_string()),
                ("b".to_string(), "printinfo('b')".to_string()),
            ]
        );
        // higher priority candidate first
        assert_eq!(
            resolved.alias_config["T"],
            vec![("T_b".to_string(), 200), ("T_a".to_string(), 100)]
        );
    }

    #[test]
    fn delta_resolution_skips_active_and_honors_their_excludes() {
        let dir = tempfile::tempdir().unwrap();
        write_setup(dir.path(), "base", "excludes = [\"rival\"]");
        write_setup(dir.path(), "addon", "includes = [\"base\"]");
        write_setup(dir.path(), "rival", "description = \"\"");

        let roots = SetupRoots::single(dir.path());
        let resolver = Resolver::new(&roots);

        let active = ActiveSetups {
            loaded: vec!["base".into()],
            excluded: HashMap::from([("rival".to_string(), "base".to_string())]),
        };

        // "base" is already live: the include is skipped, not re-resolved
        let resolved = resolver
            .resolve_against(&["addon".into()], &opts(), &active)
            .unwrap();
        assert_eq!(resolved.names(), vec!["addon"]);

        // a live setup's exclusion still applies to new requests
        match resolver.resolve_against(&["rival".into()], &opts(), &active) {
            Err(SetupError::SetupConflict { first, second }) => {
                assert_eq!(first, "base");
                assert_eq!(second, "rival");
            }
            other => panic!("expected SetupConflict, got {other:?}"),
        }
    }
}
