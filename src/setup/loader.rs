//! Layered setup lookup across one or more search roots.
//!
//! Setup files live under root directories as `<name>.toml`, where the
//! logical name is the path relative to the root without the extension
//! (subdirectories become `/`-separated name components, e.g.
//! `special/cache`). Multiple roots form an override layer: a name found
//! in a later root shadows the same name in an earlier root, so a facility
//! tree can customize shared defaults without copying whole files.
//!
//! Layering is resolved here, once, at load time — never re-evaluated per
//! device.

use crate::error::{SetupError, SetupResult};
use crate::setup::descriptor::{ReferenceParams, SetupDescriptor};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Ordered list of setup search roots, later roots taking precedence.
#[derive(Debug, Clone)]
pub struct SetupRoots {
    roots: Vec<PathBuf>,
}

impl SetupRoots {
    /// Search roots in ascending precedence order.
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    /// A single search root.
    pub fn single<P: Into<PathBuf>>(root: P) -> Self {
        Self::new([root])
    }

    /// The configured roots, lowest precedence first.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Display form of the search roots for error messages.
    pub fn display(&self) -> String {
        self.roots
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether any root contains a setup of this name.
    pub fn contains(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    /// The file that `name` resolves to, honoring override layering.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        let relative = relative_path(name)?;
        for root in self.roots.iter().rev() {
            let candidate = root.join(&relative);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Load and parse the setup `name` with the builtin reference
    /// whitelist.
    pub fn load(&self, name: &str) -> SetupResult<SetupDescriptor> {
        self.load_with(name, &ReferenceParams::default())
    }

    /// Load and parse the setup `name`, classifying parameters against
    /// `refs`.
    pub fn load_with(&self, name: &str, refs: &ReferenceParams) -> SetupResult<SetupDescriptor> {
        let path = self.locate(name).ok_or_else(|| SetupError::SetupNotFound {
            setup: name.to_string(),
            roots: self.display(),
        })?;
        debug!(setup = %name, path = %path.display(), "loading setup file");
        let source = fs::read_to_string(&path).map_err(|err| SetupError::MalformedSetup {
            setup: name.to_string(),
            reason: format!("could not read {}: {}", path.display(), err),
        })?;
        SetupDescriptor::parse_with(name, &source, refs)
    }

    /// Enumerate all setup names available across the roots.
    ///
    /// Names shadowed by a later root appear once; files that are not
    /// valid setup names are skipped. The result is sorted for stable
    /// listings.
    pub fn discover(&self) -> SetupResult<Vec<String>> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        for (index, root) in self.roots.iter().enumerate() {
            if !root.is_dir() {
                warn!(root = %root.display(), "setup root is not a directory, skipping");
                continue;
            }
            let mut names = Vec::new();
            collect_names(root, root, &mut names)?;
            for name in names {
                if let Some(prev) = seen.insert(name.clone(), index) {
                    debug!(
                        setup = %name,
                        shadowed_root = %self.roots[prev].display(),
                        winning_root = %root.display(),
                        "setup shadowed by later search root"
                    );
                }
            }
        }
        let mut names: Vec<String> = seen.into_keys().collect();
        names.sort();
        Ok(names)
    }
}

/// Map a logical setup name to its relative file path.
///
/// Rejects empty components and path traversal so a setup name can never
/// escape its root.
fn relative_path(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let mut path = PathBuf::new();
    for component in name.split('/') {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('\\')
        {
            return None;
        }
        path.push(component);
    }
    // append rather than set_extension: a name like "pgaa.v2" must map to
    // "pgaa.v2.toml", not "pgaa.toml"
    path.as_mut_os_string().push(".toml");
    Some(path)
}

fn collect_names(root: &Path, dir: &Path, out: &mut Vec<String>) -> SetupResult<()> {
    let entries = fs::read_dir(dir).map_err(|err| SetupError::MalformedSetup {
        setup: dir.display().to_string(),
        reason: format!("could not list directory: {err}"),
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| SetupError::MalformedSetup {
            setup: dir.display().to_string(),
            reason: format!("could not list directory: {err}"),
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_names(root, &path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            if let Ok(relative) = path.strip_prefix(root) {
                let name = relative
                    .with_extension("")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(name);
            }
        }
    }
    Ok(())
}
