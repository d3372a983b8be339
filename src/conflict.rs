use crate::{
    container::{parse_container, ResourceId},
    error::{ModError, Result},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMod {
    pub name: String,
    pub reason: String,
}

/// Result of [`ConflictAnalyzer::check_incremental`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalCheck {
    /// Existing mods sharing at least one resource with the candidate.
    pub conflicting: Vec<String>,
    /// Existing containers that could not be parsed. Their resources are
    /// unknown, so an empty `conflicting` list does not clear the candidate.
    pub skipped: Vec<SkippedMod>,
}

impl IncrementalCheck {
    pub fn is_clear(&self) -> bool {
        self.conflicting.is_empty() && self.skipped.is_empty()
    }
}

/// Resource ownership for one analysis run.
#[derive(Debug, Clone, Default)]
pub struct ConflictMap {
    owners: BTreeMap<ResourceId, BTreeSet<String>>,
    skipped: Vec<SkippedMod>,
}

impl ConflictMap {
    pub fn owners(&self, id: &ResourceId) -> Option<&BTreeSet<String>> {
        self.owners.get(id)
    }

    pub fn resource_count(&self) -> usize {
        self.owners.len()
    }

    /// Mods that were not parsed, with the reason. These contribute nothing to
    /// the map and are not evidence of "no conflicts".
    pub fn skipped(&self) -> &[SkippedMod] {
        &self.skipped
    }

    /// Resources owned by more than one mod, keyed by their hex rendering.
    pub fn get_conflicts(&self) -> BTreeMap<String, BTreeSet<String>> {
        let conflicts: BTreeMap<String, BTreeSet<String>> = self
            .owners
            .iter()
            .filter(|(_, mods)| mods.len() > 1)
            .map(|(id, mods)| (id.hex(), mods.clone()))
            .collect();
        info!("Found {} resource conflicts", conflicts.len());
        conflicts
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictAnalyzer;

impl ConflictAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn build_conflict_map(&self, mods: &[PathBuf]) -> ConflictMap {
        let mut map = ConflictMap::default();
        for path in mods {
            let name = mod_name(path);
            match self.scan_mod(path) {
                Ok(resources) => {
                    for id in resources {
                        map.owners.entry(id).or_default().insert(name.clone());
                    }
                }
                Err(reason) => map.skipped.push(SkippedMod { name, reason }),
            }
        }
        map
    }

    /// Existing mods sharing at least one resource with `candidate`, plus the
    /// existing containers that could not be read.
    ///
    /// A candidate that cannot be parsed is an error. Non-container files own
    /// no resources and are ignored.
    pub fn check_incremental(&self, candidate: &Path, existing: &[PathBuf]) -> Result<IncrementalCheck> {
        let wanted = parse_container(candidate)?;
        let mut conflicting = BTreeSet::new();
        let mut skipped = Vec::new();
        for path in existing {
            if path == candidate || !is_container(path) {
                continue;
            }
            match self.scan_mod(path) {
                Ok(resources) => {
                    if !resources.is_disjoint(&wanted) {
                        conflicting.insert(mod_name(path));
                    }
                }
                Err(reason) => skipped.push(SkippedMod {
                    name: mod_name(path),
                    reason,
                }),
            }
        }
        let check = IncrementalCheck {
            conflicting: conflicting.into_iter().collect(),
            skipped,
        };
        if !check.conflicting.is_empty() {
            warn!(
                "{} conflicts with: {}",
                mod_name(candidate),
                check.conflicting.join(", ")
            );
        }
        if !check.skipped.is_empty() {
            warn!(
                "{} could not be checked against {} unreadable mod(s)",
                mod_name(candidate),
                check.skipped.len()
            );
        }
        Ok(check)
    }

    /// Fails on any overlap, and also when an existing container could not be
    /// read.
    pub fn require_no_conflicts(&self, candidate: &Path, existing: &[PathBuf]) -> Result<()> {
        let check = self.check_incremental(candidate, existing)?;
        if !check.conflicting.is_empty() {
            return Err(ModError::Conflict {
                candidate: mod_name(candidate),
                mods: check.conflicting,
            });
        }
        if !check.skipped.is_empty() {
            return Err(ModError::UnverifiedConflicts {
                candidate: mod_name(candidate),
                unreadable: check.skipped.into_iter().map(|skip| skip.name).collect(),
            });
        }
        Ok(())
    }

    fn scan_mod(&self, path: &Path) -> std::result::Result<HashSet<ResourceId>, String> {
        if !is_container(path) {
            debug!("Skipping non-container file: {}", path.display());
            return Err("not a container file".to_string());
        }
        match parse_container(path) {
            Ok(resources) => {
                debug!("Found {} resources in {}", resources.len(), mod_name(path));
                Ok(resources)
            }
            Err(err) => {
                warn!("Failed to parse {}: {err}", mod_name(path));
                Err(err.to_string())
            }
        }
    }
}

fn is_container(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("package"))
}

fn mod_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
