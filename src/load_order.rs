//! Slot-based load order: the game loads folders alphabetically, so every
//! container lives in a three-digit-prefixed slot directory while scripts sit
//! at the staging root.

use crate::{
    error::{ModError, Result},
    fsutil::{copy_with_mtime, extension_lower, is_installable, remove_path},
    scanner::{Category, FileKind, ScanResult, ScannedFile},
};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MAX_PATH_LENGTH: usize = 260;
pub const MAX_CONTAINER_DEPTH: usize = 5;
pub const OVERRIDE_SLOT: &str = "999_Overrides";
pub const DEFAULT_SLOT: &str = "020_MainMods";

const SCRIPT_EXTENSIONS: &[&str] = &["py", "ts4script"];
const CC_SIZE_THRESHOLD: u64 = 10 * 1024 * 1024;
const IGNORED_DIRS: &[&str] = &["__pycache__"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSlot {
    pub name: &'static str,
    pub description: &'static str,
    pub keywords: &'static [&'static str],
}

pub const SLOTS: [OrderSlot; 6] = [
    OrderSlot {
        name: "000_Core",
        description: "Core Scripts/Frameworks",
        keywords: &["mccc", "ui_cheats", "wickedwhims"],
    },
    OrderSlot {
        name: "010_Libraries",
        description: "Shared Dependencies",
        keywords: &["library", "lib_", "framework"],
    },
    OrderSlot {
        name: "020_MainMods",
        description: "Gameplay Overhauls",
        keywords: &[],
    },
    OrderSlot {
        name: "030_Tuning",
        description: "XML Tuning Mods",
        keywords: &["tuning", "xml"],
    },
    OrderSlot {
        name: "040_CC",
        description: "Custom Content",
        keywords: &["cas", "hair", "clothes", "skin"],
    },
    OrderSlot {
        name: OVERRIDE_SLOT,
        description: "Override Mods (Load Last)",
        keywords: &["override"],
    },
];

fn prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{3}_\w+$").expect("slot prefix pattern is valid"))
}

pub fn is_valid_prefix(name: &str) -> bool {
    prefix_pattern().is_match(name)
}

pub fn slot_description(name: &str) -> Option<&'static str> {
    find_slot(name).map(|slot| slot.description)
}

fn find_slot(name: &str) -> Option<&'static OrderSlot> {
    SLOTS.iter().find(|slot| slot.name == name)
}

fn is_script_path(path: &Path) -> bool {
    extension_lower(path).is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext.as_str()))
}

fn is_container_path(path: &Path) -> bool {
    extension_lower(path).as_deref() == Some("package")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|part| part.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Where one scanned file lands in the staging tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub source: PathBuf,
    pub target: PathBuf,
    pub slot: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTree {
    pub root: PathBuf,
    pub slots: BTreeMap<&'static str, PathBuf>,
    pub placements: Vec<Placement>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrderOrganizer;

impl OrderOrganizer {
    pub fn new() -> Self {
        Self
    }

    pub fn slots(&self) -> &'static [OrderSlot] {
        &SLOTS
    }

    /// Pure function of the file's name, category, kind and size.
    ///
    /// Keywords are matched against the file name only; the override slot is
    /// never chosen automatically.
    pub fn assign_slot(&self, file: &ScannedFile) -> &'static str {
        let name = file.file_name().to_ascii_lowercase();

        for slot in SLOTS.iter().filter(|slot| slot.name != OVERRIDE_SLOT) {
            if slot.keywords.iter().any(|keyword| name.contains(keyword)) {
                debug!("Assigned {name} to {} (keyword match)", slot.name);
                return slot.name;
            }
        }

        match file.category {
            Category::CoreScripts => return "000_Core",
            Category::Libraries => return "010_Libraries",
            Category::CustomContent => return "040_CC",
            Category::MainMods | Category::Invalid => {}
        }

        if file.kind.is_script() {
            return "000_Core";
        }
        if file.size > CC_SIZE_THRESHOLD || name.contains("cas") {
            return "040_CC";
        }
        debug!("Assigned {name} to {DEFAULT_SLOT} (default)");
        DEFAULT_SLOT
    }

    /// Groups the valid files of a scan by slot. Invalid files are never staged.
    pub fn group_by_slot(&self, scan: &ScanResult) -> BTreeMap<&'static str, Vec<ScannedFile>> {
        let mut grouped: BTreeMap<&'static str, Vec<ScannedFile>> = BTreeMap::new();
        for (category, files) in scan {
            if *category == Category::Invalid {
                continue;
            }
            for file in files.iter().filter(|file| file.is_valid) {
                grouped
                    .entry(self.assign_slot(file))
                    .or_default()
                    .push(file.clone());
            }
        }
        grouped
    }

    /// Target for a file in `slot`; scripts always resolve to the root.
    pub fn target_path(&self, file: &ScannedFile, slot: &str, output_root: &Path) -> PathBuf {
        let name = file.file_name();
        if file.kind.is_script() {
            output_root.join(name)
        } else {
            output_root.join(slot).join(name)
        }
    }

    /// Copies every file into its slot under `output_root`.
    ///
    /// Slot directories and root-level installable files left by an earlier
    /// run are removed first, so the result holds exactly this run's files.
    pub fn generate_structure(
        &self,
        files_by_slot: &BTreeMap<&'static str, Vec<ScannedFile>>,
        output_root: &Path,
    ) -> Result<StagedTree> {
        info!("Generating load order structure in {}", output_root.display());

        let mut placements = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        for (slot_name, files) in files_by_slot {
            let slot = find_slot(slot_name)
                .ok_or_else(|| ModError::structure(format!("unknown slot: {slot_name}")))?;
            for file in files {
                let target = self.target_path(file, slot.name, output_root);
                check_placement(output_root, &target, file.kind)?;
                if !seen.insert(target.clone()) {
                    return Err(ModError::structure(format!(
                        "two files resolve to the same target: {}",
                        relative_display(output_root, &target)
                    )));
                }
                placements.push(Placement {
                    source: file.path.clone(),
                    target,
                    slot: slot.name,
                });
            }
        }

        if let Some(inside) = placements
            .iter()
            .find(|placement| placement.source.starts_with(output_root))
        {
            return Err(ModError::structure(format!(
                "source {} lies inside the staging root {}",
                inside.source.display(),
                output_root.display()
            )));
        }
        clear_staged_content(output_root)?;

        fs::create_dir_all(output_root)
            .map_err(|err| ModError::io(output_root, "create staging root", err))?;
        let mut slots = BTreeMap::new();
        for slot in SLOTS.iter() {
            let slot_path = output_root.join(slot.name);
            fs::create_dir_all(&slot_path)
                .map_err(|err| ModError::io(&slot_path, "create slot directory", err))?;
            debug!("Created slot: {} ({})", slot.name, slot.description);
            slots.insert(slot.name, slot_path);
        }

        for placement in &placements {
            copy_with_mtime(&placement.source, &placement.target)
                .map_err(|err| ModError::io(&placement.target, "stage file", err))?;
            debug!(
                "Placed {} in {}",
                file_name(&placement.target),
                relative_display(output_root, placement.target.parent().unwrap_or(output_root))
            );
        }

        info!(
            "Structure generated: {} files across {} slots",
            placements.len(),
            files_by_slot.len()
        );
        Ok(StagedTree {
            root: output_root.to_path_buf(),
            slots,
            placements,
        })
    }

    /// Collects every layout problem under `root` instead of stopping at the first.
    pub fn validate_structure(&self, root: &Path) -> (bool, Vec<String>) {
        if !root.is_dir() {
            return (false, vec![format!("{} does not exist", root.display())]);
        }
        let mut warnings = Vec::new();

        for slot in SLOTS.iter() {
            if !root.join(slot.name).is_dir() {
                warnings.push(format!("Missing slot folder: {}", slot.name));
            }
        }

        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warnings.push(format!("Unreadable entry: {err}"));
                    continue;
                }
            };
            let path = entry.path();
            let rel = relative_display(root, path);

            if entry.depth() == 1 && entry.file_type().is_dir() {
                let name = entry.file_name().to_string_lossy();
                if !is_valid_prefix(&name)
                    && !name.starts_with('.')
                    && !IGNORED_DIRS.contains(&name.as_ref())
                {
                    warnings.push(format!("Invalid prefix format: {name}"));
                }
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if is_script_path(path) && entry.depth() > 1 {
                warnings.push(format!("Script file nested (must be in root): {rel}"));
            }
            if path.to_string_lossy().chars().count() > MAX_PATH_LENGTH {
                warnings.push(format!("Path exceeds {MAX_PATH_LENGTH} characters: {rel}"));
            }
            let depth = entry.depth() - 1;
            if is_container_path(path) && depth > MAX_CONTAINER_DEPTH {
                warnings.push(format!("Package nested too deep ({depth} levels): {rel}"));
            }
        }

        (warnings.is_empty(), warnings)
    }

    /// File names present in more than one slot, mapped to the slots holding them.
    pub fn detect_duplicate_names(&self, root: &Path) -> BTreeMap<String, Vec<String>> {
        let mut by_name: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (slot, path) in slot_dirs(root) {
            for entry in WalkDir::new(&path).min_depth(1).into_iter().flatten() {
                if entry.file_type().is_file() {
                    by_name
                        .entry(entry.file_name().to_string_lossy().to_string())
                        .or_default()
                        .insert(slot.clone());
                }
            }
        }
        let duplicates: BTreeMap<String, Vec<String>> = by_name
            .into_iter()
            .filter(|(_, slots)| slots.len() > 1)
            .map(|(name, slots)| (name, slots.into_iter().collect()))
            .collect();
        for (name, slots) in &duplicates {
            warn!("{name} appears in several slots: {}", slots.join(", "));
        }
        duplicates
    }

    /// Scripts first, then each slot's containers, everything alphabetical.
    pub fn export_order(&self, root: &Path) -> Vec<String> {
        if !root.is_dir() {
            return Vec::new();
        }
        let mut scripts: Vec<String> = fs::read_dir(root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
                    .filter(|entry| is_script_path(&entry.path()))
                    .map(|entry| entry.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        scripts.sort();

        let mut order = scripts;
        for (_, slot_path) in slot_dirs(root) {
            let mut containers: Vec<String> = WalkDir::new(&slot_path)
                .min_depth(1)
                .into_iter()
                .flatten()
                .filter(|entry| entry.file_type().is_file() && is_container_path(entry.path()))
                .map(|entry| relative_display(root, entry.path()))
                .collect();
            containers.sort();
            order.extend(containers);
        }
        debug!("Load order contains {} items", order.len());
        order
    }

    /// Moves a container between slots inside a staging tree.
    pub fn move_file(&self, name: &str, from: &str, to: &str, root: &Path) -> Result<PathBuf> {
        if find_slot(from).is_none() || find_slot(to).is_none() {
            let valid: Vec<&str> = SLOTS.iter().map(|slot| slot.name).collect();
            return Err(ModError::structure(format!(
                "invalid slot: {from} or {to} (valid slots: {})",
                valid.join(", ")
            )));
        }
        if is_script_path(Path::new(name)) {
            return Err(ModError::structure(
                "script files must remain in the staging root",
            ));
        }
        let source = root.join(from).join(name);
        if !source.is_file() {
            return Err(ModError::structure(format!(
                "source mod not found: {}",
                source.display()
            )));
        }
        let target_dir = root.join(to);
        fs::create_dir_all(&target_dir)
            .map_err(|err| ModError::io(&target_dir, "create slot directory", err))?;
        let target = target_dir.join(name);
        fs::rename(&source, &target).map_err(|err| ModError::io(&source, "move mod", err))?;
        info!("Moved {name}: {from} -> {to}");
        Ok(target)
    }

    /// Writes [`OrderOrganizer::export_order`] as a numbered listing.
    pub fn write_order_file(&self, root: &Path, output: &Path) -> Result<usize> {
        let order = self.export_order(root);
        let listing: String = order
            .iter()
            .enumerate()
            .map(|(index, name)| format!("{:03}. {name}\n", index + 1))
            .collect();
        fs::write(output, listing).map_err(|err| ModError::io(output, "write load order", err))?;
        info!("Exported load order ({} items) to {}", order.len(), output.display());
        Ok(order.len())
    }
}

fn clear_staged_content(root: &Path) -> Result<()> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(ModError::io(root, "read staging root", err)),
    };
    let mut removed = 0usize;
    for entry in entries {
        let entry = entry.map_err(|err| ModError::io(root, "read staging root", err))?;
        let path = entry.path();
        let is_slot = find_slot(&entry.file_name().to_string_lossy()).is_some();
        let is_stale_file = entry.file_type().is_ok_and(|kind| !kind.is_dir()) && is_installable(&path);
        if is_slot || is_stale_file {
            remove_path(&path).map_err(|err| ModError::io(&path, "clear staging root", err))?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!("Cleared {removed} stale entries from {}", root.display());
    }
    Ok(())
}

fn check_placement(root: &Path, target: &Path, kind: FileKind) -> Result<()> {
    let length = target.to_string_lossy().chars().count();
    if length > MAX_PATH_LENGTH {
        return Err(ModError::InvalidPath {
            path: target.to_path_buf(),
            message: format!("path is {length} characters, limit is {MAX_PATH_LENGTH}"),
        });
    }
    if kind == FileKind::Container {
        let depth = target
            .strip_prefix(root)
            .map(|rel| rel.components().count().saturating_sub(1))
            .unwrap_or(0);
        if depth > MAX_CONTAINER_DEPTH {
            return Err(ModError::structure(format!(
                "container nested {depth} levels deep, limit is {MAX_CONTAINER_DEPTH}"
            )));
        }
    }
    Ok(())
}

/// Prefix-named directories directly under `root`, sorted by name.
fn slot_dirs(root: &Path) -> Vec<(String, PathBuf)> {
    let mut dirs: Vec<(String, PathBuf)> = fs::read_dir(root)
        .map(|entries| {
            entries
                .flatten()
                .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
                .map(|entry| (entry.file_name().to_string_lossy().to_string(), entry.path()))
                .filter(|(name, _)| is_valid_prefix(name))
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}
