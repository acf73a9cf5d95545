//! Catalog loader.
//!
//! Loading pipeline, per source:
//! 1. Discover template files (recursive walk, `*.yaml` / `*.yml`)
//! 2. Read the optional `manifest.yaml` at the source root
//! 3. Parse each file (BOM-stripped, size-capped)
//! 4. Validate and intern; failures accumulate per file
//! 5. Enforce version pins and duplicate-id conflicts
//! 6. Freeze the surviving set into a snapshot
//!
//! A load succeeds when at least one template survived and no duplicate
//! ids were seen. Per-file failures abort the load unless the caller
//! opted into partial catalogs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CatalogError, ValidationIssue};
use crate::template::schema::{Manifest, TemplateFile};
use crate::template::store::{CatalogSnapshot, Template};
use crate::template::validation;

/// Name of the optional manifest file at a source root.
const MANIFEST_FILE: &str = "manifest.yaml";

// ============================================================================
// Sources and Options
// ============================================================================

/// Where templates come from.
#[derive(Debug, Clone)]
pub enum CatalogSource {
    /// A directory tree walked recursively
    Dir(PathBuf),
    /// A single template file
    File(PathBuf),
}

/// Options for the catalog loader.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Skip files that fail to parse or validate instead of failing
    /// the whole load
    pub allow_partial: bool,

    /// Maximum template file size in bytes
    pub max_file_bytes: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            allow_partial: false,
            max_file_bytes: 1024 * 1024,
        }
    }
}

// ============================================================================
// Load Report
// ============================================================================

/// Per-file failure recorded during a load.
#[derive(Debug)]
pub struct FileFailure {
    /// The failing file
    pub path: PathBuf,
    /// What went wrong
    pub error: CatalogError,
}

/// Outcome of a catalog load.
#[derive(Debug)]
pub struct LoadReport {
    /// Ids loaded, in load order
    pub loaded: Vec<String>,
    /// Files that failed, with their errors
    pub failed: Vec<FileFailure>,
    /// Non-fatal issues (unused variables, manifest gaps)
    pub warnings: Vec<ValidationIssue>,
}

// ============================================================================
// Loader
// ============================================================================

/// Loads template catalogs from disk.
#[derive(Debug, Default)]
pub struct CatalogLoader {
    options: LoaderOptions,
}

impl CatalogLoader {
    /// Creates a loader with the given options.
    #[must_use]
    pub const fn new(options: LoaderOptions) -> Self {
        Self { options }
    }

    /// Loads all sources into one snapshot.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::MissingSource`] when a source path does not exist
    /// - [`CatalogError::DuplicateId`] when two files declare the same id
    /// - [`CatalogError::EmptyCatalog`] when nothing loaded
    /// - [`CatalogError::PartialLoadRejected`] when files failed and
    ///   partial loads were not allowed
    pub fn load(
        &self,
        sources: &[CatalogSource],
    ) -> Result<(CatalogSnapshot, LoadReport), CatalogError> {
        let mut report = LoadReport {
            loaded: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
        };
        let mut templates: Vec<Arc<Template>> = Vec::new();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();

        for source in sources {
            match source {
                CatalogSource::Dir(root) => {
                    if !root.is_dir() {
                        return Err(CatalogError::MissingSource { path: root.clone() });
                    }
                    let manifest = self.read_manifest(root, &mut report);
                    let files = discover(root);
                    let ordered = order_files(files, manifest.as_ref(), root);
                    for path in ordered {
                        self.load_file(
                            &path,
                            manifest.as_ref(),
                            &mut templates,
                            &mut seen,
                            &mut report,
                        )?;
                    }
                }
                CatalogSource::File(path) => {
                    if !path.is_file() {
                        return Err(CatalogError::MissingSource { path: path.clone() });
                    }
                    self.load_file(path, None, &mut templates, &mut seen, &mut report)?;
                }
            }
        }

        if !report.failed.is_empty() && !self.options.allow_partial {
            return Err(CatalogError::PartialLoadRejected {
                count: report.failed.len(),
            });
        }

        if templates.is_empty() {
            return Err(CatalogError::EmptyCatalog {
                failed: report.failed.len(),
            });
        }

        debug!(
            loaded = templates.len(),
            failed = report.failed.len(),
            "catalog load complete"
        );

        Ok((CatalogSnapshot::new(templates), report))
    }

    fn read_manifest(&self, root: &Path, report: &mut LoadReport) -> Option<Manifest> {
        let path = root.join(MANIFEST_FILE);
        if !path.is_file() {
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_yaml::from_str::<Manifest>(strip_bom(&raw)) {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    report.warnings.push(ValidationIssue::warning(
                        path.display().to_string(),
                        format!("manifest ignored: {e}"),
                    ));
                    None
                }
            },
            Err(e) => {
                report.warnings.push(ValidationIssue::warning(
                    path.display().to_string(),
                    format!("manifest unreadable: {e}"),
                ));
                None
            }
        }
    }

    fn load_file(
        &self,
        path: &Path,
        manifest: Option<&Manifest>,
        templates: &mut Vec<Arc<Template>>,
        seen: &mut HashMap<String, PathBuf>,
        report: &mut LoadReport,
    ) -> Result<(), CatalogError> {
        let file = match self.parse_file(path) {
            Ok(file) => file,
            Err(error) => {
                warn!(path = %path.display(), %error, "template file rejected");
                report.failed.push(FileFailure {
                    path: path.to_path_buf(),
                    error,
                });
                return Ok(());
            }
        };

        // Version pins are enforced before interning so a pinned file
        // with the wrong version never shadows its id.
        if let Some(pinned) = manifest.and_then(|m| m.pins.get(&file.id)) {
            if pinned != &file.version {
                report.failed.push(FileFailure {
                    path: path.to_path_buf(),
                    error: CatalogError::PinMismatch {
                        id: file.id.clone(),
                        pinned: pinned.clone(),
                        declared: file.version.clone(),
                        path: path.to_path_buf(),
                    },
                });
                return Ok(());
            }
        }

        // Id collisions fail the whole load; never silently override.
        if let Some(first) = seen.get(&file.id) {
            return Err(CatalogError::DuplicateId {
                id: file.id,
                first: first.clone(),
                second: path.to_path_buf(),
            });
        }

        match validation::validate_and_intern(file, path) {
            Ok((template, warnings)) => {
                seen.insert(template.id.clone(), path.to_path_buf());
                report.loaded.push(template.id.clone());
                report.warnings.extend(warnings);
                templates.push(template);
            }
            Err(errors) => {
                report.failed.push(FileFailure {
                    path: path.to_path_buf(),
                    error: CatalogError::ValidationError {
                        path: path.display().to_string(),
                        errors,
                    },
                });
            }
        }

        Ok(())
    }

    fn parse_file(&self, path: &Path) -> Result<TemplateFile, CatalogError> {
        let metadata = std::fs::metadata(path).map_err(|_| CatalogError::MissingSource {
            path: path.to_path_buf(),
        })?;
        let size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        if size > self.options.max_file_bytes {
            return Err(CatalogError::ParseError {
                path: path.to_path_buf(),
                line: None,
                message: format!(
                    "file is {size} bytes, larger than the {} byte cap",
                    self.options.max_file_bytes
                ),
            });
        }

        let raw = std::fs::read_to_string(path).map_err(|_| CatalogError::MissingSource {
            path: path.to_path_buf(),
        })?;

        serde_yaml::from_str(strip_bom(&raw)).map_err(|e| CatalogError::ParseError {
            path: path.to_path_buf(),
            line: e.location().map(|l| l.line()),
            message: e.to_string(),
        })
    }
}

/// Strips a UTF-8 BOM if present.
fn strip_bom(raw: &str) -> &str {
    raw.strip_prefix('\u{feff}').unwrap_or(raw)
}

/// Finds template files under a root, sorted for deterministic walks.
fn discover(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for pattern in ["**/*.yaml", "**/*.yml"] {
        let full = root.join(pattern);
        if let Ok(paths) = glob::glob(&full.to_string_lossy()) {
            for path in paths.flatten() {
                if path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILE) {
                    continue;
                }
                files.push(path);
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Applies the manifest's load order: listed ids first, in manifest
/// order, then everything else in walk order.
///
/// The manifest lists ids, not paths; a cheap pre-parse of each file's
/// `id:` line would be fragile, so ordering matches on file stem
/// (`<id>.yaml`) which the catalog layout convention guarantees.
fn order_files(files: Vec<PathBuf>, manifest: Option<&Manifest>, _root: &Path) -> Vec<PathBuf> {
    let Some(manifest) = manifest else {
        return files;
    };
    if manifest.order.is_empty() {
        return files;
    }

    let mut ordered = Vec::with_capacity(files.len());
    let mut remaining = files;

    for id in &manifest.order {
        if let Some(pos) = remaining
            .iter()
            .position(|p| p.file_stem().and_then(|s| s.to_str()) == Some(id.as_str()))
        {
            ordered.push(remaining.remove(pos));
        }
    }
    ordered.extend(remaining);
    ordered
}
