use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::ArtifactKind;
use crate::error::AlmaError;

pub const CONFIG_FILENAME: &str = "alma-bulk.json";

pub const DEFAULT_RECURSIVE_UNPACK_PATTERNS: [&str; 12] = [
    "*.auxproducts.tgz",
    "*.auxproducts.tar.gz",
    "*.auxproducts.tar",
    "*.caltables.tgz",
    "*.caltables.tar.gz",
    "*.caltables.tar",
    "*weblog*.tgz",
    "*weblog*.tar.gz",
    "*weblog*.tar",
    "*readme*.tgz",
    "*readme*.tar.gz",
    "*readme*.tar",
];

pub const DEFAULT_RECURSIVE_EXCLUDE_PATTERNS: [&str; 1] = ["*.flagversions.*"];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: Option<u32>,
    pub paths: PathsSection,
    pub archive: ArchiveSection,
    pub filters: FilterSection,
    pub download: DownloadSection,
    pub unpack: UnpackSection,
    pub runtime: RuntimeSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsSection {
    pub dest: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveSection {
    pub tap_sync_url: String,
    pub datalink_sync_url: String,
    pub timeout_sec: u64,
    pub user_agent: String,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            tap_sync_url: "https://almascience.nrao.edu/tap/sync".to_string(),
            datalink_sync_url: "https://almascience.nrao.edu/datalink/sync".to_string(),
            timeout_sec: 120,
            user_agent: format!("alma-bulk/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DateField {
    #[default]
    Release,
    Observation,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterSection {
    pub date_field: DateField,
    pub exclude_tp: bool,
    pub exclude_7m: bool,
    pub bands_include: Vec<String>,
    pub bands_exclude: Vec<String>,
    pub project_codes_include: Vec<String>,
    pub project_codes_exclude: Vec<String>,
    pub mous_include: Vec<String>,
    pub mous_exclude: Vec<String>,
    pub min_freq_ghz: Option<f64>,
    pub max_freq_ghz: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct KindToggle {
    pub fetch: bool,
    pub unpack: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadSection {
    pub artifacts: Option<String>,
    pub kinds: BTreeMap<String, KindToggle>,
    pub max_workers: usize,
    pub unit_workers: usize,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub rate_limit_ms: u64,
    pub compute_sha256: bool,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            artifacts: None,
            kinds: BTreeMap::new(),
            max_workers: 4,
            unit_workers: 1,
            retry_count: 3,
            retry_backoff_ms: 1000,
            rate_limit_ms: 0,
            compute_sha256: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UnpackSection {
    pub remove_archives_after_unpack: bool,
    pub recursive_unpack_enabled: bool,
    pub recursive_unpack_patterns: Option<Vec<String>>,
    pub recursive_exclude_patterns: Option<Vec<String>>,
    pub recursive_unpack_max_passes: u32,
}

impl Default for UnpackSection {
    fn default() -> Self {
        Self {
            remove_archives_after_unpack: true,
            recursive_unpack_enabled: true,
            recursive_unpack_patterns: None,
            recursive_exclude_patterns: None,
            recursive_unpack_max_passes: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub max_runtime_min: Option<u64>,
    pub log_level: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_runtime_min: None,
            log_level: "info".to_string(),
        }
    }
}

/// Overrides collected from the command line. `None` never clears a
/// configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub dest: Option<String>,
    pub artifacts: Option<String>,
    pub max_workers: Option<usize>,
    pub unit_workers: Option<usize>,
    pub max_runtime_min: Option<u64>,
    pub date_field: Option<DateField>,
    pub exclude_tp: bool,
    pub exclude_7m: bool,
    pub bands: Option<String>,
    pub project_codes_include: Option<String>,
    pub project_codes_exclude: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub selected: BTreeSet<ArtifactKind>,
    pub max_workers: usize,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub rate_limit_ms: u64,
    pub compute_sha256: bool,
}

#[derive(Debug, Clone)]
pub struct UnpackPolicy {
    pub enabled: BTreeSet<ArtifactKind>,
    pub remove_archives_after_unpack: bool,
    pub recursive_enabled: bool,
    pub recursive_patterns: Vec<String>,
    pub recursive_exclude_patterns: Vec<String>,
    pub recursive_max_passes: u32,
}

impl UnpackPolicy {
    pub fn unpacks(&self, kind: ArtifactKind) -> bool {
        self.enabled.contains(&kind)
    }
}

/// Immutable configuration value threaded through every stage call.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub dest: Option<Utf8PathBuf>,
    pub archive: ArchiveSection,
    pub filters: FilterSection,
    pub fetch: FetchPolicy,
    pub unpack: UnpackPolicy,
    pub unit_workers: usize,
    pub max_runtime_min: Option<u64>,
    pub log_level: String,
}

impl ResolvedConfig {
    pub fn require_dest(&self) -> Result<Utf8PathBuf, AlmaError> {
        self.dest.clone().ok_or(AlmaError::MissingDestination)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<ResolvedConfig, AlmaError> {
        let config = match Self::locate(path)? {
            Some(config_path) => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| AlmaError::ConfigRead(config_path.clone()))?;
                serde_json::from_str::<Config>(&content)
                    .map_err(|err| AlmaError::ConfigParse(err.to_string()))?
            }
            None => Config::default(),
        };
        Self::resolve_config(config, overrides)
    }

    fn locate(path: Option<&str>) -> Result<Option<PathBuf>, AlmaError> {
        if let Some(path) = path {
            let explicit = PathBuf::from(path);
            if !explicit.exists() {
                return Err(AlmaError::ConfigRead(explicit));
            }
            return Ok(Some(explicit));
        }
        let local = PathBuf::from(CONFIG_FILENAME);
        if local.exists() {
            return Ok(Some(local));
        }
        let user = ProjectDirs::from("org", "alma", "alma-bulk")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILENAME))
            .filter(|candidate| candidate.exists());
        Ok(user)
    }

    pub fn resolve_config(
        mut config: Config,
        overrides: &ConfigOverrides,
    ) -> Result<ResolvedConfig, AlmaError> {
        apply_overrides(&mut config, overrides);

        let mut toggles = default_kind_toggles();
        for (token, toggle) in &config.download.kinds {
            let kind: ArtifactKind = token.parse()?;
            toggles.insert(kind, *toggle);
        }

        let selected = resolve_artifact_selection(
            config.download.artifacts.as_deref().unwrap_or("default"),
            &toggles,
        )?;
        let enabled = toggles
            .iter()
            .filter(|(_, toggle)| toggle.unpack)
            .map(|(kind, _)| *kind)
            .collect();

        let recursive_patterns = config
            .unpack
            .recursive_unpack_patterns
            .clone()
            .unwrap_or_else(|| {
                DEFAULT_RECURSIVE_UNPACK_PATTERNS
                    .iter()
                    .map(|p| p.to_string())
                    .collect()
            });
        let recursive_exclude_patterns = config
            .unpack
            .recursive_exclude_patterns
            .clone()
            .unwrap_or_else(|| {
                DEFAULT_RECURSIVE_EXCLUDE_PATTERNS
                    .iter()
                    .map(|p| p.to_string())
                    .collect()
            });

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            dest: config.paths.dest.clone().map(Utf8PathBuf::from),
            archive: config.archive.clone(),
            filters: config.filters.clone(),
            fetch: FetchPolicy {
                selected,
                max_workers: config.download.max_workers.max(1),
                retry_count: config.download.retry_count.max(1),
                retry_backoff_ms: config.download.retry_backoff_ms,
                rate_limit_ms: config.download.rate_limit_ms,
                compute_sha256: config.download.compute_sha256,
            },
            unpack: UnpackPolicy {
                enabled,
                remove_archives_after_unpack: config.unpack.remove_archives_after_unpack,
                recursive_enabled: config.unpack.recursive_unpack_enabled,
                recursive_patterns,
                recursive_exclude_patterns,
                recursive_max_passes: config.unpack.recursive_unpack_max_passes.max(1),
            },
            unit_workers: config.download.unit_workers.max(1),
            max_runtime_min: config.runtime.max_runtime_min,
            log_level: config.runtime.log_level.clone(),
        })
    }
}

fn apply_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(dest) = &overrides.dest {
        config.paths.dest = Some(dest.clone());
    }
    if let Some(artifacts) = &overrides.artifacts {
        config.download.artifacts = Some(artifacts.clone());
    }
    if let Some(workers) = overrides.max_workers {
        config.download.max_workers = workers;
    }
    if let Some(workers) = overrides.unit_workers {
        config.download.unit_workers = workers;
    }
    if let Some(minutes) = overrides.max_runtime_min {
        config.runtime.max_runtime_min = Some(minutes);
    }
    if let Some(field) = overrides.date_field {
        config.filters.date_field = field;
    }
    config.filters.exclude_tp |= overrides.exclude_tp;
    config.filters.exclude_7m |= overrides.exclude_7m;
    if let Some(bands) = &overrides.bands {
        let (include, exclude) = parse_bands_override(bands);
        if !include.is_empty() {
            config.filters.bands_include = include;
        }
        if !exclude.is_empty() {
            config.filters.bands_exclude = exclude;
        }
    }
    if let Some(codes) = &overrides.project_codes_include {
        config.filters.project_codes_include = split_list(codes);
    }
    if let Some(codes) = &overrides.project_codes_exclude {
        config.filters.project_codes_exclude = split_list(codes);
    }
}

pub fn default_kind_toggles() -> BTreeMap<ArtifactKind, KindToggle> {
    ArtifactKind::ALL
        .into_iter()
        .map(|kind| {
            (
                kind,
                KindToggle {
                    fetch: kind.fetched_by_default(),
                    unpack: kind.unpacked_by_default(),
                },
            )
        })
        .collect()
}

/// Resolves a selection string such as `default,+raw,-weblog`.
pub fn resolve_artifact_selection(
    spec: &str,
    toggles: &BTreeMap<ArtifactKind, KindToggle>,
) -> Result<BTreeSet<ArtifactKind>, AlmaError> {
    let defaults: BTreeSet<ArtifactKind> = toggles
        .iter()
        .filter(|(_, toggle)| toggle.fetch)
        .map(|(kind, _)| *kind)
        .collect();

    let mut selected = BTreeSet::new();
    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token {
            "default" => selected.extend(defaults.iter().copied()),
            "all-nonimage" => selected.extend(ArtifactKind::NON_IMAGE),
            _ => {
                if let Some(rest) = token.strip_prefix('-') {
                    selected.remove(&rest.parse::<ArtifactKind>()?);
                } else {
                    let rest = token.strip_prefix('+').unwrap_or(token);
                    if rest.is_empty() {
                        return Err(AlmaError::InvalidSelection(spec.to_string()));
                    }
                    selected.insert(rest.parse::<ArtifactKind>()?);
                }
            }
        }
    }
    if selected.is_empty() {
        selected = defaults;
    }
    Ok(selected)
}

/// Splits `include:3,4` / `exclude:9,10` / `3,4` into include and exclude lists.
pub fn parse_bands_override(value: &str) -> (Vec<String>, Vec<String>) {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix("exclude:") {
        return (Vec::new(), split_list(rest));
    }
    if let Some(rest) = value.strip_prefix("include:") {
        return (split_list(rest), Vec::new());
    }
    (split_list(value), Vec::new())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_resolves() {
        let resolved =
            ConfigLoader::resolve_config(Config::default(), &ConfigOverrides::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.fetch.max_workers, 4);
        assert!(resolved.fetch.selected.contains(&ArtifactKind::Auxiliary));
        assert!(!resolved.fetch.selected.contains(&ArtifactKind::Raw));
        assert!(resolved.unpack.unpacks(ArtifactKind::Weblog));
        assert!(!resolved.unpack.unpacks(ArtifactKind::Scripts));
        assert_eq!(resolved.unpack.recursive_patterns.len(), 12);
    }

    #[test]
    fn absent_overrides_keep_configured_values() {
        let mut config = Config::default();
        config.download.max_workers = 7;
        let resolved = ConfigLoader::resolve_config(config, &ConfigOverrides::default()).unwrap();
        assert_eq!(resolved.fetch.max_workers, 7);
        assert!(resolved.dest.is_none());
    }
}
