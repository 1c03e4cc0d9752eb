use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{Uid, UnitIdentity};
use crate::error::AlmaError;

pub const MANIFEST_FILENAME: &str = "almaBulkManifest.json";
pub const SUMMARY_FILENAME: &str = "almaBulkSummary.json";
pub const SUMMARY_MARKDOWN_FILENAME: &str = "summary.md";
pub const DELIVERED_DIR: &str = "delivered";
pub const RUN1_DIR: &str = "run1";

const UNKNOWN_SEGMENT: &str = "uid___unknown";

/// Maps a unit identity to its directory below a destination root.
///
/// A legacy-form directory that already exists is returned unchanged, and so
/// is any existing `project/*/*/member.*` directory for the same member.
/// Nothing is created or moved here.
#[derive(Debug, Clone)]
pub struct PathResolver {
    dest: Utf8PathBuf,
}

impl PathResolver {
    pub fn new(dest: impl Into<Utf8PathBuf>) -> Self {
        Self { dest: dest.into() }
    }

    pub fn dest(&self) -> &Utf8Path {
        &self.dest
    }

    pub fn resolve(&self, identity: &UnitIdentity) -> UnitLayout {
        let legacy = self.legacy_path(identity);
        if legacy.is_dir() {
            return UnitLayout::new(legacy);
        }

        let canonical = self.canonical_path(identity);
        if canonical.is_dir() {
            return UnitLayout::new(canonical);
        }

        if let Some(existing) = self.existing_member_dir(identity) {
            return UnitLayout::new(existing);
        }
        UnitLayout::new(canonical)
    }

    pub fn canonical_path(&self, identity: &UnitIdentity) -> Utf8PathBuf {
        self.dest
            .join(project_segment(&identity.project_code))
            .join(format!("science_goal.{}", segment_or_unknown(&identity.science_goal_uid)))
            .join(format!("group.{}", segment_or_unknown(&identity.group_ous_uid)))
            .join(format!("member.{}", identity.mous_uid.path_segment()))
    }

    pub fn legacy_path(&self, identity: &UnitIdentity) -> Utf8PathBuf {
        self.dest
            .join(legacy_segment("science_goal", &identity.science_goal_uid))
            .join(legacy_segment("group_obs_unit_set", &identity.group_ous_uid))
            .join(format!("member.{}", identity.mous_uid.path_segment()))
    }

    fn existing_member_dir(&self, identity: &UnitIdentity) -> Option<Utf8PathBuf> {
        let project_dir = self.dest.join(project_segment(&identity.project_code));
        let member = format!("member.{}", identity.mous_uid.path_segment());
        let mut found = Vec::new();
        for goal in sorted_subdirs(&project_dir) {
            for group in sorted_subdirs(&goal) {
                let candidate = group.join(&member);
                if candidate.is_dir() {
                    found.push(candidate);
                }
            }
        }
        found.into_iter().next()
    }
}

/// Paths inside one unit directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLayout {
    root: Utf8PathBuf,
}

impl UnitLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn delivered(&self) -> Utf8PathBuf {
        self.root.join(DELIVERED_DIR)
    }

    pub fn run1(&self) -> Utf8PathBuf {
        self.root.join(RUN1_DIR)
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.root.join(MANIFEST_FILENAME)
    }

    pub fn summary_path(&self) -> Utf8PathBuf {
        self.root.join(SUMMARY_FILENAME)
    }

    pub fn summary_markdown_path(&self) -> Utf8PathBuf {
        self.root.join(SUMMARY_MARKDOWN_FILENAME)
    }

    /// Creates the unit directory and its required subdirectories. Additive only.
    pub fn ensure(&self) -> Result<(), AlmaError> {
        for dir in [self.root.clone(), self.delivered(), self.run1()] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn missing_subdirs(&self) -> Vec<Utf8PathBuf> {
        [self.delivered(), self.run1()]
            .into_iter()
            .filter(|dir| !dir.is_dir())
            .collect()
    }
}

/// Finds unit directories below `root`: member-named directories and any
/// directory holding a manifest or summary. Nested hits inside an already
/// found unit are ignored.
pub fn find_unit_dirs(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, AlmaError> {
    let mut found: Vec<Utf8PathBuf> = Vec::new();
    for path in crate::store::walk_dir(root.as_std_path())? {
        if !path.is_dir() {
            continue;
        }
        let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
            continue;
        };
        let is_member = path
            .file_name()
            .is_some_and(|name| {
                name.starts_with("member.uid___") || name.starts_with("member_uid___")
            });
        let has_docs =
            path.join(MANIFEST_FILENAME).is_file() || path.join(SUMMARY_FILENAME).is_file();
        if is_member || has_docs {
            found.push(path);
        }
    }
    found.sort();

    let mut units: Vec<Utf8PathBuf> = Vec::new();
    for path in found {
        if units.iter().any(|unit| path.starts_with(unit)) {
            continue;
        }
        units.push(path);
    }
    Ok(units)
}

/// Recovers as much identity as the directory names carry. Works for both the
/// canonical and the legacy layout.
pub fn identity_from_dir(dir: &Utf8Path) -> Option<UnitIdentity> {
    let name = dir.file_name()?;
    let member = name
        .strip_prefix("member.")
        .or_else(|| name.strip_prefix("member_"))?;
    let mous_uid: Uid = member.parse().ok()?;

    let group_dir = dir.parent()?;
    let group_name = group_dir.file_name().unwrap_or_default();
    let group_ous_uid = group_name
        .strip_prefix("group.")
        .or_else(|| group_name.strip_prefix("group_obs_unit_set_"))
        .and_then(|value| value.parse::<Uid>().ok());

    let goal_dir = group_dir.parent();
    let goal_name = goal_dir.and_then(Utf8Path::file_name).unwrap_or_default();
    let science_goal_uid = goal_name
        .strip_prefix("science_goal.")
        .or_else(|| goal_name.strip_prefix("science_goal_"))
        .and_then(|value| value.parse::<Uid>().ok());

    let project_code = if goal_name.starts_with("science_goal.") {
        goal_dir
            .and_then(Utf8Path::parent)
            .and_then(Utf8Path::file_name)
            .unwrap_or_default()
            .to_string()
    } else {
        String::new()
    };

    Some(UnitIdentity {
        project_code,
        science_goal_uid,
        group_ous_uid,
        mous_uid,
    })
}

fn segment_or_unknown(uid: &Option<Uid>) -> String {
    uid.as_ref()
        .map(Uid::path_segment)
        .unwrap_or_else(|| UNKNOWN_SEGMENT.to_string())
}

/// `science_goal_uid___…` when known, the bare `science_goal_unknown` otherwise.
fn legacy_segment(prefix: &str, uid: &Option<Uid>) -> String {
    match uid {
        Some(uid) => format!("{prefix}_{}", uid.path_segment()),
        None => format!("{prefix}_unknown"),
    }
}

fn project_segment(project_code: &str) -> String {
    let trimmed = project_code.trim();
    if trimmed.is_empty() {
        "unknown_project".to_string()
    } else {
        trimmed.replace(['/', '\\'], "_")
    }
}

fn sorted_subdirs(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
        return Vec::new();
    };
    let mut dirs: Vec<Utf8PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .collect();
    dirs.sort();
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> UnitIdentity {
        UnitIdentity {
            project_code: "2019.1.00001.S".to_string(),
            science_goal_uid: Some("uid://A001/X1/X1".parse().unwrap()),
            group_ous_uid: Some("uid://A001/X1/X2".parse().unwrap()),
            mous_uid: "uid://A001/X1/X3".parse().unwrap(),
        }
    }

    #[test]
    fn identity_round_trips_through_canonical_dir() {
        let resolver = PathResolver::new("/data");
        let path = resolver.canonical_path(&identity());
        assert_eq!(
            path.as_str(),
            "/data/2019.1.00001.S/science_goal.uid___A001_X1_X1/group.uid___A001_X1_X2/member.uid___A001_X1_X3"
        );
        assert_eq!(identity_from_dir(&path), Some(identity()));
    }

    #[test]
    fn unknown_parents_use_placeholder_segments() {
        let resolver = PathResolver::new("/data");
        let id = UnitIdentity::new("2019.1.00001.S", "uid://A001/X1/X3".parse().unwrap());
        let path = resolver.canonical_path(&id);
        assert!(path.as_str().contains("science_goal.uid___unknown/group.uid___unknown"));
    }
}
