use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AlmaError;

/// Archive identifier in canonical `uid://A001/X2d20/X3ca2` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(String);

impl Uid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form, `uid___A001_X2d20_X3ca2`.
    pub fn path_segment(&self) -> String {
        uid_to_path_segment(&self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = AlmaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parts: Vec<String> = if let Some(rest) = trimmed.strip_prefix("uid://") {
            rest.split('/').map(str::to_string).collect()
        } else if let Some(rest) = trimmed.strip_prefix("uid___") {
            let mut split = rest.splitn(3, '_');
            let first = split.next().unwrap_or_default().to_string();
            let second = split.next().unwrap_or_default().to_string();
            let rest = split.next().unwrap_or_default().to_string();
            vec![first, second, rest]
        } else {
            return Err(AlmaError::InvalidUid(value.to_string()));
        };

        let is_valid = parts.len() == 3
            && parts.iter().all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
            });
        if !is_valid {
            return Err(AlmaError::InvalidUid(value.to_string()));
        }
        Ok(Self(format!("uid://{}", parts.join("/"))))
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Generic identifier to path-segment normalization. Tolerates tokens that are
/// not well-formed uids so legacy directory names can still be derived.
pub fn uid_to_path_segment(uid: &str) -> String {
    let cleaned = uid
        .trim()
        .replace("uid://", "uid___")
        .replace("://", "___")
        .replace(['/', ':'], "_");
    let cleaned: String = cleaned
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.starts_with("uid___") {
        cleaned
    } else {
        format!("uid___{cleaned}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitIdentity {
    pub project_code: String,
    #[serde(default)]
    pub science_goal_uid: Option<Uid>,
    #[serde(default)]
    pub group_ous_uid: Option<Uid>,
    #[serde(alias = "member_ous_uid")]
    pub mous_uid: Uid,
}

impl UnitIdentity {
    pub fn new(project_code: &str, mous_uid: Uid) -> Self {
        Self {
            project_code: project_code.to_string(),
            science_goal_uid: None,
            group_ous_uid: None,
            mous_uid,
        }
    }

    /// Total order over the full identity tuple, used wherever a deterministic
    /// secondary order is needed.
    pub fn sort_key(&self) -> (String, String, String, String) {
        (
            self.mous_uid.to_string(),
            self.project_code.clone(),
            self.science_goal_uid
                .as_ref()
                .map(Uid::to_string)
                .unwrap_or_default(),
            self.group_ous_uid
                .as_ref()
                .map(Uid::to_string)
                .unwrap_or_default(),
        )
    }
}

impl fmt::Display for UnitIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_code, self.mous_uid)
    }
}

/// One discovered work unit with the archive metadata the query returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitCandidate {
    #[serde(flatten)]
    pub identity: UnitIdentity,
    #[serde(default)]
    pub eb_uids: Vec<String>,
    #[serde(default)]
    pub band_list: Vec<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub obs_date: Option<String>,
    #[serde(default)]
    pub qa2_passed: Option<bool>,
    #[serde(default)]
    pub qa0_status: Option<String>,
    #[serde(default)]
    pub qa0_reasons: Vec<String>,
    #[serde(default)]
    pub qa2_reasons: Vec<String>,
    #[serde(default)]
    pub source_rows: u32,
    #[serde(default)]
    pub query_timestamp: Option<String>,
}

impl UnitCandidate {
    pub fn new(identity: UnitIdentity) -> Self {
        Self {
            identity,
            eb_uids: Vec::new(),
            band_list: Vec::new(),
            release_date: None,
            obs_date: None,
            qa2_passed: None,
            qa0_status: None,
            qa0_reasons: Vec::new(),
            qa2_reasons: Vec::new(),
            source_rows: 0,
            query_timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Calibration,
    Scripts,
    Weblog,
    QaReports,
    Auxiliary,
    Readme,
    Raw,
    CalibrationProducts,
    ContinuumImages,
    Cubes,
    Admit,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 11] = [
        ArtifactKind::Calibration,
        ArtifactKind::Scripts,
        ArtifactKind::Weblog,
        ArtifactKind::QaReports,
        ArtifactKind::Auxiliary,
        ArtifactKind::Readme,
        ArtifactKind::Raw,
        ArtifactKind::CalibrationProducts,
        ArtifactKind::ContinuumImages,
        ArtifactKind::Cubes,
        ArtifactKind::Admit,
    ];

    /// Kinds selected by the `all-nonimage` token.
    pub const NON_IMAGE: [ArtifactKind; 7] = [
        ArtifactKind::Calibration,
        ArtifactKind::Scripts,
        ArtifactKind::Weblog,
        ArtifactKind::QaReports,
        ArtifactKind::Auxiliary,
        ArtifactKind::Readme,
        ArtifactKind::Raw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Calibration => "calibration",
            ArtifactKind::Scripts => "scripts",
            ArtifactKind::Weblog => "weblog",
            ArtifactKind::QaReports => "qa_reports",
            ArtifactKind::Auxiliary => "auxiliary",
            ArtifactKind::Readme => "readme",
            ArtifactKind::Raw => "raw",
            ArtifactKind::CalibrationProducts => "calibration_products",
            ArtifactKind::ContinuumImages => "continuum_images",
            ArtifactKind::Cubes => "cubes",
            ArtifactKind::Admit => "admit",
        }
    }

    pub fn fetched_by_default(&self) -> bool {
        matches!(
            self,
            ArtifactKind::Calibration
                | ArtifactKind::Scripts
                | ArtifactKind::Weblog
                | ArtifactKind::QaReports
                | ArtifactKind::Auxiliary
                | ArtifactKind::Readme
                | ArtifactKind::CalibrationProducts
        )
    }

    pub fn unpacked_by_default(&self) -> bool {
        matches!(
            self,
            ArtifactKind::Auxiliary | ArtifactKind::Readme | ArtifactKind::Weblog
        )
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = AlmaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        ArtifactKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| AlmaError::InvalidKind(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Downloading,
    #[serde(alias = "present")]
    Complete,
    #[serde(alias = "error")]
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Downloading => "downloading",
            ArtifactStatus::Complete => "complete",
            ArtifactStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum QaStatus {
    Pass,
    SemiPass,
    Fail,
    #[default]
    Unknown,
}

impl QaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaStatus::Pass => "PASS",
            QaStatus::SemiPass => "SEMIPASS",
            QaStatus::Fail => "FAIL",
            QaStatus::Unknown => "UNKNOWN",
        }
    }

    /// Reads archive-style status text, including boolean spellings.
    pub fn from_text(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PASS" | "TRUE" | "T" | "1" => Some(QaStatus::Pass),
            "SEMIPASS" => Some(QaStatus::SemiPass),
            "FAIL" | "FALSE" | "F" | "0" => Some(QaStatus::Fail),
            "UNKNOWN" => Some(QaStatus::Unknown),
            _ => None,
        }
    }

    pub fn from_passed(passed: Option<bool>) -> Self {
        match passed {
            Some(true) => QaStatus::Pass,
            Some(false) => QaStatus::Fail,
            None => QaStatus::Unknown,
        }
    }
}

impl fmt::Display for QaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalizes `6`, `B6`, `band6` and `BAND 6` to `BAND 6`.
pub fn normalize_band_token(value: &str) -> String {
    let upper = value.trim().to_ascii_uppercase();
    let digits = upper
        .trim_start_matches("BAND")
        .trim_start_matches('B')
        .trim()
        .to_string();
    if !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()) {
        return format!("BAND {digits}");
    }
    upper
}

/// Numeric part of a band token, empty when the token is textual only.
pub fn band_number(value: &str) -> String {
    normalize_band_token(value)
        .chars()
        .filter(|ch| ch.is_ascii_digit())
        .collect()
}
