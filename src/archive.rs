use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ArchiveSection;
use crate::domain::{ArtifactKind, Uid};
use crate::error::AlmaError;

/// One row of a unit's deliverable listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub kind: ArtifactKind,
    pub filename: String,
    pub url: String,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub semantics: Option<String>,
    pub description: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// False when the server ignored the range and the file was rewritten from zero.
    pub resumed: bool,
    pub bytes_written: u64,
}

pub type TapRow = BTreeMap<String, String>;

pub trait ArchiveClient: Send + Sync {
    fn query_tap(&self, adql: &str) -> Result<Vec<TapRow>, AlmaError>;

    fn list_deliverables(&self, mous_uid: &Uid) -> Result<Vec<Deliverable>, AlmaError>;

    /// Streams `url` into `destination`. With `offset > 0` the transfer asks
    /// for the remaining bytes only and appends.
    fn download(
        &self,
        url: &str,
        destination: &Path,
        offset: u64,
    ) -> Result<TransferOutcome, AlmaError>;
}

#[derive(Clone)]
pub struct AlmaHttpClient {
    client: Client,
    tap_sync_url: String,
    datalink_sync_url: String,
}

impl AlmaHttpClient {
    pub fn new(settings: &ArchiveSection) -> Result<Self, AlmaError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&settings.user_agent)
                .map_err(|err| AlmaError::ArchiveHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_sec.max(1)))
            .build()
            .map_err(|err| AlmaError::ArchiveHttp(err.to_string()))?;

        Ok(Self {
            client,
            tap_sync_url: settings.tap_sync_url.clone(),
            datalink_sync_url: settings.datalink_sync_url.clone(),
        })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, AlmaError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(AlmaError::ArchiveHttp(err.to_string()));
                }
            }
        }
    }

    fn text_or_status(response: reqwest::blocking::Response) -> Result<String, AlmaError> {
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| AlmaError::ArchiveHttp(err.to_string()))?;
        if !status.is_success() {
            return Err(AlmaError::ArchiveStatus {
                status: status.as_u16(),
                message: truncate(&body, 300),
            });
        }
        Ok(body)
    }
}

impl ArchiveClient for AlmaHttpClient {
    fn query_tap(&self, adql: &str) -> Result<Vec<TapRow>, AlmaError> {
        debug!(adql, "tap.request");
        let response = self.send_with_retries(|| {
            self.client.get(&self.tap_sync_url).query(&[
                ("REQUEST", "doQuery"),
                ("LANG", "ADQL"),
                ("FORMAT", "csv"),
                ("QUERY", adql),
            ])
        })?;
        let body = Self::text_or_status(response)?;
        parse_csv_rows(&body)
    }

    fn list_deliverables(&self, mous_uid: &Uid) -> Result<Vec<Deliverable>, AlmaError> {
        let datalink_id = mous_uid.path_segment();
        let response = self.send_with_retries(|| {
            self.client
                .get(&self.datalink_sync_url)
                .query(&[("ID", datalink_id.as_str())])
        })?;
        let body = Self::text_or_status(response)?;
        parse_datalink_votable(&body)
    }

    fn download(
        &self,
        url: &str,
        destination: &Path,
        offset: u64,
    ) -> Result<TransferOutcome, AlmaError> {
        let name = destination
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| url.to_string());

        let response = self
            .send_with_retries(|| {
                let request = self.client.get(url);
                if offset > 0 {
                    request.header(RANGE, format!("bytes={offset}-"))
                } else {
                    request
                }
            })
            .map_err(|err| AlmaError::transient(&name, err.to_string()))?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            return Ok(TransferOutcome {
                resumed: true,
                bytes_written: 0,
            });
        }
        if !status.is_success() {
            let code = status.as_u16();
            if is_retryable_status(code) {
                return Err(AlmaError::transient(&name, format!("status {code}")));
            }
            return Err(AlmaError::ArchiveStatus {
                status: code,
                message: format!("download of {name} refused"),
            });
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        if offset > 0 && !resumed {
            warn!(file = %name, "server ignored range request; restarting transfer");
        }
        let mut file = if resumed {
            OpenOptions::new().append(true).open(destination)
        } else {
            File::create(destination)
        }
        .map_err(|err| AlmaError::Filesystem(err.to_string()))?;

        let mut response = response;
        let written = io::copy(&mut response, &mut file)
            .map_err(|err| AlmaError::transient(&name, err.to_string()))?;
        file.sync_all()
            .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        Ok(TransferOutcome {
            resumed,
            bytes_written: written,
        })
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// TAP CSV output into header-keyed rows.
pub fn parse_csv_rows(body: &str) -> Result<Vec<TapRow>, AlmaError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(body.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| AlmaError::ArchiveHttp(format!("bad TAP csv header: {err}")))?
        .iter()
        .map(|name| name.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|err| AlmaError::ArchiveHttp(format!("bad TAP csv row: {err}")))?;
        let row: TapRow = headers
            .iter()
            .zip(record.iter())
            .map(|(name, value)| (name.clone(), value.trim().to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub(crate) fn compile(pattern: &str) -> Result<Regex, AlmaError> {
    Regex::new(pattern).map_err(|err| AlmaError::ArchiveHttp(format!("pattern {pattern}: {err}")))
}

/// Reads the datalink VOTable. Rows without an access URL, and rows whose
/// product does not map to a known kind, are dropped here.
pub fn parse_datalink_votable(xml: &str) -> Result<Vec<Deliverable>, AlmaError> {
    let field_re = compile(r"(?s)<(?:\w+:)?FIELD\b([^>]*)>")?;
    let name_re = compile(r#"\bname\s*=\s*"([^"]*)""#)?;
    let id_re = compile(r#"\bID\s*=\s*"([^"]*)""#)?;
    let row_re = compile(r"(?s)<(?:\w+:)?TR\b[^>]*>(.*?)</(?:\w+:)?TR>")?;
    let cell_re = compile(r"(?s)<(?:\w+:)?TD\b[^>]*/>|<(?:\w+:)?TD\b[^>]*>(.*?)</(?:\w+:)?TD>")?;

    let fields: Vec<String> = field_re
        .captures_iter(xml)
        .map(|caps| {
            let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            name_re
                .captures(attrs)
                .or_else(|| id_re.captures(attrs))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default()
        })
        .collect();

    let mut deliverables = Vec::new();
    for row_caps in row_re.captures_iter(xml) {
        let inner = row_caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let values: Vec<String> = cell_re
            .captures_iter(inner)
            .map(|caps| {
                caps.get(1)
                    .map(|m| decode_entities(m.as_str().trim()))
                    .unwrap_or_default()
            })
            .collect();
        let row: BTreeMap<&str, String> = fields
            .iter()
            .map(String::as_str)
            .zip(values)
            .collect();

        let Some(url) = row
            .get("access_url")
            .or_else(|| row.get("accessURL"))
            .filter(|url| !url.is_empty())
        else {
            continue;
        };
        let filename = filename_from_url(url);
        let semantics = row
            .get("semantics")
            .or_else(|| row.get("content_qualifier"))
            .filter(|value| !value.is_empty())
            .cloned();
        let Some(kind) = classify_deliverable(semantics.as_deref(), &filename) else {
            debug!(%filename, "datalink row has no recognized kind; skipped");
            continue;
        };

        deliverables.push(Deliverable {
            kind,
            filename,
            url: url.clone(),
            size_bytes: row
                .get("content_length")
                .and_then(|value| value.parse::<u64>().ok()),
            checksum: non_empty(row.get("checksum")),
            semantics,
            description: non_empty(row.get("description")),
            content_type: non_empty(row.get("content_type")),
        });
    }
    Ok(deliverables)
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|value| !value.is_empty()).cloned()
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Last path segment of the URL, or the tail of its `ID` query parameter.
pub fn filename_from_url(url: &str) -> String {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    if let Some((_, tail)) = path.split_once('/') {
        if let Some(name) = tail.rsplit('/').next().filter(|name| !name.is_empty()) {
            return name.to_string();
        }
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(id) = pair.strip_prefix("ID=") {
                if let Some(name) = id.rsplit('/').next().filter(|name| !name.is_empty()) {
                    return name.to_string();
                }
            }
        }
    }
    "download.dat".to_string()
}

/// Maps a datalink product to its deliverable kind from filename and
/// semantics. First match wins.
pub fn classify_deliverable(semantics: Option<&str>, filename: &str) -> Option<ArtifactKind> {
    let name = filename.to_ascii_lowercase();
    let semantics = semantics.unwrap_or_default().to_ascii_lowercase();

    if name.contains("readme")
        || semantics.contains("readme")
        || semantics.contains("documentation")
    {
        return Some(ArtifactKind::Readme);
    }
    if name.contains("weblog") || semantics.contains("weblog") {
        return Some(ArtifactKind::Weblog);
    }
    if name.contains("qa0_report")
        || name.contains("qa2_report")
        || name.contains("qa/")
        || name.contains("aquareport")
        || semantics.contains("/qa/")
        || semantics.contains("#qa")
        || semantics.contains("qa2")
    {
        return Some(ArtifactKind::QaReports);
    }
    if name.contains("auxiliary") || name.contains("auxproducts") || semantics.contains("auxiliary")
    {
        return Some(ArtifactKind::Auxiliary);
    }
    if name.contains("scriptforpi") || semantics.contains("script") {
        return Some(ArtifactKind::Scripts);
    }
    if name.contains("calibration") || name.ends_with(".cal") || semantics.contains("calibration") {
        return Some(ArtifactKind::Calibration);
    }
    if name.contains("calimage") || semantics.contains("calimage") {
        return Some(ArtifactKind::CalibrationProducts);
    }
    if name.contains("cube") {
        return Some(ArtifactKind::Cubes);
    }
    if name.contains("cont") || name.contains("image") {
        return Some(ArtifactKind::ContinuumImages);
    }
    if name.contains("admit") {
        return Some(ArtifactKind::Admit);
    }
    if name.contains("asdm") || name.contains("raw") {
        return Some(ArtifactKind::Raw);
    }
    None
}
