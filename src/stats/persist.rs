//! Session JSON documents.
//!
//! One document per session, named after its first and last timestamps. A
//! save goes to a temp file which is renamed into place; the previous file
//! for the session is removed only after the new one exists.

use crate::error::{LoadError, PersistError};
use crate::stats::bucket::PerSecondBucket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    #[serde(with = "iso_seconds")]
    pub session_start: DateTime<Utc>,
    #[serde(with = "iso_seconds")]
    pub session_end:   DateTime<Utc>,
    pub per_second:    Vec<SecondRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondRecord {
    pub second:          u64,
    pub protocol_counts: BTreeMap<String, u64>,
    pub connections:     Vec<ConnectionRecord>,
    pub avg_packet_size: f64,
    pub pps:             f64,
    pub bps:             f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub src: String,
    pub dst: String,
}

impl From<&PerSecondBucket> for SecondRecord {
    fn from(bucket: &PerSecondBucket) -> Self {
        Self {
            second:          bucket.second,
            protocol_counts: bucket.protocol_counts.clone(),
            connections:     bucket
                .connections
                .iter()
                .map(|(src, dst)| ConnectionRecord {
                    src: src.clone(),
                    dst: dst.clone(),
                })
                .collect(),
            avg_packet_size: bucket.avg_packet_size(),
            pps:             bucket.packets as f64,
            bps:             bucket.bytes as f64,
        }
    }
}

impl SessionDocument {
    pub fn new<'a>(
        session_start: DateTime<Utc>,
        session_end:   DateTime<Utc>,
        buckets:       impl IntoIterator<Item = &'a PerSecondBucket>,
    ) -> Self {
        let mut per_second: Vec<SecondRecord> = buckets.into_iter().map(SecondRecord::from).collect();
        per_second.sort_by_key(|r| r.second);
        Self {
            session_start,
            session_end,
            per_second,
        }
    }

    /// `<start>-<end>.json` with ':' replaced so the name is portable.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}.json",
            iso_seconds::format(&self.session_start).replace(':', "-"),
            iso_seconds::format(&self.session_end).replace(':', "-"),
        )
    }
}

/// Writes `doc` into `dir`, creating the directory if needed, and returns the
/// new path. `previous` is removed once the new file is in place, unless it
/// is the same path.
///
/// On failure nothing under `dir` changes apart from the directory itself
/// possibly being created.
pub fn write_session(
    dir:      &Path,
    doc:      &SessionDocument,
    previous: Option<&Path>,
) -> Result<PathBuf, PersistError> {
    fs::create_dir_all(dir)?;

    let path = dir.join(doc.file_name());
    let payload = serde_json::to_vec_pretty(doc)?;
    write_atomic(&path, &payload)?;

    if let Some(prev) = previous {
        if prev != path.as_path() {
            // The new file is already durable; a stale leftover is harmless.
            let _ = fs::remove_file(prev);
        }
    }
    Ok(path)
}

/// Write to a temp file then rename over the target.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let temp_path = path.with_extension("json.tmp");

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

pub fn load_session(path: &Path) -> Result<SessionDocument, LoadError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// ISO-8601 timestamps at second precision, always UTC (`...Z`).
mod iso_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
