//! Core domain model for internship listings, region partitioning and snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub mod filter;
pub mod region;
pub mod session;

pub use filter::{
    apply_filters, derive_facets, paginate, reconcile_city, reconcile_criteria, Facets,
    FilterCriteria, PageSlice, LISTINGS_PER_PAGE,
};
pub use region::{region_name, REGIONS};
pub use session::{CriteriaChange, ViewSession};

pub const CRATE_NAME: &str = "magang-core";

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Short administrative region code partitioning remote queries and local snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionKey(String);

impl RegionKey {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Province name from the static region table, if the code is known.
    pub fn display_name(&self) -> Option<&'static str> {
        region_name(&self.0)
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RegionKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employer {
    #[serde(rename = "nama_perusahaan", default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "alamat", default, deserialize_with = "null_as_default")]
    pub address: String,
    #[serde(rename = "nama_kabupaten", default, deserialize_with = "null_as_default")]
    pub city: String,
    #[serde(rename = "nama_provinsi", default, deserialize_with = "null_as_default")]
    pub province: String,
    #[serde(rename = "logo", default)]
    pub logo: Option<String>,
}

/// Raw schedule dates as served by the listing API (`YYYY-MM-DD` prefixed strings).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "tanggal_mulai", default)]
    pub starts_on: Option<String>,
    #[serde(rename = "tanggal_selesai", default)]
    pub ends_on: Option<String>,
    #[serde(rename = "tanggal_batas_pendaftaran", default)]
    pub registration_deadline: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionStatus {
    #[serde(rename = "nama_status_posisi", default, deserialize_with = "null_as_default")]
    pub name: String,
}

/// One internship posting. Immutable once fetched and identified by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(rename = "id_posisi")]
    pub id: String,
    #[serde(rename = "posisi", default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(rename = "deskripsi_posisi", default, deserialize_with = "null_as_default")]
    pub description: String,
    /// Serialized JSON list of program-of-study objects; see [`parse_tag_list`].
    #[serde(rename = "program_studi", default, deserialize_with = "null_as_default")]
    pub program_studies_raw: String,
    /// Serialized JSON list of education-level strings; see [`parse_tag_list`].
    #[serde(rename = "jenjang", default, deserialize_with = "null_as_default")]
    pub education_levels_raw: String,
    #[serde(rename = "jumlah_kuota", default, deserialize_with = "null_as_default")]
    pub quota: u32,
    #[serde(rename = "jumlah_terdaftar", default, deserialize_with = "null_as_default")]
    pub registered: u32,
    #[serde(rename = "perusahaan", default, deserialize_with = "null_as_default")]
    pub employer: Employer,
    #[serde(rename = "jadwal", default, deserialize_with = "null_as_default")]
    pub schedule: Schedule,
    #[serde(rename = "ref_status_posisi", default)]
    pub status: Option<PositionStatus>,
}

impl Listing {
    pub fn program_studies(&self) -> Vec<String> {
        parse_tag_list(&self.program_studies_raw)
    }

    pub fn education_levels(&self) -> Vec<String> {
        parse_tag_list(&self.education_levels_raw)
    }
}

/// Parse a serialized tag list. Never fails: malformed input yields an empty list.
///
/// String elements are taken as-is; object elements contribute their `title`
/// (falling back to `value`, then `name`). Blank entries are dropped.
pub fn parse_tag_list(raw: &str) -> Vec<String> {
    let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(raw) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) => ["title", "value", "name"]
                .iter()
                .find_map(|key| map.get(*key).and_then(|v| v.as_str())),
            _ => None,
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Complete point-in-time listing collection for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub region: RegionKey,
    pub listings: Vec<Listing>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub captured_at: DateTime<Utc>,
    pub total_pages: u32,
}
