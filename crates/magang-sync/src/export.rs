//! Parquet export of an accumulated dataset, with a sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use magang_core::{Listing, RegionKey};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const LISTINGS_FILE: &str = "listings.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub region: Option<RegionKey>,
    pub rows: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `listings` to `<out_dir>/listings.parquet` and a manifest beside it.
/// Returns the manifest path.
pub fn export_parquet(
    listings: &[Listing],
    region: Option<&RegionKey>,
    out_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let listings_path = out_dir.join(LISTINGS_FILE);
    write_listings_parquet(&listings_path, listings)?;

    let manifest = ExportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        region: region.cloned(),
        rows: listings.len(),
        files: vec![manifest_entry("listings", out_dir, &listings_path)?],
    };

    let manifest_path = out_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8<'a>(listings: &'a [Listing], f: impl Fn(&'a Listing) -> &'a str) -> StringArray {
    StringArray::from(listings.iter().map(|l| Some(f(l))).collect::<Vec<_>>())
}

fn optional_utf8<'a>(
    listings: &'a [Listing],
    f: impl Fn(&'a Listing) -> Option<&'a str>,
) -> StringArray {
    StringArray::from(listings.iter().map(f).collect::<Vec<_>>())
}

fn write_listings_parquet(path: &Path, listings: &[Listing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("province", DataType::Utf8, false),
        ArrowField::new("program_studies", DataType::Utf8, false),
        ArrowField::new("education_levels", DataType::Utf8, false),
        ArrowField::new("quota", DataType::UInt32, false),
        ArrowField::new("registered", DataType::UInt32, false),
        ArrowField::new("starts_on", DataType::Utf8, true),
        ArrowField::new("ends_on", DataType::Utf8, true),
        ArrowField::new("registration_deadline", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, true),
    ]));

    let programs = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.program_studies().join("; ")))
            .collect::<Vec<_>>(),
    );
    let levels = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.education_levels().join(", ")))
            .collect::<Vec<_>>(),
    );
    let quotas = UInt32Array::from(listings.iter().map(|l| l.quota).collect::<Vec<_>>());
    let registered = UInt32Array::from(listings.iter().map(|l| l.registered).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8(listings, |l| l.id.as_str())),
            Arc::new(utf8(listings, |l| l.title.as_str())),
            Arc::new(utf8(listings, |l| l.employer.name.as_str())),
            Arc::new(utf8(listings, |l| l.employer.city.as_str())),
            Arc::new(utf8(listings, |l| l.employer.province.as_str())),
            Arc::new(programs),
            Arc::new(levels),
            Arc::new(quotas),
            Arc::new(registered),
            Arc::new(optional_utf8(listings, |l| l.schedule.starts_on.as_deref())),
            Arc::new(optional_utf8(listings, |l| l.schedule.ends_on.as_deref())),
            Arc::new(optional_utf8(listings, |l| {
                l.schedule.registration_deadline.as_deref()
            })),
            Arc::new(optional_utf8(listings, |l| {
                l.status.as_ref().map(|s| s.name.as_str())
            })),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
