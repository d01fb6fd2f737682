//! Offline legacy dataset loading + normalization of loosely-typed record shapes.
//!
//! Legacy exports name the same field several ways (`category`, `category_gr`,
//! `type_en`, ...). Everything is folded into [`SubjectRecord`] here so matching
//! code only ever sees one shape.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use recon_core::{
    clean_legacy, derive_slug, CanonicalCategory, NewCategory, SubjectRecord, LEGACY_NAMESPACE,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-ingest";

pub const ID_FIELDS: &[&str] = &["id", "record_id", "island_id"];
pub const LEGACY_LOCAL_FIELDS: &[&str] = &[
    "legacy_local",
    "category_local",
    "category_gr",
    "type_local",
    "category",
    "type",
];
pub const LEGACY_EN_FIELDS: &[&str] = &["legacy_en", "category_en", "type_en", "category_english"];
pub const CATEGORY_REF_FIELDS: &[&str] = &["category_ref", "category_id"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("record #{index}: no id field (tried {tried:?})")]
    MissingId { index: usize, tried: &'static [&'static str] },
    #[error("record #{index}: field `{field}` {reason}")]
    InvalidField {
        index: usize,
        field: String,
        reason: String,
    },
    #[error("category #{index}: {reason}")]
    InvalidCategory { index: usize, reason: String },
}

/// On-disk export shape. Records stay untyped until [`normalize_record`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetFile {
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub categories: Vec<RawCategory>,
    #[serde(default)]
    pub records: Vec<Map<String, JsonValue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCategory {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default, alias = "name_gr")]
    pub name_local: Option<String>,
    #[serde(default, alias = "name")]
    pub name_en: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Normalized dataset ready to seed the in-memory stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyDataset {
    pub exported_at: Option<DateTime<Utc>>,
    pub categories: Vec<CanonicalCategory>,
    pub records: Vec<SubjectRecord>,
}

pub fn load_dataset(path: impl AsRef<Path>) -> Result<LegacyDataset> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: DatasetFile =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    normalize_dataset(file).with_context(|| format!("normalizing {}", path.display()))
}

pub fn normalize_dataset(file: DatasetFile) -> Result<LegacyDataset, IngestError> {
    let fallback_created = file.exported_at.unwrap_or(DateTime::UNIX_EPOCH);
    let categories = file
        .categories
        .iter()
        .enumerate()
        .map(|(index, raw)| normalize_category(index, raw, fallback_created))
        .collect::<Result<Vec<_>, _>>()?;
    let records = file
        .records
        .iter()
        .enumerate()
        .map(|(index, raw)| normalize_record(index, raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LegacyDataset {
        exported_at: file.exported_at,
        categories,
        records,
    })
}

/// Writes the dataset in its normalized shape; the output loads back through [`load_dataset`].
pub fn write_dataset(path: impl AsRef<Path>, dataset: &LegacyDataset) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(dataset).context("serializing dataset")?;
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

pub fn normalize_category(
    index: usize,
    raw: &RawCategory,
    fallback_created: DateTime<Utc>,
) -> Result<CanonicalCategory, IngestError> {
    let pair = NewCategory::from_legacy(raw.name_local.as_deref(), raw.name_en.as_deref())
        .ok_or_else(|| IngestError::InvalidCategory {
            index,
            reason: "both names are empty".to_string(),
        })?;
    let slug = match raw.slug.as_deref().and_then(|s| clean_legacy(Some(s))) {
        Some(slug) => slug,
        None => derive_slug(&pair.name_local, &pair.name_en).ok_or_else(|| {
            IngestError::InvalidCategory {
                index,
                reason: "no slug derivable from names".to_string(),
            }
        })?,
    };
    Ok(CanonicalCategory {
        id: raw.id.unwrap_or_else(|| pair.preview_id()),
        name_local: pair.name_local,
        name_en: pair.name_en,
        slug,
        created_at: raw.created_at.unwrap_or(fallback_created),
    })
}

pub fn normalize_record(index: usize, raw: &Map<String, JsonValue>) -> Result<SubjectRecord, IngestError> {
    let id = record_id(index, raw)?;
    let legacy_local = first_text(index, raw, LEGACY_LOCAL_FIELDS)?;
    let legacy_en = first_text(index, raw, LEGACY_EN_FIELDS)?;
    let category_ref = category_ref(index, raw)?;
    Ok(SubjectRecord::new(
        id,
        legacy_local.as_deref(),
        legacy_en.as_deref(),
        category_ref,
    ))
}

/// Stable id for legacy keys that are not already UUIDs.
pub fn deterministic_record_id(legacy_key: &str) -> Uuid {
    Uuid::new_v5(&LEGACY_NAMESPACE, format!("record:{legacy_key}").as_bytes())
}

fn record_id(index: usize, raw: &Map<String, JsonValue>) -> Result<Uuid, IngestError> {
    let (field, value) = ID_FIELDS
        .iter()
        .find_map(|field| raw.get(*field).filter(|v| !v.is_null()).map(|v| (*field, v)))
        .ok_or(IngestError::MissingId {
            index,
            tried: ID_FIELDS,
        })?;
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Ok(Uuid::parse_str(s.trim())
            .unwrap_or_else(|_| deterministic_record_id(s.trim()))),
        JsonValue::Number(n) => Ok(deterministic_record_id(&n.to_string())),
        other => Err(invalid(index, field, format!("is not a usable id: {other}"))),
    }
}

fn first_text(
    index: usize,
    raw: &Map<String, JsonValue>,
    variants: &[&str],
) -> Result<Option<String>, IngestError> {
    for field in variants {
        let text = match raw.get(*field) {
            None | Some(JsonValue::Null) => continue,
            Some(JsonValue::String(s)) => clean_legacy(Some(s)),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            Some(other) => {
                return Err(invalid(index, field, format!("is not text: {other}")));
            }
        };
        if text.is_some() {
            return Ok(text);
        }
    }
    Ok(None)
}

fn category_ref(index: usize, raw: &Map<String, JsonValue>) -> Result<Option<Uuid>, IngestError> {
    for field in CATEGORY_REF_FIELDS {
        match raw.get(*field) {
            None | Some(JsonValue::Null) => continue,
            Some(JsonValue::String(s)) if s.trim().is_empty() => continue,
            Some(JsonValue::String(s)) => {
                return Uuid::parse_str(s.trim())
                    .map(Some)
                    .map_err(|err| invalid(index, field, err.to_string()));
            }
            Some(other) => {
                return Err(invalid(index, field, format!("is not a uuid: {other}")));
            }
        }
    }
    Ok(None)
}

fn invalid(index: usize, field: &str, reason: String) -> IngestError {
    IngestError::InvalidField {
        index,
        field: field.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn field_variants_normalize_to_one_shape() {
        let a = normalize_record(0, &obj(json!({"id": "a1", "category": "Κατοικημένο", "type_en": "Inhabited"}))).unwrap();
        let b = normalize_record(1, &obj(json!({"island_id": 7, "category_gr": " Κατοικημένο ", "category_english": "Inhabited"}))).unwrap();

        assert_eq!(a.legacy_local.as_deref(), Some("Κατοικημένο"));
        assert_eq!(a.legacy_en.as_deref(), Some("Inhabited"));
        assert_eq!(b.legacy_local, a.legacy_local);
        assert_eq!(b.legacy_en, a.legacy_en);
        assert_eq!(a.id, deterministic_record_id("a1"));
        assert_eq!(b.id, deterministic_record_id("7"));
    }

    #[test]
    fn blank_variant_falls_through_to_next() {
        let r = normalize_record(0, &obj(json!({"id": "x", "legacy_en": "  ", "category_en": "Resort"}))).unwrap();
        assert_eq!(r.legacy_en.as_deref(), Some("Resort"));
        assert_eq!(r.legacy_local, None);
    }

    #[test]
    fn uuid_ids_and_refs_are_kept() {
        let id = Uuid::new_v4();
        let category = Uuid::new_v4();
        let r = normalize_record(
            0,
            &obj(json!({"record_id": id.to_string(), "type": "Βράχος", "category_id": category.to_string()})),
        )
        .unwrap();
        assert_eq!(r.id, id);
        assert_eq!(r.category_ref, Some(category));
        assert!(!r.is_eligible());
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert!(matches!(
            normalize_record(3, &obj(json!({"type": "Resort"}))),
            Err(IngestError::MissingId { index: 3, .. })
        ));
        assert!(matches!(
            normalize_record(0, &obj(json!({"id": "x", "type_en": ["a"]}))),
            Err(IngestError::InvalidField { field, .. }) if field == "type_en"
        ));
        assert!(matches!(
            normalize_record(0, &obj(json!({"id": "x", "category_ref": "not-a-uuid"}))),
            Err(IngestError::InvalidField { field, .. }) if field == "category_ref"
        ));
    }

    #[test]
    fn categories_get_derived_slug_and_stable_id() {
        let raw = RawCategory {
            id: None,
            name_local: Some("Θέρετρο".into()),
            name_en: Some("Tourist Resort".into()),
            slug: None,
            created_at: None,
        };
        let first = normalize_category(0, &raw, DateTime::UNIX_EPOCH).unwrap();
        let second = normalize_category(0, &raw, DateTime::UNIX_EPOCH).unwrap();
        assert_eq!(first.slug, "tourist-resort");
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn written_dataset_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/dataset.json");
        let dataset = LegacyDataset {
            exported_at: None,
            categories: vec![],
            records: vec![SubjectRecord::new(Uuid::new_v4(), Some("Βράχος"), None, None)],
        };
        write_dataset(&path, &dataset).unwrap();
        assert_eq!(load_dataset(&path).unwrap(), dataset);
    }
}
