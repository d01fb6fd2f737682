//! Core domain model for the category reconciliation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-core";

/// Namespace for deterministic ids derived from legacy text (preview ids, ingest ids).
pub const LEGACY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_8e55_1b2c_3d4e_5f60);

pub type CategoryId = Uuid;
pub type RecordId = Uuid;

/// Authoritative category a legacy value resolves to. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalCategory {
    pub id: CategoryId,
    pub name_local: String,
    pub name_en: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

impl CanonicalCategory {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.name_local, &self.name_en)
    }
}

/// Case-folded `(name_local, name_en)` pair used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub local: String,
    pub en: String,
}

impl IdentityKey {
    pub fn new(name_local: &str, name_en: &str) -> Self {
        Self {
            local: fold(name_local),
            en: fold(name_en),
        }
    }
}

/// A legacy `(local, en)` pair proposed for creation as a canonical category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCategory {
    pub name_local: String,
    pub name_en: String,
}

impl NewCategory {
    /// Returns `None` when both sides are empty after cleaning.
    pub fn from_legacy(local: Option<&str>, en: Option<&str>) -> Option<Self> {
        let name_local = clean_legacy(local);
        let name_en = clean_legacy(en);
        if name_local.is_none() && name_en.is_none() {
            return None;
        }
        Some(Self {
            name_local: name_local.unwrap_or_default(),
            name_en: name_en.unwrap_or_default(),
        })
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.name_local, &self.name_en)
    }

    pub fn slug(&self) -> Option<String> {
        derive_slug(&self.name_local, &self.name_en)
    }

    /// Deterministic id for a category that has been planned but not created.
    pub fn preview_id(&self) -> CategoryId {
        let key = self.identity();
        Uuid::new_v5(
            &LEGACY_NAMESPACE,
            format!("category:{}\u{1f}{}", key.local, key.en).as_bytes(),
        )
    }

    /// Materializes the pair as an uncommitted category, used for dry-run snapshots.
    pub fn preview(&self, created_at: DateTime<Utc>) -> Option<CanonicalCategory> {
        Some(CanonicalCategory {
            id: self.preview_id(),
            name_local: self.name_local.clone(),
            name_en: self.name_en.clone(),
            slug: self.slug()?,
            created_at,
        })
    }
}

/// A record carrying legacy free-text category data and an optional resolved reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub id: RecordId,
    pub legacy_local: Option<String>,
    pub legacy_en: Option<String>,
    pub category_ref: Option<CategoryId>,
}

impl SubjectRecord {
    pub fn new(
        id: RecordId,
        legacy_local: Option<&str>,
        legacy_en: Option<&str>,
        category_ref: Option<CategoryId>,
    ) -> Self {
        Self {
            id,
            legacy_local: clean_legacy(legacy_local),
            legacy_en: clean_legacy(legacy_en),
            category_ref,
        }
    }

    pub fn has_legacy(&self) -> bool {
        self.legacy_local.is_some() || self.legacy_en.is_some()
    }

    /// Unresolved and carrying at least one legacy value.
    pub fn is_eligible(&self) -> bool {
        self.category_ref.is_none() && self.has_legacy()
    }

    pub fn legacy_pair(&self) -> Option<NewCategory> {
        NewCategory::from_legacy(self.legacy_local.as_deref(), self.legacy_en.as_deref())
    }
}

/// One foreign-key write: `record_id.category_ref := category_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub record_id: RecordId,
    pub category_id: CategoryId,
}

/// Trims legacy text; whitespace-only values become `None`.
pub fn clean_legacy(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Unicode-aware case folding used by every case-insensitive comparison.
pub fn fold(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Lowercases, collapses runs of non-alphanumerics into one hyphen, trims hyphens.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_hyphen = false;
    for ch in input.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch);
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Slug from `name_en`, falling back to `name_local` when the English name has no alphanumerics.
pub fn derive_slug(name_local: &str, name_en: &str) -> Option<String> {
    let from_en = slugify(name_en);
    if !from_en.is_empty() {
        return Some(from_en);
    }
    let from_local = slugify(name_local);
    (!from_local.is_empty()).then_some(from_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("Tourist Resort Island"), "tourist-resort-island");
        assert_eq!(slugify("  --Small / Rocky__Islet!! "), "small-rocky-islet");
        assert_eq!(slugify("Inhabited"), "inhabited");
        assert_eq!(slugify("???"), "");
    }

    #[test]
    fn slugify_keeps_non_ascii_letters() {
        assert_eq!(slugify("Κατοικημένο Νησί"), "κατοικημένο-νησί");
    }

    #[test]
    fn derive_slug_falls_back_to_local_name() {
        assert_eq!(derive_slug("Βραχονησίδα", "").as_deref(), Some("βραχονησίδα"));
        assert_eq!(derive_slug("Βραχονησίδα", "Rock").as_deref(), Some("rock"));
        assert_eq!(derive_slug(" ", "--"), None);
    }

    #[test]
    fn legacy_values_are_cleaned_at_construction() {
        let record = SubjectRecord::new(Uuid::new_v4(), Some("  "), Some(" Resort "), None);
        assert_eq!(record.legacy_local, None);
        assert_eq!(record.legacy_en.as_deref(), Some("Resort"));
        assert!(record.is_eligible());

        let empty = SubjectRecord::new(Uuid::new_v4(), None, Some("\t"), None);
        assert!(!empty.is_eligible());

        let resolved = SubjectRecord::new(Uuid::new_v4(), Some("x"), None, Some(Uuid::new_v4()));
        assert!(!resolved.is_eligible());
    }

    #[test]
    fn identity_is_case_insensitive() {
        let a = NewCategory::from_legacy(Some("A"), Some("Alpha")).unwrap();
        let b = NewCategory::from_legacy(Some("a"), Some("alpha ")).unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.preview_id(), b.preview_id());
    }

    #[test]
    fn preview_requires_a_slug() {
        let pair = NewCategory::from_legacy(Some("#"), None).unwrap();
        assert!(pair.preview(Utc::now()).is_none());
        assert!(NewCategory::from_legacy(None, Some(" ")).is_none());
    }
}
