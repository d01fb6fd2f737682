//! Tiered legacy-text → canonical category matching.

use recon_core::{fold, CanonicalCategory, CategoryId, SubjectRecord};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    CaseInsensitive,
    Substring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Matched { category_id: CategoryId, tier: MatchTier },
    Unmatched,
}

impl Resolution {
    pub fn category_id(&self) -> Option<CategoryId> {
        match self {
            Self::Matched { category_id, .. } => Some(*category_id),
            Self::Unmatched => None,
        }
    }
}

/// Matches records against a fixed snapshot. Within a tier, snapshot order breaks ties.
pub struct MatchResolver<'a> {
    snapshot: &'a [CanonicalCategory],
    folded: Vec<(String, String)>,
}

impl<'a> MatchResolver<'a> {
    pub fn new(snapshot: &'a [CanonicalCategory]) -> Self {
        let folded = snapshot
            .iter()
            .map(|c| (fold(&c.name_local), fold(&c.name_en)))
            .collect();
        Self { snapshot, folded }
    }

    pub fn resolve(&self, record: &SubjectRecord) -> Resolution {
        let local = record.legacy_local.as_deref().unwrap_or_default();
        let en = record.legacy_en.as_deref().unwrap_or_default();
        if local.is_empty() && en.is_empty() {
            return Resolution::Unmatched;
        }

        let exact = self.first(|c, _| {
            (!local.is_empty() && c.name_local == local) || (!en.is_empty() && c.name_en == en)
        });
        if let Some(category_id) = exact {
            return Resolution::Matched { category_id, tier: MatchTier::Exact };
        }

        let local = fold(local);
        let en = fold(en);

        let case_insensitive = self.first(|_, (name_local, name_en)| {
            (!local.is_empty() && *name_local == local) || (!en.is_empty() && *name_en == en)
        });
        if let Some(category_id) = case_insensitive {
            return Resolution::Matched { category_id, tier: MatchTier::CaseInsensitive };
        }

        let substring = self.first(|_, (name_local, name_en)| {
            overlaps(name_en, &en) || overlaps(name_local, &local)
        });
        match substring {
            Some(category_id) => Resolution::Matched { category_id, tier: MatchTier::Substring },
            None => Resolution::Unmatched,
        }
    }

    fn first(&self, pred: impl Fn(&CanonicalCategory, &(String, String)) -> bool) -> Option<CategoryId> {
        self.snapshot
            .iter()
            .zip(&self.folded)
            .find(|(category, folded)| pred(category, folded))
            .map(|(category, _)| category.id)
    }
}

/// Containment in either direction between two non-empty folded strings.
fn overlaps(name: &str, legacy: &str) -> bool {
    !name.is_empty() && !legacy.is_empty() && (name.contains(legacy) || legacy.contains(name))
}
