use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Table and column names the Postgres stores read and write.
///
/// Defaults match `migrations/`; a YAML file can remap them onto an existing schema.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaMapping {
    pub categories: CategoryTable,
    pub records: RecordTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryTable {
    pub table: String,
}

impl Default for CategoryTable {
    fn default() -> Self {
        Self {
            table: "island_categories".to_string(),
        }
    }
}

impl CategoryTable {
    pub const COLUMNS: [&'static str; 5] = ["id", "name_local", "name_en", "slug", "created_at"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordTable {
    pub table: String,
    pub id_column: String,
    pub legacy_local_column: String,
    pub legacy_en_column: String,
    pub category_ref_column: String,
}

impl Default for RecordTable {
    fn default() -> Self {
        Self {
            table: "islands".to_string(),
            id_column: "id".to_string(),
            legacy_local_column: "type_local".to_string(),
            legacy_en_column: "type_en".to_string(),
            category_ref_column: "category_id".to_string(),
        }
    }
}

impl RecordTable {
    pub fn columns(&self) -> [&str; 4] {
        [
            self.id_column.as_str(),
            self.legacy_local_column.as_str(),
            self.legacy_en_column.as_str(),
            self.category_ref_column.as_str(),
        ]
    }

    pub(crate) fn select_all_sql(&self) -> String {
        format!(
            "SELECT {id} AS record_id, {local} AS legacy_local, {en} AS legacy_en, {fk} AS category_ref \
             FROM {table} ORDER BY {id}",
            id = self.id_column,
            local = self.legacy_local_column,
            en = self.legacy_en_column,
            fk = self.category_ref_column,
            table = self.table,
        )
    }

    pub(crate) fn select_unresolved_sql(&self) -> String {
        format!(
            "SELECT {id} AS record_id, {local} AS legacy_local, {en} AS legacy_en, {fk} AS category_ref \
             FROM {table} \
             WHERE {fk} IS NULL \
               AND (NULLIF(btrim({local}), '') IS NOT NULL OR NULLIF(btrim({en}), '') IS NOT NULL) \
             ORDER BY {id}",
            id = self.id_column,
            local = self.legacy_local_column,
            en = self.legacy_en_column,
            fk = self.category_ref_column,
            table = self.table,
        )
    }

    /// Bulk update from two parallel uuid arrays. Only unset references are written.
    pub(crate) fn assign_sql(&self) -> String {
        format!(
            "UPDATE {table} AS r SET {fk} = v.category_id \
             FROM UNNEST($1::uuid[], $2::uuid[]) AS v(record_id, category_id) \
             WHERE r.{id} = v.record_id AND r.{fk} IS NULL",
            table = self.table,
            fk = self.category_ref_column,
            id = self.id_column,
        )
    }
}

impl SchemaMapping {
    /// Every name is interpolated into SQL, so each must be a plain identifier.
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_identifier(&self.categories.table)?;
        validate_identifier(&self.records.table)?;
        for column in self.records.columns() {
            validate_identifier(column)?;
        }
        Ok(())
    }
}

/// How Postgres stores an unquoted identifier in `information_schema`.
pub(crate) fn catalog_name(identifier: &str) -> String {
    identifier.to_ascii_lowercase()
}

pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("islands").is_ok());
        assert!(validate_identifier("_legacy_type2").is_ok());
        assert!(validate_identifier("2islands").is_err());
        assert!(validate_identifier("islands; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn mixed_case_identifiers_resolve_to_folded_catalog_names() {
        assert!(validate_identifier("Islands").is_ok());
        assert_eq!(catalog_name("Islands"), "islands");
        assert_eq!(catalog_name("Type_EN"), "type_en");
        assert_eq!(catalog_name("island_categories"), "island_categories");
    }

    #[test]
    fn default_mapping_is_valid() {
        let mapping = SchemaMapping::default();
        assert!(mapping.validate().is_ok());
        assert_eq!(mapping.records.columns(), ["id", "type_local", "type_en", "category_id"]);
    }

    #[test]
    fn invalid_column_fails_validation() {
        let mut mapping = SchemaMapping::default();
        mapping.records.legacy_en_column = "type en".into();
        assert!(matches!(mapping.validate(), Err(StoreError::InvalidIdentifier(name)) if name == "type en"));
    }

    #[test]
    fn unresolved_query_filters_blank_legacy_text() {
        let sql = RecordTable::default().select_unresolved_sql();
        assert!(sql.contains("WHERE category_id IS NULL"));
        assert!(sql.contains("NULLIF(btrim(type_local), '') IS NOT NULL"));
        assert!(sql.contains("FROM islands"));
    }

    #[test]
    fn assign_query_only_touches_unset_references() {
        let sql = RecordTable::default().assign_sql();
        assert!(sql.starts_with("UPDATE islands AS r SET category_id = v.category_id"));
        assert!(sql.ends_with("r.category_id IS NULL"));
    }
}
