use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{clean_legacy, derive_slug, Assignment, CanonicalCategory, SubjectRecord};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::schema::{catalog_name, CategoryTable, RecordTable, SchemaMapping};
use crate::{matches_identity, CanonicalStore, RecordSource, StoreError};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await.context("applying migrations")?;
    info!(count = MIGRATOR.iter().count(), "migrations applied");
    Ok(())
}

async fn verify_columns(pool: &PgPool, table: &str, columns: &[&str]) -> Result<(), StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT column_name::text AS column_name
          FROM information_schema.columns
         WHERE table_schema = current_schema()
           AND table_name = $1
        "#,
    )
    .bind(catalog_name(table))
    .fetch_all(pool)
    .await
    .map_err(|err| StoreError::Unavailable(err.to_string()))?;

    let present = rows
        .iter()
        .map(|row| row.try_get::<String, _>("column_name"))
        .collect::<Result<HashSet<_>, _>>()?;
    if present.is_empty() {
        return Err(StoreError::SchemaMissing(format!("table {table}")));
    }
    if let Some(missing) = columns.iter().find(|c| !present.contains(&catalog_name(c))) {
        return Err(StoreError::SchemaMissing(format!("column {table}.{missing}")));
    }
    debug!(table, "schema verified");
    Ok(())
}

/// Only the slug constraint means "another category already owns this slug".
fn unique_violation(constraint: Option<&str>, slug: String) -> StoreError {
    match constraint {
        Some(name) if name.ends_with("slug_key") => StoreError::DuplicateSlug { slug },
        Some(name) => StoreError::Rejected(format!("unique constraint `{name}` violated")),
        None => StoreError::Rejected("unique constraint violated".to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct PgCanonicalStore {
    pool: PgPool,
    table: CategoryTable,
}

impl PgCanonicalStore {
    pub fn new(pool: PgPool, mapping: &SchemaMapping) -> Result<Self, StoreError> {
        mapping.validate()?;
        Ok(Self {
            pool,
            table: mapping.categories.clone(),
        })
    }
}

fn category_from_row(row: &PgRow) -> Result<CanonicalCategory, sqlx::Error> {
    Ok(CanonicalCategory {
        id: row.try_get("id")?,
        name_local: row.try_get("name_local")?,
        name_en: row.try_get("name_en")?,
        slug: row.try_get("slug")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl CanonicalStore for PgCanonicalStore {
    async fn check_ready(&self) -> Result<(), StoreError> {
        verify_columns(&self.pool, &self.table.table, &CategoryTable::COLUMNS).await
    }

    async fn list_all(&self) -> Result<Vec<CanonicalCategory>, StoreError> {
        let sql = format!(
            "SELECT id, name_local, name_en, slug, created_at FROM {} ORDER BY created_at, id",
            self.table.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(category_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    /// Folded in Rust over the snapshot so the comparison does not depend on the
    /// database collation or on `btrim` whitespace rules.
    async fn exists_by_identity(&self, name_local: &str, name_en: &str) -> Result<bool, StoreError> {
        Ok(self
            .list_all()
            .await?
            .iter()
            .any(|c| matches_identity(c, name_local, name_en)))
    }

    async fn create(&self, name_local: &str, name_en: &str) -> Result<CanonicalCategory, StoreError> {
        let name_local = clean_legacy(Some(name_local)).unwrap_or_default();
        let name_en = clean_legacy(Some(name_en)).unwrap_or_default();
        let slug = derive_slug(&name_local, &name_en).ok_or_else(|| StoreError::EmptySlug {
            name_local: name_local.clone(),
            name_en: name_en.clone(),
        })?;

        let sql = format!(
            "INSERT INTO {} (id, name_local, name_en, slug) VALUES ($1, $2, $3, $4) \
             RETURNING id, name_local, name_en, slug, created_at",
            self.table.table
        );
        let result = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&name_local)
            .bind(&name_en)
            .bind(&slug)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => Ok(category_from_row(&row)?),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(unique_violation(db.constraint(), slug))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordSource {
    pool: PgPool,
    table: RecordTable,
}

impl PgRecordSource {
    pub fn new(pool: PgPool, mapping: &SchemaMapping) -> Result<Self, StoreError> {
        mapping.validate()?;
        Ok(Self {
            pool,
            table: mapping.records.clone(),
        })
    }

    async fn fetch(&self, sql: &str) -> Result<Vec<SubjectRecord>, StoreError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<SubjectRecord, sqlx::Error> {
                let local: Option<String> = row.try_get("legacy_local")?;
                let en: Option<String> = row.try_get("legacy_en")?;
                Ok(SubjectRecord::new(
                    row.try_get("record_id")?,
                    local.as_deref(),
                    en.as_deref(),
                    row.try_get("category_ref")?,
                ))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    async fn check_ready(&self) -> Result<(), StoreError> {
        verify_columns(&self.pool, &self.table.table, &self.table.columns()).await
    }

    async fn fetch_all(&self) -> Result<Vec<SubjectRecord>, StoreError> {
        self.fetch(&self.table.select_all_sql()).await
    }

    async fn fetch_unresolved(&self) -> Result<Vec<SubjectRecord>, StoreError> {
        let records = self.fetch(&self.table.select_unresolved_sql()).await?;
        Ok(records.into_iter().filter(SubjectRecord::is_eligible).collect())
    }

    async fn assign_batch(&self, batch: &[Assignment]) -> Result<u64, StoreError> {
        let record_ids = batch.iter().map(|a| a.record_id).collect::<Vec<_>>();
        let category_ids = batch.iter().map(|a| a.category_id).collect::<Vec<_>>();
        let expected = batch.len() as u64;

        let mut tx = self.pool.begin().await?;
        let applied = sqlx::query(&self.table.assign_sql())
            .bind(record_ids)
            .bind(category_ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if applied != expected {
            tx.rollback().await?;
            return Err(StoreError::PartialCommit { applied, expected });
        }
        tx.commit().await?;
        Ok(applied)
    }
}
