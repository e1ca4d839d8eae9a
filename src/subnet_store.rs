use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::subnets::ListKind;

#[derive(Error, Debug)]
pub enum SubnetStoreError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("cidr is empty")]
    EmptyCidr,
}

/// Durable storage for the allow/deny CIDR lists. Uniqueness is on
/// `(cidr, list kind)`; `add` and `remove` are idempotent.
#[async_trait]
pub trait SubnetStore: Send + Sync {
    async fn list(&self, kind: ListKind) -> Result<Vec<String>, SubnetStoreError>;
    async fn replace(&self, kind: ListKind, cidrs: &[String]) -> Result<(), SubnetStoreError>;
    async fn clear(&self, kind: ListKind) -> Result<(), SubnetStoreError>;
    async fn add(&self, kind: ListKind, cidr: &str) -> Result<(), SubnetStoreError>;
    async fn remove(&self, kind: ListKind, cidr: &str) -> Result<(), SubnetStoreError>;
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SubnetRow {
    cidr: String,
}

/// Postgres-backed subnet list storage.
pub struct PgSubnetStore {
    db_pool: Arc<sqlx::PgPool>,
}

impl PgSubnetStore {
    pub fn new(db_pool: Arc<sqlx::PgPool>) -> PgSubnetStore {
        PgSubnetStore { db_pool }
    }
}

#[async_trait]
impl SubnetStore for PgSubnetStore {
    async fn list(&self, kind: ListKind) -> Result<Vec<String>, SubnetStoreError> {
        let list_query = r#"
            SELECT "cidr"
            FROM subnets
            WHERE "list_kind" = $1
        "#;

        let rows: Vec<SubnetRow> = sqlx::query_as(list_query)
            .bind(kind.as_str())
            .fetch_all(self.db_pool.as_ref())
            .await?;

        Ok(rows.into_iter().map(|row| row.cidr).collect())
    }

    async fn replace(&self, kind: ListKind, cidrs: &[String]) -> Result<(), SubnetStoreError> {
        if cidrs.iter().any(|cidr| cidr.is_empty()) {
            return Err(SubnetStoreError::EmptyCidr);
        }

        let mut transaction = self.db_pool.begin().await?;

        let clear_query = r#"
            DELETE FROM subnets
            WHERE "list_kind" = $1
        "#;
        sqlx::query(clear_query)
            .bind(kind.as_str())
            .execute(&mut transaction)
            .await?;

        let insert_query = r#"
            INSERT INTO subnets("cidr", "list_kind")
            VALUES ($1, $2)
            ON CONFLICT ("cidr", "list_kind") DO NOTHING
        "#;
        for cidr in cidrs {
            sqlx::query(insert_query)
                .bind(cidr)
                .bind(kind.as_str())
                .execute(&mut transaction)
                .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn clear(&self, kind: ListKind) -> Result<(), SubnetStoreError> {
        let clear_query = r#"
            DELETE FROM subnets
            WHERE "list_kind" = $1
        "#;

        // The number of deleted rows is not interesting here.
        sqlx::query(clear_query)
            .bind(kind.as_str())
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }

    async fn add(&self, kind: ListKind, cidr: &str) -> Result<(), SubnetStoreError> {
        if cidr.is_empty() {
            return Err(SubnetStoreError::EmptyCidr);
        }

        let insert_query = r#"
            INSERT INTO subnets("cidr", "list_kind")
            VALUES ($1, $2)
            ON CONFLICT ("cidr", "list_kind") DO NOTHING
        "#;

        // A conflicting row means the entry is already present, which counts
        // as success.
        sqlx::query(insert_query)
            .bind(cidr)
            .bind(kind.as_str())
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }

    async fn remove(&self, kind: ListKind, cidr: &str) -> Result<(), SubnetStoreError> {
        if cidr.is_empty() {
            return Err(SubnetStoreError::EmptyCidr);
        }

        let delete_query = r#"
            DELETE FROM subnets
            WHERE "cidr" = $1 AND "list_kind" = $2
        "#;

        sqlx::query(delete_query)
            .bind(cidr)
            .bind(kind.as_str())
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }
}

/// In-memory subnet list storage for local workmode and tests.
#[derive(Debug, Default)]
pub struct MemSubnetStore {
    entries: Mutex<HashSet<(String, &'static str)>>,
}

impl MemSubnetStore {
    pub fn new() -> MemSubnetStore {
        MemSubnetStore::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<(String, &'static str)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SubnetStore for MemSubnetStore {
    async fn list(&self, kind: ListKind) -> Result<Vec<String>, SubnetStoreError> {
        let entries = self.lock();
        Ok(entries
            .iter()
            .filter(|(_, entry_kind)| *entry_kind == kind.as_str())
            .map(|(cidr, _)| cidr.clone())
            .collect())
    }

    async fn replace(&self, kind: ListKind, cidrs: &[String]) -> Result<(), SubnetStoreError> {
        if cidrs.iter().any(|cidr| cidr.is_empty()) {
            return Err(SubnetStoreError::EmptyCidr);
        }

        let mut entries = self.lock();
        entries.retain(|(_, entry_kind)| *entry_kind != kind.as_str());
        for cidr in cidrs {
            entries.insert((cidr.clone(), kind.as_str()));
        }
        Ok(())
    }

    async fn clear(&self, kind: ListKind) -> Result<(), SubnetStoreError> {
        self.lock()
            .retain(|(_, entry_kind)| *entry_kind != kind.as_str());
        Ok(())
    }

    async fn add(&self, kind: ListKind, cidr: &str) -> Result<(), SubnetStoreError> {
        if cidr.is_empty() {
            return Err(SubnetStoreError::EmptyCidr);
        }
        self.lock().insert((cidr.to_owned(), kind.as_str()));
        Ok(())
    }

    async fn remove(&self, kind: ListKind, cidr: &str) -> Result<(), SubnetStoreError> {
        if cidr.is_empty() {
            return Err(SubnetStoreError::EmptyCidr);
        }
        self.lock().remove(&(cidr.to_owned(), kind.as_str()));
        Ok(())
    }
}
