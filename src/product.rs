use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Get, List};
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;

/// A catalog product. `code` is the business key; `kit_parent_code` links a
/// kit item to its parent by plain string equality, without a foreign key:
/// the parent row may not exist yet while the file is being processed.
#[derive(Id, Clone, Debug)]
pub struct Product {
    #[id]
    pub code: String,
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub category_id: i64,
    pub subcategory_id: Option<i64>,
    pub unit_price: Decimal,
    pub quantity: i64,
    pub kit_parent_code: Option<String>,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Input for an upsert; everything the sheet can say about a product.
#[derive(Clone, Debug)]
pub struct ProductDraft {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub category_id: i64,
    pub subcategory_id: Option<i64>,
    pub unit_price: Decimal,
    pub quantity: i64,
    pub kit_parent_code: Option<String>,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl ProductDraft {
    /// Field-level comparison for the update counters; `name` is kept as-is
    /// on update and `description` only overwrites when the sheet provides
    /// one, so neither participates here.
    fn differs_from(&self, existing: &Product) -> bool {
        self.category_id != existing.category_id
            || self.subcategory_id != existing.subcategory_id
            || self.unit_price != existing.unit_price
            || self.quantity != existing.quantity
            || self.kit_parent_code != existing.kit_parent_code
            || self.active != existing.active
            || self
                .description
                .as_ref()
                .is_some_and(|d| existing.description.as_deref() != Some(d))
    }
}

/// Synthesized business key for rows that arrive without one.
pub fn synthesize_code(name: &str) -> String {
    let prefix: String = name
        .trim()
        .chars()
        .take(20)
        .collect::<String>()
        .to_uppercase()
        .replace(' ', "-");
    format!("PROD-{prefix}")
}

#[async_trait]
pub trait ProductRepository:
    Repository<Product, Error = anyhow::Error> + Get<Product> + List<Product> + Send + Sync
{
    /// Single-transaction upsert keyed by the unique `code` column.
    async fn upsert(&self, draft: ProductDraft) -> Result<(Product, UpsertOutcome), Self::Error>;
    /// First free code of the form `base`, `base-1`, `base-2`, …
    async fn next_code(&self, base: &str) -> Result<String, Self::Error>;
    async fn clear(&self) -> Result<usize, Self::Error>;
}

pub struct SqliteProductRepository {
    conn: Connection,
}

impl SqliteProductRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let _ = conn.pragma_update(None, "journal_mode", "WAL");
            let _ = conn.pragma_update(None, "synchronous", "NORMAL");
            let _ = conn.pragma_update(None, "busy_timeout", 5000i64);
            conn.execute(
                "CREATE TABLE IF NOT EXISTS product (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    code TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    description TEXT,
                    category_id INTEGER NOT NULL,
                    subcategory_id INTEGER,
                    unit_price TEXT NOT NULL,
                    quantity INTEGER NOT NULL,
                    kit_parent_code TEXT,
                    active INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

const PRODUCT_COLUMNS: &str = "id, code, name, description, category_id, subcategory_id, \
     unit_price, quantity, kit_parent_code, active, created_at, updated_at";

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    let price: String = row.get(6)?;
    let unit_price = price
        .parse::<Decimal>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, err.into()))?;
    Ok(Product {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        category_id: row.get(4)?,
        subcategory_id: row.get(5)?,
        unit_price,
        quantity: row.get(7)?,
        kit_parent_code: row.get(8)?,
        active: row.get::<_, i64>(9)? != 0,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl Repository<Product> for SqliteProductRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Product> for SqliteProductRepository {
    async fn get_one(&self, code: &IdentityOf<Product>) -> Result<Option<Product>, Self::Error> {
        let code = code.clone();
        Ok(self
            .conn
            .call(move |conn| {
                let p = conn
                    .query_row(
                        &format!("SELECT {PRODUCT_COLUMNS} FROM product WHERE code = ?1"),
                        params![code],
                        row_to_product,
                    )
                    .optional()?;
                Ok(p)
            })
            .await?)
    }
}

#[async_trait]
impl List<Product> for SqliteProductRepository {
    async fn list(&self) -> Result<Vec<Product>, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let p = {
                    let mut stmt = conn
                        .prepare(&format!("SELECT {PRODUCT_COLUMNS} FROM product ORDER BY id"))?;
                    let p = stmt
                        .query_map([], row_to_product)?
                        .collect::<Result<Vec<_>, _>>()?;
                    p
                };
                Ok(p)
            })
            .await?)
    }
}

#[async_trait]
impl ProductRepository for SqliteProductRepository {
    async fn upsert(&self, draft: ProductDraft) -> Result<(Product, UpsertOutcome), Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing = tx
                    .query_row(
                        &format!("SELECT {PRODUCT_COLUMNS} FROM product WHERE code = ?1"),
                        params![draft.code],
                        row_to_product,
                    )
                    .optional()?;
                if let Some(existing) = existing.as_ref() {
                    if !draft.differs_from(existing) {
                        tx.commit()?;
                        return Ok((existing.clone(), UpsertOutcome::Unchanged));
                    }
                }
                let now = OffsetDateTime::now_utc();
                // On update the stored name wins and a missing description
                // keeps its old value.
                let (name, description, created_at) = match existing.as_ref() {
                    Some(e) => (
                        e.name.clone(),
                        draft.description.clone().or_else(|| e.description.clone()),
                        e.created_at,
                    ),
                    None => (draft.name.clone(), draft.description.clone(), now),
                };
                tx.execute(
                    "INSERT INTO product (code, name, description, category_id, subcategory_id,
                        unit_price, quantity, kit_parent_code, active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(code) DO UPDATE SET
                        name=excluded.name,
                        description=excluded.description,
                        category_id=excluded.category_id,
                        subcategory_id=excluded.subcategory_id,
                        unit_price=excluded.unit_price,
                        quantity=excluded.quantity,
                        kit_parent_code=excluded.kit_parent_code,
                        active=excluded.active,
                        updated_at=excluded.updated_at",
                    params![
                        draft.code,
                        name,
                        description,
                        draft.category_id,
                        draft.subcategory_id,
                        draft.unit_price.to_string(),
                        draft.quantity,
                        draft.kit_parent_code,
                        draft.active as i64,
                        created_at,
                        now,
                    ],
                )?;
                let stored = tx.query_row(
                    &format!("SELECT {PRODUCT_COLUMNS} FROM product WHERE code = ?1"),
                    params![draft.code],
                    row_to_product,
                )?;
                tx.commit()?;
                let outcome = if existing.is_some() {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Created
                };
                Ok((stored, outcome))
            })
            .await?)
    }

    async fn next_code(&self, base: &str) -> Result<String, Self::Error> {
        let base = base.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let exists = |conn: &rusqlite::Connection, code: &str| -> rusqlite::Result<bool> {
                    conn.query_row(
                        "SELECT EXISTS(SELECT 1 FROM product WHERE code = ?1)",
                        params![code],
                        |row| row.get(0),
                    )
                };
                if !exists(conn, &base)? {
                    return Ok(base);
                }
                let mut counter = 1usize;
                loop {
                    let candidate = format!("{base}-{counter}");
                    if !exists(conn, &candidate)? {
                        return Ok(candidate);
                    }
                    counter += 1;
                }
            })
            .await?)
    }

    async fn clear(&self) -> Result<usize, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let deleted = conn.execute("DELETE FROM product", [])?;
                Ok(deleted)
            })
            .await?)
    }
}
