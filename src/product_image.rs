use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;

/// One stored image URL of a product. Rows are created and deleted only by
/// reconciliation against the product's current sheet row.
#[derive(Id, Clone, Debug)]
pub struct ProductImage {
    #[id]
    pub id: i64,
    pub product_id: i64,
    pub url: String,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait ProductImageRepository:
    Repository<ProductImage, Error = anyhow::Error> + Send + Sync
{
    async fn list_by_product(&self, product_id: i64) -> Result<Vec<ProductImage>, Self::Error>;
    /// Any product's image with this exact URL; the persistent half of the
    /// dedup cache.
    async fn get_by_url(&self, url: &str) -> Result<Option<ProductImage>, Self::Error>;
    /// Makes the stored URL set equal to `urls`, in one transaction.
    /// Returns (created, deleted).
    async fn reconcile(
        &self,
        product_id: i64,
        urls: &[String],
    ) -> Result<(usize, usize), Self::Error>;
    async fn count(&self) -> Result<usize, Self::Error>;
    async fn clear(&self) -> Result<usize, Self::Error>;
}

pub struct SqliteProductImageRepository {
    conn: Connection,
}

impl SqliteProductImageRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS product_image (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    product_id INTEGER NOT NULL,
                    url TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS product_image_url ON product_image (url)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_image(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProductImage> {
    Ok(ProductImage {
        id: row.get(0)?,
        product_id: row.get(1)?,
        url: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl Repository<ProductImage> for SqliteProductImageRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl ProductImageRepository for SqliteProductImageRepository {
    async fn list_by_product(&self, product_id: i64) -> Result<Vec<ProductImage>, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let images = {
                    let mut stmt = conn.prepare(
                        "SELECT id, product_id, url, created_at FROM product_image
                         WHERE product_id = ?1 ORDER BY id",
                    )?;
                    let images = stmt
                        .query_map([product_id], row_to_image)?
                        .collect::<Result<Vec<_>, _>>()?;
                    images
                };
                Ok(images)
            })
            .await?)
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<ProductImage>, Self::Error> {
        let url = url.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let image = conn
                    .query_row(
                        "SELECT id, product_id, url, created_at FROM product_image
                         WHERE url = ?1 LIMIT 1",
                        params![url],
                        row_to_image,
                    )
                    .optional()?;
                Ok(image)
            })
            .await?)
    }

    async fn reconcile(
        &self,
        product_id: i64,
        urls: &[String],
    ) -> Result<(usize, usize), Self::Error> {
        let urls = urls.to_vec();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Vec<(i64, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, url FROM product_image WHERE product_id = ?1 ORDER BY id",
                    )?;
                    let rows = stmt
                        .query_map([product_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                let now = OffsetDateTime::now_utc();
                let mut created = 0;
                for url in &urls {
                    if !existing.iter().any(|(_, u)| u == url) {
                        tx.execute(
                            "INSERT INTO product_image (product_id, url, created_at)
                             VALUES (?1, ?2, ?3)",
                            params![product_id, url, now],
                        )?;
                        created += 1;
                    }
                }
                let mut deleted = 0;
                for (id, url) in &existing {
                    if !urls.contains(url) {
                        tx.execute("DELETE FROM product_image WHERE id = ?1", params![id])?;
                        deleted += 1;
                    }
                }
                tx.commit()?;
                Ok((created, deleted))
            })
            .await?)
    }

    async fn count(&self) -> Result<usize, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let count =
                    conn.query_row("SELECT COUNT(*) FROM product_image", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?)
    }

    async fn clear(&self) -> Result<usize, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let deleted = conn.execute("DELETE FROM product_image", [])?;
                Ok(deleted)
            })
            .await?)
    }
}
