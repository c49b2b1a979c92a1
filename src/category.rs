use async_trait::async_trait;
use rusqlite::params;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::Get;
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;

#[derive(Id, Clone, Debug)]
pub struct Category {
    #[id]
    pub id: i64,
    pub name: String,
}

#[derive(Id, Clone, Debug)]
pub struct Subcategory {
    #[id]
    pub id: i64,
    pub category_id: i64,
    pub name: String,
}

#[async_trait]
pub trait CategoryRepository:
    Repository<Category, Error = anyhow::Error> + Get<Category> + Send + Sync
{
    /// Constraint-backed get-or-create; two concurrent runs cannot create the
    /// same name twice. Returns `true` when the row was inserted.
    async fn get_or_create(&self, name: &str) -> Result<(Category, bool), Self::Error>;
}

#[async_trait]
pub trait SubcategoryRepository:
    Repository<Subcategory, Error = anyhow::Error> + Get<Subcategory> + Send + Sync
{
    async fn get_or_create(
        &self,
        category_id: i64,
        name: &str,
    ) -> Result<(Subcategory, bool), Self::Error>;
}

pub struct SqliteCategoryRepository {
    conn: Connection,
}

impl SqliteCategoryRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS category (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

impl Repository<Category> for SqliteCategoryRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Category> for SqliteCategoryRepository {
    async fn get_one(&self, id: &IdentityOf<Category>) -> Result<Option<Category>, Self::Error> {
        let id = *id;
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, name FROM category WHERE id = ?1")?;
                let c = stmt
                    .query_map([id], |row| {
                        Ok(Category {
                            id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    })?
                    .next()
                    .transpose()?;
                Ok(c)
            })
            .await?)
    }
}

#[async_trait]
impl CategoryRepository for SqliteCategoryRepository {
    async fn get_or_create(&self, name: &str) -> Result<(Category, bool), Self::Error> {
        let name = name.trim().to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT INTO category (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
                    params![name],
                )?;
                let category = tx.query_row(
                    "SELECT id, name FROM category WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok(Category {
                            id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    },
                )?;
                tx.commit()?;
                Ok((category, inserted > 0))
            })
            .await?)
    }
}

pub struct SqliteSubcategoryRepository {
    conn: Connection,
}

impl SqliteSubcategoryRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS subcategory (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    category_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    UNIQUE(category_id, name)
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

impl Repository<Subcategory> for SqliteSubcategoryRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Subcategory> for SqliteSubcategoryRepository {
    async fn get_one(
        &self,
        id: &IdentityOf<Subcategory>,
    ) -> Result<Option<Subcategory>, Self::Error> {
        let id = *id;
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id, category_id, name FROM subcategory WHERE id = ?1")?;
                let s = stmt
                    .query_map([id], |row| {
                        Ok(Subcategory {
                            id: row.get(0)?,
                            category_id: row.get(1)?,
                            name: row.get(2)?,
                        })
                    })?
                    .next()
                    .transpose()?;
                Ok(s)
            })
            .await?)
    }
}

#[async_trait]
impl SubcategoryRepository for SqliteSubcategoryRepository {
    async fn get_or_create(
        &self,
        category_id: i64,
        name: &str,
    ) -> Result<(Subcategory, bool), Self::Error> {
        let name = name.trim().to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT INTO subcategory (category_id, name) VALUES (?1, ?2)
                     ON CONFLICT(category_id, name) DO NOTHING",
                    params![category_id, name],
                )?;
                let subcategory = tx.query_row(
                    "SELECT id, category_id, name FROM subcategory
                     WHERE category_id = ?1 AND name = ?2",
                    params![category_id, name],
                    |row| {
                        Ok(Subcategory {
                            id: row.get(0)?,
                            category_id: row.get(1)?,
                            name: row.get(2)?,
                        })
                    },
                )?;
                tx.commit()?;
                Ok((subcategory, inserted > 0))
            })
            .await?)
    }
}
