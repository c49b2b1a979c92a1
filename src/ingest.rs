use crate::category::{CategoryRepository, SubcategoryRepository};
use crate::dedup::{shared_object_path, CacheDecision, DedupCache};
use crate::export;
use crate::fetch::ImageFetch;
use crate::job::RunOutput;
use crate::link::{self, ResolvedLink};
use crate::product::{synthesize_code, Product, ProductDraft, ProductRepository, UpsertOutcome};
use crate::product_image::ProductImageRepository;
use crate::sheet::{self, CatalogRecord, CategoryRef, Layout, SheetError, SheetFormat, Table};
use crate::storage::StorageGateway;
use bytes::Bytes;
use derive_more::{Display, Error};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use typesafe_repository::async_ops::Get;

/// Object-store folder holding the content-addressed images.
pub const SHARED_IMAGE_FOLDER: &str = "shared";

#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub file_path: String,
    pub format: SheetFormat,
    pub wipe_before_load: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Row,
    Image,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WipeSummary {
    pub products_deleted: usize,
    pub images_deleted: usize,
    pub objects_deleted: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub rows_total: usize,
    pub categories_created: usize,
    pub subcategories_created: usize,
    pub products_created: usize,
    pub products_updated: usize,
    pub images_created: usize,
    pub images_deleted: usize,
    pub errors: Vec<RunError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wipe: Option<WipeSummary>,
}

#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub output: RunOutput,
}

/// Only the conditions that make continuing meaningless; everything at row
/// or image granularity lands in the summary's error list instead.
#[derive(Debug, Display, Error)]
pub enum IngestError {
    #[display("{_0}")]
    Sheet(SheetError),
    #[display("no valid product rows found")]
    NoRows,
    #[display("catalog store error: {_0}")]
    #[error(ignore)]
    Store(anyhow::Error),
}

impl From<SheetError> for IngestError {
    fn from(err: SheetError) -> Self {
        IngestError::Sheet(err)
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Store(err)
    }
}

fn row_error(record: &CatalogRecord, reason: impl Into<String>) -> RunError {
    RunError {
        row: Some(record.row),
        code: record.code.clone(),
        kind: ErrorKind::Row,
        reason: reason.into(),
    }
}

fn image_error(code: &str, reason: impl Into<String>) -> RunError {
    RunError {
        row: None,
        code: Some(code.to_string()),
        kind: ErrorKind::Image,
        reason: reason.into(),
    }
}

/// Drives one full pass over an input file: wipe (optional), parse, upsert,
/// image sync, regenerated spreadsheet.
pub struct Ingestor {
    products: Arc<dyn ProductRepository>,
    categories: Arc<dyn CategoryRepository>,
    subcategories: Arc<dyn SubcategoryRepository>,
    images: Arc<dyn ProductImageRepository>,
    storage: Arc<dyn StorageGateway>,
    fetcher: Arc<dyn ImageFetch>,
}

impl Ingestor {
    pub fn new(
        products: Arc<dyn ProductRepository>,
        categories: Arc<dyn CategoryRepository>,
        subcategories: Arc<dyn SubcategoryRepository>,
        images: Arc<dyn ProductImageRepository>,
        storage: Arc<dyn StorageGateway>,
        fetcher: Arc<dyn ImageFetch>,
    ) -> Self {
        Self {
            products,
            categories,
            subcategories,
            images,
            storage,
            fetcher,
        }
    }

    pub async fn run<P>(&self, opts: &IngestOptions, mut progress: P) -> Result<RunReport, IngestError>
    where
        P: FnMut(usize, usize),
    {
        log::info!("Starting ingestion of {}", opts.file_path);
        let mut summary = RunSummary::default();
        if opts.wipe_before_load {
            summary.wipe = Some(self.wipe_all().await?);
        }
        let table = sheet::read_table(&opts.file_path, opts.format).await?;
        let layout = sheet::detect_layout(&table);
        sheet::validate_columns(&table, layout)?;
        let (records, skips) = sheet::extract_records(&table, layout);
        for skip in skips {
            summary.errors.push(RunError {
                row: Some(skip.row),
                code: None,
                kind: ErrorKind::Row,
                reason: skip.reason,
            });
        }
        if records.is_empty() {
            return Err(IngestError::NoRows);
        }
        summary.rows_total = records.len();
        let total = records.len();
        // The in-run map belongs to this task alone; concurrent jobs only
        // meet through the persistent fallback.
        let mut cache = DedupCache::new();
        for (idx, record) in records.iter().enumerate() {
            self.process_row(record, &mut cache, &mut summary).await;
            progress(idx + 1, total);
        }
        log::info!(
            "Processed {total} row(s): {} created, {} updated, {} image(s), {} error(s)",
            summary.products_created,
            summary.products_updated,
            summary.images_created,
            summary.errors.len()
        );
        let output = self.finalize(&table, layout, &summary).await;
        Ok(RunReport { summary, output })
    }

    async fn wipe_all(&self) -> Result<WipeSummary, IngestError> {
        log::info!("Wipe requested: clearing products, images and stored objects");
        let images_deleted = self.images.clear().await?;
        let products_deleted = self.products.clear().await?;
        let objects_deleted = match self.storage.delete_folder(SHARED_IMAGE_FOLDER).await {
            Ok(deleted) => deleted,
            Err(err) => {
                log::error!("Unable to purge the {SHARED_IMAGE_FOLDER} storage folder: {err}");
                0
            }
        };
        log::info!(
            "Wipe done: {products_deleted} product(s), {images_deleted} image row(s), \
             {objects_deleted} stored object(s)"
        );
        Ok(WipeSummary {
            products_deleted,
            images_deleted,
            objects_deleted,
        })
    }

    async fn process_row(
        &self,
        record: &CatalogRecord,
        cache: &mut DedupCache,
        summary: &mut RunSummary,
    ) {
        let category_id = match &record.category {
            Some(CategoryRef::Id(id)) => match self.categories.get_one(id).await {
                Ok(Some(category)) => category.id,
                Ok(None) => {
                    summary
                        .errors
                        .push(row_error(record, format!("category {id} not found")));
                    return;
                }
                Err(err) => {
                    summary
                        .errors
                        .push(row_error(record, format!("category lookup failed: {err}")));
                    return;
                }
            },
            Some(CategoryRef::Name(name)) => match self.categories.get_or_create(name).await {
                Ok((category, created)) => {
                    if created {
                        summary.categories_created += 1;
                    }
                    category.id
                }
                Err(err) => {
                    summary
                        .errors
                        .push(row_error(record, format!("category upsert failed: {err}")));
                    return;
                }
            },
            None => {
                summary
                    .errors
                    .push(row_error(record, "category not informed"));
                return;
            }
        };

        let subcategory_id = match &record.subcategory {
            Some(CategoryRef::Id(id)) => match self.subcategories.get_one(id).await {
                Ok(Some(sub)) if sub.category_id == category_id => Some(sub.id),
                Ok(Some(_)) => {
                    summary.errors.push(row_error(
                        record,
                        format!("subcategory {id} does not belong to category {category_id}"),
                    ));
                    return;
                }
                Ok(None) => {
                    summary
                        .errors
                        .push(row_error(record, format!("subcategory {id} not found")));
                    return;
                }
                Err(err) => {
                    summary.errors.push(row_error(
                        record,
                        format!("subcategory lookup failed: {err}"),
                    ));
                    return;
                }
            },
            Some(CategoryRef::Name(name)) => {
                match self.subcategories.get_or_create(category_id, name).await {
                    Ok((sub, created)) => {
                        if created {
                            summary.subcategories_created += 1;
                        }
                        Some(sub.id)
                    }
                    Err(err) => {
                        summary.errors.push(row_error(
                            record,
                            format!("subcategory upsert failed: {err}"),
                        ));
                        return;
                    }
                }
            }
            None => None,
        };

        let code = match record.code.clone() {
            Some(code) => code,
            None => {
                let base = synthesize_code(&record.name);
                match self.products.next_code(&base).await {
                    Ok(code) => code,
                    Err(err) => {
                        summary.errors.push(row_error(
                            record,
                            format!("unable to allocate a product code: {err}"),
                        ));
                        return;
                    }
                }
            }
        };

        // kit_parent_code is stored verbatim; the parent may only appear
        // further down the same file.
        let draft = ProductDraft {
            code,
            name: record.name.clone(),
            description: record.description.clone(),
            category_id,
            subcategory_id,
            unit_price: record.unit_price.unwrap_or(Decimal::ZERO),
            quantity: record.quantity,
            kit_parent_code: record.kit_parent_code.clone(),
            active: record.active,
        };
        let (product, outcome) = match self.products.upsert(draft).await {
            Ok(result) => result,
            Err(err) => {
                summary
                    .errors
                    .push(row_error(record, format!("product upsert failed: {err}")));
                return;
            }
        };
        match outcome {
            UpsertOutcome::Created => summary.products_created += 1,
            UpsertOutcome::Updated => summary.products_updated += 1,
            UpsertOutcome::Unchanged => (),
        }

        self.process_images(&product, &record.image_links, cache, summary)
            .await;
    }

    async fn process_images(
        &self,
        product: &Product,
        raw_links: &[String],
        cache: &mut DedupCache,
        summary: &mut RunSummary,
    ) {
        let mut seen = HashSet::new();
        let links: Vec<&str> = raw_links
            .iter()
            .map(|link| link.trim())
            .filter(|link| !link.is_empty())
            .filter(|link| seen.insert(link.to_string()))
            .collect();
        // A row without links leaves the product's stored images alone.
        if links.is_empty() {
            return;
        }
        let mut resolved: Vec<String> = Vec::new();
        for raw in links {
            if let Some(url) = self.resolve_one(raw, product, cache, summary).await {
                if !resolved.contains(&url) {
                    resolved.push(url);
                }
            }
        }
        match self.images.reconcile(product.id, &resolved).await {
            Ok((created, deleted)) => {
                summary.images_created += created;
                summary.images_deleted += deleted;
                log::debug!(
                    "Product {}: {} resolved URL(s), {created} created, {deleted} deleted, \
                     cache size {}",
                    product.code,
                    resolved.len(),
                    cache.len()
                );
            }
            Err(err) => summary.errors.push(image_error(
                &product.code,
                format!("image reconciliation failed: {err}"),
            )),
        }
    }

    /// One raw link to one public URL, or `None` with the failure recorded.
    async fn resolve_one(
        &self,
        raw: &str,
        product: &Product,
        cache: &mut DedupCache,
        summary: &mut RunSummary,
    ) -> Option<String> {
        let (download_url, content_key) = match link::resolve(raw) {
            Ok(ResolvedLink::Public { url }) => return Some(url),
            Ok(ResolvedLink::Remote {
                download_url,
                content_key,
            }) => (download_url, content_key),
            Err(err) => {
                summary
                    .errors
                    .push(image_error(&product.code, err.to_string()));
                return None;
            }
        };
        let decision = match cache
            .lookup(&content_key, self.images.as_ref(), self.storage.as_ref())
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                summary.errors.push(image_error(
                    &product.code,
                    format!("dedup lookup failed: {err}"),
                ));
                return None;
            }
        };
        match decision {
            CacheDecision::HitInRun(url) => {
                log::debug!("Product {}: cache hit for {content_key}", product.code);
                Some(url)
            }
            CacheDecision::HitInStore(url) => {
                log::debug!("Product {}: catalog hit for {content_key}", product.code);
                Some(url)
            }
            CacheDecision::Miss => {
                let image = match self.fetcher.fetch(&download_url).await {
                    Ok(image) => image,
                    Err(err) => {
                        summary.errors.push(image_error(
                            &product.code,
                            format!("download failed ({}): {err}", err.reason()),
                        ));
                        return None;
                    }
                };
                let content_type = if image.content_type.is_empty() {
                    "image/jpeg".to_string()
                } else {
                    image.content_type.clone()
                };
                let path = shared_object_path(&content_key);
                match self.storage.upload(&path, image.bytes, &content_type).await {
                    Ok(url) => {
                        cache.record(&content_key, &url);
                        Some(url)
                    }
                    Err(err) => {
                        summary.errors.push(image_error(
                            &product.code,
                            format!("upload failed: {err}"),
                        ));
                        None
                    }
                }
            }
        }
    }

    async fn finalize(&self, table: &Table, layout: Layout, summary: &RunSummary) -> RunOutput {
        let message = format!(
            "{} row(s) processed, {} product(s) created, {} updated, {} image(s) stored, \
             {} error(s)",
            summary.rows_total,
            summary.products_created,
            summary.products_updated,
            summary.images_created,
            summary.errors.len()
        );
        match self.upload_result_sheet(table, layout).await {
            Ok((url, filename)) => RunOutput {
                spreadsheet_url: Some(url),
                spreadsheet_filename: Some(filename),
                message,
            },
            Err(err) => {
                log::error!("Unable to generate the result spreadsheet: {err}");
                RunOutput {
                    spreadsheet_url: None,
                    spreadsheet_filename: None,
                    message,
                }
            }
        }
    }

    /// URLs in the regenerated sheet come straight from the catalog; a row
    /// whose product never made it in gets an empty cell, not a guess.
    async fn result_cells(
        &self,
        table: &Table,
        layout: Layout,
    ) -> Result<Vec<String>, anyhow::Error> {
        let code_column = match layout {
            Layout::Modern => "codigo",
            Layout::Legacy => "PRODUTO",
        };
        let mut cells = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let mut cell = String::new();
            if let Some(value) = table.cell(row, code_column) {
                let code = match layout {
                    Layout::Modern => value.to_string(),
                    Layout::Legacy => synthesize_code(value),
                };
                if let Some(product) = self.products.get_one(&code).await? {
                    let urls: Vec<String> = self
                        .images
                        .list_by_product(product.id)
                        .await?
                        .into_iter()
                        .map(|image| image.url)
                        .collect();
                    cell = export::bracketed_list(&urls);
                }
            }
            cells.push(cell);
        }
        Ok(cells)
    }

    async fn upload_result_sheet(
        &self,
        table: &Table,
        layout: Layout,
    ) -> Result<(String, String), anyhow::Error> {
        let cells = self.result_cells(table, layout).await?;
        let bytes = export::result_workbook(table, &cells)?;
        let stamp_format =
            time::macros::format_description!("[year][month][day]_[hour][minute][second]");
        let stamp = OffsetDateTime::now_utc().format(&stamp_format)?;
        let filename = format!("produtos_atualizados_{stamp}.xlsx");
        let url = self
            .storage
            .upload(
                &format!("planilhas/{filename}"),
                Bytes::from(bytes),
                export::XLSX_CONTENT_TYPE,
            )
            .await?;
        log::info!("Result spreadsheet uploaded: {url}");
        Ok((url, filename))
    }
}
