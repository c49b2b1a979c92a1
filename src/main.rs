use actix_web::{web::Data, App, HttpServer};
use catalog_ingest::category::{
    CategoryRepository, SqliteCategoryRepository, SqliteSubcategoryRepository,
    SubcategoryRepository,
};
use catalog_ingest::control;
use catalog_ingest::fetch::{HttpImageFetcher, ImageFetch, DEFAULT_MAX_IMAGE_BYTES};
use catalog_ingest::ingest::Ingestor;
use catalog_ingest::job::{self, JobStore};
use catalog_ingest::product::{ProductRepository, SqliteProductRepository};
use catalog_ingest::product_image::{ProductImageRepository, SqliteProductImageRepository};
use catalog_ingest::retry::RetryPolicy;
use catalog_ingest::storage::{StorageGateway, SupabaseStorage};
use catalog_ingest::SELF_ADDR;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_rusqlite::Connection;

static DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

const CATALOG_DB: &str = "storage/catalog.db";

#[actix_web::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    match std::fs::File::open(".env") {
        Ok(_) => envmnt::load_file(".env")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::File::create(".env")?;
            envmnt::load_file(".env")?;
        }
        Err(err) => {
            return Err(anyhow::anyhow!("Unable to open .env file: {err}"));
        }
    }

    std::fs::create_dir_all("storage")?;

    // Note: each repository needs its own Connection due to ownership
    // requirements. SQLite with WAL mode supports multiple connections to
    // the same database file safely.
    let conn = Connection::open(CATALOG_DB).await?;
    let products: Arc<dyn ProductRepository> =
        Arc::new(SqliteProductRepository::init(conn).await?);
    let conn = Connection::open(CATALOG_DB).await?;
    let categories: Arc<dyn CategoryRepository> =
        Arc::new(SqliteCategoryRepository::init(conn).await?);
    let conn = Connection::open(CATALOG_DB).await?;
    let subcategories: Arc<dyn SubcategoryRepository> =
        Arc::new(SqliteSubcategoryRepository::init(conn).await?);
    let conn = Connection::open(CATALOG_DB).await?;
    let images: Arc<dyn ProductImageRepository> =
        Arc::new(SqliteProductImageRepository::init(conn).await?);

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    let client = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(60))
        .build()?;

    let policy = RetryPolicy::new(
        envmnt::get_parse("FETCH_MAX_ATTEMPTS").unwrap_or(4),
        Duration::from_millis(envmnt::get_parse("FETCH_BASE_DELAY_MS").unwrap_or(1000)),
        Duration::from_millis(envmnt::get_parse("FETCH_MAX_DELAY_MS").unwrap_or(10_000)),
    );
    let max_bytes = envmnt::get_parse("FETCH_MAX_IMAGE_BYTES").unwrap_or(DEFAULT_MAX_IMAGE_BYTES);
    let fetcher: Arc<dyn ImageFetch> =
        Arc::new(HttpImageFetcher::new(client.clone(), policy, max_bytes));
    let storage: Arc<dyn StorageGateway> = Arc::new(SupabaseStorage::from_env(client.clone())?);

    let ingestor = Arc::new(Ingestor::new(
        products,
        categories,
        subcategories,
        images,
        storage,
        fetcher,
    ));

    let jobs = Arc::new(JobStore::new());
    let max_age = Duration::from_secs(
        envmnt::get_parse("JOB_MAX_AGE_HOURS").unwrap_or(24u64) * 60 * 60,
    );
    let sweep_interval = Duration::from_secs(
        envmnt::get_parse("JOB_SWEEP_INTERVAL_MINUTES").unwrap_or(60u64) * 60,
    );
    job::spawn_sweeper(jobs.clone(), sweep_interval, max_age);

    let port: u16 = envmnt::get_parse("PORT").unwrap_or(8080);
    log::info!("Listening on {}:{port}", SELF_ADDR.as_str());
    HttpServer::new(move || {
        App::new()
            .app_data(Data::new(ingestor.clone()))
            .app_data(Data::new(jobs.clone()))
            .service(control::submit_import)
            .service(control::upload_sheet)
            .service(control::import_status)
    })
    .bind((SELF_ADDR.as_str(), port))?
    .run()
    .await?;
    Ok(())
}
