use crate::ingest::{IngestOptions, Ingestor};
use crate::job::JobStore;
use crate::sheet::SheetFormat;
use actix_multipart::form::tempfile::TempFile;
use actix_multipart::form::text::Text;
use actix_multipart::form::MultipartForm;
use actix_web::web::{Data, Json, Path};
use actix_web::{get, post, HttpResponse};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub const UPLOAD_DIR: &str = "uploads";

#[derive(Deserialize)]
pub struct ImportRequest {
    pub file_path: String,
    #[serde(default)]
    pub format: SheetFormat,
    #[serde(default)]
    pub wipe_before_load: bool,
}

/// Creates the job record, spawns the run on its own task and returns
/// immediately; the submitting request never waits for the pipeline.
pub fn spawn_run(ingestor: Arc<Ingestor>, jobs: Arc<JobStore>, opts: IngestOptions) -> Uuid {
    let job_id = jobs.create();
    tokio::spawn(async move {
        jobs.mark_processing(&job_id);
        let progress_jobs = jobs.clone();
        let result = ingestor
            .run(&opts, |done, total| {
                progress_jobs.set_progress(&job_id, done, total)
            })
            .await;
        match result {
            Ok(report) => {
                log::info!(
                    "Ingestion job {job_id} completed: {} row(s), {} error(s)",
                    report.summary.rows_total,
                    report.summary.errors.len()
                );
                jobs.complete(&job_id, report.summary, report.output);
            }
            Err(err) => {
                log::error!("Ingestion job {job_id} failed: {err}");
                jobs.fail(&job_id, err.to_string());
            }
        }
    });
    job_id
}

#[post("/api/catalog/import")]
pub async fn submit_import(
    ingestor: Data<Arc<Ingestor>>,
    jobs: Data<Arc<JobStore>>,
    request: Json<ImportRequest>,
) -> actix_web::Result<HttpResponse> {
    let request = request.into_inner();
    if request.file_path.trim().is_empty() {
        return Err(actix_web::error::ErrorBadRequest("file_path is required"));
    }
    let opts = IngestOptions {
        file_path: request.file_path,
        format: request.format,
        wipe_before_load: request.wipe_before_load,
    };
    let job_id = spawn_run(ingestor.get_ref().clone(), jobs.get_ref().clone(), opts);
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "job_id": job_id })))
}

#[derive(MultipartForm)]
pub struct UploadForm {
    #[multipart(rename = "file")]
    pub file: TempFile,
    pub wipe_before_load: Option<Text<bool>>,
}

fn is_supported_extension(name: &str) -> bool {
    let name = name.to_lowercase();
    name.ends_with(".csv") || name.ends_with(".xlsx") || name.ends_with(".xls")
}

#[post("/api/catalog/upload")]
pub async fn upload_sheet(
    ingestor: Data<Arc<Ingestor>>,
    jobs: Data<Arc<JobStore>>,
    MultipartForm(form): MultipartForm<UploadForm>,
) -> actix_web::Result<HttpResponse> {
    let original_name = form
        .file
        .file_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| actix_web::error::ErrorBadRequest("file name is required"))?;
    if !is_supported_extension(&original_name) {
        return Err(actix_web::error::ErrorBadRequest(
            "only .csv, .xlsx and .xls files are supported",
        ));
    }
    let dir = PathBuf::from(UPLOAD_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    let dest = dir.join(format!("{}_{original_name}", Uuid::new_v4()));
    // The temp file may sit on another filesystem, so copy rather than rename.
    tokio::fs::copy(form.file.file.path(), &dest)
        .await
        .map_err(actix_web::error::ErrorInternalServerError)?;
    log::info!("Received {original_name} ({} byte(s))", form.file.size);

    let opts = IngestOptions {
        file_path: dest.to_string_lossy().into_owned(),
        format: SheetFormat::Auto,
        wipe_before_load: form.wipe_before_load.map(|flag| flag.0).unwrap_or(false),
    };
    let job_id = spawn_run(ingestor.get_ref().clone(), jobs.get_ref().clone(), opts);
    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "job_id": job_id,
        "file": original_name,
    })))
}

#[get("/api/catalog/import/{job_id}")]
pub async fn import_status(
    jobs: Data<Arc<JobStore>>,
    job_id: Path<Uuid>,
) -> actix_web::Result<HttpResponse> {
    match jobs.get(&job_id.into_inner()) {
        Some(job) => Ok(HttpResponse::Ok().json(job)),
        None => Err(actix_web::error::ErrorNotFound("job not found")),
    }
}

#[cfg(test)]
pub mod test {

    use super::*;

    #[test]
    fn accepts_only_sheet_extensions() {
        assert!(is_supported_extension("produtos.csv"));
        assert!(is_supported_extension("PRODUTOS.XLSX"));
        assert!(is_supported_extension("produtos.xls"));
        assert!(!is_supported_extension("produtos.pdf"));
        assert!(!is_supported_extension("produtos"));
    }
}
