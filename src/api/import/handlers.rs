use actix_multipart::form::MultipartForm;
use actix_web::{
    HttpResponse, get, post,
    web::{Data, Path, Query, ServiceConfig, scope},
};
use actix_web_validator::Json;

use super::dto::{
    CreateImportRequest, ImportCreatedResponse, ImportJobResponse, ImportListResponse, ListQuery,
    PreviewMappingRequest, RowErrorsResponse, UploadImportForm,
};
use super::service::{ImportService, ServiceError};

#[post("")]
async fn create_import(
    service: Data<ImportService>,
    company_id: Path<i64>,
    request: Json<CreateImportRequest>,
) -> Result<HttpResponse, ServiceError> {
    let job = service.create_import(company_id.into_inner(), &request).await?;
    Ok(HttpResponse::Created().json(ImportCreatedResponse {
        message: "Import created successfully".to_string(),
        id: job.id,
        status: job.status,
    }))
}

#[post("/upload")]
async fn upload_import(
    service: Data<ImportService>,
    company_id: Path<i64>,
    MultipartForm(form): MultipartForm<UploadImportForm>,
) -> Result<HttpResponse, ServiceError> {
    let job = service.upload_import(company_id.into_inner(), form).await?;
    Ok(HttpResponse::Created().json(ImportCreatedResponse {
        message: "Import created successfully".to_string(),
        id: job.id,
        status: job.status,
    }))
}

#[get("")]
async fn list_imports(
    service: Data<ImportService>,
    company_id: Path<i64>,
    query: Query<ListQuery>,
) -> Result<HttpResponse, ServiceError> {
    let jobs = service.list_imports(company_id.into_inner(), query.limit).await?;
    Ok(HttpResponse::Ok().json(ImportListResponse {
        imports: jobs.iter().map(ImportJobResponse::from).collect(),
    }))
}

#[get("/{import_id}")]
async fn get_import(
    service: Data<ImportService>,
    path: Path<(i64, i64)>,
) -> Result<HttpResponse, ServiceError> {
    let (company_id, import_id) = path.into_inner();
    let job = service.get_import(company_id, import_id).await?;
    Ok(HttpResponse::Ok().json(ImportJobResponse::from(&job)))
}

#[get("/{import_id}/errors")]
async fn get_row_errors(
    service: Data<ImportService>,
    path: Path<(i64, i64)>,
) -> Result<HttpResponse, ServiceError> {
    let (company_id, import_id) = path.into_inner();
    let errors = service.row_errors(company_id, import_id).await?;
    Ok(HttpResponse::Ok().json(RowErrorsResponse {
        import_job_id: import_id,
        errors,
    }))
}

#[post("/{import_id}/cancel")]
async fn cancel_import(
    service: Data<ImportService>,
    path: Path<(i64, i64)>,
) -> Result<HttpResponse, ServiceError> {
    let (company_id, import_id) = path.into_inner();
    let job = service.cancel_import(company_id, import_id).await?;
    Ok(HttpResponse::Ok().json(ImportJobResponse::from(&job)))
}

#[post("/preview-mapping")]
async fn preview_mapping(
    service: Data<ImportService>,
    request: Json<PreviewMappingRequest>,
) -> Result<HttpResponse, ServiceError> {
    Ok(HttpResponse::Ok().json(service.preview_mapping(&request)?))
}

pub fn import_config(config: &mut ServiceConfig) {
    config
        .service(
            scope("/companies/{company_id}/imports")
                .service(create_import)
                .service(upload_import)
                .service(list_imports)
                .service(get_import)
                .service(get_row_errors)
                .service(cancel_import),
        )
        .service(scope("/imports").service(preview_mapping));
}
