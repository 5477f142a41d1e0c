use actix_web::{HttpResponse, error::InternalError, web};
use serde::Serialize;

/// JSON body of every error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub fields: serde_json::Value,
}

fn bad_request(error: &str, fields: serde_json::Map<String, serde_json::Value>) -> actix_web::Error {
    let response = ErrorResponse {
        error: error.to_string(),
        fields: serde_json::Value::Object(fields),
    };
    InternalError::from_response("", HttpResponse::BadRequest().json(response)).into()
}

fn message(text: impl Into<String>) -> serde_json::Map<String, serde_json::Value> {
    let mut fields = serde_json::Map::new();
    fields.insert("message".to_string(), serde_json::Value::String(text.into()));
    fields
}

/// Client-facing explanation of a body that could not be deserialized.
fn describe_deserialize_error(err: &str) -> String {
    if err.contains("EOF while parsing") {
        "Request body is empty. Expected JSON payload".to_string()
    } else if err.contains("missing field") || err.contains("invalid type") {
        // serde's message names the offending field, e.g. "missing field `file_url`".
        err.split(" at line").next().unwrap_or(err).to_string()
    } else {
        "Invalid JSON format".to_string()
    }
}

/// Creates a configured JsonConfig with standardized error handling for the entire project
pub fn json_config() -> actix_web_validator::JsonConfig {
    actix_web_validator::JsonConfig::default().error_handler(|err, _req| match err {
        actix_web_validator::Error::Validate(validation_errors) => {
            let mut fields = serde_json::Map::new();
            for (field, errors) in validation_errors.field_errors() {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("Validation error in field: {}", field))
                    })
                    .collect();
                fields.insert(field.to_string(), serde_json::json!({ "errors": messages }));
            }
            bad_request("Validation failed", fields)
        }
        actix_web_validator::Error::Deserialize(de_err) => bad_request(
            "Request validation failed",
            message(describe_deserialize_error(&de_err.to_string())),
        ),
        _ => bad_request("Validation failed", message("Validation error")),
    })
}

/// Path segments such as `{company_id}` must be integers.
pub fn path_config() -> web::PathConfig {
    web::PathConfig::default().error_handler(|err, _req| {
        bad_request("Invalid path", message(format!("Invalid path parameter: {}", err)))
    })
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        bad_request("Invalid query", message(format!("Invalid query parameter: {}", err)))
    })
}
