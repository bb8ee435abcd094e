use crate::api::server::AppState;
use crate::rental::{RentalError, StartRentalRequest};
use actix_web::{web, HttpResponse, Scope};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const DEFAULT_IMAGE: &str = "nvidia/cuda:12.1.1-runtime-ubuntu22.04";
const DEFAULT_MEMORY_BYTES: i64 = 16 * 1024 * 1024 * 1024;
const DEFAULT_CPU_COUNT: i64 = 8;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    gpu_device_id: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    ssh_password: String,
    #[serde(default)]
    memory_bytes: i64,
    #[serde(default)]
    cpu_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    session_id: String,
    ssh_host: String,
    ssh_port: u16,
    ssh_user: String,
    ssh_command: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopBody {
    #[serde(default)]
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopResponse {
    session_id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    #[serde(default)]
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn error_response(status: actix_web::http::StatusCode, message: &str, code: &str) -> HttpResponse {
    HttpResponse::build(status).json(ErrorBody {
        error: message.to_string(),
        code: Some(code.to_string()),
    })
}

fn invalid_request() -> HttpResponse {
    error_response(
        actix_web::http::StatusCode::BAD_REQUEST,
        "invalid request body",
        "INVALID_REQUEST",
    )
}

fn method_not_allowed() -> HttpResponse {
    error_response(
        actix_web::http::StatusCode::METHOD_NOT_ALLOWED,
        "method not allowed",
        "METHOD_NOT_ALLOWED",
    )
}

pub fn rental_routes() -> Scope {
    web::scope("/rentals")
        .service(
            web::resource("/start")
                .route(web::post().to(handle_start))
                .route(web::route().to(|| async { method_not_allowed() })),
        )
        .service(
            web::resource("/stop")
                .route(web::post().to(handle_stop))
                .route(web::route().to(|| async { method_not_allowed() })),
        )
        .service(
            web::resource("/status")
                .route(web::get().to(handle_status))
                .route(web::route().to(|| async { method_not_allowed() })),
        )
}

async fn handle_start(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let Ok(body) = serde_json::from_slice::<StartBody>(&body) else {
        return invalid_request();
    };

    if body.session_id.is_empty() {
        return error_response(
            actix_web::http::StatusCode::BAD_REQUEST,
            "sessionId is required",
            "MISSING_SESSION_ID",
        );
    }
    if body.gpu_device_id.is_empty() {
        return error_response(
            actix_web::http::StatusCode::BAD_REQUEST,
            "gpuDeviceId is required",
            "MISSING_GPU_DEVICE_ID",
        );
    }
    if body.ssh_password.is_empty() {
        return error_response(
            actix_web::http::StatusCode::BAD_REQUEST,
            "sshPassword is required",
            "MISSING_SSH_KEY",
        );
    }

    let request = StartRentalRequest {
        session_id: body.session_id.clone(),
        image: if body.image.is_empty() {
            DEFAULT_IMAGE.to_string()
        } else {
            body.image
        },
        gpu_device: body.gpu_device_id,
        ssh_password: body.ssh_password,
        memory_bytes: if body.memory_bytes == 0 {
            DEFAULT_MEMORY_BYTES
        } else {
            body.memory_bytes
        },
        cpu_count: if body.cpu_count == 0 {
            DEFAULT_CPU_COUNT
        } else {
            body.cpu_count
        },
        host: state.host_addr.clone(),
    };

    let cancel = CancellationToken::new();
    match state.rental.start_rental(&cancel, request).await {
        Ok(conn) => HttpResponse::Ok().json(StartResponse {
            session_id: body.session_id,
            ssh_host: conn.host,
            ssh_port: conn.port,
            ssh_user: conn.user,
            ssh_command: conn.command,
        }),
        Err(RentalError::SessionAlreadyActive) => error_response(
            actix_web::http::StatusCode::CONFLICT,
            "rental already exists",
            "RENTAL_EXISTS",
        ),
        Err(
            e @ (RentalError::ContainerNotHealthy
            | RentalError::ContainerStopped(_)
            | RentalError::Runtime(crate::docker::RuntimeError::ImagePullFailed { .. })),
        ) => error_response(
            actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
            &format!("container failed to start: {e}"),
            "CONTAINER_NOT_READY",
        ),
        Err(e) => error_response(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            &e.to_string(),
            "INTERNAL_ERROR",
        ),
    }
}

async fn handle_stop(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let Ok(body) = serde_json::from_slice::<StopBody>(&body) else {
        return invalid_request();
    };

    if body.session_id.is_empty() {
        return error_response(
            actix_web::http::StatusCode::BAD_REQUEST,
            "sessionId is required",
            "MISSING_SESSION_ID",
        );
    }

    match state.rental.stop_rental(&body.session_id).await {
        Ok(()) => HttpResponse::Ok().json(StopResponse {
            session_id: body.session_id,
            message: "rental stopped, container will be cleaned up after grace period".to_string(),
        }),
        Err(RentalError::SessionNotFound) => error_response(
            actix_web::http::StatusCode::NOT_FOUND,
            "rental not found",
            "RENTAL_NOT_FOUND",
        ),
        Err(e) => error_response(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            &e.to_string(),
            "INTERNAL_ERROR",
        ),
    }
}

async fn handle_status(state: web::Data<AppState>, query: web::Query<StatusQuery>) -> HttpResponse {
    if query.session_id.is_empty() {
        return error_response(
            actix_web::http::StatusCode::BAD_REQUEST,
            "sessionId query param required",
            "MISSING_SESSION_ID",
        );
    }

    match state.rental.status(&query.session_id) {
        Ok(session) => HttpResponse::Ok().json(session),
        Err(RentalError::SessionNotFound) => error_response(
            actix_web::http::StatusCode::NOT_FOUND,
            "rental not found",
            "RENTAL_NOT_FOUND",
        ),
        Err(e) => error_response(
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            &e.to_string(),
            "INTERNAL_ERROR",
        ),
    }
}
