use crate::api::routes::rentals::rental_routes;
use crate::rental::RentalExecutor;
use actix_web::{middleware, web, web::Data, App, HttpResponse, HttpServer};
use serde_json::json;
use std::sync::Arc;

/// Shared state for the rental-facing API.
#[derive(Clone)]
pub struct AppState {
    pub rental: Arc<RentalExecutor>,
    /// Public host address reported in SSH connection details.
    pub host_addr: String,
}

/// Binds the rental API over mTLS. This surface is redundant with the Hub
/// channel and exists for direct administrative calls.
pub fn start_server(
    port: u16,
    tls_config: rustls::ServerConfig,
    rental: Arc<RentalExecutor>,
    host_addr: String,
) -> std::io::Result<actix_web::dev::Server> {
    let app_state = Data::new(AppState { rental, host_addr });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .service(rental_routes())
            .route(
                "/health",
                web::get().to(|| async { HttpResponse::Ok().body("OK") }),
            )
            .default_service(web::route().to(|| async {
                HttpResponse::NotFound().json(json!({
                    "error": "resource not found"
                }))
            }))
    })
    .bind_rustls_0_23(("0.0.0.0", port), tls_config)?
    .run();

    Ok(server)
}
