mod admission;
mod app_state;
mod approval;
mod cleanup;
mod config;
mod connection;
mod dispatcher;
mod error;
mod id;
mod logging;
mod namespace;
mod protocol;
mod rate_limit;
mod room;
mod routes;
mod session;
mod storage;
mod validate;
mod ws;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

use app_state::AppState;
use config::Config;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = Config::from_env();
    let _logging = logging::init(&config.logging.log_dir, &config.logging.level_filter);

    serve(config).await
}

// Split out so integration tests can spin the server without going through `main`.
async fn serve(config: Config) -> std::io::Result<()> {
    let is_prod = config.server.is_prod;
    let host = config.server.host;
    let port = config.server.port;
    let tls_key_path = config.server.tls_key_path.clone();
    let tls_cert_path = config.server.tls_cert_path.clone();
    let cors_config = config.cors.clone();

    let state = AppState::new(config);
    spawn_background_sweeps(Arc::clone(&state));

    // IP-bucketed admission is delegated to actix-governor at the HTTP
    // layer, matching the teacher's `Governor` middleware in `main.rs`.
    // TODO: swap the key extractor if this ever runs behind a reverse proxy.
    let governor_conf = GovernorConfigBuilder::default()
        .burst_size(state.config.admission.ip_connections_per_minute)
        .seconds_per_request(6)
        .finish()
        .expect("failed to build governor rate limiter");

    let server = HttpServer::new(move || {
        let cors = build_cors(&cors_config);

        App::new()
            .wrap(middleware::Logger::new("%a %r -> %s (%Dms)"))
            .wrap(cors)
            .wrap(middleware::Compress::default())
            .wrap(Governor::new(&governor_conf))
            .app_data(web::Data::new(Arc::clone(&state)))
            .default_service(web::to(HttpResponse::NotFound))
            .service(routes::health)
            .service(routes::performance_system)
            .service(routes::performance_rooms)
            .service(routes::performance_connections_health)
            .service(routes::performance_connections_optimization)
            .service(routes::performance_cleanup)
            .service(routes::performance_cleanup_force)
            .service(routes::performance_dashboard)
            .service(routes::audio_region)
            .service(routes::project_loaded)
            .service(web::resource("/ws").route(web::get().to(ws::connect)))
    });

    match is_prod {
        true => {
            let key_path = tls_key_path.expect("TLS_PRIVATE_KEY must be set in prod mode");
            let cert_path = tls_cert_path.expect("TLS_CERT_KEY must be set in prod mode");

            let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
            builder.set_private_key_file(&key_path, SslFiletype::PEM)?;
            builder.set_certificate_chain_file(&cert_path)?;

            server.bind_openssl((host, port), builder)?.run().await?;
        }
        false => {
            server.bind((host, port))?.run().await?;
        }
    }

    Ok(())
}

fn build_cors(cors_config: &config::CorsConfig) -> Cors {
    if !cors_config.strict_mode {
        return Cors::permissive();
    }

    let mut cors = Cors::default().allow_any_method().allow_any_header();
    if cors_config.credentials {
        cors = cors.supports_credentials();
    }
    for origin in cors_config.origin.iter().chain(cors_config.development_origins.iter()) {
        cors = cors.allowed_origin(origin);
    }
    cors
}

/// Background sweeps (spec.md §4.10/§4.11): periodic cleanup passes,
/// rate-limiter/admission/session/approval expiry, and batch flush —
/// none of these fire on their own without a timer driving them.
fn spawn_background_sweeps(state: Arc<AppState>) {
    let cleanup_state = Arc::clone(&state);
    let regular_interval = cleanup_state.config.cleanup.cleanup_interval;
    actix_rt::spawn(async move {
        let mut ticker = actix_rt::time::interval(regular_interval);
        loop {
            ticker.tick().await;
            let heap_mb = routes::resident_memory_mb();
            cleanup_state
                .cleanup
                .run_regular(
                    &cleanup_state.namespaces,
                    &cleanup_state.sessions,
                    &cleanup_state.approvals,
                    &cleanup_state.rate_limiter,
                    &cleanup_state.rooms,
                    &cleanup_state.room_state,
                    heap_mb,
                )
                .await;
        }
    });

    let aggressive_state = Arc::clone(&state);
    let aggressive_interval = aggressive_state.config.cleanup.aggressive_cleanup_interval;
    actix_rt::spawn(async move {
        let mut ticker = actix_rt::time::interval(aggressive_interval);
        loop {
            ticker.tick().await;
            let heap_mb = routes::resident_memory_mb();
            aggressive_state.cleanup.run_aggressive(&aggressive_state.namespaces, heap_mb).await;
        }
    });

    let admission_state = Arc::clone(&state);
    actix_rt::spawn(async move {
        let mut ticker = actix_rt::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            for connection_id in admission_state.admission.sweep_queue_timeouts().await {
                let envelope = admission::connection_timeout_envelope();
                admission_state.connections.send(&connection_id, &envelope.event, envelope.payload).await;
                admission_state.connections.unregister(&connection_id).await;
            }
        }
    });

    // Grace-period sweep (spec.md §4.5): its own 60 s cadence, independent
    // of C11's 5-minute regular pass, so entries expire within the I10
    // bound (no later than 30 s + sweep period).
    let grace_state = Arc::clone(&state);
    actix_rt::spawn(async move {
        let mut ticker = actix_rt::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            grace_state.sessions.expire_sweep().await;
        }
    });

    // Approval-session hard timeout (spec.md §4.9/§5): 30 s TTL, checked
    // often enough that expiry is observed promptly rather than batched
    // into a multi-minute cleanup pass.
    let approval_state = Arc::clone(&state);
    actix_rt::spawn(async move {
        let mut ticker = actix_rt::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            dispatcher::sweep_approval_timeouts(&approval_state).await;
        }
    });

    let batch_state = Arc::clone(&state);
    let batch_delay = batch_state.config.admission.batch_delay;
    actix_rt::spawn(async move {
        let mut ticker = actix_rt::time::interval(batch_delay.max(Duration::from_millis(20)));
        loop {
            ticker.tick().await;
            for room_id in batch_state.rooms.all_ids().await {
                let flushed = batch_state.batched_emitter.flush_expired(&room_id).await;
                if flushed.is_empty() {
                    continue;
                }
                admission::deliver_flushed(&batch_state.namespaces, &app_state::room_path(&room_id), flushed).await;
            }
        }
    });
}
