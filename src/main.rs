mod auth;
mod config;
mod db;
mod error;
mod invoice;
mod lifecycle;
mod models;
mod pdf;
mod policy;
mod routes;
mod state;
#[cfg(test)]
mod test_util;

use actix_cors::Cors;
use actix_files::Files;
use actix_web::{http::header, middleware, web, App, HttpServer};

use crate::{config::Config, state::AppState};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    if let Err(err) = run().await {
        eprintln!("Startup error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let config = Config::from_env();

    let pool = db::connect(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    db::seed_admin(&pool, &config.admin).await?;

    std::fs::create_dir_all(&config.upload_dir)?;

    let address = format!("0.0.0.0:{}", config.port);
    let upload_dir = config.upload_dir.clone();
    let cors_origin = config.cors_origin.clone();
    let state = AppState::new(pool, config);

    log::info!("Starting salon booking API on http://{address}");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&cors_origin)
            .allowed_methods(["GET", "POST", "PUT", "DELETE"])
            .allowed_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::from_fn(auth::bearer_guard))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .service(Files::new("/recursos", upload_dir.clone()))
            .configure(routes::configure)
    })
    .bind(address)?
    .run()
    .await?;

    Ok(())
}
