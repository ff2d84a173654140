use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqliteConnection;

use crate::{
    auth::{new_id, AuthUser},
    error::{AppError, AppResult},
    invoice::round_cents,
    models::ServiceRow,
    policy::{authorize, Operation},
    routes::required,
    state::AppState,
};

#[derive(Deserialize)]
struct ServiceRequest {
    name: String,
    #[serde(default)]
    description: String,
    price: f64,
    /// Recorded in the price history when the price changes.
    reason: Option<String>,
}

impl ServiceRequest {
    fn validated(&self) -> AppResult<(String, f64)> {
        let name = required(&self.name, "Name")?;
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(AppError::validation("Price must be greater than zero"));
        }
        Ok((name, self.price))
    }
}

const SERVICE_COLUMNS: &str = "id, name, description, price, created_at, updated_at";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/services")
            .route(web::get().to(list_services))
            .route(web::post().to(create_service)),
    )
    .service(
        web::resource("/services/{id}")
            .route(web::get().to(get_service))
            .route(web::put().to(update_service))
            .route(web::delete().to(delete_service)),
    );
}

async fn fetch_service(conn: &mut SqliteConnection, id: &str) -> AppResult<ServiceRow> {
    sqlx::query_as::<_, ServiceRow>(&format!("SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| AppError::not_found("Service not found"))
}

async fn ensure_not_booked(conn: &mut SqliteConnection, id: &str) -> AppResult<()> {
    let bookings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM appointments WHERE service_id = ?")
        .bind(id)
        .fetch_one(conn)
        .await?;
    if bookings > 0 {
        return Err(AppError::conflict(format!(
            "Service is referenced by {bookings} appointment(s)"
        )));
    }
    Ok(())
}

async fn list_services(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let services = sqlx::query_as::<_, ServiceRow>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services ORDER BY name"
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(services))
}

async fn get_service(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let mut conn = state.db.acquire().await?;
    let service = fetch_service(&mut conn, &path).await?;
    Ok(HttpResponse::Ok().json(service))
}

async fn create_service(
    state: web::Data<AppState>,
    user: AuthUser,
    payload: web::Json<ServiceRequest>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ManageCatalog)?;
    let (name, price) = payload.validated()?;
    let id = new_id();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO services (id, name, description, price, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&name)
    .bind(payload.description.trim())
    .bind(price)
    .bind(now)
    .bind(now)
    .execute(&state.db)
    .await?;

    let mut conn = state.db.acquire().await?;
    let service = fetch_service(&mut conn, &id).await?;
    log::info!("{} created service {}", user.name, name);
    Ok(HttpResponse::Created().json(service))
}

async fn update_service(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
    payload: web::Json<ServiceRequest>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ManageCatalog)?;
    let (name, price) = payload.validated()?;
    let id = path.into_inner();

    let mut tx = state.db.begin().await?;
    let current = fetch_service(&mut tx, &id).await?;
    ensure_not_booked(&mut tx, &id).await?;

    let now = Utc::now();
    sqlx::query("UPDATE services SET name = ?, description = ?, price = ?, updated_at = ? WHERE id = ?")
        .bind(&name)
        .bind(payload.description.trim())
        .bind(price)
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await?;

    if current.price != price {
        let reason = payload
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty());
        sqlx::query(
            r#"INSERT INTO service_price_history
               (id, service_id, service_name, old_price, new_price, change_percent, reason, changed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(new_id())
        .bind(&id)
        .bind(&name)
        .bind(current.price)
        .bind(price)
        .bind(change_percent(current.price, price))
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    let service = fetch_service(&mut tx, &id).await?;
    tx.commit().await?;

    log::info!("{} updated service {}", user.name, id);
    Ok(HttpResponse::Ok().json(service))
}

async fn delete_service(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ManageCatalog)?;
    let id = path.into_inner();

    let mut tx = state.db.begin().await?;
    fetch_service(&mut tx, &id).await?;
    ensure_not_booked(&mut tx, &id).await?;
    sqlx::query("DELETE FROM services WHERE id = ?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    log::info!("{} deleted service {}", user.name, id);
    Ok(HttpResponse::NoContent().finish())
}

fn change_percent(old_price: f64, new_price: f64) -> f64 {
    round_cents((new_price - old_price) / old_price * 100.0)
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test as actix_test};
    use chrono::{Duration, Utc};
    use serde_json::{json, Value};

    use super::change_percent;
    use crate::{
        models::{AppointmentStatus, Role},
        test_util,
    };

    #[test]
    fn change_percent_is_relative_to_the_old_price() {
        assert_eq!(change_percent(20.0, 25.0), 25.0);
        assert_eq!(change_percent(30.0, 20.0), -33.33);
    }

    #[actix_web::test]
    async fn catalog_reads_are_public_and_writes_admin_only() {
        let state = test_util::state().await;
        let (_, admin) = test_util::login_as(&state, Role::Admin).await;
        let (_, employee) = test_util::login_as(&state, Role::Employee).await;
        let app = test_util::init_app!(state).await;

        let body = json!({ "name": "Blowout", "description": "Wash and dry", "price": 18.0 });
        let req = actix_test::TestRequest::post()
            .uri("/services")
            .insert_header(test_util::bearer(&employee))
            .set_json(body.clone())
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = actix_test::TestRequest::post()
            .uri("/services")
            .insert_header(test_util::bearer(&admin))
            .set_json(json!({ "name": "Free", "price": 0.0 }))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = actix_test::TestRequest::post()
            .uri("/services")
            .insert_header(test_util::bearer(&admin))
            .set_json(body)
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created: Value = actix_test::read_body_json(resp).await;

        let req = actix_test::TestRequest::get()
            .uri(&format!("/services/{}", created["id"].as_str().unwrap()))
            .to_request();
        let fetched: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(fetched["name"], "Blowout");

        let req = actix_test::TestRequest::get().uri("/services").to_request();
        let all: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(all.as_array().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn booked_services_cannot_be_changed_or_deleted() {
        let state = test_util::state().await;
        let (client, _) = test_util::login_as(&state, Role::Client).await;
        let (_, admin) = test_util::login_as(&state, Role::Admin).await;
        let service = test_util::create_service(&state.db, "Cut", 15.0).await;
        test_util::insert_appointment(
            &state.db,
            Some(&client.id),
            &service,
            Utc::now() + Duration::days(1),
            AppointmentStatus::Pending,
        )
        .await;
        let app = test_util::init_app!(state).await;

        let req = actix_test::TestRequest::put()
            .uri(&format!("/services/{service}"))
            .insert_header(test_util::bearer(&admin))
            .set_json(json!({ "name": "Cut", "price": 20.0 }))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = actix_test::TestRequest::delete()
            .uri(&format!("/services/{service}"))
            .insert_header(test_util::bearer(&admin))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let price: f64 = sqlx::query_scalar("SELECT price FROM services WHERE id = ?")
            .bind(&service)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(price, 15.0);
    }

    #[actix_web::test]
    async fn price_changes_are_recorded_and_unbooked_services_deleted() {
        let state = test_util::state().await;
        let (_, admin) = test_util::login_as(&state, Role::Admin).await;
        let service = test_util::create_service(&state.db, "Color", 40.0).await;
        let app = test_util::init_app!(state).await;

        let req = actix_test::TestRequest::put()
            .uri(&format!("/services/{service}"))
            .insert_header(test_util::bearer(&admin))
            .set_json(json!({ "name": "Color", "price": 50.0, "reason": "new dye supplier" }))
            .to_request();
        let updated: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(updated["price"], 50.0);

        let (old_price, new_price, percent, reason): (f64, f64, f64, Option<String>) =
            sqlx::query_as(
                "SELECT old_price, new_price, change_percent, reason FROM service_price_history WHERE service_id = ?",
            )
            .bind(&service)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!((old_price, new_price, percent), (40.0, 50.0, 25.0));
        assert_eq!(reason.as_deref(), Some("new dye supplier"));

        let req = actix_test::TestRequest::delete()
            .uri(&format!("/services/{service}"))
            .insert_header(test_util::bearer(&admin))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = actix_test::TestRequest::get()
            .uri(&format!("/services/{service}"))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
