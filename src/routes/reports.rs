use actix_web::{web, HttpResponse};
use chrono::{Days, NaiveDate};
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    models::{
        AppointmentRow, AuditRow, ClientStatisticsRow, InventoryAlertRow, PriceChangeRow,
        APPOINTMENT_COLUMNS,
    },
    policy::{authorize, Operation},
    state::AppState,
};

#[derive(Deserialize)]
struct DateRangeQuery {
    from: String,
    to: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/alerts/inventory").route(web::get().to(inventory_alerts)))
        .service(
            web::resource("/alerts/inventory/{id}/resolve").route(web::put().to(resolve_alert)),
        )
        .service(web::resource("/audit").route(web::get().to(audit_trail)))
        .service(web::resource("/statistics/clients").route(web::get().to(client_statistics)))
        .service(web::resource("/history/service-prices").route(web::get().to(price_history)))
        .service(web::resource("/reports/appointments").route(web::get().to(appointments_report)));
}

async fn inventory_alerts(state: web::Data<AppState>, user: AuthUser) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewInventoryAlerts)?;
    let alerts = sqlx::query_as::<_, InventoryAlertRow>(
        r#"SELECT id, product_id, product_name, quantity, created_at, status
           FROM inventory_alerts
           WHERE status = 'pending'
           ORDER BY created_at DESC"#,
    )
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(alerts))
}

async fn resolve_alert(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ResolveInventoryAlert)?;
    let result = sqlx::query("UPDATE inventory_alerts SET status = 'resolved' WHERE id = ?")
        .bind(path.as_str())
        .execute(&state.db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Alert not found"));
    }
    log::info!("{} resolved inventory alert {}", user.name, path.as_str());
    Ok(HttpResponse::Ok().json(serde_json::json!({ "id": path.as_str(), "status": "resolved" })))
}

async fn audit_trail(state: web::Data<AppState>, user: AuthUser) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewAuditTrail)?;
    let entries = sqlx::query_as::<_, AuditRow>(
        r#"SELECT id, entity, entity_id, action, field, old_value, new_value, actor_id, created_at
           FROM audit_log
           ORDER BY created_at DESC"#,
    )
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(entries))
}

async fn client_statistics(state: web::Data<AppState>, user: AuthUser) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewClientStatistics)?;
    let rows = sqlx::query_as::<_, ClientStatisticsRow>(
        r#"SELECT client_id, name, email, total_appointments, finalized_appointments,
                  cancelled_appointments, total_spent, last_appointment_at, registered_at
           FROM client_statistics
           ORDER BY total_spent DESC, name"#,
    )
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn price_history(state: web::Data<AppState>, user: AuthUser) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewPriceHistory)?;
    let rows = sqlx::query_as::<_, PriceChangeRow>(
        r#"SELECT id, service_id, service_name, old_price, new_price, change_percent, reason, changed_at
           FROM service_price_history
           ORDER BY changed_at DESC"#,
    )
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

fn parse_date(value: &str, field: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::validation(format!("{field} must be a YYYY-MM-DD date")))
}

/// Appointments scheduled between two dates, both days included.
async fn appointments_report(
    state: web::Data<AppState>,
    user: AuthUser,
    query: web::Query<DateRangeQuery>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewAppointmentReport)?;
    let from = parse_date(&query.from, "from")?;
    let to = parse_date(&query.to, "to")?;
    if from > to {
        return Err(AppError::validation("from must not be after to"));
    }
    let end = to
        .checked_add_days(Days::new(1))
        .ok_or_else(|| AppError::validation("to is out of range"))?;

    let rows = sqlx::query_as::<_, AppointmentRow>(&format!(
        r#"SELECT {APPOINTMENT_COLUMNS}
           FROM appointments
           WHERE scheduled_at >= ? AND scheduled_at < ?
           ORDER BY scheduled_at"#
    ))
    .bind(from.and_hms_opt(0, 0, 0).map(|start| start.and_utc()))
    .bind(end.and_hms_opt(0, 0, 0).map(|start| start.and_utc()))
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}
