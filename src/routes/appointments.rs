use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqliteConnection;

use crate::{
    auth::{new_id, AuthUser},
    db::{record_audit, AuditEntry},
    error::{AppError, AppResult},
    invoice::{self, GenerateInvoiceRequest},
    lifecycle::{self, LifecycleError, Transition},
    models::{
        AppointmentRow, AppointmentStatus, ClientAppointmentRow, GuestAppointmentRow, Role,
        APPOINTMENT_COLUMNS,
    },
    policy::{authorize, ensure_owner_or_staff, Operation},
    routes::{parse_timestamp, required},
    state::AppState,
};

#[derive(Deserialize)]
struct CreateAppointmentRequest {
    service_id: String,
    scheduled_at: String,
}

#[derive(Deserialize)]
struct GuestAppointmentRequest {
    guest_name: String,
    guest_document: String,
    guest_phone: String,
    service_id: String,
    scheduled_at: String,
}

#[derive(Deserialize)]
struct UpdateAppointmentRequest {
    service_id: String,
    scheduled_at: String,
    status: AppointmentStatus,
    staff_id: Option<String>,
    cancellation_reason: Option<String>,
}

#[derive(Deserialize)]
struct CancelRequest {
    reason: String,
}

const CLIENT_APPOINTMENT_SELECT: &str = r#"SELECT a.id, a.scheduled_at, a.status, a.staff_id, a.cancellation_reason,
           s.id AS service_id, s.name AS service_name, s.price AS service_price,
           u.id AS client_id, u.name AS client_name, u.id_document AS client_document,
           u.email AS client_email, a.created_at, a.updated_at
    FROM appointments a
    JOIN services s ON s.id = a.service_id
    JOIN users u ON u.id = a.user_id"#;

const GUEST_APPOINTMENT_SELECT: &str = r#"SELECT id, scheduled_at, status, service_id,
           guest_name, guest_document, guest_phone
    FROM appointments
    WHERE user_id IS NULL"#;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/appointments").route(web::post().to(create_appointment)))
        .service(web::resource("/appointments/guest").route(web::post().to(create_guest_appointment)))
        .service(
            web::resource("/appointments/guest/{document}").route(web::get().to(latest_guest_appointment)),
        )
        .service(
            web::resource("/appointments/guest/{document}/all").route(web::get().to(guest_appointments)),
        )
        .service(web::resource("/appointments/users").route(web::get().to(list_user_appointments)))
        .service(web::resource("/appointments/guests").route(web::get().to(list_guest_appointments)))
        .service(web::resource("/my-appointments").route(web::get().to(my_appointments)))
        .service(
            web::resource("/my-appointments/latest").route(web::get().to(my_latest_appointment)),
        )
        .service(
            web::resource("/appointments/{id}")
                .route(web::get().to(get_appointment))
                .route(web::put().to(update_appointment)),
        )
        .service(web::resource("/appointments/{id}/confirm").route(web::put().to(confirm)))
        .service(web::resource("/appointments/{id}/reject").route(web::put().to(reject)))
        .service(web::resource("/appointments/{id}/cancel").route(web::put().to(cancel)))
        .service(web::resource("/appointments/{id}/finalize").route(web::put().to(finalize)))
        .service(
            web::resource("/appointments/{id}/invoice")
                .route(web::post().to(generate_invoice))
                .route(web::get().to(appointment_invoice)),
        );
}

async fn ensure_service_exists(conn: &mut SqliteConnection, service_id: &str) -> AppResult<()> {
    let found = sqlx::query_scalar::<_, String>("SELECT id FROM services WHERE id = ?")
        .bind(service_id)
        .fetch_optional(conn)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(AppError::not_found("Service not found")),
    }
}

async fn fetch_appointment(conn: &mut SqliteConnection, id: &str) -> AppResult<AppointmentRow> {
    sqlx::query_as::<_, AppointmentRow>(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| AppError::not_found("Appointment not found"))
}

async fn create_appointment(
    state: web::Data<AppState>,
    user: AuthUser,
    payload: web::Json<CreateAppointmentRequest>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::CreateAppointment)?;
    let scheduled_at = parse_timestamp(&payload.scheduled_at)?;
    lifecycle::ensure_in_future(scheduled_at, Utc::now())?;

    let mut tx = state.db.begin().await?;
    ensure_service_exists(&mut tx, &payload.service_id).await?;

    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO appointments (id, user_id, service_id, scheduled_at, status, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(&payload.service_id)
    .bind(scheduled_at)
    .bind(AppointmentStatus::Pending)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let appointment = fetch_appointment(&mut tx, &id).await?;
    tx.commit().await?;

    log::info!("{} booked appointment {} for {}", user.name, id, scheduled_at);
    Ok(HttpResponse::Created().json(appointment))
}

async fn create_guest_appointment(
    state: web::Data<AppState>,
    payload: web::Json<GuestAppointmentRequest>,
) -> AppResult<HttpResponse> {
    let guest_name = required(&payload.guest_name, "Guest name")?;
    let guest_document = required(&payload.guest_document, "Guest ID document")?;
    let guest_phone = required(&payload.guest_phone, "Guest phone")?;
    let scheduled_at = parse_timestamp(&payload.scheduled_at)?;
    lifecycle::ensure_in_future(scheduled_at, Utc::now())?;

    let mut tx = state.db.begin().await?;
    ensure_service_exists(&mut tx, &payload.service_id).await?;

    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        r#"INSERT INTO appointments
           (id, user_id, service_id, scheduled_at, status, guest_name, guest_document, guest_phone, created_at, updated_at)
           VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&payload.service_id)
    .bind(scheduled_at)
    .bind(AppointmentStatus::Pending)
    .bind(&guest_name)
    .bind(&guest_document)
    .bind(&guest_phone)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let appointment = fetch_appointment(&mut tx, &id).await?;
    tx.commit().await?;

    log::info!("Guest {} booked appointment {} for {}", guest_name, id, scheduled_at);
    Ok(HttpResponse::Created().json(appointment))
}

async fn latest_guest_appointment(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let document = path.into_inner();
    let appointment = sqlx::query_as::<_, GuestAppointmentRow>(&format!(
        "{GUEST_APPOINTMENT_SELECT} AND guest_document = ? ORDER BY scheduled_at DESC LIMIT 1"
    ))
    .bind(document.trim())
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::not_found("No appointments for this ID document"))?;
    Ok(HttpResponse::Ok().json(appointment))
}

async fn guest_appointments(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let document = path.into_inner();
    let appointments = sqlx::query_as::<_, GuestAppointmentRow>(&format!(
        "{GUEST_APPOINTMENT_SELECT} AND guest_document = ? ORDER BY scheduled_at DESC"
    ))
    .bind(document.trim())
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(appointments))
}

async fn list_user_appointments(
    state: web::Data<AppState>,
    user: AuthUser,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ListAllAppointments)?;
    let appointments = sqlx::query_as::<_, ClientAppointmentRow>(&format!(
        "{CLIENT_APPOINTMENT_SELECT} ORDER BY a.scheduled_at DESC"
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(appointments))
}

async fn list_guest_appointments(
    state: web::Data<AppState>,
    user: AuthUser,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ListAllAppointments)?;
    let appointments = sqlx::query_as::<_, GuestAppointmentRow>(&format!(
        "{GUEST_APPOINTMENT_SELECT} ORDER BY scheduled_at DESC"
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(appointments))
}

/// Admins see every registered-user booking, everyone else their own.
async fn my_appointments(state: web::Data<AppState>, user: AuthUser) -> AppResult<HttpResponse> {
    let appointments = if user.role == Role::Admin {
        sqlx::query_as::<_, ClientAppointmentRow>(&format!(
            "{CLIENT_APPOINTMENT_SELECT} ORDER BY a.scheduled_at DESC"
        ))
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as::<_, ClientAppointmentRow>(&format!(
            "{CLIENT_APPOINTMENT_SELECT} WHERE a.user_id = ? ORDER BY a.scheduled_at DESC"
        ))
        .bind(&user.id)
        .fetch_all(&state.db)
        .await?
    };
    Ok(HttpResponse::Ok().json(appointments))
}

async fn my_latest_appointment(
    state: web::Data<AppState>,
    user: AuthUser,
) -> AppResult<HttpResponse> {
    let appointment = sqlx::query_as::<_, ClientAppointmentRow>(&format!(
        "{CLIENT_APPOINTMENT_SELECT} WHERE a.user_id = ? ORDER BY a.scheduled_at DESC LIMIT 1"
    ))
    .bind(&user.id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::not_found("You have no appointments"))?;
    Ok(HttpResponse::Ok().json(appointment))
}

async fn get_appointment(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewAppointment)?;
    let mut conn = state.db.acquire().await?;
    let appointment = fetch_appointment(&mut conn, &path).await?;
    ensure_owner_or_staff(&user, appointment.user_id.as_deref())?;
    Ok(HttpResponse::Ok().json(appointment))
}

/// Full edit of an open appointment. A status change must still be a
/// lifecycle edge.
async fn update_appointment(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
    payload: web::Json<UpdateAppointmentRequest>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::UpdateAppointment)?;
    let id = path.into_inner();
    let payload = payload.into_inner();
    let scheduled_at = parse_timestamp(&payload.scheduled_at)?;
    let staff_id = payload
        .staff_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let mut tx = state.db.begin().await?;
    let current = fetch_appointment(&mut tx, &id).await?;
    if current.status.is_terminal() {
        return Err(AppError::conflict(format!(
            "A {} appointment can no longer be edited",
            current.status
        )));
    }
    ensure_service_exists(&mut tx, &payload.service_id).await?;

    if let Some(staff_id) = &staff_id {
        let role = sqlx::query_scalar::<_, Role>("SELECT role FROM users WHERE id = ?")
            .bind(staff_id)
            .fetch_optional(&mut *tx)
            .await?;
        match role {
            Some(Role::Admin | Role::Employee) => {}
            Some(Role::Client) => {
                return Err(AppError::validation("Assigned staff must be an employee or admin"))
            }
            None => return Err(AppError::not_found("Staff member not found")),
        }
    }

    let status_changed = payload.status != current.status;
    if status_changed && !lifecycle::can_move(current.status, payload.status) {
        return Err(LifecycleError::InvalidTransition {
            from: current.status,
            to: payload.status,
        }
        .into());
    }

    let reason = payload
        .cancellation_reason
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or(current.cancellation_reason.clone());
    if payload.status == AppointmentStatus::Cancelled && reason.is_none() {
        return Err(AppError::validation("A cancellation reason is required"));
    }

    sqlx::query(
        r#"UPDATE appointments
           SET service_id = ?, scheduled_at = ?, status = ?, staff_id = ?, cancellation_reason = ?, updated_at = ?
           WHERE id = ?"#,
    )
    .bind(&payload.service_id)
    .bind(scheduled_at)
    .bind(payload.status)
    .bind(&staff_id)
    .bind(&reason)
    .bind(Utc::now())
    .bind(&id)
    .execute(&mut *tx)
    .await?;

    if status_changed {
        audit_status_change(&mut tx, &id, current.status, payload.status, &user).await?;
    }

    let appointment = fetch_appointment(&mut tx, &id).await?;
    tx.commit().await?;

    log::info!("{} updated appointment {}", user.name, id);
    Ok(HttpResponse::Ok().json(appointment))
}

async fn confirm(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ConfirmAppointment)?;
    let appointment = change_status(&state, &user, &path, Transition::Confirm, None).await?;
    Ok(HttpResponse::Ok().json(appointment))
}

async fn reject(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::RejectAppointment)?;
    let appointment = change_status(&state, &user, &path, Transition::Reject, None).await?;
    Ok(HttpResponse::Ok().json(appointment))
}

async fn finalize(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::FinalizeAppointment)?;
    let appointment = change_status(&state, &user, &path, Transition::Finalize, None).await?;
    Ok(HttpResponse::Ok().json(appointment))
}

/// Admins cancel unconditionally. Clients cancel their own booking while it
/// is still far enough away.
async fn cancel(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
    payload: web::Json<CancelRequest>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::CancelAppointment)?;
    let reason = required(&payload.reason, "Cancellation reason")?;
    let appointment =
        change_status(&state, &user, &path, Transition::Cancel, Some(reason)).await?;
    Ok(HttpResponse::Ok().json(appointment))
}

async fn change_status(
    state: &AppState,
    user: &AuthUser,
    id: &str,
    transition: Transition,
    reason: Option<String>,
) -> AppResult<AppointmentRow> {
    let mut tx = state.db.begin().await?;
    let current = fetch_appointment(&mut tx, id).await?;

    if user.role == Role::Client {
        ensure_owner_or_staff(user, current.user_id.as_deref())?;
    }
    let next = lifecycle::apply(current.status, transition)?;
    if user.role == Role::Client && transition == Transition::Cancel {
        lifecycle::ensure_client_may_cancel(current.scheduled_at, Utc::now())?;
    }

    let updated = sqlx::query(
        r#"UPDATE appointments
           SET status = ?, cancellation_reason = COALESCE(?, cancellation_reason), updated_at = ?
           WHERE id = ? AND status = ?"#,
    )
    .bind(next)
    .bind(&reason)
    .bind(Utc::now())
    .bind(id)
    .bind(current.status)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() != 1 {
        return Err(AppError::conflict("The appointment changed while it was being updated"));
    }

    audit_status_change(&mut tx, id, current.status, next, user).await?;
    let appointment = fetch_appointment(&mut tx, id).await?;
    tx.commit().await?;

    log::info!(
        "{} moved appointment {} from {} to {}",
        user.name,
        id,
        current.status,
        next
    );
    Ok(appointment)
}

async fn audit_status_change(
    conn: &mut SqliteConnection,
    id: &str,
    from: AppointmentStatus,
    to: AppointmentStatus,
    actor: &AuthUser,
) -> AppResult<()> {
    record_audit(
        conn,
        AuditEntry {
            entity: "appointment",
            entity_id: id,
            action: "status_changed",
            field: Some("status"),
            old_value: Some(from.as_str()),
            new_value: Some(to.as_str()),
            actor_id: Some(&actor.id),
        },
    )
    .await
}

async fn generate_invoice(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::GenerateInvoice)?;
    let request = GenerateInvoiceRequest::from_body(&body)?;
    let invoice_id =
        invoice::generate(&state.db, &path, request, state.config.tax_rate, &user).await?;
    let invoice = invoice::fetch(&state.db, &invoice_id)
        .await?
        .ok_or_else(|| AppError::internal(format!("invoice {invoice_id} vanished after insert")))?;
    Ok(HttpResponse::Created().json(invoice))
}

async fn appointment_invoice(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewInvoice)?;
    let mut conn = state.db.acquire().await?;
    let appointment = fetch_appointment(&mut conn, &path).await?;
    drop(conn);
    ensure_owner_or_staff(&user, appointment.user_id.as_deref())?;

    let invoice = invoice::fetch_for_appointment(&state.db, &appointment.id)
        .await?
        .ok_or_else(|| AppError::not_found("No invoice for this appointment"))?;
    Ok(HttpResponse::Ok().json(invoice))
}
