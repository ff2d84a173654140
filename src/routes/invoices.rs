use actix_web::{
    http::header::{ContentDisposition, DispositionParam, DispositionType},
    web, HttpResponse,
};

use crate::{
    auth::AuthUser,
    error::{AppError, AppResult},
    invoice, pdf,
    policy::{authorize, ensure_owner_or_staff, Operation},
    state::AppState,
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/invoices").route(web::get().to(list_invoices)))
        .service(web::resource("/invoices/{id}").route(web::get().to(get_invoice)))
        .service(web::resource("/invoices/{id}/pdf").route(web::get().to(invoice_pdf)));
}

async fn list_invoices(state: web::Data<AppState>, user: AuthUser) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ListInvoices)?;
    let invoices = invoice::list(&state.db).await?;
    Ok(HttpResponse::Ok().json(invoices))
}

/// Owner of the appointment behind an invoice, for the client ownership check.
async fn invoice_owner(state: &AppState, appointment_id: &str) -> AppResult<Option<String>> {
    let owner = sqlx::query_scalar::<_, Option<String>>("SELECT user_id FROM appointments WHERE id = ?")
        .bind(appointment_id)
        .fetch_optional(&state.db)
        .await?;
    Ok(owner.flatten())
}

async fn get_invoice(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewInvoice)?;
    let invoice = invoice::fetch(&state.db, &path)
        .await?
        .ok_or_else(|| AppError::not_found("Invoice not found"))?;
    let owner = invoice_owner(&state, &invoice.header.appointment_id).await?;
    ensure_owner_or_staff(&user, owner.as_deref())?;
    Ok(HttpResponse::Ok().json(invoice))
}

async fn invoice_pdf(
    state: web::Data<AppState>,
    user: AuthUser,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    authorize(&user, Operation::ViewInvoice)?;
    let header = invoice::fetch_header(&state.db, &path)
        .await?
        .ok_or_else(|| AppError::not_found("Invoice not found"))?;
    let owner = invoice_owner(&state, &header.appointment_id).await?;
    ensure_owner_or_staff(&user, owner.as_deref())?;

    let document = pdf::render_invoice(&header);
    Ok(HttpResponse::Ok()
        .content_type("application/pdf")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(format!("invoice-{}.pdf", header.id))],
        })
        .body(document))
}
