use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use uuid::Uuid;

use crate::{
    engine::{HostCancelReport, ReservationView},
    error::{AppError, Result},
    models::{
        Actor, CheckoutRequest, ConfirmPaymentRequest, CreateReservationRequest, ExtendRequest,
        InspectionReport, ListReservationsQuery, Reservation, SubstituteRequest, TransitionNote,
    },
    payments::{
        ExtensionQuote, LedgerEntry, PaymentIntentResponse, PaymentReceipt, ReconcileReport,
        RefundReport,
    },
    substitution::{SubstituteOption, SubstitutionReceipt},
};

const MAX_REASON_LEN: usize = 500;

fn reason_of(body: Option<Json<TransitionNote>>) -> Result<Option<String>> {
    let reason = body
        .and_then(|Json(note)| note.reason)
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    if matches!(&reason, Some(r) if r.len() > MAX_REASON_LEN) {
        return Err(AppError::InvalidInput(format!(
            "reason must be at most {} characters",
            MAX_REASON_LEN
        )));
    }
    Ok(reason)
}

pub async fn create_reservation(
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<Reservation>)> {
    let user_id = state.auth_service.authenticate(&headers)?;
    let reservation = state.engine.create(user_id, req)?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn list_reservations(
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Query(query): Query<ListReservationsQuery>,
) -> Result<Json<Vec<ReservationView>>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    let role = match query.role.as_deref() {
        None => None,
        Some(raw) => match Actor::parse(raw) {
            Some(role @ (Actor::Driver | Actor::Host)) => Some(role),
            _ => {
                return Err(AppError::InvalidInput(
                    "role must be 'driver' or 'host'".to_string(),
                ))
            }
        },
    };
    Ok(Json(state.engine.list(user_id, role)?))
}

pub async fn list_overdue(
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ReservationView>>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(state.engine.overdue_for(user_id)?))
}

pub async fn get_reservation(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<ReservationView>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(state.engine.get(user_id, id)?))
}

pub async fn confirm_reservation(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<Reservation>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(state.engine.confirm(user_id, id)?))
}

pub async fn decline_reservation(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    body: Option<Json<TransitionNote>>,
) -> Result<Json<Reservation>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    let reason = reason_of(body)?;
    Ok(Json(state.engine.decline(user_id, id, reason)?))
}

pub async fn cancel_reservation(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    body: Option<Json<TransitionNote>>,
) -> Result<Json<Reservation>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    let reason = reason_of(body)?;
    Ok(Json(state.engine.cancel(user_id, id, reason)?))
}

pub async fn host_cancel_reservation(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    body: Option<Json<TransitionNote>>,
) -> Result<Json<HostCancelReport>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    let reason = reason_of(body)?;
    Ok(Json(state.engine.host_cancel(user_id, id, reason).await?))
}

pub async fn start_reservation(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(inspection): Json<InspectionReport>,
) -> Result<Json<Reservation>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(state.engine.start(user_id, id, &inspection)?))
}

pub async fn return_reservation(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(inspection): Json<InspectionReport>,
) -> Result<Json<Reservation>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(state.engine.complete(user_id, id, &inspection)?))
}

// ── Money ───────────────────────────────────────────────────────────────

pub async fn request_extension(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(req): Json<ExtendRequest>,
) -> Result<(StatusCode, Json<ExtensionQuote>)> {
    let user_id = state.auth_service.authenticate(&headers)?;
    let quote = state
        .engine
        .payments()
        .open_extension_intent(user_id, id, &req)
        .await?;
    Ok((StatusCode::CREATED, Json(quote)))
}

pub async fn open_payment(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<PaymentIntentResponse>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(
        state
            .engine
            .payments()
            .open_initial_intent(user_id, id)
            .await?,
    ))
}

pub async fn list_payments(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<LedgerEntry>>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    state.engine.get(user_id, id)?;
    Ok(Json(state.engine.payments().entries(id)?))
}

pub async fn confirm_payment(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(req): Json<ConfirmPaymentRequest>,
) -> Result<Json<PaymentReceipt>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(
        state
            .engine
            .payments()
            .confirm(user_id, id, &req.intent_id)
            .await?,
    ))
}

pub async fn checkout_payment(
    Path((id, intent_id)): Path<(Uuid, String)>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<PaymentReceipt>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(
        state
            .engine
            .payments()
            .checkout(user_id, id, &intent_id, &req.payment_method)
            .await?,
    ))
}

pub async fn reconcile_payment(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<ReconcileReport>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(state.engine.payments().reconcile(user_id, id).await?))
}

pub async fn retry_refund(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<RefundReport>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(state.engine.payments().retry_refund(user_id, id).await?))
}

// ── Substitution ────────────────────────────────────────────────────────

pub async fn list_substitutes(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SubstituteOption>>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(state.substitutions.options(user_id, id)?))
}

pub async fn substitute_vehicle(
    Path(id): Path<Uuid>,
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    Json(req): Json<SubstituteRequest>,
) -> Result<Json<SubstitutionReceipt>> {
    let user_id = state.auth_service.authenticate(&headers)?;
    Ok(Json(
        state
            .substitutions
            .select(user_id, id, req.vehicle_id)
            .await?,
    ))
}
