use serde::{Deserialize, Serialize};

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price_cents: i64,
    pub deposit_cents: i64,
    pub duration_min: i64,
    pub points_earned: i64,
    pub is_active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AddOn {
    pub id: i64,
    pub name: String,
    pub price_cents: i64,
    pub duration_min: i64,
    pub is_active: bool,
}

/// One row per day of week (Monday = 0). A missing row means closed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BusinessHours {
    pub day_of_week: i64,
    pub open_time: String,
    pub close_time: String,
    pub is_closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromoCode {
    pub id: i64,
    pub code: String,
    /// 'percent' or 'fixed'
    pub discount_type: String,
    /// Percent (0–100) for 'percent', cents for 'fixed'.
    pub discount_value: i64,
    pub expires_at: Option<String>,
    pub max_uses: Option<i64>,
    pub times_used: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub is_ambassador: bool,
    pub points_balance: i64,
    pub created_at: String,
}

/// Appointment row. Money and duration fields are frozen at booking time;
/// rows are never deleted, only status-transitioned.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Appointment {
    pub id: i64,
    pub service_id: i64,
    pub customer_id: i64,
    pub date: String,
    pub start_time: String,
    pub total_duration_min: i64,
    pub status: String,
    pub payment_status: String,
    pub total_cents: i64,
    pub deposit_cents: i64,
    pub discount_percent: Option<i64>,
    pub discount_cents: i64,
    pub remaining_cents: i64,
    pub tip_cents: i64,
    pub promo_code: Option<String>,
    pub cancel_token: Option<String>,
    pub deposit_intent_id: Option<String>,
    pub closeout_intent_id: Option<String>,
    pub created_at: String,
    pub cancelled_at: Option<String>,
}

impl Appointment {
    pub fn appointment_status(&self) -> Option<AppointmentStatus> {
        AppointmentStatus::parse(&self.status)
    }

    pub fn payment_state(&self) -> Option<PaymentStatus> {
        PaymentStatus::parse(&self.payment_status)
    }
}

// ── Status state machine ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentStatus {
    PendingConfirmation,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::PendingConfirmation => "PENDING_CONFIRMATION",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Completed => "COMPLETED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::NoShow => "NO_SHOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_CONFIRMATION" => Some(AppointmentStatus::PendingConfirmation),
            "CONFIRMED" => Some(AppointmentStatus::Confirmed),
            "COMPLETED" => Some(AppointmentStatus::Completed),
            "CANCELLED" => Some(AppointmentStatus::Cancelled),
            "NO_SHOW" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }

    /// Whether an appointment in this status occupies its time slot.
    /// CANCELLED and NO_SHOW free the slot purely via this check.
    pub fn blocks_slot(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::PendingConfirmation
                | AppointmentStatus::Confirmed
                | AppointmentStatus::Completed
        )
    }

    /// Terminal states can never be cancelled (guest links included).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::NoShow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    PendingPayment,
    PaidDeposit,
    PaidInFull,
    PaymentFailed,
    Refunded,
    NoDepositRequired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::PendingPayment => "PENDING_PAYMENT",
            PaymentStatus::PaidDeposit => "PAID_DEPOSIT",
            PaymentStatus::PaidInFull => "PAID_IN_FULL",
            PaymentStatus::PaymentFailed => "PAYMENT_FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::NoDepositRequired => "NO_DEPOSIT_REQUIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_PAYMENT" => Some(PaymentStatus::PendingPayment),
            "PAID_DEPOSIT" => Some(PaymentStatus::PaidDeposit),
            "PAID_IN_FULL" => Some(PaymentStatus::PaidInFull),
            "PAYMENT_FAILED" => Some(PaymentStatus::PaymentFailed),
            "REFUNDED" => Some(PaymentStatus::Refunded),
            "NO_DEPOSIT_REQUIRED" => Some(PaymentStatus::NoDepositRequired),
            _ => None,
        }
    }

    /// Deposit settled (or never required): precondition for confirmation.
    pub fn deposit_settled(&self) -> bool {
        matches!(
            self,
            PaymentStatus::PaidDeposit | PaymentStatus::NoDepositRequired
        )
    }
}

// ── Policy knobs (settings table, dependency-injected into the core) ──

#[derive(Debug, Clone)]
pub struct BookingPolicy {
    pub slot_granularity_minutes: i64,
    pub buffer_minutes: i64,
    pub lead_time_minutes: i64,
    pub ambassador_discount_percent: i64,
    pub hold_expiry_minutes: i64,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            slot_granularity_minutes: 30,
            buffer_minutes: 15,
            lead_time_minutes: 0,
            ambassador_discount_percent: 10,
            hold_expiry_minutes: 30,
        }
    }
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub service_id: i64,
    pub date: String,
    /// Comma-separated add-on ids, e.g. "1,3".
    #[serde(default)]
    pub add_on_ids: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub date: String,
    pub total_duration_min: i64,
    pub slots: Vec<SlotView>,
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    pub time: String,
    pub available: bool,
}

#[derive(Debug, Deserialize)]
pub struct PricingPreviewRequest {
    pub service_id: i64,
    #[serde(default)]
    pub add_on_ids: Vec<i64>,
    #[serde(default)]
    pub promo_code: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QuoteView {
    pub service_name: String,
    pub total_minutes: i64,
    pub total_cents: i64,
    pub deposit_cents: i64,
    pub discount_percent: Option<i64>,
    pub discount_cents: i64,
    pub remaining_cents: i64,
    pub tip_cents: i64,
    pub add_ons: Vec<QuoteAddOnView>,
    /// Set when a submitted promo code did not apply (preview degrades to
    /// no discount instead of failing the whole request).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promo_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QuoteAddOnView {
    pub id: i64,
    pub name: String,
    pub price_cents: i64,
    pub duration_min: i64,
}

#[derive(Debug, Deserialize)]
pub struct BookRequest {
    pub service_id: i64,
    #[serde(default)]
    pub add_on_ids: Vec<i64>,
    pub date: String,
    pub time: String,
    pub customer_name: String,
    pub customer_email: String,
    #[serde(default)]
    pub promo_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BookResponse {
    pub appointment: AppointmentDetail,
    /// Stripe client secret for the deposit PaymentIntent, when one is due.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_client_secret: Option<String>,
    /// Opaque cancellation link token for guest self-service.
    pub cancel_token: String,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AppointmentDetail {
    pub id: i64,
    pub service_name: String,
    pub customer_name: String,
    pub customer_email: String,
    pub date: String,
    pub start_time: String,
    pub total_duration_min: i64,
    pub status: String,
    pub payment_status: String,
    pub total_cents: i64,
    pub deposit_cents: i64,
    pub discount_percent: Option<i64>,
    pub discount_cents: i64,
    pub remaining_cents: i64,
    pub tip_cents: i64,
    pub promo_code: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct AppointmentStatusResponse {
    pub status: String,
    pub payment_status: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// Possession check for self-service cancellation; admins omit it.
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub date: String,
    pub time: String,
    pub customer_email: String,
}

#[derive(Debug, Deserialize)]
pub struct CloseoutRequest {
    #[serde(default)]
    pub tip_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct CloseoutStripeResponse {
    pub appointment_id: i64,
    pub amount_cents: i64,
    pub payment_client_secret: Option<String>,
}

// ── Admin request types ──

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub deposit_cents: Option<i64>,
    pub duration_min: i64,
    pub points_earned: Option<i64>,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub deposit_cents: Option<i64>,
    pub duration_min: Option<i64>,
    pub points_earned: Option<i64>,
    pub is_active: Option<bool>,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAddOnRequest {
    pub name: String,
    pub price_cents: i64,
    pub duration_min: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAddOnRequest {
    pub name: Option<String>,
    pub price_cents: Option<i64>,
    pub duration_min: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertBusinessHoursRequest {
    pub day_of_week: i64,
    pub open_time: String,
    pub close_time: String,
    pub is_closed: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreatePromoRequest {
    pub code: String,
    pub discount_type: String,
    pub discount_value: i64,
    pub expires_at: Option<String>,
    pub max_uses: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePromoRequest {
    pub discount_value: Option<i64>,
    pub expires_at: Option<String>,
    pub max_uses: Option<i64>,
    pub is_active: Option<bool>,
}

/// Also serves as the settings list/response shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateSettingRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct AppointmentsQuery {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<String>,
}

// ── Response envelope ──

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Tests ──
