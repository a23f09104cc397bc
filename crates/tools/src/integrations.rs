//! External CRM and calendar sinks.
//!
//! The tools depend on these traits only; deployments plug real services
//! in at startup. The stubs log and succeed so demos run without
//! third-party credentials.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink rejected the record: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub name: Option<String>,
    pub phone: String,
    pub city: Option<String>,
    pub interest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub date: NaiveDate,
    pub branch_id: Option<String>,
    pub phone: Option<String>,
    pub purpose: Option<String>,
}

/// CRM boundary.
#[async_trait]
pub trait LeadSink: Send + Sync {
    /// Returns the sink-assigned lead id.
    async fn capture(&self, lead: &Lead) -> Result<String, IntegrationError>;
}

/// Calendar boundary.
#[async_trait]
pub trait CalendarSink: Send + Sync {
    /// Returns the sink-assigned appointment id.
    async fn book(&self, appointment: &Appointment) -> Result<String, IntegrationError>;
}

/// Logging stub; always succeeds.
#[derive(Default)]
pub struct StubLeadSink;

#[async_trait]
impl LeadSink for StubLeadSink {
    async fn capture(&self, lead: &Lead) -> Result<String, IntegrationError> {
        let id = format!("lead-{}", uuid::Uuid::new_v4());
        tracing::info!(phone = %mask_phone(&lead.phone), lead_id = %id, "captured lead (stub)");
        Ok(id)
    }
}

/// Logging stub; always succeeds.
#[derive(Default)]
pub struct StubCalendarSink;

#[async_trait]
impl CalendarSink for StubCalendarSink {
    async fn book(&self, appointment: &Appointment) -> Result<String, IntegrationError> {
        let id = format!("appt-{}", uuid::Uuid::new_v4());
        tracing::info!(date = %appointment.date, appointment_id = %id, "booked appointment (stub)");
        Ok(id)
    }
}

fn mask_phone(phone: &str) -> String {
    if phone.len() >= 4 {
        format!("******{}", &phone[phone.len() - 4..])
    } else {
        "****".to_string()
    }
}
