//! Gold-loan domain tools.
//!
//! Every rate, price and LTV cap comes from `DomainConfig`; the tools
//! compute, they do not configure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate};
use serde_json::{json, Value};

use dhwani_config::{BranchRecord, DomainConfig, PricingConfig};

use crate::integrations::{Appointment, CalendarSink, Lead, LeadSink};
use crate::mcp::{ContentBlock, Tool, ToolCatalog, ToolError, ToolSpec};
use crate::registry::ToolRegistry;

/// Flat monthly EMI for a reducing-balance loan.
pub fn calculate_emi(principal: f64, annual_rate_percent: f64, months: u32) -> f64 {
    let r = annual_rate_percent / 100.0 / 12.0;
    if r == 0.0 {
        return principal / months as f64;
    }
    let factor = (1.0 + r).powi(months as i32);
    principal * r * factor / (factor - 1.0)
}

/// Bind the shipped tool implementations to the declared catalog and
/// register them. Unknown names in the catalog are rejected as
/// configuration errors rather than silently ignored.
pub fn build_domain_tools(
    registry: &mut ToolRegistry,
    catalog: &ToolCatalog,
    domain: Arc<DomainConfig>,
    lead_sink: Arc<dyn LeadSink>,
    calendar_sink: Arc<dyn CalendarSink>,
    settings: &dhwani_config::ToolSettings,
) -> Result<(), dhwani_core::Error> {
    for spec in &catalog.tools {
        let tool: Arc<dyn Tool> = match spec.name.as_str() {
            "check_eligibility" => Arc::new(EligibilityCheckTool {
                spec: spec.clone(),
                pricing: domain.pricing.clone(),
            }),
            "calculate_savings" => Arc::new(SavingsCalculatorTool {
                spec: spec.clone(),
                pricing: domain.pricing.clone(),
            }),
            "capture_lead" => Arc::new(LeadCaptureTool {
                spec: spec.clone(),
                sink: lead_sink.clone(),
            }),
            "schedule_appointment" => Arc::new(AppointmentSchedulerTool {
                spec: spec.clone(),
                sink: calendar_sink.clone(),
            }),
            "locate_branch" => Arc::new(BranchLocatorTool {
                spec: spec.clone(),
                branches: domain.branches.clone(),
            }),
            "get_gold_rate" => Arc::new(GoldRateTool {
                spec: spec.clone(),
                pricing: domain.pricing.clone(),
            }),
            other => {
                return Err(dhwani_core::Error::config(format!(
                    "tool catalog declares unknown tool: {}",
                    other
                )))
            }
        };
        registry.register(tool, settings)?;
    }
    Ok(())
}

/// Maximum loan for a collateral weight and purity tier.
pub struct EligibilityCheckTool {
    spec: ToolSpec,
    pricing: PricingConfig,
}

#[async_trait]
impl Tool for EligibilityCheckTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, arguments: &Value) -> Result<Vec<ContentBlock>, ToolError> {
        let weight = arguments
            .get("collateral_weight_g")
            .and_then(Value::as_f64)
            .ok_or_else(|| ToolError::Validation("collateral_weight_g is required".into()))?;
        let tier_name = arguments
            .get("collateral_tier")
            .and_then(Value::as_str)
            .unwrap_or("22K");

        let tier = self
            .pricing
            .tier(tier_name)
            .ok_or_else(|| ToolError::Validation(format!("unknown purity tier {}", tier_name)))?;

        let collateral_value = weight * self.pricing.gold_price_per_gram * tier.fineness;
        let max_loan = collateral_value * tier.ltv;
        let eligible = max_loan >= self.pricing.min_loan_amount;

        Ok(vec![ContentBlock::json(json!({
            "eligible": eligible,
            "collateral_value_inr": collateral_value.round(),
            "max_loan_inr": max_loan.round(),
            "ltv": tier.ltv,
            "annual_rate_percent": self.pricing.house_annual_rate,
        }))])
    }
}

/// Savings against the configured house rate.
pub struct SavingsCalculatorTool {
    spec: ToolSpec,
    pricing: PricingConfig,
}

#[async_trait]
impl Tool for SavingsCalculatorTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, arguments: &Value) -> Result<Vec<ContentBlock>, ToolError> {
        let outstanding = arguments
            .get("outstanding_amount")
            .and_then(Value::as_f64)
            .ok_or_else(|| ToolError::Validation("outstanding_amount is required".into()))?;
        let current_rate = arguments
            .get("current_annual_rate")
            .and_then(Value::as_f64)
            .ok_or_else(|| ToolError::Validation("current_annual_rate is required".into()))?;
        let months = arguments
            .get("months")
            .and_then(Value::as_u64)
            .unwrap_or(12) as u32;

        let house_rate = self.pricing.house_annual_rate;
        let current_emi = calculate_emi(outstanding, current_rate, months);
        let house_emi = calculate_emi(outstanding, house_rate, months);
        let monthly = (current_emi - house_emi).max(0.0);

        Ok(vec![ContentBlock::json(json!({
            "monthly_saving_inr": monthly.round(),
            "annual_saving_inr": (monthly * 12.0).round(),
            "term_saving_inr": (monthly * months as f64).round(),
            "house_annual_rate": house_rate,
            "current_emi_inr": current_emi.round(),
            "proposed_emi_inr": house_emi.round(),
        }))])
    }
}

/// Validates and forwards a lead to the CRM sink.
pub struct LeadCaptureTool {
    spec: ToolSpec,
    sink: Arc<dyn LeadSink>,
}

#[async_trait]
impl Tool for LeadCaptureTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, arguments: &Value) -> Result<Vec<ContentBlock>, ToolError> {
        let phone = arguments
            .get("phone")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Validation("phone is required".into()))?;
        // The schema pattern enforces this too; keep the belt with the
        // braces since the sink call has side effects.
        if phone.len() != 10 || !phone.starts_with(|c: char| ('6'..='9').contains(&c)) {
            return Err(ToolError::Validation(
                "phone must be a 10-digit Indian mobile number".into(),
            ));
        }

        let lead = Lead {
            name: arguments.get("name").and_then(Value::as_str).map(String::from),
            phone: phone.to_string(),
            city: arguments.get("city").and_then(Value::as_str).map(String::from),
            interest: arguments.get("interest").and_then(Value::as_str).map(String::from),
        };

        let lead_id = self
            .sink
            .capture(&lead)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        Ok(vec![ContentBlock::json(json!({
            "lead_id": lead_id,
            "status": "captured",
        }))])
    }
}

/// Books a future-dated branch visit through the calendar sink.
pub struct AppointmentSchedulerTool {
    spec: ToolSpec,
    sink: Arc<dyn CalendarSink>,
}

impl AppointmentSchedulerTool {
    /// Accepts ISO, Indian numeric, and spoken-style month formats.
    fn parse_date(raw: &str) -> Option<NaiveDate> {
        let trimmed = raw.trim();
        for format in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d %B %Y", "%B %d %Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                return Some(date);
            }
        }
        // Day-month without a year rolls forward to the next occurrence.
        for format in ["%d %B", "%d/%m"] {
            let with_year = format!("{} {}", trimmed, Local::now().year());
            let full_format = format!("{} %Y", format);
            if let Ok(date) = NaiveDate::parse_from_str(&with_year, &full_format) {
                let today = Local::now().date_naive();
                return Some(if date > today {
                    date
                } else {
                    date.with_year(date.year() + 1)?
                });
            }
        }
        None
    }
}

#[async_trait]
impl Tool for AppointmentSchedulerTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, arguments: &Value) -> Result<Vec<ContentBlock>, ToolError> {
        let raw = arguments
            .get("date")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Validation("date is required".into()))?;

        let date = Self::parse_date(raw)
            .ok_or_else(|| ToolError::Validation(format!("unparseable date: {}", raw)))?;
        if date <= Local::now().date_naive() {
            return Err(ToolError::Validation(
                "appointment date must be in the future".into(),
            ));
        }

        let appointment = Appointment {
            date,
            branch_id: arguments.get("branch_id").and_then(Value::as_str).map(String::from),
            phone: arguments.get("phone").and_then(Value::as_str).map(String::from),
            purpose: arguments.get("purpose").and_then(Value::as_str).map(String::from),
        };

        let appointment_id = self
            .sink
            .book(&appointment)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        Ok(vec![ContentBlock::json(json!({
            "appointment_id": appointment_id,
            "date": date.format("%Y-%m-%d").to_string(),
        }))])
    }
}

/// Nearest branches for a city, pincode matches first.
pub struct BranchLocatorTool {
    spec: ToolSpec,
    branches: Vec<BranchRecord>,
}

impl BranchLocatorTool {
    fn haversine_km(a: &BranchRecord, b: &BranchRecord) -> f64 {
        let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
        let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * 6371.0 * h.sqrt().asin()
    }
}

#[async_trait]
impl Tool for BranchLocatorTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, arguments: &Value) -> Result<Vec<ContentBlock>, ToolError> {
        let city = arguments
            .get("city")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Validation("city is required".into()))?;
        let pincode = arguments.get("pincode").and_then(Value::as_str);
        let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(3) as usize;

        let mut in_city: Vec<&BranchRecord> = self
            .branches
            .iter()
            .filter(|b| b.city.eq_ignore_ascii_case(city))
            .collect();

        if let Some(pincode) = pincode {
            // An exact pincode hit anchors the distance ordering.
            if let Some(anchor) = in_city.iter().find(|b| b.pincode == pincode).copied() {
                in_city.sort_by(|a, b| {
                    Self::haversine_km(anchor, a)
                        .partial_cmp(&Self::haversine_km(anchor, b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
            }
        }

        let branches: Vec<Value> = in_city
            .into_iter()
            .take(limit)
            .map(|b| {
                json!({
                    "id": b.id,
                    "name": b.name,
                    "city": b.city,
                    "pincode": b.pincode,
                    "phone": b.phone,
                })
            })
            .collect();

        Ok(vec![ContentBlock::json(json!({ "branches": branches }))])
    }
}

/// Quotes the configured reference gold price.
pub struct GoldRateTool {
    spec: ToolSpec,
    pricing: PricingConfig,
}

#[async_trait]
impl Tool for GoldRateTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, _arguments: &Value) -> Result<Vec<ContentBlock>, ToolError> {
        Ok(vec![ContentBlock::json(json!({
            "price_per_gram_inr": self.pricing.gold_price_per_gram,
        }))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{StubCalendarSink, StubLeadSink};
    use crate::mcp::ToolCall;
    use dhwani_config::ToolSettings;

    fn registry() -> ToolRegistry {
        let settings = ToolSettings::default();
        let mut registry = ToolRegistry::new(&settings);
        build_domain_tools(
            &mut registry,
            &ToolCatalog::builtin(),
            Arc::new(DomainConfig::builtin()),
            Arc::new(StubLeadSink),
            Arc::new(StubCalendarSink),
            &settings,
        )
        .unwrap();
        registry
    }

    fn result_json(result: &crate::mcp::ToolResult) -> &Value {
        result.content[0].as_json().unwrap()
    }

    #[tokio::test]
    async fn eligibility_uses_tiered_ltv() {
        let registry = registry();
        let pricing = DomainConfig::builtin().pricing;

        // 100 g of 24K at the configured price, 0.85 LTV.
        let call = ToolCall::new(
            "check_eligibility",
            json!({"collateral_weight_g": 100.0, "collateral_tier": "24K"}),
        );
        let result = registry.invoke(&call).await.unwrap();
        let body = result_json(&result);
        let expected = (100.0 * pricing.gold_price_per_gram * 0.85).round();
        assert_eq!(body["max_loan_inr"].as_f64().unwrap(), expected);
        assert_eq!(body["ltv"].as_f64().unwrap(), 0.85);
        assert!(body["eligible"].as_bool().unwrap());

        // 18K carries both a lower fineness and a lower LTV cap.
        let call = ToolCall::new(
            "check_eligibility",
            json!({"collateral_weight_g": 100.0, "collateral_tier": "18K"}),
        );
        let result = registry.invoke(&call).await.unwrap();
        let body = result_json(&result);
        assert_eq!(body["ltv"].as_f64().unwrap(), 0.75);
        assert!(body["max_loan_inr"].as_f64().unwrap() < expected);
    }

    #[tokio::test]
    async fn savings_quotes_positive_delta() {
        let registry = registry();
        let call = ToolCall::new(
            "calculate_savings",
            json!({"outstanding_amount": 500000.0, "current_annual_rate": 22.0, "months": 12}),
        );
        let result = registry.invoke(&call).await.unwrap();
        let body = result_json(&result);
        let monthly = body["monthly_saving_inr"].as_f64().unwrap();
        assert!(monthly > 0.0);
        assert_eq!(
            body["annual_saving_inr"].as_f64().unwrap(),
            (monthly * 12.0).round()
        );
        assert_eq!(body["house_annual_rate"].as_f64().unwrap(), 9.5);
    }

    #[tokio::test]
    async fn lead_capture_rejects_bad_phone() {
        let registry = registry();
        let call = ToolCall::new("capture_lead", json!({"phone": "12345"}));
        let err = registry.invoke(&call).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));

        let call = ToolCall::new("capture_lead", json!({"phone": "9876543210"}));
        let result = registry.invoke(&call).await.unwrap();
        assert_eq!(result_json(&result)["status"], "captured");
    }

    #[tokio::test]
    async fn appointment_requires_future_date() {
        let registry = registry();
        let call = ToolCall::new("schedule_appointment", json!({"date": "2001-01-01"}));
        let err = registry.invoke(&call).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));

        let next_year = Local::now().year() + 1;
        let call = ToolCall::new(
            "schedule_appointment",
            json!({"date": format!("{}-03-15", next_year)}),
        );
        let result = registry.invoke(&call).await.unwrap();
        assert_eq!(
            result_json(&result)["date"],
            format!("{}-03-15", next_year)
        );
    }

    #[test]
    fn date_parsing_accepts_multiple_formats() {
        assert!(AppointmentSchedulerTool::parse_date("2030-06-01").is_some());
        assert!(AppointmentSchedulerTool::parse_date("01/06/2030").is_some());
        assert!(AppointmentSchedulerTool::parse_date("01-06-2030").is_some());
        assert!(AppointmentSchedulerTool::parse_date("15 June 2030").is_some());
        assert!(AppointmentSchedulerTool::parse_date("gibberish").is_none());
    }

    #[tokio::test]
    async fn branch_locator_filters_by_city() {
        let registry = registry();
        let call = ToolCall::new("locate_branch", json!({"city": "Mumbai", "limit": 2}));
        let result = registry.invoke(&call).await.unwrap();
        let branches = result_json(&result)["branches"].as_array().unwrap();
        assert_eq!(branches.len(), 2);
        for branch in branches {
            assert_eq!(branch["city"], "Mumbai");
        }

        let call = ToolCall::new("locate_branch", json!({"city": "Atlantis"}));
        let result = registry.invoke(&call).await.unwrap();
        assert!(result_json(&result)["branches"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn branch_locator_anchors_on_pincode() {
        let registry = registry();
        let call = ToolCall::new(
            "locate_branch",
            json!({"city": "Delhi", "pincode": "110005", "limit": 1}),
        );
        let result = registry.invoke(&call).await.unwrap();
        let branches = result_json(&result)["branches"].as_array().unwrap();
        assert_eq!(branches[0]["pincode"], "110005");
    }

    #[test]
    fn emi_formula_sane() {
        // Zero interest spreads the principal flat.
        assert!((calculate_emi(120000.0, 0.0, 12) - 10000.0).abs() < 1e-6);
        // Higher rate, higher EMI.
        assert!(calculate_emi(500000.0, 22.0, 12) > calculate_emi(500000.0, 9.5, 12));
    }
}
