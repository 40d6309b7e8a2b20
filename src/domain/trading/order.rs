use serde::{Deserialize, Serialize};

/// Result of a market order, paper or live.
///
/// Failures are encoded here rather than as an `Err`: the broker
/// inspects `success` so a live failure can never be masked as a fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub filled_price: Option<f64>,
    pub quantity: Option<f64>,
    pub error: Option<String>,
    pub is_paper: bool,
}

impl OrderResult {
    pub fn paper_fill(order_id: String, price: f64, quantity: f64) -> Self {
        Self {
            success: true,
            order_id: Some(order_id),
            filled_price: Some(price),
            quantity: Some(quantity),
            error: None,
            is_paper: true,
        }
    }

    pub fn live_fill(order_id: Option<String>, price: f64, quantity: f64) -> Self {
        Self {
            success: true,
            order_id,
            filled_price: Some(price),
            quantity: Some(quantity),
            error: None,
            is_paper: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            filled_price: None,
            quantity: None,
            error: Some(error.into()),
            is_paper: false,
        }
    }
}
