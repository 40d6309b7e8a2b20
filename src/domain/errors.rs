use thiserror::Error;

/// Errors raised at the analysis boundary. Engine execution itself is
/// pure and cannot fail; an under-populated pair yields an empty
/// result instead of an error.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Invalid analysis parameter: {reason}")]
    InvalidParameter { reason: String },
}

/// Errors related to trade execution and the position lifecycle.
/// Filter rejections and order failures are logged events, not errors;
/// these cover genuinely broken references.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("Position not found: {id}")]
    PositionNotFound { id: i64 },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_error_formatting() {
        let err = TradeError::AgentNotFound { id: 7 };
        assert!(err.to_string().contains('7'));

        let err = TradeError::PositionNotFound { id: 42 };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_analysis_error_formatting() {
        let err = AnalysisError::InvalidParameter {
            reason: "confirmation_bars must be 0-5".into(),
        };
        assert!(err.to_string().contains("confirmation_bars"));
    }
}
