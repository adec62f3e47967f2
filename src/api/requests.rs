use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::api::responses::ValidationErrorDetail;

/// Request to place an order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 200, message = "item must be between 1 and 200 characters"))]
    pub item: String,
    #[validate(range(min = 1, max = 10000, message = "quantity must be between 1 and 10000"))]
    pub quantity: u32,
}

impl CreateOrderRequest {
    /// Field-level validation errors, flattened for the API envelope.
    pub fn validation_errors(&self) -> Option<Vec<ValidationErrorDetail>> {
        let errors = self.validate().err()?;
        let mut details: Vec<ValidationErrorDetail> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |error| ValidationErrorDetail {
                    field: field.to_string(),
                    message: error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| error.code.to_string()),
                })
            })
            .collect();
        details.sort_by(|a, b| a.field.cmp(&b.field));
        Some(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_order() {
        let request = CreateOrderRequest {
            item: "book".to_string(),
            quantity: 2,
        };
        assert!(request.validation_errors().is_none());
    }

    #[test]
    fn test_invalid_order() {
        let request = CreateOrderRequest {
            item: String::new(),
            quantity: 0,
        };
        let errors = request.validation_errors().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "item");
        assert_eq!(errors[1].field, "quantity");
    }
}
