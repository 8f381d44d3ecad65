//! Validation helpers shared by identities, discovery documents and activities.
//!
//! Every domain object implements [`Validate`]; an empty list means valid.
//! Constructors call [`is_valid`] before handing an object out.

use crate::error::AppError;

pub trait Validate {
    /// Collect every problem with `self`. Empty means valid.
    fn validate(&self) -> Vec<String>;
}

/// Turn the result of [`Validate::validate`] into an error listing all problems.
pub fn is_valid<T: Validate + ?Sized>(value: &T) -> Result<(), AppError> {
    let errors = value.validate();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Validation failed: {}",
            errors.join("; ")
        )))
    }
}

pub fn validate_not_empty(value: &str, field: &str) -> Vec<String> {
    if value.trim().is_empty() {
        vec![format!("field {field} should not be empty")]
    } else {
        Vec::new()
    }
}

pub fn validate_max_len(value: &str, max_len: usize, field: &str) -> Vec<String> {
    let len = value.chars().count();
    if len > max_len {
        vec![format!(
            "value in field {field} was longer than {max_len} ({len})"
        )]
    } else {
        Vec::new()
    }
}

pub fn validate_one_of<T: PartialEq + std::fmt::Display>(
    value: &T,
    allowed: &[T],
    field: &str,
) -> Vec<String> {
    if allowed.contains(value) {
        Vec::new()
    } else {
        let options = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        vec![format!(
            "value {value} in field {field} is not one of [{options}]"
        )]
    }
}
