//! Endpoint identifier validation

use thiserror::Error;

/// Longest accepted endpoint identifier, in bytes
pub const MAX_ENDPOINT_ID_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointIdError {
    #[error("endpoint id is empty")]
    Empty,

    #[error("endpoint id exceeds {} bytes", MAX_ENDPOINT_ID_LEN)]
    TooLong,

    #[error("endpoint id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Check that an endpoint identifier is present and well formed
///
/// Accepted: 1 to [`MAX_ENDPOINT_ID_LEN`] ASCII alphanumerics, `-`, `_` or `.`.
pub fn validate_endpoint_id(endpoint_id: &str) -> Result<(), EndpointIdError> {
    if endpoint_id.is_empty() {
        return Err(EndpointIdError::Empty);
    }
    if endpoint_id.len() > MAX_ENDPOINT_ID_LEN {
        return Err(EndpointIdError::TooLong);
    }
    if let Some(c) = endpoint_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(EndpointIdError::InvalidCharacter(c));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(validate_endpoint_id("my-endpoint").is_ok());
        assert!(validate_endpoint_id("svc_1.prod").is_ok());
    }

    #[test]
    fn test_invalid_ids() {
        assert_eq!(validate_endpoint_id(""), Err(EndpointIdError::Empty));
        assert_eq!(
            validate_endpoint_id("a b"),
            Err(EndpointIdError::InvalidCharacter(' '))
        );
        assert_eq!(
            validate_endpoint_id(&"a".repeat(MAX_ENDPOINT_ID_LEN + 1)),
            Err(EndpointIdError::TooLong)
        );
    }
}
