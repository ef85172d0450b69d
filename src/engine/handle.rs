//! Referral handle validation.

use thiserror::Error;

pub const MAX_HANDLE_LEN: usize = 50;

/// Substrings that mark a handle as a pasted link or markup rather than a code.
const FORBIDDEN_TOKENS: [&str; 7] = [
    "http://",
    "https://",
    "www.",
    "<script",
    "javascript:",
    "<",
    ">",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("handle is empty")]
    Empty,
    #[error("handle is {0} characters long")]
    TooLong(usize),
    #[error("handle contains forbidden token {0:?}")]
    ForbiddenToken(&'static str),
    #[error("handle is purely numeric")]
    Numeric,
    #[error("handle contains a path separator")]
    PathSeparator,
}

/// Check that `handle` can name a participant; returns it trimmed.
pub fn validate_handle(handle: &str) -> Result<&str, HandleError> {
    let trimmed = handle.trim();
    if trimmed.is_empty() {
        return Err(HandleError::Empty);
    }

    let len = trimmed.chars().count();
    if len > MAX_HANDLE_LEN {
        return Err(HandleError::TooLong(len));
    }

    let lower = trimmed.to_ascii_lowercase();
    if let Some(token) = FORBIDDEN_TOKENS.iter().find(|t| lower.contains(*t)) {
        return Err(HandleError::ForbiddenToken(*token));
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(HandleError::Numeric);
    }

    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(HandleError::PathSeparator);
    }

    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_codes() {
        assert_eq!(validate_handle("alice"), Ok("alice"));
        assert_eq!(validate_handle("  REF-2024_x "), Ok("REF-2024_x"));
        assert_eq!(validate_handle("a1"), Ok("a1"));
    }

    #[test]
    fn rejects_links_and_markup() {
        assert_eq!(
            validate_handle("https://evil.example"),
            Err(HandleError::ForbiddenToken("https://"))
        );
        assert_eq!(
            validate_handle("WWW.site"),
            Err(HandleError::ForbiddenToken("www."))
        );
        assert!(matches!(
            validate_handle("<script>alert(1)</script>"),
            Err(HandleError::ForbiddenToken(_))
        ));
        assert!(matches!(
            validate_handle("JavaScript:void(0)"),
            Err(HandleError::ForbiddenToken(_))
        ));
    }

    #[test]
    fn rejects_shape_violations() {
        assert_eq!(validate_handle("   "), Err(HandleError::Empty));
        assert_eq!(validate_handle("123456"), Err(HandleError::Numeric));
        assert_eq!(validate_handle("a/b"), Err(HandleError::PathSeparator));
        assert_eq!(validate_handle("a\\b"), Err(HandleError::PathSeparator));
        let long = "x".repeat(MAX_HANDLE_LEN + 1);
        assert_eq!(validate_handle(&long), Err(HandleError::TooLong(51)));
        assert!(validate_handle(&"x".repeat(MAX_HANDLE_LEN)).is_ok());
    }
}
