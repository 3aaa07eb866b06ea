use std::env;

use crate::RfxError;

/// Wrapper around credentials so they never end up in logs or debug output.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***redacted***")
    }
}

/// Require that a given environment variable is set and non-empty.
pub fn require_env(var: &str) -> Result<SecretValue, RfxError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretValue(value)),
        _ => Err(RfxError::MissingSecret(var.to_string())),
    }
}

/// Like [`require_env`], but a missing variable is not an error.
pub fn optional_env(var: &str) -> Option<SecretValue> {
    require_env(var).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_env_success() {
        unsafe {
            std::env::set_var("RFX_TEST_SECRET", "value");
        }
        let secret = require_env("RFX_TEST_SECRET").expect("secret should load");
        assert_eq!(secret.expose(), "value");
    }

    #[test]
    fn require_env_missing() {
        unsafe {
            std::env::remove_var("RFX_TEST_SECRET_MISSING");
        }
        let err = require_env("RFX_TEST_SECRET_MISSING").unwrap_err();
        assert!(matches!(err, RfxError::MissingSecret(_)));
        assert!(optional_env("RFX_TEST_SECRET_MISSING").is_none());
    }

    #[test]
    fn debug_output_is_redacted() {
        let secret = SecretValue::new("sk-live-123");
        assert_eq!(format!("{secret:?}"), "***redacted***");
    }
}
