//! Rate limit identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::OtpGuardError;

/// The operation an identifier is rate limited for.
///
/// Different purposes share one store without colliding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// One-time passcode issuance
    #[default]
    Otp,
    /// Password or magic-link login attempts
    Login,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Otp => "otp",
            Purpose::Login => "login",
        }
    }
}

impl FromStr for Purpose {
    type Err = OtpGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otp" => Ok(Purpose::Otp),
            "login" => Ok(Purpose::Login),
            other => Err(OtpGuardError::InvalidIdentifier(format!(
                "unknown purpose '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies a rate-limited subject.
///
/// The email is trimmed and lowercased so `A@X.com` and `a@x.com` share
/// one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    purpose: Purpose,
    email: String,
}

impl Identifier {
    /// Create a new identifier from a purpose and raw email address.
    pub fn new(purpose: Purpose, email: &str) -> Self {
        Self {
            purpose,
            email: email.trim().to_lowercase(),
        }
    }

    /// Identifier for passcode issuance to `email`.
    pub fn otp(email: &str) -> Self {
        Self::new(Purpose::Otp, email)
    }

    /// Like [`Identifier::new`] but rejects empty addresses.
    pub fn parse(purpose: Purpose, email: &str) -> Result<Self, OtpGuardError> {
        let id = Self::new(purpose, email);
        if id.email.is_empty() {
            return Err(OtpGuardError::InvalidIdentifier(
                "email is required".to_string(),
            ));
        }
        Ok(id)
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// The normalized email address.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// The canonical `<purpose>:<email>` form.
    pub fn key(&self) -> String {
        format!("{}:{}", self.purpose, self.email)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.purpose, self.email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_key_format() {
        let id = Identifier::otp("a@x.com");
        assert_eq!(id.key(), "otp:a@x.com");
        assert_eq!(id.to_string(), "otp:a@x.com");
    }

    #[test]
    fn test_identifier_is_case_insensitive() {
        let upper = Identifier::otp("  Alice@Example.COM ");
        let lower = Identifier::otp("alice@example.com");
        assert_eq!(upper, lower);
        assert_eq!(upper.email(), "alice@example.com");
    }

    #[test]
    fn test_purposes_are_separate_namespaces() {
        let otp = Identifier::new(Purpose::Otp, "a@x.com");
        let login = Identifier::new(Purpose::Login, "a@x.com");
        assert_ne!(otp, login);
        assert_eq!(login.key(), "login:a@x.com");
    }

    #[test]
    fn test_purpose_from_str() {
        assert_eq!("otp".parse::<Purpose>().unwrap(), Purpose::Otp);
        assert_eq!(" LOGIN ".parse::<Purpose>().unwrap(), Purpose::Login);
        assert!("signup".parse::<Purpose>().is_err());
    }

    #[test]
    fn test_parse_rejects_empty_email() {
        assert!(Identifier::parse(Purpose::Otp, "   ").is_err());
        assert!(Identifier::parse(Purpose::Otp, "a@x.com").is_ok());
    }
}
