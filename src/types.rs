/// Common types for the ACME resource model
use serde::{Deserialize, Serialize};

/// Registration status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    /// Account in good standing
    Good,
    /// Account deactivated by its holder
    Deactivated,
}

impl RegistrationStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Good => "good",
            RegistrationStatus::Deactivated => "deactivated",
        }
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Application status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    /// Waiting on requirements
    Pending,
    /// All requirements met and a certificate issued
    Valid,
    /// A requirement can no longer be met
    Invalid,
}

impl ApplicationStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Valid => "valid",
            ApplicationStatus::Invalid => "invalid",
        }
    }
}

impl std::str::FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApplicationStatus::Pending),
            "valid" => Ok(ApplicationStatus::Valid),
            "invalid" => Ok(ApplicationStatus::Invalid),
            _ => Err(format!("Unknown application status: {}", s)),
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Authorization status
///
/// Transitions form a DAG rooted at `Pending`; a terminal status never
/// reverts to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    /// Pending validation
    Pending,
    /// Validated
    Valid,
    /// Validation failed
    Invalid,
    /// Deactivated by the account holder
    Deactivated,
}

impl AuthorizationStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Deactivated => "deactivated",
        }
    }

    /// Whether this status may still change
    pub fn is_pending(&self) -> bool {
        matches!(self, AuthorizationStatus::Pending)
    }
}

impl std::str::FromStr for AuthorizationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AuthorizationStatus::Pending),
            "valid" => Ok(AuthorizationStatus::Valid),
            "invalid" => Ok(AuthorizationStatus::Invalid),
            "deactivated" => Ok(AuthorizationStatus::Deactivated),
            _ => Err(format!("Unknown authorization status: {}", s)),
        }
    }
}

impl std::fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Challenge status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    /// Awaiting a client response
    Pending,
    /// Verified
    Valid,
    /// Response or probe failed
    Invalid,
}

impl ChallengeStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Valid => "valid",
            ChallengeStatus::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier to be validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    /// Type, currently always "dns"
    #[serde(rename = "type")]
    pub id_type: String,
    /// Domain name
    pub value: String,
}

impl Identifier {
    /// Create a DNS identifier
    pub fn dns(domain: impl Into<String>) -> Self {
        Self {
            id_type: "dns".to_string(),
            value: domain.into(),
        }
    }
}

/// Certificate revocation reason (RFC 5280 CRLReason)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RevocationReason {
    /// Reason unspecified
    Unspecified = 0,
    /// Key compromise
    KeyCompromise = 1,
    /// CA compromise
    CaCompromise = 2,
    /// Affiliation changed
    AffiliationChanged = 3,
    /// Superseded
    Superseded = 4,
    /// Cessation of operation
    CessationOfOperation = 5,
    /// Certificate hold
    CertificateHold = 6,
}

impl RevocationReason {
    /// Get the numeric value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_dns() {
        let id = Identifier::dns("example.com");
        assert_eq!(id.id_type, "dns");
        assert_eq!(id.value, "example.com");
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(AuthorizationStatus::Pending).unwrap(),
            serde_json::json!("pending")
        );
        assert_eq!(
            serde_json::to_value(RegistrationStatus::Good).unwrap(),
            serde_json::json!("good")
        );
    }

    #[test]
    fn test_application_status_parse() {
        assert_eq!(
            "valid".parse::<ApplicationStatus>(),
            Ok(ApplicationStatus::Valid)
        );
        assert!("ready".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn test_authorization_no_expired_variant() {
        assert!("expired".parse::<AuthorizationStatus>().is_err());
    }

    #[test]
    fn test_revocation_reason_value() {
        assert_eq!(RevocationReason::KeyCompromise.as_u8(), 1);
    }
}
