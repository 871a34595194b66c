//! In-memory resource store
//!
//! All protocol state lives here, keyed by `(type, id)` with the handful of
//! secondary lookups the handlers need. Cross-references between resources
//! are ids or absolute URLs, never back-pointers.

use crate::challenge::ChallengeVerifier;
use crate::config::ServerConfig;
use crate::crypto::hash::b64url;
use crate::protocol::jwk::Jwk;
use crate::types::{
    ApplicationStatus, AuthorizationStatus, ChallengeStatus, Identifier, RegistrationStatus,
};
use rand::RngCore;
use serde_json::Value;
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Generate a short random resource id
pub fn random_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    b64url(&bytes)
}

/// An account registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub thumbprint: String,
    pub key: Jwk,
    pub contact: Vec<String>,
    pub agreement: Option<String>,
    pub status: RegistrationStatus,
}

impl Registration {
    /// Public wire view; the id and thumbprint stay private
    pub fn marshal(&self) -> Value {
        let mut view = serde_json::json!({
            "key": self.key.to_value(),
            "status": self.status,
            "contact": self.contact,
        });
        if let Some(agreement) = &self.agreement {
            view["agreement"] = Value::String(agreement.clone());
        }
        view
    }
}

/// What an application still needs before issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementKind {
    Authorization,
    OutOfBand,
}

impl RequirementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementKind::Authorization => "authorization",
            RequirementKind::OutOfBand => "out-of-band",
        }
    }
}

/// A single requirement inside an application.
///
/// `status` mirrors the referenced resource and never regresses.
#[derive(Debug, Clone)]
pub struct Requirement {
    pub kind: RequirementKind,
    pub url: String,
    pub status: AuthorizationStatus,
}

impl Requirement {
    pub fn marshal(&self) -> Value {
        serde_json::json!({
            "type": self.kind.as_str(),
            "url": self.url,
            "status": self.status,
        })
    }
}

/// A certificate application
#[derive(Debug, Clone)]
pub struct Application {
    pub id: String,
    pub reg_id: String,
    /// The CSR exactly as submitted, base64url DER
    pub csr_b64: String,
    pub csr_der: Vec<u8>,
    pub not_before: Option<OffsetDateTime>,
    pub not_after: Option<OffsetDateTime>,
    pub status: ApplicationStatus,
    pub requirements: Vec<Requirement>,
    /// URL of the issued certificate once all requirements are met
    pub certificate: Option<String>,
}

impl Application {
    pub fn marshal(&self) -> Value {
        let mut view = serde_json::json!({
            "status": self.status,
            "csr": self.csr_b64,
            "requirements": self.requirements.iter().map(Requirement::marshal).collect::<Vec<_>>(),
        });
        if let Some(not_before) = self.not_before {
            view["notBefore"] = Value::String(format_rfc3339(not_before));
        }
        if let Some(not_after) = self.not_after {
            view["notAfter"] = Value::String(format_rfc3339(not_after));
        }
        if let Some(certificate) = &self.certificate {
            view["certificate"] = Value::String(certificate.clone());
        }
        view
    }
}

/// A domain authorization owning its challenge verifiers
pub struct Authorization {
    pub id: String,
    pub reg_id: String,
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub expires: OffsetDateTime,
    pub challenges: Vec<Box<dyn ChallengeVerifier>>,
}

impl Authorization {
    /// Public wire view with challenge URIs and the one-challenge-per-combination list
    pub fn marshal(&self, config: &ServerConfig) -> Value {
        let challenges: Vec<Value> = self
            .challenges
            .iter()
            .enumerate()
            .map(|(index, challenge)| {
                let mut view = challenge.to_json();
                view["uri"] = Value::String(config.challenge_url(&self.id, index));
                view
            })
            .collect();
        let combinations: Vec<Vec<usize>> = (0..self.challenges.len()).map(|i| vec![i]).collect();
        serde_json::json!({
            "status": self.status,
            "identifier": self.identifier,
            "expires": format_rfc3339(self.expires),
            "challenges": challenges,
            "combinations": combinations,
        })
    }

    /// Recompute status from the challenges: one valid challenge validates
    /// the authorization, one invalid challenge invalidates it. Terminal
    /// states never regress.
    pub fn recompute_status(&mut self) {
        if self.status != AuthorizationStatus::Pending {
            return;
        }
        if self
            .challenges
            .iter()
            .any(|c| c.status() == ChallengeStatus::Valid)
        {
            self.status = AuthorizationStatus::Valid;
        } else if !self.challenges.is_empty()
            && self
                .challenges
                .iter()
                .all(|c| c.status() == ChallengeStatus::Invalid)
        {
            self.status = AuthorizationStatus::Invalid;
        }
    }
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("id", &self.id)
            .field("reg_id", &self.reg_id)
            .field("identifier", &self.identifier)
            .field("status", &self.status)
            .field("challenges", &self.challenges.len())
            .finish()
    }
}

/// A page-view subject backing one out-of-band requirement
#[derive(Debug, Clone)]
pub struct OobSubject {
    pub id: String,
    pub handler: String,
    pub status: AuthorizationStatus,
}

/// An issued certificate
#[derive(Debug, Clone)]
pub struct CertificateResource {
    pub id: String,
    pub reg_id: String,
    pub der: Vec<u8>,
    pub revoked: bool,
    pub revocation_reason: Option<u8>,
}

/// Format a timestamp the way every resource emits dates
pub fn format_rfc3339(odt: OffsetDateTime) -> String {
    odt.replace_nanosecond(0)
        .unwrap_or(odt)
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// The process-local resource store
#[derive(Default)]
pub struct Store {
    registrations: HashMap<String, Registration>,
    applications: HashMap<String, Application>,
    authorizations: HashMap<String, Authorization>,
    certificates: HashMap<String, CertificateResource>,
    oob_subjects: HashMap<String, OobSubject>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // Registrations

    pub fn insert_registration(&mut self, reg: Registration) {
        self.registrations.insert(reg.id.clone(), reg);
    }

    pub fn registration(&self, id: &str) -> Option<&Registration> {
        self.registrations.get(id)
    }

    pub fn registration_mut(&mut self, id: &str) -> Option<&mut Registration> {
        self.registrations.get_mut(id)
    }

    pub fn delete_registration(&mut self, id: &str) -> Option<Registration> {
        self.registrations.remove(id)
    }

    /// Unique lookup by account-key thumbprint
    pub fn reg_by_thumbprint(&self, thumbprint: &str) -> Option<&Registration> {
        self.registrations
            .values()
            .find(|reg| reg.thumbprint == thumbprint)
    }

    // Applications

    pub fn insert_application(&mut self, app: Application) {
        self.applications.insert(app.id.clone(), app);
    }

    pub fn application(&self, id: &str) -> Option<&Application> {
        self.applications.get(id)
    }

    pub fn application_mut(&mut self, id: &str) -> Option<&mut Application> {
        self.applications.get_mut(id)
    }

    /// Ids of every application owned by a registration
    pub fn application_ids_for_reg(&self, reg_id: &str) -> Vec<String> {
        self.applications
            .values()
            .filter(|app| app.reg_id == reg_id)
            .map(|app| app.id.clone())
            .collect()
    }

    /// Ids of every application in the store
    pub fn all_application_ids(&self) -> Vec<String> {
        self.applications.keys().cloned().collect()
    }

    // Authorizations

    pub fn insert_authorization(&mut self, authz: Authorization) {
        self.authorizations.insert(authz.id.clone(), authz);
    }

    pub fn authorization(&self, id: &str) -> Option<&Authorization> {
        self.authorizations.get(id)
    }

    pub fn authorization_mut(&mut self, id: &str) -> Option<&mut Authorization> {
        self.authorizations.get_mut(id)
    }

    /// A reusable (pending or valid) authorization for this owner and name
    pub fn authz_for(&self, reg_id: &str, name: &str) -> Option<&Authorization> {
        self.authorizations.values().find(|authz| {
            authz.reg_id == reg_id
                && authz.identifier.value == name
                && matches!(
                    authz.status,
                    AuthorizationStatus::Pending | AuthorizationStatus::Valid
                )
        })
    }

    /// True iff every name is covered by a valid authorization owned by the
    /// registration
    pub fn authorized_for(&self, reg_id: &str, names: &[String]) -> bool {
        names.iter().all(|name| {
            self.authorizations.values().any(|authz| {
                authz.reg_id == reg_id
                    && authz.identifier.value == *name
                    && authz.status == AuthorizationStatus::Valid
            })
        })
    }

    // Certificates

    pub fn insert_certificate(&mut self, cert: CertificateResource) {
        self.certificates.insert(cert.id.clone(), cert);
    }

    pub fn certificate(&self, id: &str) -> Option<&CertificateResource> {
        self.certificates.get(id)
    }

    pub fn certificate_mut(&mut self, id: &str) -> Option<&mut CertificateResource> {
        self.certificates.get_mut(id)
    }

    /// Locate a certificate by exact DER equality
    pub fn cert_by_der(&self, der: &[u8]) -> Option<&CertificateResource> {
        self.certificates.values().find(|cert| cert.der == der)
    }

    // Out-of-band subjects

    pub fn insert_oob(&mut self, subject: OobSubject) {
        self.oob_subjects.insert(subject.id.clone(), subject);
    }

    pub fn oob(&self, id: &str) -> Option<&OobSubject> {
        self.oob_subjects.get(id)
    }

    pub fn oob_mut(&mut self, id: &str) -> Option<&mut OobSubject> {
        self.oob_subjects.get_mut(id)
    }
}
