//! PKI adapter: CSR validation, certificate issuance and inspection
//!
//! The issuing side signs against a lazily generated in-memory CA. Inspection
//! helpers back both the server's revocation checks and the client's
//! certificate verification.

use crate::crypto::hash::{b64url, b64url_decode};
use crate::error::{AcmeError, Result};
use crate::protocol::jwk::Jwk;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::CertificateSigningRequestDer;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;
use ::time::OffsetDateTime;

/// Default certificate lifetime when an application names no dates
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 3600);

/// Policy ceiling on certificate lifetime
pub const MAX_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Tolerance when comparing certificate validity against requested dates
const VALIDITY_TOLERANCE_SECS: i64 = 1;

/// Decode a base64url CSR into DER bytes
pub fn parse_csr(b64: &str) -> Result<Vec<u8>> {
    let der = b64url_decode(b64).map_err(|_| AcmeError::csr("CSR is not base64url"))?;
    if der.is_empty() {
        return Err(AcmeError::csr("CSR is empty"));
    }
    Ok(der)
}

/// Validate a CSR and return the DNS names it covers, common name first.
///
/// The subject must be a single CN holding a DNS name. At most one
/// extensionRequest attribute is permitted, and it may carry exactly one
/// subjectAltName extension whose entries are all dNSNames.
pub fn check_csr(der: &[u8]) -> Result<Vec<String>> {
    let (rem, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| AcmeError::csr(format!("CSR does not parse: {}", e)))?;
    if !rem.is_empty() {
        return Err(AcmeError::csr("CSR has trailing bytes"));
    }
    csr.verify_signature()
        .map_err(|e| AcmeError::csr(format!("CSR signature invalid: {}", e)))?;

    let info = &csr.certification_request_info;

    let total_attrs = info.subject.iter_attributes().count();
    let cns: Vec<_> = info.subject.iter_common_name().collect();
    if total_attrs != 1 || cns.len() != 1 {
        return Err(AcmeError::csr(
            "CSR subject must consist of exactly one common name",
        ));
    }
    let cn = cns[0]
        .as_str()
        .map_err(|_| AcmeError::csr("CSR common name is not a string"))?;
    if !is_dns_name(cn) {
        return Err(AcmeError::csr(format!(
            "CSR common name is not a DNS name: {}",
            cn
        )));
    }

    let mut names = vec![cn.to_string()];

    let ext_requests: Vec<&ExtensionRequest> = info
        .iter_attributes()
        .filter_map(|attr| match attr.parsed_attribute() {
            ParsedCriAttribute::ExtensionRequest(req) => Some(req),
            _ => None,
        })
        .collect();
    if ext_requests.len() > 1 {
        return Err(AcmeError::csr(
            "CSR carries more than one extensionRequest attribute",
        ));
    }

    if let Some(req) = ext_requests.first() {
        if req.extensions.len() != 1 {
            return Err(AcmeError::csr(
                "extensionRequest must carry exactly one subjectAltName extension",
            ));
        }
        let san = match req.extensions[0].parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => san,
            _ => {
                return Err(AcmeError::csr(
                    "extensionRequest must carry exactly one subjectAltName extension",
                ))
            }
        };
        for general_name in &san.general_names {
            match general_name {
                GeneralName::DNSName(name) => {
                    if !is_dns_name(name) {
                        return Err(AcmeError::csr(format!(
                            "subjectAltName entry is not a DNS name: {}",
                            name
                        )));
                    }
                    if !names.iter().any(|n| n == name) {
                        names.push((*name).to_string());
                    }
                }
                other => {
                    return Err(AcmeError::csr(format!(
                        "subjectAltName entries must be dNSName, found {:?}",
                        other
                    )))
                }
            }
        }
    }

    if names.is_empty() {
        return Err(AcmeError::csr("CSR names no identifiers"));
    }
    Ok(names)
}

/// Syntactic DNS name check: dot-separated LDH labels
pub fn is_dns_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

struct CaKeys {
    cert: rcgen::Certificate,
    key: KeyPair,
    cert_der: Vec<u8>,
}

/// In-memory issuing CA.
///
/// The key pair and self-signed root are generated on first issuance and
/// reused for the lifetime of the process.
pub struct CertificateAuthority {
    default_validity: Duration,
    max_validity: Duration,
    keys: Mutex<Option<Arc<CaKeys>>>,
}

impl Default for CertificateAuthority {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDITY, MAX_VALIDITY)
    }
}

impl CertificateAuthority {
    /// Create a CA with the given default and maximum certificate lifetimes
    pub fn new(default_validity: Duration, max_validity: Duration) -> Self {
        Self {
            default_validity: default_validity.min(max_validity),
            max_validity,
            keys: Mutex::new(None),
        }
    }

    fn keys(&self) -> Result<Arc<CaKeys>> {
        let mut guard = self
            .keys
            .lock()
            .map_err(|_| AcmeError::crypto("CA key state poisoned"))?;
        if let Some(keys) = guard.as_ref() {
            return Ok(keys.clone());
        }

        let key = KeyPair::generate()
            .map_err(|e| AcmeError::crypto(format!("CA key generation failed: {}", e)))?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "acmeforge interim CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - ::time::Duration::days(1);
        params.not_after = now + ::time::Duration::days(3650);
        let cert = params
            .self_signed(&key)
            .map_err(|e| AcmeError::crypto(format!("CA certificate generation failed: {}", e)))?;
        let cert_der = cert.der().to_vec();
        info!("generated issuing CA key pair");

        let keys = Arc::new(CaKeys {
            cert,
            key,
            cert_der,
        });
        *guard = Some(keys.clone());
        Ok(keys)
    }

    /// DER of the self-signed CA certificate
    pub fn ca_cert_der(&self) -> Result<Vec<u8>> {
        Ok(self.keys()?.cert_der.clone())
    }

    /// Issue a certificate for a validated CSR.
    ///
    /// Validity defaults to [`DEFAULT_VALIDITY`] from now, is anchored at
    /// `not_before` when given, and is clamped to the policy maximum.
    pub fn issue(
        &self,
        csr_der: &[u8],
        not_before: Option<OffsetDateTime>,
        not_after: Option<OffsetDateTime>,
    ) -> Result<Vec<u8>> {
        let keys = self.keys()?;

        let csr = CertificateSigningRequestDer::from(csr_der.to_vec());
        let mut csr_params = CertificateSigningRequestParams::from_der(&csr)
            .map_err(|e| AcmeError::csr(format!("CSR does not parse: {}", e)))?;

        let begin = not_before.unwrap_or_else(OffsetDateTime::now_utc);
        let default_end = begin + self.default_validity;
        let max_end = begin + self.max_validity;
        let end = not_after.unwrap_or(default_end).min(max_end);
        if end <= begin {
            return Err(AcmeError::certificate("certificate validity is empty"));
        }

        csr_params.params.not_before = begin;
        csr_params.params.not_after = end;
        csr_params.params.serial_number =
            Some(SerialNumber::from(rand::random::<[u8; 16]>().to_vec()));
        csr_params.params.is_ca = IsCa::ExplicitNoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = csr_params
            .signed_by(&keys.cert, &keys.key)
            .map_err(|e| AcmeError::certificate(format!("issuance failed: {}", e)))?;
        debug!(not_before = %begin, not_after = %end, "issued certificate");
        Ok(cert.der().to_vec())
    }
}

/// DNS names in a certificate's subjectAltName extension
pub fn cert_san_names(cert_der: &[u8]) -> Result<Vec<String>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| AcmeError::certificate(format!("certificate does not parse: {}", e)))?;
    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(name) = general_name {
                names.push((*name).to_string());
            }
        }
    }
    Ok(names)
}

/// Check that an issued certificate structurally satisfies the CSR it was
/// issued for: same subject, same public key, same SAN set, and validity
/// matching the requested dates within one second.
pub fn check_cert_match(
    cert_der: &[u8],
    csr_der: &[u8],
    not_before: Option<OffsetDateTime>,
    not_after: Option<OffsetDateTime>,
) -> Result<()> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| AcmeError::certificate(format!("certificate does not parse: {}", e)))?;
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| AcmeError::csr(format!("CSR does not parse: {}", e)))?;
    let info = &csr.certification_request_info;

    if cert.subject().to_string() != info.subject.to_string() {
        return Err(AcmeError::certificate(format!(
            "subject mismatch: {} != {}",
            cert.subject(),
            info.subject
        )));
    }

    if cert.public_key().raw != info.subject_pki.raw {
        return Err(AcmeError::certificate("public key mismatch"));
    }

    let cert_names: BTreeSet<String> = cert_san_names(cert_der)?.into_iter().collect();
    let mut csr_names: BTreeSet<String> = BTreeSet::new();
    if let Some(extensions) = csr.requested_extensions() {
        for parsed in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = parsed {
                for general_name in &san.general_names {
                    if let GeneralName::DNSName(name) = general_name {
                        csr_names.insert((*name).to_string());
                    }
                }
            }
        }
    }
    if cert_names != csr_names {
        return Err(AcmeError::certificate(format!(
            "SAN set mismatch: cert {:?} != csr {:?}",
            cert_names, csr_names
        )));
    }

    let validity = cert.validity();
    if let Some(requested) = not_before {
        let delta = (validity.not_before.timestamp() - requested.unix_timestamp()).abs();
        if delta > VALIDITY_TOLERANCE_SECS {
            return Err(AcmeError::certificate("notBefore mismatch"));
        }
    }
    if let Some(requested) = not_after {
        let delta = (validity.not_after.timestamp() - requested.unix_timestamp()).abs();
        if delta > VALIDITY_TOLERANCE_SECS {
            return Err(AcmeError::certificate("notAfter mismatch"));
        }
    }

    Ok(())
}

/// JWK thumbprint of the certificate's subject public key
pub fn cert_key_thumbprint(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| AcmeError::certificate(format!("certificate does not parse: {}", e)))?;
    let jwk = spki_to_jwk(cert.public_key())?;
    Ok(jwk.thumbprint())
}

fn spki_to_jwk(spki: &SubjectPublicKeyInfo<'_>) -> Result<Jwk> {
    match spki
        .parsed()
        .map_err(|e| AcmeError::certificate(format!("unsupported public key: {}", e)))?
    {
        PublicKey::EC(point) => {
            let data = point.data();
            if data.len() != 65 || data[0] != 0x04 {
                return Err(AcmeError::certificate("unsupported EC point encoding"));
            }
            Ok(Jwk::ec_p256(b64url(&data[1..33]), b64url(&data[33..65])))
        }
        PublicKey::RSA(rsa) => {
            // ASN.1 integers are signed; strip the sign byte from the modulus
            let modulus = rsa.modulus.strip_prefix(&[0u8]).unwrap_or(rsa.modulus);
            Ok(Jwk::rsa(b64url(modulus), b64url(rsa.exponent)))
        }
        _ => Err(AcmeError::certificate("unsupported public key type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keypair::AccountKey;
    use rcgen::SanType;

    fn csr_for(names: &[&str]) -> (Vec<u8>, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let der = csr_with_key(names, &key);
        (der, key)
    }

    fn csr_with_key(names: &[&str], key: &KeyPair) -> Vec<u8> {
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, names[0]);
        params.distinguished_name = dn;
        params.serialize_request(key).unwrap().der().to_vec()
    }

    #[test]
    fn test_check_csr_names_cn_first() {
        let (der, _) = csr_for(&["example.com", "www.example.com"]);
        let names = check_csr(&der).unwrap();
        assert_eq!(names, vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_check_csr_dedups_cn_in_san() {
        let (der, _) = csr_for(&["example.com", "example.com"]);
        assert_eq!(check_csr(&der).unwrap(), vec!["example.com"]);
    }

    #[test]
    fn test_check_csr_rejects_extra_subject_attributes() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "example.com");
        dn.push(DnType::OrganizationName, "Example Org");
        params.distinguished_name = dn;
        let der = params.serialize_request(&key).unwrap().der().to_vec();
        let err = check_csr(&der).unwrap_err();
        assert!(err.to_string().contains("exactly one common name"));
    }

    #[test]
    fn test_check_csr_rejects_non_dns_san() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "example.com");
        params.distinguished_name = dn;
        params
            .subject_alt_names
            .push(SanType::IpAddress("10.0.0.1".parse().unwrap()));
        let der = params.serialize_request(&key).unwrap().der().to_vec();
        let err = check_csr(&der).unwrap_err();
        assert!(err.to_string().contains("dNSName"));
    }

    #[test]
    fn test_check_csr_rejects_garbage() {
        assert!(check_csr(b"not a csr").is_err());
        assert!(parse_csr("@@@").is_err());
        assert!(parse_csr("").is_err());
    }

    #[test]
    fn test_is_dns_name() {
        assert!(is_dns_name("example.com"));
        assert!(is_dns_name("a-b.example.com"));
        assert!(!is_dns_name(""));
        assert!(!is_dns_name("-bad.example.com"));
        assert!(!is_dns_name("exa mple.com"));
        assert!(!is_dns_name("example..com"));
    }

    #[test]
    fn test_issue_and_match() {
        let ca = CertificateAuthority::default();
        let (csr, _) = csr_for(&["not-example.com", "www.not-example.com"]);
        let cert = ca.issue(&csr, None, None).unwrap();

        check_cert_match(&cert, &csr, None, None).unwrap();
        let mut sans = cert_san_names(&cert).unwrap();
        sans.sort();
        assert_eq!(sans, vec!["not-example.com", "www.not-example.com"]);
    }

    #[test]
    fn test_issue_honours_requested_dates() {
        let ca = CertificateAuthority::default();
        let (csr, _) = csr_for(&["example.com"]);
        let begin = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
        let end = begin + ::time::Duration::days(7);
        let cert = ca.issue(&csr, Some(begin), Some(end)).unwrap();
        check_cert_match(&cert, &csr, Some(begin), Some(end)).unwrap();
    }

    #[test]
    fn test_issue_clamps_to_policy_maximum() {
        let ca = CertificateAuthority::default();
        let (csr, _) = csr_for(&["example.com"]);
        let begin = OffsetDateTime::now_utc();
        let cert = ca
            .issue(&csr, Some(begin), Some(begin + ::time::Duration::days(4000)))
            .unwrap();
        let (_, parsed) = X509Certificate::from_der(&cert).unwrap();
        let lifetime = parsed.validity().not_after.timestamp()
            - parsed.validity().not_before.timestamp();
        assert!(lifetime <= MAX_VALIDITY.as_secs() as i64 + 1);
    }

    #[test]
    fn test_match_rejects_foreign_certificate() {
        let ca = CertificateAuthority::default();
        let (csr_a, _) = csr_for(&["a.example.com"]);
        let (csr_b, _) = csr_for(&["b.example.com"]);
        let cert_a = ca.issue(&csr_a, None, None).unwrap();
        assert!(check_cert_match(&cert_a, &csr_b, None, None).is_err());
    }

    #[test]
    fn test_cert_key_thumbprint_matches_account_key() {
        // Build the CSR from the same P-256 key an account would sign with,
        // so the certificate's SPKI thumbprint equals the account thumbprint.
        let account = AccountKey::generate().unwrap();
        let rcgen_key = KeyPair::try_from(account.to_pkcs8()).unwrap();
        let csr = csr_with_key(&["example.com"], &rcgen_key);

        let ca = CertificateAuthority::default();
        let cert = ca.issue(&csr, None, None).unwrap();
        assert_eq!(cert_key_thumbprint(&cert).unwrap(), account.thumbprint());
    }
}
