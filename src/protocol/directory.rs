/// ACME directory resource
use serde::{Deserialize, Serialize};

/// The resource map served at `{base}/directory`.
///
/// Every other endpoint is discovered from here; clients never construct
/// resource URLs themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    /// This directory's own URL
    pub directory: String,

    /// Account creation endpoint
    #[serde(rename = "new-reg")]
    pub new_reg: String,

    /// Certificate application endpoint
    #[serde(rename = "new-app")]
    pub new_app: String,

    /// Account key replacement endpoint
    #[serde(rename = "key-change")]
    pub key_change: String,

    /// Certificate revocation endpoint
    #[serde(rename = "revoke-cert")]
    pub revoke_cert: String,

    /// Directory metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

/// Directory metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryMeta {
    /// Terms of service URL
    #[serde(rename = "terms-of-service", skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
}

impl Directory {
    /// Build the directory for a server rooted at `base` (no trailing slash)
    pub fn for_base(base: &str, terms_of_service: Option<String>) -> Self {
        Self {
            directory: format!("{}/directory", base),
            new_reg: format!("{}/new-reg", base),
            new_app: format!("{}/new-app", base),
            key_change: format!("{}/key-change", base),
            revoke_cert: format!("{}/revoke-cert", base),
            meta: terms_of_service.map(|url| DirectoryMeta {
                terms_of_service: Some(url),
            }),
        }
    }

    /// Terms-of-service URL, when advertised
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|m| m.terms_of_service.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_keys_are_dashed() {
        let dir = Directory::for_base("https://ca.example/acme", None);
        let value = serde_json::to_value(&dir).unwrap();
        assert_eq!(value["new-reg"], "https://ca.example/acme/new-reg");
        assert_eq!(value["new-app"], "https://ca.example/acme/new-app");
        assert_eq!(value["key-change"], "https://ca.example/acme/key-change");
        assert_eq!(value["revoke-cert"], "https://ca.example/acme/revoke-cert");
        assert!(value.get("meta").is_none());
    }

    #[test]
    fn test_meta_terms_of_service() {
        let dir = Directory::for_base(
            "https://ca.example/acme",
            Some("https://ca.example/terms".to_string()),
        );
        assert_eq!(dir.terms_of_service(), Some("https://ca.example/terms"));

        let round: Directory =
            serde_json::from_value(serde_json::to_value(&dir).unwrap()).unwrap();
        assert_eq!(round.terms_of_service(), Some("https://ca.example/terms"));
    }
}
