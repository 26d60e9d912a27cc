use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ACME order status (RFC 8555 §7.1.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    /// Anything else the server reports.
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
            OrderStatus::Unknown => "unknown",
        }
    }

    /// Parse a stored status string. Unrecognised values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => OrderStatus::Pending,
            "ready" => OrderStatus::Ready,
            "processing" => OrderStatus::Processing,
            "valid" => OrderStatus::Valid,
            "invalid" => OrderStatus::Invalid,
            _ => OrderStatus::Unknown,
        }
    }

    /// `valid` and `invalid` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Valid | OrderStatus::Invalid)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization status (RFC 8555 §7.1.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
    #[serde(other)]
    Unknown,
}

/// Identifier in an ACME order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeIdentifier {
    #[serde(rename = "type")]
    pub identifier_type: String,
    pub value: String,
}

impl AcmeIdentifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            identifier_type: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// Problem document attached to a failed order (RFC 7807).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeProblem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl std::fmt::Display for AcmeProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.problem_type, self.detail)
    }
}

/// Order object as returned by the ACME server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeOrder {
    /// Order URL. Comes from the `Location` header, not the body.
    #[serde(skip)]
    pub location: String,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub identifiers: Vec<AcmeIdentifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AcmeProblem>,
}

/// newOrder request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewOrderRequest {
    pub identifiers: Vec<AcmeIdentifier>,
    /// ARI identifier of the certificate this order replaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

/// Account credentials used to sign ACME requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKey {
    /// Account URL (`kid` in the JWS header).
    pub kid: String,
    pub key_pem: String,
}

/// Renewal window suggested by the CA or computed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// ARI response (draft-ietf-acme-ari).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeRenewalInfo {
    pub suggested_window: SuggestedWindow,
    #[serde(
        rename = "explanationURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub explanation_url: Option<String>,
    /// `Retry-After` header of the response, in seconds.
    #[serde(skip)]
    pub retry_after_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_deserialize() {
        let json = r#"{
            "status": "pending",
            "expires": "2026-01-01T00:00:00Z",
            "identifiers": [{"type": "dns", "value": "example.com"}],
            "authorizations": ["https://ca.test/authz/1"],
            "finalize": "https://ca.test/finalize/1"
        }"#;
        let order: AcmeOrder = serde_json::from_str(json).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.identifiers, vec![AcmeIdentifier::dns("example.com")]);
        assert_eq!(order.authorizations.len(), 1);
        assert!(order.certificate.is_none());
        assert!(order.location.is_empty());
    }

    #[test]
    fn test_unknown_status() {
        let json = r#"{"status": "deactivated", "finalize": "https://ca.test/f"}"#;
        let order: AcmeOrder = serde_json::from_str(json).unwrap();
        assert_eq!(order.status, OrderStatus::Unknown);
        assert!(!order.status.is_terminal());
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Ready,
            OrderStatus::Processing,
            OrderStatus::Valid,
            OrderStatus::Invalid,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), status);
        }
        assert_eq!(OrderStatus::parse("bogus"), OrderStatus::Unknown);
        assert!(OrderStatus::Valid.is_terminal());
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
    }

    #[test]
    fn test_renewal_info_deserialize() {
        let json = r#"{
            "suggestedWindow": {
                "start": "2025-01-02T04:00:00Z",
                "end": "2025-01-03T04:00:00Z"
            },
            "explanationURL": "https://ca.test/docs/ari"
        }"#;
        let info: AcmeRenewalInfo = serde_json::from_str(json).unwrap();
        assert!(info.suggested_window.start < info.suggested_window.end);
        assert_eq!(
            info.explanation_url.as_deref(),
            Some("https://ca.test/docs/ari")
        );
        assert!(info.retry_after_secs.is_none());
    }

    #[test]
    fn test_new_order_request_serialize() {
        let request = NewOrderRequest {
            identifiers: vec![AcmeIdentifier::dns("example.com")],
            replaces: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["identifiers"][0]["type"], "dns");
        assert!(json.get("replaces").is_none());
    }
}
