use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::acme::{AccountKey, AcmeProblem, OrderStatus};
use crate::renewal::RenewalInfo;

/// A stored private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKey {
    pub id: i64,
    pub name: String,
    pub pem: String,
    pub api_key: String,
}

/// An ACME account registered with one ACME server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeAccount {
    pub id: i64,
    pub name: String,
    pub acme_server_id: i64,
    /// Account URL assigned by the server.
    pub kid: String,
    pub key: PrivateKey,
}

impl AcmeAccount {
    pub fn account_key(&self) -> AccountKey {
        AccountKey {
            kid: self.kid.clone(),
            key_pem: self.key.pem.clone(),
        }
    }
}

/// What to run after a certificate is issued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessingSettings {
    /// Path to a script or binary.
    #[serde(default)]
    pub command: Option<String>,
    /// `NAME=value` entries added to the command's environment.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Host of the remote install agent.
    #[serde(default)]
    pub client_address: Option<String>,
    /// AES-256 key shared with the agent, base64url without padding.
    #[serde(default)]
    pub client_key_b64: Option<String>,
}

impl PostProcessingSettings {
    pub fn has_command(&self) -> bool {
        self.command.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    pub fn has_client(&self) -> bool {
        self.client_address.as_deref().is_some_and(|a| !a.is_empty())
            && self.client_key_b64.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// A locally managed certificate definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub id: i64,
    pub name: String,
    /// Common name.
    pub subject: String,
    pub subject_alt_names: Vec<String>,
    pub account: AcmeAccount,
    /// Key used for new orders.
    pub key: PrivateKey,
    /// Root CN of the preferred alternate chain, if any.
    pub preferred_root_cn: Option<String>,
    pub api_key: String,
    pub post_processing: PostProcessingSettings,
    pub updated_at: DateTime<Utc>,
}

impl Certificate {
    pub fn has_post_processing_to_do(&self) -> bool {
        self.post_processing.has_command() || self.post_processing.has_client()
    }

    /// Subject first, then the SANs that differ from it.
    pub fn dns_names(&self) -> Vec<String> {
        let mut names = vec![self.subject.clone()];
        for san in &self.subject_alt_names {
            if !names.contains(san) {
                names.push(san.clone());
            }
        }
        names
    }
}

/// One ACME order for a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: i64,
    pub certificate: Certificate,
    pub location: String,
    pub status: OrderStatus,
    pub known_revoked: bool,
    pub error: Option<AcmeProblem>,
    pub expires: Option<DateTime<Utc>>,
    pub dns_identifiers: Vec<String>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    /// Key the order was finalized with.
    pub finalized_key: Option<PrivateKey>,
    pub certificate_url: Option<String>,
    pub pem: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub renewal_info: Option<RenewalInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
