//! Mock ACME collaborators for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::acme::{
    AccountKey, AcmeError, AcmeIdentifier, AcmeOrder, AcmeProblem, AcmeRenewalInfo, AcmeService,
    AcmeServiceProvider, AuthorizationFulfiller, AuthorizationStatus, CsrBuilder, NewOrderRequest,
    OrderStatus,
};
use crate::order::Certificate;

/// A recorded call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcmeCall {
    NewOrder(NewOrderRequest),
    GetOrder(String),
    Finalize { url: String, csr_der: Vec<u8> },
    Download {
        url: String,
        preferred_root_cn: Option<String>,
    },
    RenewalInfo,
}

/// Mock implementation of the AcmeService trait.
///
/// `get_order` walks through a scripted list of statuses and keeps
/// repeating the last one:
///
/// ```rust,ignore
/// let acme = MockAcmeService::new();
/// acme.script_statuses([OrderStatus::Pending, OrderStatus::Ready, OrderStatus::Valid]).await;
/// acme.set_certificate_pem(pem).await;
/// ```
#[derive(Debug)]
pub struct MockAcmeService {
    statuses: Arc<RwLock<VecDeque<OrderStatus>>>,
    certificate_pem: Arc<RwLock<String>>,
    /// If set, every `get_order` fails with this error.
    get_order_error: Arc<RwLock<Option<AcmeError>>>,
    /// If set, every `finalize_order` fails with this error.
    finalize_error: Arc<RwLock<Option<AcmeError>>>,
    renewal_info: Arc<RwLock<Result<AcmeRenewalInfo, AcmeError>>>,
    ari: AtomicBool,
    calls: Arc<RwLock<Vec<AcmeCall>>>,
    order_counter: AtomicU64,
}

impl Default for MockAcmeService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAcmeService {
    /// Create a mock that reports every order `pending`.
    pub fn new() -> Self {
        Self {
            statuses: Arc::new(RwLock::new(VecDeque::from([OrderStatus::Pending]))),
            certificate_pem: Arc::new(RwLock::new(String::new())),
            get_order_error: Arc::new(RwLock::new(None)),
            finalize_error: Arc::new(RwLock::new(None)),
            renewal_info: Arc::new(RwLock::new(Err(AcmeError::Unsupported(
                "renewalInfo".to_string(),
            )))),
            ari: AtomicBool::new(false),
            calls: Arc::new(RwLock::new(Vec::new())),
            order_counter: AtomicU64::new(0),
        }
    }

    /// Statuses returned by successive `get_order` calls.
    pub async fn script_statuses(&self, statuses: impl IntoIterator<Item = OrderStatus>) {
        *self.statuses.write().await = statuses.into_iter().collect();
    }

    pub async fn set_certificate_pem(&self, pem: impl Into<String>) {
        *self.certificate_pem.write().await = pem.into();
    }

    pub async fn set_get_order_error(&self, error: Option<AcmeError>) {
        *self.get_order_error.write().await = error;
    }

    pub async fn set_finalize_error(&self, error: Option<AcmeError>) {
        *self.finalize_error.write().await = error;
    }

    pub fn set_supports_ari(&self, supported: bool) {
        self.ari.store(supported, Ordering::SeqCst);
    }

    pub async fn set_renewal_info(&self, info: Result<AcmeRenewalInfo, AcmeError>) {
        *self.renewal_info.write().await = info;
    }

    /// All recorded calls.
    pub async fn calls(&self) -> Vec<AcmeCall> {
        self.calls.read().await.clone()
    }

    /// Number of recorded `get_order` calls.
    pub async fn get_order_count(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|call| matches!(call, AcmeCall::GetOrder(_)))
            .count()
    }

    /// Recorded `new_order` requests.
    pub async fn new_order_requests(&self) -> Vec<NewOrderRequest> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                AcmeCall::NewOrder(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn clear_recorded(&self) {
        self.calls.write().await.clear();
    }

    async fn record(&self, call: AcmeCall) {
        self.calls.write().await.push(call);
    }

    async fn next_status(&self) -> OrderStatus {
        let mut statuses = self.statuses.write().await;
        if statuses.len() > 1 {
            statuses.pop_front().unwrap_or(OrderStatus::Pending)
        } else {
            statuses.front().copied().unwrap_or(OrderStatus::Pending)
        }
    }

    fn order_at(location: &str, status: OrderStatus, identifiers: Vec<AcmeIdentifier>) -> AcmeOrder {
        AcmeOrder {
            location: location.to_string(),
            status,
            expires: None,
            identifiers,
            authorizations: vec![format!("{}/authz", location)],
            finalize: format!("{}/finalize", location),
            certificate: (status == OrderStatus::Valid).then(|| format!("{}/cert", location)),
            error: (status == OrderStatus::Invalid).then(|| AcmeProblem {
                problem_type: "urn:ietf:params:acme:error:unauthorized".to_string(),
                detail: "challenge failed".to_string(),
                status: Some(403),
            }),
        }
    }
}

#[async_trait]
impl AcmeService for MockAcmeService {
    async fn new_order(
        &self,
        request: &NewOrderRequest,
        _account: &AccountKey,
    ) -> Result<AcmeOrder, AcmeError> {
        self.record(AcmeCall::NewOrder(request.clone())).await;
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Self::order_at(
            &format!("https://ca.test/order/{}", n),
            OrderStatus::Pending,
            request.identifiers.clone(),
        ))
    }

    async fn get_order(
        &self,
        location: &str,
        _account: &AccountKey,
    ) -> Result<AcmeOrder, AcmeError> {
        self.record(AcmeCall::GetOrder(location.to_string())).await;
        if let Some(error) = self.get_order_error.read().await.clone() {
            return Err(error);
        }
        let status = self.next_status().await;
        Ok(Self::order_at(location, status, Vec::new()))
    }

    async fn finalize_order(
        &self,
        finalize_url: &str,
        csr_der: &[u8],
        _account: &AccountKey,
    ) -> Result<AcmeOrder, AcmeError> {
        self.record(AcmeCall::Finalize {
            url: finalize_url.to_string(),
            csr_der: csr_der.to_vec(),
        })
        .await;
        if let Some(error) = self.finalize_error.read().await.clone() {
            return Err(error);
        }
        let location = finalize_url.trim_end_matches("/finalize");
        Ok(Self::order_at(location, OrderStatus::Processing, Vec::new()))
    }

    async fn download_certificate(
        &self,
        certificate_url: &str,
        _account: &AccountKey,
        preferred_root_cn: Option<&str>,
    ) -> Result<String, AcmeError> {
        self.record(AcmeCall::Download {
            url: certificate_url.to_string(),
            preferred_root_cn: preferred_root_cn.map(str::to_string),
        })
        .await;
        Ok(self.certificate_pem.read().await.clone())
    }

    fn supports_ari(&self) -> bool {
        self.ari.load(Ordering::SeqCst)
    }

    async fn get_renewal_info(&self, _cert_pem: &str) -> Result<AcmeRenewalInfo, AcmeError> {
        self.record(AcmeCall::RenewalInfo).await;
        self.renewal_info.read().await.clone()
    }
}

/// Mock implementation of the AcmeServiceProvider trait. Every server id
/// resolves to the same service unless marked unknown.
#[derive(Debug, Clone)]
pub struct MockAcmeProvider {
    service: Arc<MockAcmeService>,
    unknown_server: Option<i64>,
}

impl MockAcmeProvider {
    pub fn new(service: Arc<MockAcmeService>) -> Self {
        Self {
            service,
            unknown_server: None,
        }
    }

    /// Make `acme_service` fail for one server id.
    pub fn with_unknown_server(mut self, acme_server_id: i64) -> Self {
        self.unknown_server = Some(acme_server_id);
        self
    }
}

impl AcmeServiceProvider for MockAcmeProvider {
    fn acme_service(&self, acme_server_id: i64) -> Result<Arc<dyn AcmeService>, AcmeError> {
        if self.unknown_server == Some(acme_server_id) {
            return Err(AcmeError::UnknownServer(acme_server_id));
        }
        Ok(Arc::clone(&self.service) as Arc<dyn AcmeService>)
    }
}

/// Mock implementation of the AuthorizationFulfiller trait.
#[derive(Debug)]
pub struct MockAuthorizations {
    result: Arc<RwLock<Result<AuthorizationStatus, AcmeError>>>,
    calls: Arc<RwLock<Vec<Vec<String>>>>,
}

impl Default for MockAuthorizations {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAuthorizations {
    /// Create a mock that reports every authorization valid.
    pub fn new() -> Self {
        Self {
            result: Arc::new(RwLock::new(Ok(AuthorizationStatus::Valid))),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn set_result(&self, result: Result<AuthorizationStatus, AcmeError>) {
        *self.result.write().await = result;
    }

    /// Authorization URLs of each recorded call.
    pub async fn calls(&self) -> Vec<Vec<String>> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl AuthorizationFulfiller for MockAuthorizations {
    async fn fulfill_auths(
        &self,
        authorization_urls: &[String],
        _account: &AccountKey,
        _service: &dyn AcmeService,
    ) -> Result<AuthorizationStatus, AcmeError> {
        self.calls.write().await.push(authorization_urls.to_vec());
        self.result.read().await.clone()
    }
}

/// Mock implementation of the CsrBuilder trait. The CSR is the certificate
/// subject's bytes.
#[derive(Debug, Default)]
pub struct MockCsrBuilder {
    fail: AtomicBool,
}

impl MockCsrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl CsrBuilder for MockCsrBuilder {
    fn make_csr_der(&self, certificate: &Certificate) -> Result<Vec<u8>, AcmeError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AcmeError::Csr("mock failure".to_string()));
        }
        Ok(certificate.subject.as_bytes().to_vec())
    }
}
