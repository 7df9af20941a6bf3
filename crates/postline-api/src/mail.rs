//! Outbound mail operations for the application.
//!
//! [`MailService`] is what business code calls: each method goes through the
//! resilient [`ProviderClient`], and a created piece is registered in the
//! status store so its webhooks have a row to update.

use std::sync::Arc;

use postline_core::{Clock, CoreError, ExternalId, MailStatus, StatusStore, StatusTranslator};
use postline_resilience::{
    client::{
        AddressInput, AddressVerification, CostEstimate, CostRequest, CreateMailRequest,
        MailObject,
    },
    retry_with_backoff, ProviderClient, ProviderError, RetryPolicy,
};
use thiserror::Error;
use tracing::{error, info, instrument};

/// Failure of an outbound mail operation.
#[derive(Debug, Error)]
pub enum MailError {
    /// The provider call failed or was refused locally.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The provider created the piece but it could not be recorded.
    #[error("mail piece {external_id} created but not recorded")]
    Registration {
        /// Provider id of the unrecorded piece.
        external_id: ExternalId,
        /// Store failure.
        #[source]
        source: CoreError,
    },
}

/// Provider operations plus local bookkeeping.
pub struct MailService {
    client: ProviderClient,
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    register_policy: RetryPolicy<CoreError>,
}

impl MailService {
    /// Creates a service over a configured client.
    pub fn new(client: ProviderClient, store: Arc<dyn StatusStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            store,
            clock,
            register_policy: RetryPolicy::webhook_processing()
                .with_retry_condition(CoreError::is_transient),
        }
    }

    /// Underlying provider client.
    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    /// Verifies a postal address with the provider.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::Provider`] when validation or the call fails.
    pub async fn verify_address(
        &self,
        address: &AddressInput,
    ) -> Result<AddressVerification, MailError> {
        Ok(self.client.verify_address(address).await?)
    }

    /// Asks the provider for a price quote.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::Provider`] when validation or the call fails.
    pub async fn calculate_cost(&self, request: &CostRequest) -> Result<CostEstimate, MailError> {
        Ok(self.client.calculate_cost(request).await?)
    }

    /// Creates a letter and records it as a tracked mail piece.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::Provider`] when creation fails, and
    /// [`MailError::Registration`] when the piece exists at the provider but
    /// the store kept failing.
    #[instrument(name = "send_letter", skip_all, fields(external_id = tracing::field::Empty))]
    pub async fn send_letter(&self, request: &CreateMailRequest) -> Result<MailObject, MailError> {
        let letter = self.client.create_mail_object(request).await?;
        tracing::Span::current().record("external_id", letter.id.as_str());

        let status = letter.status.as_deref().map_or(MailStatus::Submitted, StatusTranslator::map);
        retry_with_backoff(self.clock.as_ref(), &self.register_policy, || {
            self.store.register_mail_piece(&letter.id, status)
        })
        .await
        .map_err(|source| {
            error!(error = %source, "created mail piece could not be recorded");
            MailError::Registration { external_id: letter.id.clone(), source }
        })?;

        info!(status = %status, "mail piece created");
        Ok(letter)
    }

    /// Fetches a mail piece's current state from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::Provider`] when validation or the call fails.
    pub async fn fetch_status(&self, external_id: &ExternalId) -> Result<MailObject, MailError> {
        Ok(self.client.fetch_status(external_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use postline_core::{storage::mock::MockStatusStore, TestClock};
    use postline_resilience::{
        CircuitBreaker, CircuitConfig, ClientConfig, RateLimitGate, RetryExecutor,
    };
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn service(base_url: String, store: &MockStatusStore) -> MailService {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let breaker = Arc::new(CircuitBreaker::new(CircuitConfig::default(), clock.clone()));
        let gate = Arc::new(RateLimitGate::new(clock.clone()));
        let executor = Arc::new(RetryExecutor::new(breaker, gate, clock.clone()));
        let config = ClientConfig {
            base_url,
            api_key: "test_key".to_string(),
            timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        };
        let client = ProviderClient::new(config, executor).unwrap();
        MailService::new(client, Arc::new(store.clone()), clock)
    }

    fn letter_request() -> CreateMailRequest {
        CreateMailRequest::new(json!("adr_to"), json!("adr_from"), "https://files.test/doc.pdf")
    }

    #[tokio::test]
    async fn created_letter_is_registered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/letters"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "ltr_9", "status": "created"})),
            )
            .mount(&server)
            .await;
        let store = MockStatusStore::new();

        let letter = service(server.uri(), &store).send_letter(&letter_request()).await.unwrap();

        assert_eq!(letter.id.as_str(), "ltr_9");
        let piece = store.find_mail_piece(&letter.id).await.unwrap().unwrap();
        assert_eq!(piece.status, MailStatus::Submitted);
    }

    #[tokio::test]
    async fn failed_creation_registers_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/letters"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad file"))
            .mount(&server)
            .await;
        let store = MockStatusStore::new();

        let result = service(server.uri(), &store).send_letter(&letter_request()).await;

        assert!(matches!(result, Err(MailError::Provider(ProviderError::Client { .. }))));
        assert!(store.find_mail_piece(&ExternalId::new("ltr_9")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let store = MockStatusStore::new();
        let mut request = letter_request();
        request.file = String::new();

        let result = service(server.uri(), &store).send_letter(&request).await;

        assert!(matches!(result, Err(MailError::Provider(ProviderError::Validation { .. }))));
    }
}
