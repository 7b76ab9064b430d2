// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The `Publisher` RPC service.
//!
//! Clients send a leaf certificate (or precertificate) along with the log to submit it to. The
//! publisher finds the bundle registered for the leaf's issuer, builds the complete chain, and
//! hands it to a [`LogClient`], which returns the log's Signed Certificate Timestamp.

use std::{fmt::Debug, future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    bundle::BundleRegistry,
    clock::Clock,
    issuance::Certificate,
    observability::Metrics,
    protocol::ServerError,
    server::{Reply, Request, Service, ServiceFuture},
};

/// The service name clients address and the key of its transport configuration entry.
pub const PUBLISHER_SERVICE: &str = "Publisher";
pub const SUBMIT_TO_SINGLE_CT: &str = "SubmitToSingleCT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionKind {
    Final,
    Precert,
}

impl SubmissionKind {
    fn label(self) -> &'static str {
        match self {
            SubmissionKind::Final => "final",
            SubmissionKind::Precert => "precert",
        }
    }
}

/// The JSON body of a `SubmitToSingleCT` request. The DER-encoded leaf is the binary payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitToSingleCtRequest {
    /// The log's submission URL.
    pub url: String,
    /// The log's base64-encoded public key.
    pub public_key: String,
    pub kind: SubmissionKind,
}

/// A chain ready to be sent to a log.
#[derive(Debug, Clone)]
pub struct Submission {
    pub url: String,
    pub public_key: String,
    pub kind: SubmissionKind,
    /// The leaf followed by the issuer's CT bundle, DER-encoded.
    pub chain: Vec<Vec<u8>>,
    pub user_agent: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The log could not be reached, or no client is available to reach it.
    #[error("{0}")]
    Unavailable(String),
    /// The log answered, but did not return an SCT.
    #[error("{0}")]
    Rejected(String),
}

impl From<LogError> for ServerError {
    fn from(error: LogError) -> Self {
        match error {
            LogError::Unavailable(reason) => ServerError::LogClientUnavailable(reason),
            LogError::Rejected(reason) => ServerError::Submission(reason),
        }
    }
}

pub type LogFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, LogError>> + Send + 'a>>;

/// Submits chains to CT logs.
pub trait LogClient: Send + Sync + Debug {
    /// Submit the chain and return the serialized SCT.
    fn submit(&self, submission: Submission) -> LogFuture<'_>;
}

/// A [`LogClient`] for deployments without one; every submission fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredLogClient;

impl LogClient for UnconfiguredLogClient {
    fn submit(&self, submission: Submission) -> LogFuture<'_> {
        Box::pin(async move {
            Err(LogError::Unavailable(format!(
                "no client is configured to submit to {}",
                submission.url
            )))
        })
    }
}

/// The publisher service.
#[derive(Debug, Clone)]
pub struct Publisher {
    bundles: Arc<BundleRegistry>,
    user_agent: String,
    log_client: Arc<dyn LogClient>,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    pub fn new(
        bundles: Arc<BundleRegistry>,
        user_agent: String,
        log_client: Arc<dyn LogClient>,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bundles,
            user_agent,
            log_client,
            metrics,
            clock,
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Submit `leaf` to a single log and return the SCT.
    #[instrument(skip_all, err, fields(log = %request.url, kind = ?request.kind))]
    pub async fn submit_to_single_ct(
        &self,
        request: SubmitToSingleCtRequest,
        leaf: &[u8],
    ) -> Result<Bytes, ServerError> {
        let kind = request.kind.label();
        let count = |status: &str| {
            self.metrics
                .submissions
                .with_label_values(&[&request.url, kind, status])
                .inc()
        };

        if leaf.is_empty() {
            return Err(ServerError::BadRequest(
                "the certificate must be sent as the binary payload".to_string(),
            ));
        }
        let leaf = Certificate::from_der(leaf).map_err(|error| {
            tracing::info!(%error, "Submitted certificate could not be parsed");
            ServerError::MalformedCertificate
        })?;
        let issuer = leaf
            .issuer_name_id()
            .map_err(|_| ServerError::MalformedCertificate)?;
        let Some(bundle) = self.bundles.get(&issuer) else {
            count("unknown_issuer");
            return Err(ServerError::UnknownIssuer(issuer.to_string()));
        };

        let submission = Submission {
            url: request.url.clone(),
            public_key: request.public_key.clone(),
            kind: request.kind,
            chain: bundle.chain_for(leaf.der()),
            user_agent: self.user_agent.clone(),
        };
        let started = self.clock.now();
        let result = self.log_client.submit(submission).await;
        self.metrics
            .submission_latency
            .with_label_values(&[&request.url, kind])
            .observe(self.clock.since(started).as_secs_f64());

        match result {
            Ok(sct) => {
                count("ok");
                tracing::info!(issuer = %issuer, "Submitted certificate");
                Ok(sct)
            }
            Err(error) => {
                count("error");
                Err(error.into())
            }
        }
    }
}

impl Service for Publisher {
    fn name(&self) -> &'static str {
        PUBLISHER_SERVICE
    }

    fn call(&self, request: Request) -> Option<ServiceFuture<'_>> {
        if request.method != SUBMIT_TO_SINGLE_CT {
            return None;
        }
        Some(Box::pin(async move {
            let body = serde_json::from_value::<SubmitToSingleCtRequest>(request.body)
                .map_err(|error| ServerError::BadRequest(error.to_string()))?;
            let sct = self.submit_to_single_ct(body, &request.binary).await?;
            Ok(Reply {
                body: serde_json::json!({}),
                binary: Some(sct),
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ct_publisher_test::certs;

    use super::*;
    use crate::clock::FakeClock;

    #[derive(Debug, Default)]
    struct RecordingLogClient {
        submissions: Mutex<Vec<Submission>>,
    }

    impl LogClient for RecordingLogClient {
        fn submit(&self, submission: Submission) -> LogFuture<'_> {
            Box::pin(async move {
                self.submissions.lock().unwrap().push(submission);
                Ok(Bytes::from_static(b"an sct"))
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        publisher: Publisher,
        log_client: Arc<RecordingLogClient>,
        intermediate: certs::Issuer,
        metrics: Metrics,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let chain = certs::write_chain(dir.path(), "publisher", 0)?;
        let registry = BundleRegistry::from_chains(Some(&[chain.paths][..]))?;
        let log_client = Arc::new(RecordingLogClient::default());
        let metrics = Metrics::new()?;
        let publisher = Publisher::new(
            Arc::new(registry),
            crate::DEFAULT_USER_AGENT.to_string(),
            log_client.clone(),
            metrics.clone(),
            Arc::new(FakeClock::default()),
        );
        Ok(Fixture {
            _dir: dir,
            publisher,
            log_client,
            intermediate: chain.intermediate,
            metrics,
        })
    }

    fn request(kind: SubmissionKind) -> SubmitToSingleCtRequest {
        SubmitToSingleCtRequest {
            url: "https://ct.example.com/2025/".to_string(),
            public_key: "bG9nIGtleQ==".to_string(),
            kind,
        }
    }

    #[tokio::test]
    async fn submits_leaf_with_bundle() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let leaf = certs::leaf("example.com", &fixture.intermediate)?.cert.to_der()?;

        let sct = fixture
            .publisher
            .submit_to_single_ct(request(SubmissionKind::Precert), &leaf)
            .await?;
        assert_eq!(sct.as_ref(), b"an sct");

        let submissions = fixture.log_client.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        let submission = &submissions[0];
        assert_eq!(submission.chain.len(), 3);
        assert_eq!(submission.chain[0], leaf);
        assert_eq!(submission.chain[1], fixture.intermediate.cert.to_der()?);
        assert_eq!(submission.user_agent, "certificate-transparency-go/1.0");
        assert_eq!(submission.kind, SubmissionKind::Precert);
        assert!(fixture.metrics.encode_text()?.contains(
            r#"ct_publisher_submissions_total{kind="precert",log="https://ct.example.com/2025/",status="ok"} 1"#
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_issuer() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let stranger = certs::root("Stranger Root")?;
        let leaf = certs::leaf("example.com", &stranger)?.cert.to_der()?;

        let error = fixture
            .publisher
            .submit_to_single_ct(request(SubmissionKind::Final), &leaf)
            .await
            .unwrap_err();
        assert!(matches!(error, ServerError::UnknownIssuer(_)));
        assert!(fixture.log_client.submissions.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_and_missing_certificates() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let error = fixture
            .publisher
            .submit_to_single_ct(request(SubmissionKind::Final), b"not DER")
            .await
            .unwrap_err();
        assert_eq!(error, ServerError::MalformedCertificate);

        let error = fixture
            .publisher
            .submit_to_single_ct(request(SubmissionKind::Final), b"")
            .await
            .unwrap_err();
        assert!(matches!(error, ServerError::BadRequest(_)));
        Ok(())
    }

    #[tokio::test]
    async fn unconfigured_log_client() -> anyhow::Result<()> {
        let error = UnconfiguredLogClient
            .submit(Submission {
                url: "https://ct.example.com/".to_string(),
                public_key: String::new(),
                kind: SubmissionKind::Final,
                chain: vec![],
                user_agent: String::new(),
            })
            .await
            .unwrap_err();
        let error = ServerError::from(error);
        assert!(matches!(error, ServerError::LogClientUnavailable(_)));
        assert!(error.to_string().contains("https://ct.example.com/"));
        Ok(())
    }

    #[tokio::test]
    async fn service_dispatch() -> anyhow::Result<()> {
        let fixture = fixture()?;
        let leaf = certs::leaf("example.com", &fixture.intermediate)?.cert.to_der()?;

        let request = Request {
            method: SUBMIT_TO_SINGLE_CT.to_string(),
            body: serde_json::to_value(request(SubmissionKind::Final))?,
            binary: Bytes::from(leaf),
        };
        let reply = fixture
            .publisher
            .call(request)
            .expect("the method exists")
            .await?;
        assert_eq!(reply.binary.as_deref(), Some(&b"an sct"[..]));

        let request = Request {
            method: SUBMIT_TO_SINGLE_CT.to_string(),
            body: serde_json::json!({"url": "https://ct.example.com/"}),
            binary: Bytes::new(),
        };
        let error = fixture.publisher.call(request).unwrap().await.unwrap_err();
        assert!(matches!(error, ServerError::BadRequest(_)));

        let request = Request {
            method: "SubmitToAllCT".to_string(),
            body: serde_json::json!({}),
            binary: Bytes::new(),
        };
        assert!(fixture.publisher.call(request).is_none());
        Ok(())
    }
}
