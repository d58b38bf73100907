//! Webhook Verification and Dispatch
//!
//! Signed gateway notifications are verified against the shared secret,
//! decoded into a [`GatewayEvent`] and handed to the [`OrderReconciler`].
//! Only an unverifiable request, an unparseable body or an exhausted
//! transient failure is reported back as an error; everything else is
//! acknowledged with a [`DispatchOutcome`].

use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{PaymentError, Result};
use crate::event::{DispatchOutcome, GatewayEvent};
use crate::reconciler::OrderReconciler;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and now
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Checks `t=<unix>,v1=<hex>` signature headers
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    #[must_use]
    pub const fn with_tolerance(mut self, seconds: i64) -> Self {
        self.tolerance_secs = seconds;
        self
    }

    /// Verify a payload against its signature header
    pub fn verify(&self, payload: &str, header: &str) -> Result<()> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    /// Verify as of a given unix time
    pub fn verify_at(&self, payload: &str, header: &str, now: i64) -> Result<()> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            PaymentError::Authentication("signature header has no timestamp".into())
        })?;
        if signatures.is_empty() {
            return Err(PaymentError::Authentication(
                "signature header has no v1 signature".into(),
            ));
        }
        // `t=` is unauthenticated here and may be any i64
        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            return Err(PaymentError::Authentication(format!(
                "timestamp {timestamp} outside tolerance"
            )));
        }

        let matched = signatures
            .into_iter()
            .filter_map(|s| hex::decode(s).ok())
            .any(|expected| {
                self.mac(timestamp, payload)
                    .is_ok_and(|mac| mac.verify_slice(&expected).is_ok())
            });
        if matched {
            Ok(())
        } else {
            Err(PaymentError::Authentication("no signature matches the payload".into()))
        }
    }

    /// Produce a header for `payload` (test deliveries and local tooling)
    pub fn sign(&self, payload: &str, timestamp: i64) -> Result<String> {
        let signature = hex::encode(self.mac(timestamp, payload)?.finalize().into_bytes());
        Ok(format!("t={timestamp},v1={signature}"))
    }

    fn mac(&self, timestamp: i64, payload: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| PaymentError::Config(format!("invalid webhook secret: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        Ok(mac)
    }
}

/// Verifies, decodes and routes webhook deliveries
pub struct WebhookDispatcher {
    verifier: WebhookVerifier,
    reconciler: Arc<OrderReconciler>,
}

impl WebhookDispatcher {
    pub fn new(verifier: WebhookVerifier, reconciler: Arc<OrderReconciler>) -> Self {
        Self { verifier, reconciler }
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    /// Handle one delivery
    pub async fn dispatch(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> Result<DispatchOutcome> {
        let verified = signature
            .ok_or_else(|| PaymentError::Authentication("missing signature header".into()))
            .and_then(|header| self.verifier.verify(payload, header));
        if let Err(error) = verified {
            tracing::warn!(security = true, error = %error, "Rejected webhook delivery");
            return Err(error);
        }

        let event = match GatewayEvent::from_json(payload) {
            Ok(event) => event,
            Err(PaymentError::Validation(reason)) => {
                tracing::warn!(reason = %reason, "Dropping webhook with unusable metadata");
                return Ok(DispatchOutcome::Dropped);
            }
            Err(error) => {
                tracing::warn!(error = %error, "Could not parse webhook payload");
                return Err(error);
            }
        };

        let kind = event.kind().to_string();
        tracing::info!(event_type = %kind, "Processing webhook");

        match self.reconciler.reconcile(event).await {
            Ok(outcome) => {
                tracing::info!(event_type = %kind, ?outcome, "Webhook handled");
                Ok(outcome)
            }
            Err(PaymentError::Validation(reason)) => {
                tracing::warn!(
                    event_type = %kind,
                    reason = %reason,
                    "Dropping webhook that matches no local records"
                );
                Ok(DispatchOutcome::Dropped)
            }
            Err(PaymentError::Conflict(reason)) => {
                tracing::info!(event_type = %kind, reason = %reason, "Webhook already reconciled");
                Ok(DispatchOutcome::Duplicate)
            }
            Err(error) if error.is_retryable() => {
                tracing::error!(
                    event_type = %kind,
                    error = %error,
                    "Webhook failed after retries; gateway will redeliver"
                );
                Err(error)
            }
            Err(error) => {
                tracing::error!(
                    event_type = %kind,
                    error = ?error,
                    payload_len = payload.len(),
                    "Webhook processing failed"
                );
                Ok(DispatchOutcome::Failed)
            }
        }
    }
}
