use async_trait::async_trait;
use thiserror::Error;

use crate::catalog::ModelSpec;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("generation provider not configured: {0}")]
    NotConfigured(String),

    #[error("generation provider rejected the request ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error(transparent)]
    Request(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct GenerationRequest<'a> {
    pub model: &'a ModelSpec,
    pub prompt: &'a str,
    pub image_urls: &'a [String],
    pub aspect_ratio: Option<&'a str>,
    pub callback_url: &'a str,
}

/// Vendor-side view of a job, from a callback or a status query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VendorOutcome {
    /// Accepted by the vendor: queued or running.
    Processing,
    Succeeded { urls: Vec<String> },
    Failed { message: String },
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submits a job and returns the vendor-assigned task id.
    async fn create_task(&self, request: GenerationRequest<'_>) -> Result<String, ProviderError>;

    async fn query_task(
        &self,
        model: &ModelSpec,
        task_id: &str,
    ) -> Result<VendorOutcome, ProviderError>;
}

#[cfg(test)]
pub mod fake {
    use std::{collections::HashMap, sync::atomic::{AtomicUsize, Ordering}};

    use parking_lot::Mutex;

    use super::*;

    /// Deterministic provider: task ids are `fake-<n>`, outcomes are scripted.
    #[derive(Default)]
    pub struct FakeProvider {
        counter: AtomicUsize,
        reject: Mutex<Option<String>>,
        outcomes: Mutex<HashMap<String, VendorOutcome>>,
        pub requests: Mutex<Vec<(String, String, Vec<String>)>>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reject_with(&self, message: &str) {
            *self.reject.lock() = Some(message.to_string());
        }

        pub fn set_outcome(&self, task_id: &str, outcome: VendorOutcome) {
            self.outcomes.lock().insert(task_id.to_string(), outcome);
        }
    }

    #[async_trait]
    impl GenerationProvider for FakeProvider {
        async fn create_task(
            &self,
            request: GenerationRequest<'_>,
        ) -> Result<String, ProviderError> {
            if let Some(message) = self.reject.lock().clone() {
                return Err(ProviderError::Rejected { code: 500, message });
            }
            self.requests.lock().push((
                request.model.vendor_model.to_string(),
                request.prompt.to_string(),
                request.image_urls.to_vec(),
            ));
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("fake-{n}"))
        }

        async fn query_task(
            &self,
            _model: &ModelSpec,
            task_id: &str,
        ) -> Result<VendorOutcome, ProviderError> {
            Ok(self
                .outcomes
                .lock()
                .get(task_id)
                .cloned()
                .unwrap_or(VendorOutcome::Processing))
        }
    }
}
