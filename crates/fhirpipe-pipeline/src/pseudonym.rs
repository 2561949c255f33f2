//! Client for the pseudonymization service: one FHIR resource in, one
//! pseudonymized resource out.

use crate::transport::Transport;
use fhirpipe_core::error::PipelineError;
use fhirpipe_core::retry::classify_status;
use serde_json::Value;

pub struct PseudonymizerClient<'a> {
    transport: &'a Transport,
    endpoint: String,
}

impl<'a> PseudonymizerClient<'a> {
    pub fn new(transport: &'a Transport, base_url: &str) -> Self {
        PseudonymizerClient {
            transport,
            endpoint: format!("{}/$de-identify", base_url.trim_end_matches('/')),
        }
    }

    /// Sends a single resource (possibly a Bundle or Bundle chunk) and
    /// returns the transformed resource. The service may assign new
    /// identifiers; callers must not assume any id survives.
    pub fn pseudonymize(&self, resource: &Value) -> Result<Value, PipelineError> {
        let response = self.transport.post_json(&self.endpoint, resource, None)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(PipelineError::new(
                classify_status(status),
                "pseudonymization request rejected".to_string(),
            )
            .with_status(status));
        }
        response.json().map_err(|e| {
            PipelineError::non_transient(format!(
                "pseudonymization response is not valid JSON: {}",
                e
            ))
        })
    }
}
