//! Shared blocking HTTP transport with a per-request retry budget.
//!
//! This layer retries individual requests on transient failures (network
//! errors, 5xx responses). It is deliberately separate from the
//! orchestrator's step-level retries: exhausting the request budget
//! surfaces one transient step error, which the user may then retry.

use fhirpipe_core::config::Config;
use fhirpipe_core::error::PipelineError;
use fhirpipe_core::retry::{backoff_delay, classify_status, pipeline_error_from_reqwest};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

pub struct Transport {
    client: Client,
    request_retries: u32,
    retry_backoff_ms: u64,
}

impl Transport {
    pub fn new(
        timeout: Duration,
        request_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::non_transient(format!("building HTTP client: {}", e)))?;
        Ok(Transport {
            client,
            request_retries,
            retry_backoff_ms,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        Transport::new(
            config.request_timeout(),
            config.http.request_retries,
            config.http.request_retry_backoff_ms,
        )
    }

    /// GET returning the response. Responses below 500 are handed back to
    /// the caller for interpretation; 5xx and network errors are retried
    /// within the request budget and then surfaced as transient.
    pub fn get(&self, url: &str, auth: Option<&BasicAuth>) -> Result<Response, PipelineError> {
        self.execute(|| self.apply_auth(self.client.get(url), auth))
    }

    /// POST with a JSON body.
    pub fn post_json(
        &self,
        url: &str,
        body: &Value,
        auth: Option<&BasicAuth>,
    ) -> Result<Response, PipelineError> {
        self.execute(|| self.apply_auth(self.client.post(url).json(body), auth))
    }

    /// POST with a raw body and explicit content type.
    pub fn post_bytes(
        &self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
        auth: Option<&BasicAuth>,
    ) -> Result<Response, PipelineError> {
        self.execute(|| {
            self.apply_auth(
                self.client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(body.clone()),
                auth,
            )
        })
    }

    /// Streams a GET body into `dst`, reporting cumulative bytes through
    /// `progress`. The request (up to response headers) participates in the
    /// retry budget; once the body stream has started, an error aborts the
    /// call and the caller is responsible for discarding partial output.
    pub fn download(
        &self,
        url: &str,
        auth: Option<&BasicAuth>,
        dst: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, PipelineError> {
        let mut response = self.get(url, auth)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(PipelineError::new(
                classify_status(status),
                format!("download of {} failed", url),
            )
            .with_status(status));
        }

        let mut written: u64 = 0;
        let mut buf = [0u8; 8192];
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| PipelineError::transient(format!("reading download stream: {}", e)))?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])
                .map_err(|e| PipelineError::non_transient(format!("writing download: {}", e)))?;
            written += n as u64;
            progress(written);
        }
        Ok(written)
    }

    fn apply_auth(&self, builder: RequestBuilder, auth: Option<&BasicAuth>) -> RequestBuilder {
        match auth {
            Some(auth) => builder.basic_auth(&auth.username, Some(&auth.password)),
            None => builder,
        }
    }

    /// Runs the request, retrying transient failures. The closure rebuilds
    /// the request for every attempt.
    fn execute<F>(&self, build: F) -> Result<Response, PipelineError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = None;
        for attempt in 0..=self.request_retries {
            if attempt > 0 {
                thread::sleep(backoff_delay(
                    attempt - 1,
                    self.retry_backoff_ms,
                    self.retry_backoff_ms * 16,
                ));
            }
            match build().send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        last_error = Some(
                            PipelineError::transient(format!(
                                "server error from {}",
                                response.url()
                            ))
                            .with_status(status.as_u16()),
                        );
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let pe = pipeline_error_from_reqwest(&e);
                    if !pe.is_transient() {
                        return Err(pe);
                    }
                    last_error = Some(pe);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| PipelineError::transient("request failed with no attempts made")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn test_transport() -> Transport {
        Transport::new(Duration::from_secs(5), 3, 1).unwrap()
    }

    #[test]
    fn retries_5xx_then_succeeds() {
        let server = MockServer::start();
        let mut fail = server.mock(|when, then| {
            when.method(GET).path("/data");
            then.status(503);
        });
        let transport = test_transport();

        let err = transport.get(&server.url("/data"), None).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.http_status, 503);
        assert_eq!(fail.hits(), 4); // initial attempt + 3 retries
        fail.delete();

        server.mock(|when, then| {
            when.method(GET).path("/data");
            then.status(200).body("ok");
        });
        let response = transport.get(&server.url("/data"), None).unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[test]
    fn does_not_retry_4xx() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404);
        });
        let transport = test_transport();
        let response = transport.get(&server.url("/missing"), None).unwrap();
        assert_eq!(response.status().as_u16(), 404);
        assert_eq!(mock.hits(), 1);
    }

    #[test]
    fn download_streams_body_and_reports_progress() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/file.ndjson");
            then.status(200).body("{\"a\":1}\n{\"a\":2}\n");
        });
        let transport = test_transport();
        let mut out = Vec::new();
        let mut last_seen = 0u64;
        let written = transport
            .download(&server.url("/file.ndjson"), None, &mut out, &mut |n| {
                last_seen = n
            })
            .unwrap();
        assert_eq!(written, 16);
        assert_eq!(last_seen, 16);
        assert_eq!(out, b"{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn connection_refused_is_transient() {
        // Port 9 (discard) is not listening.
        let transport = Transport::new(Duration::from_secs(1), 1, 1).unwrap();
        let err = transport.get("http://127.0.0.1:9/x", None).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn post_json_hands_4xx_back_to_the_caller() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/things");
            then.status(409);
        });
        let transport = test_transport();
        let response = transport
            .post_json(&server.url("/things"), &serde_json::json!({"a": 1}), None)
            .unwrap();
        assert_eq!(response.status().as_u16(), 409);
        assert_eq!(mock.hits(), 1);
    }

    #[test]
    fn sends_basic_auth_when_given() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/secure")
                .header("authorization", "Basic dXNlcjpwYXNz");
            then.status(200);
        });
        let transport = test_transport();
        let auth = BasicAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let response = transport.get(&server.url("/secure"), Some(&auth)).unwrap();
        assert_eq!(response.status().as_u16(), 200);
        mock.assert();
    }
}
