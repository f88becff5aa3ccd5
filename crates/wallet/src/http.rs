//! `HttpClient` over reqwest.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;
use wallet_core::{CoreError, CoreResult, HttpClient, HttpResponse};

use crate::error::{RootError, RootResult};

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> RootResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wallet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RootError::Config(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    async fn into_response(response: reqwest::Response) -> CoreResult<HttpResponse> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(http_error)?.to_vec();
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

fn http_error(e: reqwest::Error) -> CoreError {
    CoreError::Http(e.to_string())
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> CoreResult<HttpResponse> {
        debug!(url = %url, "GET");
        let response = self.client.get(url).send().await.map_err(http_error)?;
        Self::into_response(response).await
    }

    async fn post_form(&self, url: &str, fields: &[(String, String)]) -> CoreResult<HttpResponse> {
        debug!(url = %url, fields = fields.len(), "POST form");
        let response = self
            .client
            .post(url)
            .form(fields)
            .send()
            .await
            .map_err(http_error)?;
        Self::into_response(response).await
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> CoreResult<HttpResponse> {
        debug!(url = %url, "POST json");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(http_error)?;
        Self::into_response(response).await
    }
}
