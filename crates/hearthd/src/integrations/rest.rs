//! Generic JSON-over-HTTP polling source.

use std::marker::PhantomData;

use async_trait::async_trait;
use hearthd_coordinator::DataSource;
use hearthd_coordinator::FetchError;
use reqwest::Client;
use reqwest::StatusCode;
use reqwest::Url;
use serde::de::DeserializeOwned;

/// Fetches `T` by GETting a URL and decoding the JSON body.
pub struct RestSource<T> {
    client: Client,
    url: Url,
    token: Option<String>,
    _data: PhantomData<fn() -> T>,
}

impl<T> RestSource<T> {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            token: None,
            _data: PhantomData,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl<T> DataSource for RestSource<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    type Data = T;

    async fn fetch(&self) -> Result<T, FetchError> {
        tracing::trace!(url = %self.url, "Polling REST endpoint");

        let mut request = self.client.get(self.url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::failed(format!("request to {} failed: {}", self.url, e)))?;

        match response.status() {
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                return Err(FetchError::auth_failed(format!("{} returned {}", self.url, status)));
            }
            status if !status.is_success() => {
                return Err(FetchError::failed(format!("{} returned {}", self.url, status)));
            }
            _ => {}
        }

        response
            .json()
            .await
            .map_err(|e| FetchError::failed(format!("invalid response from {}: {}", self.url, e)))
    }
}
