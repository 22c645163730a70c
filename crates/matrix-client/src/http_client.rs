// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Thin wrapper around the HTTP layer.

use std::time::Duration;

use reqwest::{header::HeaderValue, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::error::{HttpError, MatrixError};

/// Extra room the server is given on top of a long-poll timeout before the
/// local socket gives up.
const LONG_POLL_GRACE: Duration = Duration::from_secs(30);

/// Default per-request timeout for everything that isn't a long poll.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub(crate) struct HttpClient {
    inner: reqwest::Client,
    homeserver: RwLock<Option<Url>>,
    access_token: RwLock<Option<String>>,
}

impl HttpClient {
    pub fn new() -> Result<Self, HttpError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(concat!("matrix-client/", env!("CARGO_PKG_VERSION"))),
        );

        let inner = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { inner, homeserver: RwLock::new(None), access_token: RwLock::new(None) })
    }

    pub async fn set_homeserver(&self, url: Url) {
        *self.homeserver.write().await = Some(url);
    }

    pub async fn homeserver(&self) -> Option<Url> {
        self.homeserver.read().await.clone()
    }

    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    async fn url_for(&self, path: &str) -> Result<Url, HttpError> {
        let base = self.homeserver.read().await.clone().ok_or(HttpError::AuthenticationRequired)?;
        Ok(base.join(path)?)
    }

    /// Send a request with a JSON body and parse a JSON response.
    ///
    /// `authenticated` requests fail early when no access token is known,
    /// so a logged out client never produces a stray 401 on the wire.
    pub async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
        authenticated: bool,
    ) -> Result<T, HttpError> {
        let url = self.url_for(path).await?;
        let mut request = self.inner.request(method.clone(), url).query(query);

        if authenticated {
            let token = self.access_token.read().await.clone();
            let token = token.ok_or(HttpError::AuthenticationRequired)?;
            request = request.bearer_auth(token);
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        // Long polls need the local timeout to outlast the server side one.
        if path.ends_with("/sync") {
            request = request.timeout(REQUEST_TIMEOUT + LONG_POLL_GRACE);
        }

        trace!(%method, path, "Sending request");
        let response = request.send().await?;

        Self::json_response(response).await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<T, HttpError> {
        self.request::<(), T>(Method::GET, path, query, None, authenticated).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HttpError> {
        self.request(Method::POST, path, &[], Some(body), true).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HttpError> {
        self.request(Method::PUT, path, &[], Some(body), true).await
    }

    /// Fetch a JSON document from an absolute URL, e.g. `.well-known`
    /// discovery on a domain that isn't the homeserver yet.
    pub async fn get_absolute<T: DeserializeOwned>(&self, url: Url) -> Result<T, HttpError> {
        let response = self.inner.get(url).send().await?;
        Self::json_response(response).await
    }

    /// Upload raw bytes to the media repository.
    pub async fn upload_media<T: DeserializeOwned>(
        &self,
        content_type: &str,
        filename: Option<&str>,
        data: Vec<u8>,
    ) -> Result<T, HttpError> {
        let url = self.url_for("/_matrix/media/r0/upload").await?;
        let token =
            self.access_token.read().await.clone().ok_or(HttpError::AuthenticationRequired)?;

        let mut query = Vec::new();
        if let Some(filename) = filename {
            query.push(("filename", filename));
        }

        let response = self
            .inner
            .post(url)
            .query(&query)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;

        Self::json_response(response).await
    }

    /// Download media bytes from `/_matrix/media/r0/download/<server>/<id>`.
    pub async fn download_media(&self, server: &str, media_id: &str) -> Result<Vec<u8>, HttpError> {
        let url = self.url_for(&format!("/_matrix/media/r0/download/{server}/{media_id}")).await?;
        let response = self.inner.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_from_body(status, response.bytes().await?.as_ref()));
        }

        Ok(response.bytes().await?.to_vec())
    }

    async fn json_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, HttpError> {
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            return Err(Self::error_from_body(status, bytes.as_ref()));
        }

        Ok(serde_json::from_slice(bytes.as_ref())?)
    }

    /// Prefer the structured Matrix error when the body carries one, fall
    /// back to the bare status code.
    fn error_from_body(status: StatusCode, body: &[u8]) -> HttpError {
        match serde_json::from_slice::<MatrixError>(body) {
            Ok(e) if !e.errcode.is_empty() => HttpError::Api(e),
            _ => HttpError::Server(status),
        }
    }
}
