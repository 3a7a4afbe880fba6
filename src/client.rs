use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use tracing::debug;

use crate::api::{CreateResponse, ErrorBody, RetrieveResponse};
use crate::backends::RotationJob;

/// HTTP client for a running vault server
#[derive(Clone)]
pub struct VaultClient {
    client: Client,
    address: Url,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    username: &'a str,
    password: &'a str,
}

impl VaultClient {
    /// Create a new vault client
    pub fn new(address: String) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        let address = Url::parse(&address)
            .with_context(|| format!("Invalid vault server address: {}", address))?;
        anyhow::ensure!(
            !address.cannot_be_a_base(),
            "Invalid vault server address: {}",
            address
        );

        Ok(Self { client, address })
    }

    /// Append path segments to the server address, percent-encoding each one
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.address.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Invalid vault server address: {}", self.address))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Store a new credential
    pub async fn create(&self, username: &str, password: &str) -> Result<CreateResponse> {
        let url = self.url(&["create"])?;
        debug!("Creating credential at: {}", url);

        let response = self
            .client
            .post(url)
            .json(&CreateBody { username, password })
            .send()
            .await
            .context("Failed to send create request")?;

        Self::parse(response, StatusCode::CREATED).await
    }

    /// Fetch the current password; the server schedules its rotation
    pub async fn retrieve(&self, username: &str) -> Result<RetrieveResponse> {
        let url = self.url(&["retrieve", username])?;
        debug!("Retrieving credential from: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send retrieve request")?;

        Self::parse(response, StatusCode::OK).await
    }

    /// List rotation jobs for a username
    pub async fn history(&self, username: &str) -> Result<Vec<RotationJob>> {
        let url = self.url(&["rotations", username])?;
        debug!("Reading rotation history from: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send history request")?;

        Self::parse(response, StatusCode::OK).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: Response,
        expected: StatusCode,
    ) -> Result<T> {
        let status = response.status();
        if status != expected {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|error| error.message)
                .unwrap_or(body);
            anyhow::bail!("Vault request failed with status {}: {}", status, message);
        }

        response
            .json()
            .await
            .context("Failed to parse vault response")
    }
}
