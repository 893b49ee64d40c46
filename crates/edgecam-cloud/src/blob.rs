use std::{path::Path, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use edgecam_types::{
    config::{StorageConfig, ENV_BLOB_ACCOUNT_KEY, ENV_BLOB_ACCOUNT_NAME},
    EdgecamError, Result,
};
use tracing::info;

use crate::{signing::BlobRequest, upload_error, BlobPublisher};

const STORAGE_API_VERSION: &str = "2021-08-06";

/// Azure Blob Storage sink: one container, one blob name, overwritten on every upload.
pub struct AzureBlobPublisher {
    http: reqwest::Client,
    config: StorageConfig,
}

impl AzureBlobPublisher {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upload_timeout_secs))
            .build()
            .map_err(|err| EdgecamError::Network(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.account_name.is_some() && self.config.account_key.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        let account = self
            .config
            .account_name
            .as_deref()
            .ok_or(EdgecamError::ConfigMissing(ENV_BLOB_ACCOUNT_NAME))?;
        let key = self
            .config
            .account_key
            .as_deref()
            .ok_or(EdgecamError::ConfigMissing(ENV_BLOB_ACCOUNT_KEY))?;
        Ok((account, key))
    }

    fn blob_path(&self) -> String {
        format!("{}/{}", self.config.container, self.config.blob_name)
    }

    pub fn endpoint(&self, account: &str) -> String {
        format!(
            "https://{account}.blob.{}/{}",
            self.config.endpoint_suffix,
            self.blob_path()
        )
    }
}

#[async_trait]
impl BlobPublisher for AzureBlobPublisher {
    async fn upload(&self, path: &Path) -> Result<()> {
        let (account, key) = self.credentials()?;
        let body = tokio::fs::read(path)
            .await
            .map_err(|err| upload_error(format!("cannot read {}: {err}", path.display())))?;

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let blob_path = self.blob_path();
        let request = BlobRequest {
            method: "PUT",
            content_length: body.len(),
            content_type: "image/jpeg",
            ms_headers: vec![
                ("x-ms-blob-type", "BlockBlob".into()),
                ("x-ms-date", date.clone()),
                ("x-ms-version", STORAGE_API_VERSION.into()),
            ],
            account,
            path: &blob_path,
        };
        let authorization = request
            .authorization(key)
            .map_err(|err| upload_error(format!("cannot sign upload request: {err}")))?;
        let url = self.endpoint(account);
        let size = body.len();

        let response = self
            .http
            .put(&url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-date", date)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .header(reqwest::header::AUTHORIZATION, authorization)
            .body(body)
            .send()
            .await
            .map_err(|err| upload_error(format!("blob store unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(upload_error(format!(
                "blob store rejected upload ({status}): {}",
                detail.trim()
            )));
        }

        info!(url = %url, bytes = size, "Blob uploaded");
        Ok(())
    }

    fn public_url(&self) -> &str {
        &self.config.public_url
    }
}
