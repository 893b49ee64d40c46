//! Shared-key signatures for the blob service and IoT Hub SAS tokens.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use edgecam_types::{EdgecamError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Base64 HMAC-SHA256 of `message` under a base64-encoded account key.
pub fn sign(key_b64: &str, message: &str) -> Result<String> {
    let key = BASE64
        .decode(key_b64.trim())
        .map_err(|err| EdgecamError::Configuration(format!("access key is not base64: {err}")))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|err| EdgecamError::Configuration(format!("unusable access key: {err}")))?;
    mac.update(message.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

pub fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// `SharedAccessSignature` token for `resource_uri`, valid until `expiry` (unix seconds).
pub fn sas_token(resource_uri: &str, key_b64: &str, expiry: i64) -> Result<String> {
    let encoded_uri = url_encode(resource_uri);
    let signature = sign(key_b64, &format!("{encoded_uri}\n{expiry}"))?;
    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}",
        url_encode(&signature)
    ))
}

/// Request fields that take part in a blob-service Shared Key signature.
#[derive(Debug, Clone)]
pub struct BlobRequest<'a> {
    pub method: &'a str,
    pub content_length: usize,
    pub content_type: &'a str,
    /// `x-ms-*` headers; order does not matter.
    pub ms_headers: Vec<(&'a str, String)>,
    pub account: &'a str,
    /// Path below the account, e.g. `webcam/picture`.
    pub path: &'a str,
}

impl BlobRequest<'_> {
    pub fn string_to_sign(&self) -> String {
        let content_length = if self.content_length == 0 {
            String::new()
        } else {
            self.content_length.to_string()
        };
        let standard = [
            self.method.to_string(),
            String::new(), // Content-Encoding
            String::new(), // Content-Language
            content_length,
            String::new(), // Content-MD5
            self.content_type.to_string(),
            String::new(), // Date (x-ms-date is used instead)
            String::new(), // If-Modified-Since
            String::new(), // If-Match
            String::new(), // If-None-Match
            String::new(), // If-Unmodified-Since
            String::new(), // Range
        ];

        let mut headers: Vec<(String, &str)> = self
            .ms_headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = standard.join("\n");
        out.push('\n');
        for (name, value) in headers {
            out.push_str(&name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('/');
        out.push_str(self.account);
        out.push('/');
        out.push_str(self.path);
        out
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self, key_b64: &str) -> Result<String> {
        let signature = sign(key_b64, &self.string_to_sign())?;
        Ok(format!("SharedKey {}:{signature}", self.account))
    }
}
