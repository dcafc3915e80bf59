//! Sender side of the protocol.

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{from_response, ErrorBody};
use crate::trust::{crypto_provider, CapturedCertificate, TofuVerifier};
use lanvault_common::{Error, FileId, Result, SessionId, TransmissionId};
use lanvault_protocol::{
    FileInfo, PrepareUploadRequest, PrepareUploadResponse, RegisterRequest, RegisterResponse,
    UploadResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Describe a file for a prepare-upload request, including its SHA-256.
pub fn describe_file(
    id: FileId,
    file_name: impl Into<String>,
    file_type: impl Into<String>,
    data: &[u8],
) -> FileInfo {
    FileInfo {
        id,
        file_name: file_name.into(),
        size: data.len() as u64,
        file_type: file_type.into(),
        sha256: hex::encode(Sha256::digest(data)),
    }
}

/// HTTPS client for a single receiver.
pub struct SenderClient {
    http: reqwest::Client,
    base_url: String,
    captured: CapturedCertificate,
    pinned: Option<String>,
}

impl SenderClient {
    /// Client that accepts whatever certificate the receiver presents.
    /// The fingerprint is available from [`Self::peer_fingerprint`] after
    /// the first request.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::build(host, port, None)
    }

    /// Client that only talks to a receiver whose certificate has
    /// `fingerprint`.
    pub fn pinned(host: &str, port: u16, fingerprint: &str) -> Result<Self> {
        Self::build(host, port, Some(fingerprint.trim().to_string()))
    }

    fn build(host: &str, port: u16, pinned: Option<String>) -> Result<Self> {
        let provider = crypto_provider();
        let captured = CapturedCertificate::default();
        let verifier = TofuVerifier::new(provider.clone(), captured.clone(), pinned.clone());

        let mut tls = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];

        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;

        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };

        Ok(Self {
            http,
            base_url: format!("https://{}:{}", host, port),
            captured,
            pinned,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fingerprint of the certificate seen in the last handshake.
    pub fn peer_fingerprint(&self) -> Option<String> {
        self.captured.fingerprint()
    }

    /// Ask the receiver to pair. Blocks until the operator decides.
    ///
    /// # Errors
    /// - `AuthenticationFailure` for a wrong PIN
    /// - `Busy` if another sender is awaiting a decision
    /// - `Rejected`/`Timeout` if the operator declines or does not answer
    pub async fn register(&self, pin: &str, nonce: &str) -> Result<SessionId> {
        let request = RegisterRequest {
            pin: pin.to_string(),
            nonce: nonce.to_string(),
        };
        let response: RegisterResponse = self
            .send(self.request(Method::POST, "/api/v1/register").json(&request))
            .await?;
        debug!(session = %response.session_id, "Registered with receiver");
        Ok(response.session_id)
    }

    /// Propose a batch. Blocks until the operator decides.
    pub async fn prepare_upload(
        &self,
        request: &PrepareUploadRequest,
    ) -> Result<PrepareUploadResponse> {
        self.send(
            self.request(Method::POST, "/api/v1/prepare-upload")
                .json(request),
        )
        .await
    }

    /// Upload one accepted file as a multipart `file` part.
    pub async fn upload(
        &self,
        session: &SessionId,
        transmission: &TransmissionId,
        file_id: &FileId,
        file_name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadResponse> {
        let mut part = Part::bytes(data).file_name(file_name.to_string());
        if !mime_type.is_empty() {
            part = part
                .mime_str(mime_type)
                .map_err(|e| Error::InvalidInput(e.to_string()))?;
        }

        let builder = self
            .request(Method::PUT, "/api/v1/upload")
            .query(&[
                ("sessionId", session.as_str()),
                ("transmissionId", transmission.as_str()),
                ("fileId", file_id.as_str()),
            ])
            .multipart(Form::new().part("file", part));
        self.send(builder).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.base_url, path))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        decode(response).await
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        if let (Some(expected), Some(actual)) = (&self.pinned, self.peer_fingerprint()) {
            if &actual != expected {
                return Error::Tls(format!(
                    "Receiver fingerprint {} does not match {}",
                    actual, expected
                ));
            }
        }
        Error::Io(std::io::Error::other(err))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        return Ok(serde_json::from_slice(&bytes)?);
    }

    let body = match response.bytes().await {
        Ok(bytes) => serde_json::from_slice::<ErrorBody>(&bytes).ok(),
        Err(_) => None,
    };
    Err(from_response(status, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_file_hashes_contents() {
        let info = describe_file(FileId::new("f1").unwrap(), "a.txt", "text/plain", b"hello");
        assert_eq!(info.size, 5);
        assert_eq!(
            info.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_base_url_brackets_ipv6() {
        let client = SenderClient::new("::1", 53317).unwrap();
        assert_eq!(client.base_url(), "https://[::1]:53317");

        let client = SenderClient::new("192.168.1.5", 8443).unwrap();
        assert_eq!(client.base_url(), "https://192.168.1.5:8443");
        assert!(client.peer_fingerprint().is_none());
    }
}
