//! Plain HTTP/1.1 transport to the adapter's local API.
//!
//! Each exchange is a single `POST /api?m=<token>` on a fresh connection with
//! `Connection: close`. The body is the AES-128-CBC ciphertext of the JSON payload;
//! the response body is ciphertext under the same key and IV.

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, trace};

use super::{LocalTransport, TransportConfig, split_host_port};
use crate::{
    crypto::{DeviceKeyMaterial, cipher, request_token},
    error::Error,
};

/// Largest response the transport accepts.
const MAX_RESPONSE_LEN: usize = 1024 * 1024;

/// HTTP transport for adapters on the local network.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    config: TransportConfig,
}

impl HttpTransport {
    /// Creates a transport with the given timeouts.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    async fn http_post(
        &self,
        address: &str,
        path: &str,
        body: &[u8],
    ) -> Result<(u16, Vec<u8>), Error> {
        let (host, port) = split_host_port(address);

        let mut request = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Length: {}\r\n\
             Accept: */*\r\n\
             Connection: close\r\n\r\n",
            path,
            host_header(host, port),
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);

        let mut stream = timeout(self.config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {address} timed out")))?
            .map_err(|e| Error::ConnectionFailed(format!("connect to {address} failed: {e}")))?;

        timeout(
            self.config.response_timeout,
            Self::round_trip(&mut stream, &request),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "{address} did not answer within {:?}",
                self.config.response_timeout
            ))
        })?
    }

    async fn round_trip(stream: &mut TcpStream, request: &[u8]) -> Result<(u16, Vec<u8>), Error> {
        stream.write_all(request).await?;

        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 4096];
        let mut expected_total = None;

        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.len() > MAX_RESPONSE_LEN {
                return Err(Error::Protocol(format!(
                    "response exceeds {MAX_RESPONSE_LEN} bytes"
                )));
            }

            if expected_total.is_none()
                && let Some(header_end) = find_header_end(&response)
            {
                let headers = String::from_utf8_lossy(&response[..header_end]);
                expected_total = parse_content_length(&headers).map(|len| header_end + 4 + len);
            }
            if let Some(total) = expected_total
                && response.len() >= total
            {
                response.truncate(total);
                break;
            }
        }

        let header_end = find_header_end(&response)
            .ok_or_else(|| Error::Protocol("invalid HTTP response: no header end".into()))?;
        let headers = String::from_utf8_lossy(&response[..header_end]);
        let status = parse_status_code(&headers)
            .ok_or_else(|| Error::Protocol("invalid HTTP response: no status code".into()))?;

        Ok((status, response[header_end + 4..].to_vec()))
    }
}

#[async_trait]
impl LocalTransport for HttpTransport {
    async fn exchange(
        &self,
        address: &str,
        key_material: &DeviceKeyMaterial,
        payload: &Value,
    ) -> Result<Value, Error> {
        let body = cipher::seal_json(key_material, payload)?;
        let token = request_token(key_material, &body)?;
        let path = format!("/api?m={token}");

        debug!(address, len = body.len(), "Sending local request");
        let (status, response_body) = self.http_post(address, &path, &body).await?;
        trace!(address, status, len = response_body.len(), "Local response");

        if !(200..300).contains(&status) {
            return Err(Error::HttpStatus {
                address: address.to_string(),
                status,
            });
        }

        cipher::open_json(key_material, &response_body)
    }
}

/// `Host` header value. IPv6 literals are bracketed.
fn host_header(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_code(headers: &str) -> Option<u16> {
    headers.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

fn parse_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
