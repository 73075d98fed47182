//! Traced HTTP requests.
//!
//! Every provider call the gateway makes goes through [`request_traced`] so
//! the request and response bytes land in the channel log, and so outbound
//! fetches respect the configured network access policy (SSRF guard).

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use cidr::AnyIpCidr;
use thiserror::Error;
use url::Url;

use crate::clog::ChannelLog;
use crate::error::ConfigError;

/// How much of a response body is recorded into the channel log. Bodies
/// larger than this are elided with a byte-count marker.
const RECORDED_BODY_LIMIT: usize = 16 * 1024;

/// Failures performing a traced request.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL resolves into a disallowed network.
    #[error("request to disallowed network: {host}")]
    Disallowed {
        /// Host that resolved into a denied range.
        host: String,
    },

    /// The URL could not be parsed or resolved.
    #[error("unresolvable url: {reason}")]
    Unresolvable {
        /// Parse or resolution failure description.
        reason: String,
    },

    /// Transport-level failure reaching the remote.
    #[error("connection failed: {reason}")]
    Connection {
        /// Failure description.
        reason: String,
    },

    /// The response body exceeded the caller's size cap.
    #[error("response larger than {limit} bytes")]
    TooLarge {
        /// The cap that was exceeded.
        limit: usize,
    },
}

/// CIDR denylist applied to outbound fetches.
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    disallowed: Vec<AnyIpCidr>,
}

impl NetworkPolicy {
    /// Parse a policy from config entries (plain IPs or CIDR blocks).
    pub fn parse(entries: &[String]) -> Result<Self, ConfigError> {
        let mut disallowed = Vec::with_capacity(entries.len());
        for entry in entries {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            let cidr = AnyIpCidr::from_str(trimmed).map_err(|e| ConfigError::InvalidNetwork {
                value: trimmed.to_string(),
                reason: e.to_string(),
            })?;
            disallowed.push(cidr);
        }
        Ok(NetworkPolicy { disallowed })
    }

    /// Whether connections to `ip` are permitted.
    pub fn allows(&self, ip: IpAddr) -> bool {
        !self.disallowed.iter().any(|c| c.contains(&ip))
    }

    /// Resolve the URL's host and reject it if any address is denied.
    pub async fn check_url(&self, url: &Url) -> Result<(), FetchError> {
        if self.disallowed.is_empty() {
            return Ok(());
        }
        let host = url.host_str().ok_or_else(|| FetchError::Unresolvable {
            reason: format!("no host in '{url}'"),
        })?;

        // Literal addresses skip resolution.
        if let Ok(ip) = IpAddr::from_str(host.trim_matches(['[', ']'])) {
            if !self.allows(ip) {
                return Err(FetchError::Disallowed {
                    host: host.to_string(),
                });
            }
            return Ok(());
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| FetchError::Unresolvable {
                reason: format!("resolving '{host}': {e}"),
            })?;
        for addr in addrs {
            if !self.allows(addr.ip()) {
                return Err(FetchError::Disallowed {
                    host: host.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// The interesting parts of a traced response.
#[derive(Debug)]
pub struct TracedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// `Location` header, for callers that follow redirects themselves.
    pub location: Option<String>,
    pub body: Bytes,
}

impl TracedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// Perform `request`, recording the exchange into `clog`.
///
/// The request and (truncated) response bytes are recorded whether the call
/// succeeds or fails; connection failures record a status code of 0. Bodies
/// are read fully but capped at `max_body` bytes.
pub async fn request_traced(
    client: &reqwest::Client,
    request: reqwest::Request,
    clog: &mut ChannelLog,
    policy: Option<&NetworkPolicy>,
    max_body: usize,
) -> Result<TracedResponse, FetchError> {
    let url = request.url().clone();
    let request_dump = dump_request(&request);
    let started_on = Utc::now();
    let start = Instant::now();

    if let Some(policy) = policy {
        if let Err(e) = policy.check_url(&url).await {
            clog.http(url.as_str(), 0, &request_dump, "", start.elapsed(), started_on);
            return Err(e);
        }
    }

    let response = match client.execute(request).await {
        Ok(r) => r,
        Err(e) => {
            clog.http(url.as_str(), 0, &request_dump, "", start.elapsed(), started_on);
            return Err(FetchError::Connection {
                reason: e.to_string(),
            });
        }
    };

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let response_head = dump_response_head(&response);

    let body = match read_capped(response, max_body).await {
        Ok(b) => b,
        Err(e) => {
            clog.http(
                url.as_str(),
                status,
                &request_dump,
                &response_head,
                start.elapsed(),
                started_on,
            );
            return Err(e);
        }
    };

    let response_dump = format!("{}\r\n{}", response_head, recordable_body(&body));
    clog.http(
        url.as_str(),
        status,
        &request_dump,
        &response_dump,
        start.elapsed(),
        started_on,
    );

    Ok(TracedResponse {
        status,
        content_type,
        location,
        body,
    })
}

async fn read_capped(mut response: reqwest::Response, max_body: usize) -> Result<Bytes, FetchError> {
    let mut buf = BytesMut::new();
    loop {
        let chunk = response.chunk().await.map_err(|e| FetchError::Connection {
            reason: e.to_string(),
        })?;
        let Some(chunk) = chunk else {
            return Ok(buf.freeze());
        };
        if buf.len() + chunk.len() > max_body {
            return Err(FetchError::TooLarge { limit: max_body });
        }
        buf.extend_from_slice(&chunk);
    }
}

fn dump_request(request: &reqwest::Request) -> String {
    let mut out = String::new();
    let url = request.url();
    let path_and_query = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };
    out.push_str(&format!("{} {} HTTP/1.1\r\n", request.method(), path_and_query));
    if let Some(host) = url.host_str() {
        out.push_str(&format!("Host: {host}\r\n"));
    }
    for (name, value) in request.headers() {
        out.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or("<binary>")));
    }
    out.push_str("\r\n");
    if let Some(bytes) = request.body().and_then(|b| b.as_bytes()) {
        out.push_str(&String::from_utf8_lossy(bytes));
    }
    out
}

fn dump_response_head(response: &reqwest::Response) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    ));
    for (name, value) in response.headers() {
        out.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or("<binary>")));
    }
    out
}

fn recordable_body(body: &Bytes) -> String {
    if body.len() > RECORDED_BODY_LIMIT {
        format!("... ({} bytes)", body.len())
    } else {
        String::from_utf8_lossy(body).to_string()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn policy(entries: &[&str]) -> NetworkPolicy {
        let entries: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        NetworkPolicy::parse(&entries).expect("policy")
    }

    #[test]
    fn parses_addresses_and_blocks() {
        let p = policy(&["127.0.0.1", "10.0.0.0/8", "::1"]);
        assert!(!p.allows("127.0.0.1".parse().expect("ip")));
        assert!(!p.allows("10.12.13.14".parse().expect("ip")));
        assert!(!p.allows("::1".parse().expect("ip")));
        assert!(p.allows("93.184.216.34".parse().expect("ip")));
    }

    #[test]
    fn rejects_malformed_entries() {
        let entries = vec!["not-a-network".to_string()];
        assert!(NetworkPolicy::parse(&entries).is_err());
    }

    #[tokio::test]
    async fn check_url_rejects_literal_denied_hosts() {
        let p = policy(&["127.0.0.0/8"]);
        let url = Url::parse("http://127.0.0.1:9999/x").expect("url");
        assert!(matches!(
            p.check_url(&url).await,
            Err(FetchError::Disallowed { .. })
        ));

        let empty = NetworkPolicy::default();
        assert!(empty.check_url(&url).await.is_ok());
    }

    #[test]
    fn recordable_body_elides_large_payloads() {
        let small = Bytes::from_static(b"hello");
        assert_eq!(recordable_body(&small), "hello");

        let big = Bytes::from(vec![0u8; RECORDED_BODY_LIMIT + 1]);
        assert_eq!(recordable_body(&big), format!("... ({} bytes)", big.len()));
    }
}
