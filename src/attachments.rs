//! Fetching provider-hosted media and re-storing it behind our own URL.

use crate::backend::Backend;
use crate::channel::Channel;
use crate::clog::{ChannelLog, ErrorCode, LogError};
use crate::error::BackendError;
use crate::handler::ChannelHandler;
use crate::httpx;
use crate::msg::Attachment;

/// Hard cap on fetched media size.
pub const MAX_ATTACHMENT_BYTES: usize = 100 * 1024 * 1024;

/// How many redirect hops a fetch may follow.
const MAX_REDIRECTS: usize = 5;

/// How many leading bytes the magic-byte sniffer inspects.
const SNIFF_LEN: usize = 300;

/// Download `url`, determine its media type, and re-store it via the backend.
///
/// Redirects are followed by hand on a non-redirecting client so every hop
/// is checked against the network policy before it is requested; a redirect
/// into a disallowed network is a fetch failure like any other. Any fetch
/// failure (unreachable, non-2xx, too large, network policy) degrades to an
/// [`Attachment`] with the `unavailable` content type and the original URL;
/// callers proceed without the media. Every hop is recorded into `clog`.
pub async fn fetch_and_store(
    backend: &dyn Backend,
    handler: &dyn ChannelHandler,
    channel: &Channel,
    url: &str,
    clog: &mut ChannelLog,
) -> Result<Attachment, BackendError> {
    let client = backend.http_client(false);
    let policy = backend.http_access();

    let mut current_url = url.to_string();
    let mut hops = 0;
    let response = loop {
        // provider auth goes on the first hop only
        let request = if hops == 0 {
            match handler.attachment_request_builder() {
                Some(builder) => {
                    match builder.build_attachment_request(backend, channel, url).await {
                        Ok(req) => req,
                        Err(e) => {
                            clog.error(LogError::new(
                                ErrorCode::MediaUnresolveable,
                                format!("unable to build attachment request: {e}"),
                            ));
                            return Ok(Attachment::unavailable(url));
                        }
                    }
                }
                None => match client.get(&current_url).build() {
                    Ok(req) => req,
                    Err(e) => {
                        clog.error(LogError::new(
                            ErrorCode::MediaUnresolveable,
                            format!("invalid attachment url: {e}"),
                        ));
                        return Ok(Attachment::unavailable(url));
                    }
                },
            }
        } else {
            match client.get(&current_url).build() {
                Ok(req) => req,
                Err(e) => {
                    clog.error(LogError::new(
                        ErrorCode::MediaUnresolveable,
                        format!("invalid redirect url: {e}"),
                    ));
                    return Ok(Attachment::unavailable(url));
                }
            }
        };

        let traced = match httpx::request_traced(
            &client,
            request,
            clog,
            Some(&policy),
            MAX_ATTACHMENT_BYTES,
        )
        .await
        {
            Ok(r) => r,
            Err(_) => return Ok(Attachment::unavailable(url)),
        };

        if !traced.is_redirect() {
            break traced;
        }
        hops += 1;
        if hops > MAX_REDIRECTS {
            clog.error(LogError::new(
                ErrorCode::MediaUnresolveable,
                format!("too many redirects fetching '{url}'"),
            ));
            return Ok(Attachment::unavailable(url));
        }
        let Some(next_url) = traced.location.as_deref().and_then(|l| resolve_redirect(&current_url, l))
        else {
            clog.error(LogError::new(
                ErrorCode::MediaUnresolveable,
                format!("redirect without usable location fetching '{url}'"),
            ));
            return Ok(Attachment::unavailable(url));
        };
        current_url = next_url;
    };

    if !response.is_success() {
        return Ok(Attachment::unavailable(url));
    }

    let content_type =
        detect_content_type(response.content_type.as_deref(), &response.body, &current_url);
    let extension = extension_for(&content_type, &current_url);

    let stored_url = backend
        .save_attachment(channel, &content_type, &response.body, &extension)
        .await?;

    Ok(Attachment {
        content_type,
        url: stored_url,
        size: response.body.len(),
    })
}

/// Determine a media type: the `Content-Type` header wins unless it is
/// empty or a non-answer, then magic bytes, then the URL path extension.
pub fn detect_content_type(header: Option<&str>, body: &[u8], url: &str) -> String {
    if let Some(header) = header {
        let header = header.split(';').next().unwrap_or("").trim();
        if !header.is_empty() && header != "*/*" && header != "application/octet-stream" {
            return header.to_ascii_lowercase();
        }
    }

    if let Some(sniffed) = sniff_content_type(body) {
        return sniffed.to_string();
    }

    if let Some(ext) = url_extension(url) {
        if let Some(guessed) = mime_guess::from_ext(&ext).first() {
            return guessed.essence_str().to_string();
        }
    }

    "application/octet-stream".to_string()
}

/// Pick a file extension for `content_type`, mapping the `jpe`/`jfif`
/// aliases to `jpg` and falling back to the URL path extension.
pub fn extension_for(content_type: &str, url: &str) -> String {
    if let Some(extensions) = mime_guess::get_mime_extensions_str(content_type) {
        let mapped: Vec<&str> = extensions.iter().map(|e| jpeg_alias(e)).collect();
        if mapped.contains(&"jpg") {
            return "jpg".to_string();
        }
        if let Some(ext) = mapped.first() {
            return ext.to_string();
        }
    }
    url_extension(url)
        .map(|e| jpeg_alias(&e).to_string())
        .unwrap_or_default()
}

fn jpeg_alias(ext: &str) -> &str {
    match ext {
        "jpe" | "jfif" | "jpeg" => "jpg",
        other => other,
    }
}

/// Resolve a `Location` header against the URL that produced it. Only
/// http(s) targets are followable.
fn resolve_redirect(base: &str, location: &str) -> Option<String> {
    let base = url::Url::parse(base).ok()?;
    let next = base.join(location).ok()?;
    if !matches!(next.scheme(), "http" | "https") {
        return None;
    }
    Some(next.to_string())
}

fn url_extension(url: &str) -> Option<String> {
    let path = url::Url::parse(url).ok()?.path().to_string();
    let (_, ext) = path.rsplit_once('.')?;
    if ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Magic-byte detection over the leading bytes of the body.
fn sniff_content_type(body: &[u8]) -> Option<&'static str> {
    let head = &body[..body.len().min(SNIFF_LEN)];
    let matches = |prefix: &[u8]| head.starts_with(prefix);

    if matches(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if matches(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if matches(b"GIF87a") || matches(b"GIF89a") {
        return Some("image/gif");
    }
    if head.len() >= 12 && matches(b"RIFF") {
        if &head[8..12] == b"WEBP" {
            return Some("image/webp");
        }
        if &head[8..12] == b"WAVE" {
            return Some("audio/wav");
        }
    }
    if matches(b"%PDF") {
        return Some("application/pdf");
    }
    if matches(b"OggS") {
        return Some("audio/ogg");
    }
    if matches(b"ID3") || matches(&[0xFF, 0xFB]) {
        return Some("audio/mpeg");
    }
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        return Some("video/mp4");
    }
    if matches(b"#!AMR") {
        return Some("audio/amr");
    }
    None
}
