//! Content-type detection for payloads stored without one.

use crate::network::PayloadStream;
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::io;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub trait ContentDetector: Send + Sync {
    /// Guess the media type from the first bytes of a payload.
    fn detect(&self, head: &[u8]) -> String;
}

/// Magic-number detector covering the formats commonly uploaded through S3
/// clients.
#[derive(Clone, Copy, Debug, Default)]
pub struct MagicDetector;

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/x-gzip"),
];

impl ContentDetector for MagicDetector {
    fn detect(&self, head: &[u8]) -> String {
        if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
            return mime.to_string();
        }

        // A chunk boundary may cut a multi-byte character.
        let text = match std::str::from_utf8(head) {
            Ok(text) => text,
            Err(err) if err.error_len().is_none() => {
                std::str::from_utf8(&head[..err.valid_up_to()]).unwrap_or_default()
            }
            Err(_) => return DEFAULT_CONTENT_TYPE.to_string(),
        };

        let trimmed = text.trim_start();
        let lower = trimmed
            .get(..trimmed.len().min(16))
            .unwrap_or_default()
            .to_ascii_lowercase();
        if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
            "text/html; charset=utf-8".to_string()
        } else if lower.starts_with("<?xml") {
            "text/xml; charset=utf-8".to_string()
        } else if trimmed.starts_with('{') || trimmed.starts_with('[') {
            "application/json".to_string()
        } else if head.contains(&0) {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            "text/plain; charset=utf-8".to_string()
        }
    }
}

/// Peek the first chunk of `payload` and detect its content type.
///
/// The returned stream yields the payload unchanged, peeked chunk included.
/// An empty payload has no detectable type.
pub async fn sniff_payload(
    detector: &dyn ContentDetector,
    mut payload: PayloadStream,
) -> io::Result<(Option<String>, PayloadStream)> {
    let first: Option<Bytes> = loop {
        match payload.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => break Some(chunk),
            Some(Err(err)) => return Err(err),
            None => break None,
        }
    };

    match first {
        Some(chunk) => {
            let content_type = detector.detect(&chunk);
            let rechained = stream::once(async move { Ok(chunk) }).chain(payload);
            Ok((Some(content_type), Box::pin(rechained)))
        }
        None => Ok((None, Box::pin(stream::empty()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn magic_numbers_win_over_text_heuristics() {
        let detector = MagicDetector;
        assert_eq!(detector.detect(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(detector.detect(b"%PDF-1.7"), "application/pdf");
        assert_eq!(detector.detect(b"{\"a\": 1}"), "application/json");
        assert_eq!(detector.detect(b"  <html><body>"), "text/html; charset=utf-8");
        assert_eq!(detector.detect(b"hello"), "text/plain; charset=utf-8");
        assert_eq!(detector.detect(b"\x00\x01\xfe\xff"), DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn sniffing_keeps_the_payload_intact() {
        let payload: PayloadStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"")),
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]));

        let (content_type, rest) = sniff_payload(&MagicDetector, payload).await.unwrap();
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));

        let chunks: Vec<Bytes> = rest.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello world");
    }

    #[tokio::test]
    async fn empty_payload_has_no_type() {
        let payload: PayloadStream = Box::pin(stream::empty());
        let (content_type, _) = sniff_payload(&MagicDetector, payload).await.unwrap();
        assert!(content_type.is_none());
    }
}
