//! Shared types for the routing pipeline.

use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use tempfile::TempPath;

// ── Inbound mail ────────────────────────────────────────────────────

/// One inbound mail event, as delivered by the provider webhook.
///
/// Header-ish fields are kept raw; the resolver parses what it needs.
#[derive(Debug, Clone, Default)]
pub struct InboundMail {
    /// Envelope sender address.
    pub sender: String,
    /// Raw `From` header, used for the display name.
    pub from_header: Option<String>,
    /// Comma-joined recipient list.
    pub recipients: String,
    pub subject: String,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    /// Original `Message-Id` header.
    pub message_id: Option<String>,
    /// Original `In-Reply-To` header. Must be a thread token when present.
    pub in_reply_to: Option<String>,
    /// Raw `Reply-To` header.
    pub reply_to: Option<String>,
    pub attachments: Vec<Attachment>,
}

// ── Attachments ─────────────────────────────────────────────────────

/// A file carried by an inbound mail and every job derived from it.
///
/// Cloning is cheap. Spooled files are deleted when the last clone drops.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub body: AttachmentBody,
}

/// Where an attachment's bytes live.
#[derive(Debug, Clone)]
pub enum AttachmentBody {
    Memory(Bytes),
    /// Temp file removed when the guard drops.
    Spooled(Arc<TempPath>),
}

impl Attachment {
    pub fn in_memory(filename: impl Into<String>, content_type: Option<String>, bytes: Bytes) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            size: bytes.len() as u64,
            body: AttachmentBody::Memory(bytes),
        }
    }

    pub fn spooled(
        filename: impl Into<String>,
        content_type: Option<String>,
        size: u64,
        path: TempPath,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            size,
            body: AttachmentBody::Spooled(Arc::new(path)),
        }
    }

    /// Path of the spooled file, if any.
    pub fn spool_path(&self) -> Option<&Path> {
        match &self.body {
            AttachmentBody::Memory(_) => None,
            AttachmentBody::Spooled(path) => Some(&***path),
        }
    }

    /// Read the full contents.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match &self.body {
            AttachmentBody::Memory(bytes) => Ok(bytes.to_vec()),
            AttachmentBody::Spooled(path) => tokio::fs::read(&***path).await,
        }
    }
}

// ── Send jobs ───────────────────────────────────────────────────────

/// One grouped outbound instruction.
///
/// All destinations share the envelope metadata below.
#[derive(Debug, Clone)]
pub struct SendJob {
    /// Complete `From` header value (`Name <address>`).
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    /// Outbound `Message-Id`, always a thread token.
    pub message_id: String,
    /// Recovered true id of the message being replied to.
    pub in_reply_to: Option<String>,
    pub reply_to: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl SendJob {
    /// Short label for logs. Never includes destination addresses.
    pub fn summary(&self) -> String {
        format!(
            "{} recipient(s), {} attachment(s)",
            self.to.len(),
            self.attachments.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn memory_attachment_reads_back() {
        let att = Attachment::in_memory("a.txt", None, Bytes::from_static(b"hello"));
        assert_eq!(att.size, 5);
        assert!(att.spool_path().is_none());
        assert_eq!(att.read().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn spooled_attachment_is_removed_with_last_clone() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"spooled").unwrap();
        let att = Attachment::spooled("b.bin", Some("application/octet-stream".into()), 7, file.into_temp_path());

        let path = att.spool_path().unwrap().to_path_buf();
        let clone = att.clone();
        assert_eq!(clone.read().await.unwrap(), b"spooled");

        drop(att);
        assert!(path.exists());
        drop(clone);
        assert!(!path.exists());
    }

    #[test]
    fn summary_hides_addresses() {
        let job = SendJob {
            from: "Client <client_at_client.tld@proxy.tld>".into(),
            to: vec!["owner@real.tld".into()],
            subject: "hi".into(),
            text: Some("body".into()),
            html: None,
            message_id: "<e.x@proxy.tld>".into(),
            in_reply_to: None,
            reply_to: None,
            attachments: Vec::new(),
        };
        let summary = job.summary();
        assert!(!summary.contains("owner@real.tld"));
        assert!(summary.starts_with("1 recipient"));
    }
}
