//! Webhook body parsing.
//!
//! The provider posts either `multipart/form-data` (when the mail has files)
//! or `application/x-www-form-urlencoded`. Both end up as a flat field map
//! plus attachments.

use std::collections::HashMap;

use axum::Form;
use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use tokio::io::AsyncWriteExt;

use crate::error::PayloadError;
use crate::pipeline::{Attachment, InboundMail};
use crate::signature::{SignatureValidator, SignedFields};

/// Form fields and headers beyond the attachments.
const FIELD_ALLOWANCE: usize = 2 * 1024 * 1024;

/// Caps on inbound attachments.
#[derive(Debug, Clone)]
pub struct AttachmentLimits {
    /// Total bytes across all attachments of one mail.
    pub max_bytes: usize,
    pub max_count: usize,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_bytes: 25 * 1024 * 1024,
            max_count: 20,
        }
    }
}

impl AttachmentLimits {
    /// Request body limit implied by these caps.
    pub fn body_limit(&self) -> usize {
        self.max_bytes.saturating_add(FIELD_ALLOWANCE)
    }
}

/// A parsed webhook body.
#[derive(Debug, Default)]
pub struct WebhookPayload {
    fields: HashMap<String, String>,
    pub attachments: Vec<Attachment>,
}

impl WebhookPayload {
    /// Build from plain `(name, value)` pairs. The first occurrence of a name wins.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut payload = Self::default();
        for (name, value) in pairs {
            payload.insert(name, value);
        }
        payload
    }

    fn insert(&mut self, name: String, value: String) {
        self.fields.entry(name).or_insert(value);
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// First non-empty value among `names`.
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.field(name))
            .find(|v| !v.trim().is_empty())
    }

    pub fn signed_fields(&self) -> SignedFields<'_> {
        SignedFields {
            token: self.field("token"),
            timestamp: self.field("timestamp"),
            signature: self.field("signature"),
        }
    }

    /// Map provider field names onto an [`InboundMail`].
    pub fn into_inbound(self) -> Result<InboundMail, PayloadError> {
        let owned = |names: &[&str]| self.first_of(names).map(str::to_string);

        let sender = owned(&["sender", "Sender"]).ok_or(PayloadError::MissingField("sender"))?;
        let recipients = owned(&["recipient"]).ok_or(PayloadError::MissingField("recipient"))?;

        let mail = InboundMail {
            sender,
            from_header: owned(&["from", "From"]),
            recipients,
            subject: owned(&["subject", "Subject"]).unwrap_or_default(),
            body_plain: owned(&["body-plain"]),
            body_html: owned(&["body-html"]),
            message_id: owned(&["Message-Id", "Message-ID", "message-id"]),
            in_reply_to: owned(&["In-Reply-To", "in-reply-to"]),
            reply_to: owned(&["Reply-To", "reply-to"]),
            attachments: Vec::new(),
        };
        Ok(InboundMail {
            attachments: self.attachments,
            ..mail
        })
    }
}

/// Parse a webhook request body.
///
/// With `in_memory` set attachments stay in memory, otherwise they are spooled
/// to temp files that disappear with the returned payload (or on error).
/// Nothing is written to disk until the signature fields preceding a file
/// verify; files ahead of them stay in memory.
pub async fn parse_request(
    request: Request,
    limits: &AttachmentLimits,
    in_memory: bool,
    validator: &SignatureValidator,
) -> Result<WebhookPayload, PayloadError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| PayloadError::Malformed(e.to_string()))?;
        parse_multipart(multipart, limits, in_memory, validator).await
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
            .await
            .map_err(|e| PayloadError::Malformed(e.to_string()))?;
        Ok(WebhookPayload::from_pairs(pairs))
    } else {
        Err(PayloadError::UnsupportedContentType(content_type))
    }
}

async fn parse_multipart(
    mut multipart: Multipart,
    limits: &AttachmentLimits,
    in_memory: bool,
    validator: &SignatureValidator,
) -> Result<WebhookPayload, PayloadError> {
    let mut payload = WebhookPayload::default();
    let mut total = 0usize;
    let mut verified = false;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| PayloadError::Malformed(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let Some(filename) = field.file_name().map(str::to_string) else {
            let value = field
                .text()
                .await
                .map_err(|e| PayloadError::Malformed(e.to_string()))?;
            payload.insert(name, value);
            continue;
        };

        if payload.attachments.len() >= limits.max_count {
            return Err(PayloadError::TooManyAttachments {
                max: limits.max_count,
            });
        }
        let content_type = field.content_type().map(str::to_string);
        if !in_memory && !verified {
            verified = caller_verified(&payload, validator)?;
        }

        let attachment = if in_memory || !verified {
            let mut buffer = Vec::new();
            while let Some(chunk) = next_chunk(&mut field).await? {
                total = checked_total(total, chunk.len(), limits)?;
                buffer.extend_from_slice(&chunk);
            }
            Attachment::in_memory(filename, content_type, Bytes::from(buffer))
        } else {
            let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
            let mut file = tokio::fs::File::from_std(file);
            let mut size = 0u64;
            while let Some(chunk) = next_chunk(&mut field).await? {
                total = checked_total(total, chunk.len(), limits)?;
                file.write_all(&chunk).await?;
                size += chunk.len() as u64;
            }
            file.flush().await?;
            Attachment::spooled(filename, content_type, size, path)
        };
        payload.attachments.push(attachment);
    }

    Ok(payload)
}

/// `Ok(false)` while signature fields are still missing. A complete but
/// wrong signature ends parsing.
fn caller_verified(
    payload: &WebhookPayload,
    validator: &SignatureValidator,
) -> Result<bool, PayloadError> {
    let fields = payload.signed_fields();
    if fields.token.is_none() || fields.timestamp.is_none() || fields.signature.is_none() {
        return Ok(false);
    }
    validator
        .verify(fields)
        .map(|()| true)
        .map_err(|_| PayloadError::Unauthenticated)
}

async fn next_chunk(
    field: &mut axum::extract::multipart::Field<'_>,
) -> Result<Option<Bytes>, PayloadError> {
    field
        .chunk()
        .await
        .map_err(|e| PayloadError::Malformed(e.to_string()))
}

fn checked_total(
    total: usize,
    chunk: usize,
    limits: &AttachmentLimits,
) -> Result<usize, PayloadError> {
    let total = total.saturating_add(chunk);
    if total > limits.max_bytes {
        return Err(PayloadError::AttachmentsTooLarge {
            max: limits.max_bytes,
        });
    }
    Ok(total)
}
