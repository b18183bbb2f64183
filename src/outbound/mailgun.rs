//! Mailgun messages API client.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::OutboundSender;
use crate::config::MailgunConfig;
use crate::error::DeliveryError;
use crate::pipeline::SendJob;

const PROVIDER: &str = "mailgun";

/// Provider error bodies are truncated to this many bytes in errors.
const MAX_ERROR_BODY: usize = 512;

/// Sends jobs through `POST {endpoint}/v3/{domain}/messages`.
pub struct MailgunSender {
    api_key: SecretString,
    endpoint: String,
    domain: String,
    client: reqwest::Client,
}

impl MailgunSender {
    pub fn new(config: &MailgunConfig, domain: impl Into<String>) -> Self {
        Self {
            api_key: config.api_key.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            domain: domain.into(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self) -> String {
        format!("{}/v3/{}/messages", self.endpoint, self.domain)
    }

    async fn build_form(&self, job: &SendJob) -> Result<Form, DeliveryError> {
        let mut form = Form::new()
            .text("from", job.from.clone())
            .text("subject", job.subject.clone())
            .text("h:Message-Id", job.message_id.clone());

        for to in &job.to {
            form = form.text("to", to.clone());
        }
        if let Some(text) = &job.text {
            form = form.text("text", text.clone());
        }
        if let Some(html) = &job.html {
            form = form.text("html", html.clone());
        }
        if let Some(in_reply_to) = &job.in_reply_to {
            form = form.text("h:In-Reply-To", in_reply_to.clone());
        }
        if let Some(reply_to) = &job.reply_to {
            form = form.text("h:Reply-To", reply_to.clone());
        }

        for attachment in &job.attachments {
            let bytes = attachment
                .read()
                .await
                .map_err(|e| DeliveryError::Attachment {
                    filename: attachment.filename.clone(),
                    reason: e.to_string(),
                })?;
            let mut part = Part::bytes(bytes).file_name(attachment.filename.clone());
            if let Some(content_type) = &attachment.content_type {
                part = part
                    .mime_str(content_type)
                    .map_err(|e| DeliveryError::Attachment {
                        filename: attachment.filename.clone(),
                        reason: e.to_string(),
                    })?;
            }
            form = form.part("attachment", part);
        }

        Ok(form)
    }
}

#[async_trait]
impl OutboundSender for MailgunSender {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, job: &SendJob) -> Result<(), DeliveryError> {
        let form = self.build_form(job).await?;

        let resp = self
            .client
            .post(self.api_url())
            .basic_auth("api", Some(self.api_key.expose_secret()))
            .multipart(form)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(DeliveryError::Rejected {
                provider: PROVIDER.into(),
                status: status.as_u16(),
                body,
            });
        }

        debug!(job = %job.summary(), "Mailgun accepted message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::{Multipart, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;

    use super::*;
    use crate::pipeline::Attachment;

    type Captured = Arc<Mutex<Vec<(String, String)>>>;

    /// Start a fake messages endpoint answering with `status`.
    async fn fake_mailgun(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/v3/proxy.tld/messages",
                post(
                    move |State(captured): State<Captured>,
                          headers: HeaderMap,
                          mut multipart: Multipart| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let mut fields = vec![("authorization".to_string(), auth)];
                        while let Ok(Some(field)) = multipart.next_field().await {
                            let name = field.name().unwrap_or_default().to_string();
                            let file_name = field.file_name().map(str::to_string);
                            let value = match file_name {
                                Some(file) => file,
                                None => field.text().await.unwrap_or_default(),
                            };
                            fields.push((name, value));
                        }
                        captured.lock().unwrap().extend(fields);
                        (status, "{}")
                    },
                ),
            )
            .with_state(Arc::clone(&captured));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    fn full_job() -> SendJob {
        SendJob {
            from: "Client <client_at_client.tld@proxy.tld>".into(),
            to: vec!["owner@real.tld".into(), "other@real.tld".into()],
            subject: "Hello".into(),
            text: Some("Body".into()),
            html: Some("<p>Body</p>".into()),
            message_id: "<e.token@proxy.tld>".into(),
            in_reply_to: Some("<m1@client.tld>".into()),
            reply_to: Some("desk_at_client.tld@proxy.tld".into()),
            attachments: vec![Attachment::in_memory(
                "notes.txt",
                Some("text/plain".into()),
                Bytes::from_static(b"notes"),
            )],
        }
    }

    fn values<'a>(fields: &'a [(String, String)], name: &str) -> Vec<&'a str> {
        fields
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[tokio::test]
    async fn posts_every_field_with_basic_auth() {
        let (endpoint, captured) = fake_mailgun(StatusCode::OK).await;
        let sender = MailgunSender::new(&config(&endpoint), "proxy.tld");
        sender.send(&full_job()).await.unwrap();

        let fields = captured.lock().unwrap().clone();
        // base64("api:key-test")
        assert_eq!(values(&fields, "authorization"), vec!["Basic YXBpOmtleS10ZXN0"]);
        assert_eq!(values(&fields, "from"), vec!["Client <client_at_client.tld@proxy.tld>"]);
        assert_eq!(values(&fields, "to"), vec!["owner@real.tld", "other@real.tld"]);
        assert_eq!(values(&fields, "subject"), vec!["Hello"]);
        assert_eq!(values(&fields, "text"), vec!["Body"]);
        assert_eq!(values(&fields, "html"), vec!["<p>Body</p>"]);
        assert_eq!(values(&fields, "h:Message-Id"), vec!["<e.token@proxy.tld>"]);
        assert_eq!(values(&fields, "h:In-Reply-To"), vec!["<m1@client.tld>"]);
        assert_eq!(values(&fields, "h:Reply-To"), vec!["desk_at_client.tld@proxy.tld"]);
        assert_eq!(values(&fields, "attachment"), vec!["notes.txt"]);
    }

    #[tokio::test]
    async fn provider_errors_carry_status() {
        let (endpoint, _) = fake_mailgun(StatusCode::BAD_REQUEST).await;
        let sender = MailgunSender::new(&config(&endpoint), "proxy.tld");
        let err = sender.send(&full_job()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 400, .. }));
        assert!(!err.is_retryable());

        let (endpoint, _) = fake_mailgun(StatusCode::SERVICE_UNAVAILABLE).await;
        let sender = MailgunSender::new(&config(&endpoint), "proxy.tld");
        assert!(sender.send(&full_job()).await.unwrap_err().is_retryable());
    }

    fn config(endpoint: &str) -> MailgunConfig {
        MailgunConfig {
            api_key: SecretString::from("key-test"),
            endpoint: endpoint.to_string(),
        }
    }

    #[test]
    fn api_url_includes_domain() {
        let sender = MailgunSender::new(&config("https://api.mailgun.net/"), "proxy.tld");
        assert_eq!(sender.api_url(), "https://api.mailgun.net/v3/proxy.tld/messages");
        assert_eq!(sender.name(), "mailgun");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_retryable_transport_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let sender = MailgunSender::new(&config(&format!("http://127.0.0.1:{port}")), "proxy.tld");
        let job = SendJob {
            from: "a <a@proxy.tld>".into(),
            to: vec!["b@real.tld".into()],
            subject: "s".into(),
            text: Some("t".into()),
            html: None,
            message_id: "<e.x@proxy.tld>".into(),
            in_reply_to: None,
            reply_to: None,
            attachments: Vec::new(),
        };
        let err = sender.send(&job).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport { .. }));
        assert!(err.is_retryable());
    }
}
