//! Outbound delivery.
//!
//! [`OutboundSender`] is the seam to the mail provider; [`Dispatcher`] drains
//! send jobs into it off the request path.

pub mod dispatch;
pub mod mailgun;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::pipeline::SendJob;

pub use dispatch::{DispatchConfig, Dispatcher, RetryPolicy};
pub use mailgun::MailgunSender;

/// Something that can hand a send job to a mail provider.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Deliver one job. Called only with jobs that passed [`validate_job`].
    async fn send(&self, job: &SendJob) -> Result<(), DeliveryError>;
}

/// Reject jobs the provider would refuse anyway.
pub fn validate_job(job: &SendJob) -> Result<(), DeliveryError> {
    if job.from.trim().is_empty() {
        return Err(DeliveryError::InvalidJob("missing from".into()));
    }
    if job.to.is_empty() || job.to.iter().any(|t| t.trim().is_empty()) {
        return Err(DeliveryError::InvalidJob("missing recipients".into()));
    }
    if job.text.is_none() && job.html.is_none() {
        return Err(DeliveryError::InvalidJob("missing text and html body".into()));
    }
    if job.message_id.trim().is_empty() {
        return Err(DeliveryError::InvalidJob("missing message id".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> SendJob {
        SendJob {
            from: "Client <client_at_client.tld@proxy.tld>".into(),
            to: vec!["owner@real.tld".into()],
            subject: "Hello".into(),
            text: Some("Body".into()),
            html: None,
            message_id: "<e.abc@proxy.tld>".into(),
            in_reply_to: None,
            reply_to: None,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn complete_job_is_valid() {
        assert!(validate_job(&job()).is_ok());
    }

    #[test]
    fn html_only_body_is_enough() {
        let mut j = job();
        j.text = None;
        j.html = Some("<p>Body</p>".into());
        assert!(validate_job(&j).is_ok());
    }

    #[test]
    fn empty_subject_is_allowed() {
        let mut j = job();
        j.subject.clear();
        assert!(validate_job(&j).is_ok());
    }

    #[test]
    fn incomplete_jobs_are_rejected() {
        let mut j = job();
        j.to.clear();
        assert!(matches!(validate_job(&j), Err(DeliveryError::InvalidJob(_))));

        let mut j = job();
        j.text = None;
        assert!(matches!(validate_job(&j), Err(DeliveryError::InvalidJob(_))));

        let mut j = job();
        j.message_id = " ".into();
        assert!(matches!(validate_job(&j), Err(DeliveryError::InvalidJob(_))));

        let mut j = job();
        j.from.clear();
        assert!(matches!(validate_job(&j), Err(DeliveryError::InvalidJob(_))));
    }
}
