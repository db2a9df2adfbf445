//! Outbound mail: a delivery client plus template rendering.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use svckit_bootstrap::{EmailConfig, MailProvider};

use crate::template::{json_globals, render_file, TemplateError};

const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com";

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Mail {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("mail delivery request failed")]
    Transport(#[from] reqwest::Error),
    #[error("mail provider rejected the message with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("mail has no recipients")]
    NoRecipients,
}

#[async_trait]
pub trait MailClient: Send + Sync + 'static {
    async fn deliver(&self, mail: Mail) -> Result<(), MailError>;
}

/// Logs instead of sending. Nothing is retained after delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailClient;

#[async_trait]
impl MailClient for LogMailClient {
    async fn deliver(&self, mail: Mail) -> Result<(), MailError> {
        tracing::info!(to = ?mail.to, subject = %mail.subject, bytes = mail.html.len(), "mail (log provider)");
        Ok(())
    }
}

/// SendGrid v3 `mail/send`.
#[derive(Debug, Clone)]
pub struct SendgridMailClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    sender: String,
    bcc: Vec<String>,
}

impl SendgridMailClient {
    pub fn new(api_key: impl Into<String>, sender: impl Into<String>, bcc: Vec<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: SENDGRID_ENDPOINT.to_string(),
            api_key: api_key.into(),
            sender: sender.into(),
            bcc,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn payload(&self, mail: &Mail) -> serde_json::Value {
        let to: Vec<_> = mail.to.iter().map(|e| json!({ "email": e })).collect();
        let mut personalization = json!({ "to": to, "subject": mail.subject });
        if !self.bcc.is_empty() {
            let bcc: Vec<_> = self.bcc.iter().map(|e| json!({ "email": e })).collect();
            personalization["bcc"] = json!(bcc);
        }
        json!({
            "personalizations": [personalization],
            "from": { "email": self.sender },
            "content": [{ "type": "text/html", "value": mail.html }],
        })
    }
}

#[async_trait]
impl MailClient for SendgridMailClient {
    async fn deliver(&self, mail: Mail) -> Result<(), MailError> {
        if mail.to.is_empty() {
            return Err(MailError::NoRecipients);
        }
        let res = self
            .http
            .post(format!("{}/v3/mail/send", self.endpoint.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&self.payload(&mail))
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(to = ?mail.to, subject = %mail.subject, "mail accepted by provider");
        Ok(())
    }
}

/// Template-driven mail, see [`Mailer::send_email`].
#[derive(Debug, Clone)]
pub struct EmailRequest {
    pub to: Vec<String>,
    pub subject: String,
    pub template_name: String,
    pub fields: serde_json::Value,
}

/// Renders `{templates_dir}/{template_name}.html` and hands it to the client.
#[derive(Clone)]
pub struct Mailer {
    client: Arc<dyn MailClient>,
    templates_dir: PathBuf,
}

impl Mailer {
    pub fn new(client: Arc<dyn MailClient>, templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            templates_dir: templates_dir.into(),
        }
    }

    /// Build the client named by `cfg.provider`.
    pub fn from_config(cfg: &EmailConfig, templates_dir: PathBuf) -> Self {
        let client: Arc<dyn MailClient> = match cfg.provider {
            MailProvider::Log => Arc::new(LogMailClient),
            MailProvider::Sendgrid => {
                let mut c = SendgridMailClient::new(
                    cfg.api_key.clone().unwrap_or_default(),
                    cfg.sender.clone(),
                    cfg.bcc.clone(),
                );
                if let Some(endpoint) = &cfg.endpoint {
                    c = c.with_endpoint(endpoint.clone());
                }
                Arc::new(c)
            }
        };
        Self::new(client, templates_dir)
    }

    pub fn client(&self) -> &Arc<dyn MailClient> {
        &self.client
    }

    pub async fn send_email(&self, req: EmailRequest) -> Result<(), MailError> {
        let path = self.templates_dir.join(format!("{}.html", req.template_name));
        let html = render_file(&path, &json_globals(&req.fields))?;
        self.client
            .deliver(Mail {
                to: req.to,
                subject: req.subject,
                html,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Mail>>);

    #[async_trait]
    impl MailClient for Recorder {
        async fn deliver(&self, mail: Mail) -> Result<(), MailError> {
            self.0.lock().push(mail);
            Ok(())
        }
    }

    #[tokio::test]
    async fn log_provider_keeps_nothing() {
        assert_eq!(std::mem::size_of::<LogMailClient>(), 0);
        let mailer = Mailer::from_config(&EmailConfig::default(), PathBuf::from("unused"));
        mailer
            .client()
            .deliver(Mail {
                to: vec!["ana@example.com".into()],
                subject: "Welcome".into(),
                html: "<p>Hi</p>".repeat(1024),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_email_renders_template() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("welcome.html"), "<p>Hi {{ name }}</p>").unwrap();

        let recorder = Arc::new(Recorder::default());
        let mailer = Mailer::new(recorder.clone(), dir.path());
        mailer
            .send_email(EmailRequest {
                to: vec!["ana@example.com".into()],
                subject: "Welcome".into(),
                template_name: "welcome".into(),
                fields: json!({"name": "Ana"}),
            })
            .await
            .unwrap();

        let sent = recorder.0.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].html, "<p>Hi Ana</p>");
    }

    #[tokio::test]
    async fn sendgrid_posts_personalizations_with_bcc() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v3/mail/send")
                    .header("authorization", "Bearer key-1")
                    .json_body(json!({
                        "personalizations": [{
                            "to": [{"email": "a@example.com"}, {"email": "b@example.com"}],
                            "subject": "Hello",
                            "bcc": [{"email": "audit@example.com"}]
                        }],
                        "from": {"email": "noreply@example.com"},
                        "content": [{"type": "text/html", "value": "<b>hi</b>"}]
                    }));
                then.status(202);
            })
            .await;

        let client = SendgridMailClient::new(
            "key-1",
            "noreply@example.com",
            vec!["audit@example.com".into()],
        )
        .with_endpoint(server.base_url());

        client
            .deliver(Mail {
                to: vec!["a@example.com".into(), "b@example.com".into()],
                subject: "Hello".into(),
                html: "<b>hi</b>".into(),
            })
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn sendgrid_rejection_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v3/mail/send");
                then.status(401).body("bad key");
            })
            .await;

        let client = SendgridMailClient::new("nope", "noreply@example.com", Vec::new())
            .with_endpoint(server.base_url());
        let err = client
            .deliver(Mail {
                to: vec!["a@example.com".into()],
                subject: "s".into(),
                html: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Rejected { status: 401, .. }));
    }
}
