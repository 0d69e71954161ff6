//! The email job payload: what gets queued, and how it becomes an [`Email`].

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{Attachment, Email, MailError};
use crate::jobs::Priority;
use crate::templates::{EmailTemplate, Rendered};

/// Header carrying the queue job id on every composed message.
pub const JOB_ID_HEADER: &str = "X-Courier-Job-Id";

/// A request to send one templated email.
///
/// ```ignore
/// let data = EmailData::new(["ada@example.com"], EmailTemplate::Welcome(WelcomeVars {
///     name: "Ada".into(),
///     dashboard_url: "https://playdoo.app/home".into(),
///     app_name: "Playdoo".into(),
/// }))
/// .priority(Priority::High);
/// service.send_email(data, JobOpts::default()).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailData {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Overrides the template's rendered subject when set.
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(flatten)]
    pub template: EmailTemplate,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Earliest delivery time.
    #[serde(default)]
    pub send_at: Option<OffsetDateTime>,
    /// Sender override; the service default is used otherwise.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl EmailData {
    pub fn new(to: impl IntoIterator<Item = impl Into<String>>, template: EmailTemplate) -> Self {
        Self {
            to: to.into_iter().map(Into::into).collect(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: None,
            template,
            attachments: Vec::new(),
            priority: None,
            send_at: None,
            from: None,
            reply_to: None,
        }
    }

    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.bcc.push(address.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn send_at(mut self, at: OffsetDateTime) -> Self {
        self.send_at = Some(at);
        self
    }

    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    /// All recipients across to, cc and bcc.
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Compose the final message from rendered content.
    pub fn compose(
        &self,
        rendered: Rendered,
        default_from: &str,
        job_id: &str,
    ) -> Result<Email, MailError> {
        let mut builder = Email::builder()
            .from(self.from.as_deref().unwrap_or(default_from))
            .to_many(self.to.iter().cloned())
            .cc_many(self.cc.iter().cloned())
            .bcc_many(self.bcc.iter().cloned())
            .subject(self.subject.clone().unwrap_or(rendered.subject))
            .text(rendered.text)
            .html(rendered.html)
            .attachments(self.attachments.iter().cloned())
            .header(JOB_ID_HEADER, job_id);

        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::EmailBody;
    use crate::templates::WelcomeVars;

    fn welcome() -> EmailTemplate {
        EmailTemplate::Welcome(WelcomeVars {
            name: "Ada".into(),
            dashboard_url: "https://playdoo.app".into(),
            app_name: "Playdoo".into(),
        })
    }

    fn rendered() -> Rendered {
        Rendered {
            subject: "Welcome".into(),
            html: "<p>Hi</p>".into(),
            text: "Hi".into(),
        }
    }

    #[test]
    fn compose_uses_rendered_subject_and_default_sender() {
        let data = EmailData::new(["ada@example.com"], welcome()).bcc("audit@playdoo.app");
        let email = data.compose(rendered(), "noreply@playdoo.app", "job-1").unwrap();

        assert_eq!(email.subject, "Welcome");
        assert_eq!(email.from, "noreply@playdoo.app");
        assert_eq!(email.bcc, vec!["audit@playdoo.app"]);
        assert_eq!(email.header(JOB_ID_HEADER), Some("job-1"));
        assert!(matches!(email.body, EmailBody::Multipart { .. }));
    }

    #[test]
    fn compose_honours_overrides() {
        let data = EmailData::new(["ada@example.com"], welcome())
            .subject("Custom")
            .from("team@playdoo.app");
        let email = data.compose(rendered(), "noreply@playdoo.app", "job-1").unwrap();

        assert_eq!(email.subject, "Custom");
        assert_eq!(email.from, "team@playdoo.app");
    }

    #[test]
    fn json_shape_flattens_template() {
        let data = EmailData::new(["ada@example.com"], welcome());
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["template"], "welcome");
        assert_eq!(json["variables"]["name"], "Ada");

        let back: EmailData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }
}
