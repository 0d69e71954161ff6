//! Template identifiers, their typed variables, and the built-in sources.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::TemplateError;

/// Identifies one renderable email template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    Otp,
    EmailVerification,
    Welcome,
    PasswordReset,
    PasswordChanged,
    BookingConfirmation,
    BookingCancellation,
    Notification,
}

impl TemplateId {
    pub const ALL: [TemplateId; 8] = [
        Self::Otp,
        Self::EmailVerification,
        Self::Welcome,
        Self::PasswordReset,
        Self::PasswordChanged,
        Self::BookingConfirmation,
        Self::BookingCancellation,
        Self::Notification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Otp => "otp",
            Self::EmailVerification => "email_verification",
            Self::Welcome => "welcome",
            Self::PasswordReset => "password_reset",
            Self::PasswordChanged => "password_changed",
            Self::BookingConfirmation => "booking_confirmation",
            Self::BookingCancellation => "booking_cancellation",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateId {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| TemplateError::NotFound(s.to_string()))
    }
}

/// A template together with the one variable shape it accepts.
///
/// Serialized as `{"template": "otp", "variables": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "template", content = "variables", rename_all = "snake_case")]
pub enum EmailTemplate {
    Otp(OtpVars),
    EmailVerification(VerificationVars),
    Welcome(WelcomeVars),
    PasswordReset(PasswordResetVars),
    PasswordChanged(PasswordChangedVars),
    BookingConfirmation(BookingConfirmationVars),
    BookingCancellation(BookingCancellationVars),
    Notification(NotificationVars),
}

impl EmailTemplate {
    pub fn id(&self) -> TemplateId {
        match self {
            Self::Otp(_) => TemplateId::Otp,
            Self::EmailVerification(_) => TemplateId::EmailVerification,
            Self::Welcome(_) => TemplateId::Welcome,
            Self::PasswordReset(_) => TemplateId::PasswordReset,
            Self::PasswordChanged(_) => TemplateId::PasswordChanged,
            Self::BookingConfirmation(_) => TemplateId::BookingConfirmation,
            Self::BookingCancellation(_) => TemplateId::BookingCancellation,
            Self::Notification(_) => TemplateId::Notification,
        }
    }

    /// The variables as the JSON object handed to the template engine.
    pub fn variables(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Otp(v) => serde_json::to_value(v),
            Self::EmailVerification(v) => serde_json::to_value(v),
            Self::Welcome(v) => serde_json::to_value(v),
            Self::PasswordReset(v) => serde_json::to_value(v),
            Self::PasswordChanged(v) => serde_json::to_value(v),
            Self::BookingConfirmation(v) => serde_json::to_value(v),
            Self::BookingCancellation(v) => serde_json::to_value(v),
            Self::Notification(v) => serde_json::to_value(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpVars {
    pub name: String,
    pub otp: String,
    pub expires_in: String,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationVars {
    pub name: String,
    pub verification_link: String,
    pub expires_in: String,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeVars {
    pub name: String,
    pub dashboard_url: String,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetVars {
    pub name: String,
    pub reset_link: String,
    pub expires_in: String,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChangedVars {
    pub name: String,
    pub changed_at: String,
    pub support_email: String,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingConfirmationVars {
    pub name: String,
    pub facility_name: String,
    pub booking_date: String,
    pub start_time: String,
    pub end_time: String,
    pub booking_reference: String,
    pub total_amount: String,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingCancellationVars {
    pub name: String,
    pub facility_name: String,
    pub booking_date: String,
    pub booking_reference: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationVars {
    pub name: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub action_label: Option<String>,
    pub app_name: String,
}

/// Raw handlebars source for a template: a subject line and an HTML fragment.
///
/// Subjects use triple-stash expressions since they are not HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub subject: String,
    pub body: String,
}

impl TemplateSource {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn builtin(id: TemplateId) -> Self {
        let (subject, body) = match id {
            TemplateId::Otp => (
                "Your {{{appName}}} verification code: {{{otp}}}",
                r#"<h2>Hi {{name}},</h2>
<p>Use the code below to continue signing in to {{appName}}.</p>
<p class="code">{{otp}}</p>
<p>This code expires in <strong>{{expiresIn}}</strong>. If you did not request it, you can safely ignore this email.</p>"#,
            ),
            TemplateId::EmailVerification => (
                "Verify your email address for {{{appName}}}",
                r#"<h2>Hi {{name}},</h2>
<p>Thanks for signing up to {{appName}}! Please confirm your email address.</p>
<p><a class="button" href="{{verificationLink}}">Verify email</a></p>
<p>This link expires in {{expiresIn}}.</p>"#,
            ),
            TemplateId::Welcome => (
                "Welcome to {{{appName}}}, {{{name}}}!",
                r#"<h2>Welcome aboard, {{name}}!</h2>
<p>Your {{appName}} account is ready. Find a facility, book a slot and get playing.</p>
<p><a class="button" href="{{dashboardUrl}}">Go to your dashboard</a></p>"#,
            ),
            TemplateId::PasswordReset => (
                "Reset your {{{appName}}} password",
                r#"<h2>Hi {{name}},</h2>
<p>We received a request to reset your password.</p>
<p><a class="button" href="{{resetLink}}">Reset password</a></p>
<p>This link expires in {{expiresIn}}. If you did not ask for a reset, no action is needed.</p>"#,
            ),
            TemplateId::PasswordChanged => (
                "Your {{{appName}}} password was changed",
                r#"<h2>Hi {{name}},</h2>
<p>The password for your {{appName}} account was changed on {{changedAt}}.</p>
<p>If this was not you, contact <a href="mailto:{{supportEmail}}">{{supportEmail}}</a> immediately.</p>"#,
            ),
            TemplateId::BookingConfirmation => (
                "Booking confirmed: {{{facilityName}}} on {{{bookingDate}}}",
                r#"<h2>Hi {{name}}, your booking is confirmed.</h2>
<table class="details">
<tr><td>Facility</td><td>{{facilityName}}</td></tr>
<tr><td>Date</td><td>{{bookingDate}}</td></tr>
<tr><td>Time</td><td>{{startTime}} - {{endTime}}</td></tr>
<tr><td>Reference</td><td>{{bookingReference}}</td></tr>
<tr><td>Total</td><td>{{totalAmount}}</td></tr>
</table>
<p>See you on court!</p>"#,
            ),
            TemplateId::BookingCancellation => (
                "Booking cancelled: {{{facilityName}}} on {{{bookingDate}}}",
                r#"<h2>Hi {{name}},</h2>
<p>Your booking {{bookingReference}} at {{facilityName}} on {{bookingDate}} has been cancelled.</p>
{{#if reason}}<p>Reason: {{reason}}</p>{{/if}}
<p>Any refund due will be processed to your original payment method.</p>"#,
            ),
            TemplateId::Notification => (
                "{{{title}}}",
                r#"<h2>Hi {{name}},</h2>
<h3>{{title}}</h3>
<p>{{message}}</p>
{{#if actionUrl}}<p><a class="button" href="{{actionUrl}}">{{#if actionLabel}}{{actionLabel}}{{else}}Open {{appName}}{{/if}}</a></p>{{/if}}"#,
            ),
        };
        Self::new(subject, body)
    }
}

/// Shared layout every rendered body is wrapped in.
pub(crate) const LAYOUT: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{{subject}}</title>
<style>
body { font-family: Arial, sans-serif; line-height: 1.6; color: #333; margin: 0; padding: 0; }
.container { max-width: 600px; margin: 0 auto; padding: 20px; }
.header { background: #f8f9fa; padding: 20px; text-align: center; border-radius: 8px 8px 0 0; }
.content { background: #fff; padding: 30px; border: 1px solid #dee2e6; }
.code { font-size: 32px; font-weight: bold; letter-spacing: 4px; text-align: center; }
.button { display: inline-block; padding: 12px 24px; background: #007bff; color: #fff; text-decoration: none; border-radius: 4px; }
.footer { padding: 20px; text-align: center; font-size: 12px; color: #666; }
</style>
</head>
<body>
<div class="container">
<div class="header"><h1>{{brand}}</h1></div>
<div class="content">
{{{content}}}
</div>
<div class="footer">
<p>&copy; {{year}} {{brand}}. All rights reserved.</p>
<p>This is an automated message, please do not reply.</p>
</div>
</div>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_ids_round_trip_through_names() {
        for id in TemplateId::ALL {
            assert_eq!(id.as_str().parse::<TemplateId>().unwrap(), id);
        }
        assert!(matches!(
            "newsletter".parse::<TemplateId>(),
            Err(TemplateError::NotFound(name)) if name == "newsletter"
        ));
    }

    #[test]
    fn email_template_uses_tagged_json() {
        let template = EmailTemplate::Otp(OtpVars {
            name: "Ada".into(),
            otp: "123456".into(),
            expires_in: "10 minutes".into(),
            app_name: "Playdoo".into(),
        });
        let json = serde_json::to_value(&template).unwrap();
        assert_eq!(json["template"], "otp");
        assert_eq!(json["variables"]["expiresIn"], "10 minutes");
        assert_eq!(json["variables"]["appName"], "Playdoo");

        let back: EmailTemplate = serde_json::from_value(json).unwrap();
        assert_eq!(back.id(), TemplateId::Otp);
    }
}
