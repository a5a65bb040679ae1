//! Built-in email templates.
//!
//! Each template takes a typed payload. Payload strings are HTML-escaped
//! before they reach the HTML body; the plain-text body uses them as is.

use atelier_common::{AppError, AppResult};
use atelier_db::entities::email_message::MessageType;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use validator::Validate;

/// A rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub html: String,
    /// Plain text body.
    pub text: String,
}

/// Renders a template key against payload data.
pub trait TemplateRenderer: Send + Sync {
    /// Render `template_key` with `payload`.
    fn render(&self, template_key: &str, payload: &serde_json::Value) -> AppResult<RenderedEmail>;

    /// Default topic and message type for a template, if it is known.
    fn defaults(&self, template_key: &str) -> Option<(&'static str, MessageType)>;
}

/// Keys of the built-in templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKey {
    /// Account created.
    AuthWelcome,
    /// Confirm an email address.
    AuthVerifyEmail,
    /// Password reset link.
    AuthPasswordReset,
    /// Contact form acknowledgement.
    ContactReceived,
    /// New blog post.
    BlogPublished,
    /// News digest.
    NewsDigest,
}

impl TemplateKey {
    /// Every built-in template.
    pub const ALL: [Self; 6] = [
        Self::AuthWelcome,
        Self::AuthVerifyEmail,
        Self::AuthPasswordReset,
        Self::ContactReceived,
        Self::BlogPublished,
        Self::NewsDigest,
    ];

    /// Parse a template key.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }

    /// Stored key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthWelcome => "auth-welcome",
            Self::AuthVerifyEmail => "auth-verify-email",
            Self::AuthPasswordReset => "auth-password-reset",
            Self::ContactReceived => "contact-received",
            Self::BlogPublished => "blog-published",
            Self::NewsDigest => "news-digest",
        }
    }

    /// Topic used when the caller does not pick one.
    #[must_use]
    pub const fn default_topic(self) -> &'static str {
        match self {
            Self::AuthWelcome | Self::AuthVerifyEmail | Self::AuthPasswordReset => "auth",
            Self::ContactReceived => "contact",
            Self::BlogPublished => "blog",
            Self::NewsDigest => "news",
        }
    }

    /// Message category.
    #[must_use]
    pub const fn message_type(self) -> MessageType {
        match self {
            Self::AuthWelcome | Self::AuthVerifyEmail | Self::AuthPasswordReset => {
                MessageType::Transactional
            }
            Self::ContactReceived => MessageType::System,
            Self::BlogPublished | Self::NewsDigest => MessageType::Editorial,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct WelcomePayload {
    #[validate(length(max = 200))]
    name: Option<String>,
    #[validate(url)]
    dashboard_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct VerifyEmailPayload {
    #[validate(length(max = 200))]
    name: Option<String>,
    #[validate(url)]
    verify_url: String,
    #[serde(default = "default_verify_hours")]
    expires_in_hours: u32,
}

const fn default_verify_hours() -> u32 {
    24
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct PasswordResetPayload {
    #[validate(length(max = 200))]
    name: Option<String>,
    #[validate(url)]
    reset_url: String,
    #[serde(default = "default_reset_minutes")]
    expires_in_minutes: u32,
}

const fn default_reset_minutes() -> u32 {
    60
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ContactReceivedPayload {
    #[validate(length(min = 1, max = 200))]
    name: String,
    #[validate(length(min = 1, max = 5000))]
    message: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct BlogPublishedPayload {
    #[validate(length(min = 1, max = 300))]
    title: String,
    excerpt: Option<String>,
    #[validate(url)]
    url: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct NewsDigestPayload {
    headline: Option<String>,
    #[validate(length(min = 1, max = 50), nested)]
    items: Vec<DigestItem>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct DigestItem {
    #[validate(length(min = 1, max = 300))]
    title: String,
    #[validate(url)]
    url: String,
    summary: Option<String>,
}

/// The templates shipped with atelier.
#[derive(Debug, Clone)]
pub struct BuiltinTemplates {
    site_name: String,
    site_url: String,
}

impl BuiltinTemplates {
    /// Create templates branded for a site.
    #[must_use]
    pub fn new(site_name: impl Into<String>, site_url: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            site_url: site_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn welcome(&self, p: WelcomePayload) -> RenderedEmail {
        let site = &self.site_name;
        let name = p.name.as_deref().unwrap_or("there");
        let dashboard = p.dashboard_url.unwrap_or_else(|| self.site_url.clone());

        RenderedEmail {
            subject: format!("Welcome to {site}"),
            text: format!(
                "Hi {name},\n\nWelcome to {site}! Your account is ready.\n\nGet started: {dashboard}\n"
            ),
            html: self.wrap_html(&format!(
                "<p>Hi {},</p>\
                 <p>Welcome to <strong>{}</strong>! Your account is ready.</p>\
                 <p>{}</p>",
                escape_html(name),
                escape_html(site),
                button(&dashboard, "Get started"),
            )),
        }
    }

    fn verify_email(&self, p: VerifyEmailPayload) -> RenderedEmail {
        let site = &self.site_name;
        let name = p.name.as_deref().unwrap_or("there");
        let hours = p.expires_in_hours;

        RenderedEmail {
            subject: format!("Verify your email for {site}"),
            text: format!(
                "Hi {name},\n\nConfirm your email address for {site}:\n{}\n\n\
                 This link expires in {hours} hours.\n",
                p.verify_url
            ),
            html: self.wrap_html(&format!(
                "<p>Hi {},</p>\
                 <p>Confirm your email address for {}.</p>\
                 <p>{}</p>\
                 <p><small>This link expires in {hours} hours.</small></p>",
                escape_html(name),
                escape_html(site),
                button(&p.verify_url, "Verify email"),
            )),
        }
    }

    fn password_reset(&self, p: PasswordResetPayload) -> RenderedEmail {
        let site = &self.site_name;
        let name = p.name.as_deref().unwrap_or("there");
        let minutes = p.expires_in_minutes;

        RenderedEmail {
            subject: format!("Reset your {site} password"),
            text: format!(
                "Hi {name},\n\nSomeone asked to reset the password for your {site} account.\n\
                 Reset it here (valid for {minutes} minutes):\n{}\n\n\
                 If this wasn't you, you can ignore this email.\n",
                p.reset_url
            ),
            html: self.wrap_html(&format!(
                "<p>Hi {},</p>\
                 <p>Someone asked to reset the password for your {} account.</p>\
                 <p>{}</p>\
                 <p><small>The link is valid for {minutes} minutes. \
                 If this wasn't you, you can ignore this email.</small></p>",
                escape_html(name),
                escape_html(site),
                button(&p.reset_url, "Reset password"),
            )),
        }
    }

    fn contact_received(&self, p: ContactReceivedPayload) -> RenderedEmail {
        let site = &self.site_name;

        RenderedEmail {
            subject: format!("We received your message - {site}"),
            text: format!(
                "Hi {},\n\nThanks for reaching out. We'll get back to you soon.\n\n\
                 Your message:\n{}\n",
                p.name, p.message
            ),
            html: self.wrap_html(&format!(
                "<p>Hi {},</p>\
                 <p>Thanks for reaching out. We'll get back to you soon.</p>\
                 <blockquote>{}</blockquote>",
                escape_html(&p.name),
                escape_html(&p.message).replace('\n', "<br>"),
            )),
        }
    }

    fn blog_published(&self, p: BlogPublishedPayload) -> RenderedEmail {
        let excerpt_text = p.excerpt.as_deref().map(|e| format!("{e}\n\n")).unwrap_or_default();
        let excerpt_html = p
            .excerpt
            .as_deref()
            .map(|e| format!("<p>{}</p>", escape_html(e)))
            .unwrap_or_default();

        RenderedEmail {
            subject: format!("New post: {}", p.title),
            text: format!("{}\n\n{excerpt_text}Read it: {}\n", p.title, p.url),
            html: self.wrap_html(&format!(
                "<h2>{}</h2>{excerpt_html}<p>{}</p>",
                escape_html(&p.title),
                button(&p.url, "Read the post"),
            )),
        }
    }

    fn news_digest(&self, p: NewsDigestPayload) -> RenderedEmail {
        let headline = p
            .headline
            .clone()
            .unwrap_or_else(|| format!("{} news digest", self.site_name));

        let mut text = format!("{headline}\n\n");
        let mut items_html = String::new();
        for item in &p.items {
            text.push_str(&format!("- {}: {}\n", item.title, item.url));
            if let Some(summary) = &item.summary {
                text.push_str(&format!("  {summary}\n"));
            }
            items_html.push_str(&format!(
                "<li><a href=\"{}\">{}</a>{}</li>",
                escape_html(&item.url),
                escape_html(&item.title),
                item.summary
                    .as_deref()
                    .map(|s| format!("<br><small>{}</small>", escape_html(s)))
                    .unwrap_or_default(),
            ));
        }

        RenderedEmail {
            subject: headline.clone(),
            text,
            html: self.wrap_html(&format!(
                "<h2>{}</h2><ul>{items_html}</ul>",
                escape_html(&headline)
            )),
        }
    }

    fn wrap_html(&self, content: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px; }}
        a {{ color: #1f6feb; }}
        blockquote {{ margin: 10px 0; padding: 10px 20px; border-left: 4px solid #e9ecef; background: #f8f9fa; }}
    </style>
</head>
<body>
    {content}
    <hr style="margin-top: 40px; border: none; border-top: 1px solid #e9ecef;">
    <p style="font-size: 12px; color: #6c757d;">Sent by <a href="{}">{}</a>.</p>
</body>
</html>"#,
            escape_html(&self.site_url),
            escape_html(&self.site_name)
        )
    }
}

impl TemplateRenderer for BuiltinTemplates {
    fn render(&self, template_key: &str, payload: &serde_json::Value) -> AppResult<RenderedEmail> {
        let key = TemplateKey::parse(template_key)
            .ok_or_else(|| AppError::Template(format!("Unknown template: {template_key}")))?;

        Ok(match key {
            TemplateKey::AuthWelcome => self.welcome(parse(key, payload)?),
            TemplateKey::AuthVerifyEmail => self.verify_email(parse(key, payload)?),
            TemplateKey::AuthPasswordReset => self.password_reset(parse(key, payload)?),
            TemplateKey::ContactReceived => self.contact_received(parse(key, payload)?),
            TemplateKey::BlogPublished => self.blog_published(parse(key, payload)?),
            TemplateKey::NewsDigest => self.news_digest(parse(key, payload)?),
        })
    }

    fn defaults(&self, template_key: &str) -> Option<(&'static str, MessageType)> {
        TemplateKey::parse(template_key).map(|key| (key.default_topic(), key.message_type()))
    }
}

fn parse<T: DeserializeOwned + Validate>(key: TemplateKey, payload: &serde_json::Value) -> AppResult<T> {
    // Absent payloads render like an empty object so all-optional templates work.
    let value = if payload.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        payload.clone()
    };
    let data: T = serde_json::from_value(value)
        .map_err(|e| AppError::Template(format!("Invalid payload for {}: {e}", key.as_str())))?;
    data.validate()?;
    Ok(data)
}

fn button(href: &str, label: &str) -> String {
    format!(
        "<a href=\"{}\" style=\"display:inline-block;padding:12px 24px;background:#1f6feb;\
         color:#fff;text-decoration:none;border-radius:4px;\">{}</a>",
        escape_html(href),
        escape_html(label)
    )
}

/// Escape text for HTML element and attribute content.
#[must_use]
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
