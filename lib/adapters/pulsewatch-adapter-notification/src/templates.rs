use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;

use pulsewatch_domain::{Channel, NotificationMessage};
use pulsewatch_ports::RenderedNotification;

pub const SMS_MAX_CHARS: usize = 160;

const SUBJECT: &str = "subject";
const EMAIL_BODY: &str = "email-body";
const SLACK_BODY: &str = "slack-body";
const SMS_BODY: &str = "sms-body";
const LOG_BODY: &str = "log-body";

/// Shared substitution vocabulary for every channel template.
#[derive(Debug, Serialize)]
struct TemplateContext<'a> {
    title: &'a str,
    message: &'a str,
    priority: &'static str,
    glyph: &'static str,
    timestamp: String,
}

impl<'a> TemplateContext<'a> {
    fn of(message: &'a NotificationMessage) -> Self {
        Self {
            title: &message.title,
            message: &message.body,
            priority: message.priority.as_str(),
            glyph: message.priority.glyph(),
            timestamp: message.created_at.to_rfc3339(),
        }
    }
}

/// Channel-specific renderers. Mail goes through an HTML-escaping registry,
/// everything else through a plain-text one.
pub struct Templates {
    html: Handlebars<'static>,
    text: Handlebars<'static>,
}

impl Templates {
    pub fn new() -> Result<Self> {
        let mut html = Handlebars::new();
        html.set_strict_mode(true);
        html.register_template_string(
            EMAIL_BODY,
            r#"<h2>{{title}}</h2>
<p>{{message}}</p>
<p><small>Priority: {{priority}} &middot; {{timestamp}}</small></p>"#,
        )
        .context("registering email-body template")?;

        let mut text = Handlebars::new();
        text.set_strict_mode(true);
        text.register_escape_fn(handlebars::no_escape);
        text.register_template_string(SUBJECT, "[{{priority}}] {{title}}")
            .context("registering subject template")?;
        text.register_template_string(SLACK_BODY, "{{glyph}} *{{title}}*\n{{message}}")
            .context("registering slack-body template")?;
        text.register_template_string(SMS_BODY, "[{{priority}}] {{title}}: {{message}}")
            .context("registering sms-body template")?;
        text.register_template_string(LOG_BODY, "{{title}} ({{priority}}): {{message}}")
            .context("registering log-body template")?;

        Ok(Self { html, text })
    }

    pub fn render(
        &self,
        message: &NotificationMessage,
        channel: Channel,
    ) -> Result<RenderedNotification> {
        let context = TemplateContext::of(message);
        let subject = self.text.render(SUBJECT, &context)?;

        let (body, content_type) = match channel {
            Channel::Email => (self.html.render(EMAIL_BODY, &context)?, "text/html"),
            Channel::Slack => (self.text.render(SLACK_BODY, &context)?, "text/plain"),
            Channel::Sms => (
                truncate_chars(&self.text.render(SMS_BODY, &context)?, SMS_MAX_CHARS),
                "text/plain",
            ),
            Channel::Webhook => (
                serde_json::to_string(&serde_json::json!({
                    "id": message.id,
                    "title": context.title,
                    "message": context.message,
                    "priority": context.priority,
                    "timestamp": context.timestamp,
                }))?,
                "application/json",
            ),
            Channel::Log => (self.text.render(LOG_BODY, &context)?, "text/plain"),
        };

        Ok(RenderedNotification {
            message_id: message.id.clone(),
            channel,
            priority: message.priority,
            subject,
            body,
            content_type: content_type.to_string(),
        })
    }
}

fn truncate_chars(raw: &str, max: usize) -> String {
    if raw.chars().count() <= max {
        return raw.to_string();
    }
    let mut cut: String = raw.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
