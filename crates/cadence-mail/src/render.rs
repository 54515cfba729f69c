//! Template personalization — `{{variable}}` substitution from lead fields.
//!
//! Supported placeholders: `{{first_name}}`, `{{last_name}}`,
//! `{{full_name}}`, `{{company}}`, `{{email}}`. Unknown placeholders are
//! left in place so a typo is visible in the sent mail rather than
//! silently dropped.

use cadence_core::types::{Lead, OutboundEmail, Template};

/// Render one string against a lead's fields.
pub fn render(input: &str, lead: &Lead) -> String {
    let first = lead.first_name.as_deref().unwrap_or("");
    let last = lead.last_name.as_deref().unwrap_or("");
    let full = match (first.is_empty(), last.is_empty()) {
        (false, false) => format!("{first} {last}"),
        (false, true) => first.to_string(),
        (true, false) => last.to_string(),
        (true, true) => String::new(),
    };
    input
        .replace("{{first_name}}", first)
        .replace("{{last_name}}", last)
        .replace("{{full_name}}", &full)
        .replace("{{company}}", lead.company.as_deref().unwrap_or(""))
        .replace("{{email}}", &lead.email)
}

/// Render a stage template into a ready-to-send email addressed to the lead.
/// A template without a text body gets one stripped from the HTML.
pub fn render_email(template: &Template, lead: &Lead) -> OutboundEmail {
    let html_body = render(&template.html_body, lead);
    let text_body = if template.text_body.is_empty() {
        strip_html(&html_body)
    } else {
        render(&template.text_body, lead)
    };
    OutboundEmail {
        to: lead.email.clone(),
        subject: render(&template.subject, lead),
        html_body,
        text_body,
    }
}

fn strip_html(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead() -> Lead {
        Lead {
            id: "l1".into(),
            account_id: "acme".into(),
            email: "jo@prospect.test".into(),
            first_name: Some("Jo".into()),
            last_name: Some("Nguyen".into()),
            company: Some("Prospect Co".into()),
        }
    }

    #[test]
    fn test_render_fields() {
        let out = render("Hi {{first_name}} at {{company}} ({{full_name}})", &lead());
        assert_eq!(out, "Hi Jo at Prospect Co (Jo Nguyen)");
    }

    #[test]
    fn test_missing_fields_render_empty() {
        let mut l = lead();
        l.first_name = None;
        l.company = None;
        let out = render("Hi {{first_name}}{{company}} / {{full_name}}", &l);
        assert_eq!(out, "Hi  / Nguyen");
    }

    #[test]
    fn test_unknown_placeholder_left_alone() {
        let out = render("{{nickname}}", &lead());
        assert_eq!(out, "{{nickname}}");
    }

    #[test]
    fn test_render_email_strips_html_for_missing_text() {
        let template = Template {
            subject: "Quick question, {{first_name}}".into(),
            html_body: "<p>Hello {{first_name}}</p>".into(),
            text_body: String::new(),
        };
        let email = render_email(&template, &lead());
        assert_eq!(email.to, "jo@prospect.test");
        assert_eq!(email.subject, "Quick question, Jo");
        assert_eq!(email.text_body, "Hello Jo");
    }
}
