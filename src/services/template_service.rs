//! Named email templates with `{{variable}}` placeholders.
//!
//! A placeholder with no matching variable is left in the output untouched,
//! so a missing value is visible instead of silently blank. Values inserted
//! into HTML bodies are escaped; subjects and text bodies take them verbatim.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Template variables by name.
pub type TemplateVars = HashMap<String, String>;

/// A stored template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    pub category: String,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

/// Output of rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedTemplate {
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    /// Placeholders that had no variable, in order of first appearance.
    pub unresolved: Vec<String>,
}

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").ok())
        .as_ref()
}

fn html_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn substitute(
    input: &str,
    vars: &TemplateVars,
    escape: bool,
    unresolved: &mut Vec<String>,
) -> String {
    let Some(re) = placeholder() else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) if escape => html_escape(value),
            Some(value) => value.clone(),
            None => {
                if !unresolved.iter().any(|u| u == name) {
                    unresolved.push(name.to_string());
                }
                caps[0].to_string()
            }
        }
    })
    .into_owned()
}

/// Substitutes `vars` into a template.
pub fn render(template: &EmailTemplate, vars: &TemplateVars) -> RenderedTemplate {
    let mut unresolved = Vec::new();
    let subject = substitute(&template.subject, vars, false, &mut unresolved);
    let html = template
        .html
        .as_deref()
        .map(|html| substitute(html, vars, true, &mut unresolved));
    let text = template
        .text
        .as_deref()
        .map(|text| substitute(text, vars, false, &mut unresolved));

    RenderedTemplate {
        subject,
        html,
        text,
        unresolved,
    }
}

/// Template registry seeded with the business templates.
pub struct TemplateService {
    templates: RwLock<HashMap<String, EmailTemplate>>,
}

impl Default for TemplateService {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateService {
    pub fn new() -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        Self {
            templates: RwLock::new(templates),
        }
    }

    /// Adds or replaces a template.
    pub fn register(&self, template: EmailTemplate) {
        debug!(template_id = %template.id, "Registered template");
        self.templates
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<EmailTemplate> {
        self.templates
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// All templates, sorted by id.
    pub fn list(&self) -> Vec<EmailTemplate> {
        let mut templates: Vec<EmailTemplate> = self
            .templates
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    pub fn render(&self, id: &str, vars: &TemplateVars) -> Result<RenderedTemplate> {
        let template = self
            .get(id)
            .ok_or_else(|| EngineError::not_found("template", id))?;
        let rendered = render(&template, vars);
        if !rendered.unresolved.is_empty() {
            debug!(
                template_id = %id,
                unresolved = ?rendered.unresolved,
                "Template rendered with unresolved placeholders"
            );
        }
        Ok(rendered)
    }
}

fn template(
    id: &str,
    name: &str,
    category: &str,
    subject: &str,
    html: &str,
    text: &str,
) -> EmailTemplate {
    EmailTemplate {
        id: id.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        subject: subject.to_string(),
        html: Some(html.to_string()),
        text: Some(text.to_string()),
    }
}

const FOOTER_HTML: &str =
    "<p style=\"color:#6b7280;font-size:12px\">{{company_name}} &middot; {{company_email}}</p>";

fn builtin_templates() -> Vec<EmailTemplate> {
    vec![
        template(
            "invoice",
            "Invoice",
            "business",
            "Invoice {{document_number}} from {{company_name}}",
            &format!(
                "<p>Dear {{{{client_name}}}},</p>\
                 <p>Please find invoice <strong>{{{{document_number}}}}</strong> for \
                 {{{{currency}}}} {{{{total_amount}}}}, due {{{{due_date}}}}.</p>\
                 <p>{{{{custom_message}}}}</p>{FOOTER_HTML}"
            ),
            "Dear {{client_name}},\n\nPlease find invoice {{document_number}} for \
             {{currency}} {{total_amount}}, due {{due_date}}.\n\n\
             {{custom_message}}\n\n{{company_name}}",
        ),
        template(
            "quote",
            "Quote",
            "business",
            "Quote {{document_number}} from {{company_name}}",
            &format!(
                "<p>Dear {{{{client_name}}}},</p>\
                 <p>Thank you for your interest. Quote <strong>{{{{document_number}}}}</strong> \
                 comes to {{{{currency}}}} {{{{total_amount}}}}.</p>\
                 <p>{{{{custom_message}}}}</p>{FOOTER_HTML}"
            ),
            "Dear {{client_name}},\n\nThank you for your interest. Quote {{document_number}} \
             comes to {{currency}} {{total_amount}}.\n\n{{custom_message}}\n\n{{company_name}}",
        ),
        template(
            "reminder_gentle",
            "Gentle reminder",
            "reminder",
            "Friendly reminder: invoice {{document_number}}",
            &format!(
                "<p>Hi {{{{client_name}}}},</p>\
                 <p>Just a reminder that invoice {{{{document_number}}}} for {{{{currency}}}} \
                 {{{{total_amount}}}} was due on {{{{due_date}}}}.</p>\
                 <p>{{{{custom_message}}}}</p>{FOOTER_HTML}"
            ),
            "Hi {{client_name}},\n\nJust a reminder that invoice {{document_number}} for \
             {{currency}} {{total_amount}} was due on {{due_date}}.\n\n{{custom_message}}",
        ),
        template(
            "reminder_firm",
            "Firm reminder",
            "reminder",
            "Payment overdue: invoice {{document_number}}",
            &format!(
                "<p>Dear {{{{client_name}}}},</p>\
                 <p>Invoice {{{{document_number}}}} is now {{{{days_overdue}}}} days overdue. \
                 Please arrange payment of {{{{currency}}}} {{{{total_amount}}}}.</p>\
                 <p>{{{{custom_message}}}}</p>{FOOTER_HTML}"
            ),
            "Dear {{client_name}},\n\nInvoice {{document_number}} is now {{days_overdue}} days \
             overdue. Please arrange payment of {{currency}} {{total_amount}}.\n\n\
             {{custom_message}}",
        ),
        template(
            "reminder_final",
            "Final notice",
            "reminder",
            "Final notice: invoice {{document_number}}",
            &format!(
                "<p>Dear {{{{client_name}}}},</p>\
                 <p>This is a final notice for invoice {{{{document_number}}}} \
                 ({{{{currency}}}} {{{{total_amount}}}}), {{{{days_overdue}}}} days overdue.</p>\
                 <p>{{{{custom_message}}}}</p>{FOOTER_HTML}"
            ),
            "Dear {{client_name}},\n\nThis is a final notice for invoice {{document_number}} \
             ({{currency}} {{total_amount}}), {{days_overdue}} days overdue.\n\n{{custom_message}}",
        ),
        template(
            "reminder_urgent",
            "Urgent reminder",
            "reminder",
            "Urgent: invoice {{document_number}} requires attention",
            &format!(
                "<p>Dear {{{{client_name}}}},</p>\
                 <p>Invoice {{{{document_number}}}} for {{{{currency}}}} {{{{total_amount}}}} \
                 requires immediate attention.</p>\
                 <p>{{{{custom_message}}}}</p>{FOOTER_HTML}"
            ),
            "Dear {{client_name}},\n\nInvoice {{document_number}} for {{currency}} \
             {{total_amount}} requires immediate attention.\n\n{{custom_message}}",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn simple() -> EmailTemplate {
        EmailTemplate {
            id: "t".into(),
            name: "T".into(),
            category: "custom".into(),
            subject: "Hello {{name}}".into(),
            html: Some("<p>{{ name }} owes {{amount}}</p>".into()),
            text: Some("{{name}} owes {{amount}}".into()),
        }
    }

    #[test]
    fn substitutes_and_keeps_unresolved_placeholders() {
        let out = render(&simple(), &vars(&[("name", "Ada")]));
        assert_eq!(out.subject, "Hello Ada");
        assert_eq!(out.html.as_deref(), Some("<p>Ada owes {{amount}}</p>"));
        assert_eq!(out.text.as_deref(), Some("Ada owes {{amount}}"));
        assert_eq!(out.unresolved, vec!["amount".to_string()]);
    }

    #[test]
    fn html_values_are_escaped_text_values_are_not() {
        let out = render(
            &simple(),
            &vars(&[("name", "<b>Tom & Jerry</b>"), ("amount", "5")]),
        );
        assert_eq!(
            out.html.as_deref(),
            Some("<p>&lt;b&gt;Tom &amp; Jerry&lt;/b&gt; owes 5</p>")
        );
        assert_eq!(out.text.as_deref(), Some("<b>Tom & Jerry</b> owes 5"));
        assert_eq!(out.subject, "Hello <b>Tom & Jerry</b>");
    }

    #[test]
    fn builtins_cover_business_flows() {
        let service = TemplateService::new();
        for id in [
            "invoice",
            "quote",
            "reminder_gentle",
            "reminder_firm",
            "reminder_final",
            "reminder_urgent",
        ] {
            assert!(service.get(id).is_some(), "missing {id}");
        }

        let out = service
            .render(
                "invoice",
                &vars(&[
                    ("client_name", "Acme"),
                    ("document_number", "INV-001"),
                    ("currency", "USD"),
                    ("total_amount", "150.00"),
                    ("due_date", "2025-02-01"),
                    ("custom_message", ""),
                    ("company_name", "Courier Co"),
                    ("company_email", "billing@courier.test"),
                ]),
            )
            .unwrap();
        assert_eq!(out.subject, "Invoice INV-001 from Courier Co");
        assert!(out.html.unwrap().contains("USD 150.00"));
        assert!(out.unresolved.is_empty());
    }

    #[test]
    fn unknown_template_is_not_found() {
        let service = TemplateService::new();
        assert!(matches!(
            service.render("nope", &TemplateVars::new()),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn register_replaces_existing() {
        let service = TemplateService::new();
        let mut custom = simple();
        custom.id = "invoice".into();
        service.register(custom);
        assert_eq!(service.get("invoice").unwrap().subject, "Hello {{name}}");
    }
}
