//! Outbound webhook notifications.
//!
//! The summary of every apply is POSTed to the configured URL. A template
//! may wrap the payload: `${summary}` expands to the quote-escaped summary
//! JSON, `${summary.<field>}` to an individual field value.

use async_trait::async_trait;
use regex::Regex;

use strata_core::{Config, Summary};

const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("http `{0}`")]
    Http(#[from] reqwest::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),
}

/// Capability for pushing an apply summary to an external system.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &Summary) -> Result<String, NotifierError>;
}

/// Returns the webhook notifier when a URL is configured, no-op otherwise.
pub fn new_notifier(config: &Config) -> Box<dyn Notifier> {
    match &config.web_hook_url {
        Some(url) if !url.is_empty() => Box::new(WebHookNotifier::new(config)),
        _ => Box::new(NoopNotifier),
    }
}

pub struct WebHookNotifier {
    config: Config,
    client: reqwest::Client,
}

impl WebHookNotifier {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn render_payload(&self, summary: &Summary) -> Result<String, NotifierError> {
        let payload = serde_json::to_string_pretty(summary)?;

        let Some(template) = self
            .config
            .web_hook_template
            .as_deref()
            .filter(|t| !t.is_empty())
        else {
            return Ok(payload);
        };

        let mut rendered = template.to_owned();
        if rendered.contains("${summary}") {
            rendered = rendered.replace("${summary}", &payload.replace('"', "\\\""));
        }
        if rendered.contains("${summary.") {
            let value = serde_json::to_value(summary)?;
            let fields = Regex::new(r"\$\{summary\.([a-zA-Z]+)\}").unwrap();
            rendered = fields
                .replace_all(&rendered, |caps: &regex::Captures| {
                    match value.get(&caps[1]) {
                        Some(field) => match field.as_str() {
                            Some(s) => s.to_owned(),
                            None => field.to_string(),
                        },
                        None => "null".to_owned(),
                    }
                })
                .into_owned();
        }

        Ok(rendered)
    }
}

#[async_trait]
impl Notifier for WebHookNotifier {
    async fn notify(&self, summary: &Summary) -> Result<String, NotifierError> {
        let payload = self.render_payload(summary)?;
        let url = self.config.web_hook_url.as_deref().unwrap_or_default();

        let mut request = self.client.post(url).body(payload);

        let mut has_content_type = false;
        for header in &self.config.web_hook_headers {
            if let Some((name, value)) = header.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-type") {
                    has_content_type = true;
                }
                request = request.header(name.trim(), value.trim());
            }
        }
        if !has_content_type {
            request = request.header("Content-Type", DEFAULT_CONTENT_TYPE);
        }

        let response = request.send().await?;
        Ok(response.text().await?)
    }
}

/// Used when no webhook URL is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _summary: &Summary) -> Result<String, NotifierError> {
        Ok("noop".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Migration;

    fn config(template: Option<&str>) -> Config {
        let mut yaml = String::from(
            r#"
baseLocation: migrations
driver: postgres
dataSource: postgres://localhost/app
webHookURL: https://hooks.example.com/services/TOKEN
"#,
        );
        if let Some(template) = template {
            yaml.push_str(&format!("webHookTemplate: '{template}'\n"));
        }
        Config::from_yaml(&yaml).unwrap()
    }

    fn summary() -> Summary {
        let migrations = vec![Migration {
            name: "a.sql".to_owned(),
            source_dir: "tenants".to_owned(),
            file: "tenants/a.sql".to_owned(),
            migration_type: strata_core::MigrationType::TenantMigration,
            contents: String::new(),
            check_sum: String::new(),
        }];
        let mut s = Summary::classified(chrono::Utc::now(), &migrations, 2);
        s.version_id = 7;
        s
    }

    #[test]
    fn default_payload_is_the_summary_json() {
        let notifier = WebHookNotifier::new(&config(None));
        let payload = notifier.render_payload(&summary()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["versionId"], 7);
        assert_eq!(value["tenantMigrationsTotal"], 2);
    }

    #[test]
    fn template_substitutes_the_whole_summary_escaped() {
        let notifier =
            WebHookNotifier::new(&config(Some(r#"{"text": "${summary}"}"#)));
        let payload = notifier.render_payload(&summary()).unwrap();
        assert!(payload.starts_with(r#"{"text": "#));
        assert!(payload.contains(r#"\"versionId\""#));
    }

    #[test]
    fn template_substitutes_individual_fields() {
        let notifier = WebHookNotifier::new(&config(Some(
            "version ${summary.versionId}: ${summary.tenantMigrations} tenant migrations",
        )));
        let payload = notifier.render_payload(&summary()).unwrap();
        assert_eq!(payload, "version 7: 1 tenant migrations");
    }
}
