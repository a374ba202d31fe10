//! Discord-compatible webhook transport.
//!
//! A single shared `reqwest::Client` (constructed once in the orchestrator)
//! is cloned into every dispatcher; dispatch failures are logged and
//! swallowed, never surfaced to the caller.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

#[derive(Serialize)]
struct WebhookBody {
    embeds: [Embed; 1],
}

/// POSTs `{"embeds":[embed]}` to `url`. Blank/whitespace-only URLs are
/// skipped before any network call; failures are logged at `warn` and
/// never propagated.
pub async fn post_embed(client: &reqwest::Client, url: &str, embed: Embed) {
    let url = url.trim();
    if url.is_empty() {
        return;
    }

    let body = WebhookBody { embeds: [embed] };
    match client.post(url).json(&body).send().await {
        Ok(resp) if !resp.status().is_success() => {
            tracing::warn!(url, status = %resp.status(), "webhook dispatch rejected");
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "webhook dispatch failed");
        }
        Ok(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blank_url_skips_network_call() {
        let client = reqwest::Client::new();
        post_embed(&client, "   ", Embed::default()).await;
    }

    #[test]
    fn test_embed_serializes_without_empty_fields() {
        let embed = Embed {
            title: Some("Player joined".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&embed).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("title"));
        assert!(!obj.contains_key("description"));
        assert!(!obj.contains_key("fields"));
    }
}
