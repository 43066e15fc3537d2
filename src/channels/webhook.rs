//! Webhook sender: POSTs the rendered text plus message metadata as JSON.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::channels::{
    ChannelSender, DispatchRequest, SendProgress, config_str, rejection, transport_error,
};
use crate::error::DispatchError;
use crate::pipeline::types::ChannelType;

pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(
        &self,
        request: &DispatchRequest<'_>,
        _progress: &SendProgress,
    ) -> Result<String, DispatchError> {
        let config = &request.channel.config;
        let url = parse_url(config_str(config, "url")?)?;
        let headers = extra_headers(config)?;

        let resp = self
            .client
            .post(url)
            .headers(headers)
            .json(&payload(request))
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }

        // Receivers may return their own id; otherwise mint one.
        let body = resp.text().await.unwrap_or_default();
        let id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| match v.get("id") {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| format!("wh_{}", Uuid::new_v4()));
        Ok(id)
    }
}

fn parse_url(raw: &str) -> Result<reqwest::Url, DispatchError> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| DispatchError::ConfigInvalid(format!("config.url '{raw}' is invalid: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(DispatchError::ConfigInvalid(format!(
            "config.url scheme '{other}' is not http(s)"
        ))),
    }
}

/// Optional `config.headers` object of string values.
fn extra_headers(config: &Value) -> Result<HeaderMap, DispatchError> {
    let mut map = HeaderMap::new();
    let Some(headers) = config.get("headers") else {
        return Ok(map);
    };
    let Some(obj) = headers.as_object() else {
        return Err(DispatchError::ConfigInvalid(
            "config.headers must be an object".into(),
        ));
    };
    for (name, value) in obj {
        let value = value.as_str().ok_or_else(|| {
            DispatchError::ConfigInvalid(format!("config.headers.{name} must be a string"))
        })?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DispatchError::ConfigInvalid(format!("bad header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DispatchError::ConfigInvalid(format!("bad value for header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn payload(request: &DispatchRequest<'_>) -> Value {
    let message = request.message;
    json!({
        "text": request.text,
        "rule_id": request.rule_id,
        "channel_id": request.channel.id,
        "message": {
            "id": message.id,
            "endpoint_id": message.endpoint_id,
            "from_number": message.from_number,
            "to_number": message.to_number,
            "body": message.body,
            "received_at": message.received_at.to_rfc3339(),
            "raw_payload": message.raw_payload,
        },
    })
}
