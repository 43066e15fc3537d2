//! Destination resolver: expands a matched rule into enabled channels.

use std::collections::HashMap;

use crate::error::DispatchError;
use crate::pipeline::template;
use crate::pipeline::types::{DestinationChannel, ForwardRule, IncomingMessage, RuleDestination};

/// A concrete place to deliver one matched rule's output.
#[derive(Debug, Clone)]
pub struct ResolvedDestination {
    pub destination_id: String,
    pub channel: DestinationChannel,
    /// Override template, or `None` to forward the raw body.
    pub template: Option<String>,
    pub action_config: serde_json::Value,
}

impl ResolvedDestination {
    /// Text to send for `message` through this destination.
    pub fn render(&self, message: &IncomingMessage) -> Result<String, DispatchError> {
        match &self.template {
            Some(t) => template::render(t, message),
            None => Ok(message.body.clone()),
        }
    }
}

/// Joins rule destinations with their channels.
#[derive(Debug, Default, Clone)]
pub struct DestinationResolver {
    channels: HashMap<String, DestinationChannel>,
    /// Per rule, in insertion order of the destination rows.
    by_rule: HashMap<String, Vec<RuleDestination>>,
}

impl DestinationResolver {
    /// `destinations` must already be in insertion order.
    pub fn new(channels: Vec<DestinationChannel>, destinations: Vec<RuleDestination>) -> Self {
        let channels = channels.into_iter().map(|c| (c.id.clone(), c)).collect();
        let mut by_rule: HashMap<String, Vec<RuleDestination>> = HashMap::new();
        for dest in destinations {
            by_rule.entry(dest.rule_id.clone()).or_default().push(dest);
        }
        Self { channels, by_rule }
    }

    /// Enabled destinations of `rule` whose channel is also enabled.
    pub fn resolve_destinations(&self, rule: &ForwardRule) -> Vec<ResolvedDestination> {
        let Some(destinations) = self.by_rule.get(&rule.id) else {
            return Vec::new();
        };

        destinations
            .iter()
            .filter(|d| d.is_enabled)
            .filter_map(|d| self.resolve_one(d))
            .collect()
    }

    /// The still-active binding for a (rule, channel) pair. `None` once the
    /// destination or its channel has been disabled or removed.
    pub fn resolve_binding(&self, rule_id: &str, channel_id: &str) -> Option<ResolvedDestination> {
        let dest = self
            .by_rule
            .get(rule_id)?
            .iter()
            .find(|d| d.channel_id == channel_id && d.is_enabled)?;
        self.resolve_one(dest)
    }

    fn resolve_one(&self, dest: &RuleDestination) -> Option<ResolvedDestination> {
        let channel = self.channels.get(&dest.channel_id)?;
        if !channel.is_enabled {
            return None;
        }
        let template = dest
            .override_text_template
            .as_ref()
            .filter(|t| !t.trim().is_empty())
            .cloned();
        Some(ResolvedDestination {
            destination_id: dest.id.clone(),
            channel: channel.clone(),
            template,
            action_config: dest.action_config.clone(),
        })
    }
}
