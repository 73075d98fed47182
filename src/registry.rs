//! Handler registry.
//!
//! Handlers are registered explicitly into a builder at server construction;
//! the built registry is immutable thereafter. The active set is
//! `registered ∩ include-list (when non-empty) \ exclude-list`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::ChannelType;
use crate::handler::ChannelHandler;

/// Collects handlers before the server starts.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: Vec<Arc<dyn ChannelHandler>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Last registration for a type tag wins.
    pub fn register(mut self, handler: Arc<dyn ChannelHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Compute the active set and freeze the registry.
    pub fn build(self, include: &[ChannelType], exclude: &[ChannelType]) -> HandlerRegistry {
        let mut active: HashMap<ChannelType, Arc<dyn ChannelHandler>> = HashMap::new();
        for handler in self.handlers {
            let tag = handler.channel_type();
            if !include.is_empty() && !include.contains(&tag) {
                tracing::debug!(channel_type = %tag, "handler not in include list, skipping");
                continue;
            }
            if exclude.contains(&tag) {
                tracing::debug!(channel_type = %tag, "handler excluded, skipping");
                continue;
            }
            active.insert(tag, handler);
        }
        HandlerRegistry { handlers: active }
    }
}

/// Immutable map from channel type tag to its handler.
pub struct HandlerRegistry {
    handlers: HashMap<ChannelType, Arc<dyn ChannelHandler>>,
}

impl HandlerRegistry {
    pub fn get(&self, channel_type: &ChannelType) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(channel_type).cloned()
    }

    pub fn active(&self) -> impl Iterator<Item = &Arc<dyn ChannelHandler>> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
