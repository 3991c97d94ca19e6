use crate::protocol::Envelope;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const HACKER_FX: &str = "trigger_hacker_fx";
pub const FLASH: &str = "flash";

/// Named effects this session knows how to render, with their lifetimes.
#[derive(Clone, Debug)]
pub struct EffectCatalog {
    effects: HashMap<String, Duration>,
}

impl EffectCatalog {
    pub fn empty() -> Self {
        Self {
            effects: HashMap::new(),
        }
    }

    /// The built-in effects, each lasting `duration`.
    pub fn builtin(duration: Duration) -> Self {
        let mut catalog = Self::empty();
        catalog.register(HACKER_FX, duration);
        catalog.register(FLASH, duration);
        catalog
    }

    pub fn register(&mut self, name: impl Into<String>, duration: Duration) {
        self.effects.insert(name.into(), duration);
    }

    pub fn duration(&self, name: &str) -> Option<Duration> {
        self.effects.get(name).copied()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.effects.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Fire-and-forget effect triggers. Applying an effect only starts a local
/// expiry; nothing about it is shared with peers beyond the trigger itself.
#[derive(Debug)]
pub struct RemoteTriggerChannel {
    catalog: EffectCatalog,
    active: HashMap<String, Instant>,
}

impl RemoteTriggerChannel {
    pub fn new(catalog: EffectCatalog) -> Self {
        Self {
            catalog,
            active: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &EffectCatalog {
        &self.catalog
    }

    /// Applies `name` locally and returns the envelope to fan out.
    /// Unknown effects are neither applied nor sent.
    pub fn broadcast(&mut self, name: &str, now: Instant) -> Option<Envelope> {
        if !self.apply(name, now) {
            return None;
        }
        Some(Envelope::Command {
            name: name.to_string(),
        })
    }

    /// A trigger from a peer. Returns whether it was applied.
    pub fn on_command(&mut self, name: &str, now: Instant) -> bool {
        self.apply(name, now)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    pub fn active_effects(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.keys().cloned().collect();
        names.sort();
        names
    }

    /// Expires finished effects and returns their names.
    pub fn poll(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        self.active.retain(|name, until| {
            if *until <= now {
                expired.push(name.clone());
                false
            } else {
                true
            }
        });
        expired.sort();
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.values().copied().min()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    fn apply(&mut self, name: &str, now: Instant) -> bool {
        let Some(duration) = self.catalog.duration(name) else {
            debug!(target: "ghost_lab::trigger", effect = name, "unknown effect ignored");
            return false;
        };
        // re-triggering restarts the effect
        self.active.insert(name.to_string(), now + duration);
        true
    }
}
