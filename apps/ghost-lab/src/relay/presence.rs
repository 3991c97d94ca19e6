use crate::protocol::Envelope;
use crate::transport::PeerId;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub origin: Origin,
    /// Sender for remote messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerId>,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub kind: MessageKind,
}

/// Result of advancing the presence timers.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PresenceTick {
    /// `Typing(false)` to send because the local compose burst went idle.
    pub outbound: Option<Envelope>,
    /// Remotes whose typing indicator hit the safety timeout.
    pub cleared: Vec<PeerId>,
}

/// Chat history plus typing presence in both directions.
///
/// Local side: one `Typing(true)` per compose burst, `Typing(false)` once the
/// buffer empties or stays untouched for `compose_idle`. Remote side: one
/// expiring flag per peer, cleared explicitly or after `remote_timeout`.
#[derive(Debug)]
pub struct PresenceChannel {
    messages: Vec<ChatMessage>,
    compose_idle: Duration,
    remote_timeout: Duration,
    local_typing: bool,
    compose_deadline: Option<Instant>,
    remote_typing: HashMap<PeerId, Instant>,
}

impl PresenceChannel {
    pub fn new(compose_idle: Duration, remote_timeout: Duration) -> Self {
        Self {
            messages: Vec::new(),
            compose_idle,
            remote_timeout,
            local_typing: false,
            compose_deadline: None,
            remote_typing: HashMap::new(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_local_typing(&self) -> bool {
        self.local_typing
    }

    /// Appends the local message and returns the envelope to send, or `None`
    /// when there is nothing to say or nobody to say it to. Whitespace-only
    /// text counts as nothing; anything else is sent exactly as typed.
    pub fn send_chat(
        &mut self,
        text: &str,
        connected: bool,
        now: OffsetDateTime,
    ) -> Option<Envelope> {
        if text.trim().is_empty() || !connected {
            return None;
        }
        self.messages.push(ChatMessage {
            origin: Origin::Local,
            peer: None,
            text: text.to_string(),
            timestamp: now,
            kind: MessageKind::Text,
        });
        Some(Envelope::Chat {
            text: text.to_string(),
        })
    }

    pub fn on_chat(&mut self, peer: PeerId, text: String, now: OffsetDateTime) -> &ChatMessage {
        // a chat implies the sender finished composing
        self.remote_typing.remove(&peer);
        self.messages.push(ChatMessage {
            origin: Origin::Remote,
            peer: Some(peer),
            text,
            timestamp: now,
            kind: MessageKind::Text,
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn update_compose(&mut self, buffer: &str, now: Instant) -> Option<Envelope> {
        if buffer.is_empty() {
            self.compose_deadline = None;
            if self.local_typing {
                self.local_typing = false;
                return Some(Envelope::Typing { active: false });
            }
            return None;
        }
        self.compose_deadline = Some(now + self.compose_idle);
        if self.local_typing {
            return None;
        }
        self.local_typing = true;
        Some(Envelope::Typing { active: true })
    }

    pub fn on_typing(&mut self, peer: PeerId, active: bool, now: Instant) {
        if active {
            self.remote_typing.insert(peer, now + self.remote_timeout);
        } else {
            self.remote_typing.remove(&peer);
        }
    }

    pub fn is_remote_typing(&self, peer: &PeerId) -> bool {
        self.remote_typing.contains_key(peer)
    }

    pub fn typing_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.remote_typing.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.remote_typing.remove(peer);
    }

    pub fn poll(&mut self, now: Instant) -> PresenceTick {
        let mut tick = PresenceTick::default();
        if self.compose_deadline.is_some_and(|deadline| deadline <= now) {
            self.compose_deadline = None;
            if self.local_typing {
                self.local_typing = false;
                tick.outbound = Some(Envelope::Typing { active: false });
            }
        }
        self.remote_typing.retain(|peer, deadline| {
            if *deadline <= now {
                tick.cleared.push(peer.clone());
                false
            } else {
                true
            }
        });
        tick.cleared.sort();
        tick
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.remote_typing
            .values()
            .copied()
            .chain(self.compose_deadline)
            .min()
    }
}
