//! Per-kind handlers fed by envelope dispatch: terminal bytes, presence and
//! effect triggers.

pub mod presence;
pub mod terminal;
pub mod trigger;

pub use presence::{ChatMessage, MessageKind, Origin, PresenceChannel, PresenceTick};
pub use terminal::{
    BroadcastReport, InputRoute, RelayStats, TerminalDisplay, TerminalRelay, broadcast,
    broadcast_output,
};
pub use trigger::{EffectCatalog, RemoteTriggerChannel};
