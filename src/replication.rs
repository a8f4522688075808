//! Ready-made message vocabulary for multiplayer state replication.
//!
//! Covers the events a typical session replicates from the authoritative
//! side to its peers: entity spawns, movement updates and removals, input
//! actions, shared property changes, and a ping/pong pair for clock and
//! latency probes. Applications with their own vocabulary implement
//! [`Message`] on their own type instead; nothing else in the crate knows
//! about this module.

use crate::codec::CodecRegistry;
use crate::Message;
use serde::{Deserialize, Serialize};

/// Dispatch tag for [`ReplicationMessage`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationTag {
    /// [`ReplicationMessage::EntitySpawn`].
    EntitySpawn,
    /// [`ReplicationMessage::EntityUpdate`].
    EntityUpdate,
    /// [`ReplicationMessage::EntityRemove`].
    EntityRemove,
    /// [`ReplicationMessage::ActionBegin`].
    ActionBegin,
    /// [`ReplicationMessage::ActionEnd`].
    ActionEnd,
    /// [`ReplicationMessage::PropertyUpdate`].
    PropertyUpdate,
    /// [`ReplicationMessage::PropertyRemove`].
    PropertyRemove,
    /// [`ReplicationMessage::Ping`].
    Ping,
    /// [`ReplicationMessage::Pong`].
    Pong,
}

/// Input action replicated from the controlling side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputAction {
    /// Keyboard key, identified by its key code.
    Key(u32),
    /// Mouse button, identified by its button index.
    MouseButton(u8),
}

/// Value of a replicated shared property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Integer property.
    Int(i64),
    /// Floating point property.
    Double(f64),
    /// Boolean property.
    Bool(bool),
    /// String property.
    String(String),
}

/// One replicated multiplayer event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// An entity appeared and peers should create their copy of it.
    EntitySpawn {
        /// Stable id shared by every peer's copy of the entity.
        network_id: u64,
        /// Name of the spawn record to build the entity from.
        entity_name: String,
        /// Spawn x position.
        x: f64,
        /// Spawn y position.
        y: f64,
        /// Spawn z position.
        z: f64,
    },
    /// An entity moved.
    EntityUpdate {
        /// Id assigned at spawn.
        network_id: u64,
        /// New x position.
        x: f64,
        /// New y position.
        y: f64,
        /// New z position.
        z: f64,
    },
    /// An entity is gone and peers should remove their copy.
    EntityRemove {
        /// Id assigned at spawn.
        network_id: u64,
    },
    /// The peer started holding an input action.
    ActionBegin {
        /// The action being held.
        action: InputAction,
    },
    /// The peer released an input action.
    ActionEnd {
        /// The action released.
        action: InputAction,
    },
    /// A shared property changed value.
    PropertyUpdate {
        /// Property name.
        name: String,
        /// New value.
        value: PropertyValue,
    },
    /// A shared property was deleted.
    PropertyRemove {
        /// Property name.
        name: String,
    },
    /// Latency probe. The receiver answers with [`ReplicationMessage::Pong`].
    Ping {
        /// Sender clock at transmission, in milliseconds.
        time_sent_ms: u64,
    },
    /// Answer to [`ReplicationMessage::Ping`].
    Pong {
        /// Echo of the ping's send time.
        time_sent_ms: u64,
        /// Receiver clock when the ping arrived, in milliseconds.
        time_received_ms: u64,
    },
}

impl Message for ReplicationMessage {
    type Tag = ReplicationTag;

    fn tag(&self) -> ReplicationTag {
        match self {
            ReplicationMessage::EntitySpawn { .. } => ReplicationTag::EntitySpawn,
            ReplicationMessage::EntityUpdate { .. } => ReplicationTag::EntityUpdate,
            ReplicationMessage::EntityRemove { .. } => ReplicationTag::EntityRemove,
            ReplicationMessage::ActionBegin { .. } => ReplicationTag::ActionBegin,
            ReplicationMessage::ActionEnd { .. } => ReplicationTag::ActionEnd,
            ReplicationMessage::PropertyUpdate { .. } => ReplicationTag::PropertyUpdate,
            ReplicationMessage::PropertyRemove { .. } => ReplicationTag::PropertyRemove,
            ReplicationMessage::Ping { .. } => ReplicationTag::Ping,
            ReplicationMessage::Pong { .. } => ReplicationTag::Pong,
        }
    }
}

/// Register the postcard codec for [`ReplicationMessage`] on `registry`,
/// for both protocols and both directions.
pub fn register_replication_codecs(registry: &CodecRegistry) {
    registry.register_postcard::<ReplicationMessage>();
}
