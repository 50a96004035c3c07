//! # Wire Codec
//!
//! The compact edit-packet codec and the server-side pipeline that turns a
//! sender's packet into tree mutations.
//!
//! A packet is one tag byte followed by its payload:
//! - add/edit/physics: bincode of `(entity id, property set)`
//! - clone: two raw 16-byte entity ids (source, then new)
//! - erase: `u16` little-endian count, then that many raw 16-byte ids; a
//!   short payload yields however many complete ids it holds, never a panic
//!
//! Decoding never trusts the sender: unknown tags and malformed payloads are
//! dropped with a log line, and [`process_edit_packet`] applies the rights
//! filters (host type, rez rights, lock rights, script whitelist) before the
//! tree sees anything.

use crate::error::{EntityError, EntityResult};
use crate::properties::{EntityHostType, EntityProperties};
use crate::tree::{EntityTree, PacketCounter};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};
use weald_common::{EntityId, SessionId};

// ============================================================================
// Packet framing
// ============================================================================

/// One-byte packet tags. The numbering is wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    AddEntity = 0x00,
    EditEntity = 0x01,
    EraseEntities = 0x02,
    CloneEntity = 0x03,
    EditEntityPhysics = 0x04,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(PacketType::AddEntity),
            0x01 => Some(PacketType::EditEntity),
            0x02 => Some(PacketType::EraseEntities),
            0x03 => Some(PacketType::CloneEntity),
            0x04 => Some(PacketType::EditEntityPhysics),
            _ => None,
        }
    }
}

/// A decoded edit packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EditMessage {
    Add {
        id: EntityId,
        properties: Box<EntityProperties>,
    },
    Edit {
        id: EntityId,
        properties: Box<EntityProperties>,
    },
    /// Transform/velocity/ownership only; anything else in the payload is
    /// discarded on apply.
    Physics {
        id: EntityId,
        properties: Box<EntityProperties>,
    },
    Erase {
        ids: Vec<EntityId>,
    },
    Clone {
        source_id: EntityId,
        new_id: EntityId,
    },
}

impl EditMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            EditMessage::Add { .. } => PacketType::AddEntity,
            EditMessage::Edit { .. } => PacketType::EditEntity,
            EditMessage::Erase { .. } => PacketType::EraseEntities,
            EditMessage::Clone { .. } => PacketType::CloneEntity,
            EditMessage::Physics { .. } => PacketType::EditEntityPhysics,
        }
    }

    fn counter(&self) -> PacketCounter {
        match self {
            EditMessage::Add { .. } => PacketCounter::Add,
            EditMessage::Edit { .. } => PacketCounter::Edit,
            EditMessage::Erase { .. } => PacketCounter::Erase,
            EditMessage::Clone { .. } => PacketCounter::Clone,
            EditMessage::Physics { .. } => PacketCounter::Physics,
        }
    }
}

pub fn encode_edit_message(message: &EditMessage) -> EntityResult<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u8(message.packet_type() as u8);
    match message {
        EditMessage::Add { id, properties }
        | EditMessage::Edit { id, properties }
        | EditMessage::Physics { id, properties } => {
            let payload = bincode::serialize(&(*id, properties.as_ref()))?;
            buf.extend_from_slice(&payload);
        }
        EditMessage::Erase { ids } => {
            if ids.len() > u16::MAX as usize {
                warn!("Erase packet truncated to {} of {} ids", u16::MAX, ids.len());
            }
            let count = ids.len().min(u16::MAX as usize);
            buf.put_u16_le(count as u16);
            for id in &ids[..count] {
                buf.put_slice(&id.to_rfc4122());
            }
        }
        EditMessage::Clone { source_id, new_id } => {
            buf.put_slice(&source_id.to_rfc4122());
            buf.put_slice(&new_id.to_rfc4122());
        }
    }
    Ok(buf.freeze())
}

pub fn decode_edit_message(packet: &[u8]) -> EntityResult<EditMessage> {
    let Some((&tag, payload)) = packet.split_first() else {
        return Err(EntityError::TruncatedPacket {
            needed: 1,
            remaining: 0,
        });
    };
    let Some(packet_type) = PacketType::from_u8(tag) else {
        return Err(EntityError::UnknownPacketType(tag));
    };
    match packet_type {
        PacketType::AddEntity => {
            let (id, properties): (EntityId, EntityProperties) = bincode::deserialize(payload)?;
            Ok(EditMessage::Add {
                id,
                properties: Box::new(properties),
            })
        }
        PacketType::EditEntity => {
            let (id, properties): (EntityId, EntityProperties) = bincode::deserialize(payload)?;
            Ok(EditMessage::Edit {
                id,
                properties: Box::new(properties),
            })
        }
        PacketType::EditEntityPhysics => {
            let (id, properties): (EntityId, EntityProperties) = bincode::deserialize(payload)?;
            Ok(EditMessage::Physics {
                id,
                properties: Box::new(properties),
            })
        }
        PacketType::EraseEntities => Ok(EditMessage::Erase {
            ids: decode_erase_ids(payload),
        }),
        PacketType::CloneEntity => {
            let source_id = read_id(payload, 0).ok_or(EntityError::TruncatedPacket {
                needed: 32,
                remaining: payload.len(),
            })?;
            let new_id = read_id(payload, 16).ok_or(EntityError::TruncatedPacket {
                needed: 32,
                remaining: payload.len(),
            })?;
            Ok(EditMessage::Clone { source_id, new_id })
        }
    }
}

/// Erase payload: count, then ids. Tolerates lying counts and ragged tails
/// by decoding only the complete ids actually present.
fn decode_erase_ids(payload: &[u8]) -> Vec<EntityId> {
    let Some(count_bytes) = payload.get(..2) else {
        return Vec::new();
    };
    let declared = u16::from_le_bytes([count_bytes[0], count_bytes[1]]) as usize;
    let available = (payload.len() - 2) / 16;
    if available < declared {
        debug!(
            "Erase packet declares {} ids but carries {}; using what is there",
            declared, available
        );
    }
    (0..declared.min(available))
        .filter_map(|i| read_id(payload, 2 + i * 16))
        .collect()
}

fn read_id(payload: &[u8], offset: usize) -> Option<EntityId> {
    let bytes: [u8; 16] = payload.get(offset..offset + 16)?.try_into().ok()?;
    Some(EntityId::from_rfc4122(bytes))
}

// ============================================================================
// Sender rights
// ============================================================================

/// What the network layer knows about the session behind a packet.
#[derive(Debug, Clone, Copy)]
pub struct Sender {
    pub id: SessionId,
    /// May create persistent entities.
    pub can_rez: bool,
    /// May create temporary (lifetime-capped) entities.
    pub can_rez_tmp: bool,
    /// May lock and unlock entities.
    pub can_adjust_locks: bool,
}

impl Sender {
    /// Full rights; what a domain's own services run with.
    pub fn trusted(id: SessionId) -> Self {
        Self {
            id,
            can_rez: true,
            can_rez_tmp: true,
            can_adjust_locks: true,
        }
    }

    pub fn untrusted(id: SessionId) -> Self {
        Self {
            id,
            can_rez: false,
            can_rez_tmp: false,
            can_adjust_locks: false,
        }
    }
}

// ============================================================================
// Packet pipeline
// ============================================================================

/// Decode one edit packet and apply it to the tree under the sender's
/// rights. Decode failures drop the packet (counted) and bubble the error
/// up for the transport's accounting.
pub fn process_edit_packet(
    tree: &EntityTree,
    packet: &[u8],
    sender: &Sender,
) -> EntityResult<()> {
    match decode_edit_message(packet) {
        Ok(message) => {
            tree.record_packet(message.counter(), packet.len());
            apply_edit_message(tree, &message, sender)
        }
        Err(error) => {
            tree.record_packet(PacketCounter::Dropped, packet.len());
            warn!("Dropping edit packet: {}", error);
            Err(error)
        }
    }
}

pub fn apply_edit_message(
    tree: &EntityTree,
    message: &EditMessage,
    sender: &Sender,
) -> EntityResult<()> {
    match message {
        EditMessage::Add { id, properties } => apply_add(tree, *id, properties, sender),
        EditMessage::Edit { id, properties } => apply_edit(tree, *id, properties, sender),
        EditMessage::Physics { id, properties } => apply_physics(tree, *id, properties, sender),
        EditMessage::Erase { ids } => {
            tree.delete_entities(ids, false);
            Ok(())
        }
        EditMessage::Clone { source_id, new_id } => apply_clone(tree, *source_id, *new_id, sender),
    }
}

fn apply_add(
    tree: &EntityTree,
    id: EntityId,
    properties: &EntityProperties,
    sender: &Sender,
) -> EntityResult<()> {
    // the wire only ever carries shared-world entities
    if tree.is_server() && properties.host_type.is_some_and(|h| h != EntityHostType::Domain) {
        warn!(
            "Refusing wire add of {:?} entity {} from {}",
            properties.host_type, id, sender.id
        );
        tree.note_failed_add(id);
        return Err(EntityError::HostTypeRefused);
    }
    if !sender.can_rez && !sender.can_rez_tmp {
        info!("Sender {} lacks rez rights; refusing add of {}", sender.id, id);
        tree.note_failed_add(id);
        return Err(EntityError::OwnershipRejected(id));
    }

    let mut properties = properties.clone();
    if !sender.can_rez
        && properties.cap_tmp_lifetime(tree.config().max_tmp_entity_lifetime_secs)
    {
        info!(
            "Capped lifetime of {} to {}s for tmp-rez sender {}",
            id,
            tree.config().max_tmp_entity_lifetime_secs,
            sender.id
        );
    }
    if !sender.can_adjust_locks && properties.locked.take().is_some() {
        debug!("Stripped locked flag from add of {} by {}", id, sender.id);
    }
    if properties.filter_script_whitelist(&tree.config().script_whitelist) {
        info!("Stripped non-whitelisted script from add of {}", id);
    }

    match tree.add_entity_from(id, &properties, sender.id) {
        Ok(_) => Ok(()),
        Err(error) => {
            tree.note_failed_add(id);
            Err(error)
        }
    }
}

fn apply_edit(
    tree: &EntityTree,
    id: EntityId,
    properties: &EntityProperties,
    sender: &Sender,
) -> EntityResult<()> {
    let mut properties = properties.clone();
    let mut filtered = false;
    if !sender.can_adjust_locks && properties.locked.take().is_some() {
        debug!("Stripped lock change on {} from {}", id, sender.id);
        filtered = true;
    }
    if properties.filter_script_whitelist(&tree.config().script_whitelist) {
        info!("Stripped non-whitelisted script from edit of {}", id);
        filtered = true;
    }
    // a modified edit no longer expresses the sender's bid
    if filtered {
        properties.clear_simulation_owner();
    }
    tree.update_entity_from(id, &properties, sender.id);
    Ok(())
}

/// Physics packets are trimmed to the motion fields before application, so a
/// mislabeled packet cannot smuggle a script or a lock change.
fn apply_physics(
    tree: &EntityTree,
    id: EntityId,
    properties: &EntityProperties,
    sender: &Sender,
) -> EntityResult<()> {
    let trimmed = EntityProperties {
        position: properties.position,
        rotation: properties.rotation,
        velocity: properties.velocity,
        angular_velocity: properties.angular_velocity,
        acceleration: properties.acceleration,
        gravity: properties.gravity,
        parent_id: properties.parent_id,
        parent_joint_index: properties.parent_joint_index,
        simulation_owner: properties.simulation_owner,
        last_edited: properties.last_edited,
        ..EntityProperties::new()
    };
    tree.update_entity_from(id, &trimmed, sender.id);
    Ok(())
}

fn apply_clone(
    tree: &EntityTree,
    source_id: EntityId,
    new_id: EntityId,
    sender: &Sender,
) -> EntityResult<()> {
    if !sender.can_rez && !sender.can_rez_tmp {
        info!(
            "Sender {} lacks rez rights; refusing clone of {}",
            sender.id, source_id
        );
        tree.note_failed_add(new_id);
        return Err(EntityError::OwnershipRejected(new_id));
    }
    let Some(source) = tree.find_entity(source_id) else {
        debug!("Clone of unknown entity {}; ignoring", source_id);
        tree.note_failed_add(new_id);
        return Err(EntityError::EntityNotFound(source_id));
    };
    if !source.clone.cloneable {
        info!("Entity {} is not cloneable; refusing clone", source_id);
        tree.note_failed_add(new_id);
        return Err(EntityError::OwnershipRejected(new_id));
    }
    if source.clone.clone_limit > 0 && source.clone_ids.len() as u32 >= source.clone.clone_limit {
        info!(
            "Entity {} reached its clone limit of {}; refusing clone",
            source_id, source.clone.clone_limit
        );
        tree.note_failed_add(new_id);
        return Err(EntityError::OwnershipRejected(new_id));
    }

    let properties = source.clone_properties(sender.id);
    match tree.add_entity_from(new_id, &properties, sender.id) {
        Ok(_) => Ok(()),
        Err(error) => {
            tree.note_failed_add(new_id);
            Err(error)
        }
    }
}
