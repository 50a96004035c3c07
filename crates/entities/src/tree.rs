//! # Entity Tree
//!
//! The façade over the octree and the registry: every mutation, query and
//! protocol interaction goes through [`EntityTree`].
//!
//! Responsibilities:
//! - add/update/delete orchestration via the tree operators
//! - server-side simulation-ownership arbitration (priority + expiry bidding)
//! - certificate bookkeeping and the nonce challenge protocol
//! - deferred parent fixup for out-of-order network delivery
//! - recently-deleted tracking for peers that missed a deletion
//! - spatial query entry points with the try-lock accuracy contract
//! - the per-tick `update()` driving fixups, the simulation and challenge
//!   deadlines
//!
//! Locking: one `RwLock` guards the octree + registry pair (they mutate
//! together); the certificate tracker, deletion records, fixup queue and
//! avatar tables each sit behind their own mutex so they never serialize
//! against spatial mutation. Validators, verifiers, transports and observers
//! are invoked only while the core lock is NOT held; snapshots are cloned out
//! first. The one exception is the simulation's per-tick pass, which runs
//! under the write lock so it can mutate entities in place.

use crate::challenge::{
    decode_challenge_payload, decode_challenge_relay, encode_challenge_payload,
    encode_challenge_relay, ChallengeOutcome, ChallengeTracker, ChallengeTransport, PopVerdict,
    PurchaseValidator, SignatureVerifier,
};
use crate::config::TreeConfig;
use crate::element::Octree;
use crate::entity::{dirty, Entity};
use crate::error::{EntityError, EntityResult};
use crate::operators::{AddEntityOperator, DeleteEntitiesOperator, UpdateEntityOperator};
use crate::properties::{EntityHostType, EntityProperties};
use crate::queries::{self, EntityScan, ParabolaHit, PickFilter, RayHit};
use crate::registry::EntityStore;
use crate::simulation::EntitySimulation;
use glam::Vec3;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use weald_common::{
    now_usec, AABox, AACube, EntityId, Frustum, Parabola, Ray, SessionId, SimulationOwner,
    USECS_PER_MSEC,
};

/// Deletion records younger than the query time by up to this much are still
/// reported, absorbing clock slop between peers.
const DELETED_ENTITIES_SLOP_USEC: u64 = 50 * USECS_PER_MSEC;

// ============================================================================
// Support types
// ============================================================================

/// The octree and the registry mutate together; this pair is what the tree's
/// write lock actually protects.
struct TreeCore {
    octree: Octree,
    store: EntityStore,
}

impl TreeCore {
    fn new(domain_scale: f32) -> Self {
        Self {
            octree: Octree::new(domain_scale),
            store: EntityStore::new(),
        }
    }
}

/// How a query should treat the tree lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Block until the read lock is available.
    Lock,
    /// Give up if the lock is contended; the result comes back with
    /// `accurate = false` and must not be trusted.
    TryLock,
}

/// A query result plus whether the tree lock was actually held for it.
#[derive(Debug, Clone, Copy)]
pub struct QueryOutcome<T> {
    pub result: T,
    pub accurate: bool,
}

/// Counters over the edit packet pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditStats {
    pub total_packets: u64,
    pub add_packets: u64,
    pub edit_packets: u64,
    pub erase_packets: u64,
    pub clone_packets: u64,
    pub physics_packets: u64,
    pub dropped_packets: u64,
    pub bytes_processed: u64,
}

/// Which counter an edit packet lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCounter {
    Add,
    Edit,
    Erase,
    Clone,
    Physics,
    Dropped,
}

/// Outcome of arbitrating one ownership claim.
enum Claim {
    /// Apply the edit with this (possibly promoted/refreshed) owner record.
    Accept(SimulationOwner),
    /// Keep the edit but strip ownership and physics details from it.
    Reject,
    /// Discard the whole edit.
    Suspect,
}

type CreationObserver = Box<dyn Fn(&Entity) + Send + Sync>;
type DeletionObserver = Box<dyn Fn(EntityId) + Send + Sync>;

// ============================================================================
// EntityTree
// ============================================================================

/// The concurrently-shared entity tree. All methods take `&self`; internal
/// locks provide the required exclusion.
pub struct EntityTree {
    config: TreeConfig,
    core: RwLock<TreeCore>,

    challenges: Mutex<ChallengeTracker>,
    /// Server: deletion timestamps for peers (epoch usec → ids).
    recently_deleted: Mutex<BTreeMap<u64, Vec<EntityId>>>,
    /// Client: ids deleted locally, drained by the uplink.
    locally_deleted: Mutex<Vec<EntityId>>,
    needs_parent_fixup: Mutex<Vec<EntityId>>,
    /// Avatar sessions the server has been told about.
    avatars: Mutex<HashSet<SessionId>>,
    /// Entities hooked to an avatar rather than another entity, for bulk
    /// purge on disconnect.
    children_of_avatars: Mutex<HashMap<SessionId, Vec<EntityId>>>,

    simulation: Mutex<Option<Box<dyn EntitySimulation>>>,
    validator: Mutex<Option<Arc<dyn PurchaseValidator>>>,
    verifier: Mutex<Option<Arc<dyn SignatureVerifier>>>,
    transport: Mutex<Option<Arc<dyn ChallengeTransport>>>,

    creation_observers: Mutex<Vec<CreationObserver>>,
    deletion_observers: Mutex<Vec<DeletionObserver>>,

    stats: Mutex<EditStats>,
    dirty: AtomicBool,
}

impl EntityTree {
    pub fn new(config: TreeConfig) -> Self {
        let core = TreeCore::new(config.domain_scale);
        Self {
            config,
            core: RwLock::new(core),
            challenges: Mutex::new(ChallengeTracker::new()),
            recently_deleted: Mutex::new(BTreeMap::new()),
            locally_deleted: Mutex::new(Vec::new()),
            needs_parent_fixup: Mutex::new(Vec::new()),
            avatars: Mutex::new(HashSet::new()),
            children_of_avatars: Mutex::new(HashMap::new()),
            simulation: Mutex::new(None),
            validator: Mutex::new(None),
            verifier: Mutex::new(None),
            transport: Mutex::new(None),
            creation_observers: Mutex::new(Vec::new()),
            deletion_observers: Mutex::new(Vec::new()),
            stats: Mutex::new(EditStats::default()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn is_server(&self) -> bool {
        self.config.is_server
    }

    // ------------------------------------------------------------------------
    // Collaborators & observers
    // ------------------------------------------------------------------------

    pub fn set_simulation(&self, simulation: Box<dyn EntitySimulation>) {
        *self.simulation.lock() = Some(simulation);
    }

    pub fn set_purchase_validator(&self, validator: Arc<dyn PurchaseValidator>) {
        *self.validator.lock() = Some(validator);
    }

    pub fn set_signature_verifier(&self, verifier: Arc<dyn SignatureVerifier>) {
        *self.verifier.lock() = Some(verifier);
    }

    pub fn set_challenge_transport(&self, transport: Arc<dyn ChallengeTransport>) {
        *self.transport.lock() = Some(transport);
    }

    pub fn add_creation_observer(&self, observer: CreationObserver) {
        self.creation_observers.lock().push(observer);
    }

    pub fn add_deletion_observer(&self, observer: DeletionObserver) {
        self.deletion_observers.lock().push(observer);
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn entity_count(&self) -> usize {
        self.core.read().store.len()
    }

    pub fn element_count(&self) -> usize {
        self.core.read().octree.element_count()
    }

    /// Snapshot of one entity; the null-element rule applies, so an entity
    /// mid-removal reads as absent.
    pub fn find_entity(&self, id: EntityId) -> Option<Entity> {
        self.core.read().store.find(id).cloned()
    }

    /// Property snapshot for render/script layers.
    pub fn entity_properties(&self, id: EntityId) -> Option<EntityProperties> {
        self.core.read().store.find(id).map(Entity::to_properties)
    }

    /// Run `f` over every live entity under the read lock.
    pub fn for_each_entity(&self, mut f: impl FnMut(&Entity)) {
        let core = self.core.read();
        for entity in core.store.iter() {
            if entity.in_tree() {
                f(entity);
            }
        }
    }

    pub fn edit_stats(&self) -> EditStats {
        *self.stats.lock()
    }

    pub(crate) fn record_packet(&self, counter: PacketCounter, bytes: usize) {
        let mut stats = self.stats.lock();
        stats.total_packets += 1;
        stats.bytes_processed += bytes as u64;
        match counter {
            PacketCounter::Add => stats.add_packets += 1,
            PacketCounter::Edit => stats.edit_packets += 1,
            PacketCounter::Erase => stats.erase_packets += 1,
            PacketCounter::Clone => stats.clone_packets += 1,
            PacketCounter::Physics => stats.physics_packets += 1,
            PacketCounter::Dropped => stats.dropped_packets += 1,
        }
    }

    /// True when the tree changed since [`mark_clean`](Self::mark_clean);
    /// persistence uses this to decide when to write.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Add
    // ------------------------------------------------------------------------

    /// Add from a local, trusted source (persistence load, scripts, tests).
    /// Certificate duplication rules still apply server-side, but no nonce
    /// challenge is started because there is no node to challenge.
    pub fn add_entity(&self, id: EntityId, properties: &EntityProperties) -> EntityResult<EntityId> {
        self.add_entity_inner(id, properties, None)
    }

    /// Add on behalf of a network sender; server-side certificate validation
    /// challenges that sender.
    pub fn add_entity_from(
        &self,
        id: EntityId,
        properties: &EntityProperties,
        sender: SessionId,
    ) -> EntityResult<EntityId> {
        self.add_entity_inner(id, properties, Some(sender))
    }

    fn add_entity_inner(
        &self,
        id: EntityId,
        properties: &EntityProperties,
        sender: Option<SessionId>,
    ) -> EntityResult<EntityId> {
        let now = now_usec();
        let snapshot;
        {
            let mut core = self.core.write();
            let TreeCore { octree, store } = &mut *core;

            if store.contains(id) {
                warn!("Refusing to add entity {}: id already present", id);
                return Err(EntityError::EntityExists(id));
            }
            let Some(entity) = Entity::from_properties(id, properties, now) else {
                return Err(EntityError::decode("add without an entity kind"));
            };
            let cube = entity.query_aacube;
            let parent_id = entity.parent_id;
            let clone_origin = entity.clone_origin_id;
            if !store.insert(entity) {
                return Err(EntityError::EntityExists(id));
            }
            AddEntityOperator::new(id, cube).apply(octree, store);

            if !clone_origin.is_null() {
                if let Some(origin) = store.get_raw_mut(clone_origin) {
                    origin.clone_ids.push(id);
                }
            }
            if !parent_id.is_null() {
                store.link_parent(id, parent_id);
                if store.resolve_ancestry(id).is_none() {
                    self.enqueue_parent_fixup(id);
                }
            }
            snapshot = store.get_raw(id).cloned();
        }
        self.mark_dirty();

        // Certificate rule: one live entity per certificate. The newcomer
        // displaces the prior holder and skips the rest of the add path.
        let certificate = if self.config.is_server {
            properties.certificate_id.clone().filter(|c| !c.is_empty())
        } else {
            None
        };
        if let Some(cert) = certificate.as_deref() {
            let displaced = self.challenges.lock().register_holder(cert, id);
            if let Some(prior) = displaced {
                self.delete_entities_inner(&[prior], true, true);
                return Ok(id);
            }
        }

        if let Some(entity) = snapshot {
            if let Some(simulation) = self.simulation.lock().as_mut() {
                simulation.add_entity(&entity);
            }
            for observer in self.creation_observers.lock().iter() {
                observer(&entity);
            }
        }
        // certified rezzes over the wire must survive proof-of-purchase
        if let (Some(cert), Some(sender)) = (certificate.as_deref(), sender) {
            self.validate_proof_of_purchase(cert, id, sender, now);
        }
        // give any children that arrived before us a chance to hook up
        self.fixup_missing_parents();
        Ok(id)
    }

    fn enqueue_parent_fixup(&self, id: EntityId) {
        let mut queue = self.needs_parent_fixup.lock();
        if !queue.contains(&id) {
            queue.push(id);
        }
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    /// Edit from a local, trusted source; no ownership arbitration.
    pub fn update_entity(&self, id: EntityId, properties: &EntityProperties) -> bool {
        self.update_entity_inner(id, properties, None)
    }

    /// Edit on behalf of a network sender; the server arbitrates any
    /// ownership claim the edit carries.
    pub fn update_entity_from(
        &self,
        id: EntityId,
        properties: &EntityProperties,
        sender: SessionId,
    ) -> bool {
        self.update_entity_inner(id, properties, Some(sender))
    }

    fn update_entity_inner(
        &self,
        id: EntityId,
        properties: &EntityProperties,
        sender: Option<SessionId>,
    ) -> bool {
        let now = now_usec();
        let snapshot;
        {
            let mut core = self.core.write();
            let TreeCore { octree, store } = &mut *core;

            let Some(entity) = store.find(id) else {
                debug!("Edit for unknown entity {}; ignoring", id);
                return false;
            };
            let locked = entity.locked;
            let current_owner = entity.simulation_owner;
            let old_parent = entity.parent_id;

            // Locked entities accept exactly one kind of edit: the unlock.
            let mut effective = if locked {
                if properties.locked == Some(false) {
                    EntityProperties {
                        locked: Some(false),
                        last_edited: properties.last_edited,
                        ..EntityProperties::new()
                    }
                } else {
                    debug!("Refusing edit of locked entity {}", id);
                    return false;
                }
            } else {
                properties.clone()
            };

            if self.config.is_server {
                if let (Some(sender), Some(claim)) = (sender, effective.simulation_owner) {
                    match arbitrate_claim(
                        current_owner,
                        claim,
                        sender,
                        now,
                        self.config.ownership.grace_usec,
                    ) {
                        Claim::Accept(owner) => effective.simulation_owner = Some(owner),
                        Claim::Reject => {
                            debug!(
                                "Ownership claim on {} by {} rejected; stripping physics",
                                id, sender
                            );
                            effective.clear_simulation_owner();
                            effective.strip_physics_details();
                        }
                        Claim::Suspect => {
                            warn!(
                                "Suspect edit of {} from {}: claimed owner differs; dropped",
                                id, sender
                            );
                            return false;
                        }
                    }
                }
            }

            let cascade = effective.has_transform_changes() || effective.parent_id.is_some();
            let Some(entity) = store.get_raw_mut(id) else {
                return false;
            };
            if !entity.apply_properties(&effective, now) {
                return true;
            }
            let new_cube = entity.query_aacube;
            let new_parent = entity.parent_id;
            UpdateEntityOperator::new(id, new_cube).apply(octree, store);

            if new_parent != old_parent {
                if !old_parent.is_null() {
                    store.unlink_parent(id, old_parent);
                }
                if !new_parent.is_null() {
                    store.link_parent(id, new_parent);
                    if store.resolve_ancestry(id).is_none() {
                        self.enqueue_parent_fixup(id);
                    }
                }
            }

            if cascade {
                for descendant in store.descendants_of(id) {
                    let Some(child) = store.get_raw_mut(descendant) else {
                        continue;
                    };
                    child.refresh_query_aacube();
                    child.dirty_flags |= dirty::TRANSFORM;
                    let child_cube = child.query_aacube;
                    UpdateEntityOperator::new(descendant, child_cube).apply(octree, store);
                }
            }

            snapshot = store.get_raw(id).cloned();
        }
        self.mark_dirty();

        if let Some(entity) = snapshot {
            if entity.is_simulated() || entity.dirty_flags & dirty::PHYSICS != 0 {
                if let Some(simulation) = self.simulation.lock().as_mut() {
                    simulation.change_entity(&entity);
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------------

    /// Delete one entity and its (non-avatar) descendants. Locked entities
    /// refuse. Unknown ids are a logged no-op.
    pub fn delete_entity(&self, id: EntityId) -> bool {
        !self.delete_entities_inner(&[id], false, false).is_empty()
    }

    /// Delete ignoring the locked flag. Used by the certificate protocol and
    /// the simulation's dead list.
    pub fn force_delete_entity(&self, id: EntityId) -> bool {
        !self.delete_entities_inner(&[id], true, false).is_empty()
    }

    pub fn delete_entities(&self, ids: &[EntityId], force: bool) -> usize {
        self.delete_entities_inner(ids, force, false).len()
    }

    fn delete_entities_inner(
        &self,
        ids: &[EntityId],
        force: bool,
        ignore_warnings: bool,
    ) -> Vec<EntityId> {
        let now = now_usec();
        let mut removed: Vec<Entity>;
        {
            let mut core = self.core.write();
            let TreeCore { octree, store } = &mut *core;

            let mut doomed: Vec<EntityId> = Vec::new();
            let mut seen: HashSet<EntityId> = HashSet::new();
            let mut unhook: Vec<EntityId> = Vec::new();
            for &id in ids {
                if seen.contains(&id) {
                    continue;
                }
                let Some(entity) = store.get_raw(id) else {
                    if !ignore_warnings {
                        debug!("Delete of unknown entity {}; ignoring", id);
                    }
                    continue;
                };
                if entity.locked && !force {
                    info!("Refusing to delete locked entity {}", id);
                    continue;
                }
                seen.insert(id);
                doomed.push(id);
                // descend; avatar entities are unhooked, not deleted
                let mut queue: VecDeque<EntityId> = store.children_of(id).to_vec().into();
                while let Some(child_id) = queue.pop_front() {
                    if !seen.insert(child_id) {
                        continue;
                    }
                    match store.get_raw(child_id) {
                        Some(child) if child.host_type == EntityHostType::AvatarLocal => {
                            unhook.push(child_id);
                        }
                        Some(_) => {
                            doomed.push(child_id);
                            queue.extend(store.children_of(child_id).iter().copied());
                        }
                        None => {}
                    }
                }
            }

            for child_id in unhook {
                let Some(child) = store.get_raw_mut(child_id) else {
                    continue;
                };
                let old_parent = child.parent_id;
                child.parent_id = EntityId::null();
                child.dirty_flags |= dirty::PARENT;
                store.unlink_parent(child_id, old_parent);
            }

            // clone back-references
            for &id in &doomed {
                let Some(entity) = store.get_raw(id) else {
                    continue;
                };
                let origin = entity.clone_origin_id;
                let clone_ids = entity.clone_ids.clone();
                if !origin.is_null() {
                    if let Some(origin_entity) = store.get_raw_mut(origin) {
                        origin_entity.clone_ids.retain(|c| *c != id);
                    }
                }
                for clone_id in clone_ids {
                    if let Some(clone) = store.get_raw_mut(clone_id) {
                        clone.clone_origin_id = EntityId::null();
                    }
                }
            }

            removed = DeleteEntitiesOperator::new(doomed).apply(octree, store);
        }
        if removed.is_empty() {
            return Vec::new();
        }
        self.mark_dirty();

        let removed_ids: Vec<EntityId> = removed.iter().map(|e| e.id).collect();
        {
            let mut queue = self.needs_parent_fixup.lock();
            queue.retain(|id| !removed_ids.contains(id));
        }
        {
            let mut table = self.children_of_avatars.lock();
            for children in table.values_mut() {
                children.retain(|id| !removed_ids.contains(id));
            }
        }

        if self.config.is_server {
            {
                let mut tracker = self.challenges.lock();
                for entity in &removed {
                    if let Some(cert) = entity.certificate_id.as_deref() {
                        tracker.release(cert, entity.id);
                    }
                }
            }
            self.recently_deleted
                .lock()
                .entry(now)
                .or_default()
                .extend(removed_ids.iter().copied());
        } else {
            self.locally_deleted.lock().extend(removed_ids.iter().copied());
        }

        {
            let mut simulation = self.simulation.lock();
            if let Some(simulation) = simulation.as_mut() {
                for entity in &mut removed {
                    simulation.prepare_entity_for_delete(entity);
                }
            }
        }
        {
            let observers = self.deletion_observers.lock();
            for &id in &removed_ids {
                for observer in observers.iter() {
                    observer(id);
                }
            }
        }
        removed_ids
    }

    // ------------------------------------------------------------------------
    // Parent fixup & avatars
    // ------------------------------------------------------------------------

    /// Declare an avatar session; entities naming it as parent resolve
    /// against this set rather than the registry.
    pub fn declare_avatar(&self, session: SessionId) {
        self.avatars.lock().insert(session);
    }

    pub fn undeclare_avatar(&self, session: SessionId) {
        self.avatars.lock().remove(&session);
    }

    /// Force-delete every entity hooked to `session`. Called when an avatar
    /// disconnects.
    pub fn delete_descendants_of_avatar(&self, session: SessionId) -> usize {
        let children = self
            .children_of_avatars
            .lock()
            .remove(&session)
            .unwrap_or_default();
        if children.is_empty() {
            return 0;
        }
        info!(
            "Purging {} entities of departed avatar {}",
            children.len(),
            session
        );
        self.delete_entities_inner(&children, true, true).len()
    }

    pub fn pending_parent_fixups(&self) -> usize {
        self.needs_parent_fixup.lock().len()
    }

    /// One resolution pass over the pending-parent queue. Entities whose
    /// ancestor chain now resolves get their cube re-derived, dirty flags
    /// OR-ed in (motion type, collision group, transform) down the subtree
    /// and their octree placement refreshed; the parent's cube is grown to
    /// keep the hooked child query-visible through it. Unresolved entries
    /// requeue for the next tick.
    pub fn fixup_missing_parents(&self) {
        let pending: Vec<EntityId> = std::mem::take(&mut *self.needs_parent_fixup.lock());
        if pending.is_empty() {
            return;
        }
        let avatars: HashSet<SessionId> = self.avatars.lock().clone();
        let mut still_pending: Vec<EntityId> = Vec::new();
        let mut avatar_hooks: Vec<(SessionId, EntityId)> = Vec::new();
        let mut snapshots: Vec<Entity> = Vec::new();
        {
            let mut core = self.core.write();
            let TreeCore { octree, store } = &mut *core;
            for id in pending {
                let Some(entity) = store.get_raw(id) else {
                    continue; // deleted while pending
                };
                if !entity.has_parent() {
                    continue; // re-parented to none while pending
                }
                let parent_id = entity.parent_id;
                let avatar_parent = avatars.contains(&SessionId(parent_id.0));
                let resolved = store.resolve_ancestry(id).is_some() || avatar_parent;
                if !resolved {
                    still_pending.push(id);
                    continue;
                }
                if avatar_parent {
                    avatar_hooks.push((SessionId(parent_id.0), id));
                }

                let new_cube = {
                    let Some(entity) = store.get_raw_mut(id) else {
                        continue;
                    };
                    if entity.needs_new_query_cube() {
                        entity.refresh_query_aacube();
                    }
                    entity.dirty_flags |=
                        dirty::MOTION_TYPE | dirty::COLLISION_GROUP | dirty::TRANSFORM;
                    entity.query_aacube
                };
                UpdateEntityOperator::new(id, new_cube).apply(octree, store);
                for descendant in store.descendants_of(id) {
                    if let Some(child) = store.get_raw_mut(descendant) {
                        child.dirty_flags |=
                            dirty::MOTION_TYPE | dirty::COLLISION_GROUP | dirty::TRANSFORM;
                    }
                }

                // grow the parent's cube so the child stays query-visible
                // through its ancestor
                if !avatar_parent {
                    if let Some(parent) = store.get_raw(parent_id) {
                        let parent_cube = parent.query_aacube;
                        if !parent_cube.contains_cube(&new_cube) {
                            let mut bounds =
                                AABox::new(parent_cube.corner, Vec3::splat(parent_cube.scale));
                            bounds.embiggen_to_contain(&AABox::new(
                                new_cube.corner,
                                Vec3::splat(new_cube.scale),
                            ));
                            let grown = bounds.bounding_cube();
                            if let Some(parent) = store.get_raw_mut(parent_id) {
                                parent.query_aacube = grown;
                            }
                            UpdateEntityOperator::new(parent_id, grown).apply(octree, store);
                        }
                    }
                }

                if let Some(entity) = store.get_raw(id) {
                    debug!("Parent of {} resolved after deferral", id);
                    snapshots.push(entity.clone());
                }
            }
        }

        if !avatar_hooks.is_empty() {
            let mut table = self.children_of_avatars.lock();
            for (session, id) in avatar_hooks {
                let children = table.entry(session).or_default();
                if !children.contains(&id) {
                    children.push(id);
                }
            }
        }
        if !still_pending.is_empty() {
            let mut queue = self.needs_parent_fixup.lock();
            for id in still_pending {
                if !queue.contains(&id) {
                    queue.push(id);
                }
            }
        }
        if !snapshots.is_empty() {
            self.mark_dirty();
            if let Some(simulation) = self.simulation.lock().as_mut() {
                for entity in &snapshots {
                    simulation.change_entity(entity);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Recently deleted
    // ------------------------------------------------------------------------

    /// Server: were any entities deleted at or after `since` (minus the slop
    /// window)?
    pub fn has_entities_deleted_since(&self, since: u64) -> bool {
        let cutoff = since.saturating_sub(DELETED_ENTITIES_SLOP_USEC);
        self.recently_deleted
            .lock()
            .range(cutoff..)
            .next()
            .is_some()
    }

    /// Server: ids deleted at or after `since` (minus the slop window).
    pub fn entities_deleted_since(&self, since: u64) -> Vec<EntityId> {
        let cutoff = since.saturating_sub(DELETED_ENTITIES_SLOP_USEC);
        self.recently_deleted
            .lock()
            .range(cutoff..)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Server: drop deletion records strictly older than `before`.
    pub fn forget_entities_deleted_before(&self, before: u64) {
        let mut records = self.recently_deleted.lock();
        let keep = records.split_off(&before);
        *records = keep;
    }

    /// Client: note an id the server told us is gone (without it ever being
    /// in our tree).
    pub fn track_deleted_entity(&self, id: EntityId) {
        self.locally_deleted.lock().push(id);
    }

    /// A refused add still gets a deletion record, so the sender that
    /// optimistically created the entity un-creates it.
    pub(crate) fn note_failed_add(&self, id: EntityId) {
        if self.config.is_server {
            self.recently_deleted
                .lock()
                .entry(now_usec())
                .or_default()
                .push(id);
        }
    }

    /// Client: drain locally-deleted ids for the uplink.
    pub fn take_locally_deleted_entities(&self) -> Vec<EntityId> {
        std::mem::take(&mut *self.locally_deleted.lock())
    }

    // ------------------------------------------------------------------------
    // Certificate challenge
    // ------------------------------------------------------------------------

    fn validate_proof_of_purchase(
        &self,
        certificate_id: &str,
        id: EntityId,
        sender: SessionId,
        now: u64,
    ) {
        let Some(validator) = self.validator.lock().clone() else {
            return;
        };
        match validator.validate(certificate_id) {
            PopVerdict::Valid {
                transfer_recipient_key,
            } => {
                let payload = self.challenges.lock().begin_challenge(
                    certificate_id,
                    &transfer_recipient_key,
                    id,
                    now,
                    self.config.challenge.timeout_usec,
                );
                if let Some(transport) = self.transport.lock().clone() {
                    transport.send_challenge(sender, payload);
                }
            }
            verdict => {
                warn!(
                    "Proof of purchase for \"{}\" failed ({:?}); deleting {}",
                    certificate_id, verdict, id
                );
                self.delete_entities_inner(&[id], true, true);
            }
        }
    }

    /// Handle a signed challenge response from the owning node.
    pub fn process_challenge_response(&self, payload: &[u8]) -> EntityResult<()> {
        let (certificate_id, signature) = decode_challenge_payload(payload)?;
        let Some(verifier) = self.verifier.lock().clone() else {
            debug!("No signature verifier configured; challenge response ignored");
            return Ok(());
        };
        let outcome =
            self.challenges
                .lock()
                .verify_response(&certificate_id, &signature, verifier.as_ref());
        if let ChallengeOutcome::Failed(entity) = outcome {
            self.delete_entities_inner(&[entity], true, true);
            return Err(EntityError::CertificateVerifyFailed(certificate_id));
        }
        Ok(())
    }

    /// Relay a node-initiated challenge to the node being challenged,
    /// stamping the challenger id so the reply can be routed back.
    pub fn relay_challenge_request(
        &self,
        payload: &[u8],
        challenger: SessionId,
    ) -> EntityResult<()> {
        let (certificate_id, nonce, node_to_challenge) = decode_challenge_relay(payload)?;
        let out = encode_challenge_relay(&certificate_id, &nonce, challenger);
        if let Some(transport) = self.transport.lock().clone() {
            transport.relay_challenge_request(node_to_challenge, out);
        }
        Ok(())
    }

    /// Route a challenge reply back to the original challenger.
    pub fn relay_challenge_reply(&self, payload: &[u8]) -> EntityResult<()> {
        let (certificate_id, signature, challenger) = decode_challenge_relay(payload)?;
        let out = encode_challenge_payload(&certificate_id, &signature);
        if let Some(transport) = self.transport.lock().clone() {
            transport.relay_challenge_reply(challenger, out);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// The per-tick drive: parent fixups, simulation housekeeping (plus its
    /// dead list) and challenge deadlines. `now` is epoch usec.
    pub fn update(&self, now: u64) {
        self.fixup_missing_parents();

        let dead = {
            let mut simulation = self.simulation.lock();
            match simulation.as_mut() {
                Some(simulation) => {
                    {
                        let mut core = self.core.write();
                        simulation.update_entities(now, &mut core.store);
                    }
                    simulation.take_dead_entities()
                }
                None => Vec::new(),
            }
        };
        if !dead.is_empty() {
            debug!("Simulation reported {} dead entities", dead.len());
            self.delete_entities_inner(&dead, true, true);
        }

        let overdue = self.challenges.lock().take_expired(now);
        for (certificate_id, entity) in overdue {
            warn!(
                "Ownership challenge for \"{}\" timed out; deleting {}",
                certificate_id, entity
            );
            self.delete_entities_inner(&[entity], true, true);
        }
    }

    /// Drop every entity and element, all bookkeeping included. Used on
    /// domain switch.
    pub fn clear(&self) {
        {
            let mut core = self.core.write();
            *core = TreeCore::new(self.config.domain_scale);
        }
        self.challenges.lock().clear();
        self.recently_deleted.lock().clear();
        self.locally_deleted.lock().clear();
        self.needs_parent_fixup.lock().clear();
        self.children_of_avatars.lock().clear();
        if let Some(simulation) = self.simulation.lock().as_mut() {
            simulation.clear_entities();
        }
        self.mark_dirty();
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Nearest ray hit by sorted octree traversal. The hit is the first found
    /// in ascending bound order, which may not be the globally closest under
    /// exact ties.
    pub fn find_ray_intersection(
        &self,
        ray: &Ray,
        filter: &PickFilter,
        mode: LockMode,
    ) -> QueryOutcome<Option<RayHit>> {
        let core = match mode {
            LockMode::Lock => self.core.read(),
            LockMode::TryLock => match self.core.try_read() {
                Some(core) => core,
                None => {
                    return QueryOutcome {
                        result: None,
                        accurate: false,
                    }
                }
            },
        };
        QueryOutcome {
            result: queries::ray_intersection(&core.octree, &core.store, ray, filter),
            accurate: true,
        }
    }

    /// Nearest parabola hit; same traversal contract as
    /// [`find_ray_intersection`](Self::find_ray_intersection).
    pub fn find_parabola_intersection(
        &self,
        parabola: &Parabola,
        filter: &PickFilter,
        mode: LockMode,
    ) -> QueryOutcome<Option<ParabolaHit>> {
        let core = match mode {
            LockMode::Lock => self.core.read(),
            LockMode::TryLock => match self.core.try_read() {
                Some(core) => core,
                None => {
                    return QueryOutcome {
                        result: None,
                        accurate: false,
                    }
                }
            },
        };
        QueryOutcome {
            result: queries::parabola_intersection(&core.octree, &core.store, parabola, filter),
            accurate: true,
        }
    }

    pub fn find_entities_in_sphere(&self, center: Vec3, radius: f32) -> Vec<EntityId> {
        let core = self.core.read();
        queries::entities_in_sphere(&core.octree, &core.store, center, radius)
    }

    pub fn find_entities_in_cube(&self, cube: &AACube) -> Vec<EntityId> {
        let core = self.core.read();
        queries::entities_in_cube(&core.octree, &core.store, cube)
    }

    pub fn find_entities_in_box(&self, aabox: &AABox) -> Vec<EntityId> {
        let core = self.core.read();
        queries::entities_in_box(&core.octree, &core.store, aabox)
    }

    pub fn find_entities_in_frustum(&self, frustum: &Frustum) -> Vec<EntityId> {
        let core = self.core.read();
        queries::entities_in_frustum(&core.octree, &core.store, frustum)
    }

    pub fn find_closest_entity(&self, center: Vec3, max_radius: f32) -> Option<(EntityId, f32)> {
        let core = self.core.read();
        queries::closest_entity(&core.octree, &core.store, center, max_radius)
    }

    /// Run a caller-defined [`EntityScan`], pruning subtrees its cell test
    /// rejects.
    pub fn evaluate_entities(&self, scan: &dyn EntityScan) -> Vec<EntityId> {
        let core = self.core.read();
        queries::evaluate_entities(&core.octree, &core.store, scan)
    }
}

// ============================================================================
// Arbitration
// ============================================================================

/// Decide one ownership claim against the current owner. Volunteer claims
/// that win are promoted to recruit; winners get a fresh expiry stamp.
fn arbitrate_claim(
    current: SimulationOwner,
    mut claim: SimulationOwner,
    sender: SessionId,
    now: u64,
    grace_usec: u64,
) -> Claim {
    if claim.id.is_null() {
        // release: only the present owner may clear
        return if current.matches_id(sender) {
            Claim::Accept(SimulationOwner::unowned())
        } else {
            Claim::Reject
        };
    }
    if claim.id != sender {
        return Claim::Suspect;
    }
    let accept = if current.matches_id(sender) {
        true // refresh / priority change by the owner itself
    } else if current.is_null() {
        true // unowned: take
    } else {
        claim.priority > current.priority
            || (claim.priority == current.priority && current.has_expired(now))
    };
    if accept {
        claim.promote_volunteer();
        claim.refresh(now, grace_usec);
        Claim::Accept(claim)
    } else {
        Claim::Reject
    }
}
