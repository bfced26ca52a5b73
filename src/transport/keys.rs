//! Transport key management.
//!
//! For every contact and transport the key manager keeps up to two key sets:
//!
//! - **handshake mode** keys, seeded from the static X25519 agreement between
//!   our identity key and the contact's. They exist as soon as a contact is
//!   added and may only carry a handshake.
//! - **rotation mode** keys, seeded from the master key of a completed
//!   handshake. They carry sync traffic.
//!
//! Each key set holds one outgoing period and three incoming periods
//! (previous, current, next) so streams that cross a period boundary are
//! still recognised. Periods are ratcheted forward one-way as time passes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::tag::{ReorderingWindow, TagRecognition};
use super::StreamContext;
use crate::core::{
    Clock, ContactId, CryptoError, DbError, PendingContactId, TransportId, DEFAULT_ROTATION_PERIOD,
    PUBLIC_KEY_SIZE, REORDERING_WINDOW_SIZE,
};
use crate::crypto::{is_alice, kdf, KeyMode, SecretKey, StaticKeypair, Tag};
use crate::db::Database;

// =============================================================================
// Configuration
// =============================================================================

/// Key manager configuration.
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// Length of a rotation period.
    pub rotation_period: Duration,

    /// Number of stream numbers per incoming period we accept out of order.
    pub reordering_window: u64,

    /// Transports to derive keys for when a contact is added.
    pub transports: Vec<TransportId>,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            rotation_period: DEFAULT_ROTATION_PERIOD,
            reordering_window: REORDERING_WINDOW_SIZE,
            transports: Vec::new(),
        }
    }
}

impl KeyManagerConfig {
    fn period_millis(&self) -> u64 {
        (self.rotation_period.as_millis() as u64).max(1)
    }
}

/// Builder for [`KeyManagerConfig`].
#[derive(Debug, Default)]
pub struct KeyManagerBuilder {
    config: KeyManagerConfig,
}

impl KeyManagerBuilder {
    /// Create a builder with default settings and no transports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rotation period.
    pub fn rotation_period(mut self, period: Duration) -> Self {
        self.config.rotation_period = period;
        self
    }

    /// Set the reordering window size.
    pub fn reordering_window(mut self, size: u64) -> Self {
        self.config.reordering_window = size;
        self
    }

    /// Add a transport.
    pub fn transport(mut self, id: impl Into<TransportId>) -> Self {
        self.config.transports.push(id.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> KeyManagerConfig {
        self.config
    }
}

// =============================================================================
// Key sets
// =============================================================================

/// Who a key set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyOwner {
    /// An established contact.
    Contact(ContactId),
    /// A contact being added by rendezvous.
    Pending(PendingContactId),
}

/// Identifies a key set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySetId {
    /// Owner.
    pub owner: KeyOwner,
    /// Transport.
    pub transport: TransportId,
    /// Mode.
    pub mode: KeyMode,
}

/// Secrets of one rotation period in one direction.
#[derive(Debug, Clone)]
struct PeriodKeys {
    period: u64,
    secret: SecretKey,
    tag_key: SecretKey,
    header_key: SecretKey,
}

impl PeriodKeys {
    fn new(secret: SecretKey, period: u64) -> Result<Self, CryptoError> {
        Ok(Self {
            tag_key: kdf::derive_tag_key(&secret)?,
            header_key: kdf::derive_header_key(&secret)?,
            period,
            secret,
        })
    }

    fn next(&self) -> Result<Self, CryptoError> {
        Self::new(kdf::rotate_secret(&self.secret, self.period)?, self.period + 1)
    }
}

/// Keys for `period` in one direction, derived straight from the root.
fn root_period_keys(root: &SecretKey, id: &KeySetId, from_alice: bool, period: u64) -> Result<PeriodKeys, CryptoError> {
    PeriodKeys::new(
        kdf::derive_direction_secret(root, id.mode, from_alice, &id.transport, period)?,
        period,
    )
}

/// Ratchet `secret` from period `from` forward to period `to`.
fn ratchet(mut secret: SecretKey, from: u64, to: u64) -> Result<SecretKey, CryptoError> {
    for period in from..to {
        secret = kdf::rotate_secret(&secret, period)?;
    }
    Ok(secret)
}

#[derive(Debug, Clone)]
struct IncomingKeys {
    keys: PeriodKeys,
    window: ReorderingWindow,
}

impl IncomingKeys {
    fn new(keys: PeriodKeys, window_size: u64) -> Self {
        Self {
            keys,
            window: ReorderingWindow::new(window_size),
        }
    }
}

#[derive(Debug, Clone)]
struct OutgoingKeys {
    keys: PeriodKeys,
    stream_counter: u64,
}

/// Keys for one owner, transport and mode.
#[derive(Debug, Clone)]
pub struct TransportKeys {
    id: KeySetId,
    alice: bool,
    active: bool,
    timestamp: u64,
    /// Handshake-mode keys keep their root: every period is derived from it
    /// directly so that peers agree however far apart they added each other.
    handshake_root: Option<SecretKey>,
    previous: IncomingKeys,
    current: IncomingKeys,
    next: IncomingKeys,
    outgoing: OutgoingKeys,
}

impl TransportKeys {
    /// Derive a key set from a root secret.
    ///
    /// Rotation-mode keys form a chain that starts one period before
    /// `timestamp`, so that a previous incoming period exists, and is
    /// fast-forwarded to `now_period`. Handshake-mode keys depend only on the
    /// root and the absolute period.
    #[allow(clippy::too_many_arguments)]
    fn derive(
        id: KeySetId,
        root: &SecretKey,
        timestamp: u64,
        alice: bool,
        active: bool,
        period_millis: u64,
        window_size: u64,
        now_period: u64,
    ) -> Result<Self, CryptoError> {
        let (handshake_root, previous, current_keys, next, outgoing) = match id.mode {
            KeyMode::Handshake => {
                let current = now_period.max(1);
                (
                    Some(root.clone()),
                    root_period_keys(root, &id, !alice, current - 1)?,
                    root_period_keys(root, &id, !alice, current)?,
                    root_period_keys(root, &id, !alice, current + 1)?,
                    root_period_keys(root, &id, alice, current)?,
                )
            }
            KeyMode::Rotation => {
                let start = (timestamp / period_millis).saturating_sub(1);
                let current = now_period.max(start + 1);

                let incoming_root = kdf::derive_direction_secret(root, id.mode, !alice, &id.transport, start)?;
                let previous = PeriodKeys::new(ratchet(incoming_root, start, current - 1)?, current - 1)?;
                let current_keys = previous.next()?;
                let next = current_keys.next()?;

                let outgoing_root = kdf::derive_direction_secret(root, id.mode, alice, &id.transport, start)?;
                let outgoing = PeriodKeys::new(ratchet(outgoing_root, start, current)?, current)?;
                (None, previous, current_keys, next, outgoing)
            }
        };

        Ok(Self {
            id,
            alice,
            active,
            timestamp,
            handshake_root,
            previous: IncomingKeys::new(previous, window_size),
            current: IncomingKeys::new(current_keys, window_size),
            next: IncomingKeys::new(next, window_size),
            outgoing: OutgoingKeys {
                keys: outgoing,
                stream_counter: 0,
            },
        })
    }

    /// Which key set this is.
    pub fn id(&self) -> KeySetId {
        self.id.clone()
    }

    /// Whether we are Alice for this key set.
    pub fn is_alice(&self) -> bool {
        self.alice
    }

    /// Whether the keys may be used for outgoing streams.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Timestamp the keys were derived for, in milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Current outgoing period.
    pub fn outgoing_period(&self) -> u64 {
        self.outgoing.keys.period
    }

    /// Next outgoing stream number.
    pub fn stream_counter(&self) -> u64 {
        self.outgoing.stream_counter
    }

    /// Keys for the period after `keys` in one direction.
    fn advance(&self, keys: &PeriodKeys, from_alice: bool) -> Result<PeriodKeys, CryptoError> {
        match &self.handshake_root {
            Some(root) => root_period_keys(root, &self.id, from_alice, keys.period + 1),
            None => keys.next(),
        }
    }

    /// Ratchet forward to `now_period`. Returns whether anything changed.
    fn update(&mut self, now_period: u64) -> Result<bool, CryptoError> {
        let mut changed = false;
        let window_size = self.next.window.size();
        while self.current.keys.period < now_period {
            let after_next = IncomingKeys::new(self.advance(&self.next.keys, !self.alice)?, window_size);
            let next = std::mem::replace(&mut self.next, after_next);
            self.previous = std::mem::replace(&mut self.current, next);
            changed = true;
        }
        while self.outgoing.keys.period < now_period {
            self.outgoing = OutgoingKeys {
                keys: self.advance(&self.outgoing.keys, self.alice)?,
                stream_counter: 0,
            };
            changed = true;
        }
        Ok(changed)
    }

    fn incoming(&self) -> [&IncomingKeys; 3] {
        [&self.previous, &self.current, &self.next]
    }

    fn incoming_mut(&mut self, period: u64) -> Option<&mut IncomingKeys> {
        [&mut self.previous, &mut self.current, &mut self.next]
            .into_iter()
            .find(|incoming| incoming.keys.period == period)
    }

    fn context(&self, tag: Tag, header_key: SecretKey, period: u64, stream_number: u64) -> StreamContext {
        let (contact, pending) = match self.id.owner {
            KeyOwner::Contact(c) => (Some(c), None),
            KeyOwner::Pending(p) => (None, Some(p)),
        };
        StreamContext::new(
            contact,
            pending,
            self.id.transport.clone(),
            tag,
            header_key,
            period,
            stream_number,
            self.id.mode,
        )
    }
}

// =============================================================================
// Key manager
// =============================================================================

#[derive(Debug, Clone)]
struct TagLocation {
    id: KeySetId,
    period: u64,
    stream_number: u64,
}

#[derive(Default)]
struct KeyState {
    key_sets: HashMap<KeySetId, TransportKeys>,
    tags: HashMap<(TransportId, Tag), TagLocation>,
}

type ExpectedTags = Vec<((TransportId, Tag), TagLocation)>;

/// Tags of every unseen stream in the incoming windows of `keys`.
fn expected_tags(keys: &TransportKeys) -> Result<ExpectedTags, CryptoError> {
    let mut tags = Vec::new();
    for incoming in keys.incoming() {
        for stream_number in incoming.window.unseen() {
            let tag = kdf::compute_tag(&incoming.keys.tag_key, stream_number)?;
            tags.push((
                (keys.id.transport.clone(), tag),
                TagLocation {
                    id: keys.id.clone(),
                    period: incoming.keys.period,
                    stream_number,
                },
            ));
        }
    }
    Ok(tags)
}

impl KeyState {
    /// Replace the expected tags of `keys` with its current windows.
    fn index(&mut self, keys: &TransportKeys) -> Result<(), CryptoError> {
        let tags = expected_tags(keys)?;
        self.replace_tags(&keys.id, tags);
        Ok(())
    }

    fn replace_tags(&mut self, id: &KeySetId, tags: ExpectedTags) {
        self.tags.retain(|_, location| location.id != *id);
        self.tags.extend(tags);
    }
}

/// Owns all transport keys and hands out stream contexts.
pub struct KeyManager {
    config: KeyManagerConfig,
    identity: StaticKeypair,
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    state: Mutex<KeyState>,
}

impl KeyManager {
    /// Create a key manager, loading any key sets already in `db`.
    pub fn open(
        config: KeyManagerConfig,
        identity: StaticKeypair,
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DbError> {
        let manager = Self {
            config,
            identity,
            db,
            clock,
            state: Mutex::new(KeyState::default()),
        };

        let stored = manager.db.load_transport_keys()?;
        {
            let mut state = manager.state.lock();
            for keys in stored {
                state.index(&keys)?;
                state.key_sets.insert(keys.id(), keys);
            }
            manager.refresh(&mut state)?;
        }
        Ok(manager)
    }

    /// Our static public key.
    pub fn local_public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.identity.public_key()
    }

    /// Our static identity keypair.
    pub fn identity(&self) -> &StaticKeypair {
        &self.identity
    }

    fn now_period(&self) -> u64 {
        self.clock.now_millis() / self.config.period_millis()
    }

    /// Ratchet every key set to the current period.
    fn refresh(&self, state: &mut KeyState) -> Result<(), DbError> {
        let now_period = self.now_period();
        let ids: Vec<KeySetId> = state.key_sets.keys().cloned().collect();
        for id in ids {
            let Some(mut keys) = state.key_sets.get(&id).cloned() else {
                continue;
            };
            if keys.update(now_period)? {
                debug!(transport = %id.transport, period = now_period, "rotated keys");
                self.db.store_transport_keys(&keys)?;
                state.index(&keys)?;
                state.key_sets.insert(id, keys);
            }
        }
        Ok(())
    }

    /// Derive a key set unless stored keys with this id are as new.
    fn prepare(
        &self,
        state: &KeyState,
        id: KeySetId,
        root: &SecretKey,
        timestamp: u64,
        alice: bool,
        active: bool,
    ) -> Result<Option<TransportKeys>, DbError> {
        if let Some(existing) = state.key_sets.get(&id) {
            // Never replace keys with older or identical ones
            if existing.timestamp >= timestamp {
                debug!(transport = %id.transport, "ignoring keys not newer than stored keys");
                return Ok(None);
            }
        }
        let keys = TransportKeys::derive(
            id,
            root,
            timestamp,
            alice,
            active,
            self.config.period_millis(),
            self.config.reordering_window,
            self.now_period(),
        )?;
        Ok(Some(keys))
    }

    /// Store `batch` as one unit, then make it live. Nothing changes if the
    /// store fails.
    fn commit(&self, state: &mut KeyState, batch: Vec<TransportKeys>) -> Result<(), DbError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tags = Vec::with_capacity(batch.len());
        for keys in &batch {
            tags.push(expected_tags(keys)?);
        }
        self.db.store_transport_keys_batch(&batch)?;
        for (keys, tags) in batch.into_iter().zip(tags) {
            state.replace_tags(&keys.id, tags);
            state.key_sets.insert(keys.id.clone(), keys);
        }
        Ok(())
    }

    fn add_handshake_keys(&self, owner: KeyOwner, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> Result<(), DbError> {
        let root = kdf::derive_handshake_root(&self.identity.agree(remote_public))?;
        let alice = is_alice(self.identity.public_key(), remote_public);
        let now = self.clock.now_millis();

        let mut state = self.state.lock();
        self.refresh(&mut state)?;
        let mut batch = Vec::new();
        for transport in &self.config.transports {
            let id = KeySetId {
                owner,
                transport: transport.clone(),
                mode: KeyMode::Handshake,
            };
            if state.key_sets.contains_key(&id) {
                continue;
            }
            if let Some(keys) = self.prepare(&state, id, &root, now, alice, true)? {
                batch.push(keys);
            }
        }
        self.commit(&mut state, batch)
    }

    /// Derive handshake-mode keys for a contact from our identity key and
    /// the contact's handshake public key.
    pub fn add_contact(&self, contact: ContactId) -> Result<(), DbError> {
        let remote = self.db.get_contact(contact)?.handshake_public_key;
        self.add_handshake_keys(KeyOwner::Contact(contact), &remote)?;
        info!(contact = %contact, "added handshake keys");
        Ok(())
    }

    /// Derive handshake-mode keys for a pending contact.
    pub fn add_pending_contact(
        &self,
        pending: PendingContactId,
        remote_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<(), DbError> {
        self.add_handshake_keys(KeyOwner::Pending(pending), remote_public)?;
        info!(pending = %pending, "added rendezvous keys");
        Ok(())
    }

    /// Commit rotation keys derived from a handshake master key.
    ///
    /// The master key is consumed. Calling this again with the same
    /// timestamp, or with an older one, leaves the stored keys untouched.
    /// Inactive keys recognise incoming streams but are not used for
    /// outgoing streams until activated.
    pub fn add_rotation_keys(
        &self,
        contact: ContactId,
        master_key: SecretKey,
        timestamp: u64,
        alice: bool,
        active: bool,
    ) -> Result<(), DbError> {
        let mut state = self.state.lock();
        self.refresh(&mut state)?;
        let mut batch = Vec::new();
        for transport in &self.config.transports {
            let id = KeySetId {
                owner: KeyOwner::Contact(contact),
                transport: transport.clone(),
                mode: KeyMode::Rotation,
            };
            if let Some(keys) = self.prepare(&state, id, &master_key, timestamp, alice, active)? {
                batch.push(keys);
            }
        }
        self.commit(&mut state, batch)?;
        info!(contact = %contact, alice, active, "rotation keys committed");
        Ok(())
    }

    /// Allow a contact's rotation keys to be used for outgoing streams.
    pub fn activate_keys(&self, contact: ContactId, transport: &TransportId) -> Result<(), DbError> {
        let id = KeySetId {
            owner: KeyOwner::Contact(contact),
            transport: transport.clone(),
            mode: KeyMode::Rotation,
        };
        let mut state = self.state.lock();
        let Some(mut keys) = state.key_sets.get(&id).cloned() else {
            return Ok(());
        };
        if !keys.active {
            keys.active = true;
            self.db.store_transport_keys(&keys)?;
            state.key_sets.insert(id, keys);
        }
        Ok(())
    }

    /// Whether an outgoing stream can be allocated for the pair.
    pub fn can_send_outgoing_streams(&self, contact: ContactId, transport: &TransportId) -> bool {
        let state = self.state.lock();
        let owner = KeyOwner::Contact(contact);
        let rotation = state.key_sets.get(&KeySetId {
            owner,
            transport: transport.clone(),
            mode: KeyMode::Rotation,
        });
        match rotation {
            Some(keys) => keys.active,
            None => state.key_sets.contains_key(&KeySetId {
                owner,
                transport: transport.clone(),
                mode: KeyMode::Handshake,
            }),
        }
    }

    fn allocate(&self, owner: KeyOwner, transport: &TransportId) -> Result<Option<StreamContext>, DbError> {
        let mut state = self.state.lock();
        self.refresh(&mut state)?;

        let rotation = KeySetId {
            owner,
            transport: transport.clone(),
            mode: KeyMode::Rotation,
        };
        let handshake = KeySetId {
            mode: KeyMode::Handshake,
            ..rotation.clone()
        };

        // Handshake keys are only used while no rotation keys exist
        let id = match state.key_sets.get(&rotation) {
            Some(keys) if keys.active => rotation,
            Some(_) => {
                debug!(transport = %transport, "rotation keys not yet active");
                return Ok(None);
            }
            None if state.key_sets.contains_key(&handshake) => handshake,
            None => return Ok(None),
        };

        let Some(mut keys) = state.key_sets.get(&id).cloned() else {
            return Ok(None);
        };
        let stream_number = keys.outgoing.stream_counter;
        let period = keys.outgoing.keys.period;
        let tag = kdf::compute_tag(&keys.outgoing.keys.tag_key, stream_number)?;
        let header_key = keys.outgoing.keys.header_key.clone();
        keys.outgoing.stream_counter += 1;

        self.db.store_transport_keys(&keys)?;
        let ctx = keys.context(tag, header_key, period, stream_number);
        state.key_sets.insert(id, keys);

        debug!(transport = %transport, period, stream_number, mode = ?ctx.mode(), "allocated stream context");
        Ok(Some(ctx))
    }

    /// Allocate a context for a new outgoing stream.
    ///
    /// Returns `None` if there is no usable key material for the pair.
    /// Handshake mode is returned only when no rotation keys exist yet.
    pub fn allocate_stream_context(
        &self,
        contact: ContactId,
        transport: &TransportId,
    ) -> Result<Option<StreamContext>, DbError> {
        self.allocate(KeyOwner::Contact(contact), transport)
    }

    /// Allocate a rendezvous context for a pending contact.
    pub fn allocate_pending_stream_context(
        &self,
        pending: PendingContactId,
        transport: &TransportId,
    ) -> Result<Option<StreamContext>, DbError> {
        self.allocate(KeyOwner::Pending(pending), transport)
    }

    /// Resolve an inbound tag.
    ///
    /// A recognised tag is consumed: the same tag is never recognised twice.
    /// Recognising a rotation-mode tag activates the rotation keys.
    pub fn recognise_tag(&self, transport: &TransportId, tag: &Tag) -> Result<TagRecognition, DbError> {
        let mut state = self.state.lock();
        self.refresh(&mut state)?;

        let Some(location) = state.tags.get(&(transport.clone(), *tag)).cloned() else {
            return Ok(TagRecognition::Unrecognized);
        };
        let Some(mut keys) = state.key_sets.get(&location.id).cloned() else {
            warn!(transport = %transport, "tag table refers to missing keys");
            return Ok(TagRecognition::Unrecognized);
        };
        let Some(incoming) = keys.incoming_mut(location.period) else {
            warn!(transport = %transport, period = location.period, "tag for expired period");
            return Ok(TagRecognition::Unrecognized);
        };
        incoming.window.mark_seen(location.stream_number);
        let header_key = incoming.keys.header_key.clone();

        if location.id.mode == KeyMode::Rotation && !keys.active {
            info!(transport = %transport, "activating rotation keys");
            keys.active = true;
        }

        self.db.store_transport_keys(&keys)?;
        state.index(&keys)?;
        let ctx = keys.context(*tag, header_key, location.period, location.stream_number);
        state.key_sets.insert(location.id, keys);

        debug!(
            transport = %transport,
            period = location.period,
            stream_number = location.stream_number,
            "recognised tag"
        );
        Ok(TagRecognition::Recognized(ctx))
    }
}
