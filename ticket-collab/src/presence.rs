//! Ephemeral presence and typing awareness.
//!
//! Presence is never persisted and never enters the replicated log. Each
//! replica keeps a map of peer handle → [`PresenceEntry`], rebuilt from
//! `Join` messages after every reconnect.
//!
//! ```text
//! set_local_typing(true)
//!       │
//!       ▼
//! AwarenessMessage::Typing { … }
//!       │   (SyncMessage::Awareness broadcast)
//!       ▼
//! remote PresenceState::handle_message()
//!       │
//!       ▼
//! active_users() / typing_users()
//! ```
//!
//! A single user may hold several peer handles (two browser tabs); the
//! derived views deduplicate by user id.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identity & color
// ───────────────────────────────────────────────────────────────────

/// The local participant of a room session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub user_id: String,
    pub user_name: String,
    /// Per-session handle; distinct for every session of the same user.
    pub peer_handle: Uuid,
    pub color_tag: String,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color_tag = color_tag_for(&user_id);
        Self {
            user_id,
            user_name: user_name.into(),
            peer_handle: Uuid::new_v4(),
            color_tag,
        }
    }
}

/// Stable `#rrggbb` tag derived from a user id.
///
/// The hue comes from an FNV-1a hash of the id; saturation and lightness are
/// fixed for readable, vivid colors.
pub fn color_tag_for(user_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Awareness messages, carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Announce a peer handle with its user profile.
    Join {
        peer_handle: Uuid,
        user_id: String,
        user_name: String,
        color_tag: String,
        typing: bool,
    },

    /// Clean departure of a peer handle.
    Leave {
        peer_handle: Uuid,
    },

    /// Typing state change.
    Typing {
        peer_handle: Uuid,
        user_id: String,
        typing: bool,
    },

    /// Keep-alive so idle peers can be expired.
    Heartbeat {
        peer_handle: Uuid,
    },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    pub fn peer_handle(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { peer_handle, .. } => *peer_handle,
            AwarenessMessage::Leave { peer_handle } => *peer_handle,
            AwarenessMessage::Typing { peer_handle, .. } => *peer_handle,
            AwarenessMessage::Heartbeat { peer_handle } => *peer_handle,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence state
// ───────────────────────────────────────────────────────────────────

/// One peer handle's presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub peer_handle: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub color_tag: String,
    pub typing: bool,
    last_seen: Instant,
}

impl PresenceEntry {
    fn new(peer_handle: Uuid, user_id: String, user_name: String, color_tag: String) -> Self {
        Self {
            peer_handle,
            user_id,
            user_name,
            color_tag,
            typing: false,
            last_seen: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// A user visible in the room, merged across their peer handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub user_id: String,
    pub user_name: String,
    pub color_tag: String,
    pub typing: bool,
}

/// Partial update of the local presence fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub user_name: Option<String>,
    pub typing: Option<bool>,
}

/// Presence of everyone in one room, as seen by the local replica.
pub struct PresenceState {
    local: PresenceEntry,
    peers: HashMap<Uuid, PresenceEntry>,
}

impl PresenceState {
    pub fn new(identity: &LocalIdentity) -> Self {
        Self {
            local: PresenceEntry::new(
                identity.peer_handle,
                identity.user_id.clone(),
                identity.user_name.clone(),
                identity.color_tag.clone(),
            ),
            peers: HashMap::new(),
        }
    }

    /// Apply a partial update to the local entry.
    ///
    /// Returns the message to broadcast, or `None` if nothing changed.
    pub fn set_local_presence(&mut self, update: PresenceUpdate) -> Option<AwarenessMessage> {
        let mut changed = false;
        if let Some(name) = update.user_name {
            if name != self.local.user_name {
                self.local.user_name = name;
                changed = true;
            }
        }
        if let Some(typing) = update.typing {
            if typing != self.local.typing {
                self.local.typing = typing;
                changed = true;
            }
        }
        if !changed {
            return None;
        }
        self.local.touch();
        Some(self.join_message())
    }

    /// Set the local typing flag; `None` if it was already in that state.
    pub fn set_local_typing(&mut self, typing: bool) -> Option<AwarenessMessage> {
        if self.local.typing == typing {
            return None;
        }
        self.local.typing = typing;
        self.local.touch();
        Some(AwarenessMessage::Typing {
            peer_handle: self.local.peer_handle,
            user_id: self.local.user_id.clone(),
            typing,
        })
    }

    pub fn local_typing(&self) -> bool {
        self.local.typing
    }

    /// Handle an awareness message from a peer. Own messages are ignored.
    ///
    /// Returns true if the visible presence changed.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.peer_handle() == self.local.peer_handle {
            return false;
        }

        match msg {
            AwarenessMessage::Join { peer_handle, user_id, user_name, color_tag, typing } => {
                let mut entry = PresenceEntry::new(
                    *peer_handle,
                    user_id.clone(),
                    user_name.clone(),
                    color_tag.clone(),
                );
                entry.typing = *typing;
                let previous = self.peers.insert(*peer_handle, entry);
                match previous {
                    Some(prev) => {
                        prev.user_name != *user_name
                            || prev.typing != *typing
                            || prev.color_tag != *color_tag
                    }
                    None => true,
                }
            }

            AwarenessMessage::Leave { peer_handle } => self.peers.remove(peer_handle).is_some(),

            AwarenessMessage::Typing { peer_handle, user_id, typing } => {
                match self.peers.get_mut(peer_handle) {
                    Some(entry) => {
                        entry.touch();
                        let changed = entry.typing != *typing;
                        entry.typing = *typing;
                        changed
                    }
                    // Peer joined before we connected; create a placeholder
                    // until its Join arrives.
                    None => {
                        let mut entry = PresenceEntry::new(
                            *peer_handle,
                            user_id.clone(),
                            user_id.clone(),
                            color_tag_for(user_id),
                        );
                        entry.typing = *typing;
                        self.peers.insert(*peer_handle, entry);
                        true
                    }
                }
            }

            AwarenessMessage::Heartbeat { peer_handle } => {
                if let Some(entry) = self.peers.get_mut(peer_handle) {
                    entry.touch();
                }
                false
            }
        }
    }

    /// Join message describing the local entry (sent on every connect).
    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            peer_handle: self.local.peer_handle,
            user_id: self.local.user_id.clone(),
            user_name: self.local.user_name.clone(),
            color_tag: self.local.color_tag.clone(),
            typing: self.local.typing,
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            peer_handle: self.local.peer_handle,
        }
    }

    pub fn heartbeat_message(&self) -> AwarenessMessage {
        AwarenessMessage::Heartbeat {
            peer_handle: self.local.peer_handle,
        }
    }

    /// Everyone present (local user included), one row per user id.
    pub fn active_users(&self) -> Vec<ActiveUser> {
        let mut by_user: BTreeMap<&str, ActiveUser> = BTreeMap::new();
        for entry in std::iter::once(&self.local).chain(self.peers.values()) {
            by_user
                .entry(entry.user_id.as_str())
                .and_modify(|user| user.typing |= entry.typing)
                .or_insert_with(|| ActiveUser {
                    user_id: entry.user_id.clone(),
                    user_name: entry.user_name.clone(),
                    color_tag: entry.color_tag.clone(),
                    typing: entry.typing,
                });
        }
        let mut users: Vec<ActiveUser> = by_user.into_values().collect();
        users.sort_by(|a, b| a.user_name.cmp(&b.user_name).then(a.user_id.cmp(&b.user_id)));
        users
    }

    /// User ids currently typing, excluding the local user.
    pub fn typing_users(&self) -> BTreeSet<String> {
        self.peers
            .values()
            .filter(|p| p.typing && p.user_id != self.local.user_id)
            .map(|p| p.user_id.clone())
            .collect()
    }

    /// Expire peers without traffic for `timeout`. Returns removed handles.
    pub fn cleanup_idle_peers(&mut self, timeout: Duration) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }

        stale
    }

    /// Forget all remote peers (on disconnect; rebuilt after reconnect).
    pub fn clear_remote(&mut self) -> bool {
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        had_peers
    }

    pub fn peer(&self, peer_handle: &Uuid) -> Option<&PresenceEntry> {
        self.peers.get(peer_handle)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
