//! Folding remote events into the cache.
//!
//! Remote events may arrive duplicated or out of order, and this session's
//! own changes come back through the hub to every other member. Every rule
//! here is therefore idempotent, and anything recognized as this session's
//! own work is reported as [`EventOutcome::Echo`] without touching the cache.

use parley_types::events::{ChannelEvent, ThreadEvent};
use parley_types::models::{ChatMessage, GroupReaction, RoomId};

use crate::cache::SyncCache;
use crate::pending::PendingOps;

/// What applying a remote event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The cache changed.
    Applied,
    /// The event restates something this session already applied.
    Echo,
    /// Held until a local edit of the same message settles.
    Deferred,
    /// Nothing cached is affected, or the event is stale.
    Ignored,
}

/// The cache plus this session's pending-operation bookkeeping. Always
/// mutated together under one lock.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub cache: SyncCache,
    pub pending: PendingOps,
}

impl SyncState {
    pub fn new(echo_guard: bool) -> Self {
        Self {
            cache: SyncCache::new(),
            pending: PendingOps::new(echo_guard),
        }
    }

    pub fn apply_channel_event(&mut self, room: &RoomId, event: ChannelEvent) -> EventOutcome {
        match event {
            ChannelEvent::MessageCreated { message } => self.remote_created(&room.id, message),
            ChannelEvent::MessageUpdated { message } => self.remote_updated(message),
            ChannelEvent::MessageDeleted {
                message_id,
                thread_id,
                has_replies,
            } => {
                if self.pending.is_tombstoned(&message_id) {
                    return EventOutcome::Echo;
                }
                self.pending.tombstone(&message_id);
                outcome(self.apply_delete(&message_id, thread_id.as_deref(), has_replies))
            }
            ChannelEvent::ReactionUpdated {
                message_id,
                reactions,
            } => outcome(self.merge_reactions(&message_id, &reactions) > 0),
            ChannelEvent::RepliesIncrement {
                message_id,
                delta,
                op_id,
            } => {
                if let Some(op_id) = op_id.as_deref() {
                    if self.pending.take_increment(room, op_id) {
                        return EventOutcome::Echo;
                    }
                }
                outcome(self.bump_replies(&message_id, delta) > 0)
            }
        }
    }

    pub fn apply_thread_event(&mut self, room: &RoomId, event: ThreadEvent) -> EventOutcome {
        match event {
            ThreadEvent::ReplyCreated { reply } => {
                if self.pending.is_own_create(&reply.id) {
                    return EventOutcome::Echo;
                }
                if self.pending.is_tombstoned(&reply.id) {
                    return EventOutcome::Ignored;
                }
                let Some(view) = self.cache.thread_mut(&room.id) else {
                    return EventOutcome::Ignored;
                };
                if view.replies.contains(&reply.id) {
                    return EventOutcome::Echo;
                }
                view.replies.upsert(reply);
                EventOutcome::Applied
            }
            ThreadEvent::ReactionUpdated {
                message_id,
                reactions,
                ..
            } => outcome(self.merge_reactions(&message_id, &reactions) > 0),
        }
    }

    fn remote_created(&mut self, channel_id: &str, message: ChatMessage) -> EventOutcome {
        if self.pending.is_own_create(&message.id) {
            return EventOutcome::Echo;
        }
        // Replies travel on the thread room; the channel only sees the count.
        if message.thread_id.is_some() || self.pending.is_tombstoned(&message.id) {
            return EventOutcome::Ignored;
        }
        let Some(window) = self.cache.channel_mut(channel_id) else {
            return EventOutcome::Ignored;
        };
        if window.contains(&message.id) {
            return EventOutcome::Echo;
        }
        window.upsert(message);
        EventOutcome::Applied
    }

    fn remote_updated(&mut self, message: ChatMessage) -> EventOutcome {
        if self.pending.is_tombstoned(&message.id) {
            return EventOutcome::Ignored;
        }
        if self.pending.is_editing(&message.id) {
            self.pending.defer_update(message);
            return EventOutcome::Deferred;
        }
        outcome(self.merge_update(&message) > 0)
    }

    /// Take editable fields from `incoming` into every cached copy that is not
    /// newer than it. Returns how many copies changed.
    pub fn merge_update(&mut self, incoming: &ChatMessage) -> usize {
        let mut changed = 0;
        self.cache.update_copies(&incoming.id, |msg| {
            if msg.updated_at <= incoming.updated_at {
                msg.content = incoming.content.clone();
                msg.image_url = incoming.image_url.clone();
                msg.updated_at = incoming.updated_at;
                changed += 1;
            }
        });
        changed
    }

    /// Remove a message everywhere. A removed reply takes one off its parent's
    /// count; a removed parent takes its thread window with it. Returns
    /// whether anything cached changed.
    pub fn apply_delete(&mut self, message_id: &str, thread_id: Option<&str>, has_replies: bool) -> bool {
        let removed = self.cache.remove_everywhere(message_id);
        let parent = thread_id
            .map(str::to_string)
            .or_else(|| removed.as_ref().and_then(|m| m.thread_id.clone()));
        let mut changed = removed.is_some();

        if let Some(parent) = parent {
            changed |= self.bump_replies(&parent, -1) > 0;
        }
        if has_replies || self.cache.thread(message_id).is_some() {
            changed |= self.cache.evict_thread(message_id).is_some();
        }
        changed
    }

    /// Apply a signed reply delta to every copy of a parent.
    pub fn bump_replies(&mut self, message_id: &str, delta: i64) -> usize {
        self.cache
            .update_copies(message_id, |msg| msg.apply_reply_delta(delta))
    }

    /// Take counts from an authoritative list while keeping this viewer's own
    /// `reacted_by_me` flags. Lists published by other members are relative
    /// to them.
    pub fn merge_reactions(&mut self, message_id: &str, reactions: &[GroupReaction]) -> usize {
        self.cache.update_copies(message_id, |msg| {
            let merged = reactions
                .iter()
                .map(|r| GroupReaction {
                    emoji: r.emoji.clone(),
                    count: r.count,
                    reacted_by_me: msg
                        .reactions
                        .iter()
                        .find(|mine| mine.emoji == r.emoji)
                        .is_some_and(|mine| mine.reacted_by_me),
                })
                .collect();
            msg.reactions = merged;
        })
    }

    /// Replace a list outright. Used for this session's own server response.
    pub fn replace_reactions(&mut self, message_id: &str, reactions: &[GroupReaction]) -> usize {
        self.cache
            .update_copies(message_id, |msg| msg.reactions = reactions.to_vec())
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(true)
    }
}

fn outcome(changed: bool) -> EventOutcome {
    if changed {
        EventOutcome::Applied
    } else {
        EventOutcome::Ignored
    }
}

/// Flip this viewer's reaction on one emoji, as a guess ahead of the store.
pub fn bump_reaction(reactions: &mut Vec<GroupReaction>, emoji: &str) {
    match reactions.iter().position(|r| r.emoji == emoji) {
        Some(i) if reactions[i].reacted_by_me => {
            let bucket = &mut reactions[i];
            bucket.reacted_by_me = false;
            bucket.count = bucket.count.saturating_sub(1);
            if bucket.count == 0 {
                reactions.remove(i);
            }
        }
        Some(i) => {
            let bucket = &mut reactions[i];
            bucket.reacted_by_me = true;
            bucket.count += 1;
        }
        None => reactions.push(GroupReaction {
            emoji: emoji.to_string(),
            count: 1,
            reacted_by_me: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{at, msg};

    fn channel() -> RoomId {
        RoomId::channel("c1")
    }

    fn state_with(ids: &[(&str, i64)]) -> SyncState {
        let mut state = SyncState::default();
        let window = state.cache.channel_entry("c1");
        for (id, secs) in ids {
            window.upsert(msg(id, *secs));
        }
        state
    }

    #[test]
    fn duplicate_create_is_applied_once() {
        let mut state = state_with(&[("a", 1)]);
        let event = ChannelEvent::MessageCreated { message: msg("b", 2) };
        assert_eq!(state.apply_channel_event(&channel(), event.clone()), EventOutcome::Applied);
        assert_eq!(state.apply_channel_event(&channel(), event), EventOutcome::Echo);
        assert_eq!(state.cache.channel("c1").unwrap().len(), 2);
    }

    #[test]
    fn create_after_delete_stays_deleted() {
        let mut state = state_with(&[("a", 1)]);
        let deleted = ChannelEvent::MessageDeleted {
            message_id: "b".into(),
            thread_id: None,
            has_replies: false,
        };
        state.apply_channel_event(&channel(), deleted.clone());
        let created = ChannelEvent::MessageCreated { message: msg("b", 2) };
        assert_eq!(state.apply_channel_event(&channel(), created), EventOutcome::Ignored);
        assert_eq!(state.apply_channel_event(&channel(), deleted), EventOutcome::Echo);
    }

    #[test]
    fn stale_update_does_not_overwrite_newer_content() {
        let mut state = state_with(&[("a", 1)]);
        let mut newer = msg("a", 1);
        newer.content = Some("second".into());
        newer.updated_at = at(10);
        let mut older = msg("a", 1);
        older.content = Some("first".into());
        older.updated_at = at(5);

        let ev = |m: &ChatMessage| ChannelEvent::MessageUpdated { message: m.clone() };
        assert_eq!(state.apply_channel_event(&channel(), ev(&newer)), EventOutcome::Applied);
        assert_eq!(state.apply_channel_event(&channel(), ev(&older)), EventOutcome::Ignored);
        assert_eq!(
            state.cache.find("a").unwrap().content.as_deref(),
            Some("second")
        );
    }

    #[test]
    fn update_during_local_edit_is_deferred() {
        let mut state = state_with(&[("a", 1)]);
        state.pending.begin_edit("a");
        let mut remote = msg("a", 1);
        remote.content = Some("remote".into());
        remote.updated_at = at(3);
        let ev = ChannelEvent::MessageUpdated { message: remote.clone() };
        assert_eq!(state.apply_channel_event(&channel(), ev), EventOutcome::Deferred);
        assert_eq!(state.pending.finish_edit("a"), Some(remote));
    }

    #[test]
    fn reply_delete_floors_parent_count() {
        let mut state = state_with(&[("p", 1)]);
        state.cache.channel_mut("c1").unwrap().get_mut("p").unwrap().reply_count = 0;
        let ev = ChannelEvent::MessageDeleted {
            message_id: "r1".into(),
            thread_id: Some("p".into()),
            has_replies: false,
        };
        state.apply_channel_event(&channel(), ev);
        assert_eq!(state.cache.find("p").unwrap().reply_count, 0);
    }

    #[test]
    fn parent_delete_evicts_thread() {
        let mut state = state_with(&[("p", 1)]);
        state.cache.set_thread("p", msg("p", 1), vec![msg("r1", 2)]);
        let ev = ChannelEvent::MessageDeleted {
            message_id: "p".into(),
            thread_id: None,
            has_replies: true,
        };
        assert_eq!(state.apply_channel_event(&channel(), ev), EventOutcome::Applied);
        assert!(state.cache.thread("p").is_none());
        assert!(state.cache.find("p").is_none());
    }

    #[test]
    fn remote_reactions_keep_my_flag() {
        let mut state = state_with(&[("a", 1)]);
        state.cache.channel_mut("c1").unwrap().get_mut("a").unwrap().reactions = vec![GroupReaction {
            emoji: "👍".into(),
            count: 1,
            reacted_by_me: true,
        }];
        let ev = ChannelEvent::ReactionUpdated {
            message_id: "a".into(),
            reactions: vec![
                GroupReaction { emoji: "👍".into(), count: 2, reacted_by_me: false },
                GroupReaction { emoji: "🎉".into(), count: 1, reacted_by_me: true },
            ],
        };
        state.apply_channel_event(&channel(), ev);
        let reactions = &state.cache.find("a").unwrap().reactions;
        assert_eq!(reactions[0], GroupReaction { emoji: "👍".into(), count: 2, reacted_by_me: true });
        assert_eq!(reactions[1], GroupReaction { emoji: "🎉".into(), count: 1, reacted_by_me: false });
    }

    #[test]
    fn own_increment_is_an_echo() {
        let mut state = state_with(&[("p", 1)]);
        state.pending.record_increment(&channel(), "op1");
        let ev = |op: &str| ChannelEvent::RepliesIncrement {
            message_id: "p".into(),
            delta: 1,
            op_id: Some(op.into()),
        };
        assert_eq!(state.apply_channel_event(&channel(), ev("op1")), EventOutcome::Echo);
        assert_eq!(state.apply_channel_event(&channel(), ev("op2")), EventOutcome::Applied);
        assert_eq!(state.cache.find("p").unwrap().reply_count, 1);
    }

    #[test]
    fn thread_reply_needs_a_cached_thread() {
        let mut state = state_with(&[("p", 1)]);
        let mut reply = msg("r1", 2);
        reply.thread_id = Some("p".into());
        let room = RoomId::thread("p");
        let ev = ThreadEvent::ReplyCreated { reply };
        assert_eq!(state.apply_thread_event(&room, ev.clone()), EventOutcome::Ignored);

        state.cache.set_thread("p", msg("p", 1), vec![]);
        assert_eq!(state.apply_thread_event(&room, ev.clone()), EventOutcome::Applied);
        assert_eq!(state.apply_thread_event(&room, ev), EventOutcome::Echo);
    }

    #[test]
    fn bump_toggles_my_bucket() {
        let mut reactions = Vec::new();
        bump_reaction(&mut reactions, "👍");
        assert_eq!(reactions, vec![GroupReaction { emoji: "👍".into(), count: 1, reacted_by_me: true }]);
        bump_reaction(&mut reactions, "👍");
        assert!(reactions.is_empty());

        let mut shared = vec![GroupReaction { emoji: "👍".into(), count: 2, reacted_by_me: false }];
        bump_reaction(&mut shared, "👍");
        assert_eq!(shared[0].count, 3);
        assert!(shared[0].reacted_by_me);
    }
}
