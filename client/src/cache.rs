// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-handle message cache: an ordered queue of pending sends plus an index
//! of in-flight messages keyed by correlation id, with the periodic
//! timeout-requeue and deadline-expiry sweeps.

use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

use couriercommon::{
    identifiers::{MessageId, MessagePath},
    payload::DataContainer,
    policy::MessagePolicy,
    time::TimeStamp,
};
use parking_lot::Mutex;
use tracing::error;

/// A message held by the client until it is terminally resolved.
#[derive(Debug, Clone)]
pub(crate) struct CachedMessage {
    path: MessagePath,
    policy: MessagePolicy,
    payload: DataContainer,
    uuid: MessageId,
    sent: bool,
    sent_at: Option<TimeStamp>,
    container_size: u64,
}

impl CachedMessage {
    pub(crate) fn new(path: MessagePath, policy: MessagePolicy, payload: DataContainer) -> Self {
        let container_size = (payload.len()
            + path.wire_size()
            + MessageId::WIRE_LEN
            + mem::size_of::<Self>()) as u64;
        Self {
            path,
            policy,
            payload,
            uuid: MessageId::random(),
            sent: false,
            sent_at: None,
            container_size,
        }
    }

    pub(crate) fn path(&self) -> &MessagePath {
        &self.path
    }

    pub(crate) fn policy(&self) -> &MessagePolicy {
        &self.policy
    }

    pub(crate) fn payload(&self) -> &DataContainer {
        &self.payload
    }

    pub(crate) fn uuid(&self) -> MessageId {
        self.uuid
    }

    pub(crate) fn is_sent(&self) -> bool {
        self.sent
    }

    /// Bytes accounted against the global cache capacity.
    pub(crate) fn container_size(&self) -> u64 {
        self.container_size
    }

    fn is_expired(&self) -> bool {
        self.policy
            .deadline()
            .is_some_and(|deadline| deadline.is_past())
    }

    fn is_send_timed_out(&self) -> bool {
        match (self.policy.per_send_timeout(), self.sent_at) {
            (Some(timeout), Some(sent_at)) => sent_at.elapsed() >= timeout,
            _ => false,
        }
    }

    fn mark_sent(&mut self) {
        self.sent = true;
        self.sent_at = Some(TimeStamp::now());
    }

    fn mark_unsent(&mut self) {
        self.sent = false;
        self.sent_at = None;
    }
}

#[derive(Default)]
struct CacheInner {
    new: VecDeque<CachedMessage>,
    in_flight: HashMap<MessageId, CachedMessage>,
}

/// The `new` queue preserves insertion order across every operation except
/// [`MessageCache::make_all_new`]. The cache carries its own lock so the
/// submit path and the dispatch task never contend for anything wider.
#[derive(Default)]
pub(crate) struct MessageCache {
    inner: Mutex<CacheInner>,
}

impl MessageCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&self, message: CachedMessage) {
        self.inner.lock().new.push_back(message);
    }

    /// Splices `queue` onto the end of `new`. Used when a freshly created
    /// handle inherits messages parked at the service.
    pub(crate) fn append_queue(&self, queue: VecDeque<CachedMessage>) {
        self.inner.lock().new.extend(queue);
    }

    /// A snapshot of the head of `new`. The payload clone is cheap, it shares
    /// the underlying buffer.
    pub(crate) fn head(&self) -> Option<CachedMessage> {
        self.inner.lock().new.front().cloned()
    }

    /// Removes the head of `new`, which must carry `uuid`, marks it sent and
    /// moves it into the in-flight index.
    pub(crate) fn promote_to_in_flight(&self, uuid: MessageId) {
        let mut inner = self.inner.lock();
        let Some(mut message) = inner.new.pop_front() else {
            error!(%uuid, "promote on an empty queue");
            return;
        };
        if message.uuid() != uuid {
            error!(%uuid, head = %message.uuid(), "promote does not match queue head");
            inner.new.push_front(message);
            return;
        }
        message.mark_sent();
        inner.in_flight.insert(uuid, message);
    }

    /// Moves an in-flight message back to the head of `new`, clearing its
    /// sent state. No-op for unknown uuids.
    pub(crate) fn demote_to_new(&self, uuid: MessageId) {
        Self::demote_locked(&mut self.inner.lock(), uuid);
    }

    fn demote_locked(inner: &mut CacheInner, uuid: MessageId) {
        if let Some(mut message) = inner.in_flight.remove(&uuid) {
            message.mark_unsent();
            inner.new.push_front(message);
        }
    }

    /// Removes an in-flight message on terminal acknowledgment. `None` means
    /// the peer acknowledged an unknown uuid, which the caller logs.
    pub(crate) fn erase_in_flight(&self, uuid: MessageId) -> Option<CachedMessage> {
        self.inner.lock().in_flight.remove(&uuid)
    }

    pub(crate) fn in_flight_path(&self, uuid: MessageId) -> Option<MessagePath> {
        self.inner
            .lock()
            .in_flight
            .get(&uuid)
            .map(|message| message.path().clone())
    }

    /// Drains the in-flight index onto `new` in arbitrary order and clears
    /// sent state. Used on handle tear-down before re-parking.
    pub(crate) fn make_all_new(&self) {
        let mut inner = self.inner.lock();
        let drained: Vec<_> = inner.in_flight.drain().map(|(_, message)| message).collect();
        for mut message in drained {
            message.mark_unsent();
            inner.new.push_back(message);
        }
    }

    /// Takes the whole `new` queue, leaving the cache empty of pending sends.
    pub(crate) fn drain_new(&self) -> VecDeque<CachedMessage> {
        mem::take(&mut self.inner.lock().new)
    }

    /// Requeues in-flight messages whose per-send timeout has elapsed.
    pub(crate) fn requeue_timed_out(&self) -> Vec<MessageId> {
        let mut inner = self.inner.lock();
        let timed_out: Vec<MessageId> = inner
            .in_flight
            .values()
            .filter(|message| message.is_send_timed_out())
            .map(|message| message.uuid())
            .collect();
        for uuid in &timed_out {
            Self::demote_locked(&mut inner, *uuid);
        }
        timed_out
    }

    /// Removes every message whose deadline has passed, from both
    /// collections, and returns them so the caller can surface
    /// deadline-expired responses and release capacity.
    pub(crate) fn sweep_expired(&self) -> Vec<CachedMessage> {
        let mut inner = self.inner.lock();
        let mut expired: Vec<CachedMessage> = Vec::new();

        let expired_in_flight: Vec<MessageId> = inner
            .in_flight
            .values()
            .filter(|message| message.is_expired())
            .map(|message| message.uuid())
            .collect();
        for uuid in expired_in_flight {
            if let Some(message) = inner.in_flight.remove(&uuid) {
                expired.push(message);
            }
        }

        let mut remaining = VecDeque::with_capacity(inner.new.len());
        for message in inner.new.drain(..) {
            if message.is_expired() {
                expired.push(message);
            } else {
                remaining.push_back(message);
            }
        }
        inner.new = remaining;

        expired
    }

    pub(crate) fn new_len(&self) -> usize {
        self.inner.lock().new.len()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Σ container_size over everything currently held, for statistics.
    pub(crate) fn bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .new
            .iter()
            .chain(inner.in_flight.values())
            .map(|message| message.container_size())
            .sum()
    }
}

/// Global cache-capacity accounting shared by the façade, the services and
/// the dispatch tasks. Reservation and release pair with message creation
/// and destruction, so the gauge always equals the bytes currently held.
pub(crate) struct CacheGauge {
    used: AtomicU64,
    limit: u64,
}

impl CacheGauge {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
        }
    }

    /// Reserves `size` bytes unless that would push usage past the limit.
    pub(crate) fn try_reserve(&self, size: u64) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_add(size) else {
                return false;
            };
            if next > self.limit {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn release(&self, size: u64) {
        let previous = self.used.fetch_sub(size, Ordering::AcqRel);
        if previous < size {
            error!(previous, size, "cache gauge released more than was held");
        }
    }

    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn limit(&self) -> u64 {
        self.limit
    }
}
