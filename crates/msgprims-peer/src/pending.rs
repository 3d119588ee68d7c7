//! Correlation of replies with the synchronous dispatches waiting for them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use msgprims_frame::UNDEFINED;
use parking_lot::{Condvar, Mutex};

use crate::message::Message;

/// How many recently abandoned ids are remembered to recognise late replies.
const EXPIRED_HISTORY: usize = 4096;

/// Single-slot future for one reply.
pub struct PendingReply {
    message_id: i64,
    slot: Mutex<Slot>,
    ready: Condvar,
}

#[derive(Default)]
struct Slot {
    reply: Option<Message>,
    cancelled: bool,
}

impl PendingReply {
    fn new(message_id: i64) -> Self {
        Self {
            message_id,
            slot: Mutex::new(Slot::default()),
            ready: Condvar::new(),
        }
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    /// Block until a reply arrives or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.reply.is_none() && !slot.cancelled {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.reply.take()
    }

    /// Stop accepting a reply. A reply that is already stored is kept.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.cancelled = true;
        self.ready.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.lock().cancelled
    }

    fn fulfil(&self, message: Message) -> Result<(), Message> {
        let mut slot = self.slot.lock();
        if slot.cancelled || slot.reply.is_some() {
            return Err(message);
        }
        slot.reply = Some(message);
        self.ready.notify_all();
        Ok(())
    }
}

/// What happened to an inbound reply handed to [`PendingReplies::complete`].
pub enum Completion {
    /// A waiter took the reply.
    Delivered,
    /// The waiter for this id gave up; the reply is dropped.
    Late,
    /// No dispatch is waiting for this id.
    Unmatched(Message),
}

impl Completion {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Completion::Delivered)
    }
}

struct Table {
    next_id: i64,
    waiters: HashMap<i64, Arc<PendingReply>>,
    expired: HashSet<i64>,
    expired_order: VecDeque<i64>,
}

impl Table {
    fn next_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == UNDEFINED {
            self.next_id = self.next_id.wrapping_add(1);
        }
        id
    }

    fn remember_expired(&mut self, id: i64) {
        if self.expired.insert(id) {
            self.expired_order.push_back(id);
        }
        while self.expired_order.len() > EXPIRED_HISTORY {
            if let Some(old) = self.expired_order.pop_front() {
                self.expired.remove(&old);
            }
        }
    }
}

/// Message id generator and table of pending replies, under one lock.
///
/// Ids whose waiter gave up are remembered so a reply that arrives later
/// is dropped as late. Only the most recent 4096 such ids are kept; a reply
/// for an older one is no longer recognised and is handed to the consumers
/// like any unsolicited message.
pub struct PendingReplies {
    table: Mutex<Table>,
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_id: 0,
                waiters: HashMap::new(),
                expired: HashSet::new(),
                expired_order: VecDeque::new(),
            }),
        }
    }

    /// Allocate a message id, registering a waiter for it when `register`
    /// is set. Both happen under the same lock, so a reply can never arrive
    /// for an id before its waiter exists.
    pub fn allocate(&self, register: bool) -> (i64, Option<Arc<PendingReply>>) {
        let mut table = self.table.lock();
        let id = table.next_id();
        if !register {
            return (id, None);
        }
        let pending = Arc::new(PendingReply::new(id));
        table.waiters.insert(id, Arc::clone(&pending));
        (id, Some(pending))
    }

    /// Hand an inbound reply to the waiter registered for its
    /// `response_to_id`.
    pub fn complete(&self, message: Message) -> Completion {
        let id = message.header().response_to_id;
        let waiter = {
            let table = self.table.lock();
            match table.waiters.get(&id) {
                Some(waiter) => Arc::clone(waiter),
                None if table.expired.contains(&id) => return Completion::Late,
                None => return Completion::Unmatched(message),
            }
        };

        match waiter.fulfil(message) {
            Ok(()) => Completion::Delivered,
            Err(_late) => Completion::Late,
        }
    }

    /// Remove the waiter for `id`. A waiter removed without a reply is
    /// remembered so that a reply arriving later is recognised as late.
    pub fn remove(&self, id: i64) {
        let mut table = self.table.lock();
        if let Some(waiter) = table.waiters.remove(&id) {
            let answered = waiter.slot.lock().reply.is_some();
            if !answered {
                table.remember_expired(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().waiters.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.table.lock().waiters.contains_key(&id)
    }
}
