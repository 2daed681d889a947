//! Double-buffered event queues with per-reader cursors.
//!
//! Each queue keeps a `current` and a `previous` buffer. Swapping
//! rotates current into previous and clears the old previous, giving
//! every event a two-frame retention window. The registry addresses
//! queues by stable index, never by pointer, so registering a new event
//! type mid-run cannot invalidate a held reader.

use std::any::{Any, TypeId};
use std::marker::PhantomData;

use ahash::AHashMap;

/// Double-buffered queue for events of type `T`.
///
/// Events carry implicit ascending ids; readers track the id they have
/// consumed up to, so each reader sees each event at most once, in send
/// order.
pub struct EventQueue<T> {
    current: Vec<T>,
    previous: Vec<T>,
    /// Id of the first event in `previous`
    previous_start: u64,
    /// Id of the first event in `current`
    current_start: u64,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            current: Vec::new(),
            previous: Vec::new(),
            previous_start: 0,
            current_start: 0,
        }
    }

    pub fn send(&mut self, event: T) {
        self.current.push(event);
    }

    /// Total events ever sent (id of the next event)
    pub fn sent_count(&self) -> u64 {
        self.current_start + self.current.len() as u64
    }

    /// Events still retained (current + one previous frame)
    pub fn len(&self) -> usize {
        self.previous.len() + self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rotate: previous ← current, dropping the old previous frame.
    pub fn swap(&mut self) {
        let sent = self.sent_count();
        self.previous = std::mem::take(&mut self.current);
        self.previous_start = self.current_start;
        self.current_start = sent;
    }

    pub fn clear(&mut self) {
        let sent = self.sent_count();
        self.current.clear();
        self.previous.clear();
        self.previous_start = sent;
        self.current_start = sent;
    }

    /// Retained events with id >= `cursor`, oldest first.
    pub fn iter_from(&self, cursor: u64) -> impl Iterator<Item = &T> {
        let prev_skip = cursor.saturating_sub(self.previous_start) as usize;
        let cur_skip = cursor.saturating_sub(self.current_start) as usize;
        self.previous
            .iter()
            .skip(prev_skip)
            .chain(self.current.iter().skip(cur_skip))
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over one event queue.
///
/// Holds the queue's registry index, not a pointer; stays valid across
/// later registrations. Created by [`Events::reader`]; observes events
/// sent after its creation.
pub struct EventReader<T> {
    index: usize,
    cursor: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> EventReader<T> {
    /// Drain unseen retained events, oldest first, advancing the cursor.
    pub fn read<'a>(&mut self, events: &'a Events) -> impl Iterator<Item = &'a T> {
        let queue = events.queue_by_index::<T>(self.index);
        let cursor = self.cursor;
        if let Some(queue) = queue {
            self.cursor = queue.sent_count();
        }
        queue.into_iter().flat_map(move |q| q.iter_from(cursor))
    }

    /// Unseen retained events without consuming them
    pub fn peek_len(&self, events: &Events) -> usize {
        events
            .queue_by_index::<T>(self.index)
            .map_or(0, |q| q.iter_from(self.cursor).count())
    }
}

trait AnyEventQueue: Send + Sync {
    fn swap(&mut self);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Send + Sync + 'static> AnyEventQueue for EventQueue<T> {
    fn swap(&mut self) {
        EventQueue::swap(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Registry of event queues, one per event type.
///
/// Queues are appended to a vector that never shrinks; the index is
/// the stable address handed to readers.
pub struct Events {
    queues: Vec<Box<dyn AnyEventQueue>>,
    index: AHashMap<TypeId, usize>,
}

impl Events {
    pub fn new() -> Self {
        Self {
            queues: Vec::new(),
            index: AHashMap::new(),
        }
    }

    /// Register the queue for `T` (idempotent), returning its stable index.
    pub fn register<T: Send + Sync + 'static>(&mut self) -> usize {
        if let Some(&index) = self.index.get(&TypeId::of::<T>()) {
            return index;
        }
        let index = self.queues.len();
        self.queues.push(Box::new(EventQueue::<T>::new()));
        self.index.insert(TypeId::of::<T>(), index);
        index
    }

    /// Send an event, registering its queue on first use.
    pub fn send<T: Send + Sync + 'static>(&mut self, event: T) {
        let index = self.register::<T>();
        if let Some(queue) = self.queues[index].as_any_mut().downcast_mut::<EventQueue<T>>() {
            queue.send(event);
        }
    }

    /// Create a reader for `T`, registering its queue on first use.
    /// The reader observes events sent after this call.
    pub fn reader<T: Send + Sync + 'static>(&mut self) -> EventReader<T> {
        let index = self.register::<T>();
        let cursor = self
            .queue_by_index::<T>(index)
            .map_or(0, |q| q.sent_count());
        EventReader {
            index,
            cursor,
            _marker: PhantomData,
        }
    }

    pub fn queue<T: Send + Sync + 'static>(&self) -> Option<&EventQueue<T>> {
        let index = *self.index.get(&TypeId::of::<T>())?;
        self.queue_by_index::<T>(index)
    }

    pub fn queue_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut EventQueue<T>> {
        let index = *self.index.get(&TypeId::of::<T>())?;
        self.queues
            .get_mut(index)?
            .as_any_mut()
            .downcast_mut::<EventQueue<T>>()
    }

    fn queue_by_index<T: Send + Sync + 'static>(&self, index: usize) -> Option<&EventQueue<T>> {
        self.queues.get(index)?.as_any().downcast_ref::<EventQueue<T>>()
    }

    /// Rotate every queue. Called by the scheduler once per update.
    pub fn swap_all(&mut self) {
        for queue in &mut self.queues {
            queue.swap();
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Clone)]
    struct Damage(u32);

    #[derive(Debug, PartialEq, Clone)]
    struct Healed(u32);

    #[test]
    fn test_reader_sees_events_once_in_order() {
        let mut events = Events::new();
        let mut reader = events.reader::<Damage>();

        events.send(Damage(1));
        events.send(Damage(2));

        let seen: Vec<_> = reader.read(&events).cloned().collect();
        assert_eq!(seen, vec![Damage(1), Damage(2)]);

        // Already consumed
        assert_eq!(reader.read(&events).count(), 0);
    }

    #[test]
    fn test_two_frame_retention() {
        let mut events = Events::new();
        let mut reader = events.reader::<Damage>();

        events.send(Damage(1));
        events.queue_mut::<Damage>().unwrap().swap();
        events.send(Damage(2));

        // Reader observes [previous, current] in send order
        let seen: Vec<_> = reader.read(&events).cloned().collect();
        assert_eq!(seen, vec![Damage(1), Damage(2)]);

        // Two more swaps retire everything
        events.queue_mut::<Damage>().unwrap().swap();
        events.queue_mut::<Damage>().unwrap().swap();
        assert!(events.queue::<Damage>().unwrap().is_empty());
    }

    #[test]
    fn test_event_dropped_after_two_swaps_missed() {
        let mut events = Events::new();
        let mut reader = events.reader::<Damage>();

        events.send(Damage(1));
        events.queue_mut::<Damage>().unwrap().swap();
        events.queue_mut::<Damage>().unwrap().swap();

        // Missed its retention window
        assert_eq!(reader.read(&events).count(), 0);
    }

    #[test]
    fn test_independent_reader_cursors() {
        let mut events = Events::new();
        let mut r1 = events.reader::<Damage>();
        let mut r2 = events.reader::<Damage>();

        events.send(Damage(7));

        assert_eq!(r1.read(&events).count(), 1);
        // r1's consumption does not affect r2
        assert_eq!(r2.read(&events).count(), 1);
    }

    #[test]
    fn test_registering_new_type_keeps_readers_valid() {
        let mut events = Events::new();
        let mut reader = events.reader::<Damage>();
        events.send(Damage(1));

        // Grow the registry after the reader was handed out
        for _ in 0..64 {
            events.register::<Healed>();
            events.send(Healed(0));
        }

        let seen: Vec<_> = reader.read(&events).cloned().collect();
        assert_eq!(seen, vec![Damage(1)]);
    }

    #[test]
    fn test_reader_starts_at_creation_point() {
        let mut events = Events::new();
        events.send(Damage(1));

        let mut reader = events.reader::<Damage>();
        events.send(Damage(2));

        let seen: Vec<_> = reader.read(&events).cloned().collect();
        assert_eq!(seen, vec![Damage(2)]);
    }

    #[test]
    fn test_swap_all_rotates_every_queue() {
        let mut events = Events::new();
        events.send(Damage(1));
        events.send(Healed(2));

        events.swap_all();
        events.swap_all();

        assert!(events.queue::<Damage>().unwrap().is_empty());
        assert!(events.queue::<Healed>().unwrap().is_empty());
    }
}
