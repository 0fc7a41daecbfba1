//! Bounded SPSC frame queues between the live producer and the mux
//!
//! Two independent FIFO rings (video frames, audio frames) plus a shared
//! decode gate. The rings are lock-free on the hot path; the gate is a
//! Mutex/Condvar pair touched only when a ring fills up.
//!
//! # Backpressure model
//!
//! Slot-based, no hysteresis: the producer's decode gate blocks while either
//! ring is at capacity and wakes the instant one slot frees. The A/V gates
//! are coordinated through the same condvar so neither stream can run ahead
//! while the other is full.
//!
//! # Safety
//!
//! Each ring is single-producer single-consumer:
//!
//! 1. `tail` is only advanced by the producer, `head` only by the consumer.
//! 2. A slot is written only when `tail - head < capacity` (producer side)
//!    and read only when `tail - head > 0` (consumer side), so the two sides
//!    never touch the same slot concurrently.
//! 3. Release stores on the advancing index publish the slot contents to the
//!    other side's acquire load.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::config::BufferConfig;
use crate::frame::{AudioFrame, VideoFrame};

/// Lock-free bounded FIFO for a single producer and a single consumer.
pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    /// Total frames ever pushed; slot index is `tail % capacity`.
    tail: AtomicUsize,
    /// Total frames ever popped; slot index is `head % capacity`.
    head: AtomicUsize,
    capacity: usize,
}

// Safety: the SPSC discipline documented above keeps producer and consumer
// on disjoint slots; T just needs to be sendable across the boundary.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(None));
        Self {
            slots: slots.into_boxed_slice(),
            tail: AtomicUsize::new(0),
            head: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Producer side. Non-blocking; false when the ring is full.
    pub fn push(&self, value: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity {
            return false;
        }
        // Safety: this slot is outside the consumer's window (invariant 2).
        unsafe {
            *self.slots[tail % self.capacity].get() = Some(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side. Non-blocking; None when the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == 0 {
            return None;
        }
        // Safety: this slot was published by the producer's release store
        // and is outside the producer's window until head advances.
        let value = unsafe { (*self.slots[head % self.capacity].get()).take() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        value
    }

    /// Consumer side. Borrow the oldest element without consuming it.
    pub fn peek(&self) -> Option<&T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == 0 {
            return None;
        }
        // Safety: the consumer owns this slot until it advances head, and
        // &self prevents pop() racing this borrow from the same thread.
        unsafe { (*self.slots[head % self.capacity].get()).as_ref() }
    }
}

/// The per-channel frame buffer: independent video and audio rings behind a
/// single coordinated decode gate.
pub struct FrameRing {
    video: SpscRing<VideoFrame>,
    audio: SpscRing<AudioFrame>,
    gate: Mutex<()>,
    gate_cv: Condvar,
}

impl FrameRing {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            video: SpscRing::new(config.video_capacity),
            audio: SpscRing::new(config.audio_capacity),
            gate: Mutex::new(()),
            gate_cv: Condvar::new(),
        }
    }

    pub fn push_video(&self, frame: VideoFrame) -> bool {
        self.video.push(frame)
    }

    pub fn push_audio(&self, frame: AudioFrame) -> bool {
        self.audio.push(frame)
    }

    pub fn pop_video(&self) -> Option<VideoFrame> {
        let frame = self.video.pop();
        if frame.is_some() {
            self.notify_slot_free();
        }
        frame
    }

    pub fn pop_audio(&self) -> Option<AudioFrame> {
        let frame = self.audio.pop();
        if frame.is_some() {
            self.notify_slot_free();
        }
        frame
    }

    pub fn peek_video(&self) -> Option<&VideoFrame> {
        self.video.peek()
    }

    pub fn peek_audio(&self) -> Option<&AudioFrame> {
        self.audio.peek()
    }

    pub fn video_depth(&self) -> usize {
        self.video.len()
    }

    pub fn audio_depth(&self) -> usize {
        self.audio.len()
    }

    /// True while the decode gate must hold the producer: either stream at
    /// capacity blocks both.
    pub fn gate_closed(&self) -> bool {
        self.video.is_full() || self.audio.is_full()
    }

    /// Block the producer until a slot is free in both rings or `timeout`
    /// elapses. Returns true if the gate is open.
    pub fn wait_for_slot(&self, timeout: Duration) -> bool {
        if !self.gate_closed() {
            return true;
        }
        let guard = self.gate.lock().unwrap();
        let (_guard, res) = self
            .gate_cv
            .wait_timeout_while(guard, timeout, |_| self.gate_closed())
            .unwrap();
        !res.timed_out()
    }

    fn notify_slot_free(&self) {
        // Take the lock so a producer between its gate_closed() check and
        // its condvar wait cannot miss the wake.
        let _guard = self.gate.lock().unwrap();
        self.gate_cv.notify_all();
    }

    /// Drain both rings. Consumer-side; used when a session resets.
    pub fn clear(&self) {
        while self.video.pop().is_some() {}
        while self.audio.pop().is_some() {}
        self.notify_slot_free();
    }
}
