//! Producer bus: the preview/live slot pair
//!
//! Holds at most two producers per channel. The live slot's producer is the
//! sole writer into the frame ring; the preview slot shadow-decodes ahead of
//! a boundary. Promotion swaps the slots under a short lock, with the write
//! barrier raised on the outgoing producer before the swap completes.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{info, warn};

use crate::producer::{Producer, ProducerControl};

/// Owning handle to a producer running on its own thread.
pub struct ProducerHandle {
    name: &'static str,
    segment_id: Option<u64>,
    control: Arc<ProducerControl>,
    join: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    /// Start the producer (opening codecs synchronously, so errors surface
    /// to the caller) and spawn its decode loop.
    pub fn spawn(mut producer: Box<dyn Producer>, segment_id: Option<u64>) -> Result<Self> {
        producer.start()?;
        let name = producer.name();
        let control = Arc::clone(producer.control());
        let join = std::thread::Builder::new()
            .name(format!("producer-{}", segment_id.unwrap_or(0)))
            .spawn(move || {
                if let Err(e) = producer.run() {
                    warn!("{}: decode loop ended with error: {:#}", producer.name(), e);
                }
            })?;
        Ok(Self {
            name,
            segment_id,
            control,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn segment_id(&self) -> Option<u64> {
        self.segment_id
    }

    pub fn control(&self) -> &Arc<ProducerControl> {
        &self.control
    }

    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    /// Stop and wait up to `grace` for the thread to exit. Returns false if
    /// the thread outlived the grace window (it stays detached; the stop flag
    /// remains raised).
    pub fn stop_with_grace(&mut self, grace: Duration) -> bool {
        self.control.request_stop();
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + grace;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                warn!("{}: did not stop within {:?}", self.name, grace);
                self.join = Some(join);
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let _ = join.join();
        true
    }
}

#[derive(Default)]
struct Slots {
    preview: Option<ProducerHandle>,
    live: Option<ProducerHandle>,
}

/// The two named producer slots of one channel.
#[derive(Default)]
pub struct ProducerBus {
    slots: Mutex<Slots>,
}

impl ProducerBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a producer into the preview slot, replacing (and stopping) any
    /// previous occupant.
    pub fn load_preview(&self, handle: ProducerHandle) {
        let replaced = {
            let mut slots = self.slots.lock().unwrap();
            slots.preview.replace(handle)
        };
        if let Some(mut old) = replaced {
            info!("ProducerBus: replacing stale preview (segment {:?})", old.segment_id());
            old.stop_with_grace(Duration::from_millis(500));
        }
    }

    /// Swap preview into live. The outgoing live producer gets its write
    /// barrier raised inside the critical section, so it cannot touch shared
    /// state after the new producer owns the ring. Returns the outgoing
    /// handle (for graceful stop outside the lock) and the new live control.
    pub fn promote_preview_to_live(
        &self,
    ) -> (Option<ProducerHandle>, Option<Arc<ProducerControl>>) {
        let mut slots = self.slots.lock().unwrap();
        let outgoing = slots.live.take();
        if let Some(old) = &outgoing {
            old.control().set_write_barrier(true);
            old.control().request_stop();
        }
        slots.live = slots.preview.take();
        let new_control = slots.live.as_ref().map(|h| Arc::clone(h.control()));
        (outgoing, new_control)
    }

    pub fn clear_preview(&self) -> Option<ProducerHandle> {
        self.slots.lock().unwrap().preview.take()
    }

    pub fn has_preview(&self) -> bool {
        self.slots.lock().unwrap().preview.is_some()
    }

    pub fn has_live(&self) -> bool {
        self.slots.lock().unwrap().live.is_some()
    }

    pub fn live_control(&self) -> Option<Arc<ProducerControl>> {
        self.slots
            .lock()
            .unwrap()
            .live
            .as_ref()
            .map(|h| Arc::clone(h.control()))
    }

    pub fn live_segment_id(&self) -> Option<u64> {
        self.slots.lock().unwrap().live.as_ref().and_then(|h| h.segment_id())
    }

    /// Take both slots for teardown.
    pub fn take_all(&self) -> Vec<ProducerHandle> {
        let mut slots = self.slots.lock().unwrap();
        let mut out = Vec::new();
        if let Some(h) = slots.preview.take() {
            out.push(h);
        }
        if let Some(h) = slots.live.take() {
            out.push(h);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Producer stub that just parks until stopped.
    struct ParkedProducer {
        control: Arc<ProducerControl>,
        started: Arc<AtomicBool>,
    }

    impl ParkedProducer {
        fn new() -> Self {
            Self {
                control: ProducerControl::new(),
                started: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Producer for ParkedProducer {
        fn name(&self) -> &'static str {
            "ParkedProducer"
        }

        fn start(&mut self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn run(&mut self) -> Result<()> {
            while !self.control.stop_requested() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }

        fn control(&self) -> &Arc<ProducerControl> {
            &self.control
        }
    }

    fn spawn_parked(segment_id: u64) -> ProducerHandle {
        ProducerHandle::spawn(Box::new(ParkedProducer::new()), Some(segment_id)).unwrap()
    }

    #[test]
    fn test_promote_swaps_slots() {
        let bus = ProducerBus::new();
        bus.load_preview(spawn_parked(1));
        assert!(bus.has_preview());
        assert!(!bus.has_live());

        let (old, new) = bus.promote_preview_to_live();
        assert!(old.is_none());
        assert!(new.is_some());
        assert!(!bus.has_preview());
        assert!(bus.has_live());
        assert_eq!(bus.live_segment_id(), Some(1));

        for mut h in bus.take_all() {
            assert!(h.stop_with_grace(Duration::from_secs(1)));
        }
    }

    #[test]
    fn test_promote_barriers_outgoing() {
        let bus = ProducerBus::new();
        bus.load_preview(spawn_parked(1));
        bus.promote_preview_to_live();
        bus.load_preview(spawn_parked(2));

        let (old, new) = bus.promote_preview_to_live();
        let mut old = old.expect("outgoing live handle");
        // Barrier and stop are raised inside the swap
        assert!(old.control().write_barrier());
        assert!(old.control().stop_requested());
        assert!(new.is_some());
        assert_eq!(bus.live_segment_id(), Some(2));

        assert!(old.stop_with_grace(Duration::from_secs(1)));
        for mut h in bus.take_all() {
            assert!(h.stop_with_grace(Duration::from_secs(1)));
        }
    }

    #[test]
    fn test_load_preview_replaces_and_stops_old() {
        let bus = ProducerBus::new();
        bus.load_preview(spawn_parked(1));
        bus.load_preview(spawn_parked(2));
        assert!(bus.has_preview());

        let mut all = bus.take_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].segment_id(), Some(2));
        assert!(all[0].stop_with_grace(Duration::from_secs(1)));
    }

    #[test]
    fn test_stop_with_grace() {
        let mut handle = spawn_parked(7);
        assert!(handle.stop_with_grace(Duration::from_secs(1)));
        // Idempotent once joined
        assert!(handle.stop_with_grace(Duration::from_millis(1)));
    }
}
