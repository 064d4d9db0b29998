//! Consumer-side jitter buffer.
//!
//! Packets are queued as the pipeline finishes them and handed to the
//! registered callback one per host tick, once enough audio is buffered to
//! ride out uneven chunk timing. Uses a ring buffer so the producer and the
//! tick side never contend on a growable queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, warn};

use super::packet::{OutputPacket, PacketKind};

type PacketCallback = Box<dyn FnMut(OutputPacket) + Send>;

/// Buffers output packets until a latency threshold is met, or until the
/// request's final packet is queued, whichever comes first.
pub struct JitterBuffer {
    producer: Mutex<HeapProd<OutputPacket>>,
    consumer: Mutex<HeapCons<OutputPacket>>,
    callback: Mutex<PacketCallback>,
    queued_samples: AtomicUsize, // Samples queued since the last final packet
    started: AtomicBool,         // Delivering, one packet per tick
    final_queued: AtomicBool,    // The request's last packet is in the ring
    threshold_samples: usize,
}

impl JitterBuffer {
    /// Create a jitter buffer.
    ///
    /// # Arguments
    /// * `threshold_samples` - Samples to accumulate before delivery starts
    /// * `capacity` - Maximum number of queued packets
    /// * `callback` - Receives each delivered packet
    pub fn new(threshold_samples: usize, capacity: usize, callback: impl FnMut(OutputPacket) + Send + 'static) -> Self {
        let (producer, consumer) = HeapRb::<OutputPacket>::new(capacity.max(1)).split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            callback: Mutex::new(Box::new(callback)),
            queued_samples: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            final_queued: AtomicBool::new(false),
            threshold_samples,
        }
    }

    /// Queue a finished packet.
    ///
    /// Non-audio packets are rejected. A full ring drops the packet.
    pub fn enqueue(&self, packet: OutputPacket) {
        if packet.kind != PacketKind::Audio {
            error!("❌ Wrong packet type for audio queue: {:?}", packet.kind);
            return;
        }

        let len = packet.len();
        let is_final = packet.is_final;
        if let Err(dropped) = self.producer.lock().try_push(packet) {
            warn!("Jitter buffer overflow: dropped packet of {} samples", dropped.len());
            return;
        }
        self.queued_samples.fetch_add(len, Ordering::Relaxed);
        if is_final {
            self.final_queued.store(true, Ordering::Relaxed);
        }
    }

    /// Advance one host tick, delivering at most one packet.
    ///
    /// Delivery starts once the queued audio reaches the threshold, or once the
    /// request's final packet is queued. It stops after the final packet.
    ///
    /// # Returns
    /// `true` if a packet was delivered.
    pub fn tick(&self) -> bool {
        if !self.started.load(Ordering::Relaxed) {
            let queued = self.queued_samples.load(Ordering::Relaxed);
            // A queued final packet starts playback early: nothing more will arrive to reach the threshold
            if queued < self.threshold_samples && !self.final_queued.load(Ordering::Relaxed) {
                return false;
            }
            debug!("Jitter buffer started with {} samples queued", queued);
            self.started.store(true, Ordering::Relaxed);
        }

        let Some(packet) = self.consumer.lock().try_pop() else {
            return false;
        };
        let is_final = packet.is_final;
        (self.callback.lock())(packet);

        if is_final {
            self.queued_samples.store(0, Ordering::Relaxed);
            self.final_queued.store(false, Ordering::Relaxed);
            self.started.store(false, Ordering::Relaxed);
        }
        true
    }

    /// Whether packets are currently being delivered.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Number of packets waiting.
    pub fn queued_packets(&self) -> usize {
        self.consumer.lock().occupied_len()
    }

    /// Samples queued since the last final packet.
    pub fn queued_samples(&self) -> usize {
        self.queued_samples.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<OutputPacket>>>, impl FnMut(OutputPacket) + Send + 'static) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        (delivered, move |p| sink.lock().push(p))
    }

    #[test]
    fn test_waits_for_threshold_then_delivers_in_order() {
        let (delivered, callback) = recorder();
        let jitter = JitterBuffer::new(100, 16, callback);

        jitter.enqueue(OutputPacket::audio(vec![0.1; 60], 44100, false));
        assert!(!jitter.tick());
        assert!(!jitter.is_started());

        jitter.enqueue(OutputPacket::audio(vec![0.2; 60], 44100, false));
        jitter.enqueue(OutputPacket::audio(vec![0.3; 10], 44100, true));

        // One packet per tick
        assert!(jitter.tick());
        assert_eq!(delivered.lock().len(), 1);
        assert!(jitter.tick());
        assert!(jitter.tick());
        assert!(!jitter.tick());

        let delivered = delivered.lock();
        assert_eq!(delivered.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![60, 60, 10]);
        assert!(delivered[2].is_final);
        assert!(!jitter.is_started());
        assert_eq!(jitter.queued_samples(), 0);
    }

    #[test]
    fn test_short_request_plays_once_final_is_queued() {
        let (delivered, callback) = recorder();
        let jitter = JitterBuffer::new(22050, 16, callback);
        jitter.enqueue(OutputPacket::audio(vec![0.0; 10], 44100, true));
        assert!(jitter.tick());
        assert_eq!(delivered.lock().len(), 1);
    }

    #[test]
    fn test_rejects_non_audio() {
        let (delivered, callback) = recorder();
        let jitter = JitterBuffer::new(0, 4, callback);
        let mut packet = OutputPacket::audio(vec![0.0; 10], 44100, true);
        packet.kind = PacketKind::Metadata;
        jitter.enqueue(packet);
        assert_eq!(jitter.queued_packets(), 0);
        assert!(!jitter.tick());
        assert!(delivered.lock().is_empty());
    }

    #[test]
    fn test_overflow_drops() {
        let (_delivered, callback) = recorder();
        let jitter = JitterBuffer::new(1000, 2, callback);
        for _ in 0..5 {
            jitter.enqueue(OutputPacket::audio(vec![0.0; 10], 44100, false));
        }
        assert_eq!(jitter.queued_packets(), 2);
        assert_eq!(jitter.queued_samples(), 20);
    }
}
