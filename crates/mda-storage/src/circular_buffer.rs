//! Fixed-capacity circular image buffer.
//!
//! The buffer owns pre-allocated slot storage sized to one camera frame. A
//! single mutex guards the slot ledger: the monotonic write and read cursors,
//! the slot contents and the overflow counters. Pixel bytes are copied into a
//! slot on push, so a push is O(1) in the number of buffered images.
//!
//! # Cursors
//!
//! ```text
//! remaining = write_cursor - read_cursor
//! free      = capacity - remaining
//! slot(seq) = seq % capacity
//! ```
//!
//! # Overflow
//!
//! When every slot holds an unread image, a push overwrites the oldest unread
//! slot and advances the read cursor. The overflow is counted and logged, and
//! consumers see it as a gap in image sequence numbers.
//!
//! # Waiting
//!
//! [`CircularBuffer::pop_oldest`] waits (bounded) while the buffer is empty and
//! the producer is still active, and fails immediately with
//! [`AcqError::BufferEmpty`] once [`CircularBuffer::finish`] has been called.

use bytes::Bytes;
use mda_core::capabilities::FrameGeometry;
use mda_core::error::{AcqError, AcqResult};
use mda_core::image::{ImageTags, PixelType, TaggedImage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const BYTES_PER_MB: usize = 1024 * 1024;

struct Slot {
    data: Vec<u8>,
    len: usize,
    width: u32,
    height: u32,
    pixel_type: PixelType,
    tags: ImageTags,
    sequence: u64,
}

impl Slot {
    fn empty(slot_bytes: usize, geometry: FrameGeometry) -> Self {
        Self {
            data: vec![0; slot_bytes],
            len: 0,
            width: geometry.width,
            height: geometry.height,
            pixel_type: geometry.pixel_type,
            tags: ImageTags::new(),
            sequence: 0,
        }
    }

    fn fill(&mut self, image: TaggedImage, sequence: u64) {
        let pixels = image.pixels();
        self.data[..pixels.len()].copy_from_slice(pixels);
        self.len = pixels.len();
        self.width = image.width();
        self.height = image.height();
        self.pixel_type = image.pixel_type();
        self.sequence = sequence;
        self.tags = image.tags().clone();
    }

    fn to_image(&self) -> AcqResult<TaggedImage> {
        let pixels = Bytes::copy_from_slice(&self.data[..self.len]);
        let mut image = TaggedImage::new(self.width, self.height, self.pixel_type, pixels)?;
        for (key, value) in self.tags.iter() {
            image.tags_mut().insert(key, value.clone());
        }
        image.set_sequence(self.sequence);
        Ok(image)
    }
}

#[derive(Default)]
struct Timing {
    first: Option<Instant>,
    last: Option<Instant>,
    pushes: u64,
}

struct Ledger {
    slots: Vec<Slot>,
    write_cursor: u64,
    read_cursor: u64,
    overwritten: u64,
    timing: Timing,
}

impl Ledger {
    fn remaining(&self) -> usize {
        usize::try_from(self.write_cursor - self.read_cursor).unwrap_or(usize::MAX)
    }
}

/// Point-in-time buffer statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStats {
    /// Total slots.
    pub capacity: usize,
    /// Bytes per slot.
    pub slot_bytes: usize,
    /// Unread images.
    pub remaining: usize,
    /// Slots available before overflow.
    pub free: usize,
    /// Images pushed since the last reset.
    pub total_pushed: u64,
    /// Unread images lost to overflow.
    pub overwritten: u64,
    /// Mean time between pushes.
    pub average_interval_ms: f64,
}

/// Bounded, overwrite-oldest image buffer shared by producer and consumers.
pub struct CircularBuffer {
    ledger: Mutex<Ledger>,
    available: Notify,
    producing: AtomicBool,
    capacity: usize,
    slot_bytes: usize,
}

impl std::fmt::Debug for CircularBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularBuffer")
            .field("capacity", &self.capacity)
            .field("slot_bytes", &self.slot_bytes)
            .field("remaining", &self.remaining_count())
            .finish()
    }
}

impl CircularBuffer {
    /// Buffer with exactly `capacity` slots (at least 1) for frames of `geometry`.
    #[must_use]
    pub fn with_capacity(capacity: usize, geometry: FrameGeometry) -> Self {
        let capacity = capacity.max(1);
        let slot_bytes = geometry.frame_bytes().max(1);
        let slots = (0..capacity)
            .map(|_| Slot::empty(slot_bytes, geometry))
            .collect();
        debug!(capacity, slot_bytes, "Circular buffer allocated");
        Self {
            ledger: Mutex::new(Ledger {
                slots,
                write_cursor: 0,
                read_cursor: 0,
                overwritten: 0,
                timing: Timing::default(),
            }),
            available: Notify::new(),
            producing: AtomicBool::new(true),
            capacity,
            slot_bytes,
        }
    }

    /// Buffer sized from a memory footprint: `memory_mb` divided into
    /// frame-sized slots, with at least one slot.
    #[must_use]
    pub fn with_memory_mb(memory_mb: usize, geometry: FrameGeometry) -> Self {
        let slot_bytes = geometry.frame_bytes().max(1);
        let capacity = memory_mb.saturating_mul(BYTES_PER_MB) / slot_bytes;
        info!(
            memory_mb,
            slot_bytes,
            slots = capacity.max(1),
            "Sizing circular buffer from camera geometry"
        );
        Self::with_capacity(capacity, geometry)
    }

    /// Copies `image` into the next slot and returns its sequence number.
    ///
    /// Overwrites the oldest unread image when full.
    pub fn push(&self, image: TaggedImage) -> AcqResult<u64> {
        if image.byte_len() > self.slot_bytes {
            return Err(AcqError::SlotSizeMismatch {
                actual: image.byte_len(),
                slot: self.slot_bytes,
            });
        }

        let (sequence, lost) = {
            let mut ledger = self.ledger.lock();
            let mut lost = None;
            if ledger.remaining() >= self.capacity {
                lost = Some(ledger.read_cursor);
                ledger.read_cursor += 1;
                ledger.overwritten += 1;
            }
            let sequence = ledger.write_cursor;
            let index = self.slot_index(sequence);
            ledger.slots[index].fill(image, sequence);
            ledger.write_cursor += 1;

            let now = Instant::now();
            let timing = &mut ledger.timing;
            timing.first.get_or_insert(now);
            timing.last = Some(now);
            timing.pushes += 1;
            (sequence, lost.map(|seq| (seq, ledger.overwritten)))
        };

        if let Some((lost_sequence, overwritten)) = lost {
            warn!(
                lost_sequence,
                overwritten,
                capacity = self.capacity,
                "Circular buffer overflow; oldest unread image overwritten"
            );
        }
        self.available.notify_waiters();
        Ok(sequence)
    }

    /// Unread images.
    #[must_use]
    pub fn remaining_count(&self) -> usize {
        self.ledger.lock().remaining()
    }

    /// Slots available before the next push overflows.
    #[must_use]
    pub fn free_capacity(&self) -> usize {
        self.capacity - self.ledger.lock().remaining().min(self.capacity)
    }

    /// Total slots.
    #[must_use]
    pub fn total_capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per slot.
    #[must_use]
    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Removes the oldest unread image without waiting.
    #[must_use]
    pub fn try_pop_oldest(&self) -> Option<TaggedImage> {
        let mut ledger = self.ledger.lock();
        if ledger.remaining() == 0 {
            return None;
        }
        let index = self.slot_index(ledger.read_cursor);
        match ledger.slots[index].to_image() {
            Ok(image) => {
                ledger.read_cursor += 1;
                Some(image)
            }
            Err(err) => {
                warn!(error = %err, "Discarding unreadable buffer slot");
                ledger.read_cursor += 1;
                None
            }
        }
    }

    /// Removes the oldest unread image, waiting up to `wait` while the
    /// producer is active.
    ///
    /// Fails with [`AcqError::BufferEmpty`] when nothing arrives in time or the
    /// producer has finished.
    pub async fn pop_oldest(&self, wait: Duration) -> AcqResult<TaggedImage> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(image) = self.try_pop_oldest() {
                return Ok(image);
            }
            if !self.is_producing() {
                return Err(AcqError::BufferEmpty);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.try_pop_oldest().ok_or(AcqError::BufferEmpty);
            }
        }
    }

    /// Most recently pushed image, without consuming it.
    ///
    /// Still returns the newest frame after it has been popped, until it is
    /// overwritten or the buffer is reset.
    #[must_use]
    pub fn peek_latest(&self) -> Option<TaggedImage> {
        let ledger = self.ledger.lock();
        let latest = ledger.write_cursor.checked_sub(1)?;
        ledger.slots[self.slot_index(latest)].to_image().ok()
    }

    /// Clears every image and counter and marks the producer active again.
    pub fn reset(&self) {
        {
            let mut ledger = self.ledger.lock();
            ledger.write_cursor = 0;
            ledger.read_cursor = 0;
            ledger.overwritten = 0;
            ledger.timing = Timing::default();
            for slot in &mut ledger.slots {
                slot.len = 0;
                slot.tags = ImageTags::new();
            }
        }
        self.producing.store(true, Ordering::SeqCst);
        debug!(capacity = self.capacity, "Circular buffer reset");
    }

    /// Marks the producer finished. Waiters return once the buffer is empty.
    pub fn finish(&self) {
        self.producing.store(false, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    /// Whether the producer may still push.
    #[must_use]
    pub fn is_producing(&self) -> bool {
        self.producing.load(Ordering::SeqCst)
    }

    /// Whether any unread image has been overwritten since the last reset.
    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.ledger.lock().overwritten > 0
    }

    /// Unread images lost to overflow since the last reset.
    #[must_use]
    pub fn overwritten_count(&self) -> u64 {
        self.ledger.lock().overwritten
    }

    /// Images pushed since the last reset. Also the next sequence number.
    #[must_use]
    pub fn write_cursor(&self) -> u64 {
        self.ledger.lock().write_cursor
    }

    /// Sequence number of the next image to be popped.
    #[must_use]
    pub fn read_cursor(&self) -> u64 {
        self.ledger.lock().read_cursor
    }

    /// Mean interval between pushes in milliseconds; zero with fewer than two.
    #[must_use]
    pub fn average_interval_ms(&self) -> f64 {
        Self::interval_of(&self.ledger.lock().timing)
    }

    /// Snapshot of every counter, taken under one lock.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let ledger = self.ledger.lock();
        let remaining = ledger.remaining();
        BufferStats {
            capacity: self.capacity,
            slot_bytes: self.slot_bytes,
            remaining,
            free: self.capacity - remaining.min(self.capacity),
            total_pushed: ledger.write_cursor,
            overwritten: ledger.overwritten,
            average_interval_ms: Self::interval_of(&ledger.timing),
        }
    }

    fn interval_of(timing: &Timing) -> f64 {
        match (timing.first, timing.last) {
            (Some(first), Some(last)) if timing.pushes > 1 => {
                (last - first).as_secs_f64() * 1000.0 / (timing.pushes - 1) as f64
            }
            _ => 0.0,
        }
    }

    fn slot_index(&self, sequence: u64) -> usize {
        (sequence % self.capacity as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mda_core::image::tags;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn geometry() -> FrameGeometry {
        FrameGeometry {
            width: 2,
            height: 1,
            pixel_type: PixelType::Gray8,
        }
    }

    fn frame(label: &str, value: u8) -> TaggedImage {
        TaggedImage::new(2, 1, PixelType::Gray8, vec![value, value])
            .unwrap()
            .with_tag("Label", label)
    }

    fn label(image: &TaggedImage) -> String {
        image.tags().get("Label").unwrap().to_string()
    }

    #[test]
    fn round_trip_preserves_order_and_tags() {
        let buffer = CircularBuffer::with_capacity(4, geometry());
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let seq = buffer.push(frame(name, i as u8)).unwrap();
            assert_eq!(seq, i as u64);
        }
        assert_eq!(buffer.remaining_count(), 4);
        assert_eq!(buffer.free_capacity(), 0);

        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let image = buffer.try_pop_oldest().unwrap();
            assert_eq!(label(&image), *name);
            assert_eq!(image.pixels().as_ref(), &[i as u8, i as u8]);
            assert_eq!(image.sequence(), Some(i as u64));
            assert_eq!(image.tags().get_index(tags::WIDTH), Some(2));
        }
        assert!(buffer.try_pop_oldest().is_none());
        assert!(!buffer.is_overflowed());
    }

    #[traced_test]
    #[test]
    fn overflow_overwrites_oldest_and_exposes_gap() {
        let buffer = CircularBuffer::with_capacity(3, geometry());
        for (i, name) in ["A", "B", "C", "D"].iter().enumerate() {
            buffer.push(frame(name, i as u8)).unwrap();
        }

        assert_eq!(buffer.remaining_count(), 3);
        assert!(buffer.is_overflowed());
        assert_eq!(buffer.overwritten_count(), 1);
        assert!(logs_contain("Circular buffer overflow"));

        let b = buffer.try_pop_oldest().unwrap();
        assert_eq!(label(&b), "B");
        assert_eq!(b.sequence(), Some(1));
        let rest: Vec<String> = std::iter::from_fn(|| buffer.try_pop_oldest())
            .map(|i| label(&i))
            .collect();
        assert_eq!(rest, vec!["C", "D"]);
    }

    #[test]
    fn remaining_never_exceeds_capacity() {
        let buffer = CircularBuffer::with_capacity(5, geometry());
        for i in 0..23u8 {
            buffer.push(frame("x", i)).unwrap();
            assert!(buffer.remaining_count() <= 5);
            assert_eq!(
                buffer.remaining_count() + buffer.free_capacity(),
                buffer.total_capacity()
            );
        }
        assert_eq!(buffer.overwritten_count(), 18);
        assert_eq!(buffer.read_cursor(), 18);
        assert_eq!(buffer.write_cursor(), 23);
    }

    #[test]
    fn rejects_images_larger_than_a_slot() {
        let buffer = CircularBuffer::with_capacity(2, geometry());
        let big = TaggedImage::new(4, 1, PixelType::Gray8, vec![0u8; 4]).unwrap();
        assert!(matches!(
            buffer.push(big),
            Err(AcqError::SlotSizeMismatch { actual: 4, slot: 2 })
        ));
        assert_eq!(buffer.remaining_count(), 0);
    }

    #[test]
    fn peek_latest_does_not_consume() {
        let buffer = CircularBuffer::with_capacity(3, geometry());
        assert!(buffer.peek_latest().is_none());
        buffer.push(frame("first", 1)).unwrap();
        buffer.push(frame("second", 2)).unwrap();

        assert_eq!(label(&buffer.peek_latest().unwrap()), "second");
        assert_eq!(buffer.remaining_count(), 2);
        buffer.try_pop_oldest().unwrap();
        buffer.try_pop_oldest().unwrap();
        assert_eq!(label(&buffer.peek_latest().unwrap()), "second");
    }

    #[test]
    fn memory_footprint_sets_slot_count() {
        let geometry = FrameGeometry {
            width: 512,
            height: 512,
            pixel_type: PixelType::Gray16,
        };
        let buffer = CircularBuffer::with_memory_mb(2, geometry);
        assert_eq!(buffer.slot_bytes(), 512 * 512 * 2);
        assert_eq!(buffer.total_capacity(), 4);

        let tiny = CircularBuffer::with_memory_mb(0, geometry);
        assert_eq!(tiny.total_capacity(), 1);
    }

    #[test]
    fn reset_clears_cursors_and_counters() {
        let buffer = CircularBuffer::with_capacity(1, geometry());
        buffer.push(frame("a", 1)).unwrap();
        buffer.push(frame("b", 2)).unwrap();
        buffer.finish();
        assert!(buffer.is_overflowed());

        buffer.reset();
        let stats = buffer.stats();
        assert_eq!(stats.remaining, 0);
        assert_eq!(stats.total_pushed, 0);
        assert_eq!(stats.overwritten, 0);
        assert!(buffer.is_producing());
        assert!(buffer.peek_latest().is_none());
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let buffer = Arc::new(CircularBuffer::with_capacity(2, geometry()));
        let producer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(frame("late", 7)).unwrap();
        });

        let image = buffer.pop_oldest(Duration::from_secs(5)).await.unwrap();
        assert_eq!(label(&image), "late");
    }

    #[tokio::test]
    async fn pop_times_out_while_producing() {
        let buffer = CircularBuffer::with_capacity(2, geometry());
        let err = buffer.pop_oldest(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, AcqError::BufferEmpty));
    }

    #[tokio::test]
    async fn pop_returns_immediately_once_finished() {
        let buffer = CircularBuffer::with_capacity(2, geometry());
        buffer.push(frame("only", 1)).unwrap();
        buffer.finish();

        assert!(buffer.pop_oldest(Duration::from_secs(60)).await.is_ok());
        let started = Instant::now();
        let err = buffer.pop_oldest(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, AcqError::BufferEmpty));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_poppers_receive_each_image_once() {
        let buffer = Arc::new(CircularBuffer::with_capacity(256, geometry()));
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let buffer = buffer.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(image) = buffer.pop_oldest(Duration::from_secs(5)).await {
                    seen.push(image.sequence().unwrap());
                }
                seen
            }));
        }
        for i in 0..200u32 {
            buffer.push(frame("x", (i % 256) as u8)).unwrap();
            if i % 16 == 0 {
                tokio::task::yield_now().await;
            }
        }
        buffer.finish();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..200u64).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn average_interval_tracks_push_spacing() {
        let buffer = CircularBuffer::with_capacity(8, geometry());
        assert_eq!(buffer.average_interval_ms(), 0.0);
        for i in 0..5u8 {
            buffer.push(frame("x", i)).unwrap();
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        let avg = buffer.average_interval_ms();
        assert!((avg - 10.0).abs() < 0.5, "average was {avg}");
    }
}
