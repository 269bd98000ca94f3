//! Single-producer/single-consumer hand-off of whole frames.
//!
//! One slot always stays reserved for the producer. When the ring is full the
//! producer keeps overwriting the slot it holds, so a slow consumer costs
//! frames, never a blocked transfer callback.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::logger::LogSink;

#[derive(Debug, Default)]
struct Cursors {
    head: usize,
    tail: usize,
    used: usize,
}

struct Inner {
    slots: Vec<UnsafeCell<Box<[u8]>>>,
    frame_size: usize,
    cursors: Mutex<Cursors>,
    new_frame: Condvar,
    frames_dropped: AtomicUsize,
    log: LogSink,
}

// SAFETY: the producer only touches the slot at `head`, the consumer only the
// slot at `tail`, and `head != tail` whenever `used > 0` because `used` never
// exceeds `slots.len() - 1`. Cursor updates happen under the mutex.
unsafe impl Sync for Inner {}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Cursors> {
        // cursor bookkeeping cannot be left half-updated, so a poisoned lock is still usable
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, index: usize) -> &[u8] {
        // SAFETY: see the Sync impl; callers only pass the index they own.
        unsafe { &(&(*self.slots[index].get()))[..] }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot_mut(&self, index: usize) -> &mut [u8] {
        // SAFETY: see the Sync impl; only the producer calls this, with `head`.
        unsafe { &mut (&mut (*self.slots[index].get()))[..] }
    }
}

pub struct FrameRing;

impl FrameRing {
    /// Creates a ring of `num_frames` slots of `frame_size` bytes each.
    ///
    /// At least two slots are always allocated.
    pub fn new(num_frames: usize, frame_size: usize, log: LogSink) -> (FrameProducer, FrameConsumer) {
        let num_frames = num_frames.max(2);
        let slots = (0..num_frames)
            .map(|_| UnsafeCell::new(vec![0u8; frame_size].into_boxed_slice()))
            .collect();
        let inner = Arc::new(Inner {
            slots,
            frame_size,
            cursors: Mutex::new(Cursors::default()),
            new_frame: Condvar::new(),
            frames_dropped: AtomicUsize::new(0),
            log,
        });
        (FrameProducer { inner: inner.clone() }, FrameConsumer { inner })
    }
}

pub struct FrameProducer {
    inner: Arc<Inner>,
}

impl FrameProducer {
    /// The slot currently owned by the producer.
    pub fn writable_slot(&mut self) -> &mut [u8] {
        let head = self.inner.lock().head;
        self.inner.slot_mut(head)
    }

    /// Publishes the writable slot, or keeps it if the ring is full.
    pub fn finish_writing(&mut self) {
        let num_frames = self.inner.slots.len();
        let mut c = self.inner.lock();
        if c.used == num_frames - 1 {
            let dropped = self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            sink_trace!(self.inner.log, "frame ring full, overwriting slot {} ({} dropped)", c.head, dropped);
            return;
        }
        c.used += 1;
        c.head = (c.head + 1) % num_frames;
        self.inner.new_frame.notify_one();
    }

    pub fn frame_size(&self) -> usize {
        self.inner.frame_size
    }
}

pub struct FrameConsumer {
    inner: Arc<Inner>,
}

impl FrameConsumer {
    /// Blocks until a frame is readable and returns it without removing it.
    pub fn readable_slot_wait(&self) -> &[u8] {
        let mut c = self.inner.lock();
        while c.used == 0 {
            c = self.inner.new_frame.wait(c).unwrap_or_else(|e| e.into_inner());
        }
        let tail = c.tail;
        drop(c);
        self.inner.slot(tail)
    }

    /// Like [`FrameConsumer::readable_slot_wait`] but gives up after `timeout`.
    pub fn readable_slot_wait_for(&self, timeout: Duration) -> Option<&[u8]> {
        let c = self.inner.lock();
        let (c, _) = self
            .inner
            .new_frame
            .wait_timeout_while(c, timeout, |c| c.used == 0)
            .unwrap_or_else(|e| e.into_inner());
        if c.used == 0 {
            return None;
        }
        let tail = c.tail;
        drop(c);
        Some(self.inner.slot(tail))
    }

    /// Releases the frame returned by the last successful wait.
    pub fn finish_reading(&mut self) {
        let num_frames = self.inner.slots.len();
        let mut c = self.inner.lock();
        if c.used == 0 {
            sink_warn!(self.inner.log, "finish_reading without a readable frame");
            return;
        }
        c.used -= 1;
        c.tail = (c.tail + 1) % num_frames;
    }

    pub fn readable_frames(&self) -> usize {
        self.inner.lock().used
    }

    pub fn frames_dropped(&self) -> usize {
        self.inner.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn frame_size(&self) -> usize {
        self.inner.frame_size
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::logger::setup_logger;

    fn setup(frames: usize, size: usize) -> (FrameProducer, FrameConsumer) {
        setup_logger();
        FrameRing::new(frames, size, LogSink::global())
    }

    fn write(p: &mut FrameProducer, value: u8) {
        p.writable_slot().fill(value);
        p.finish_writing();
    }

    #[test]
    fn full_ring_overwrites_reserved_slot() {
        let (mut p, mut c) = setup(2, 4);
        write(&mut p, 1);
        write(&mut p, 2);
        write(&mut p, 3);

        assert_eq!(c.readable_frames(), 1);
        assert_eq!(c.frames_dropped(), 2);
        assert_eq!(c.readable_slot_wait(), &[1, 1, 1, 1]);
        c.finish_reading();
        assert_eq!(c.readable_frames(), 0);

        // the producer still holds the slot with the last frame it wrote
        assert_eq!(p.writable_slot(), &[3, 3, 3, 3]);
    }

    #[test]
    fn finish_reading_on_empty_ring_does_not_underflow() {
        let (mut p, mut c) = setup(2, 1);
        c.finish_reading();
        assert_eq!(c.readable_frames(), 0);
        write(&mut p, 9);
        assert_eq!(c.readable_frames(), 1);
        assert_eq!(c.readable_slot_wait_for(Duration::from_millis(1)), Some(&[9u8][..]));
    }

    #[test]
    fn timed_wait_expires() {
        let (_p, c) = setup(2, 1);
        let start = Instant::now();
        assert_eq!(c.readable_slot_wait_for(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn frames_cross_threads_in_order() {
        let (mut p, mut c) = setup(3, 16);
        let producer = thread::spawn(move || {
            for i in 0..50u8 {
                p.writable_slot().fill(i);
                p.finish_writing();
                thread::sleep(Duration::from_millis(1));
            }
        });

        let mut last = None;
        loop {
            let value = match c.readable_slot_wait_for(Duration::from_millis(200)) {
                Some(frame) => {
                    assert!(frame.iter().all(|b| *b == frame[0]));
                    frame[0]
                }
                None => break,
            };
            if let Some(prev) = last {
                assert!(value > prev);
            }
            last = Some(value);
            c.finish_reading();
        }
        producer.join().unwrap();
        assert!(last.is_some());
    }
}
