//! A pool of virtual audio slot indices, handed out to streamers that need
//! an OS-level loopback device.

use parking_lot::Mutex;

/// Fixed-size pool of slot indices `0..capacity`.
pub struct SlotAllocator {
    free: Mutex<Vec<usize>>,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new((0..capacity).rev().collect()),
        }
    }

    /// Allocates a slot, or `None` if the pool is exhausted.
    pub fn alloc(&self) -> Option<usize> {
        self.free.lock().pop()
    }

    /// Returns a slot to the pool. Idempotent and safe for any index,
    /// including one never allocated or already freed.
    pub fn free(&self, slot: usize) {
        let mut free = self.free.lock();
        if !free.contains(&slot) {
            free.push(slot);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// OS-level loopback device name a streamer process reads from.
pub fn capture_device(slot: usize) -> String {
    format!("lb{}p", slot)
}

/// OS-level loopback device name a streamer process writes to.
pub fn playback_device(slot: usize) -> String {
    format!("lb{}c", slot)
}

/// Physical output channel device name.
pub fn physical_device(phys_src: u32) -> String {
    format!("ch{}", phys_src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exhausts_then_refills_on_free() {
        let pool = SlotAllocator::new(2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert!(pool.alloc().is_none());
        pool.free(a);
        assert_eq!(pool.alloc(), Some(a));
    }

    #[test]
    fn free_is_idempotent_and_tolerates_out_of_range() {
        let pool = SlotAllocator::new(1);
        pool.free(5);
        pool.free(5);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn device_names_match_slot_and_physical_channel_conventions() {
        assert_eq!(capture_device(3), "lb3p");
        assert_eq!(playback_device(3), "lb3c");
        assert_eq!(physical_device(1), "ch1");
    }
}
