use parking_lot::Mutex;

/// Smallest size class handed out by the pool.
const MIN_CLASS_BYTES: usize = 256;
/// Largest pooled class; anything bigger is allocated and dropped directly.
const MAX_CLASS_BYTES: usize = 64 * 1024;
/// Buffers retained per class before further returns are dropped.
const MAX_PER_CLASS: usize = 256;

/// A size-classed pool of reusable byte buffers.
///
/// UDP receive plus fragmentation produces a stream of short-lived
/// allocations; pooling caps that churn. Classes are powers of two between
/// [`MIN_CLASS_BYTES`] and [`MAX_CLASS_BYTES`]. Returned buffers keep their
/// capacity but are handed out empty; contents are never zeroed.
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        let mut classes = Vec::new();
        let mut size = MIN_CLASS_BYTES;
        while size <= MAX_CLASS_BYTES {
            classes.push(Mutex::new(Vec::new()));
            size *= 2;
        }
        Self { classes }
    }

    fn class_index(size: usize) -> Option<usize> {
        if size > MAX_CLASS_BYTES {
            return None;
        }
        let rounded = size.max(MIN_CLASS_BYTES).next_power_of_two();
        Some(rounded.trailing_zeros() as usize - MIN_CLASS_BYTES.trailing_zeros() as usize)
    }

    /// Returns an empty buffer with capacity at least `size`.
    pub fn get(&self, size: usize) -> Vec<u8> {
        match Self::class_index(size) {
            Some(idx) => {
                if let Some(mut buf) = self.classes[idx].lock().pop() {
                    buf.clear();
                    buf
                } else {
                    Vec::with_capacity(MIN_CLASS_BYTES << idx)
                }
            }
            None => Vec::with_capacity(size),
        }
    }

    /// Files a buffer back under its capacity class. Oversized or
    /// undersized buffers are simply dropped.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() < MIN_CLASS_BYTES {
            return;
        }
        let Some(idx) = Self::class_index(buf.capacity()) else {
            return;
        };
        // A buffer that grew past its class boundary files under the class
        // fully covered by its capacity.
        let idx = if (MIN_CLASS_BYTES << idx) > buf.capacity() {
            match idx.checked_sub(1) {
                Some(i) => i,
                None => return,
            }
        } else {
            idx
        };
        let mut class = self.classes[idx].lock();
        if class.len() < MAX_PER_CLASS {
            class.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_capacity() {
        let pool = BufferPool::new();
        let buf = pool.get(100);
        assert!(buf.capacity() >= 100);
        assert!(buf.is_empty());

        let buf = pool.get(5000);
        assert!(buf.capacity() >= 5000);
    }

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new();
        let mut buf = pool.get(1024);
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr = buf.as_ptr();
        pool.put(buf);

        let buf = pool.get(1024);
        assert_eq!(buf.as_ptr(), ptr);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversize_not_pooled() {
        let pool = BufferPool::new();
        let buf = pool.get(MAX_CLASS_BYTES * 2);
        assert!(buf.capacity() >= MAX_CLASS_BYTES * 2);
        pool.put(buf); // dropped, no panic
    }
}
