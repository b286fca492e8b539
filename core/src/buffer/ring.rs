use std::collections::VecDeque;
use std::sync::Mutex;

use super::lock;

/// Fixed-capacity store of raw text lines, oldest evicted first.
///
/// Appends come from a reader task while snapshots are taken by the UI; the
/// lock is held only for the push or the copy.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    lines: VecDeque<String>,
    total_evicted: u64,
}

impl RingBuffer {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Ring {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                total_evicted: 0,
            }),
        }
    }

    pub fn append(&self, line: impl Into<String>) {
        let mut ring = lock(&self.inner);
        if ring.lines.len() == self.capacity {
            ring.lines.pop_front();
            ring.total_evicted += 1;
        }
        ring.lines.push_back(line.into());
    }

    /// Snapshot of the current window, oldest first
    pub fn lines(&self) -> Vec<String> {
        lock(&self.inner).lines.iter().cloned().collect()
    }

    /// The newest `n` lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<String> {
        let ring = lock(&self.inner);
        let skip = ring.lines.len().saturating_sub(n);
        ring.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_evicted(&self) -> u64 {
        lock(&self.inner).total_evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_keeps_last_lines_in_order() {
        let ring = RingBuffer::new(3);
        for i in 1..=5 {
            ring.append(format!("line {}", i));
        }
        assert_eq!(ring.lines(), vec!["line 3", "line 4", "line 5"]);
        assert_eq!(ring.total_evicted(), 2);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        for capacity in [1, 2, 7, 64] {
            let ring = RingBuffer::new(capacity);
            for i in 0..200 {
                ring.append(i.to_string());
                assert!(ring.len() <= capacity);
            }
            assert_eq!(ring.len(), capacity);
            assert_eq!(ring.total_evicted(), (200 - capacity) as u64);
            assert_eq!(ring.lines().last().map(String::as_str), Some("199"));
        }
    }

    #[test]
    fn test_below_capacity_keeps_everything() {
        let ring = RingBuffer::new(10);
        ring.append("a");
        ring.append("b");
        assert_eq!(ring.lines(), vec!["a", "b"]);
        assert_eq!(ring.total_evicted(), 0);
        assert_eq!(ring.tail(1), vec!["b"]);
        assert_eq!(ring.tail(5), vec!["a", "b"]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let ring = RingBuffer::new(0);
        ring.append("a");
        ring.append("b");
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.lines(), vec!["b"]);
    }

    #[test]
    fn test_concurrent_append_and_read() {
        let ring = Arc::new(RingBuffer::new(50));
        let writer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    ring.append(i.to_string());
                }
            })
        };

        for _ in 0..100 {
            let snapshot = ring.lines();
            assert!(snapshot.len() <= 50);
            let numbers: Vec<u32> = snapshot.iter().map(|s| s.parse().unwrap()).collect();
            assert!(numbers.windows(2).all(|w| w[0] + 1 == w[1]));
        }

        writer.join().unwrap();
        assert_eq!(ring.lines().first().map(String::as_str), Some("950"));
    }
}
