//! Timing wheel implementation

const NIL: usize = usize::MAX;

/// Handle for removing an item before it expires
///
/// Stale keys (item already expired or removed) are detected through the
/// slot generation and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutKey {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node<T> {
    deadline: u64,
    item: Option<T>,
    prev: usize,
    next: usize,
    bucket: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    head: usize,
    tail: usize,
}

impl Bucket {
    const EMPTY: Bucket = Bucket { head: NIL, tail: NIL };

    fn is_empty(&self) -> bool {
        self.head == NIL
    }
}

/// Deadline-ordered store of items keyed by absolute millisecond
#[derive(Debug)]
pub struct TimeoutWheel<T> {
    buckets: Vec<Bucket>,
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    /// Absolute time represented by the cursor bucket
    start_ms: u64,
    cursor: usize,
    len: usize,
}

impl<T> TimeoutWheel<T> {
    /// Create a wheel covering `horizon_ms` milliseconds starting at `now_ms`
    pub fn new(horizon_ms: u64, now_ms: u64) -> Self {
        let size = horizon_ms.max(1) as usize;
        Self {
            buckets: vec![Bucket::EMPTY; size],
            nodes: Vec::new(),
            free: Vec::new(),
            start_ms: now_ms,
            cursor: 0,
            len: 0,
        }
    }

    /// Number of buckets
    #[inline]
    pub fn horizon(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `item` to fire at `deadline_ms`.
    ///
    /// Deadlines in the past land in the current bucket. Deadlines beyond
    /// the horizon are clamped to the last bucket and re-armed when that
    /// bucket is scanned before they are due.
    pub fn add(&mut self, deadline_ms: u64, item: T) -> TimeoutKey {
        let index = match self.free.pop() {
            Some(i) => {
                let node = &mut self.nodes[i];
                node.deadline = deadline_ms;
                node.item = Some(item);
                i
            }
            None => {
                self.nodes.push(Node {
                    deadline: deadline_ms,
                    item: Some(item),
                    prev: NIL,
                    next: NIL,
                    bucket: NIL,
                    generation: 0,
                });
                self.nodes.len() - 1
            }
        };
        self.link(index);
        self.len += 1;
        TimeoutKey {
            index: index as u32,
            generation: self.nodes[index].generation,
        }
    }

    /// Unlink and return the item behind `key`, if it is still pending
    pub fn remove(&mut self, key: TimeoutKey) -> Option<T> {
        let index = key.index as usize;
        let node = self.nodes.get(index)?;
        if node.generation != key.generation || node.item.is_none() {
            return None;
        }
        self.unlink(index);
        self.len -= 1;
        self.release(index)
    }

    /// Whether `key` still refers to a pending item
    pub fn contains(&self, key: TimeoutKey) -> bool {
        self.nodes
            .get(key.index as usize)
            .is_some_and(|n| n.generation == key.generation && n.item.is_some())
    }

    /// Remove and return every item whose deadline is `<= now_ms`, in bucket
    /// order and FIFO within a bucket.
    pub fn expire(&mut self, now_ms: u64) -> Vec<T> {
        let mut out = Vec::new();
        if now_ms < self.start_ms || self.len == 0 {
            if now_ms > self.start_ms {
                self.advance(now_ms, 1);
            }
            return out;
        }

        let size = self.buckets.len();
        let span = ((now_ms - self.start_ms + 1) as usize).min(size);
        let mut rearm = Vec::new();

        for i in 0..span {
            let b = (self.cursor + i) % size;
            let mut cur = self.buckets[b].head;
            self.buckets[b] = Bucket::EMPTY;
            while cur != NIL {
                let next = self.nodes[cur].next;
                self.nodes[cur].prev = NIL;
                self.nodes[cur].next = NIL;
                self.nodes[cur].bucket = NIL;
                if self.nodes[cur].deadline <= now_ms {
                    self.len -= 1;
                    if let Some(item) = self.release(cur) {
                        out.push(item);
                    }
                } else {
                    rearm.push(cur);
                }
                cur = next;
            }
        }

        self.advance(now_ms, span);
        if !rearm.is_empty() {
            tracing::trace!(count = rearm.len(), "re-arming clamped timeouts");
        }
        for index in rearm {
            self.link(index);
        }
        out
    }

    /// Milliseconds from `now_ms` until the nearest pending deadline, looking
    /// at most `limit_ms` ahead. `None` when the wheel is empty.
    pub fn next_wait(&self, now_ms: u64, limit_ms: u64) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        let size = self.buckets.len();
        let lag = now_ms.saturating_sub(self.start_ms);
        let scan = (lag.saturating_add(limit_ms).saturating_add(1) as usize).min(size);

        for i in 0..scan {
            let b = &self.buckets[(self.cursor + i) % size];
            if b.is_empty() {
                continue;
            }
            let mut earliest = u64::MAX;
            let mut cur = b.head;
            while cur != NIL {
                earliest = earliest.min(self.nodes[cur].deadline);
                cur = self.nodes[cur].next;
            }
            return Some(earliest.saturating_sub(now_ms).min(limit_ms));
        }
        Some(limit_ms)
    }

    fn advance(&mut self, now_ms: u64, span: usize) {
        let size = self.buckets.len();
        self.cursor = (self.cursor + span - 1) % size;
        self.start_ms = now_ms;
    }

    fn bucket_for(&self, deadline_ms: u64) -> usize {
        let size = self.buckets.len();
        let mut diff = deadline_ms.saturating_sub(self.start_ms);
        if diff >= size as u64 {
            tracing::trace!(deadline_ms, start_ms = self.start_ms, "timeout clamped to horizon");
            diff = size as u64 - 1;
        }
        (self.cursor + diff as usize) % size
    }

    fn link(&mut self, index: usize) {
        let b = self.bucket_for(self.nodes[index].deadline);
        let tail = self.buckets[b].tail;
        {
            let node = &mut self.nodes[index];
            node.bucket = b;
            node.prev = tail;
            node.next = NIL;
        }
        if tail == NIL {
            self.buckets[b].head = index;
        } else {
            self.nodes[tail].next = index;
        }
        self.buckets[b].tail = index;
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next, b) = {
            let n = &self.nodes[index];
            (n.prev, n.next, n.bucket)
        };
        if b == NIL {
            return;
        }
        if prev == NIL {
            self.buckets[b].head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.buckets[b].tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        let n = &mut self.nodes[index];
        n.prev = NIL;
        n.next = NIL;
        n.bucket = NIL;
    }

    fn release(&mut self, index: usize) -> Option<T> {
        let node = &mut self.nodes[index];
        node.generation = node.generation.wrapping_add(1);
        let item = node.item.take();
        self.free.push(index);
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expire_in_deadline_order() {
        let mut wheel = TimeoutWheel::new(1000, 100);
        wheel.add(130, "c");
        wheel.add(110, "a");
        wheel.add(120, "b");
        assert_eq!(wheel.len(), 3);

        assert!(wheel.expire(105).is_empty());
        assert_eq!(wheel.expire(125), vec!["a", "b"]);
        assert_eq!(wheel.expire(200), vec!["c"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_fifo_within_bucket() {
        let mut wheel = TimeoutWheel::new(100, 0);
        for i in 0..5 {
            wheel.add(10, i);
        }
        assert_eq!(wheel.expire(10), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_remove_before_expiry() {
        let mut wheel = TimeoutWheel::new(100, 0);
        let a = wheel.add(5, 'a');
        let b = wheel.add(5, 'b');
        let c = wheel.add(5, 'c');

        assert_eq!(wheel.remove(b), Some('b'));
        assert!(!wheel.contains(b));
        assert_eq!(wheel.remove(b), None);
        assert!(wheel.contains(a));
        assert!(wheel.contains(c));
        assert_eq!(wheel.expire(5), vec!['a', 'c']);
    }

    #[test]
    fn test_stale_key_after_expire() {
        let mut wheel = TimeoutWheel::new(100, 0);
        let k = wheel.add(1, 1u32);
        assert_eq!(wheel.expire(1), vec![1]);
        // slot reused by a new item; the old key must not remove it
        let k2 = wheel.add(3, 2u32);
        assert_eq!(wheel.remove(k), None);
        assert_eq!(wheel.remove(k2), Some(2));
    }

    #[test]
    fn test_past_deadline_fires_next_expire() {
        let mut wheel = TimeoutWheel::new(100, 50);
        wheel.add(10, "late");
        assert_eq!(wheel.expire(50), vec!["late"]);
    }

    #[test]
    fn test_clamped_deadline_rearmed() {
        let mut wheel = TimeoutWheel::new(10, 0);
        wheel.add(25, "far");
        // last bucket (ms 9) is scanned, item is not yet due
        assert!(wheel.expire(9).is_empty());
        assert_eq!(wheel.len(), 1);
        assert!(wheel.expire(18).is_empty());
        assert_eq!(wheel.expire(25), vec!["far"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_expire_after_long_gap() {
        let mut wheel = TimeoutWheel::new(16, 0);
        wheel.add(3, 1);
        wheel.add(12, 2);
        assert_eq!(wheel.expire(1000), vec![1, 2]);
        wheel.add(1005, 3);
        assert!(wheel.expire(1004).is_empty());
        assert_eq!(wheel.expire(1005), vec![3]);
    }

    #[test]
    fn test_next_wait() {
        let mut wheel = TimeoutWheel::new(1000, 0);
        assert_eq!(wheel.next_wait(0, 500), None);
        wheel.add(40, ());
        assert_eq!(wheel.next_wait(0, 500), Some(40));
        assert_eq!(wheel.next_wait(30, 500), Some(10));
        assert_eq!(wheel.next_wait(0, 20), Some(20));
        assert_eq!(wheel.next_wait(50, 500), Some(0));
    }
}
