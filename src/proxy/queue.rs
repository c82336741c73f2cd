//! Ordered candidate queue shared by the orchestrator and the refresher

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::adapter::ProxyAdapter;

/// Candidate chosen from the head of the queue, tagged with the queue
/// generation it was taken from
#[derive(Clone)]
pub struct Selection {
    pub candidate: Arc<dyn ProxyAdapter>,
    pub generation: u64,
}

/// Ordered candidates; the head is the next one to run.
///
/// The generation increments on every wholesale replacement.
#[derive(Default)]
pub struct CandidateQueue {
    candidates: VecDeque<Arc<dyn ProxyAdapter>>,
    generation: u64,
}

impl CandidateQueue {
    pub fn new(candidates: Vec<Arc<dyn ProxyAdapter>>) -> Self {
        Self {
            candidates: candidates.into(),
            generation: 0,
        }
    }

    pub fn head(&self) -> Option<Selection> {
        self.candidates.front().map(|candidate| Selection {
            candidate: candidate.clone(),
            generation: self.generation,
        })
    }

    pub fn replace(&mut self, candidates: Vec<Arc<dyn ProxyAdapter>>) {
        self.candidates = candidates.into();
        self.generation += 1;
    }

    /// Move a failed selection to the tail.
    ///
    /// No-op (returns `false`) when the queue was replaced since the
    /// selection was made or the selection is no longer at the head.
    pub fn rotate(&mut self, failed: &Selection) -> bool {
        if failed.generation != self.generation {
            return false;
        }
        match self.candidates.front() {
            Some(head) if same_candidate(head, &failed.candidate) => {
                if let Some(head) = self.candidates.pop_front() {
                    self.candidates.push_back(head);
                }
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identities(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.identity()).collect()
    }
}

/// Mutex-guarded queue handle; every operation is atomic
#[derive(Clone, Default)]
pub struct SharedQueue {
    inner: Arc<Mutex<CandidateQueue>>,
}

impl SharedQueue {
    pub fn new(candidates: Vec<Arc<dyn ProxyAdapter>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CandidateQueue::new(candidates))),
        }
    }

    pub fn head(&self) -> Option<Selection> {
        self.inner.lock().head()
    }

    pub fn replace(&self, candidates: Vec<Arc<dyn ProxyAdapter>>) {
        self.inner.lock().replace(candidates);
    }

    pub fn rotate(&self, failed: &Selection) -> bool {
        self.inner.lock().rotate(failed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation()
    }

    pub fn identities(&self) -> Vec<String> {
        self.inner.lock().identities()
    }
}

fn same_candidate(a: &Arc<dyn ProxyAdapter>, b: &Arc<dyn ProxyAdapter>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::latency::tests::FixedLatency;
    use std::time::Duration;

    fn pool(names: &[&str]) -> Vec<Arc<dyn ProxyAdapter>> {
        names
            .iter()
            .map(|name| FixedLatency::new(name, Duration::from_millis(10)) as Arc<dyn ProxyAdapter>)
            .collect()
    }

    #[test]
    fn test_empty_queue_has_no_head() {
        let queue = SharedQueue::default();
        assert!(queue.head().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rotate_moves_head_to_tail() {
        let queue = SharedQueue::new(pool(&["a", "b", "c"]));

        let first = queue.head().unwrap();
        assert_eq!(first.candidate.identity(), "a");
        assert!(queue.rotate(&first));
        assert_eq!(queue.identities(), vec!["b", "c", "a"]);

        let second = queue.head().unwrap();
        assert!(queue.rotate(&second));
        assert_eq!(queue.identities(), vec!["c", "a", "b"]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_rotate_single_candidate_keeps_it() {
        let queue = SharedQueue::new(pool(&["only"]));
        let head = queue.head().unwrap();
        assert!(queue.rotate(&head));
        assert_eq!(queue.identities(), vec!["only"]);
    }

    #[test]
    fn test_rotate_after_replace_is_noop() {
        let queue = SharedQueue::new(pool(&["a", "b"]));
        let stale = queue.head().unwrap();

        queue.replace(pool(&["x", "y"]));
        assert_eq!(queue.generation(), 1);

        assert!(!queue.rotate(&stale));
        assert_eq!(queue.identities(), vec!["x", "y"]);
    }

    #[test]
    fn test_rotate_twice_only_moves_once() {
        let queue = SharedQueue::new(pool(&["a", "b", "c"]));
        let head = queue.head().unwrap();

        assert!(queue.rotate(&head));
        assert!(!queue.rotate(&head));
        assert_eq!(queue.identities(), vec!["b", "c", "a"]);
    }
}
