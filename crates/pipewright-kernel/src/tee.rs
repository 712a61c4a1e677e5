//! Tee — split one sequence into independently consumed branches.
//!
//! The upstream is pulled at most once per item, by whichever branch asks
//! first. That branch receives the item directly; a clone is queued for
//! every other branch still open. A branch that is dropped stops receiving
//! and frees its queue; when the last branch goes, the upstream is dropped.
//!
//! A slow branch holds every item it has not yet consumed, so the memory
//! cost is bounded by how far the fastest branch runs ahead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use pipewright_types::Result;

use crate::seq::Enumerable;

struct TeeShared<T> {
    upstream: tokio::sync::Mutex<Option<Enumerable<T>>>,
    branches: Mutex<Vec<Option<VecDeque<Result<T>>>>>,
}

impl<T> TeeShared<T> {
    fn branches(&self) -> MutexGuard<'_, Vec<Option<VecDeque<Result<T>>>>> {
        self.branches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Branch<T> {
    index: usize,
    shared: Arc<TeeShared<T>>,
}

impl<T: Clone + Send + 'static> Branch<T> {
    fn pop_queued(&self) -> Option<Result<T>> {
        self.shared.branches()[self.index].as_mut()?.pop_front()
    }

    async fn pull(&self) -> Option<Result<T>> {
        if let Some(item) = self.pop_queued() {
            return Some(item);
        }
        let mut upstream = self.shared.upstream.lock().await;
        // Another branch may have pulled while we waited for the lock.
        if let Some(item) = self.pop_queued() {
            return Some(item);
        }
        let item = upstream.as_mut()?.next().await;

        let Some(item) = item else {
            *upstream = None;
            return None;
        };
        if item.is_err() {
            *upstream = None;
        }
        let mut branches = self.shared.branches();
        for (i, queue) in branches.iter_mut().enumerate() {
            if i == self.index {
                continue;
            }
            if let Some(queue) = queue {
                queue.push_back(item.clone());
            }
        }
        Some(item)
    }
}

impl<T> Drop for Branch<T> {
    fn drop(&mut self) {
        let last = {
            let mut branches = self.shared.branches();
            branches[self.index] = None;
            branches.iter().all(Option::is_none)
        };
        if last {
            if let Ok(mut upstream) = self.shared.upstream.try_lock() {
                upstream.take();
            }
        }
    }
}

impl<T: Clone + Send + 'static> Enumerable<T> {
    /// Split into `n` branches that each see every item (and the error, if
    /// any) in order. `n == 0` drops the upstream unpulled.
    pub fn tee(self, n: usize) -> Vec<Enumerable<T>> {
        if n == 0 {
            return Vec::new();
        }
        let shared = Arc::new(TeeShared {
            upstream: tokio::sync::Mutex::new(Some(self)),
            branches: Mutex::new((0..n).map(|_| Some(VecDeque::new())).collect()),
        });
        (0..n)
            .map(|index| {
                let branch = Branch {
                    index,
                    shared: shared.clone(),
                };
                Enumerable::unfold(branch, |branch| async move {
                    let item = branch.pull().await?;
                    Some((item, branch))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::PipelineError;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(n: usize) -> (Enumerable<usize>, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        let seq = Enumerable::from_iterator(0..n).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (seq, pulls)
    }

    #[tokio::test]
    async fn test_tee_zero_branches() {
        let (seq, pulls) = counted(3);
        assert!(seq.tee(0).is_empty());
        assert_eq!(pulls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tee_one_branch() {
        let (seq, _) = counted(3);
        let mut branches = seq.tee(1);
        let only = branches.pop().unwrap();
        assert_eq!(only.collect().await.unwrap(), vec![0, 1, 2]);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::single(1)]
    #[case::long(100)]
    #[tokio::test]
    async fn test_two_branches_see_whole_input(#[case] len: usize) {
        let (seq, pulls) = counted(len);
        let mut branches = seq.tee(2);
        let b = branches.pop().unwrap();
        let a = branches.pop().unwrap();
        let (a, b) = tokio::join!(a.collect(), b.collect());
        let expected: Vec<usize> = (0..len).collect();
        assert_eq!(a.unwrap(), expected);
        assert_eq!(b.unwrap(), expected);
        assert_eq!(pulls.load(Ordering::SeqCst), len);
    }

    #[tokio::test]
    async fn test_each_branch_sees_every_item_once_pulled() {
        let (seq, pulls) = counted(4);
        let mut branches = seq.tee(3).into_iter();
        let a = branches.next().unwrap();
        let b = branches.next().unwrap();
        let c = branches.next().unwrap();

        assert_eq!(a.collect().await.unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(c.collect().await.unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(b.collect().await.unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(pulls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_interleaved_branches() {
        let (seq, pulls) = counted(3);
        let mut branches = seq.tee(2);
        let mut b = branches.pop().unwrap();
        let mut a = branches.pop().unwrap();

        assert_eq!(a.next().await.unwrap().unwrap(), 0);
        assert_eq!(b.next().await.unwrap().unwrap(), 0);
        assert_eq!(b.next().await.unwrap().unwrap(), 1);
        assert_eq!(a.next().await.unwrap().unwrap(), 1);
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_reaches_every_branch() {
        let seq = Enumerable::from_iterator(vec![1]).chain(Enumerable::failed(PipelineError::message("x")));
        let mut branches = seq.tee(2);
        let b = branches.pop().unwrap();
        let a = branches.pop().unwrap();
        assert!(a.collect().await.is_err());
        assert!(b.collect().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_branch_stops_queueing() {
        let (seq, _) = counted(100);
        let mut branches = seq.tee(2);
        let dropped = branches.pop().unwrap();
        drop(dropped);
        let kept = branches.pop().unwrap();
        assert_eq!(kept.count().await.unwrap(), 100);
    }
}
