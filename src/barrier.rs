//! N-way single-use start barrier. Parallel client streams and the two directions of a
//!  full-duplex pair rendezvous here so their transfers share one start instant.

use std::sync::Mutex;

use tokio::sync::watch;

use crate::timing::clock::Timestamp;

pub struct StartBarrier {
    state: Mutex<BarrierState>,
    released: watch::Sender<bool>,
}

struct BarrierState {
    remaining: usize,
    release_time: Option<Timestamp>,
}

impl StartBarrier {
    pub fn new(participants: usize) -> StartBarrier {
        assert!(participants > 0, "a barrier needs at least one participant");
        StartBarrier {
            state: Mutex::new(BarrierState {
                remaining: participants,
                release_time: None,
            }),
            released: watch::Sender::new(false),
        }
    }

    /// Wait for all participants. Returns `true` for the single caller that released the
    ///  barrier; the release wall-clock time is recorded before anyone wakes.
    pub async fn wait(&self) -> bool {
        let mut rx = self.released.subscribe();
        {
            let mut state = self.state.lock().expect("barrier mutex poisoned");
            if state.remaining == 0 {
                return false; // single-use barrier already released
            }
            state.remaining -= 1;
            if state.remaining == 0 {
                state.release_time = Some(Timestamp::now());
                drop(state);
                let _ = self.released.send(true);
                return true;
            }
        }
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return false;
            }
        }
        false
    }

    /// The wall-clock instant the last participant arrived, once released.
    pub fn release_time(&self) -> Option<Timestamp> {
        self.state.lock().expect("barrier mutex poisoned").release_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case::pair(2)]
    #[case::many(5)]
    #[tokio::test]
    async fn test_all_participants_released_exactly_one_releaser(#[case] n: usize) {
        let barrier = Arc::new(StartBarrier::new(n));
        let mut handles = Vec::new();
        for _ in 0..n {
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move { barrier.wait().await }));
        }
        let mut releasers = 0;
        for handle in handles {
            if handle.await.unwrap() {
                releasers += 1;
            }
        }
        assert_eq!(releasers, 1);
        assert!(barrier.release_time().is_some());
    }

    #[tokio::test]
    async fn test_release_time_unset_while_waiting() {
        let barrier = Arc::new(StartBarrier::new(2));
        assert!(barrier.release_time().is_none());

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(barrier.release_time().is_none());

        assert!(barrier.wait().await || waiter.await.unwrap());
        assert!(barrier.release_time().is_some());
    }

    #[tokio::test]
    async fn test_wait_after_release_returns_immediately() {
        let barrier = StartBarrier::new(1);
        assert!(barrier.wait().await);
        assert!(!barrier.wait().await);
    }
}
