//! Pairs frames from two free-running cameras by frame number

use std::collections::VecDeque;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use super::frame::{Eye, EyeCollection, Frame, FrameSet};

/// Result of one synchronization step
#[derive(Debug)]
pub enum SyncOutcome {
    /// Every configured eye contributed a frame with the same number
    Ready(FrameSet),
    NotYetAvailable,
    /// All cameras hung up and no further match is possible
    Closed,
}

/// Buffers one queue per camera and only ever emits sets in which all
/// configured eyes share exactly the same frame number. When one camera
/// dropped a frame its partner's copy is discarded instead of being
/// emitted one-sided.
pub struct MultiSourceSynchronizer {
    intake: Receiver<Frame>,
    eyes: Vec<Eye>,
    queues: [VecDeque<Frame>; 2],
    queue_limit: usize,
    discarded: u64,
}

impl MultiSourceSynchronizer {
    pub fn new(intake: Receiver<Frame>, eyes: Vec<Eye>, queue_limit: usize) -> Self {
        Self {
            intake,
            eyes,
            queues: [VecDeque::new(), VecDeque::new()],
            queue_limit: queue_limit.max(1),
            discarded: 0,
        }
    }

    /// Frames thrown away because their counterpart never showed up
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn queued(&self, eye: Eye) -> usize {
        self.queues[eye.index()].len()
    }

    /// Waits up to `wait` for the next frame from any camera, queues it
    /// and tries to complete a set.
    pub fn next(&mut self, wait: Duration) -> SyncOutcome {
        if let SyncOutcome::Ready(set) = self.try_match() {
            return SyncOutcome::Ready(set);
        }

        match self.intake.recv_timeout(wait) {
            Ok(frame) => {
                self.push(frame);
                self.try_match()
            }
            Err(RecvTimeoutError::Timeout) => SyncOutcome::NotYetAvailable,
            Err(RecvTimeoutError::Disconnected) => SyncOutcome::Closed,
        }
    }

    /// Queues a frame on its eye's queue
    pub fn push(&mut self, frame: Frame) {
        let eye = frame.eye();
        if !self.eyes.contains(&eye) {
            warn!(eye = eye.label(), "Frame for an unconfigured eye, discarding");
            self.discarded += 1;
            return;
        }

        let queue = &mut self.queues[eye.index()];
        if queue.len() >= self.queue_limit {
            if let Some(stale) = queue.pop_front() {
                warn!(
                    eye = eye.label(),
                    frame = stale.frame_number(),
                    limit = self.queue_limit,
                    "Synchronizer queue full, partner camera stalled"
                );
                self.discarded += 1;
            }
        }
        queue.push_back(frame);
    }

    /// Matches queued heads without waiting for new input
    pub fn try_match(&mut self) -> SyncOutcome {
        loop {
            if self.eyes.iter().any(|eye| self.queues[eye.index()].is_empty()) {
                return SyncOutcome::NotYetAvailable;
            }

            let Some(min) = self
                .eyes
                .iter()
                .filter_map(|eye| self.queues[eye.index()].front().map(Frame::frame_number))
                .min()
            else {
                return SyncOutcome::NotYetAvailable;
            };

            let mut set = EyeCollection::default();
            let mut complete = true;
            for &eye in &self.eyes {
                let queue = &mut self.queues[eye.index()];
                if queue.front().map(Frame::frame_number) == Some(min) {
                    if let Some(frame) = queue.pop_front() {
                        set.set(eye, frame);
                    }
                } else {
                    complete = false;
                }
            }

            if complete {
                return SyncOutcome::Ready(FrameSet::new(set, min));
            }

            let partial = set.count() as u64;
            self.discarded += partial;
            debug!(
                frame = min,
                discarded = partial,
                "Counterpart frame missing, discarding partial set"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::tests::gray_frame;

    const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    fn drain(sync: &mut MultiSourceSynchronizer) -> Vec<u64> {
        let mut emitted = Vec::new();
        loop {
            match sync.next(Duration::from_millis(5)) {
                SyncOutcome::Ready(set) => {
                    for (_, frame) in set.frames.iter() {
                        assert_eq!(frame.frame_number(), set.frame_number);
                    }
                    assert_eq!(set.frames.count(), 2);
                    emitted.push(set.frame_number);
                }
                SyncOutcome::NotYetAvailable => continue,
                SyncOutcome::Closed => return emitted,
            }
        }
    }

    #[test]
    fn test_one_sided_drop_is_never_emitted() {
        let (tx, rx) = flume::unbounded();
        let mut sync = MultiSourceSynchronizer::new(rx, BOTH.to_vec(), 64);

        for n in [1, 2, 3] {
            tx.send(gray_frame(Eye::Left, n)).unwrap();
        }
        for n in [1, 3] {
            tx.send(gray_frame(Eye::Right, n)).unwrap();
        }
        drop(tx);

        assert_eq!(drain(&mut sync), vec![1, 3]);
        assert_eq!(sync.discarded(), 1);
    }

    #[test]
    fn test_interleaved_arrival_resolves_in_one_pass() {
        let (tx, rx) = flume::unbounded();
        let mut sync = MultiSourceSynchronizer::new(rx, BOTH.to_vec(), 64);

        tx.send(gray_frame(Eye::Left, 5)).unwrap();
        assert!(matches!(sync.next(Duration::from_millis(5)), SyncOutcome::NotYetAvailable));

        tx.send(gray_frame(Eye::Right, 5)).unwrap();
        match sync.next(Duration::from_millis(5)) {
            SyncOutcome::Ready(set) => assert_eq!(set.frame_number, 5),
            other => panic!("expected a set, got {:?}", other),
        }
        assert_eq!(sync.discarded(), 0);
    }

    #[test]
    fn test_drops_on_both_sides() {
        let (tx, rx) = flume::unbounded();
        let mut sync = MultiSourceSynchronizer::new(rx, BOTH.to_vec(), 64);

        for n in [1, 2, 4, 5, 6] {
            tx.send(gray_frame(Eye::Left, n)).unwrap();
        }
        for n in [1, 3, 4, 6] {
            tx.send(gray_frame(Eye::Right, n)).unwrap();
        }
        drop(tx);

        assert_eq!(drain(&mut sync), vec![1, 4, 6]);
    }

    #[test]
    fn test_stalled_camera_queue_is_bounded() {
        let (tx, rx) = flume::unbounded();
        let mut sync = MultiSourceSynchronizer::new(rx, BOTH.to_vec(), 3);

        for n in 1..=10 {
            tx.send(gray_frame(Eye::Left, n)).unwrap();
        }
        drop(tx);

        assert!(drain(&mut sync).is_empty());
        assert_eq!(sync.queued(Eye::Left), 3);
        assert_eq!(sync.discarded(), 7);
    }

    #[test]
    fn test_single_eye_passes_through() {
        let (tx, rx) = flume::unbounded();
        let mut sync = MultiSourceSynchronizer::new(rx, vec![Eye::Right], 8);

        tx.send(gray_frame(Eye::Right, 9)).unwrap();
        tx.send(gray_frame(Eye::Left, 9)).unwrap();
        drop(tx);

        match sync.next(Duration::from_millis(5)) {
            SyncOutcome::Ready(set) => {
                assert_eq!(set.frame_number, 9);
                assert!(set.get(Eye::Left).is_none());
            }
            other => panic!("expected a set, got {:?}", other),
        }
        assert!(matches!(sync.next(Duration::from_millis(5)), SyncOutcome::NotYetAvailable));
        assert!(matches!(sync.next(Duration::from_millis(5)), SyncOutcome::Closed));
        assert_eq!(sync.discarded(), 1);
    }
}
