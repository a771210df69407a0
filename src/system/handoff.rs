//! Single-outstanding-task handoff between the tracking thread and the worker.
//!
//! Tracking submits one [`FrameJob`] per frame and must collect the
//! [`FrameResult`] of that job before submitting the next one. Both directions
//! use channels of capacity one, so at most one job is ever in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::map::FrameIndex;
use crate::tracking::TrackingCorrespondences;
use crate::vision::ImagePyramid;

/// Work handed to the worker after a frame was tracked.
pub struct FrameJob {
    pub frame_index: FrameIndex,
    pub pyramid: Arc<ImagePyramid>,
    /// Frame-to-frame tracking results of this frame.
    pub tracking: TrackingCorrespondences,
}

/// Result of a processed [`FrameJob`].
pub struct FrameResult {
    pub frame_index: FrameIndex,
    /// Points of the processed frame, to be tracked into the next frame.
    pub tracking: TrackingCorrespondences,
}

/// Tracking side of the handoff.
pub struct FrameHandoff {
    job_tx: Sender<FrameJob>,
    done_rx: Receiver<FrameResult>,
    outstanding: bool,
}

/// Worker side of the handoff.
pub struct JobPort {
    job_rx: Receiver<FrameJob>,
    done_tx: Sender<FrameResult>,
}

/// Create both ends of a handoff.
pub fn handoff() -> (FrameHandoff, JobPort) {
    let (job_tx, job_rx) = bounded(1);
    let (done_tx, done_rx) = bounded(1);
    (
        FrameHandoff {
            job_tx,
            done_rx,
            outstanding: false,
        },
        JobPort { job_rx, done_tx },
    )
}

impl FrameHandoff {
    /// Whether a submitted job has not been collected yet.
    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    /// Block until the outstanding job (if any) is finished and return its result.
    pub fn wait(&mut self) -> Result<Option<FrameResult>> {
        if !self.outstanding {
            return Ok(None);
        }
        let result = self
            .done_rx
            .recv()
            .map_err(|_| anyhow!("mapping worker stopped"))?;
        self.outstanding = false;
        Ok(Some(result))
    }

    /// Submit the job of the current frame; the previous one must have been collected.
    pub fn submit(&mut self, job: FrameJob) -> Result<()> {
        if self.outstanding {
            bail!("frame {} submitted while a job is outstanding", job.frame_index);
        }
        self.job_tx
            .send(job)
            .map_err(|_| anyhow!("mapping worker stopped"))?;
        self.outstanding = true;
        Ok(())
    }
}

/// What the worker found when checking for work.
pub enum JobPoll {
    Job(FrameJob),
    Empty,
    Disconnected,
}

impl JobPort {
    /// Check for a job without blocking.
    pub fn poll(&self) -> JobPoll {
        match self.job_rx.try_recv() {
            Ok(job) => JobPoll::Job(job),
            Err(TryRecvError::Empty) => JobPoll::Empty,
            Err(TryRecvError::Disconnected) => JobPoll::Disconnected,
        }
    }

    /// Wait up to `timeout` for a job.
    pub fn wait(&self, timeout: Duration) -> JobPoll {
        match self.job_rx.recv_timeout(timeout) {
            Ok(job) => JobPoll::Job(job),
            Err(RecvTimeoutError::Timeout) => JobPoll::Empty,
            Err(RecvTimeoutError::Disconnected) => JobPoll::Disconnected,
        }
    }

    /// Report a finished job; false if tracking is gone.
    pub fn complete(&self, result: FrameResult) -> bool {
        self.done_tx.send(result).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::GrayImage;
    use std::thread;
    use std::time::Instant;

    fn job(frame_index: FrameIndex) -> FrameJob {
        FrameJob {
            frame_index,
            pyramid: Arc::new(ImagePyramid::new(frame_index, 0.0, GrayImage::blank(32, 32), 1)),
            tracking: TrackingCorrespondences::default(),
        }
    }

    #[test]
    fn test_wait_blocks_until_job_completes() {
        let (mut handoff, port) = handoff();
        assert!(handoff.wait().unwrap().is_none());

        let worker = thread::spawn(move || {
            let JobPoll::Job(job) = port.wait(Duration::from_secs(5)) else {
                panic!("no job received");
            };
            thread::sleep(Duration::from_millis(100));
            let done = Instant::now();
            port.complete(FrameResult {
                frame_index: job.frame_index,
                tracking: TrackingCorrespondences::default(),
            });
            done
        });

        handoff.submit(job(0)).unwrap();
        assert!(handoff.is_outstanding());
        // a second submission is refused while the first job runs
        assert!(handoff.submit(job(1)).is_err());

        let result = handoff.wait().unwrap().unwrap();
        let returned = Instant::now();
        let completed = worker.join().unwrap();
        assert_eq!(result.frame_index, 0);
        assert!(returned >= completed);
        assert!(!handoff.is_outstanding());
    }

    #[test]
    fn test_dropped_worker_is_an_error() {
        let (mut handoff, port) = handoff();
        handoff.submit(job(0)).unwrap();
        drop(port);
        assert!(handoff.wait().is_err());
    }
}
