use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::motion::kernel::{Frame, MotionKernel};

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const WARMUP_FRAMES: u32 = 150;
const MIN_AREA: usize = 15_000;
const COOLDOWN: Duration = Duration::from_secs(10);

/// A dispatched motion job, handed to the Evidence Runner.
#[derive(Debug, Clone)]
pub struct MotionJob {
    pub uuid: String,
    pub score: usize,
    pub time_point: String,
}

/// Supplies frames to the detector; an external collaborator (the capture
/// pipeline) that the worker doesn't need to know the shape of.
pub trait FrameSource: Send {
    /// Returns `None` for an empty/dropped frame.
    fn read_frame(&mut self) -> Option<Frame>;
}

/// The per-camera motion detection loop: warmup, threshold, cooldown,
/// dispatch. Runs inside the motion-detector child process the Supervisor
/// owns.
///
/// The scheduling/warmup/cooldown/dispatch logic here is the part the spec
/// actually pins; the capture and pixel kernel are abstracted behind
/// `FrameSource`/`MotionKernel` so this loop is fully testable with fakes.
pub struct MotionWorker<S, K> {
    pub uuid: String,
    source: S,
    kernel: K,
    frames_seen: u32,
    last_motion_event: Option<Instant>,
}

impl<S: FrameSource, K: MotionKernel> MotionWorker<S, K> {
    pub fn new(uuid: String, source: S, kernel: K) -> Self {
        Self {
            uuid,
            source,
            kernel,
            frames_seen: 0,
            last_motion_event: None,
        }
    }

    /// Extracts the camera UUID from the `-addr` argument: its last path
    /// segment.
    pub fn uuid_from_addr(addr: &str) -> String {
        addr.rsplit('/').next().unwrap_or(addr).to_string()
    }

    /// Processes a single tick; returns a job if this tick triggered one.
    /// Exposed separately from the run loop so warmup/cooldown/threshold
    /// logic is directly unit-testable without a real clock or sleep.
    pub fn tick(&mut self, now: Instant) -> Option<MotionJob> {
        let frame = self.source.read_frame()?;
        let score = self.kernel.detect(&frame);
        self.frames_seen += 1;

        if self.frames_seen <= WARMUP_FRAMES {
            return None;
        }

        if score < MIN_AREA {
            return None;
        }

        if let Some(last) = self.last_motion_event {
            if now.duration_since(last) <= COOLDOWN {
                return None;
            }
        }

        self.last_motion_event = Some(now);
        let time_point = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S-%6f").to_string();
        info!(uuid = %self.uuid, score, "motion detected, dispatching job");

        Some(MotionJob {
            uuid: self.uuid.clone(),
            score,
            time_point,
        })
    }

    /// Runs ticks on a fixed interval until `shutdown` fires, handing each
    /// triggered job to `dispatch`.
    pub async fn run(
        &mut self,
        shutdown: tokio_util::sync::CancellationToken,
        mut dispatch: impl FnMut(MotionJob),
    ) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(uuid = %self.uuid, "motion worker stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let Some(job) = self.tick(Instant::now()) {
                        dispatch(job);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::kernel::ScriptedKernel;
    use std::collections::VecDeque;

    struct FixedSource {
        remaining: u32,
    }

    impl FrameSource for FixedSource {
        fn read_frame(&mut self) -> Option<Frame> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(Frame {
                data: vec![],
                width: 1,
                height: 1,
            })
        }
    }

    #[test]
    fn uuid_is_the_last_path_segment() {
        assert_eq!(
            MotionWorker::<FixedSource, ScriptedKernel>::uuid_from_addr("rtsp://host/stream/abc-123"),
            "abc-123"
        );
        assert_eq!(
            MotionWorker::<FixedSource, ScriptedKernel>::uuid_from_addr("abc-123"),
            "abc-123"
        );
    }

    #[test]
    fn warmup_frames_never_dispatch_regardless_of_score() {
        let source = FixedSource { remaining: 200 };
        let kernel = ScriptedKernel {
            scores: (0..200).map(|_| 100_000).collect(),
        };
        let mut worker = MotionWorker::new("cam".to_string(), source, kernel);

        let mut now = Instant::now();
        for _ in 0..WARMUP_FRAMES {
            assert!(worker.tick(now).is_none());
            now += Duration::from_millis(50);
        }
    }

    #[test]
    fn score_below_threshold_does_not_dispatch() {
        let source = FixedSource { remaining: 200 };
        let mut scores: VecDeque<usize> = (0..WARMUP_FRAMES).map(|_| 0).collect();
        scores.push_back(100);
        let kernel = ScriptedKernel { scores };
        let mut worker = MotionWorker::new("cam".to_string(), source, kernel);

        let now = Instant::now();
        for i in 0..=WARMUP_FRAMES {
            let result = worker.tick(now + Duration::from_millis(50 * i as u64));
            assert!(result.is_none());
        }
    }

    #[test]
    fn score_above_threshold_past_warmup_dispatches_once_then_cools_down() {
        let source = FixedSource { remaining: 300 };
        let mut scores: VecDeque<usize> = (0..WARMUP_FRAMES).map(|_| 0).collect();
        scores.push_back(20_000);
        scores.push_back(20_000);
        let kernel = ScriptedKernel { scores };
        let mut worker = MotionWorker::new("cam".to_string(), source, kernel);

        let mut now = Instant::now();
        for _ in 0..WARMUP_FRAMES {
            worker.tick(now);
            now += Duration::from_millis(50);
        }

        let job = worker.tick(now).expect("should dispatch");
        assert_eq!(job.uuid, "cam");
        assert_eq!(job.score, 20_000);

        now += Duration::from_millis(50);
        assert!(worker.tick(now).is_none(), "should be within cooldown");
    }

    #[test]
    fn cooldown_expires_after_ten_seconds() {
        let source = FixedSource { remaining: 400 };
        let mut scores: VecDeque<usize> = (0..WARMUP_FRAMES).map(|_| 0).collect();
        scores.push_back(20_000);
        scores.push_back(20_000);
        let kernel = ScriptedKernel { scores };
        let mut worker = MotionWorker::new("cam".to_string(), source, kernel);

        let mut now = Instant::now();
        for _ in 0..WARMUP_FRAMES {
            worker.tick(now);
            now += Duration::from_millis(50);
        }
        worker.tick(now).expect("first dispatch");

        now += Duration::from_secs(11);
        let job = worker.tick(now);
        assert!(job.is_some(), "cooldown should have expired");
    }
}
