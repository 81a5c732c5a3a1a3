pub mod capture;
pub mod kernel;
pub mod worker;

pub use capture::FfmpegFrameSource;
pub use kernel::{Frame, FrameDiffKernel, MotionKernel};
pub use worker::{FrameSource, MotionJob, MotionWorker};
