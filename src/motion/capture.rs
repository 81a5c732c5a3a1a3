use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;
use tracing::{error, warn};

use crate::motion::kernel::Frame;
use crate::motion::worker::FrameSource;

const CAPTURE_WIDTH: u32 = 320;
const CAPTURE_HEIGHT: u32 = 240;
const CHANNEL_CAPACITY: usize = 4;

/// A `FrameSource` backed by an `ffmpeg` subprocess, decoding the restream
/// URL to raw grayscale frames on a background thread.
///
/// The capture transport itself isn't one of the spec's named external
/// collaborators (only the CV kernel parameters are), so this reads real
/// bytes off `ffmpeg`'s stdout rather than stubbing frames out; the decode
/// pipeline mirrors the Evidence Runner's `run_ffmpeg` subprocess pattern,
/// just driven from a dedicated OS thread instead of `tokio::process`
/// because `MotionWorker::tick` reads frames synchronously on its own clock.
pub struct FfmpegFrameSource {
    rx: Receiver<Frame>,
    child: Child,
}

impl FfmpegFrameSource {
    pub fn spawn(addr: &str) -> anyhow::Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-loglevel",
                "error",
                "-rtsp_transport",
                "tcp",
                "-i",
                addr,
                "-f",
                "rawvideo",
                "-pix_fmt",
                "gray",
                "-vf",
                &format!("scale={CAPTURE_WIDTH}:{CAPTURE_HEIGHT}"),
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg capture: no stdout pipe"))?;

        let (tx, rx): (SyncSender<Frame>, Receiver<Frame>) = sync_channel(CHANNEL_CAPACITY);
        thread::spawn(move || read_frames(stdout, tx));

        Ok(Self { rx, child })
    }
}

impl FrameSource for FfmpegFrameSource {
    fn read_frame(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!("ffmpeg capture: failed to kill child on drop: {e}");
        }
    }
}

fn read_frames(mut stdout: impl Read, tx: SyncSender<Frame>) {
    let frame_len = (CAPTURE_WIDTH * CAPTURE_HEIGHT) as usize;
    let mut buf = vec![0u8; frame_len];
    loop {
        if let Err(e) = stdout.read_exact(&mut buf) {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                error!("ffmpeg capture: read failed: {e}");
            }
            return;
        }

        let frame = Frame {
            data: buf.clone(),
            width: CAPTURE_WIDTH,
            height: CAPTURE_HEIGHT,
        };
        if tx.send(frame).is_err() {
            return;
        }
    }
}
