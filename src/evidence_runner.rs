use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::dto::AnalyzeImgsEvent;
use crate::motion::MotionJob;
use crate::object_store::{evidence_key, ObjectStore};
use crate::Error;

const MAX_CONCURRENT_JOBS: usize = 8;
const NEIGHBOR_WAIT_DEADLINE: Duration = Duration::from_secs(30);
const NEIGHBOR_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STABILITY_WAIT_DEADLINE: Duration = Duration::from_secs(5);
const STABILITY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const ANALYZE_QUEUE: &str = "motion.analyze";

/// Assembles evidence clips from on-disk segments and dispatches them for
/// analysis.
///
/// Grounded on the original's `Runner` (a semaphore-bounded job queue feeding
/// `process`): neighbor-segment lookup by binary search on the lexical
/// timestamp key, ffmpeg concat + frame extraction, parallel upload, and a
/// publish onto the analyze queue.
pub struct EvidenceRunner {
    recordings_dir: PathBuf,
    object_store: Arc<ObjectStore>,
    bus: Arc<Bus>,
    staging_prefix: String,
    semaphore: Arc<Semaphore>,
}

impl EvidenceRunner {
    pub fn new(
        recordings_dir: impl Into<PathBuf>,
        object_store: Arc<ObjectStore>,
        bus: Arc<Bus>,
        staging_prefix: impl Into<String>,
    ) -> Self {
        Self {
            recordings_dir: recordings_dir.into(),
            object_store,
            bus,
            staging_prefix: staging_prefix.into(),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)),
        }
    }

    /// Acquires a slot and runs `process`, logging (not propagating) any
    /// failure — the next motion event supersedes a dropped job.
    pub async fn post_job(self: &Arc<Self>, job: MotionJob) {
        let permit = self.semaphore.clone().acquire_owned().await;
        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let this = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let uuid = job.uuid.clone();
            let tp = job.time_point.clone();
            if let Err(e) = this.process(job).await {
                warn!(uuid, tp, "evidence runner: job failed: {e}");
            }
        });
    }

    async fn process(&self, job: MotionJob) -> Result<()> {
        let cam_dir = self.recordings_dir.join(&job.uuid);
        let neighbors = wait_for_neighbors(&cam_dir, &job.time_point).await?;
        wait_for_stability(&neighbors[neighbors.len() - 1]).await?;

        let concat_path = cam_dir.join(format!("motion_{}_{}.mp4", job.uuid, job.time_point));
        concat_segments(&neighbors, &concat_path).await?;

        let mid = &neighbors[neighbors.len() / 2];
        let frame_stem = format!("motion_frame_{}_{}", job.uuid, job.time_point);
        let frame_paths = extract_frames(mid, &cam_dir, &frame_stem).await?;

        let upload_result = self.upload_evidence(&job, &concat_path, &frame_paths).await;

        let mut to_delete = frame_paths.clone();
        to_delete.push(concat_path.clone());
        delete_local_files(&to_delete).await;

        let (vid_key, frame_keys) = upload_result?;

        let event = AnalyzeImgsEvent {
            uuid: job.uuid.parse().map_err(|e| {
                Error::Permanent(format!("job uuid {} is not a valid uuid: {e}", job.uuid))
            })?,
            tp: job.time_point.clone(),
            vid_path: vid_key,
            frame_paths: frame_keys,
        };
        let body = serde_json::to_vec(&event)
            .map_err(|e| Error::Permanent(format!("encode analyze event: {e}")))?;
        self.bus.publish("", ANALYZE_QUEUE, &body).await?;

        info!(uuid = %job.uuid, tp = %job.time_point, "evidence runner: job published");
        Ok(())
    }

    /// Uploads the clip and all extracted frames to the staging prefix, in
    /// parallel, first-error wins.
    async fn upload_evidence(
        &self,
        job: &MotionJob,
        video: &Path,
        frames: &[PathBuf],
    ) -> Result<(String, Vec<String>)> {
        let uuid: uuid::Uuid = job.uuid.parse().map_err(|e| {
            Error::Permanent(format!("job uuid {} is not a valid uuid: {e}", job.uuid))
        })?;

        let video_key = evidence_key(
            &self.staging_prefix,
            &uuid,
            &job.time_point,
            video.file_name().and_then(|n| n.to_str()).unwrap_or("clip.mp4"),
        );

        let mut uploads = Vec::new();
        {
            let store = self.object_store.clone();
            let key = video_key.clone();
            let path = video.to_path_buf();
            uploads.push(tokio::spawn(async move {
                let body = tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::Io(format!("read {path:?}: {e}")))?;
                store.put_object(&key, body).await
            }));
        }

        let mut frame_keys = Vec::with_capacity(frames.len());
        for frame in frames {
            let key = evidence_key(
                &self.staging_prefix,
                &uuid,
                &job.time_point,
                frame.file_name().and_then(|n| n.to_str()).unwrap_or("frame.png"),
            );
            frame_keys.push(key.clone());

            let store = self.object_store.clone();
            let path = frame.to_path_buf();
            uploads.push(tokio::spawn(async move {
                let body = tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::Io(format!("read {path:?}: {e}")))?;
                store.put_object(&key, body).await
            }));
        }

        for result in futures::future::join_all(uploads).await {
            result.map_err(|e| Error::Permanent(format!("upload task panicked: {e}")))??;
        }

        Ok((video_key, frame_keys))
    }
}

/// Computes the lexical sort key a segment filename's leading timestamp
/// collapses to: `YYYY-MM-DD_HH-MM-SS-µµµµµµ`.
fn segment_key(time_point: &str) -> String {
    time_point.to_string()
}

/// Lists `dir` sorted lexically, binary-searches for `time_point`, and
/// returns the `[idx-1, idx, idx+1]` window (clamped to bounds — fewer than
/// three entries near either edge of the listing), retrying every 200 ms
/// until at least three files exist in the directory or the 30 s deadline
/// expires.
async fn wait_for_neighbors(dir: &Path, time_point: &str) -> Result<Vec<PathBuf>> {
    let key = segment_key(time_point);
    let deadline = Instant::now() + NEIGHBOR_WAIT_DEADLINE;

    loop {
        let mut names = list_segment_files(dir).await?;
        names.sort();

        if names.len() >= 3 {
            let idx = match names.binary_search(&key) {
                Ok(i) => i,
                Err(i) => i,
            };
            let lo = idx.saturating_sub(1);
            let hi = (idx + 1).min(names.len() - 1);
            return Ok(names[lo..=hi].iter().map(|n| dir.join(n)).collect());
        }

        if Instant::now() >= deadline {
            return Err(Error::Permanent(format!(
                "timed out locating segment neighbors for {time_point} in {dir:?}"
            ))
            .into());
        }
        tokio::time::sleep(NEIGHBOR_POLL_INTERVAL).await;
    }
}

async fn list_segment_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(format!("read_dir {dir:?}: {e}")).into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Io(format!("read_dir entry {dir:?}: {e}")))?
    {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Waits up to 5 s for `path` to stop changing size across two 200-ms
/// samples, meaning the restreamer has finished writing it.
async fn wait_for_stability(path: &Path) -> Result<()> {
    let deadline = Instant::now() + STABILITY_WAIT_DEADLINE;
    loop {
        let first = file_size(path).await?;
        tokio::time::sleep(STABILITY_POLL_INTERVAL).await;
        let second = file_size(path).await?;

        if first > 0 && first == second {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Permanent(format!("{path:?} did not stabilize within 5s")).into());
        }
    }
}

async fn file_size(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(Error::Io(format!("stat {path:?}: {e}")).into()),
    }
}

/// Concatenates `segments` into `dest` via ffmpeg's concat demuxer. The list
/// file is scoped to this job and removed once ffmpeg exits.
async fn concat_segments(segments: &[PathBuf], dest: &Path) -> Result<()> {
    let list_path = dest.with_extension("list.txt");
    let list_body: String = segments
        .iter()
        .map(|p| format!("file '{}'\n", p.display()))
        .collect();
    tokio::fs::write(&list_path, list_body)
        .await
        .map_err(|e| Error::Io(format!("write concat list {list_path:?}: {e}")))?;

    let result = run_ffmpeg(&[
        "-y",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
        list_path.to_str().unwrap_or_default(),
        "-c",
        "copy",
        dest.to_str().unwrap_or_default(),
    ])
    .await;

    let _ = tokio::fs::remove_file(&list_path).await;
    result
}

/// Extracts four 1-fps frames from `source` into `dir`, returning their paths
/// in `%04d` order.
async fn extract_frames(source: &Path, dir: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    let pattern = dir.join(format!("{stem}_%04d.png"));
    run_ffmpeg(&[
        "-y",
        "-i",
        source.to_str().unwrap_or_default(),
        "-r",
        "1",
        "-vframes",
        "4",
        pattern.to_str().unwrap_or_default(),
    ])
    .await?;

    Ok((1..=4)
        .map(|i| dir.join(format!("{stem}_{i:04}.png")))
        .collect())
}

async fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new("ffmpeg")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Permanent(format!("spawn ffmpeg: {e}")))?;

    if !output.status.success() {
        return Err(Error::Permanent(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ))
        .into());
    }
    debug!("ffmpeg {:?} ok", args);
    Ok(())
}

/// Deletes every local file in `paths`, in parallel, logging but not
/// propagating individual failures (an upload that already succeeded must
/// not be undone by a cleanup error).
async fn delete_local_files(paths: &[PathBuf]) {
    let tasks: Vec<_> = paths
        .iter()
        .cloned()
        .map(|path| {
            tokio::spawn(async move {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(?path, "evidence runner: failed to delete local file: {e}");
                    }
                }
            })
        })
        .collect();
    let _ = futures::future::join_all(tasks).await;
}

/// Stamps the current UTC timestamp in the evidence filename format, for
/// callers assembling synthetic `MotionJob`s (tests, tooling).
pub fn now_timepoint() -> String {
    Utc::now().format("%Y-%m-%d_%H-%M-%S-%6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_free_helpers::*;

    /// A tiny stand-in for `tempfile` (not a corpus dependency): creates and
    /// removes a scratch directory under the OS temp dir.
    mod tempfile_free_helpers {
        use std::path::PathBuf;

        pub struct ScratchDir(pub PathBuf);

        impl ScratchDir {
            pub fn new(name: &str) -> Self {
                let path = std::env::temp_dir().join(format!("camera-hub-test-{name}-{}", std::process::id()));
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }
        }

        impl Drop for ScratchDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn segment_key_is_identity_on_already_formatted_timepoints() {
        assert_eq!(
            segment_key("2026-07-30_12-00-00-000000"),
            "2026-07-30_12-00-00-000000"
        );
    }

    #[tokio::test]
    async fn wait_for_neighbors_finds_the_window_around_an_exact_match() {
        let dir = ScratchDir::new("neighbors-exact");
        for name in [
            "2026-07-30_11-59-58-000000",
            "2026-07-30_11-59-59-000000",
            "2026-07-30_12-00-00-000000",
            "2026-07-30_12-00-01-000000",
        ] {
            std::fs::write(dir.0.join(name), b"x").unwrap();
        }

        let window = wait_for_neighbors(&dir.0, "2026-07-30_12-00-00-000000")
            .await
            .unwrap();
        assert_eq!(window.len(), 3);
        assert!(window[1].ends_with("2026-07-30_12-00-00-000000"));
    }

    #[tokio::test]
    async fn wait_for_neighbors_times_out_with_too_few_files() {
        let dir = ScratchDir::new("neighbors-sparse");
        std::fs::write(dir.0.join("2026-07-30_12-00-00-000000"), b"x").unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_neighbors_with_deadline(&dir.0, "2026-07-30_12-00-00-000000", Duration::from_millis(300)),
        )
        .await;
        assert!(result.unwrap().is_err());
    }

    /// Test-only variant of `wait_for_neighbors` with an injectable deadline,
    /// so the timeout test doesn't have to wait the real 30 s.
    async fn wait_for_neighbors_with_deadline(
        dir: &Path,
        time_point: &str,
        deadline: Duration,
    ) -> Result<Vec<PathBuf>> {
        let key = segment_key(time_point);
        let until = Instant::now() + deadline;
        loop {
            let mut names = list_segment_files(dir).await?;
            names.sort();
            if names.len() >= 3 {
                let idx = match names.binary_search(&key) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                let lo = idx.saturating_sub(1);
                let hi = (idx + 1).min(names.len() - 1);
                return Ok(names[lo..=hi].iter().map(|n| dir.join(n)).collect());
            }
            if Instant::now() >= until {
                return Err(Error::Permanent("timed out".to_string()).into());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn wait_for_stability_accepts_an_unchanging_nonempty_file() {
        let dir = ScratchDir::new("stability");
        let path = dir.0.join("seg.mp4");
        std::fs::write(&path, b"some bytes").unwrap();

        wait_for_stability(&path).await.unwrap();
    }

    #[tokio::test]
    async fn list_segment_files_returns_empty_for_a_missing_directory() {
        let names = list_segment_files(Path::new("/nonexistent/camera-hub-dir"))
            .await
            .unwrap();
        assert!(names.is_empty());
    }
}
