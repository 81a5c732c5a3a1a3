use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use image::imageops::FilterType;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{Bus, Verdict};
use crate::config::{InferenceConfig, ObjectStoreConfig};
use crate::dto::{AnalyzeImgsEvent, Evidence};
use crate::inference::InferenceClient;
use crate::object_store::ObjectStore;
use crate::registry::models::NewRecording;
use crate::registry::Registry;
use crate::Error;

const ANALYZE_QUEUE: &str = "motion.analyze";
const DETECTIONS_KEY: &str = "motion.detections";
const MAX_CONCURRENT_ANALYSIS: usize = 16;

const BATCH: usize = 4;
const CHANNELS: usize = 3;
const FRAME_H: u32 = 320;
const FRAME_W: u32 = 544;
const ROWS_PER_IMAGE: usize = 200;
const COLS: usize = 7;
const PROMOTION_THRESHOLD: f64 = 0.5;

/// Consumes `AnalyzeImgsEvent`s, runs person-detection inference over the
/// evidence frames, and relocates + records the verdict.
///
/// Grounded on the original analyzer worker: one `Predict` RPC per event
/// against an OVMS-style tensor contract, a fixed `[4,1,200,7]` output shape,
/// and a single confidence threshold deciding promotion.
pub struct FrameAnalyzer {
    object_store: Arc<ObjectStore>,
    registry: Arc<Registry>,
    bus: Arc<Bus>,
    grpc_addr: String,
    staging_key: String,
    detections_key: String,
    false_positives_key: String,
    detections_days: i32,
    false_positives_days: i32,
    semaphore: Arc<Semaphore>,
}

impl FrameAnalyzer {
    pub fn new(
        object_store: Arc<ObjectStore>,
        registry: Arc<Registry>,
        bus: Arc<Bus>,
        object_store_config: &ObjectStoreConfig,
        inference_config: &InferenceConfig,
    ) -> Self {
        Self {
            object_store,
            registry,
            bus,
            grpc_addr: inference_config.grpc_addr.clone(),
            staging_key: object_store_config.staging_key.clone(),
            detections_key: object_store_config.detections_key.clone(),
            false_positives_key: object_store_config.false_positives_key.clone(),
            detections_days: object_store_config.detections_days,
            false_positives_days: object_store_config.false_positives_days,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_ANALYSIS)),
        }
    }

    /// Consumes `motion.analyze` until the queue closes, bounding in-flight
    /// events at `maxConcurrentAnalysis` via the owned semaphore permit.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.bus.declare_queue(ANALYZE_QUEUE).await?;
        self.bus.bind(ANALYZE_QUEUE, "", ANALYZE_QUEUE).await?;
        let mut consumer = self.bus.consume(ANALYZE_QUEUE, "frame-analyzer").await?;

        while let Some(delivery) = consumer.next().await {
            let event: AnalyzeImgsEvent = match serde_json::from_slice(&delivery.body) {
                Ok(event) => event,
                Err(e) => {
                    warn!("frame analyzer: malformed event, discarding: {e}");
                    delivery.finish(Verdict::NackDiscard).await?;
                    continue;
                }
            };

            let permit = self.semaphore.clone().acquire_owned().await.map_err(|e| {
                Error::Service(format!("frame analyzer: semaphore closed: {e}"))
            })?;

            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let uuid = event.uuid;
                let tp = event.tp.clone();
                let verdict = match this.process(event).await {
                    Ok(()) => Verdict::Ack,
                    Err(e) => {
                        warn!(%uuid, tp, "frame analyzer: event failed: {e}");
                        Verdict::NackDiscard
                    }
                };
                if let Err(e) = delivery.finish(verdict).await {
                    error!(%uuid, tp, "frame analyzer: ack/nack failed: {e}");
                }
            });
        }

        info!("frame analyzer: queue closed");
        Ok(())
    }

    async fn process(&self, event: AnalyzeImgsEvent) -> Result<()> {
        if event.frame_paths.len() != BATCH {
            return Err(Error::Permanent(format!(
                "analyze event for {} carries {} frames, expected {BATCH}",
                event.uuid,
                event.frame_paths.len()
            ))
            .into());
        }

        let batch = self.fetch_and_decode_batch(&event.frame_paths).await?;

        let mut inference = InferenceClient::connect(&self.grpc_addr).await?;
        let shape = [BATCH as i64, CHANNELS as i64, FRAME_H as i64, FRAME_W as i64];
        let output = inference.predict(batch, shape).await?;

        let (image_index, confidence, evidence) = extract_best_detection(&output)?;

        let (dest_key, retention_days) = if confidence >= PROMOTION_THRESHOLD {
            (&self.detections_key, self.detections_days)
        } else {
            (&self.false_positives_key, self.false_positives_days)
        };

        let best_frame_key = self
            .relocate(&event, image_index, dest_key)
            .await?;

        let (start_ts, end_ts) = timepoint_bounds(&event.tp);

        let new_recording = NewRecording {
            cam_id: event.uuid,
            bucket_name: self.object_store.bucket_name.clone(),
            vid_key: replace_prefix(&event.vid_path, &self.staging_key, dest_key),
            best_frame_key,
            evidence: serde_json::to_value(evidence)
                .map_err(|e| Error::Permanent(format!("encode evidence: {e}")))?,
            score: confidence,
            retention_days,
            start_ts,
            end_ts,
        };

        let stored = self.registry.upsert_recording(&new_recording).await?;

        if confidence >= PROMOTION_THRESHOLD {
            let body = serde_json::to_vec(&stored)
                .map_err(|e| Error::Permanent(format!("encode recording: {e}")))?;
            self.bus
                .publish_with_headers(
                    "",
                    DETECTIONS_KEY,
                    &body,
                    &[("uuid", &event.uuid.to_string())],
                )
                .await?;
        }

        info!(
            uuid = %event.uuid,
            tp = %event.tp,
            score = confidence,
            "frame analyzer: evidence processed"
        );
        Ok(())
    }

    /// Fetches and decodes the four evidence frames in parallel, first error
    /// wins, and packs them into a `[4,3,320,544]` BGR float32 tensor.
    async fn fetch_and_decode_batch(&self, frame_keys: &[String]) -> Result<Vec<f32>> {
        let mut tasks = Vec::with_capacity(frame_keys.len());
        for key in frame_keys {
            let store = self.object_store.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                let bytes = store.get_object(&key).await?;
                decode_bgr_chw(&bytes)
            }));
        }

        let mut batch = vec![0f32; BATCH * CHANNELS * FRAME_H as usize * FRAME_W as usize];
        let slot_len = CHANNELS * FRAME_H as usize * FRAME_W as usize;
        for (n, task) in tasks.into_iter().enumerate() {
            let slot = task
                .await
                .map_err(|e| Error::Service(format!("decode task panicked: {e}")))??;
            batch[n * slot_len..(n + 1) * slot_len].copy_from_slice(&slot);
        }
        Ok(batch)
    }

    /// Copies the video and all four frames from the staging prefix to
    /// `dest_key`, then bulk-deletes the staging directory. Returns the
    /// relocated key of the frame at `image_index`.
    async fn relocate(
        &self,
        event: &AnalyzeImgsEvent,
        image_index: usize,
        dest_key: &str,
    ) -> Result<String> {
        let mut best_frame_key = None;
        for key in std::iter::once(&event.vid_path).chain(event.frame_paths.iter()) {
            let basename = Path::new(key)
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::Permanent(format!("evidence key has no file name: {key}")))?;
            let name = format!("{}/{}/{}", event.uuid, event.tp, basename);
            self.object_store
                .copy_within_bucket(&self.staging_key, dest_key, &name)
                .await?;

            if key == &event.frame_paths[image_index] {
                best_frame_key = Some(format!("{dest_key}/{name}"));
            }
        }

        let staging_dir = format!("{}/{}/{}/", self.staging_key, event.uuid, event.tp);
        self.object_store.remove_objects_with_prefix(&staging_dir).await?;

        best_frame_key.ok_or_else(|| {
            Error::Service(format!(
                "relocate: image index {image_index} out of range for event {}",
                event.uuid
            ))
            .into()
        })
    }
}

fn replace_prefix(key: &str, from_prefix: &str, to_prefix: &str) -> String {
    match key.strip_prefix(&format!("{from_prefix}/")) {
        Some(rest) => format!("{to_prefix}/{rest}"),
        None => key.to_string(),
    }
}

/// Decodes an image, resizes it to the model's input dimensions, and packs
/// it into a planar BGR float32 `[C,H,W]` slice.
fn decode_bgr_chw(bytes: &[u8]) -> Result<Vec<f32>> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| Error::Permanent(format!("decode frame: {e}")))?;
    let resized = decoded.resize_exact(FRAME_W, FRAME_H, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let (w, h) = (FRAME_W as usize, FRAME_H as usize);
    let plane_len = h * w;
    let mut out = vec![0f32; CHANNELS * plane_len];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        let idx = y * w + x;
        out[idx] = b as f32;
        out[plane_len + idx] = g as f32;
        out[2 * plane_len + idx] = r as f32;
    }
    Ok(out)
}

/// Reshapes the flat `[4,1,200,7]` response into rows of 7 floats, finds the
/// highest-confidence row, and derives which of the four source images it
/// belongs to.
fn extract_best_detection(output: &[f32]) -> Result<(usize, f64, Evidence)> {
    let total_rows = BATCH * ROWS_PER_IMAGE;
    if output.len() != total_rows * COLS {
        return Err(Error::Inference(format!(
            "unexpected detection tensor length {}, expected {}",
            output.len(),
            total_rows * COLS
        ))
        .into());
    }

    let mut max_row = 0;
    let mut max_conf = f32::MIN;
    for row in 0..total_rows {
        let conf = output[row * COLS + 2];
        if conf > max_conf {
            max_conf = conf;
            max_row = row;
        }
    }

    let image_index = max_row / ROWS_PER_IMAGE;
    let base = max_row * COLS;
    let evidence = Evidence {
        conf: max_conf as f64,
        x_min: output[base + 3] as f64,
        y_min: output[base + 4] as f64,
        x_max: output[base + 5] as f64,
        y_max: output[base + 6] as f64,
    };
    Ok((image_index, max_conf as f64, evidence))
}

/// Parses a recording's timepoint (the same `%Y-%m-%d_%H-%M-%S-%6f` key used
/// for segment and evidence filenames) into start/end bounds. The analyzer
/// has no independent notion of clip duration, so both bounds collapse to
/// the timepoint itself.
fn timepoint_bounds(tp: &str) -> (DateTime<Utc>, DateTime<Utc>) {
    match NaiveDateTime::parse_from_str(tp, "%Y-%m-%d_%H-%M-%S-%6f") {
        Ok(naive) => {
            let at = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
            (at, at)
        }
        Err(_) => {
            let now = Utc::now();
            (now, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_best_detection_finds_the_max_confidence_row() {
        let mut output = vec![0f32; BATCH * ROWS_PER_IMAGE * COLS];
        let row = ROWS_PER_IMAGE + 5;
        output[row * COLS + 2] = 0.87;
        output[row * COLS + 3] = 0.1;
        output[row * COLS + 4] = 0.2;
        output[row * COLS + 5] = 0.3;
        output[row * COLS + 6] = 0.4;

        let (image_index, confidence, evidence) = extract_best_detection(&output).unwrap();
        assert_eq!(image_index, 1);
        assert!((confidence - 0.87).abs() < 1e-6);
        assert!((evidence.x_min - 0.1).abs() < 1e-6);
        assert!((evidence.y_max - 0.4).abs() < 1e-6);
    }

    #[test]
    fn extract_best_detection_rejects_wrong_shape() {
        let output = vec![0f32; 10];
        assert!(extract_best_detection(&output).is_err());
    }

    #[test]
    fn replace_prefix_swaps_the_leading_segment() {
        assert_eq!(
            replace_prefix("staging/abc/tp/clip.mp4", "staging", "detections"),
            "detections/abc/tp/clip.mp4"
        );
        assert_eq!(replace_prefix("other/x", "staging", "detections"), "other/x");
    }

    #[test]
    fn timepoint_bounds_parses_the_segment_key_format() {
        let (start, end) = timepoint_bounds("2026-07-30_12-00-01-500000");
        assert_eq!(start, end);
        assert_eq!(start.format("%Y-%m-%d").to_string(), "2026-07-30");
    }
}
