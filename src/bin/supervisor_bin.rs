use anyhow::Result;
use camera_hub::bus::{Bus, Verdict};
use camera_hub::config::load_config;
use camera_hub::dto::{CameraPairedEvent, CameraUnpairedEvent};
use camera_hub::supervisor::{CtrlEvent, Supervisor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Incoming bus events, normalized for the single sequential reconciler loop
/// below so a pair and an unpair for the same camera can never race.
enum Incoming {
    Paired(CameraPairedEvent),
    Unpaired(CameraUnpairedEvent),
}

/// The supervisor process: one per deployment, owns every motion-detector
/// child. Consumes `supervisor.pair`/`supervisor.unpair` off the bus and
/// reconciles them against the revision each camera was last registered at.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config(None)?;
    let bus = Arc::new(Bus::new(&config.bus, "camera-hub.dlx").await?);

    let (supervisor, mut exit_rx) = Supervisor::new(config.supervisor.max_procs);
    let supervisor = Arc::new(supervisor);
    let ctrl_tx = supervisor.handle();

    let run_supervisor = supervisor.clone();
    tokio::spawn(async move { run_supervisor.run().await });

    tokio::spawn(async move {
        while let Some(exit) = exit_rx.recv().await {
            warn!(uuid = %exit.uuid, pid = exit.pid, status = exit.status, err = ?exit.err, "motion detector exited");
        }
    });

    let (incoming_tx, mut incoming_rx) = mpsc::channel::<Incoming>(64);

    spawn_queue_reader(
        bus.clone(),
        config.bus.pair_key.clone(),
        "supervisor-pair",
        |body| {
            let event: CameraPairedEvent = serde_json::from_slice(&body)?;
            Ok(Incoming::Paired(event))
        },
        incoming_tx.clone(),
    );

    spawn_queue_reader(
        bus.clone(),
        config.bus.unpair_key.clone(),
        "supervisor-unpair",
        |body| {
            let event: CameraUnpairedEvent = serde_json::from_slice(&body)?;
            Ok(Incoming::Unpaired(event))
        },
        incoming_tx,
    );

    let motion_detector_path = motion_detector_path()?;
    let mut revisions: HashMap<String, i64> = HashMap::new();

    info!("supervisor ready");
    while let Some(event) = incoming_rx.recv().await {
        match event {
            Incoming::Paired(paired) => {
                let uuid = paired.uuid.to_string();
                let stored = revisions.get(&uuid).copied();
                let args = vec![
                    motion_detector_path.clone(),
                    "-addr".to_string(),
                    paired.url.clone(),
                ];

                let should_register = match stored {
                    None => true,
                    Some(s) if paired.revision > s => {
                        let _ = ctrl_tx.send(CtrlEvent::Unregister { uuid: uuid.clone() }).await;
                        true
                    }
                    Some(s) if paired.revision == s => supervisor.revision(&uuid).await.is_none(),
                    _ => {
                        info!(uuid, revision = paired.revision, stored, "ignoring stale pair event");
                        false
                    }
                };

                if should_register {
                    revisions.insert(uuid.clone(), paired.revision);
                    let _ = ctrl_tx.send(CtrlEvent::Register { uuid, args }).await;
                }
            }
            Incoming::Unpaired(unpaired) => {
                let uuid = unpaired.uuid.to_string();
                revisions.remove(&uuid);
                let _ = ctrl_tx.send(CtrlEvent::Unregister { uuid }).await;
            }
        }
    }

    Ok(())
}

/// Resolves the `motion-detector` binary alongside this one, so the
/// supervisor doesn't depend on `$PATH` to spawn its children.
fn motion_detector_path() -> Result<String> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("supervisor: could not resolve own executable directory"))?;
    Ok(dir.join("motion-detector").to_string_lossy().into_owned())
}

/// Spawns a task that declares/binds `queue` to the default exchange,
/// consumes it forever, parses each delivery with `parse`, and forwards the
/// result onto `tx`. Malformed bodies are nacked and discarded; the
/// reconciler loop never sees them.
fn spawn_queue_reader<F>(bus: Arc<Bus>, queue: String, tag: &'static str, parse: F, tx: mpsc::Sender<Incoming>)
where
    F: Fn(Vec<u8>) -> Result<Incoming> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = bus.declare_queue(&queue).await {
            warn!("supervisor: declare queue {queue} failed: {e}");
            return;
        }
        if let Err(e) = bus.bind(&queue, "", &queue).await {
            warn!("supervisor: bind queue {queue} failed: {e}");
            return;
        }
        let mut consumer = match bus.consume(&queue, tag).await {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!("supervisor: consume {queue} failed: {e}");
                return;
            }
        };

        while let Some(delivery) = consumer.next().await {
            match parse(delivery.body.clone()) {
                Ok(event) => {
                    let _ = delivery.finish(Verdict::Ack).await;
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("supervisor: malformed message on {queue}: {e}");
                    let _ = delivery.finish(Verdict::NackDiscard).await;
                }
            }
        }
    });
}
