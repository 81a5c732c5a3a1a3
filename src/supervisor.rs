use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// What happened when a child process exited (or failed to start).
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub uuid: String,
    pub pid: i32,
    pub status: i32,
    pub err: Option<String>,
}

#[derive(Debug)]
pub enum CtrlEvent {
    Register { uuid: String, args: Vec<String> },
    Unregister { uuid: String },
    Shutdown,
}

struct Proc {
    args: Vec<String>,
    pid: i32,
    version: u64,
}

/// Owns per-camera motion-detector child processes.
///
/// Grounded on the original's `Supervisor`/`Proc` (a mutex-guarded map, a
/// control-event select loop, a waiter task that races re-registration),
/// upgraded to signal the whole process group rather than the leader pid —
/// the stronger guarantee the design notes call for, since `SIGTERM`ing a
/// single pid can leave orphaned grandchildren of the detector binary alive.
pub struct Supervisor {
    procs: Arc<Mutex<HashMap<String, Proc>>>,
    ctrl_tx: mpsc::Sender<CtrlEvent>,
    ctrl_rx: Mutex<Option<mpsc::Receiver<CtrlEvent>>>,
    exit_tx: mpsc::Sender<ExitEvent>,
}

impl Supervisor {
    pub fn new(max_procs: usize) -> (Self, mpsc::Receiver<ExitEvent>) {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(max_procs.max(1));
        let (exit_tx, exit_rx) = mpsc::channel(max_procs.max(1));
        (
            Self {
                procs: Arc::new(Mutex::new(HashMap::new())),
                ctrl_tx,
                ctrl_rx: Mutex::new(Some(ctrl_rx)),
                exit_tx,
            },
            exit_rx,
        )
    }

    pub fn handle(&self) -> mpsc::Sender<CtrlEvent> {
        self.ctrl_tx.clone()
    }

    /// Runs the control loop until a `Shutdown` event or the control channel
    /// closes. Must be spawned as its own task.
    pub async fn run(&self) {
        let mut ctrl_rx = self
            .ctrl_rx
            .lock()
            .await
            .take()
            .expect("Supervisor::run called more than once");

        while let Some(event) = ctrl_rx.recv().await {
            match event {
                CtrlEvent::Register { uuid, args } => self.register(uuid, args).await,
                CtrlEvent::Unregister { uuid } => self.unregister(uuid).await,
                CtrlEvent::Shutdown => {
                    info!("supervisor shutting down");
                    self.shutdown_all().await;
                    break;
                }
            }
        }
    }

    async fn register(&self, uuid: String, args: Vec<String>) {
        {
            let procs = self.procs.lock().await;
            if procs.contains_key(&uuid) {
                info!(uuid, "register: process already running");
                return;
            }
        }

        let mut command = tokio::process::Command::new(&args[0]);
        command.args(&args[1..]);
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(uuid, "register: spawn failed: {e}");
                let _ = self
                    .exit_tx
                    .send(ExitEvent {
                        uuid,
                        pid: -1,
                        status: -1,
                        err: Some(e.to_string()),
                    })
                    .await;
                return;
            }
        };

        let pid = child.id().unwrap_or(0) as i32;
        self.procs.lock().await.insert(
            uuid.clone(),
            Proc {
                args,
                pid,
                version: 1,
            },
        );

        self.spawn_waiter(uuid, pid, child);
    }

    fn spawn_waiter(&self, uuid: String, pid: i32, mut child: Child) {
        let procs = self.procs.clone();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let result = child.wait().await;
            let (status, err) = match result {
                Ok(status) => (status.code().unwrap_or(-1), None),
                Err(e) => (-1, Some(e.to_string())),
            };

            let _ = exit_tx
                .send(ExitEvent {
                    uuid: uuid.clone(),
                    pid,
                    status,
                    err,
                })
                .await;

            let mut procs = procs.lock().await;
            if let Some(current) = procs.get(&uuid) {
                if current.pid == pid {
                    procs.remove(&uuid);
                }
            }
        });
    }

    async fn unregister(&self, uuid: String) {
        let pid = {
            let procs = self.procs.lock().await;
            match procs.get(&uuid) {
                Some(p) => p.pid,
                None => {
                    error!(uuid, "unregister: process not found");
                    return;
                }
            }
        };

        let sigterm_sent = signal_process_group(pid, libc::SIGTERM);
        self.procs.lock().await.remove(&uuid);

        if !sigterm_sent {
            warn!(uuid, pid, "unregister: SIGTERM failed, sending SIGKILL immediately");
            signal_process_group(pid, libc::SIGKILL);
            return;
        }

        let uuid_for_grace = uuid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if process_group_alive(pid) {
                warn!(uuid = %uuid_for_grace, pid, "unregister: still alive after grace period, sending SIGKILL");
                signal_process_group(pid, libc::SIGKILL);
            }
        });
    }

    async fn shutdown_all(&self) {
        let uuids: Vec<String> = self.procs.lock().await.keys().cloned().collect();
        for uuid in uuids {
            self.unregister(uuid).await;
        }
    }

    pub async fn revision(&self, uuid: &str) -> Option<u64> {
        self.procs.lock().await.get(uuid).map(|p| p.version)
    }
}

/// Sends `sig` to the whole process group. Returns whether the kill
/// succeeded, so callers can escalate immediately on failure instead of
/// waiting out a grace period for a signal that never landed.
fn signal_process_group(pid: i32, sig: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Negative pid targets the whole process group created by `setsid`.
    let ret = unsafe { libc::kill(-pid, sig) };
    if ret != 0 {
        warn!(pid, sig, "signal_process_group: kill failed: {}", std::io::Error::last_os_error());
        return false;
    }
    true
}

fn process_group_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(-pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_a_noop_if_already_tracked() {
        let (supervisor, _exit_rx) = Supervisor::new(4);
        supervisor
            .procs
            .lock()
            .await
            .insert("cam-1".to_string(), Proc { args: vec![], pid: 1234, version: 1 });

        supervisor.register("cam-1".to_string(), vec!["/bin/true".to_string()]).await;

        let procs = supervisor.procs.lock().await;
        assert_eq!(procs.get("cam-1").unwrap().pid, 1234);
    }

    #[tokio::test]
    async fn unregister_unknown_uuid_does_not_panic() {
        let (supervisor, _exit_rx) = Supervisor::new(4);
        supervisor.unregister("nonexistent".to_string()).await;
    }

    #[test]
    fn signaling_a_nonpositive_pid_is_a_noop() {
        signal_process_group(0, libc::SIGTERM);
        signal_process_group(-1, libc::SIGTERM);
    }
}
