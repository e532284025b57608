//! Owns one child process: starts it in its own process group, restarts it
//! with exponential backoff on fast crashes, and gives up after too many.
//!
//! Backoff policy is grounded in the same "retry transient, give up on
//! permanent" shape as an upstream SOAP retry helper, adapted here to
//! process lifetimes instead of request attempts: a crash within
//! `fast_fail_secs` doubles the backoff and counts toward `max_fails`; an
//! exit after `fast_fail_secs` (or more than 30s of uptime) resets both.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::runtime::TaskSpawner;

const UPTIME_RESET_SECS: u64 = 30;

/// A child process, restarted with backoff when it dies quickly and
/// stopped gracefully (group SIGTERM, then SIGKILL) on request.
pub struct Supervisor {
    binary: String,
    args: Vec<String>,
    fast_fail: Duration,
    max_fails: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    stop_token: CancellationToken,
    running: AtomicBool,
    fail_count: AtomicU32,
    backoff_ms: AtomicU64,
    permanently_failed: AtomicBool,
    child_pid: std::sync::Mutex<Option<u32>>,
    stopped_notify: Arc<Notify>,
}

impl Supervisor {
    pub fn new(binary: impl Into<String>, args: Vec<String>, config: &Config) -> Self {
        Self {
            binary: binary.into(),
            args,
            fast_fail: Duration::from_secs(config.supervisor_fast_fail_secs),
            max_fails: config.supervisor_max_fails,
            initial_backoff: Duration::from_millis(config.supervisor_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.supervisor_max_backoff_ms),
            stop_token: CancellationToken::new(),
            running: AtomicBool::new(false),
            fail_count: AtomicU32::new(0),
            backoff_ms: AtomicU64::new(0),
            permanently_failed: AtomicBool::new(false),
            child_pid: std::sync::Mutex::new(None),
            stopped_notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_permanently_failed(&self) -> bool {
        self.permanently_failed.load(Ordering::SeqCst)
    }

    /// Starts the supervise loop, if not already running. Idempotent.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permanently_failed.store(false, Ordering::SeqCst);
        let me = Arc::clone(self);
        spawner.spawn(Box::pin(async move {
            me.supervise_loop().await;
        }));
    }

    /// Requests a graceful stop and waits for the loop to exit.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.stop_token.cancel();
        self.stopped_notify.notified().await;
    }

    async fn supervise_loop(&self) {
        loop {
            if self.stop_token.is_cancelled() {
                break;
            }

            let spawn_result = self.spawn_child().await;
            let mut child = match spawn_result {
                Ok(child) => child,
                Err(err) if is_binary_missing(&err) => {
                    log::error!("[Supervisor] {} not found, giving up permanently", self.binary);
                    self.permanently_failed.store(true, Ordering::SeqCst);
                    break;
                }
                Err(err) => {
                    log::error!("[Supervisor] failed to spawn {}: {}", self.binary, err);
                    if self.register_fast_fail() {
                        break;
                    }
                    tokio::time::sleep(self.current_backoff()).await;
                    continue;
                }
            };

            *self.child_pid.lock().unwrap() = child.id();
            let started = Instant::now();

            tokio::select! {
                _ = self.stop_token.cancelled() => {
                    self.terminate_group(&mut child).await;
                    break;
                }
                status = child.wait() => {
                    let elapsed = started.elapsed();
                    log::warn!("[Supervisor] {} exited after {:?}: {:?}", self.binary, elapsed, status);
                    if elapsed >= Duration::from_secs(UPTIME_RESET_SECS) {
                        self.fail_count.store(0, Ordering::SeqCst);
                        self.backoff_ms.store(self.initial_backoff.as_millis() as u64, Ordering::SeqCst);
                    } else if elapsed < self.fast_fail && self.register_fast_fail() {
                        break;
                    }
                    tokio::time::sleep(self.current_backoff()).await;
                }
            }
        }

        *self.child_pid.lock().unwrap() = None;
        self.running.store(false, Ordering::SeqCst);
        self.stopped_notify.notify_waiters();
    }

    async fn spawn_child(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd.spawn()
    }

    /// Increments the fail count for a fast failure; returns true if the
    /// supervisor has now hit `max_fails` and should stop retrying.
    fn register_fast_fail(&self) -> bool {
        let count = self.fail_count.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.backoff_ms.load(Ordering::SeqCst).max(self.initial_backoff.as_millis() as u64);
        let doubled = (current * 2).min(self.max_backoff.as_millis() as u64);
        self.backoff_ms.store(doubled, Ordering::SeqCst);
        if count >= self.max_fails {
            log::error!("[Supervisor] {} failed {} times, giving up", self.binary, count);
            self.permanently_failed.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn current_backoff(&self) -> Duration {
        let ms = self.backoff_ms.load(Ordering::SeqCst);
        if ms == 0 {
            self.initial_backoff
        } else {
            Duration::from_millis(ms)
        }
    }

    async fn terminate_group(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
            }
        }

        let grace = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
        if grace.is_err() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
                }
            }
            let _ = child.wait().await;
        }
    }
}

fn is_binary_missing(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioSpawner;

    #[tokio::test]
    async fn missing_binary_sets_permanent_failure() {
        let config = Config::default();
        let sup = Arc::new(Supervisor::new("definitely-not-a-real-binary", vec![], &config));
        sup.start(&TokioSpawner::current());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sup.has_permanently_failed());
    }

    #[tokio::test]
    async fn stop_on_not_yet_started_returns_immediately() {
        let config = Config::default();
        let sup = Supervisor::new("true", vec![], &config);
        sup.stop().await;
    }
}
