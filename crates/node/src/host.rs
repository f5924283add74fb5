//! Process supervision: turns signals or service-controller requests into one
//! shutdown request shared by every task.

use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use ledgerd_chainstate::CancelToken;
use tokio::sync::watch;

use crate::config::HostMode;

/// Fans a stop request out to the engine's cancellation token and to async
/// waiters.
pub struct Shutdown {
    cancel: CancelToken,
    notify: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new(cancel: CancelToken) -> (Self, watch::Receiver<bool>) {
        let (notify, receiver) = watch::channel(false);
        (Self { cancel, notify }, receiver)
    }

    pub fn request(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        ledgerd_log::log_info!("Shutdown requested: {reason}");
        self.cancel.cancel();
        let _ = self.notify.send(true);
    }

    pub fn is_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Waits until a stop has been requested.
pub async fn wait_for_shutdown(mut receiver: watch::Receiver<bool>) {
    while !*receiver.borrow_and_update() {
        if receiver.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessHost {
    Standalone,
    /// Run under a service controller that talks to the process over stdin.
    ManagedService,
}

impl ProcessHost {
    pub fn from_mode(mode: HostMode) -> Self {
        match mode {
            HostMode::Standalone => Self::Standalone,
            HostMode::Service => Self::ManagedService,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::ManagedService => "service",
        }
    }

    /// Installs the stop sources for this host. Must run inside a tokio runtime.
    pub fn start(self, shutdown: Arc<Shutdown>) {
        spawn_signal_listener(Arc::clone(&shutdown));
        if self == Self::ManagedService {
            let spawned = thread::Builder::new()
                .name("service-control".to_string())
                .spawn(move || watch_control_channel(std::io::stdin().lock(), &shutdown));
            if let Err(err) = spawned {
                ledgerd_log::log_warn!("failed to start service control reader: {err}");
            }
        }
    }
}

fn spawn_signal_listener(shutdown: Arc<Shutdown>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    ledgerd_log::log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.request("interrupt");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => shutdown.request("interrupt"),
                _ = sigterm.recv() => shutdown.request("terminate signal"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.request("interrupt");
        }
    });
}

/// A `stop` line or the controller closing the channel both stop the node.
fn watch_control_channel<R: BufRead>(mut reader: R, shutdown: &Shutdown) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                shutdown.request("service control channel closed");
                return;
            }
            Ok(_) => {
                let command = line.trim();
                if command.eq_ignore_ascii_case("stop") {
                    shutdown.request("service stop");
                    return;
                }
                if !command.is_empty() {
                    ledgerd_log::log_warn!("ignoring unknown service command '{command}'");
                }
            }
            Err(err) => {
                ledgerd_log::log_warn!("service control read failed: {err}");
                shutdown.request("service control channel failed");
                return;
            }
        }
        if shutdown.is_requested() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn stop_line_requests_shutdown() {
        let (shutdown, receiver) = Shutdown::new(CancelToken::new());
        watch_control_channel(Cursor::new("status\nstop\nignored\n"), &shutdown);
        assert!(shutdown.is_requested());
        assert!(shutdown.token().is_cancelled());
        assert!(*receiver.borrow());
    }

    #[test]
    fn closed_channel_requests_shutdown() {
        let (shutdown, _receiver) = Shutdown::new(CancelToken::new());
        watch_control_channel(Cursor::new(""), &shutdown);
        assert!(shutdown.is_requested());
    }

    #[test]
    fn host_follows_mode() {
        assert_eq!(
            ProcessHost::from_mode(HostMode::Service),
            ProcessHost::ManagedService
        );
        assert_eq!(ProcessHost::from_mode(HostMode::Standalone).as_str(), "standalone");
    }
}
