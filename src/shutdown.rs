//! Interrupt handling for the monitor loop.

use std::future::Future;
use tokio::runtime::Handle;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Exit status when a repeated interrupt aborts the run.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Resolves on Ctrl-C or SIGTERM.
///
/// If a handler cannot be installed that source is ignored and the run
/// simply goes to its deadline.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, stopping run");
        }
        _ = terminate => {
            info!("received SIGTERM, stopping run");
        }
    }
}

/// Keep listening for interrupts on `rt` for the rest of the process.
///
/// The returned future resolves on the first Ctrl-C or SIGTERM and serves as
/// the orchestrator's interrupt. Installed handlers replace the default
/// terminate action, so every later signal calls `on_repeat` instead; this
/// keeps a run that hangs in join or teardown stoppable.
pub fn forward_signals<F>(rt: &Handle, mut on_repeat: F) -> impl Future<Output = ()>
where
    F: FnMut() + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    rt.spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(());
        loop {
            shutdown_signal().await;
            warn!("interrupted again while shutting down");
            on_repeat();
        }
    });
    async move {
        if rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn raise(signal: &str) {
        let status = std::process::Command::new("kill")
            .args([signal, &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn repeated_signal_reaches_the_handler() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let repeats = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&repeats);
        let interrupt = forward_signals(rt.handle(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Let the listener task register its handlers.
        std::thread::sleep(Duration::from_millis(200));
        raise("-INT");
        rt.block_on(async { tokio::time::timeout(Duration::from_secs(5), interrupt).await })
            .unwrap();
        assert_eq!(repeats.load(Ordering::SeqCst), 0);

        std::thread::sleep(Duration::from_millis(200));
        raise("-TERM");
        let started = Instant::now();
        while repeats.load(Ordering::SeqCst) == 0 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(repeats.load(Ordering::SeqCst), 1);
    }
}
