// Termination signal handling

/// Wait for SIGTERM or SIGINT, returning the signal's name
#[cfg(unix)]
pub async fn terminated() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!("Received {}, initiating graceful shutdown", name);
    Ok(name)
}

/// Wait for Ctrl-C, returning the signal's name
#[cfg(not(unix))]
pub async fn terminated() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C, initiating graceful shutdown");
    Ok("ctrl-c")
}

/// One deadline shared by every step of a graceful shutdown
#[derive(Debug, Clone, Copy)]
pub struct GracePeriod {
    deadline: tokio::time::Instant,
}

impl GracePeriod {
    /// Start the clock now
    pub fn start(grace: std::time::Duration) -> Self {
        Self {
            deadline: tokio::time::Instant::now() + grace,
        }
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline
            .saturating_duration_since(tokio::time::Instant::now())
    }

    /// Run `future` until it completes or the deadline passes
    pub async fn bound<F: std::future::Future>(&self, future: F) -> Option<F::Output> {
        tokio::time::timeout_at(self.deadline, future).await.ok()
    }
}
