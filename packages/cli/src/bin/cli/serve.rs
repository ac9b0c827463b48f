// ABOUTME: `disclaude serve`: reads tab-separated chat events from stdin and answers on stdout
// ABOUTME: SIGINT/SIGTERM cancel pending sandbox starts before in-flight requests are drained

use anyhow::{Context, Result};
use disclaude_cli::App;
use disclaude_sandbox::{ChatTransport, CommandRouter, ConsoleTransport, InboundEvent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Received Ctrl-C");
    }

    Ok(())
}

pub async fn run(app: App) -> Result<()> {
    app.coordinator
        .orchestrator()
        .ensure_namespace()
        .await
        .context("Failed to prepare sandbox namespace")?;

    let transport: Arc<dyn ChatTransport> = Arc::new(ConsoleTransport::stdout());
    let router = Arc::new(CommandRouter::new(
        app.coordinator.clone(),
        app.directory.clone(),
        transport,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Listening for chat events on stdin");

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                app.coordinator.shutdown();
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match InboundEvent::parse_line(&line) {
                    Ok(event) => {
                        let router = router.clone();
                        tasks.spawn(async move {
                            if let Err(e) = router.handle(&event).await {
                                warn!(thread_id = %event.thread_id, error = %e, "Failed to deliver reply");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Ignoring input line"),
                },
                Ok(None) => {
                    info!("Input closed; finishing in-flight requests");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    app.coordinator.shutdown();
                    break;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Request task panicked");
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Request task panicked");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
