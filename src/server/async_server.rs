use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use crate::{log_error, log_info, log_notice, log_warn};

use super::connection::{ConnectionContext, handle_connection};

pub async fn run_async_server(
    addr: &str,
    max_connections: usize,
    ctx: Arc<ConnectionContext>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    // Start server
    let listener = TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;
    log_info!("Listening on {}", addr);

    serve(listener, max_connections, ctx, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    max_connections: usize,
    ctx: Arc<ConnectionContext>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let slots = Arc::new(Semaphore::new(max_connections.max(1)));
    tokio::pin!(shutdown);

    // Handle connections
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log_notice!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        let Ok(permit) = slots.clone().try_acquire_owned() else {
                            log_warn!("Connection limit reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        };
                        log_info!("Accepted connection from {}", addr);
                        let ctx = ctx.clone();

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, ctx).await {
                                log_error!("Connection handling error: {}", e);
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        log_error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}
