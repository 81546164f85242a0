//! Demo component hosted by the daemon.

use bytes::Bytes;
use tessera_cluster::{Component, HandlerContext, HandlerFuture};
use tracing::{debug, info};

/// `echo.say` returns the payload unchanged. `echo.ping` pushes the payload
/// back on `echo.pong` and answers `pong`.
#[derive(Debug, Default)]
pub struct EchoComponent;

impl Component for EchoComponent {
    fn name(&self) -> &str {
        "echo"
    }

    fn methods(&self) -> Vec<String> {
        vec!["say".to_string(), "ping".to_string()]
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        method: &'a str,
        payload: Bytes,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            debug!(%method, session_id = ctx.session_id(), bytes = payload.len(), "echo call");
            match method {
                "ping" => {
                    ctx.push("echo.pong", payload).await?;
                    Ok(Some(Bytes::from_static(b"pong")))
                }
                _ => Ok(Some(payload)),
            }
        })
    }

    fn after_init(&self) {
        info!("echo component ready");
    }

    fn shutdown(&self) {
        info!("echo component stopped");
    }
}
