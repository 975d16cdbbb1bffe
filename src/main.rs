//! rtmpcast server binary
//!
//! Binds 0.0.0.0:1935 and serves until ctrl-c. Publish with
//! `ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test`,
//! play with `ffplay rtmp://localhost/live/test`.

use async_trait::async_trait;
use tracing::info;

use rtmpcast::{Request, RtmpServer, ServerConfig, SourceHandler};

struct LogHandler;

#[async_trait]
impl SourceHandler for LogHandler {
    async fn on_publish(&self, req: &Request) {
        info!(stream = %req.stream_url(), ip = %req.ip, "stream published");
    }

    async fn on_unpublish(&self, req: &Request) {
        info!(stream = %req.stream_url(), "stream unpublished");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtmpcast=info".into()),
        )
        .init();

    let config = ServerConfig::default();
    let server = RtmpServer::new(config, LogHandler);

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
