//! JSON-lines server - UI 메시지 채널
//!
//! stdin에서 한 줄에 하나의 `Request`를 읽고, stdout으로 한 줄에 하나의 `Response`를 씁니다.
//! Ctrl+C 또는 EOF에서 종료하며, 종료 시 진행 중인 압축은 취소됩니다.

use deepctx_core::{ContextEngine, ContextService};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

pub async fn run(engine: ContextEngine) -> anyhow::Result<()> {
    let service = ContextService::new(Arc::new(engine));
    let shutdown = service.shutdown_token();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut handled = 0u64;

    info!("Serving JSON-lines requests on stdin");

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                shutdown.cancel();
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        // 처리 중 Ctrl+C면 취소 신호를 보내고 응답은 끝까지 기다린다
        let mut stopping = false;
        let handle = service.handle_line(&line);
        tokio::pin!(handle);
        let response = tokio::select! {
            response = &mut handle => response,
            _ = tokio::signal::ctrl_c() => {
                shutdown.cancel();
                stopping = true;
                handle.await
            }
        };
        debug!(ok = response.is_ok(), "Request handled");

        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
        handled += 1;

        if stopping {
            break;
        }
    }

    info!(handled, "Server stopped");
    Ok(())
}
