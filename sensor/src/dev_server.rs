//! Local HTTP server for development.
//!
//! Answers every request with `Hello, <path>!` so the sensor has traffic to observe without a
//! cluster.

use reqtap_core::protocols::stream::http::{HttpDecoder, MessageDecoder};

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Binds `port` on all interfaces and serves connections in the background.
pub(crate) async fn start(port: u16) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("Failed to bind development server on port {}", port))?;
    log::info!("Development server listening on port {}", port);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(async move {
                        if let Err(err) = serve(stream).await {
                            log::debug!("Development server connection from {}: {}", peer, err);
                        }
                    });
                }
                Err(err) => log::warn!("Development server accept failed: {}", err),
            }
        }
    });
    Ok(())
}

async fn serve(mut stream: TcpStream) -> Result<()> {
    let mut buffer = [0; 4096];
    let n = stream.read(&mut buffer).await?;
    let request = HttpDecoder.decode_request(&buffer[..n])?;
    let body = greeting(&request.uri);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Greets the request path without its leading slash or query.
fn greeting(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    format!("Hello, {}!", path.strip_prefix('/').unwrap_or(path))
}
