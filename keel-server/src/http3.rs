//! HTTP/3 serve loop: QUIC connections from a quinn endpoint, requests
//! bridged onto the same axum router as the stream side.

use axum::Router;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use tower::ServiceExt;
use tracing::debug;

/// Accept QUIC connections until the endpoint is closed. Endpoint close
/// is the normal shutdown sentinel, not an error.
pub(crate) async fn serve(endpoint: quinn::Endpoint, app: Router) {
    while let Some(incoming) = endpoint.accept().await {
        let app = app.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(err) => {
                    debug!(error = %err, "QUIC handshake failed");
                    return;
                }
            };
            serve_quic_connection(connection, app).await;
        });
    }
}

async fn serve_quic_connection(connection: quinn::Connection, app: Router) {
    let mut h3_conn =
        match h3::server::Connection::new(h3_quinn::Connection::new(connection)).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(error = %err, "HTTP/3 connection setup failed");
                return;
            }
        };

    loop {
        match h3_conn.accept().await {
            Ok(Some((request, stream))) => {
                let app = app.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_request(request, stream, app).await {
                        debug!(error = %err, "HTTP/3 request failed");
                    }
                });
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "HTTP/3 connection error");
                break;
            }
        }
    }
}

async fn handle_request(
    request: http::Request<()>,
    mut stream: h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    app: Router,
) -> anyhow::Result<()> {
    let (parts, ()) = request.into_parts();

    let mut body = BytesMut::new();
    while let Some(chunk) = stream.recv_data().await? {
        body.put(chunk);
    }
    let request = http::Request::from_parts(parts, axum::body::Body::from(body.freeze()));

    let response = app.oneshot(request).await?;
    let (parts, response_body) = response.into_parts();
    let payload = response_body.collect().await?.to_bytes();

    stream
        .send_response(http::Response::from_parts(parts, ()))
        .await?;
    if payload.has_remaining() {
        stream.send_data(payload).await?;
    }
    stream.finish().await?;
    Ok(())
}
