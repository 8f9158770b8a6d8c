use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tls::build_acceptor;
use crate::broker::Broker;
use crate::error::TransportError;
use crate::protocol::{self, RpcError};
use crate::rpc::Dispatcher;

/// Accept loop for the broker's listening endpoint.
///
/// Runs until cancelled. A `settings.save` that changes the endpoint makes
/// the loop drop the listener and bind the new address; established
/// sessions keep running on their old sockets.
pub async fn serve(
    broker: Arc<Broker>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let mut reload = broker.transport_reload();

    loop {
        let transport = broker.config().transport;
        let addr = transport.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let acceptor = match (&transport.use_tls, &transport.certificate_path) {
            (true, Some(path)) => Some(build_acceptor(path)?),
            (true, None) => {
                warn!("TLS enabled without a certificate path; serving plain TCP");
                None
            }
            _ => None,
        };
        info!(%addr, tls = acceptor.is_some(), "broker listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = reload.changed() => {
                    info!("transport settings changed; rebinding listener");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let broker = Arc::clone(&broker);
                        let dispatcher = Arc::clone(&dispatcher);
                        let acceptor = acceptor.clone();
                        tokio::spawn(handle_socket(broker, dispatcher, stream, acceptor, peer));
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                    }
                },
            }
        }
    }
}

async fn handle_socket(
    broker: Arc<Broker>,
    dispatcher: Arc<Dispatcher>,
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    peer: SocketAddr,
) {
    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => run_session(broker, dispatcher, tls_stream, peer).await,
            Err(error) => debug!(%peer, %error, "TLS handshake failed"),
        },
        None => run_session(broker, dispatcher, stream, peer).await,
    }
}

async fn run_session<S>(
    broker: Arc<Broker>,
    dispatcher: Arc<Dispatcher>,
    stream: S,
    peer: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let transport = broker.config().transport;
    let mut origin: Option<String> = None;

    let callback = |request: &Request, response: Response| {
        origin = request
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        if transport.origin_allowed(origin.as_deref()) {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("origin not allowed".to_owned()));
            *rejection.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
            Err(rejection)
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(error) => {
            debug!(%peer, %error, "WebSocket handshake rejected");
            return;
        }
    };

    let (mut sink, mut messages) = ws.split();

    let Some(session) = broker.sessions().try_admit(origin) else {
        debug!(%peer, "session rejected: at capacity");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Again,
                reason: "server at capacity".into(),
            })))
            .await;
        return;
    };
    let session_id = session.id();
    info!(%session_id, %peer, "session established");

    session.outbound().push_notification(protocol::notification_frame(
        "server.connected",
        json!({
            "session_id": session_id,
            "server_version": env!("CARGO_PKG_VERSION"),
            "timestamp": OffsetDateTime::now_utc().to_string(),
        }),
    ));

    // One writer per session: outbound frames hit the wire in queue order,
    // so no two writes interleave.
    let writer_session = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_session.outbound().pop().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = messages.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // Handlers run concurrently; ordering is only guaranteed for
                // the outbound side.
                let broker = Arc::clone(&broker);
                let dispatcher = Arc::clone(&dispatcher);
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let response = dispatcher
                        .dispatch(broker, Arc::clone(&session), text.as_str())
                        .await;
                    if let Some(response) = response {
                        session.outbound().push_response(response);
                    }
                });
            }
            Ok(Message::Binary(_)) => {
                // Binary payloads belong inside text fields, hex or base64.
                let error = RpcError::Parse {
                    reason: "binary frames are not supported".to_owned(),
                };
                session
                    .outbound()
                    .push_response(protocol::error_frame(None, &error));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%session_id, %error, "session socket failed");
                break;
            }
        }
    }

    broker.sessions().remove(session_id);
    let _ = writer.await;
    info!(%session_id, "session closed");
}
