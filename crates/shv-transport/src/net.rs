//! Connection and listener setup keyed by RPC URL.

use shv_rpc::{RpcProtocol, RpcUrl};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tracing::debug;

use crate::error::LinkError;
use crate::link::Link;
use crate::websocket::{SUBPROTOCOL, WebSocketLink};

/// Open a client connection to the endpoint the URL describes.
pub async fn connect_url(url: &RpcUrl) -> Result<Link, LinkError> {
    match url.protocol {
        RpcProtocol::Tcp | RpcProtocol::TcpS => {
            let stream = TcpStream::connect((url.location.as_str(), url.port)).await?;
            stream.set_nodelay(true)?;
            Ok(match url.protocol {
                RpcProtocol::Tcp => Link::stream(stream),
                _ => Link::serial(stream, false),
            })
        }
        RpcProtocol::Unix | RpcProtocol::UnixS => {
            let stream = UnixStream::connect(&url.location).await?;
            Ok(match url.protocol {
                RpcProtocol::Unix => Link::stream(stream),
                _ => Link::serial(stream, false),
            })
        }
        RpcProtocol::Ws => {
            let mut request = format!("ws://{}:{}/", url.location, url.port)
                .into_client_request()
                .map_err(|e| LinkError::Handshake(e.to_string()))?;
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                SUBPROTOCOL.parse().expect("static header value"),
            );
            let (ws, response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| LinkError::Handshake(e.to_string()))?;
            let negotiated = response
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok());
            if negotiated != Some(SUBPROTOCOL) {
                return Err(LinkError::Handshake(format!(
                    "unexpected subprotocol: {negotiated:?}"
                )));
            }
            Ok(Link::WebSocket(WebSocketLink::new(ws)))
        }
        RpcProtocol::Ssl | RpcProtocol::SslS | RpcProtocol::Wss => Err(LinkError::Unsupported(
            "TLS transports are not available".into(),
        )),
        RpcProtocol::Tty => Err(LinkError::Unsupported(
            "serial port transport is not available".into(),
        )),
    }
}

/// A listening endpoint producing connected [`Link`]s.
pub enum Listener {
    Tcp {
        listener: TcpListener,
        serial: bool,
    },
    Unix {
        listener: UnixListener,
        serial: bool,
    },
    Ws {
        listener: TcpListener,
    },
}

/// Bind a listener on the endpoint the URL describes.
pub async fn bind_url(url: &RpcUrl) -> Result<Listener, LinkError> {
    match url.protocol {
        RpcProtocol::Tcp | RpcProtocol::TcpS => {
            let listener = TcpListener::bind((url.location.as_str(), url.port)).await?;
            debug!("listening on tcp {}:{}", url.location, url.port);
            Ok(Listener::Tcp {
                listener,
                serial: url.protocol == RpcProtocol::TcpS,
            })
        }
        RpcProtocol::Unix | RpcProtocol::UnixS => {
            let listener = UnixListener::bind(&url.location)?;
            debug!("listening on unix socket {}", url.location);
            Ok(Listener::Unix {
                listener,
                serial: url.protocol == RpcProtocol::UnixS,
            })
        }
        RpcProtocol::Ws => {
            let listener = TcpListener::bind((url.location.as_str(), url.port)).await?;
            debug!("listening on ws {}:{}", url.location, url.port);
            Ok(Listener::Ws { listener })
        }
        other => Err(LinkError::Unsupported(format!(
            "cannot listen on {other:?}"
        ))),
    }
}

impl Listener {
    /// Wait for the next client connection.
    pub async fn accept(&self) -> Result<Link, LinkError> {
        match self {
            Listener::Tcp { listener, serial } => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!("new client {peer}");
                Ok(if *serial {
                    Link::serial(stream, false)
                } else {
                    Link::stream(stream)
                })
            }
            Listener::Unix { listener, serial } => {
                let (stream, _) = listener.accept().await?;
                Ok(if *serial {
                    Link::serial(stream, false)
                } else {
                    Link::stream(stream)
                })
            }
            Listener::Ws { listener } => {
                let (stream, peer) = listener.accept().await?;
                debug!("new ws client {peer}");
                let ws = tokio_tungstenite::accept_hdr_async(stream, select_subprotocol)
                    .await
                    .map_err(|e| LinkError::Handshake(e.to_string()))?;
                Ok(Link::WebSocket(WebSocketLink::new(ws)))
            }
        }
    }

    /// The local TCP port, when there is one. Handy with port `0` binds.
    pub fn local_port(&self) -> Option<u16> {
        match self {
            Listener::Tcp { listener, .. } | Listener::Ws { listener } => {
                listener.local_addr().ok().map(|a| a.port())
            }
            Listener::Unix { .. } => None,
        }
    }
}

/// Accept callback confirming the `shv3` subprotocol when the client offers
/// it.
fn select_subprotocol(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim() == SUBPROTOCOL))
        .unwrap_or(false);
    if offered {
        resp.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            SUBPROTOCOL.parse().expect("static header value"),
        );
    }
    Ok(resp)
}
