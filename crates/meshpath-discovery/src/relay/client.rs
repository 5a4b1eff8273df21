//! Relay client: dialing a relay server and running the handshake.

use super::protocol::{
    ClientInfo, Frame, RelayError, RelayResult, ServerInfo, open_info, read_frame, seal_info,
    write_frame,
};
use meshpath_crypto::{NodePrivateKey, NodePublicKey, SharedKey};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Server's node key
    pub server_key: NodePublicKey,
    /// Server parameters
    pub server_info: ServerInfo,
}

/// Run the client side of the handshake on an established stream.
///
/// # Errors
///
/// Returns [`RelayError::Handshake`] if the server sends anything other than
/// the expected frames, or a crypto error if its ServerInfo doesn't open.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    private_key: &NodePrivateKey,
    info: &ClientInfo,
) -> RelayResult<Handshake> {
    let server_key = match read_frame(stream).await? {
        Frame::ServerKey { key } => key,
        other => {
            return Err(RelayError::Handshake(format!(
                "expected ServerKey, got frame type {:#04x}",
                other.type_code()
            )));
        }
    };

    let shared = SharedKey::between_nodes(private_key, &server_key);
    let (nonce, sealed) = seal_info(&shared, info)?;
    write_frame(
        stream,
        &Frame::ClientInfo {
            key: private_key.public_key(),
            nonce,
            sealed,
        },
    )
    .await?;

    let server_info = match read_frame(stream).await? {
        Frame::ServerInfo { nonce, sealed } => open_info::<ServerInfo>(&shared, &nonce, &sealed)?,
        other => {
            return Err(RelayError::Handshake(format!(
                "expected ServerInfo, got frame type {:#04x}",
                other.type_code()
            )));
        }
    };

    tracing::debug!(
        "relay handshake complete with server {} (version {})",
        server_key.fmt_short(),
        server_info.version
    );
    Ok(Handshake {
        server_key,
        server_info,
    })
}

/// Dial `target` (`host:port`) over TCP and handshake, all within `timeout`.
///
/// # Errors
///
/// Returns [`RelayError::Timeout`] if the deadline passes, or the dial or
/// handshake error.
pub async fn dial(
    target: &str,
    private_key: &NodePrivateKey,
    info: &ClientInfo,
    timeout: Duration,
) -> RelayResult<(TcpStream, Handshake)> {
    tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        let hs = handshake(&mut stream, private_key, info).await?;
        Ok((stream, hs))
    })
    .await
    .map_err(|_| RelayError::Timeout)?
}
