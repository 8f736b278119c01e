use iroh::endpoint::{Connection, RecvStream, SendStream};
use n0_error::stack_error;

/// An error during the HTTP/3 SETTINGS frame exchange.
#[stack_error(derive, from_sources)]
#[derive(Clone)]
pub enum SettingsError {
    #[error("protocol error")]
    ProtoError(#[error(source, from, std_err)] web_transport_proto::SettingsError),

    #[error("WebTransport is not supported")]
    WebTransportUnsupported,

    #[error("connection error")]
    ConnectionError(#[error(source, from, std_err)] iroh::endpoint::ConnectionError),

    #[error("read error")]
    ReadError(#[error(source, from, std_err)] iroh::endpoint::ReadError),

    #[error("write error")]
    WriteError(#[error(source, from, std_err)] iroh::endpoint::WriteError),
}

/// The HTTP/3 control streams of one connection.
///
/// Both directions must stay open for as long as the connection is used, so the driver
/// owns this for the connection's lifetime.
pub struct ControlStreams {
    #[allow(dead_code)]
    local: SendStream,

    #[allow(dead_code)]
    remote: RecvStream,
}

impl ControlStreams {
    /// Exchanges SETTINGS frames, requiring the peer to advertise WebTransport support.
    ///
    /// Must run before any other unidirectional stream is accepted on `conn`.
    pub async fn exchange(conn: &Connection) -> Result<Self, SettingsError> {
        let (local, remote) = tokio::try_join!(Self::send(conn), Self::recv(conn))?;
        Ok(Self { local, remote })
    }

    async fn send(conn: &Connection) -> Result<SendStream, SettingsError> {
        let mut settings = web_transport_proto::Settings::default();
        settings.enable_webtransport(1);

        tracing::debug!("sending SETTINGS frame: {settings:?}");

        let mut local = conn.open_uni().await?;
        settings.write(&mut local).await?;

        Ok(local)
    }

    async fn recv(conn: &Connection) -> Result<RecvStream, SettingsError> {
        let mut remote = conn.accept_uni().await?;
        let settings = web_transport_proto::Settings::read(&mut remote).await?;

        tracing::debug!("received SETTINGS frame: {settings:?}");

        if settings.supports_webtransport() == 0 {
            return Err(SettingsError::WebTransportUnsupported);
        }

        Ok(remote)
    }
}
