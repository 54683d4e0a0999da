//! RCON control channel. The daemon only needs `command(string)`; the
//! concrete transport lives behind [`RconDialer`] so the controller can be
//! tested with a scripted fake and the protocol swapped without touching it.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum RconError {
    #[error("rcon dial {address}: {reason}")]
    Dial { address: String, reason: String },
    #[error("rcon command failed: {0}")]
    Command(String),
}

#[async_trait]
pub trait RconConnection: Send {
    async fn command(&mut self, command: &str) -> Result<String, RconError>;
}

#[async_trait]
pub trait RconDialer: Send + Sync {
    async fn dial(
        &self,
        address: &str,
        password: &str,
    ) -> Result<Box<dyn RconConnection>, RconError>;
}

/// Production dialer over TCP. The connection closes on drop.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpRconDialer;

#[async_trait]
impl RconDialer for TcpRconDialer {
    async fn dial(
        &self,
        address: &str,
        password: &str,
    ) -> Result<Box<dyn RconConnection>, RconError> {
        let connection = rcon::Connection::<tokio::net::TcpStream>::builder()
            .connect(address, password)
            .await
            .map_err(|e| RconError::Dial {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(TcpRconConnection { connection }))
    }
}

struct TcpRconConnection {
    connection: rcon::Connection<tokio::net::TcpStream>,
}

#[async_trait]
impl RconConnection for TcpRconConnection {
    async fn command(&mut self, command: &str) -> Result<String, RconError> {
        self.connection
            .cmd(command)
            .await
            .map_err(|e| RconError::Command(e.to_string()))
    }
}
