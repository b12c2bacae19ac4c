//! Client connection to the master's RPC surface.

use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::protocol::{read_frame, write_frame, ClientRequest, ClientResponse, Hello, ProtocolError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to master at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A short-lived CLI session with the master.
pub struct MasterClient {
    reader: ReadHalf<TcpStream>,
    writer: WriteHalf<TcpStream>,
}

impl MasterClient {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr: addr.to_string(), source })?;
        let (reader, mut writer) = tokio::io::split(stream);
        write_frame(&mut writer, &Hello::Client).await?;
        Ok(Self { reader, writer })
    }

    /// Send a request and read the first response frame.
    pub async fn request(&mut self, request: ClientRequest) -> Result<ClientResponse, ClientError> {
        write_frame(&mut self.writer, &request).await?;
        Ok(read_frame(&mut self.reader).await?)
    }

    /// Read the next frame of a streaming response.
    pub async fn next_response(&mut self) -> Result<ClientResponse, ClientError> {
        Ok(read_frame(&mut self.reader).await?)
    }
}
