//! A mock TCP harness for testing the receive loop and batch decoder
//! against a real socket rather than an in-memory buffer.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

/// Binds to a random local port and accepts exactly one connection,
/// handing both ends back to the caller. Mirrors the teacher's
/// bind-to-port-0, return-both-ends harness shape, translated from a
/// WebSocket accept loop to a raw TCP connect.
pub struct MockTcpServer {
    addr: SocketAddr,
    listener: TcpListener,
}

impl MockTcpServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(MockTcpServer { addr, listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> std::io::Result<TcpStream> {
        let (stream, _peer) = self.listener.accept().await?;
        Ok(stream)
    }
}

/// Connect a fresh client socket to the server and accept it in one step,
/// returning `(client, server)` halves of the same connection.
pub async fn connect_pair() -> std::io::Result<(TcpStream, TcpStream)> {
    let server = MockTcpServer::start().await?;
    let connect = TcpStream::connect(server.local_addr());
    let accept = server.accept();
    let (client, server_side) = tokio::try_join!(connect, accept)?;
    Ok((client, server_side))
}
