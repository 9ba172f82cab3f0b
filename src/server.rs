use std::{net::SocketAddr, sync::Arc};

use log::{error, info};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Semaphore},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::connection::Connection;

/// Cap on simultaneously serviced sessions. Connections beyond the cap are
/// accepted but wait for a permit before their session starts.
const MAX_SESSIONS: usize = 64;

pub struct Server {
    command_tx: mpsc::Sender<ServerCommand>,
    cancellation_token: CancellationToken,
    session_permits: Arc<Semaphore>,
    local_address: SocketAddr,
}

impl Server {
    pub async fn run(address: &str) -> ServerHandle {
        info!("Server starting");

        let listener = TcpListener::bind(address).await.unwrap();
        let local_address = listener.local_addr().unwrap();

        let (command_tx, command_rx) = mpsc::channel(100);
        let cancellation_token = CancellationToken::new();

        let server = Server {
            command_tx: command_tx.clone(),
            cancellation_token: cancellation_token.clone(),
            session_permits: Arc::new(Semaphore::new(MAX_SESSIONS)),
            local_address,
        };
        let handle = server.handle();

        tokio::spawn(command_receive_loop(command_rx, server));
        tokio::spawn(listen_loop(listener, handle.clone()));

        handle
    }

    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::NewConnection(tcp_stream, socket_addr) => {
                self.new_connection(tcp_stream, socket_addr);
            }
        };
    }

    fn new_connection(&mut self, tcp_stream: TcpStream, socket_addr: SocketAddr) {
        let session_permits = self.session_permits.clone();
        let cancellation_token = self.cancellation_token.clone();
        tokio::spawn(async move {
            let Ok(_permit) = session_permits.acquire_owned().await else {
                return;
            };
            Connection::run(tcp_stream, socket_addr, cancellation_token).await;
        });
    }

    fn handle(&self) -> ServerHandle {
        ServerHandle {
            command_tx: self.command_tx.clone(),
            cancellation_token: self.cancellation_token.clone(),
            local_address: self.local_address,
        }
    }
}

async fn command_receive_loop(mut command_rx: mpsc::Receiver<ServerCommand>, mut server: Server) {
    let server_handle = server.handle();
    loop {
        let command = tokio::select! {
            _ = server_handle.has_shutdown() => return,
            command = command_rx.recv() => command,
        };
        let Some(command) = command else { return };
        server.handle_command(command).await;
    }
}

async fn listen_loop(tcp_listener: TcpListener, server_handle: ServerHandle) {
    loop {
        let tcp_stream = tokio::select! {
            _ = server_handle.has_shutdown() => return,
            tcp_stream = tcp_listener.accept() => tcp_stream,
        };
        let (tcp_stream, socket_addr) = match tcp_stream {
            Ok(v) => v,
            Err(e) => {
                error!("Error listening to connections. {}", e);
                server_handle.shutdown();
                return;
            }
        };
        server_handle.new_connection(tcp_stream, socket_addr).await;
    }
}

#[derive(Clone)]
pub struct ServerHandle {
    command_tx: mpsc::Sender<ServerCommand>,
    cancellation_token: CancellationToken,
    local_address: SocketAddr,
}

impl ServerHandle {
    async fn new_connection(&self, tcp_stream: TcpStream, socket_addr: SocketAddr) {
        let _ = self
            .command_tx
            .send(ServerCommand::NewConnection(tcp_stream, socket_addr))
            .await;
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }

    pub fn has_shutdown(&self) -> WaitForCancellationFuture {
        self.cancellation_token.cancelled()
    }
}

enum ServerCommand {
    NewConnection(TcpStream, SocketAddr),
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn insert(timestamp: i32, price: i32) -> Vec<u8> {
        let mut frame = vec![b'I'];
        frame.extend(timestamp.to_be_bytes());
        frame.extend(price.to_be_bytes());
        frame
    }

    fn query(min_time: i32, max_time: i32) -> Vec<u8> {
        let mut frame = vec![b'Q'];
        frame.extend(min_time.to_be_bytes());
        frame.extend(max_time.to_be_bytes());
        frame
    }

    async fn connect(server: &ServerHandle) -> TcpStream {
        TcpStream::connect(server.local_address()).await.unwrap()
    }

    async fn read_mean(stream: &mut TcpStream) -> i32 {
        let mut reply = [0; 4];
        stream.read_exact(&mut reply).await.unwrap();
        i32::from_be_bytes(reply)
    }

    #[tokio::test]
    async fn query_returns_mean_of_inserted_prices() {
        let server = Server::run("127.0.0.1:0").await;
        let mut stream = connect(&server).await;

        let mut data = Vec::new();
        data.extend(insert(1000, 100));
        data.extend(insert(1005, 110));
        data.extend(insert(1010, 120));
        data.extend(query(1000, 1010));
        stream.write_all(&data).await.unwrap();

        assert_eq!(read_mean(&mut stream).await, 110);
        server.shutdown();
    }

    #[tokio::test]
    async fn sessions_do_not_share_prices() {
        let server = Server::run("127.0.0.1:0").await;
        let mut first = connect(&server).await;
        let mut second = connect(&server).await;

        first.write_all(&insert(1000, 100)).await.unwrap();
        second.write_all(&insert(1000, 300)).await.unwrap();
        first.write_all(&query(1000, 1000)).await.unwrap();
        second.write_all(&query(1000, 1000)).await.unwrap();

        assert_eq!(read_mean(&mut first).await, 100);
        assert_eq!(read_mean(&mut second).await, 300);
        server.shutdown();
    }

    #[tokio::test]
    async fn unknown_message_type_closes_connection() {
        let server = Server::run("127.0.0.1:0").await;
        let mut stream = connect(&server).await;

        let mut frame = vec![b'X'];
        frame.extend([0; 8]);
        stream.write_all(&frame).await.unwrap();

        let mut reply = Vec::new();
        let read = stream.read_to_end(&mut reply).await;
        assert!(read.is_err() || reply.is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn trailing_partial_frame_is_discarded() {
        let server = Server::run("127.0.0.1:0").await;
        let mut stream = connect(&server).await;

        let mut data = Vec::new();
        data.extend(insert(1000, 100));
        data.extend(query(1000, 1000));
        data.extend([b'I', 0, 0, 0]);
        stream.write_all(&data).await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(read_mean(&mut stream).await, 100);
        let mut rest = Vec::new();
        let read = stream.read_to_end(&mut rest).await;
        assert!(read.is_err() || rest.is_empty());
        server.shutdown();
    }
}
