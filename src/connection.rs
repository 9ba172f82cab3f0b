use std::{io, net::SocketAddr};

use log::{debug, error, info};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    try_join,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{
    model::TimeSeries,
    packets::{ClientPacket, PacketError, ServerPacket, FRAME_LENGTH},
};

const TCP_MAX_SIZE: usize = 65535;

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Packet(#[from] PacketError),
}

pub struct Connection {
    command_tx: mpsc::Sender<ConnectionCommand>,
    packet_tx: mpsc::Sender<ServerPacket>,
    server_cancellation_token: CancellationToken,
    cancellation_token: CancellationToken,
    prices: TimeSeries,
}

impl Connection {
    pub async fn run(
        tcp_stream: TcpStream,
        socket_addr: SocketAddr,
        server_cancellation_token: CancellationToken,
    ) {
        info!("Connection from {socket_addr}");

        let cancellation_token = CancellationToken::new();

        let (command_tx, command_rx) = mpsc::channel(100);
        let (packet_tx, packet_rx) = mpsc::channel(100);
        let connection = Connection {
            command_tx,
            packet_tx,
            server_cancellation_token,
            cancellation_token,
            prices: TimeSeries::new(),
        };
        let handle = connection.handle();

        tokio::spawn(command_receive_loop(command_rx, connection));

        let (read_stream, write_stream) = tcp_stream.into_split();
        let read_task = read_loop(read_stream, handle.clone());
        let write_task = write_loop(write_stream, handle.clone(), packet_rx);

        if let Err(e) = try_join!(read_task, write_task) {
            error!("Error: {e}");
        }

        handle.cancellation_token.cancel();

        info!("Connection from {socket_addr} closed.");
    }

    async fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::HandlePacket(packet) => self.handle_packet(packet).await,
            ConnectionCommand::Shutdown => self.cancellation_token.cancel(),
        }
    }

    async fn handle_packet(&mut self, packet: ClientPacket) {
        match packet {
            ClientPacket::Insert { timestamp, price } => {
                debug!("Adding {price} at time {timestamp}");
                self.prices.insert(timestamp, price);
            }
            ClientPacket::Query { min_time, max_time } => {
                let mean_price = self.prices.mean(min_time, max_time);
                debug!("Returning {mean_price} for prices between {min_time} and {max_time}");
                let _ = self
                    .packet_tx
                    .send(ServerPacket::QueryResponse { mean_price })
                    .await;
            }
        }
    }

    fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            command_tx: self.command_tx.clone(),
            server_cancellation_token: self.server_cancellation_token.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }
}

async fn command_receive_loop(
    mut command_rx: mpsc::Receiver<ConnectionCommand>,
    mut connection: Connection,
) {
    let connection_handle = connection.handle();
    loop {
        let command = tokio::select! {
            v = command_rx.recv() => v,
            _ = connection_handle.has_shutdown() => return,
            _ = connection_handle.server_has_shutdown() => return,
        };

        let Some(command) = command else { return };
        connection.handle_command(command).await;
    }
}

async fn read_loop(
    mut read_stream: OwnedReadHalf,
    connection_handle: ConnectionHandle,
) -> Result<(), ConnectionError> {
    let mut data = Vec::new();
    loop {
        let mut buffer = vec![0; TCP_MAX_SIZE];
        let size = tokio::select! {
            v = read_stream.read(&mut buffer) => v?,
            _ = connection_handle.has_shutdown() => return Ok(()),
            _ = connection_handle.server_has_shutdown() => return Ok(()),
        };
        if size == 0 {
            if !data.is_empty() {
                debug!("Discarding {} trailing bytes", data.len());
            }
            connection_handle.shutdown().await;
            return Ok(());
        }

        buffer.truncate(size);
        data.extend(buffer);

        while data.len() >= FRAME_LENGTH {
            let mut remainder = data.split_off(FRAME_LENGTH);

            let packet = ClientPacket::parse(&data)?;
            connection_handle.handle_packet(packet).await;

            std::mem::swap(&mut data, &mut remainder);
        }
    }
}

async fn write_loop(
    mut write_stream: OwnedWriteHalf,
    connection_handle: ConnectionHandle,
    mut packet_rx: mpsc::Receiver<ServerPacket>,
) -> Result<(), ConnectionError> {
    loop {
        // Exits when the reply channel closes, after buffered replies have
        // drained, so a query answered just before end-of-stream still gets
        // its reply written.
        let packet = tokio::select! {
            v = packet_rx.recv() => v,
            _ = connection_handle.server_has_shutdown() => return Ok(()),
        };
        let Some(packet) = packet else {
            return Ok(());
        };

        write_stream.write_all(&packet.to_bytes()).await?;
    }
}

#[derive(Clone)]
struct ConnectionHandle {
    command_tx: mpsc::Sender<ConnectionCommand>,
    server_cancellation_token: CancellationToken,
    cancellation_token: CancellationToken,
}

impl ConnectionHandle {
    async fn handle_packet(&self, client_packet: ClientPacket) {
        let _ = self
            .command_tx
            .send(ConnectionCommand::HandlePacket(client_packet))
            .await;
    }

    async fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown).await;
    }

    pub fn server_has_shutdown(&self) -> WaitForCancellationFuture {
        self.server_cancellation_token.cancelled()
    }

    pub fn has_shutdown(&self) -> WaitForCancellationFuture {
        self.cancellation_token.cancelled()
    }
}

#[derive(Debug)]
enum ConnectionCommand {
    HandlePacket(ClientPacket),
    Shutdown,
}
