use log::{debug, trace};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::{spawn_local, JoinHandle},
};

use super::task::{NetQueue, NetTask};
use crate::connection::ServerKey;

const READ_BUFFER_SIZE: usize = 4096;

/// Who a socket belongs to, so reader and writer tasks can report back
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SocketOwner {
    /// Host connection of the given connect attempt
    Host { host: String, attempt: u64 },
    Server(ServerKey),
}

impl SocketOwner {
    fn data(&self, data: Vec<u8>) -> NetTask {
        match self {
            SocketOwner::Host { host, attempt } => NetTask::HostData {
                host: host.clone(),
                attempt: *attempt,
                data,
            },
            SocketOwner::Server(server) => NetTask::ServerData {
                server: *server,
                data,
            },
        }
    }

    fn closed(&self) -> NetTask {
        match self {
            SocketOwner::Host { host, attempt } => NetTask::HostClosed {
                host: host.clone(),
                attempt: *attempt,
            },
            SocketOwner::Server(server) => NetTask::ServerClosed { server: *server },
        }
    }
}

/// Reader and writer task of one connected socket.
///
/// Must be created on the network thread's `LocalSet`.
pub(crate) struct SocketIo {
    outgoing: UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketIo {
    pub fn spawn(stream: TcpStream, owner: SocketOwner, queue: &NetQueue) -> Self {
        let (rx, tx) = stream.into_split();
        let (outgoing, pending) = unbounded_channel();
        let writer = spawn_local(write_loop(tx, pending, owner.clone(), queue.clone()));
        let reader = spawn_local(read_loop(rx, owner, queue.clone()));
        Self {
            outgoing,
            reader,
            writer,
        }
    }

    /// Hands data to the writer task. Never blocks.
    pub fn write(&self, text: String) -> bool {
        self.outgoing.send(text.into_bytes()).is_ok()
    }

    /// Stops reading at once. The writer still flushes what it was given
    /// and then shuts the socket down; its handle is returned so the
    /// engine can wait for it on exit.
    pub fn close(self) -> JoinHandle<()> {
        self.reader.abort();
        self.writer
    }
}

async fn read_loop(mut rx: OwnedReadHalf, owner: SocketOwner, queue: NetQueue) {
    let mut raw_buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match rx.read(&mut raw_buf).await {
            Ok(0) => {
                trace!("{:?}: peer closed the connection", owner);
                break;
            }
            Ok(ct) => {
                if queue.send(owner.data(raw_buf[..ct].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("{:?}: read failed: {}", owner, e);
                break;
            }
        }
    }
    let _ = queue.send(owner.closed());
}

async fn write_loop(
    mut tx: OwnedWriteHalf,
    mut pending: UnboundedReceiver<Vec<u8>>,
    owner: SocketOwner,
    queue: NetQueue,
) {
    while let Some(frame) = pending.recv().await {
        trace!("{:?}: writing {} bytes", owner, frame.len());
        if let Err(e) = tx.write_all(&frame).await {
            debug!("{:?}: write failed: {}", owner, e);
            let _ = queue.send(owner.closed());
            return;
        }
    }
    let _ = tx.shutdown().await;
}
