use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, trace};
use tokio::net::{lookup_host, TcpStream};

use reslink_shared::Timestamp;

use crate::host::Host;

/// Result of one connect attempt
pub enum ConnectOutcome {
    Connected { stream: TcpStream, peer: SocketAddr },
    Failed { error: String },
}

/// Resolves the host's address and opens a TCP connection, giving up after
/// `timeout`.
///
/// Runs as its own task so that name resolution never stalls the network
/// loop. Besides its return value it only touches the host's connector
/// info.
pub async fn connect(host: Arc<Host>, timeout: Duration) -> ConnectOutcome {
    host.record_attempt(Timestamp::now_or_epoch());
    let address = host.entry().net_address();
    trace!("Connecting to host '{}' at {}", host.id(), address);

    let error = match tokio::time::timeout(timeout, resolve_and_connect(&address)).await {
        Ok(Ok((stream, peer))) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Cannot disable Nagle for {}: {}", peer, e);
            }
            host.record_connected(peer);
            return ConnectOutcome::Connected { stream, peer };
        }
        Ok(Err(e)) => format!("{}: {}", address, e),
        Err(_) => format!("{}: no connection within {:?}", address, timeout),
    };
    host.record_error(&error);
    ConnectOutcome::Failed { error }
}

async fn resolve_and_connect(address: &str) -> io::Result<(TcpStream, SocketAddr)> {
    let mut last_error = None;
    for peer in lookup_host(address).await? {
        match TcpStream::connect(peer).await {
            Ok(stream) => return Ok((stream, peer)),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")))
}
