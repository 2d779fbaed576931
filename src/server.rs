use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::engine::Engine;
use crate::protocol::{self, Response};

/// Longest accepted request line in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;

fn into_io(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Serve one client until it disconnects. Requests on a connection are
/// handled in order; each gets exactly one response line.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let response = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => protocol::handle_line(&engine, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Response::failure("bad_request", "request line too long")
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        debug!(ok = response.ok, "request handled");
        framed.send(response.to_line()).await.map_err(into_io)?;
    }
    Ok(())
}
