//! The bridge / front-end: the client-facing listening socket,
//! privileged-command authorization, and udev property re-export.

use std::path::Path;
use std::sync::Arc;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use tokio::net::{UnixListener, UnixStream};

use crate::buffer::{read_frame, write_frame, ByteBuffer};
use crate::context::CommonContext;
use crate::error::BridgeError;
use crate::proto::{Request, Response};

/// Handles one incoming request, producing the response to write back. The
/// actual command dispatch (KV reads/writes, scan-pipeline triggers) lives
/// with whatever the daemon binary wires in; the bridge only owns framing,
/// accept, and authorization.
pub type RequestHandler =
    Arc<dyn Fn(Request, Arc<CommonContext>) -> Response + Send + Sync>;

/// Bind the client-facing listening socket. Removes a stale socket file left
/// behind by an unclean shutdown before binding.
pub fn bind(path: &Path) -> Result<UnixListener, BridgeError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}

/// Accept connections forever, handling each on its own task.
pub async fn accept_loop(
    listener: UnixListener,
    ctx: Arc<CommonContext>,
    handler: RequestHandler,
) -> Result<(), BridgeError> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let ctx = ctx.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx, handler).await {
                log::warn!("connection handler exited: {e}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    ctx: Arc<CommonContext>,
    handler: RequestHandler,
) -> Result<(), BridgeError> {
    let uid = peer_uid(&stream)?;
    while let Some(frame) = read_frame(&mut stream).await? {
        let request: Request = match serde_json::from_slice(&frame) {
            Ok(r) => r,
            Err(e) => {
                let response = Response::error(format!("malformed request: {e}"));
                write_response(&mut stream, &response).await?;
                continue;
            }
        };
        if request.is_privileged() && uid != 0 {
            let response = Response::error("uid 0 required for this command");
            write_response(&mut stream, &response).await?;
            continue;
        }
        let response = handler(request, ctx.clone());
        write_response(&mut stream, &response).await?;
    }
    Ok(())
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> Result<(), BridgeError> {
    let encoded = serde_json::to_vec(response)
        .map_err(|e| BridgeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    write_frame(stream, &encoded).await?;
    Ok(())
}

fn peer_uid(stream: &UnixStream) -> Result<u32, BridgeError> {
    let creds = getsockopt(stream, PeerCredentials)
        .map_err(|e| BridgeError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(creds.uid())
}

/// Re-export a device's udev properties as a flat `KEY=VALUE\0`-delimited
/// buffer, the format `udevadm`/libudev clients expect back from a property
/// query.
pub fn export_udev_properties(properties: &[(String, String)]) -> ByteBuffer {
    let mut buf = ByteBuffer::with_capacity(properties.iter().map(|(k, v)| k.len() + v.len() + 2).sum());
    for (key, value) in properties {
        buf.push_property(key, value);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udev_export_round_trips() {
        let props = vec![("ACTION".to_string(), "add".to_string()), ("DEVPATH".to_string(), "/block/sda".to_string())];
        let buf = export_udev_properties(&props);
        let got: Vec<&str> = buf.iter_properties().collect();
        assert_eq!(got, vec!["ACTION=add", "DEVPATH=/block/sda"]);
    }
}
