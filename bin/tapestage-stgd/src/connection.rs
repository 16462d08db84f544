//! Client connections
//!
//! One task per connection: read a single request, hand it to the
//! coordinator, then write every reply until the terminal status.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tapestage_common::StatusCode;
use tapestage_proto::{ProtoError, ProtoResult, Reply, RequestFrame, ServerCodec};
use tapestage_stager::{ClientHandle, StagerEvent};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug)]
pub struct ConnectionSettings {
    pub read_timeout: Duration,
    pub max_message_size: usize,
}

pub async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<StagerEvent>,
    settings: ConnectionSettings,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    let _ = events.send(StagerEvent::ConnectionOpened);
                    if let Err(e) = serve(stream, &events, settings).await {
                        warn!("Connection from {} ended: {}", peer, e);
                    }
                    let _ = events.send(StagerEvent::ConnectionClosed);
                });
            }
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn refuse<S>(framed: &mut Framed<S, ServerCodec>, message: String) -> ProtoResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Reply::Error(message)).await?;
    framed.send(Reply::Status(StatusCode::UserError)).await
}

pub async fn serve<S>(
    stream: S,
    events: &mpsc::UnboundedSender<StagerEvent>,
    settings: ConnectionSettings,
) -> ProtoResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, ServerCodec::new(settings.max_message_size));
    let frame = match tokio::time::timeout(settings.read_timeout, framed.next()).await {
        Err(_) => {
            debug!("Client sent nothing within {:?}", settings.read_timeout);
            return Ok(());
        }
        Ok(None) => return Ok(()),
        Ok(Some(Err(e))) if e.is_peer_error() => {
            warn!("Rejected request: {}", e);
            return refuse(&mut framed, e.to_string()).await;
        }
        Ok(Some(frame)) => frame?,
    };
    if let Err(e) = frame.message_type().check_magic(frame.magic) {
        warn!("Rejected request: {}", e);
        return refuse(&mut framed, e.to_string()).await;
    }

    let RequestFrame {
        magic,
        api,
        request,
    } = frame;
    let (client, mut replies) = ClientHandle::channel(request.client().clone(), magic, api);
    if events
        .send(StagerEvent::Request { client, request })
        .is_err()
    {
        return Err(ProtoError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "stager stopped",
        )));
    }

    while let Some(reply) = replies.recv().await {
        let terminal = reply.is_terminal();
        framed.send(reply).await?;
        if terminal {
            break;
        }
    }
    Ok(())
}
