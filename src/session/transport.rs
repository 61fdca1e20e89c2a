//! The seam between the session state machine and the socket it drives.

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

/// A bidirectional message stream; `WebSocketStream` is the real one.
pub trait WsTransport:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

impl<T> WsTransport for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

pub type BoxTransport = Box<dyn WsTransport>;

/// Opens one transport per connection attempt.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<BoxTransport, WsError>>;
}

/// Plain `ws://` connector backed by tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn connect(&self, url: &Url) -> BoxFuture<'static, Result<BoxTransport, WsError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (stream, _) = connect_async(url.as_str()).await?;
            Ok(Box::new(stream) as BoxTransport)
        })
    }
}
