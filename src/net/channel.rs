use crate::{
    message::Message,
    net::{read_frame, FrameError},
};
use async_bincode::tokio::AsyncBincodeWriter;
use futures::SinkExt;
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{BufReader, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, watch},
};

/// How long a closing channel keeps flushing queued messages to a peer that is not reading.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Process-unique identity of a connection, for logs and bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives the lifecycle and inbound messages of a [`Channel`].
///
/// Called from the channel's read task. `received` must not do slow work inline;
/// hand it off instead.
pub trait ChannelHandler: Send + Sync + 'static {
    fn connected(&self, _channel: &Channel) {}

    fn received(&self, channel: &Channel, message: Message);

    /// Fires once, after the channel has closed.
    fn disconnected(&self, _channel: &Channel) {}
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("channel {0} is closed")]
pub struct ChannelClosed(pub ChannelId);

/// One framed connection. Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    id: ChannelId,
    peer_addr: Option<SocketAddr>,
    outbox: mpsc::UnboundedSender<Message>,
    closing: watch::Sender<bool>,
}

impl Channel {
    /// Starts the read and write tasks for `stream`. Must be called inside a tokio runtime.
    ///
    /// Inbound frames longer than `max_frame_size` drop the connection.
    pub fn open(
        stream: TcpStream,
        handler: Arc<dyn ChannelHandler>,
        max_frame_size: usize,
    ) -> Channel {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "could not set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);

        let channel = Channel {
            inner: Arc::new(Inner {
                id: ChannelId::next(),
                peer_addr,
                outbox,
                closing,
            }),
        };

        handler.connected(&channel);
        tokio::spawn(write_loop(channel.clone(), write_half, outbox_rx));
        tokio::spawn(read_loop(channel.clone(), read_half, handler, max_frame_size));
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Queues `message` for sending. Never waits on the network.
    pub fn write(&self, message: Message) -> Result<(), ChannelClosed> {
        if !self.is_open() {
            return Err(ChannelClosed(self.id()));
        }
        self.inner
            .outbox
            .send(message)
            .map_err(|_| ChannelClosed(self.id()))
    }

    pub fn is_open(&self) -> bool {
        !*self.inner.closing.borrow()
    }

    /// Closes the connection. Messages already queued are still flushed.
    pub fn close(&self) {
        if !self.inner.closing.send_replace(true) {
            tracing::trace!(channel = %self.id(), "closing channel");
        }
    }

    /// Resolves once the channel is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut closing = self.inner.closing.subscribe();
        let _ = closing.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr())
            .field("open", &self.is_open())
            .finish()
    }
}

async fn read_loop(
    channel: Channel,
    read_half: OwnedReadHalf,
    handler: Arc<dyn ChannelHandler>,
    max_frame_size: usize,
) {
    let mut reader = BufReader::new(read_half);
    let mut closing = channel.inner.closing.subscribe();

    loop {
        let frame = tokio::select! {
            _ = closing.wait_for(|closed| *closed) => break,
            frame = read_frame(&mut reader, max_frame_size) => frame,
        };
        match frame {
            Ok(Some(message)) => {
                tracing::trace!(
                    channel = %channel.id(),
                    call_id = message.call_id(),
                    kind = %message.message_type(),
                    "message received"
                );
                handler.received(&channel, message);
            }
            Err(e @ FrameError::Io(_)) => {
                tracing::error!(channel = %channel.id(), error = %e, "read failed");
                break;
            }
            Err(e) => {
                tracing::warn!(channel = %channel.id(), error = %e, "malformed frame, dropping connection");
                break;
            }
            Ok(None) => {
                tracing::trace!(channel = %channel.id(), "peer closed the connection");
                break;
            }
        }
    }

    channel.close();
    handler.disconnected(&channel);
}

async fn write_loop(
    channel: Channel,
    write_half: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Message>,
) {
    let mut sink = AsyncBincodeWriter::<_, Message, _>::from(BufWriter::new(write_half)).for_async();
    let mut closing = channel.inner.closing.subscribe();

    loop {
        let message = tokio::select! {
            _ = closing.wait_for(|closed| *closed) => break,
            message = outbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        // the message is buffered on the first poll, so a close here still drains it
        let sent = tokio::select! {
            biased;
            sent = sink.send(message) => sent,
            _ = closing.wait_for(|closed| *closed) => break,
        };
        if let Err(e) = sent {
            tracing::error!(channel = %channel.id(), error = %e, "write failed");
            channel.close();
            return;
        }
    }

    // flush what was queued before the close
    outbox.close();
    let drain = async {
        while let Some(message) = outbox.recv().await {
            sink.feed(message).await?;
        }
        sink.close().await
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(channel = %channel.id(), error = %e, "flush on close failed"),
        Err(_) => tracing::debug!(channel = %channel.id(), "peer is not reading, abandoning queued messages"),
    }
    channel.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{net::DEFAULT_MAX_FRAME_SIZE, types::Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    struct Counting {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        received: mpsc::UnboundedSender<Message>,
    }

    impl Counting {
        fn new(received: mpsc::UnboundedSender<Message>) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicUsize::new(0),
                disconnected: AtomicUsize::new(0),
                received,
            })
        }
    }

    impl ChannelHandler for Counting {
        fn connected(&self, _channel: &Channel) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn received(&self, _channel: &Channel, message: Message) {
            let _ = self.received.send(message);
        }

        fn disconnected(&self, _channel: &Channel) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn messages_flow_both_ways_and_close_once() {
        let (a, b) = pair().await;
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a_events = Counting::new(a_tx);
        let b_events = Counting::new(b_tx);
        let a = Channel::open(a, a_events.clone(), DEFAULT_MAX_FRAME_SIZE);
        let b = Channel::open(b, b_events.clone(), DEFAULT_MAX_FRAME_SIZE);
        assert_ne!(a.id(), b.id());
        assert_eq!(a_events.connected.load(Ordering::SeqCst), 1);

        a.write(Message::call(1, "echo", Value::from("hi"))).unwrap();
        assert_eq!(
            b_rx.recv().await.unwrap(),
            Message::call(1, "echo", Value::from("hi"))
        );
        b.write(Message::reply(1, Value::from("hi"))).unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), Message::reply(1, Value::from("hi")));

        a.close();
        a.close();
        assert!(!a.is_open());
        assert_eq!(a.write(Message::reply(2, Value::Nil)), Err(ChannelClosed(a.id())));

        // the peer notices too
        b.closed().await;
        assert!(b.write(Message::reply(3, Value::Nil)).is_err());

        // disconnected fires after the read task winds down
        while a_events.disconnected.load(Ordering::SeqCst) == 0
            || b_events.disconnected.load(Ordering::SeqCst) == 0
        {
            tokio::task::yield_now().await;
        }
        assert_eq!(a_events.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(b_events.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_gives_up_on_a_peer_that_stops_reading() {
        let (ours, mut theirs) = pair().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = Channel::open(ours, Counting::new(tx), DEFAULT_MAX_FRAME_SIZE);

        // far more than the socket buffers hold
        let chunk = Value::String("x".repeat(512 * 1024));
        let queued = 64;
        for call_id in 1..=queued {
            channel.write(Message::reply(call_id, chunk.clone())).unwrap();
        }
        channel.close();
        tokio::time::sleep(DRAIN_TIMEOUT + Duration::from_millis(500)).await;

        // the writer has let go of the socket, so the peer reaches the end early
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), theirs.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.len() < queued as usize * 512 * 1024);
    }

    #[test]
    fn ids_display_with_hash() {
        assert_eq!(ChannelId(12).to_string(), "#12");
    }
}
