use crate::{
    config::ClientConfig,
    error::RpcError,
    message::{CallId, Message, Payload, NO_REPLY},
    net::channel::{Channel, ChannelHandler},
    types::{Decode, Encode, Value},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    sync::oneshot,
};

/// A request object that knows its method name and how to read the reply.
pub trait Command {
    type Output: Decode;

    fn name(&self) -> &str;
    fn body(&self) -> Value;
}

/// Request/response calls multiplexed over one connection.
///
/// Calls may be issued concurrently from `&self`; answers are matched back to their
/// callers by call id, so they can arrive in any order.
pub struct Client {
    channel: Channel,
    calls: Arc<PendingCalls>,
    config: ClientConfig,
    closed: AtomicBool,
}

impl Client {
    pub async fn open(host: &str, port: u16) -> Result<Self, RpcError> {
        Self::connect((host, port)).await
    }

    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, RpcError> {
        Self::connect_with(addr, ClientConfig::default()).await
    }

    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<Self, RpcError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
            .and_then(|connected| connected)
            .map_err(RpcError::Connect)?;
        let calls = Arc::new(PendingCalls::new(config.max_pending));
        let channel = Channel::open(stream, calls.clone(), config.max_frame_size);
        Ok(Self {
            channel,
            calls,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Calls `name` and waits for its answer, up to the configured call timeout.
    pub async fn send<B: Encode>(&self, name: &str, body: B) -> Result<Value, RpcError> {
        self.send_timeout(name, body, self.config.call_timeout).await
    }

    /// Calls `name` and waits for its answer, up to `timeout` (`None` waits forever).
    pub async fn send_timeout<B: Encode>(
        &self,
        name: &str,
        body: B,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }

        let (call_id, mut answer) = self.calls.register(name)?;
        let _pending = PendingGuard {
            calls: &self.calls,
            call_id,
        };

        tracing::trace!(channel = %self.channel.id(), call_id, method = name, "sending call");
        if let Err(e) = self.channel.write(Message::call(call_id, name, B::encode(body))) {
            return Err(RpcError::Connection(e.to_string()));
        }

        let Some(timeout) = timeout else {
            return flatten(answer.await);
        };
        match tokio::time::timeout(timeout, &mut answer).await {
            Ok(outcome) => flatten(outcome),
            Err(_) => {
                if self.calls.remove(call_id) {
                    tracing::debug!(channel = %self.channel.id(), call_id, method = name, ?timeout, "call timed out");
                    Err(RpcError::Timeout(timeout))
                } else {
                    // the answer got in first
                    flatten(answer.await)
                }
            }
        }
    }

    /// Like [`send`](Self::send), decoding the answer into `R`.
    pub async fn call<B: Encode, R: Decode>(&self, name: &str, body: B) -> Result<R, RpcError> {
        let value = self.send(name, body).await?;
        Ok(R::decode(value)?)
    }

    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, RpcError> {
        let value = self.send(command.name(), command.body()).await?;
        Ok(C::Output::decode(value)?)
    }

    /// Sends a call with id 0. The server never answers it, success or failure.
    pub fn notify<B: Encode>(&self, name: &str, body: B) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        self.channel
            .write(Message::call(NO_REPLY, name, B::encode(body)))
            .map_err(|e| RpcError::Connection(e.to_string()))
    }

    /// Closes the connection; outstanding calls fail with a connection error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.channel.close();
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.channel.is_open()
    }

    /// Resolves once the connection is gone, whoever closed it.
    pub async fn closed(&self) {
        self.channel.closed().await
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.channel.peer_addr()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.channel.close();
    }
}

fn flatten(
    outcome: Result<Result<Value, RpcError>, oneshot::error::RecvError>,
) -> Result<Value, RpcError> {
    outcome.unwrap_or_else(|_| Err(RpcError::Connection("call abandoned".to_owned())))
}

struct PendingCall {
    method: String,
    created_at: Instant,
    answer: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Default)]
struct CallTable {
    next_id: CallId,
    calls: HashMap<CallId, PendingCall>,
}

impl CallTable {
    /// Next id after the last one handed out, skipping 0 and ids still pending.
    fn allocate(&mut self) -> CallId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != NO_REPLY && !self.calls.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }
}

/// Outstanding calls on one connection.
///
/// Every entry leaves the table exactly once: by its answer, its timeout, a dropped
/// caller, or the connection going away. Whoever removes it resolves it.
struct PendingCalls {
    table: Mutex<CallTable>,
    max_pending: usize,
}

impl PendingCalls {
    fn new(max_pending: usize) -> Self {
        Self {
            table: Mutex::new(CallTable::default()),
            max_pending: max_pending.clamp(1, u32::MAX as usize - 1),
        }
    }

    fn register(
        &self,
        method: &str,
    ) -> Result<(CallId, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let mut table = self.table.lock();
        if table.calls.len() >= self.max_pending {
            tracing::warn!(max_pending = self.max_pending, "too many pending calls, refusing new call");
            return Err(RpcError::TooManyPending(self.max_pending));
        }
        let call_id = table.allocate();
        let (answer, rx) = oneshot::channel();
        table.calls.insert(
            call_id,
            PendingCall {
                method: method.to_owned(),
                created_at: Instant::now(),
                answer,
            },
        );
        Ok((call_id, rx))
    }

    /// Completes `call_id` with `outcome`. False if it was no longer pending.
    fn resolve(&self, call_id: CallId, outcome: Result<Value, RpcError>) -> bool {
        let Some(call) = self.table.lock().calls.remove(&call_id) else {
            return false;
        };
        tracing::trace!(
            call_id,
            method = %call.method,
            elapsed = ?call.created_at.elapsed(),
            ok = outcome.is_ok(),
            "call resolved"
        );
        // the caller may have given up already
        let _ = call.answer.send(outcome);
        true
    }

    /// Drops `call_id` without answering it. False if it was no longer pending.
    fn remove(&self, call_id: CallId) -> bool {
        self.table.lock().calls.remove(&call_id).is_some()
    }

    fn fail_all(&self, reason: &str) -> usize {
        let calls: Vec<PendingCall> = self.table.lock().calls.drain().map(|(_, c)| c).collect();
        let failed = calls.len();
        for call in calls {
            let _ = call.answer.send(Err(RpcError::Connection(reason.to_owned())));
        }
        failed
    }

    fn len(&self) -> usize {
        self.table.lock().calls.len()
    }
}

impl ChannelHandler for PendingCalls {
    fn connected(&self, channel: &Channel) {
        tracing::debug!(channel = %channel.id(), peer = ?channel.peer_addr(), "connected to server");
    }

    fn received(&self, channel: &Channel, message: Message) {
        let call_id = message.call_id();
        let outcome = match message.into_payload() {
            Payload::Reply(result) => Ok(result),
            Payload::Error(error) => Err(RpcError::Remote(error)),
            Payload::Call(_) => {
                tracing::warn!(channel = %channel.id(), call_id, "server sent a CALL, dropping");
                return;
            }
        };
        if call_id == NO_REPLY || !self.resolve(call_id, outcome) {
            tracing::warn!(channel = %channel.id(), call_id, "no pending call for answer, dropping");
        }
    }

    fn disconnected(&self, channel: &Channel) {
        let failed = self.fail_all("connection closed");
        tracing::debug!(channel = %channel.id(), failed, "disconnected from server");
    }
}

/// Takes the call out of the table if the caller stops waiting for any reason.
struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    call_id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.remove(self.call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RemoteError;

    #[test]
    fn ids_skip_zero_and_pending() {
        let calls = PendingCalls::new(16);
        calls.table.lock().next_id = u32::MAX - 1;
        let (a, _rx_a) = calls.register("a").unwrap();
        assert_eq!(a, u32::MAX);

        // wrap: 0 is skipped
        let (b, _rx_b) = calls.register("b").unwrap();
        assert_eq!(b, 1);

        // wrap again onto ids still pending
        calls.table.lock().next_id = u32::MAX - 1;
        let (c, _rx_c) = calls.register("c").unwrap();
        assert_eq!(c, 2);
    }

    #[test]
    fn resolves_at_most_once() {
        let calls = PendingCalls::new(16);
        let (id, mut rx) = calls.register("echo").unwrap();
        assert!(calls.resolve(id, Ok(Value::from("hi"))));
        assert!(!calls.resolve(id, Ok(Value::from("late"))));
        assert!(!calls.remove(id));
        assert_eq!(rx.try_recv().unwrap().unwrap(), Value::from("hi"));
    }

    #[test]
    fn timeout_removal_beats_late_answer() {
        let calls = PendingCalls::new(16);
        let (id, _rx) = calls.register("slow").unwrap();
        assert!(calls.remove(id));
        assert!(!calls.resolve(id, Err(RpcError::Remote(RemoteError::new("late")))));
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn bounded_table() {
        let calls = PendingCalls::new(2);
        let _a = calls.register("a").unwrap();
        let _b = calls.register("b").unwrap();
        assert!(matches!(calls.register("c"), Err(RpcError::TooManyPending(2))));
    }

    #[test]
    fn fail_all_answers_everyone() {
        let calls = PendingCalls::new(16);
        let (_, mut rx_a) = calls.register("a").unwrap();
        let (_, mut rx_b) = calls.register("b").unwrap();
        assert_eq!(calls.fail_all("gone"), 2);
        assert!(rx_a.try_recv().unwrap().unwrap_err().is_connection());
        assert!(rx_b.try_recv().unwrap().unwrap_err().is_connection());
        assert_eq!(calls.len(), 0);
    }
}
