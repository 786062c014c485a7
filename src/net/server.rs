use crate::{
    config::ServerConfig,
    error::{root_cause, DispatchError, ErrorTranslator},
    message::{codes, CallRequest, Message, MessageType, Payload, ProtocolError, RemoteError},
    method::{Method, MethodRegistry, RegistryError},
    net::channel::{Channel, ChannelHandler, ChannelId},
    pool::WorkerPool,
    types::Value,
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, ToSocketAddrs},
    sync::watch,
    task::JoinHandle,
};

/// Collects methods and error translators, then serves them over TCP.
#[derive(Default)]
pub struct Server {
    registry: MethodRegistry,
    translator: ErrorTranslator,
    config: ServerConfig,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn register<M: Method>(&mut self, name: &str, method: M) -> Result<(), RegistryError> {
        self.registry.register(name, method)
    }

    /// Where backing-store integrations plug in their error matchers.
    pub fn translator_mut(&mut self) -> &mut ErrorTranslator {
        &mut self.translator
    }

    /// Freezes the registry and starts accepting connections on `addr`.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let Server {
            registry,
            translator,
            config,
        } = self;

        tracing::info!(
            addr = %local_addr,
            workers = config.workers,
            methods = ?registry.names().collect::<Vec<_>>(),
            "server listening"
        );

        let dispatcher = Arc::new(Dispatcher {
            registry: Arc::new(registry),
            translator: Arc::new(translator),
            pool: WorkerPool::new(config.workers),
            channels: Mutex::new(HashMap::new()),
            max_connections: config.max_connections,
            max_frame_size: config.max_frame_size,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, dispatcher.clone(), shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            dispatcher,
            task,
        })
    }

    /// Serves on every interface until the accept loop ends.
    pub async fn serve_tcp(self, port: u16) -> io::Result<()> {
        let handle = self.bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        handle.join().await;
        Ok(())
    }
}

/// A running server. Dropping it leaves the server running; call [`stop`](Self::stop).
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    dispatcher: Arc<Dispatcher>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live connections.
    pub fn connections(&self) -> usize {
        self.dispatcher.channels.lock().len()
    }

    /// Stops accepting, closes every connection, and waits for the accept loop.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "accept loop ended abnormally");
        }
        self.dispatcher.close_all();
        tracing::info!(addr = %self.local_addr, "server stopped");
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "accept loop ended abnormally");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                if dispatcher.at_capacity() {
                    tracing::warn!(%addr, "connection limit reached, refusing client");
                    continue;
                }
                Channel::open(stream, dispatcher.clone(), dispatcher.max_frame_size);
            }
            Err(e) => {
                // usually fd exhaustion; back off instead of spinning
                tracing::error!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Per-server intake for every connection: hands CALLs to the worker pool and keeps
/// track of live channels.
struct Dispatcher {
    registry: Arc<MethodRegistry>,
    translator: Arc<ErrorTranslator>,
    pool: WorkerPool,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    max_connections: Option<usize>,
    max_frame_size: usize,
}

impl Dispatcher {
    fn at_capacity(&self) -> bool {
        self.max_connections
            .is_some_and(|max| self.channels.lock().len() >= max)
    }

    fn close_all(&self) {
        let channels: Vec<Channel> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.close();
        }
    }
}

impl ChannelHandler for Dispatcher {
    fn connected(&self, channel: &Channel) {
        tracing::debug!(channel = %channel.id(), peer = ?channel.peer_addr(), "client connected");
        self.channels.lock().insert(channel.id(), channel.clone());
    }

    fn received(&self, channel: &Channel, message: Message) {
        match message.message_type() {
            MessageType::Call => {
                let job = Job {
                    registry: self.registry.clone(),
                    translator: self.translator.clone(),
                    channel: channel.clone(),
                    message,
                };
                self.pool.submit(job.run());
            }
            MessageType::Reply | MessageType::Error => {
                tracing::warn!(
                    channel = %channel.id(),
                    call_id = message.call_id(),
                    kind = %message.message_type(),
                    "unexpected message from client, dropping"
                );
            }
        }
    }

    fn disconnected(&self, channel: &Channel) {
        self.channels.lock().remove(&channel.id());
        tracing::debug!(channel = %channel.id(), "client disconnected");
    }
}

/// One CALL, executed on the worker pool.
struct Job {
    registry: Arc<MethodRegistry>,
    translator: Arc<ErrorTranslator>,
    channel: Channel,
    message: Message,
}

impl Job {
    async fn run(self) {
        let call_id = self.message.call_id();
        let outcome = self.execute().await;

        if let Err(e) = &outcome {
            tracing::warn!(channel = %self.channel.id(), call_id, error = %e, "call failed");
        }
        if !self.message.expects_reply() {
            return;
        }

        let answer = match outcome {
            Ok(result) => Message::reply(call_id, result),
            Err(e) => Message::error(call_id, e.into_remote()),
        };
        if let Err(e) = self.channel.write(answer) {
            tracing::debug!(call_id, error = %e, "client left before the answer was sent");
        }
    }

    async fn execute(&self) -> Result<Value, DispatchError> {
        let Payload::Call(payload) = self.message.payload() else {
            return Err(ProtocolError("expected a CALL message".to_owned()).into());
        };
        let CallRequest { name, body } = CallRequest::parse(payload)?;
        let method = self
            .registry
            .lookup(&name)
            .ok_or_else(|| DispatchError::MethodNotFound(name.clone()))?;

        tracing::trace!(
            channel = %self.channel.id(),
            call_id = self.message.call_id(),
            method = %name,
            %body,
            "invoking method"
        );

        let invocation = method.invoke(&self.channel, &self.message, body);
        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                tracing::debug!(method = %name, cause = %root_cause(&e), "method execution failed");
                Err(DispatchError::Invocation(self.translator.translate(&e)))
            }
            Err(_) => {
                tracing::error!(method = %name, "method panicked");
                Err(DispatchError::Invocation(
                    RemoteError::new(format!("method {name} panicked")).with_code(codes::PANIC),
                ))
            }
        }
    }
}
