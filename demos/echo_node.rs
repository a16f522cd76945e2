use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use clap::{Parser, ValueEnum};
use netcore::codec::{send_message, MessageTag, TaggedCodec, TaggedMessage};
use netcore::config::{parse_endpoint, NcpConfig, TcpConfig};
use netcore::connection::{Connection, TransportEvent};
use netcore::dispatch::{CodecDispatcher, HandlerRegistry, MessageDispatcher, MessageHandler};
use netcore::ncp::ncp_client;
use netcore::ncp::ncp_server::NcpServer;
use netcore::tcp::tcp_endpoint::{self, TcpServer};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Transport {
    Tcp,
    Ncp,
}

#[derive(Parser)]
struct Args {
    #[clap(value_enum)]
    transport: Transport,

    /// run as server instead of connecting to one
    #[clap(long, default_value_t = false)]
    server: bool,

    #[clap(long, default_value = "localhost")]
    host: String,

    #[clap(long, default_value_t = 9810)]
    port: u16,

    /// number of messages a client sends
    #[clap(long, default_value_t = 10)]
    count: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Debug, Clone)]
enum EchoMessage {
    Say(String),
    Echo(String),
}

impl EchoMessage {
    const SAY: MessageTag = MessageTag(1);
    const ECHO: MessageTag = MessageTag(2);
}

impl TaggedMessage for EchoMessage {
    fn tag(&self) -> MessageTag {
        match self {
            EchoMessage::Say(_) => Self::SAY,
            EchoMessage::Echo(_) => Self::ECHO,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        match self {
            EchoMessage::Say(s) | EchoMessage::Echo(s) => buf.put_slice(s.as_bytes()),
        }
    }

    fn deser(tag: MessageTag, buf: &mut impl Buf) -> anyhow::Result<Option<Self>> {
        let text = String::from_utf8(buf.copy_to_bytes(buf.remaining()).to_vec())?;
        match tag {
            Self::SAY => Ok(Some(EchoMessage::Say(text))),
            Self::ECHO => Ok(Some(EchoMessage::Echo(text))),
            _ => Ok(None),
        }
    }
}

struct SayHandler;

#[async_trait]
impl MessageHandler<EchoMessage> for SayHandler {
    async fn on_message(&self, message: EchoMessage, sender: Arc<dyn Connection>) -> anyhow::Result<()> {
        let text = match message {
            EchoMessage::Say(text) => text,
            other => bail!("unexpected message {:?}", other),
        };
        info!("{:?} says {:?}", sender.remote_addr(), text);

        send_message(&*sender, &TaggedCodec::<EchoMessage>::new(), &EchoMessage::Echo(text)).await?;
        Ok(())
    }
}

struct EchoHandler {
    received: mpsc::Sender<String>,
}

#[async_trait]
impl MessageHandler<EchoMessage> for EchoHandler {
    async fn on_message(&self, message: EchoMessage, _sender: Arc<dyn Connection>) -> anyhow::Result<()> {
        let text = match message {
            EchoMessage::Echo(text) => text,
            other => bail!("unexpected message {:?}", other),
        };
        self.received.send(text).await?;
        Ok(())
    }
}

async fn new_dispatcher(handler: Arc<dyn MessageHandler<EchoMessage>>, tag: MessageTag) -> anyhow::Result<Arc<dyn MessageDispatcher>> {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(tag, handler).await?;
    Ok(Arc::new(CodecDispatcher::new(TaggedCodec::<EchoMessage>::new(), registry)))
}

async fn log_events(mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Disconnected { remote_addr, reason } => info!("{:?} disconnected: {}", remote_addr, reason),
            other => warn!("{:?}", other),
        }
    }
}

async fn run_server(transport: Transport, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
    let dispatcher = new_dispatcher(Arc::new(SayHandler), EchoMessage::SAY).await?;

    match transport {
        Transport::Tcp => {
            let (mut server, events) = TcpServer::listen(addr, Arc::new(TcpConfig::new()), dispatcher, &cancel).await?;
            tokio::spawn(log_events(events));
            while let Some(connection) = server.accept().await {
                info!("accepted connection from {:?}", connection.remote_addr());
            }
        }
        Transport::Ncp => {
            let (mut server, events) = NcpServer::listen(addr, Arc::new(NcpConfig::new()), dispatcher, &cancel).await?;
            tokio::spawn(log_events(events));
            while let Some(connection) = server.accept().await {
                info!("accepted connection from {:?} with client id {}", connection.remote_addr(), connection.client_id());
            }
        }
    }
    Ok(())
}

async fn run_client(transport: Transport, addr: SocketAddr, count: u32, cancel: CancellationToken) -> anyhow::Result<()> {
    let (received_sender, mut received) = mpsc::channel(16);
    let dispatcher = new_dispatcher(Arc::new(EchoHandler { received: received_sender }), EchoMessage::ECHO).await?;

    let connection: Arc<dyn Connection> = match transport {
        Transport::Tcp => {
            let (connection, events) = tcp_endpoint::connect(addr, &TcpConfig::new(), dispatcher, &cancel).await?;
            tokio::spawn(log_events(events));
            connection
        }
        Transport::Ncp => {
            let (connection, events) = ncp_client::connect(addr, Arc::new(NcpConfig::new()), dispatcher, &cancel).await?;
            tokio::spawn(log_events(events));
            connection
        }
    };
    info!("connected to {:?}", connection.remote_addr());

    let codec = TaggedCodec::<EchoMessage>::new();
    for i in 0..count {
        send_message(&*connection, &codec, &EchoMessage::Say(format!("message #{}", i))).await?;

        let echoed = tokio::time::timeout(Duration::from_secs(5), received.recv()).await
            .map_err(|_| anyhow!("no echo within 5 seconds"))?
            .ok_or_else(|| anyhow!("connection closed"))?;
        info!("echo: {:?}", echoed);
    }

    connection.disconnect().await;
    Ok(())
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let addr = parse_endpoint(&args.host, args.port)?;
    let cancel = CancellationToken::new();

    let node = async {
        if args.server {
            run_server(args.transport, addr, cancel.clone()).await
        }
        else {
            run_client(args.transport, addr, args.count, cancel.clone()).await
        }
    };

    select! {
        result = node => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            cancel.cancel();
            Ok(())
        }
    }
}
