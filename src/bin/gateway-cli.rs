use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{FramedRead, FramedWrite};

use ant_gateway::net::control::{PING, RELOAD};
use ant_gateway::net::frame::FrameCodec;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for ant-gateway", long_about = None)]
struct Cli {
    /// Gateway address.
    #[arg(short, long, default_value = "127.0.0.1:9501")]
    addr: SocketAddr,

    /// Transport the gateway serves.
    #[arg(short, long, value_enum, default_value_t = Transport::Tcp)]
    transport: Transport,

    /// Seconds to wait for each reply.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Tcp,
    Udp,
    Http,
    Ws,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the gateway answers
    Ping,
    /// Gracefully reload every worker
    Reload,
    /// Invoke a route
    Call {
        /// Route target as `controller/method`
        route: String,

        /// Params as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Ask for an empty acknowledgement instead of the result
        #[arg(long)]
        no_ack: bool,

        /// Run the route on the background task pool
        #[arg(long)]
        offload: bool,

        /// With --offload, also wait for the task result
        #[arg(long, requires = "offload")]
        wait: bool,
    },
}

/// One request/response exchange over the chosen transport.
enum Session {
    Tcp {
        reader: FramedRead<tokio::net::tcp::OwnedReadHalf, FrameCodec>,
        writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, FrameCodec>,
    },
    Udp(UdpSocket, SocketAddr),
    Ws(tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>),
}

impl Session {
    async fn open(transport: Transport, addr: SocketAddr) -> CliResult<Self> {
        match transport {
            Transport::Tcp => {
                let (read_half, write_half) = TcpStream::connect(addr).await?.into_split();
                Ok(Self::Tcp {
                    reader: FramedRead::new(read_half, FrameCodec::default()),
                    writer: FramedWrite::new(write_half, FrameCodec::default()),
                })
            }
            Transport::Udp => {
                let socket = UdpSocket::bind(if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?;
                Ok(Self::Udp(socket, addr))
            }
            Transport::Ws => {
                let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await?;
                Ok(Self::Ws(stream))
            }
            Transport::Http => Err("HTTP has no session".into()),
        }
    }

    async fn send(&mut self, payload: Bytes) -> CliResult<()> {
        match self {
            Self::Tcp { writer, .. } => writer.send(payload).await?,
            Self::Udp(socket, addr) => {
                socket.send_to(&payload, *addr).await?;
            }
            Self::Ws(stream) => {
                let text = String::from_utf8(payload.to_vec())?;
                stream.send(Message::text(text)).await?;
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> CliResult<Bytes> {
        match self {
            Self::Tcp { reader, .. } => match reader.next().await {
                Some(frame) => Ok(frame?),
                None => Err("connection closed".into()),
            },
            Self::Udp(socket, _) => {
                let mut buf = vec![0u8; 64 * 1024];
                let (len, _) = socket.recv_from(&mut buf).await?;
                buf.truncate(len);
                Ok(Bytes::from(buf))
            }
            Self::Ws(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Bytes::copy_from_slice(text.as_str().as_bytes())),
                    Some(Ok(Message::Binary(data))) => return Ok(data),
                    Some(Ok(Message::Close(_))) | None => return Err("connection closed".into()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Commands::Ping if cli.transport == Transport::Http => {
            let res = reqwest::Client::new()
                .get(format!("http://{}/ant-ping", cli.addr))
                .timeout(timeout)
                .send()
                .await?;
            println!("{}", res.text().await?);
        }
        Commands::Ping => {
            let mut session = Session::open(cli.transport, cli.addr).await?;
            session.send(Bytes::from_static(PING)).await?;
            print_raw(tokio::time::timeout(timeout, session.recv()).await??);
        }
        Commands::Reload if cli.transport == Transport::Http => {
            return Err("HTTP servers are reloaded with SIGHUP or a config change".into());
        }
        Commands::Reload => {
            let mut session = Session::open(cli.transport, cli.addr).await?;
            session.send(Bytes::from_static(RELOAD)).await?;
            print_raw(tokio::time::timeout(timeout, session.recv()).await??);
        }
        Commands::Call {
            route,
            params,
            no_ack,
            offload,
            wait,
        } => {
            let (controller, method) = route
                .trim_matches('/')
                .split_once('/')
                .ok_or("route must look like controller/method")?;
            let mut params: Map<String, Value> = serde_json::from_str(&params)?;
            if no_ack {
                params.insert("_recv".into(), Value::from(0));
            }
            if offload {
                params.insert("_task".into(), Value::from(1));
            }

            if cli.transport == Transport::Http {
                if wait {
                    return Err("HTTP cannot deliver task results, --wait needs a stream or UDP".into());
                }
                let res = reqwest::Client::new()
                    .post(format!("http://{}/{controller}/{method}", cli.addr))
                    .json(&params)
                    .timeout(timeout)
                    .send()
                    .await?;
                let status = res.status();
                let body = res.bytes().await?;
                if !status.is_success() {
                    eprintln!("Error: gateway returned status {status}");
                }
                print_envelope(&body)?;
                return Ok(());
            }

            params.insert("a".into(), Value::from(controller));
            params.insert("m".into(), Value::from(method));
            let mut session = Session::open(cli.transport, cli.addr).await?;
            session.send(Bytes::from(serde_json::to_vec(&params)?)).await?;
            print_envelope(&tokio::time::timeout(timeout, session.recv()).await??)?;
            if wait {
                print_envelope(&tokio::time::timeout(timeout, session.recv()).await??)?;
            }
        }
    }

    Ok(())
}

fn print_raw(reply: Bytes) {
    println!("{}", String::from_utf8_lossy(&reply));
}

fn print_envelope(reply: &[u8]) -> CliResult<()> {
    match serde_json::from_slice::<Value>(reply) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", String::from_utf8_lossy(reply)),
    }
    Ok(())
}
