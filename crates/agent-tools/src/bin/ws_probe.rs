use std::env;
use std::fmt;

use agent_proto::{AuthPayload, Message};
use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse(env::args().skip(1))?;
    println!("ws_probe start: {args}");

    let (stream, response) =
        connect_async(&args.url).await.with_context(|| format!("websocket connect failed: {}", args.url))?;
    println!("connected: http_status={}", response.status());

    let (mut write, mut read) = stream.split();

    let auth = Message::Auth(AuthPayload {
        agent_id: args.agent_id.clone(),
        token: args.token.clone(),
        hostname: "ws_probe".to_string(),
        os_info: "ws_probe diagnostic client".to_string(),
    });
    let auth_bytes = agent_proto::encode(&auth).context("failed to encode AUTH")?;
    write.send(WsMessage::Binary(auth_bytes.into())).await.context("failed to send AUTH")?;
    println!("sent AUTH as agent_id={}", args.agent_id);

    let mut received = 0usize;
    loop {
        if args.max_frames > 0 && received >= args.max_frames {
            println!("reached --max-frames={}, closing", args.max_frames);
            break;
        }

        let Some(next) = read.next().await else {
            println!("server closed the connection");
            break;
        };

        match next.context("websocket read failed")? {
            WsMessage::Binary(bytes) => {
                received += 1;
                match agent_proto::decode(&bytes) {
                    Ok(Message::Frame(frame)) => println!(
                        "#{received} FRAME seq={} ts_ms={} bytes={}",
                        frame.seq,
                        frame.ts_ms,
                        frame.jpeg.len()
                    ),
                    Ok(message) => println!("#{received} {message:?}"),
                    Err(err) => println!("#{received} <malformed frame: {err}>"),
                }
            }
            WsMessage::Close(frame) => {
                println!("server sent close: {frame:?}");
                break;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            other => println!("ignoring non-binary message: {other:?}"),
        }
    }

    write.send(WsMessage::Close(None)).await.ok();
    Ok(())
}

#[derive(Debug, Clone)]
struct Args {
    url: String,
    agent_id: String,
    token: String,
    max_frames: usize,
}

impl Args {
    fn parse<I>(mut it: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut url = None;
        let mut agent_id = None;
        let mut token = None;
        let mut max_frames = 0usize;

        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--url" => url = it.next(),
                "--agent-id" => agent_id = it.next(),
                "--token" => token = it.next(),
                "--max-frames" => {
                    let raw = it.next().context("missing value for --max-frames")?;
                    max_frames = raw.parse::<usize>().context("invalid --max-frames value")?;
                }
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => bail!("unknown argument: {arg}"),
            }
        }

        Ok(Self {
            url: url.context("missing --url")?,
            agent_id: agent_id.context("missing --agent-id")?,
            token: token.context("missing --token")?,
            max_frames,
        })
    }
}

fn print_usage() {
    eprintln!("usage: ws_probe --url wss://HOST/path --agent-id ID --token TOKEN [--max-frames 0]");
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "url={}, agent_id={}, max_frames={}", self.url, self.agent_id, self.max_frames)
    }
}
