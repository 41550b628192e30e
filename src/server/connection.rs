use anyhow::{Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use super::registry::ClientRegistry;
use crate::config::OperNetworks;
use crate::core::{ClientId, ReplySink, WhoisRequest, WhoisTarget};
use crate::services::EnrichmentDispatcher;
use crate::{log_debug, log_info};

pub const RPL_ENDOFWHOIS: u16 = 318;
pub const ERR_UNKNOWNCOMMAND: u16 = 421;

/// Longest line accepted from a client, excluding the terminator.
/// Longer lines are discarded up to the next newline without being buffered.
pub const MAX_LINE_LENGTH: usize = 512;

/// Shared state every connection needs
pub struct ConnectionContext {
    pub registry: Arc<ClientRegistry>,
    pub dispatcher: Arc<EnrichmentDispatcher>,
    pub oper_networks: OperNetworks,
    pub idle_timeout: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Whois { target: String, ip: Option<String> },
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Command::Empty;
        };

        match verb.to_ascii_uppercase().as_str() {
            "WHOIS" => match parts.next() {
                Some(target) => Command::Whois {
                    target: target.to_string(),
                    ip: parts.next().map(str::to_string),
                },
                None => Command::Unknown(verb.to_string()),
            },
            "QUIT" => Command::Quit,
            _ => Command::Unknown(verb.to_string()),
        }
    }
}

pub enum LineEvent {
    Line(String),
    TooLong,
    Closed,
}

/// Line reader with a bounded buffer
///
/// The pending bytes live in the reader, so dropping a `next_line` future
/// loses nothing.
pub struct LineReader<R> {
    inner: R,
    codec: LinesCodec,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_length: usize) -> Self {
        Self {
            inner,
            codec: LinesCodec::new_with_max_length(max_length),
            buf: BytesMut::with_capacity(max_length),
        }
    }

    pub async fn next_line(&mut self) -> Result<LineEvent> {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(line)) => return Ok(LineEvent::Line(line)),
                Ok(None) => {}
                Err(LinesCodecError::MaxLineLengthExceeded) => return Ok(LineEvent::TooLong),
                Err(e) => return Err(anyhow::anyhow!("Failed to read request: {}", e)),
            }

            let read = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .context("Failed to read request")?;
            if read == 0 {
                // A final line without terminator still counts
                return match self.codec.decode_eof(&mut self.buf) {
                    Ok(Some(line)) => Ok(LineEvent::Line(line)),
                    _ => Ok(LineEvent::Closed),
                };
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ConnectionContext>,
) -> Result<()> {
    stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (id, nick) = ctx.registry.register(outbound_tx);
    let is_oper = ctx.oper_networks.contains(addr.ip());
    log_debug!("{} from {} is {} (oper: {})", id, addr, nick, is_oper);

    let result = run_session(stream, id, is_oper, outbound_rx, &ctx).await;

    // Lookups still in flight for this id are dropped at delivery time
    ctx.registry.unregister(id);
    log_info!("Connection from {} closed", addr);
    result
}

async fn run_session(
    stream: TcpStream,
    id: ClientId,
    is_oper: bool,
    mut outbound: mpsc::UnboundedReceiver<String>,
    ctx: &ConnectionContext,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = LineReader::new(reader, MAX_LINE_LENGTH);

    loop {
        tokio::select! {
            line = tokio::time::timeout(ctx.idle_timeout, lines.next_line()) => {
                let line = match line {
                    Err(_) => {
                        log_debug!("{} idle for {:?}, closing", id, ctx.idle_timeout);
                        break;
                    }
                    Ok(event) => match event? {
                        LineEvent::Line(line) => line,
                        LineEvent::TooLong => {
                            log_debug!("{} sent a line over {} bytes", id, MAX_LINE_LENGTH);
                            continue;
                        }
                        LineEvent::Closed => break,
                    },
                };

                if !handle_command(Command::parse(&line), id, is_oper, ctx) {
                    break;
                }
            }
            Some(reply) = outbound.recv() => {
                writer
                    .write_all(reply.as_bytes())
                    .await
                    .context("Failed to write response")?;
            }
        }
    }

    // Flush whatever the last command queued
    while let Ok(reply) = outbound.try_recv() {
        writer.write_all(reply.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Returns `false` once the client asked to leave
fn handle_command(command: Command, id: ClientId, is_oper: bool, ctx: &ConnectionContext) -> bool {
    match command {
        Command::Empty => true,
        Command::Quit => false,
        Command::Whois { target, ip } => {
            let request = WhoisRequest {
                requester: id,
                requester_is_oper: is_oper,
                target: WhoisTarget::user(target.as_str(), ip.as_deref()),
            };
            let outcome = ctx.dispatcher.enrich(&request);
            log_debug!("WHOIS {} by {}: {:?}", target, id, outcome);

            ctx.registry.deliver(
                id,
                RPL_ENDOFWHOIS,
                &format!("{} :End of /WHOIS list.", target),
            );
            true
        }
        Command::Unknown(verb) => {
            ctx.registry
                .deliver(id, ERR_UNKNOWNCOMMAND, &format!("{} :Unknown command", verb));
            true
        }
    }
}
