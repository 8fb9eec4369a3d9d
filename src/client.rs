use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::sleep,
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    frame::{self, Frame, Identity},
};

const RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// What the user sees and types for one server session. A fresh session
/// starts after every reconnect; the server hands out a new identity each
/// time.
#[derive(Default)]
struct Session {
    my_identity: Option<Identity>,
    destination: Option<Identity>,
    peers: Vec<Identity>,
    list_received: bool,
}

enum SessionEnd {
    UserQuit,
    ServerClosed,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        let (mut reader, mut writer) = connect_with_backoff(args.server).await?;
        let outcome = run_session(&mut reader, &mut writer, &mut stdin, &mut input).await?;
        shutdown_connection(&mut writer).await;

        match outcome {
            SessionEnd::UserQuit => return Ok(()),
            SessionEnd::ServerClosed => {
                write_stdout("*** connection lost, reconnecting").await?;
            }
        }
    }
}

/// Keeps dialing with a fixed wait between attempts until the server is
/// reachable.
async fn connect_with_backoff(
    server: SocketAddr,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    loop {
        match TcpStream::connect(server).await {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                return Ok((BufReader::new(reader), writer));
            }
            Err(err) => {
                warn!(%server, error = ?err, "connect failed, retrying");
                write_stdout("*** server unreachable, retrying").await?;
                sleep(RECONNECT_WAIT).await;
            }
        }
    }
}

async fn run_session(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<SessionEnd> {
    let mut session = Session::default();

    loop {
        input.clear();
        select! {
            server_line = frame::read_line(reader) => {
                if !handle_server_line(server_line, &mut session).await? {
                    return Ok(SessionEnd::ServerClosed);
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, &mut session, writer).await? {
                    return Ok(SessionEnd::UserQuit);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                return Ok(SessionEnd::UserQuit);
            }
        }
    }
}

async fn handle_server_line(line: io::Result<Option<String>>, session: &mut Session) -> Result<bool> {
    let line = match line {
        Ok(Some(line)) => line,
        Ok(None) => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        Err(err) => {
            warn!(error = ?err, "read from server failed");
            return Ok(false);
        }
    };

    // An undecodable frame is the server's problem, not a reason to drop
    // the session.
    match Frame::decode(&line) {
        Ok(frame) => render_frame(frame, session).await?,
        Err(err) => debug!(error = %err, line = %line, "ignoring undecodable frame"),
    }
    Ok(true)
}

async fn render_frame(frame: Frame, session: &mut Session) -> io::Result<()> {
    match frame {
        Frame::ServerHello(identity) => {
            session.my_identity = Some(identity);
            write_stdout(&format!("*** connected as identity {identity}")).await?;
            if !session.list_received {
                write_stdout("*** waiting for peers to join").await?;
            }
            Ok(())
        }
        Frame::ClientList(identities) => {
            if session.list_received {
                // The server re-sends the list on every join.
                return Ok(());
            }
            session.list_received = true;
            session.peers = identities;

            let rendered = session
                .peers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            write_stdout(&format!("*** online identities: {rendered}")).await?;
            write_stdout("*** choose an identity to message:").await
        }
        Frame::NewClient(identity) => {
            write_stdout(&format!("*** {identity} joined")).await
        }
        Frame::Regular { sender, text } => {
            write_stdout(&format!("<{sender}> {text}")).await
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &mut Session,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if !session.list_received {
        write_stdout("*** no peers yet, ignoring input").await?;
        return Ok(true);
    }

    match session.destination {
        Some(destination) => {
            frame::write_route(writer, destination, text).await?;
        }
        None => choose_destination(text, session).await?,
    }
    Ok(true)
}

/// Interprets input typed after the peer list arrived and before a valid
/// destination was picked.
async fn choose_destination(text: &str, session: &mut Session) -> io::Result<()> {
    match text.parse::<Identity>() {
        Ok(identity) if Some(identity) == session.my_identity => {
            write_stdout("*** that identity is you, pick a peer:").await
        }
        Ok(identity) if identity != 0 && session.peers.contains(&identity) => {
            session.destination = Some(identity);
            write_stdout(&format!("*** chatting with {identity}")).await
        }
        _ => write_stdout("*** not a listed identity, try again:").await,
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
