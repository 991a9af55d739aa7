//! The driver task: the one place a [`Session`] is mutated.
//!
//! ```text
//! StreamClient ──Command──┐
//!                         ├─► select! ─► Session
//! Connector ──Event───────┤
//! sleep_until(deadline) ──┘
//! ```
//!
//! Commands are polled first so a `stop`/`reset` issued before a due tick is
//! applied before the tick can fire.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use super::session::Session;
use crate::error::Result;
use crate::transport::{ConnectionEventReceiver, ConnectionId};

pub enum Command {
    Load {
        samples: Vec<f64>,
        sampling_rate: f64,
        reply: oneshot::Sender<Result<u64>>,
    },
    Connect {
        reply: oneshot::Sender<ConnectionId>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    SetEndpoint {
        endpoint: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    SetChunkDuration {
        secs: f64,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Load { .. } => "load",
            Command::Connect { .. } => "connect",
            Command::Close { .. } => "close",
            Command::SetEndpoint { .. } => "set_endpoint",
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Reset { .. } => "reset",
            Command::SetChunkDuration { .. } => "set_chunk_duration",
            Command::Shutdown { .. } => "shutdown",
        }
    }
}

pub(crate) async fn run(
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: ConnectionEventReceiver,
) {
    info!("stream driver started");
    let mut shutdown_reply = None;

    loop {
        let deadline = session.next_deadline();
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    shutdown_reply = Some(reply);
                    break;
                }
                Some(command) => apply(&mut session, command),
                None => {
                    debug!("all client handles dropped");
                    break;
                }
            },

            Some(event) = events.recv() => session.handle_connection_event(event),

            _ = wait_for(deadline), if deadline.is_some() => {
                session.on_timer(Instant::now());
            }
        }
    }

    session.shutdown();
    info!("stream driver stopped");
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn apply(session: &mut Session, command: Command) {
    debug!(command = command.name(), "applying command");
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        Command::Load {
            samples,
            sampling_rate,
            reply,
        } => {
            let _ = reply.send(session.load(samples, sampling_rate));
        }
        Command::Connect { reply } => {
            let _ = reply.send(session.connect());
        }
        Command::Close { reply } => {
            session.close();
            let _ = reply.send(());
        }
        Command::SetEndpoint { endpoint, reply } => {
            let _ = reply.send(session.set_endpoint(endpoint));
        }
        Command::Start { reply } => {
            let _ = reply.send(session.start(Instant::now()).map(|_| ()));
        }
        Command::Stop { reply } => {
            session.stop();
            let _ = reply.send(());
        }
        Command::Reset { reply } => {
            session.reset();
            let _ = reply.send(());
        }
        Command::SetChunkDuration { secs, reply } => {
            let _ = reply.send(session.set_chunk_duration(secs));
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
