//! Engine service loop
//!
//! The engine is owned by one tokio task. Everything else talks to it
//! through a cloneable [`EngineHandle`]: commands go over an mpsc channel
//! with oneshot replies, state comes back over the engine's watch channel
//! and events over its broadcast bus.

use crate::error::{Error, Result};
use crate::playback::{EngineReport, HostVisibility, MixerEngine, MixerState, PlayOutcome, UnitSnapshot};
use rainloop_common::events::{EventBus, MixerEvent};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pending commands before senders start waiting
const COMMAND_CAPACITY: usize = 64;

enum Command {
    Play(oneshot::Sender<PlayOutcome>),
    Pause(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    SetVolume(f32, oneshot::Sender<()>),
    Visibility(HostVisibility, oneshot::Sender<()>),
    Report(oneshot::Sender<EngineReport>),
    UnitStates(oneshot::Sender<Vec<UnitSnapshot>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front for the engine task
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<MixerState>,
    events: EventBus,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::EngineClosed)?;
        reply_rx.await.map_err(|_| Error::EngineClosed)
    }

    pub async fn play(&self) -> Result<PlayOutcome> {
        self.request(Command::Play).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        self.request(|reply| Command::SetVolume(volume, reply)).await
    }

    pub async fn notify_visibility(&self, visibility: HostVisibility) -> Result<()> {
        self.request(|reply| Command::Visibility(visibility, reply)).await
    }

    pub async fn report(&self) -> Result<EngineReport> {
        self.request(Command::Report).await
    }

    pub async fn unit_states(&self) -> Result<Vec<UnitSnapshot>> {
        self.request(Command::UnitStates).await
    }

    /// Halt the engine and release its resources. Later requests fail with
    /// `Error::EngineClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Last published state
    pub fn state(&self) -> MixerState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MixerState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MixerEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Move `engine` onto its own task, woken at least every `tick`
pub fn spawn_engine(engine: MixerEngine, tick: Duration) -> (EngineHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
    let handle = EngineHandle {
        commands,
        state: engine.subscribe_state(),
        events: engine.events(),
    };
    let task = tokio::spawn(run_engine(engine, rx, tick));
    (handle, task)
}

async fn run_engine(mut engine: MixerEngine, mut rx: mpsc::Receiver<Command>, tick: Duration) {
    info!("Engine service started (tick {:?})", tick);

    loop {
        let wait = match engine.next_deadline() {
            Some(due) => Duration::from_secs_f64((due - engine.now()).max(0.0)).min(tick),
            None => tick,
        };

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Shutdown(reply)) => {
                    engine.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Some(command) => dispatch(&mut engine, command),
                None => {
                    debug!("All engine handles dropped");
                    engine.shutdown();
                    break;
                }
            },
            _ = tokio::time::sleep(wait) => {}
        }

        engine.advance();
    }

    info!("Engine service stopped");
}

fn dispatch(engine: &mut MixerEngine, command: Command) {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        Command::Play(reply) => {
            let _ = reply.send(engine.play());
        }
        Command::Pause(reply) => {
            engine.pause();
            let _ = reply.send(());
        }
        Command::Stop(reply) => {
            engine.stop();
            let _ = reply.send(());
        }
        Command::SetVolume(volume, reply) => {
            engine.set_volume(volume);
            let _ = reply.send(());
        }
        Command::Visibility(visibility, reply) => {
            engine.notify_visibility(visibility);
            let _ = reply.send(());
        }
        Command::Report(reply) => {
            let _ = reply.send(engine.report());
        }
        Command::UnitStates(reply) => {
            let _ = reply.send(engine.unit_states());
        }
        Command::Shutdown(reply) => {
            engine.shutdown();
            let _ = reply.send(());
        }
    }
}

/// Issue one `play` after `delay`
pub fn schedule_autoplay(handle: EngineHandle, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match handle.play().await {
            Ok(PlayOutcome::Rejected) => {
                warn!("Autoplay rejected by the host; waiting for an explicit play")
            }
            Ok(outcome) => info!("Autoplay: {:?}", outcome),
            Err(e) => warn!("Autoplay failed: {}", e),
        }
    })
}
