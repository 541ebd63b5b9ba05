//! Render-affine side of the engine.
//!
//! One task owns the [`RenderTarget`] and applies [`RenderCommand`]s strictly
//! in the order they were sent. Everything else talks to it through a
//! [`RenderHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::projection::DataSource;

pub trait RenderTarget: Send + 'static {
    fn render_snapshot(&mut self, source: &Arc<DataSource>);

    /// A rebuild has started; only sent in `PublishMode::Rebuilding`.
    fn rebuilding(&mut self) {}

    fn network_activity(&mut self, active: bool);

    fn scroll_to(&mut self, position: usize);

    fn pulse(&mut self, position: usize, fade: Duration);
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderCommand {
    Snapshot(Arc<DataSource>),
    Rebuilding,
    NetworkActivity(bool),
    ScrollTo(usize),
    Pulse { position: usize, fade: Duration },
}

#[derive(Debug, Clone)]
pub struct RenderHandle {
    tx: mpsc::UnboundedSender<RenderCommand>,
}

impl RenderHandle {
    /// Sends a command; a closed loop drops it silently.
    pub fn send(&self, command: RenderCommand) {
        let _ = self.tx.send(command);
    }

    pub fn publish(&self, source: Arc<DataSource>) {
        self.send(RenderCommand::Snapshot(source));
    }
}

/// Handle plus the raw receiving end, for callers that drive rendering
/// themselves.
pub fn render_channel() -> (RenderHandle, mpsc::UnboundedReceiver<RenderCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RenderHandle { tx }, rx)
}

/// Spawns the loop. It ends, returning the target, once every handle is dropped.
pub fn spawn_render_loop<T: RenderTarget>(mut target: T) -> (RenderHandle, JoinHandle<T>) {
    let (handle, mut rx) = render_channel();
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            apply(&mut target, command);
        }
        target
    });
    (handle, task)
}

fn apply<T: RenderTarget>(target: &mut T, command: RenderCommand) {
    match command {
        RenderCommand::Snapshot(source) => target.render_snapshot(&source),
        RenderCommand::Rebuilding => target.rebuilding(),
        RenderCommand::NetworkActivity(active) => target.network_activity(active),
        RenderCommand::ScrollTo(position) => target.scroll_to(position),
        RenderCommand::Pulse { position, fade } => target.pulse(position, fade),
    }
}
