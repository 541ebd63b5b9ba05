use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::render::{RenderCommand, RenderHandle};

#[derive(Debug, Default)]
struct HighlightState {
    generation: u64,
    target: Option<String>,
    task: Option<JoinHandle<()>>,
}

/// Delayed scroll-and-pulse of one row. The target stays pending until the
/// pulse has faded. A new request or [`clear`] aborts the previous task; a
/// generation counter keeps a finished stale task from clearing a newer
/// target.
///
/// Tasks are spawned on the runtime the scheduler was created in, so
/// [`schedule`] may be called from threads outside it.
///
/// [`clear`]: HighlightScheduler::clear
/// [`schedule`]: HighlightScheduler::schedule
pub struct HighlightScheduler {
    render: RenderHandle,
    delay: Duration,
    fade: Duration,
    runtime: Option<Handle>,
    inner: Arc<Mutex<HighlightState>>,
}

impl HighlightScheduler {
    pub fn new(render: RenderHandle, delay: Duration, fade: Duration) -> Self {
        Self {
            render,
            delay,
            fade,
            runtime: Handle::try_current().ok(),
            inner: Arc::default(),
        }
    }

    pub fn pending(&self) -> Option<String> {
        self.lock().target.clone()
    }

    /// The pending target, unless a task is already scrolling to it.
    pub fn awaiting_schedule(&self) -> Option<String> {
        let state = self.lock();
        match state.task {
            Some(_) => None,
            None => state.target.clone(),
        }
    }

    /// Records a target without scheduling anything.
    pub fn set_pending(&self, file_name: impl Into<String>) {
        let mut state = self.lock();
        state.generation += 1;
        state.target = Some(file_name.into());
    }

    /// Outside any runtime the target is only recorded, and the next rebuild
    /// inside one picks it up.
    pub fn schedule(&self, file_name: &str, position: usize) {
        let mut state = self.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        state.target = Some(file_name.to_string());
        let generation = state.generation;

        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            warn!(file_name, "no async runtime, highlight left pending");
            return;
        };
        let inner = Arc::clone(&self.inner);
        let render = self.render.clone();
        let delay = self.delay;
        let fade = self.fade;
        state.task = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            render.send(RenderCommand::ScrollTo(position));
            render.send(RenderCommand::Pulse { position, fade });
            tokio::time::sleep(fade).await;

            let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation == generation {
                state.target = None;
                state.task = None;
            }
        }));
        debug!(file_name, position, "highlight scheduled");
    }

    /// Aborts any running task and forgets the target.
    pub fn clear(&self) {
        let mut state = self.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        state.target = None;
    }

    #[cfg(test)]
    fn has_task(&self) -> bool {
        self.lock().task.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HighlightState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HighlightScheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::render::render_channel;
    use tokio::sync::mpsc::error::TryRecvError;

    const DELAY: Duration = Duration::from_millis(300);
    const FADE: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn scrolls_then_pulses_after_delay() {
        let (render, mut rx) = render_channel();
        let scheduler = HighlightScheduler::new(render, DELAY, FADE);

        scheduler.schedule("a.txt", 4);
        assert_eq!(scheduler.pending().as_deref(), Some("a.txt"));

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(rx.recv().await, Some(RenderCommand::ScrollTo(4)));
        assert_eq!(
            rx.recv().await,
            Some(RenderCommand::Pulse {
                position: 4,
                fade: FADE
            })
        );
        tokio::task::yield_now().await;
        assert_eq!(scheduler.pending().as_deref(), Some("a.txt"));
        assert_eq!(scheduler.awaiting_schedule(), None);

        tokio::time::sleep(FADE + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(scheduler.pending(), None);
        assert!(!scheduler.has_task());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_supersedes_older() {
        let (render, mut rx) = render_channel();
        let scheduler = HighlightScheduler::new(render, DELAY, FADE);

        scheduler.schedule("a.txt", 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.schedule("b.txt", 2);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(rx.try_recv(), Ok(RenderCommand::ScrollTo(2)));
        assert_eq!(
            rx.try_recv(),
            Ok(RenderCommand::Pulse {
                position: 2,
                fade: FADE
            })
        );
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_pending_task() {
        let (render, mut rx) = render_channel();
        let scheduler = HighlightScheduler::new(render, DELAY, FADE);

        scheduler.schedule("a.txt", 1);
        scheduler.clear();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(scheduler.pending(), None);
        assert!(!scheduler.has_task());
    }

    #[test]
    fn schedule_outside_runtime_keeps_target_pending() {
        let (render, mut rx) = render_channel();
        let scheduler = HighlightScheduler::new(render, DELAY, FADE);

        scheduler.schedule("a.txt", 1);

        assert_eq!(scheduler.awaiting_schedule().as_deref(), Some("a.txt"));
        assert!(!scheduler.has_task());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn schedules_from_a_thread_without_runtime() {
        let (render, mut rx) = render_channel();
        let scheduler = HighlightScheduler::new(render, Duration::from_millis(5), FADE);

        std::thread::scope(|scope| {
            scope.spawn(|| scheduler.schedule("a.txt", 3));
        });

        assert!(scheduler.has_task());
        assert_eq!(rx.recv().await, Some(RenderCommand::ScrollTo(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn set_pending_does_not_schedule() {
        let (render, mut rx) = render_channel();
        let scheduler = HighlightScheduler::new(render, DELAY, FADE);

        scheduler.set_pending("later.txt");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(scheduler.pending().as_deref(), Some("later.txt"));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }
}
