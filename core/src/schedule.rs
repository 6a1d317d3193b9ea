//! Cooperative periodic scheduling on the tokio runtime.
//!
//! A [`Tick`] implementation owns all of its mutable state. The loop started
//! by [`spawn`] runs one tick to completion, then arms a timer for
//! [`Tick::period`]. Control messages are handed to the task between ticks,
//! so ticks never overlap and the task never needs a lock around its state.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Work performed on every timer fire.
pub trait Tick: Send + 'static {
    /// Messages the owner can deliver to the running loop.
    type Control: Send + 'static;

    /// Run one cycle. Must not fail; errors are handled inside.
    ///
    /// Shutdown is only observed between ticks, so a tick should bound any
    /// wait it performs.
    fn on_tick(&mut self) -> impl Future<Output = ()> + Send;

    /// Delay before the next tick. Read after every tick.
    fn period(&self) -> Duration;

    /// Apply a control message. Does not reset the pending timer.
    fn on_control(&mut self, control: Self::Control);
}

/// Owner side of a running periodic loop.
#[derive(Debug)]
pub struct PeriodicHandle<T: Tick> {
    control_tx: mpsc::UnboundedSender<T::Control>,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<T>,
}

/// Start a loop that ticks immediately and then once per period.
///
/// Must be called from within a tokio runtime.
pub fn spawn<T: Tick>(task: T) -> PeriodicHandle<T> {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(run(task, control_rx, shutdown_rx));

    PeriodicHandle {
        control_tx,
        shutdown_tx,
        join,
    }
}

impl<T: Tick> PeriodicHandle<T> {
    /// Deliver a control message to the loop.
    ///
    /// Returns `false` if the loop has already ended.
    pub fn control(&self, control: T::Control) -> bool {
        self.control_tx.send(control).is_ok()
    }

    /// Whether the loop task has ended, which only happens early if a tick
    /// panicked.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and hand the task back.
    ///
    /// A tick already in progress runs to completion; none starts after this
    /// returns. Returns `None` if the task panicked.
    pub async fn cancel(self) -> Option<T> {
        // The loop may already be gone; the join below covers both cases.
        let _ = self.shutdown_tx.send(());
        match self.join.await {
            Ok(task) => Some(task),
            Err(err) => {
                log::warn!("periodic task ended abnormally: {err}");
                None
            }
        }
    }
}

async fn run<T: Tick>(
    mut task: T,
    mut control_rx: mpsc::UnboundedReceiver<T::Control>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> T {
    loop {
        if !matches!(
            shutdown_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ) {
            return task;
        }

        task.on_tick().await;

        let sleep = tokio::time::sleep(task.period());
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => return task,
                Some(control) = control_rx.recv() => task.on_control(control),
                () = &mut sleep => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        ticks: Arc<AtomicUsize>,
        period: Duration,
        controls: Vec<u64>,
    }

    impl Counter {
        fn new(period_secs: u64) -> (Self, Arc<AtomicUsize>) {
            let ticks = Arc::new(AtomicUsize::new(0));
            let counter = Self {
                ticks: Arc::clone(&ticks),
                period: Duration::from_secs(period_secs),
                controls: Vec::new(),
            };
            (counter, ticks)
        }
    }

    impl Tick for Counter {
        type Control = u64;

        async fn on_tick(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn period(&self) -> Duration {
            self.period
        }

        fn on_control(&mut self, period_secs: u64) {
            self.controls.push(period_secs);
            self.period = Duration::from_secs(period_secs);
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_immediately_then_every_period() {
        let (counter, ticks) = Counter::new(10);
        let handle = spawn(counter);

        advance(1).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        advance(34).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);

        assert!(handle.cancel().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_after_cancel() {
        let (counter, ticks) = Counter::new(10);
        let handle = spawn(counter);

        advance(15).await;
        let task = handle.cancel().await.expect("task returned");
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 2);

        advance(100).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert_eq!(task.ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_keeps_pending_timer() {
        let (counter, ticks) = Counter::new(10);
        let handle = spawn(counter);

        advance(5).await;
        assert!(handle.control(3));

        advance(7).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        // 0, 10, then every 3 seconds
        advance(5).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);

        let task = handle.cancel().await.expect("task returned");
        assert_eq!(task.controls, vec![3]);
    }

    struct Slow {
        ticks: Arc<AtomicUsize>,
    }

    impl Tick for Slow {
        type Control = ();

        async fn on_tick(&mut self) {
            tokio::time::sleep(Duration::from_secs(3)).await;
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn period(&self) -> Duration {
            Duration::from_secs(10)
        }

        fn on_control(&mut self, _: ()) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_tick_in_progress() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = spawn(Slow {
            ticks: Arc::clone(&ticks),
        });

        advance(1).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        assert!(handle.cancel().await.is_some());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    struct Panicking;

    impl Tick for Panicking {
        type Control = ();

        async fn on_tick(&mut self) {
            panic!("tick failed");
        }

        fn period(&self) -> Duration {
            Duration::from_secs(10)
        }

        fn on_control(&mut self, _: ()) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_loop_is_finished() {
        let handle = spawn(Panicking);
        advance(1).await;

        assert!(handle.is_finished());
        assert!(!handle.control(()));
        assert!(handle.cancel().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_poll() {
        let (counter, ticks) = Counter::new(10);
        let handle = spawn(counter);
        let _ = handle.cancel().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
