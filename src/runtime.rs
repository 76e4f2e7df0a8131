//! Async runtime: one dispatcher, one deadline timer, one stats ticker.
//!
//! ```text
//!  ┌─────────────────────────────────────────────────────────────┐
//!  │  edge_executor::LocalExecutor                               │
//!  │                                                             │
//!  │  deadline_task ── Timer::at(armed.at) ──▶ DeadlineFired ─┐  │
//!  │       ▲                                                  │  │
//!  │       │ DeadlineSignal                                   ▼  │
//!  │  dispatch_loop ◀──────────────── ControlQueue ◀── bus reader│
//!  │       │                                ▲                    │
//!  │       ▼                                │                    │
//!  │  OutboundQueue ──▶ bus writer     stats_task                │
//!  └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dispatcher is the only code that touches the
//! [`ControllerService`]; everything else talks to it through the control
//! queue, so steps never interleave.
//!
//! Neither queue drops messages.  Publications made during a step are
//! staged and then awaited into the outbound queue before the next control
//! message is taken, and threads posting into a full control queue wait
//! for room until the dispatcher has stopped.

use std::sync::atomic::{AtomicBool, Ordering};

use embassy_time::{Duration, Instant, Timer};
use futures_lite::future;
use log::{debug, error, info};

use crate::app::ports::{BusPort, EventSink, RecordSink};
use crate::app::service::ControllerService;
use crate::error::BusError;
use crate::events::{ControlMsg, ControlQueue, DeadlineSignal, OutboundMsg, OutboundQueue};
use crate::timing::ArmedDeadline;

/// How often a blocked [`Runtime::post`] checks whether the dispatcher
/// has stopped.
const STOP_POLL: Duration = Duration::from_millis(10);

/// Owns the queues shared between the dispatcher and the bus threads.
pub struct Runtime {
    control: ControlQueue,
    outbound: OutboundQueue,
    deadline: DeadlineSignal,
    stopped: AtomicBool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            control: ControlQueue::new(),
            outbound: OutboundQueue::new(),
            deadline: DeadlineSignal::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Inbound side: bus reader, tests and signal handlers post here.
    pub fn control(&self) -> &ControlQueue {
        &self.control
    }

    /// Outbound side: the bus writer drains this.
    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Post a message from a plain thread, waiting while the queue is full.
    ///
    /// Returns `false` if the dispatcher stopped before there was room.
    pub fn post(&self, msg: ControlMsg) -> bool {
        future::block_on(future::or(
            async {
                self.control.send(msg).await;
                true
            },
            async {
                self.wait_stopped().await;
                false
            },
        ))
    }

    /// True once the dispatcher inside [`run`](Self::run) has stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn wait_stopped(&self) {
        while !self.is_stopped() {
            Timer::after(STOP_POLL).await;
        }
    }

    /// Drive the service until [`ControlMsg::Shutdown`] or
    /// [`ControlMsg::BusLost`] arrives.  Blocks the calling thread.
    ///
    /// On return the outbound queue has been sent [`OutboundMsg::Close`].
    /// Something must be draining the outbound queue for that send, and for
    /// every publication, to complete.
    pub fn run(
        &self,
        service: &mut ControllerService,
        records: &mut impl RecordSink,
        events: &mut impl EventSink,
        stats_interval: Option<Duration>,
    ) -> Result<(), BusError> {
        self.stopped.store(false, Ordering::Release);
        let executor: edge_executor::LocalExecutor<'_, 8> = edge_executor::LocalExecutor::new();

        executor
            .spawn(deadline_task(&self.deadline, &self.control))
            .detach();
        if let Some(period) = stats_interval {
            executor.spawn(stats_task(&self.control, period)).detach();
        }

        info!("RUNTIME: dispatcher running");
        let result = future::block_on(executor.run(dispatch_loop(
            service,
            records,
            events,
            &self.control,
            &self.outbound,
            &self.deadline,
        )));

        self.stopped.store(true, Ordering::Release);
        future::block_on(self.outbound.send(OutboundMsg::Close));
        debug!("RUNTIME: writer told to close");
        result
    }
}

// ── Bus adapter over the outbound queue ──────────────────────

/// [`BusPort`] that stages publications for the dispatcher, which awaits
/// each one into the outbound queue once the step is done.
#[derive(Default)]
struct QueuedBus {
    pending: Vec<OutboundMsg>,
}

impl QueuedBus {
    /// Hand every staged publication to the writer, waiting for room.
    async fn flush(&mut self, outbound: &OutboundQueue) {
        for msg in self.pending.drain(..) {
            outbound.send(msg).await;
        }
    }
}

impl BusPort for QueuedBus {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        self.pending.push(OutboundMsg::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

// ── Tasks ────────────────────────────────────────────────────

async fn dispatch_loop(
    service: &mut ControllerService,
    records: &mut impl RecordSink,
    events: &mut impl EventSink,
    control: &ControlQueue,
    outbound: &OutboundQueue,
    deadline: &DeadlineSignal,
) -> Result<(), BusError> {
    let mut bus = QueuedBus::default();
    let mut last_token = None;
    service.start(events);

    loop {
        let msg = control.receive().await;
        let now = Instant::now();
        match msg {
            ControlMsg::Inbound { topic, payload } => {
                service.on_message(&topic, &payload, now, &mut bus, records, events);
            }
            ControlMsg::DeadlineFired { token } => {
                service.on_deadline(token, now, &mut bus, records, events);
            }
            ControlMsg::StatsTick => service.report_stats(events),
            ControlMsg::BusLost => {
                error!("RUNTIME: bus connection lost, stopping in {}", service.state());
                service.report_stats(events);
                return Err(BusError::Disconnected);
            }
            ControlMsg::Shutdown => {
                info!("RUNTIME: shutdown requested in {}", service.state());
                service.report_stats(events);
                return Ok(());
            }
        }

        bus.flush(outbound).await;

        // Hand the timer task the new deadline only when it changed.
        let armed = service.armed_deadline();
        let token = armed.map(|d| d.token);
        if token != last_token {
            deadline.signal(armed);
            last_token = token;
        }
    }
}

/// Sleeps until the armed deadline, then enqueues its token.  A new
/// signal cancels the sleep.
async fn deadline_task(signal: &DeadlineSignal, control: &ControlQueue) {
    let mut armed: Option<ArmedDeadline> = None;
    loop {
        armed = match armed {
            None => signal.wait().await,
            Some(d) => {
                let fired = future::or(async { Some(signal.wait().await) }, async {
                    Timer::at(d.at).await;
                    None
                })
                .await;
                match fired {
                    Some(update) => update,
                    None => {
                        control
                            .send(ControlMsg::DeadlineFired { token: d.token })
                            .await;
                        None
                    }
                }
            }
        };
    }
}

async fn stats_task(control: &ControlQueue, period: Duration) {
    loop {
        Timer::after(period).await;
        control.send(ControlMsg::StatsTick).await;
    }
}
