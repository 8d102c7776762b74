//! The worker loop.
//!
//! Runs on the worker's own thread inside a current-thread tokio runtime. The
//! loop waits on the inbound port (and on the shutdown watch for abrupt
//! cancellation), executes one Input at a time, and closes the instance once
//! the status says the worker is cancelled.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::ThreadError;
use crate::instance::{Instance, InstanceFactory, WorkerContext};
use crate::logging::{self, LogLevel};
use crate::message::{Input, Message, Outcome};
use crate::port::MessagePort;
use crate::state::WorkerState;

/// The main worker loop that runs inside the spawned thread.
pub(crate) async fn run_worker(
    ctx: WorkerContext,
    factory: InstanceFactory,
    mut inbox: MessagePort,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ThreadError> {
    let name = ctx.name().to_string();
    let status = Arc::clone(ctx.status());
    let mut instance = factory();

    logging::debug(&name, "starting interpreter context");
    if let Err(e) = instance.start(&ctx) {
        instance.log(&ctx, LogLevel::Error, &format!("failed to start: {}", e));
        status.fail();
        ctx.report_unavailable(e.to_string());
        status.terminate();
        return Err(e);
    }
    status.set_owns_context(true);

    if status.advance(WorkerState::Idle).is_none() {
        logging::debug(&name, "cancelled during start-up");
    }

    loop {
        if status.is_cancel_requested() {
            break;
        }

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    logging::debug(&name, "handle dropped");
                    status.fail();
                    break;
                }
                if *shutdown_rx.borrow() {
                    logging::debug(&name, "received shutdown signal");
                    break;
                }
            }

            message = inbox.recv() => {
                let Some(message) = message else {
                    logging::debug(&name, "inbound port closed");
                    status.fail();
                    break;
                };

                match message {
                    Message::Input(input) => handle_input(instance.as_mut(), &ctx, input),
                    Message::Restart => restart(instance.as_mut(), &ctx),
                    Message::Cancel { clean } => {
                        // Normally already recorded by the handle.
                        status.request_cancel(clean);
                        break;
                    }
                    other => logging::verbose(
                        &name,
                        format_args!("ignoring unexpected {:?}", other.kind()),
                    ),
                }
            }
        }
    }

    close(instance.as_mut(), &ctx, &mut inbox);
    Ok(())
}

fn handle_input(instance: &mut dyn Instance, ctx: &WorkerContext, input: Input) {
    let status = ctx.status();
    if status.advance(WorkerState::Busy).is_none() {
        logging::verbose(
            ctx.name(),
            format_args!("dropping input in state {}", status.state()),
        );
        return;
    }

    let outcome = instance.execute(ctx, input);
    ctx.flush_output();
    ctx.return_outcome(outcome);

    // Refused when a cancel arrived while busy; the loop picks that up next.
    status.advance(WorkerState::Idle);
}

fn restart(instance: &mut dyn Instance, ctx: &WorkerContext) {
    let status = ctx.status();
    if status.advance(WorkerState::Restarting).is_none() {
        logging::verbose(
            ctx.name(),
            format_args!("ignoring restart in state {}", status.state()),
        );
        return;
    }

    let reset = status.reset_on_restart();
    logging::debug(ctx.name(), format_args!("restarting (reset={})", reset));

    match instance.restart(ctx, reset) {
        Ok(()) => {
            status.advance(WorkerState::Idle);
        }
        Err(e) => {
            instance.log(ctx, LogLevel::Error, &format!("restart failed: {}", e));
            status.fail();
            ctx.report_unavailable(e.to_string());
        }
    }
}

fn close(instance: &mut dyn Instance, ctx: &WorkerContext, inbox: &mut MessagePort) {
    let status = ctx.status();
    let clean = status.clean_close() && !status.is_interrupted();

    let discarded = inbox.discard_pending();
    if discarded > 0 {
        logging::debug(
            ctx.name(),
            format_args!("discarded {} queued message(s)", discarded),
        );
    }

    instance.cancelled(ctx, clean);

    if clean {
        ctx.flush_output();
        if status.owns_context() {
            instance.teardown(ctx);
            status.set_owns_context(false);
        }
        ctx.flush_output();
        ctx.return_outcome(Outcome::Cancelled);
    } else {
        ctx.discard_output();
    }

    status.terminate();
    logging::debug(
        ctx.name(),
        format_args!("terminated ({})", if clean { "clean" } else { "abrupt" }),
    );
}
