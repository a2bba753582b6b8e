//! Coordinator owning the response handlers of a service instance
//!
//! The actor is the only place that knows which correlation id belongs to which handler. It is
//! driven by an unbounded control mailbox carrying registrations and deregistrations, an
//! internal mailbox for handler completions and a bounded dispatch mailbox carrying responses
//! from the router. The first two are always drained before the next response is dispatched.
//!
//! Dispatching a response waits until the handler has room for it. This intentionally stalls
//! the actor (and in turn the router and its broker subscription) when a handler lags behind.
//! Registrations are never acknowledged so that a handler which itself issues requests can not
//! end up waiting for the actor while the actor waits for the handler.
//!
//! Every registration is identified by a [`Ticket`] carrying its own generation and
//! cancellation token. Deregistering through a ticket only ever removes the registration it
//! was issued for and also releases the actor if it is blocked dispatching to that handler.

use super::supervisor::{ServiceEvent, Supervisor};
use super::{CorrelationId, ErrorReport, Message, RegistrationError, ServiceError};
use crate::library::EmptyResult;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

const DISPATCH_CAPACITY: usize = 16;
const HANDLER_CAPACITY: usize = 1;

/// Type-erased handler consuming the responses to one request
pub(crate) type ResponseHandler =
    Box<dyn FnOnce(ResponseStream) -> BoxFuture<'static, EmptyResult> + Send>;

pub(crate) fn box_handler<F, Fut>(handler: F) -> ResponseHandler
where
    F: FnOnce(ResponseStream) -> Fut + Send + 'static,
    Fut: Future<Output = EmptyResult> + Send + 'static,
{
    Box::new(move |responses| handler(responses).boxed())
}

/// Responses to a single request in the order the broker delivered them
///
/// The stream ends when the request is [cancelled](super::RequestHandle::cancel) or the
/// instance shuts down. Dropping it (or returning from the handler) stops the delivery, later
/// responses with the same correlation id are discarded.
pub struct ResponseStream {
    correlation_id: CorrelationId,
    rx: mpsc::Receiver<Message>,
}

impl ResponseStream {
    /// Correlation id of the request this stream belongs to
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Waits for the next response
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Stream for ResponseStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

enum Control {
    Register {
        correlation_id: CorrelationId,
        generation: u64,
        cancel: CancellationToken,
        handler: ResponseHandler,
    },
    Deregister {
        correlation_id: CorrelationId,
        generation: u64,
    },
}

/// Identifies exactly one registration of a response handler
pub(crate) struct Ticket {
    correlation_id: CorrelationId,
    generation: u64,
    cancel: CancellationToken,
}

impl Ticket {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

struct Completion {
    correlation_id: CorrelationId,
    generation: u64,
    outcome: Result<(), ErrorReport>,
}

struct Registration {
    generation: u64,
    cancel: CancellationToken,
    sender: mpsc::Sender<Message>,
}

/// Remote control for the actor of a service instance
#[derive(Clone)]
pub(crate) struct ActorHandle {
    control: mpsc::UnboundedSender<Control>,
    dispatch: mpsc::Sender<Message>,
    generations: Arc<AtomicU64>,
}

impl ActorHandle {
    /// Starts a new actor which runs until the supervisor token is cancelled or every handle is gone
    pub fn spawn(supervisor: &Supervisor) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (dispatch, dispatch_rx) = mpsc::channel(DISPATCH_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let actor = ServiceActor {
            registrations: HashMap::new(),
            completions: completion_tx,
            supervisor: supervisor.clone(),
        };

        tokio::spawn(actor.run(control_rx, completion_rx, dispatch_rx));

        Self {
            control,
            dispatch,
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues a handler for the given correlation id
    ///
    /// The returned ticket refers to this registration only. If another handler is active for
    /// the correlation id, the registration is rejected and the ticket refers to nothing.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        handler: ResponseHandler,
    ) -> Result<Ticket, ServiceError> {
        let ticket = Ticket {
            correlation_id,
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
            cancel: CancellationToken::new(),
        };

        self.control
            .send(Control::Register {
                correlation_id: ticket.correlation_id.clone(),
                generation: ticket.generation,
                cancel: ticket.cancel.clone(),
                handler,
            })
            .map_err(|_| ServiceError::ActorStopped)?;

        Ok(ticket)
    }

    /// Removes the registration the ticket was issued for, if it is still active
    pub fn deregister(&self, ticket: &Ticket) -> Result<(), ServiceError> {
        ticket.cancel.cancel();

        self.control
            .send(Control::Deregister {
                correlation_id: ticket.correlation_id.clone(),
                generation: ticket.generation,
            })
            .map_err(|_| ServiceError::ActorStopped)
    }

    /// Sender for responses which does not keep the actor alive on its own
    pub fn dispatcher(&self) -> mpsc::Sender<Message> {
        self.dispatch.clone()
    }

    #[cfg(test)]
    pub async fn dispatch(&self, message: Message) -> Result<(), ServiceError> {
        self.dispatch
            .send(message)
            .await
            .map_err(|_| ServiceError::ActorStopped)
    }
}

struct ServiceActor {
    registrations: HashMap<CorrelationId, Registration>,
    completions: mpsc::UnboundedSender<Completion>,
    supervisor: Supervisor,
}

impl ServiceActor {
    #[instrument(name = "actor", skip_all)]
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut dispatch: mpsc::Receiver<Message>,
    ) {
        let token = self.supervisor.token().clone();

        debug!("Actor started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                command = control.recv() => match command {
                    Some(Control::Register { correlation_id, generation, cancel, handler }) => {
                        self.register(correlation_id, generation, cancel, handler)
                    }
                    Some(Control::Deregister { correlation_id, generation }) => {
                        self.remove(&correlation_id, generation)
                    }
                    None => break,
                },
                Some(completion) = completions.recv() => self.complete(completion),
                Some(message) = dispatch.recv() => self.dispatch(message, &token).await,
            }
        }

        debug!(
            pending = self.registrations.len(),
            "Actor stopped, closing remaining response streams"
        );
    }

    fn register(
        &mut self,
        correlation_id: CorrelationId,
        generation: u64,
        cancel: CancellationToken,
        handler: ResponseHandler,
    ) {
        if self.registrations.contains_key(&correlation_id) {
            warn!(%correlation_id, "Rejecting duplicate response handler");
            self.supervisor.report(ServiceEvent::HandlerRejected(
                RegistrationError::AlreadyRegistered(correlation_id),
            ));
            return;
        }

        let (sender, rx) = mpsc::channel(HANDLER_CAPACITY);
        let responses = ResponseStream {
            correlation_id: correlation_id.clone(),
            rx,
        };

        let task = tokio::spawn(handler(responses));
        let completions = self.completions.clone();
        let id = correlation_id.clone();

        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ErrorReport::from_boxed(&e)),
                Err(e) => Err(ErrorReport::new(e)),
            };

            completions
                .send(Completion {
                    correlation_id: id,
                    generation,
                    outcome,
                })
                .ok();
        });

        trace!(%correlation_id, generation, "Registered response handler");
        self.registrations.insert(
            correlation_id,
            Registration {
                generation,
                cancel,
                sender,
            },
        );
    }

    /// Removes the registration with the given generation, leaving any other one in place
    fn remove(&mut self, correlation_id: &CorrelationId, generation: u64) {
        let current = self
            .registrations
            .get(correlation_id)
            .map(|r| r.generation == generation)
            .unwrap_or(false);

        if current {
            self.registrations.remove(correlation_id);
            trace!(%correlation_id, generation, "Deregistered response handler");
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            correlation_id,
            generation,
            outcome,
        } = completion;

        self.remove(&correlation_id, generation);

        match outcome {
            Ok(()) => trace!(%correlation_id, "Response handler finished"),
            Err(error) => {
                warn!(%correlation_id, %error, "Response handler failed");
                self.supervisor.report(ServiceEvent::HandlerFailed {
                    correlation_id,
                    error,
                });
            }
        }
    }

    async fn dispatch(&mut self, message: Message, token: &CancellationToken) {
        let correlation_id = message.correlation_id.clone();

        let registration = match self.registrations.get(&correlation_id) {
            Some(registration) => registration,
            None => {
                trace!(%correlation_id, "Dropping response without handler");
                return;
            }
        };

        let generation = registration.generation;
        let cancel = registration.cancel.clone();
        let sender = registration.sender.clone();

        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = cancel.cancelled() => {
                trace!(%correlation_id, "Dropping response for cancelled handler");
                self.remove(&correlation_id, generation);
            }
            result = sender.send(message) => {
                if result.is_err() {
                    // Handler returned before its completion has been processed
                    trace!(%correlation_id, "Dropping response for finished handler");
                    self.remove(&correlation_id, generation);
                }
            }
        }
    }
}
