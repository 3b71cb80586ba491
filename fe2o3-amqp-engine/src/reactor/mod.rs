//! Single threaded reactor
//!
//! The reactor owns connections and drives them. Each pass of [`Reactor::process`]
//! fires due timer tasks, ticks the transports, then drains the event collector
//! and dispatches every event, in the order it was produced, to
//!
//! 1. the handler of the connection the event belongs to, or the reactor's
//!    default handlers when the connection has none,
//! 2. the global handler.
//!
//! A handler error does not interrupt the pass. Errors are collected and
//! returned together once the pass is over.
//!
//! With the `net` feature the reactor also accepts and opens TCP connections and
//! moves bytes between them and their transports, see [`Reactor::run_async`].

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use slab::Slab;

use crate::{
    connection::Builder,
    endpoint::ConnectionId,
    event::{Collector, Event, EventType},
    handler::{dispatch, Context, Handler, HandlerError},
    Connection,
};

mod container;
mod selectable;
mod timer;

#[cfg(feature = "net")]
mod net;

pub use container::Container;
pub use selectable::Selectable;
pub use timer::{TaskId, Timer};

/// Default time a reactor waits for I/O before starting another pass
pub const DEFAULT_TIMEOUT: Duration = Duration::from_micros(3_141_590);

/// Reactor error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Errors returned by handlers during one pass
    #[error("{} handler error(s), the first being: {}", .0.len(), first_error(.0))]
    Handler(Vec<HandlerError>),

    /// Engine error
    #[error(transparent)]
    Engine(#[from] crate::error::Error),
}

fn first_error(errors: &[HandlerError]) -> String {
    errors
        .first()
        .map(|err| err.to_string())
        .unwrap_or_default()
}

/// Reactor builder
#[derive(Default)]
pub struct ReactorBuilder {
    timeout: Option<Duration>,
    handlers: Vec<Box<dyn Handler>>,
    global_handler: Option<Box<dyn Handler>>,
}

impl std::fmt::Debug for ReactorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorBuilder")
            .field("timeout", &self.timeout)
            .field("handlers", &self.handlers.len())
            .field("global_handler", &self.global_handler.is_some())
            .finish()
    }
}

impl ReactorBuilder {
    /// How long to wait for I/O in one pass
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Appends a handler to the default chain
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Handler that sees every event after the others
    pub fn global_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.global_handler = Some(Box::new(handler));
        self
    }

    /// Builds the reactor
    pub fn build(self) -> Reactor {
        let mut reactor = Reactor::new();
        reactor.timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        reactor.handlers = self.handlers;
        reactor.global_handler = self.global_handler;
        reactor
    }
}

/// Single threaded event loop over a set of connections
pub struct Reactor {
    pub(crate) collector: Collector,
    pub(crate) connections: Slab<Connection>,
    pub(crate) handlers: Vec<Box<dyn Handler>>,
    pub(crate) connection_handlers: HashMap<ConnectionId, Box<dyn Handler>>,
    pub(crate) global_handler: Option<Box<dyn Handler>>,
    task_handlers: HashMap<TaskId, Box<dyn Handler>>,
    /// Connections past their final event, removed once their output is flushed
    finished: Vec<ConnectionId>,
    pub(crate) timer: Timer,
    errors: Vec<HandlerError>,
    pub(crate) timeout: Duration,
    now: Instant,
    next_tick: Option<Instant>,
    started: bool,
    stopped: bool,
    yielded: bool,
    quiesced: bool,

    #[cfg(feature = "net")]
    pub(crate) io: net::Io,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("connections", &self.connections.len())
            .field("handlers", &self.handlers.len())
            .field("timer", &self.timer)
            .field("timeout", &self.timeout)
            .field("started", &self.started)
            .field("stopped", &self.stopped)
            .field("quiesced", &self.quiesced)
            .finish()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Creates a reactor without handlers
    pub fn new() -> Self {
        Self {
            collector: Collector::new(),
            connections: Slab::new(),
            handlers: Vec::new(),
            connection_handlers: HashMap::new(),
            global_handler: None,
            task_handlers: HashMap::new(),
            finished: Vec::new(),
            timer: Timer::default(),
            errors: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            now: Instant::now(),
            next_tick: None,
            started: false,
            stopped: false,
            yielded: false,
            quiesced: false,
            #[cfg(feature = "net")]
            io: net::Io::default(),
        }
    }

    /// Creates a builder
    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::default()
    }

    /// The collector events of every owned connection go to
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Appends a handler to the default chain
    pub fn add_handler(&mut self, handler: impl Handler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Replaces the global handler
    pub fn set_global_handler(&mut self, handler: impl Handler + 'static) {
        self.global_handler = Some(Box::new(handler));
    }

    /// Queues [`EventType::ReactorInit`]
    pub fn start(&mut self) {
        if !self.started {
            self.started = true;
            self.mark();
            self.collector.put(Event::new(EventType::ReactorInit));
        }
    }

    /// Runs one pass. Returns whether the reactor has more to do, or the errors
    /// returned by handlers during the pass.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub fn process(&mut self) -> Result<bool, Error> {
        self.mark();
        self.fire_timers();
        self.tick_connections();

        let mut dispatched = 0usize;
        'pass: loop {
            while let Some(event) = self.collector.pop() {
                dispatched += 1;
                self.dispatch(&event);
                if event.kind() == EventType::ConnectionFinal {
                    self.finished.extend(event.connection_id());
                }
                if self.yielded {
                    self.yielded = false;
                    break 'pass;
                }
            }
            for (_, conn) in self.connections.iter_mut() {
                if conn.is_bound() {
                    conn.process_output();
                }
            }
            if self.collector.is_empty() {
                break;
            }
        }

        self.quiesced = dispatched == 0;
        if self.quiesced {
            self.dispatch(&Event::new(EventType::ReactorQuiesced));
        }

        self.remove_finished();
        for (_, conn) in self.connections.iter_mut() {
            conn.reclaim();
        }

        if !self.errors.is_empty() {
            return Err(Error::Handler(std::mem::take(&mut self.errors)));
        }
        Ok(!self.stopped && self.has_work())
    }

    /// Stops the reactor and dispatches what is left, ending with
    /// [`EventType::ReactorFinal`]
    pub fn stop(&mut self) -> Result<(), Error> {
        self.stopped = true;
        self.collector.put(Event::new(EventType::ReactorFinal));
        while let Some(event) = self.collector.pop() {
            self.dispatch(&event);
        }
        match self.errors.is_empty() {
            true => Ok(()),
            false => Err(Error::Handler(std::mem::take(&mut self.errors))),
        }
    }

    /// Runs passes until there is nothing more to do, without any I/O
    pub fn run(&mut self) -> Result<(), Error> {
        self.start();
        while self.process()? {}
        self.stop()
    }

    /// Whether a handler asked the reactor to stop
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Makes the current pass end after the event being dispatched
    pub fn yield_now(&mut self) {
        self.yielded = true;
    }

    /// Whether the last pass dispatched no events
    pub fn quiesced(&self) -> bool {
        self.quiesced
    }

    /// Updates the reactor's notion of the current time
    pub fn mark(&mut self) -> Instant {
        self.now = Instant::now();
        self.now
    }

    /// Time of the last [`mark`](Self::mark)
    pub fn now(&self) -> Instant {
        self.now
    }

    /// How long a pass waits for I/O
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets how long a pass waits for I/O
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Schedules a task, see [`Context::schedule`]
    pub fn schedule(&mut self, delay: Duration, handler: Option<Box<dyn Handler>>) -> TaskId {
        self.timer.schedule(self.now + delay, handler)
    }

    /// Cancels a task that has not fired yet
    pub fn cancel(&mut self, task: TaskId) -> bool {
        self.timer.cancel(task)
    }

    /// Creates a connection with default settings. Its events go to `handler`
    /// instead of the default chain if one is given.
    pub fn connection(&mut self, handler: Option<Box<dyn Handler>>) -> ConnectionId {
        self.connection_with(Connection::builder(), handler)
    }

    /// Creates a connection from a builder
    pub fn connection_with(
        &mut self,
        builder: Builder,
        handler: Option<Box<dyn Handler>>,
    ) -> ConnectionId {
        let entry = self.connections.vacant_entry();
        let id = ConnectionId(entry.key());
        let mut conn = builder.build();
        conn.id = id;
        conn.collect(self.collector.clone());
        entry.insert(conn);
        if let Some(handler) = handler {
            self.connection_handlers.insert(id, handler);
        }
        id
    }

    /// Looks up a connection
    pub fn get_connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.0)
    }

    /// Looks up a connection for modification
    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id.0)
    }

    /// Ids of the owned connections
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.iter().map(|(key, _)| ConnectionId(key))
    }

    fn remove_finished(&mut self) {
        let finished = std::mem::take(&mut self.finished);
        for id in finished {
            let flushed = self
                .connections
                .get(id.0)
                .and_then(|conn| conn.transport())
                .map(|t| t.is_head_closed() || t.output.is_empty())
                .unwrap_or(true);
            match flushed {
                true => self.remove_connection(id),
                false => self.finished.push(id),
            }
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        if self.connections.contains(id.0) {
            self.connections.remove(id.0);
        }
        self.connection_handlers.remove(&id);
        #[cfg(feature = "net")]
        self.io.sockets.remove(&id);
    }

    fn has_work(&self) -> bool {
        #[cfg(feature = "net")]
        let listening = !self.io.listeners.is_empty();
        #[cfg(not(feature = "net"))]
        let listening = false;

        !self.connections.is_empty() || !self.timer.is_empty() || listening
    }

    fn fire_timers(&mut self) {
        for (task, handler) in self.timer.fire(self.now) {
            if let Some(handler) = handler {
                self.task_handlers.insert(task, handler);
            }
            self.collector.put(Event::task(task));
        }
    }

    fn tick_connections(&mut self) {
        let now = self.now;
        self.next_tick = self
            .connections
            .iter_mut()
            .filter(|(_, conn)| conn.is_bound())
            .filter_map(|(_, conn)| conn.tick(now))
            .min();
    }

    /// Earliest instant the reactor has to wake up at
    pub(crate) fn deadline(&mut self) -> Instant {
        let mut deadline = self.now + self.timeout;
        if let Some(timer) = self.timer.deadline() {
            deadline = deadline.min(timer);
        }
        if let Some(tick) = self.next_tick {
            deadline = deadline.min(tick);
        }
        deadline
    }

    fn dispatch(&mut self, event: &Event) {
        #[cfg(feature = "tracing")]
        tracing::trace!(?event, "dispatch");
        #[cfg(feature = "log")]
        log::trace!("dispatch event={:?}", event);

        let mut ctx = Context {
            connections: &mut self.connections,
            timer: &mut self.timer,
            stopped: &mut self.stopped,
            yielded: &mut self.yielded,
            now: self.now,
        };

        let task_handler = event
            .task_id()
            .and_then(|task| self.task_handlers.remove(&task));
        let connection_handler = event
            .connection_id()
            .and_then(|id| self.connection_handlers.get_mut(&id));

        let mut results = Vec::new();
        match (task_handler, connection_handler) {
            (Some(mut handler), _) => results.push(dispatch(handler.as_mut(), &mut ctx, event)),
            (None, Some(handler)) => results.push(dispatch(handler.as_mut(), &mut ctx, event)),
            (None, None) => {
                for handler in self.handlers.iter_mut() {
                    results.push(dispatch(handler.as_mut(), &mut ctx, event));
                }
            }
        }
        if let Some(global) = self.global_handler.as_mut() {
            results.push(dispatch(global.as_mut(), &mut ctx, event));
        }

        for result in results {
            if let Err(err) = result {
                #[cfg(feature = "tracing")]
                tracing::error!(?err, ?event, "handler error");
                #[cfg(feature = "log")]
                log::error!("handler error err={:?}, event={:?}", err, event);

                self.errors.push(err);
            }
        }
    }
}
