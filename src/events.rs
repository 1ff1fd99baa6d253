//! Asynchronous event recording.
//!
//! Each handler runs on its own worker thread behind an unbounded channel,
//! so [`EventBus::emit`] only stamps the event and enqueues it. Shutdown
//! enqueues a stop message; workers drain everything before it and then close
//! their handler. Dropping the last bus handle shuts down implicitly.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Local};
use crossbeam::channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, StoreError};
use crate::hwio::BooleanOutput;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Component that produced the event.
    pub name: String,
    pub action: String,
    pub metadata: Option<String>,
    pub time: DateTime<Local>,
}

pub trait EventHandler: Send + 'static {
    fn name(&self) -> &str;

    fn accepts(&self, _event: &Event) -> bool {
        true
    }

    fn write(&mut self, event: &Event) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Only passes events whose component name matches.
pub struct ComponentFilter<H> {
    component: String,
    inner: H,
}

impl<H: EventHandler> ComponentFilter<H> {
    pub fn new(component: impl Into<String>, inner: H) -> Self {
        Self {
            component: component.into(),
            inner,
        }
    }
}

impl<H: EventHandler> EventHandler for ComponentFilter<H> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn accepts(&self, event: &Event) -> bool {
        event.name == self.component && self.inner.accepts(event)
    }

    fn write(&mut self, event: &Event) -> Result<(), Error> {
        self.inner.write(event)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

enum Message {
    Event(Arc<Event>),
    Stop,
}

struct Worker {
    name: String,
    tx: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    workers: Vec<Worker>,
}

impl Inner {
    fn shutdown(&self) {
        for worker in &self.workers {
            let _ = worker.tx.send(Message::Stop);
        }
        for worker in &self.workers {
            let handle = worker
                .handle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(handler = %worker.name, "event worker panicked");
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    /// A bus with no handlers; emitting is a no-op.
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                clock: Arc::new(SystemClock::new()),
                workers: Vec::new(),
            }),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.inner.workers.iter().map(|w| w.name.as_str()).collect();
        f.debug_struct("EventBus").field("handlers", &names).finish()
    }
}

pub struct EventBusBuilder {
    clock: Arc<dyn Clock>,
    handlers: Vec<Box<dyn EventHandler>>,
}

impl EventBusBuilder {
    pub fn handler(mut self, handler: impl EventHandler) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn boxed_handler(mut self, handler: Box<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<EventBus, Error> {
        let mut workers = Vec::with_capacity(self.handlers.len());
        for handler in self.handlers {
            let name = handler.name().to_owned();
            let (tx, rx) = unbounded();
            let handle = std::thread::Builder::new()
                .name(format!("events-{name}"))
                .spawn(move || run_worker(handler, rx))
                .map_err(StoreError::Io)?;
            workers.push(Worker {
                name,
                tx,
                handle: Mutex::new(Some(handle)),
            });
        }
        debug!(handlers = workers.len(), "event bus started");
        Ok(EventBus {
            inner: Arc::new(Inner {
                clock: self.clock,
                workers,
            }),
        })
    }
}

fn run_worker(mut handler: Box<dyn EventHandler>, rx: Receiver<Message>) {
    for message in rx {
        match message {
            Message::Event(event) => {
                if !handler.accepts(&event) {
                    continue;
                }
                if let Err(e) = handler.write(&event) {
                    warn!(handler = handler.name(), error = %e, "event handler write failed");
                }
            }
            Message::Stop => break,
        }
    }
    if let Err(e) = handler.close() {
        warn!(handler = handler.name(), error = %e, "event handler close failed");
    }
}

impl EventBus {
    pub fn builder(clock: Arc<dyn Clock>) -> EventBusBuilder {
        EventBusBuilder {
            clock,
            handlers: Vec::new(),
        }
    }

    pub fn emit(&self, name: &str, action: &str, metadata: Option<&str>) {
        if self.inner.workers.is_empty() {
            return;
        }
        let event = Arc::new(Event {
            name: name.to_owned(),
            action: action.to_owned(),
            metadata: metadata.map(str::to_owned),
            time: self.inner.clock.wall(),
        });
        for worker in &self.inner.workers {
            // A stopped worker has already flushed; late events are dropped.
            let _ = worker.tx.send(Message::Event(Arc::clone(&event)));
        }
    }

    /// Drain and close every handler. Later emits are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

/// Collects events in memory; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryHandler {
    events: Arc<Mutex<Vec<Event>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemoryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventHandler for MemoryHandler {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&mut self, event: &Event) -> Result<(), Error> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        *self.closed.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        Ok(())
    }
}

/// Appends `time\tname\taction\tmetadata` lines to a file.
pub struct LogFileHandler {
    out: BufWriter<File>,
}

impl LogFileHandler {
    pub fn append(path: &Path) -> Result<Self, Error> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(StoreError::Io)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StoreError::Io)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl EventHandler for LogFileHandler {
    fn name(&self) -> &str {
        "log_file"
    }

    fn write(&mut self, event: &Event) -> Result<(), Error> {
        writeln!(
            self.out,
            "{}\t{}\t{}\t{}",
            event.time.format("%Y-%m-%d %H:%M:%S%.6f"),
            event.name,
            event.action,
            event.metadata.as_deref().unwrap_or("None"),
        )
        .and_then(|_| self.out.flush())
        .map_err(StoreError::Io)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.out.flush().map_err(StoreError::Io)?;
        Ok(())
    }
}

/// Mirrors events into the `tracing` log.
#[derive(Debug, Clone, Default)]
pub struct TracingHandler;

impl EventHandler for TracingHandler {
    fn name(&self) -> &str {
        "tracing"
    }

    fn write(&mut self, event: &Event) -> Result<(), Error> {
        info!(
            target: "operant::events",
            component = %event.name,
            action = %event.action,
            metadata = event.metadata.as_deref().unwrap_or(""),
            "event"
        );
        Ok(())
    }
}

/// Packs an event into a framed bit sequence: a `true` start bit, the name,
/// action and metadata as fixed-width space-padded bytes (MSB first), then a
/// `false` stop bit. Metadata bytes are omitted when the event has none.
/// Sequences are cached per `(name, action, metadata)`.
#[derive(Debug, Clone)]
pub struct BitEncoder {
    pub name_bytes: usize,
    pub action_bytes: usize,
    pub metadata_bytes: usize,
    cache: HashMap<(String, String, Option<String>), Vec<bool>>,
}

impl Default for BitEncoder {
    fn default() -> Self {
        Self::new(4, 4, 16)
    }
}

fn fixed_width(s: &str, width: usize) -> impl Iterator<Item = u8> + '_ {
    s.bytes().chain(std::iter::repeat(b' ')).take(width)
}

fn push_bits(out: &mut Vec<bool>, byte: u8) {
    for shift in (0..8).rev() {
        out.push((byte >> shift) & 1 == 1);
    }
}

impl BitEncoder {
    pub fn new(name_bytes: usize, action_bytes: usize, metadata_bytes: usize) -> Self {
        Self {
            name_bytes,
            action_bytes,
            metadata_bytes,
            cache: HashMap::new(),
        }
    }

    pub fn encode(&mut self, event: &Event) -> &[bool] {
        let key = (
            event.name.clone(),
            event.action.clone(),
            event.metadata.clone(),
        );
        let (name_bytes, action_bytes, metadata_bytes) =
            (self.name_bytes, self.action_bytes, self.metadata_bytes);
        self.cache.entry(key).or_insert_with(|| {
            let mut bits = Vec::with_capacity(2 + 8 * (name_bytes + action_bytes + metadata_bytes));
            bits.push(true);
            for byte in fixed_width(&event.name, name_bytes) {
                push_bits(&mut bits, byte);
            }
            for byte in fixed_width(&event.action, action_bytes) {
                push_bits(&mut bits, byte);
            }
            if let Some(metadata) = &event.metadata {
                for byte in fixed_width(metadata, metadata_bytes) {
                    push_bits(&mut bits, byte);
                }
            }
            bits.push(false);
            bits
        })
    }

    /// The encoded bits as analog levels, each bit repeated `upsample` times
    /// and scaled to `scaling` volts.
    pub fn analog(&mut self, event: &Event, upsample: usize, scaling: f64) -> Vec<f64> {
        self.encode(event)
            .iter()
            .flat_map(|&bit| std::iter::repeat(if bit { scaling } else { 0.0 }).take(upsample.max(1)))
            .collect()
    }
}

/// Writes encoded events out of a digital line, e.g. into an
/// electrophysiology recording system.
pub struct BitEncoderHandler {
    encoder: BitEncoder,
    output: BooleanOutput,
}

impl BitEncoderHandler {
    pub fn new(encoder: BitEncoder, output: BooleanOutput) -> Self {
        Self { encoder, output }
    }
}

impl EventHandler for BitEncoderHandler {
    fn name(&self) -> &str {
        "bit_encoder"
    }

    fn write(&mut self, event: &Event) -> Result<(), Error> {
        let bits = self.encoder.encode(event);
        self.output.write_sequence(bits)?;
        Ok(())
    }
}
