//! Transport-agnostic service surface of the debugger.
//!
//! The same method set is served over a TCP listener (remote frontends) or over a
//! single pre-connected in-process pipe stream. One debugger state exists per
//! server: a breakpoint created by one client is immediately visible to all
//! others, stop events are broadcast to every connected client.

pub mod proto;
pub mod rpc;
pub mod transport;
pub mod worker;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::variable::execute::QueryResult;
use crate::debugger::{EventHook, PlaceDescriptorOwned};
use crate::service::proto::{Event, Request, Response};
use crate::service::rpc::RpcHandler;
use crate::service::transport::{PipeTransport, TcpTransport, Transport};
use crate::service::worker::DebuggerWorker;
use log::{info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Server behavior configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Accept multiple clients sharing one debugger state. With a single client
    /// mode the server shuts down after its client disconnects.
    pub accept_multiclient: bool,
    /// Resume the tracee when the last client disconnects.
    pub continue_on_disconnect: bool,
}

/// Queues of unsolicited events, one per connected client.
#[derive(Default)]
pub struct EventBus {
    queues: Mutex<HashMap<u64, Vec<Event>>>,
}

impl EventBus {
    fn subscribe(&self, client: u64) {
        self.queues.lock().unwrap().insert(client, vec![]);
    }

    fn unsubscribe(&self, client: u64) {
        self.queues.lock().unwrap().remove(&client);
    }

    fn broadcast(&self, event: Event) {
        let mut queues = self.queues.lock().unwrap();
        for queue in queues.values_mut() {
            queue.push(event.clone());
        }
    }

    fn drain(&self, client: u64) -> Vec<Event> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .get_mut(&client)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

/// Debugger event hook that broadcasts stops into the event bus.
pub struct ServerHook {
    bus: Arc<EventBus>,
}

impl EventHook for ServerHook {
    fn on_breakpoint(
        &self,
        pc: RelocatedAddress,
        num: u32,
        place: Option<PlaceDescriptorOwned>,
    ) -> Result<(), Error> {
        self.bus.broadcast(Event::BreakpointHit {
            id: num,
            pc: pc.as_usize(),
            place: place.as_ref().map(proto::place_view),
        });
        Ok(())
    }

    fn on_watchpoint(&self, pc: RelocatedAddress, num: u32) -> Result<(), Error> {
        self.bus.broadcast(Event::WatchpointHit {
            id: num,
            pc: pc.as_usize(),
        });
        Ok(())
    }

    fn on_step(
        &self,
        pc: RelocatedAddress,
        place: Option<PlaceDescriptorOwned>,
    ) -> Result<(), Error> {
        self.bus.broadcast(Event::Step {
            pc: pc.as_usize(),
            place: place.as_ref().map(proto::place_view),
        });
        Ok(())
    }

    fn on_signal(&self, signal: Signal) {
        self.bus.broadcast(Event::Signal {
            signal: signal.to_string(),
        });
    }

    fn on_tracepoint(&self, num: u32, values: &[QueryResult]) -> Result<(), Error> {
        self.bus.broadcast(Event::Tracepoint {
            id: num,
            values: values.iter().map(proto::query_result_view).collect(),
        });
        Ok(())
    }

    fn on_exit(&self, code: i32) {
        self.bus.broadcast(Event::Exited { code });
    }
}

/// The debugger service: owns the shared debugger state and serves clients.
pub struct Server {
    worker: Arc<DebuggerWorker>,
    running: Arc<AtomicBool>,
    bus: Arc<EventBus>,
    tracee_pid: Pid,
    config: ServerConfig,
    next_client_id: AtomicU64,
}

impl Server {
    /// Create a server around the pinned debugger worker.
    /// Install the hook returned by [`Server::event_channel`] into the debugger
    /// builder beforehand to get events broadcast.
    pub fn new(
        worker: DebuggerWorker,
        tracee_pid: Pid,
        config: ServerConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            worker: Arc::new(worker),
            running: Arc::new(AtomicBool::new(false)),
            bus,
            tracee_pid,
            config,
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Create the event bus and a hook writing into it.
    pub fn event_channel() -> (Arc<EventBus>, ServerHook) {
        let bus = Arc::new(EventBus::default());
        let hook = ServerHook { bus: bus.clone() };
        (bus, hook)
    }

    fn handler(&self) -> RpcHandler {
        RpcHandler::new(
            self.worker.clone(),
            self.running.clone(),
            self.tracee_pid,
            self.config.accept_multiclient,
        )
    }

    /// Serve clients on a TCP listener. Blocks until the server stops: after the
    /// first disconnect in single client mode, or forever in multiclient mode.
    pub fn serve_tcp(&self, listener: TcpListener) -> Result<(), Error> {
        info!(target: "server", "listen on {:?}", listener.local_addr());

        if !self.config.accept_multiclient {
            let (stream, peer) = listener.accept()?;
            info!(target: "server", "client connected: {peer}");
            let transport = TcpTransport::new(stream)?;
            self.serve_client(transport);
            self.last_client_left();
            return Ok(());
        }

        let clients_alive = Arc::new(AtomicU64::new(0));
        std::thread::scope(|scope| -> Result<(), Error> {
            loop {
                let (stream, peer) = listener.accept()?;
                info!(target: "server", "client connected: {peer}");
                let transport = match TcpTransport::new(stream) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(target: "server", "client setup failed: {e:#}");
                        continue;
                    }
                };

                clients_alive.fetch_add(1, Ordering::SeqCst);
                let clients_alive = clients_alive.clone();
                scope.spawn(move || {
                    self.serve_client(transport);
                    if clients_alive.fetch_sub(1, Ordering::SeqCst) == 1 {
                        self.last_client_left();
                    }
                });
            }
        })
    }

    /// Serve the single pre-connected in-process stream.
    pub fn serve_pipe(&self, mut listener: transport::PipeListener) -> Result<(), Error> {
        let stream: PipeTransport = listener.accept()?;
        self.serve_client(stream);
        self.last_client_left();
        Ok(())
    }

    fn serve_client(&self, mut transport: impl Transport) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        self.bus.subscribe(client_id);
        let handler = self.handler();

        loop {
            let message = match transport.read_message() {
                Ok(message) => message,
                Err(e) => {
                    info!(target: "server", "client disconnected: {e:#}");
                    break;
                }
            };

            let response = match serde_json::from_value::<Request>(message) {
                Ok(request) => handler.handle(request),
                Err(e) => Response::error(
                    0,
                    proto::RpcError {
                        code: proto::CODE_BAD_REQUEST,
                        message: format!("malformed request: {e}"),
                        data: None,
                    },
                ),
            };

            let encoded = serde_json::to_value(&response).expect("response is serializable");
            if let Err(e) = transport.write_message(&encoded) {
                warn!(target: "server", "client write failed: {e:#}");
                break;
            }

            // flush stop events accumulated while the request was processed
            for event in self.bus.drain(client_id) {
                let notification = serde_json::json!({ "id": 0, "result": event });
                if transport.write_message(&notification).is_err() {
                    break;
                }
            }
        }

        self.bus.unsubscribe(client_id);
    }

    /// Handle the disconnect of the last client: optionally resume the tracee so it
    /// keeps running between client sessions.
    fn last_client_left(&self) {
        if !self.config.continue_on_disconnect {
            return;
        }

        let worker = self.worker.clone();
        let running = self.running.clone();
        info!(target: "server", "no clients left, resume the tracee");
        std::thread::spawn(move || {
            running.store(true, Ordering::SeqCst);
            let result = worker.with_debugger(|debugger| debugger.continue_debugee());
            running.store(false, Ordering::SeqCst);
            match result {
                Ok(Err(e)) => warn!(target: "server", "resume on disconnect: {e:#}"),
                Err(e) => warn!(target: "server", "resume on disconnect: {e:#}"),
                Ok(Ok(_)) => {}
            }
        });
    }
}
