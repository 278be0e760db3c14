//! The proxy core: owns the shared simulator-facing UDP socket, the endpoint translation
//!  tables and the login listener, and creates one [SessionProxy] per remote simulator on
//!  demand. Datagrams arriving on the shared socket are demultiplexed to their circuit by
//!  source address.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::atomic_map::AtomicMap;
use crate::callbacks::{CallbackRegistry, PacketHandler};
use crate::config::ProxyConfig;
use crate::direction::Direction;
use crate::login::{self, LoginHook};
use crate::packet::{Packet, PacketType};
use crate::rewrite::AddressRewriter;
use crate::session::SessionProxy;
use crate::socket::SendSocket;

/// State shared between the core, all sessions and the login task.
pub(crate) struct Shared {
    pub(crate) config: ProxyConfig,
    pub(crate) remote_sink: Arc<dyn SendSocket>,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) rewriter: AddressRewriter,

    /// real simulator address to the proxy endpoint handed to the client; append-only
    endpoints: AtomicMap<SocketAddr, SocketAddr>,
    /// real simulator address to its circuit; append-only
    circuits: AtomicMap<SocketAddr, Arc<SessionProxy>>,
    /// serializes lazy circuit creation; never held while a session state lock is taken
    circuit_create_lock: tokio::sync::Mutex<()>,
    active_circuit: Mutex<Option<SocketAddr>>,

    pub(crate) login_request_hook: Mutex<Option<LoginHook>>,
    pub(crate) login_response_hook: Mutex<Option<LoginHook>>,

    /// Incoming injections made before any circuit has seen its first client datagram.
    pub(crate) queued_incoming: Mutex<Vec<Packet>>,
    /// Outgoing injections made before any circuit is active; flushed after login.
    queued_outgoing: Mutex<Vec<Packet>>,
}

impl Shared {
    pub(crate) fn new(config: ProxyConfig, remote_sink: Arc<dyn SendSocket>) -> Shared {
        Shared {
            config,
            remote_sink,
            callbacks: CallbackRegistry::new(),
            rewriter: AddressRewriter::standard(),
            endpoints: AtomicMap::new(),
            circuits: AtomicMap::new(),
            circuit_create_lock: tokio::sync::Mutex::new(()),
            active_circuit: Mutex::new(None),
            login_request_hook: Mutex::new(None),
            login_response_hook: Mutex::new(None),
            queued_incoming: Mutex::new(Vec::new()),
            queued_outgoing: Mutex::new(Vec::new()),
        }
    }

    /// Routine notifications honor the `verbose` switch.
    pub(crate) fn notice(&self, message: std::fmt::Arguments<'_>) {
        if self.config.verbose {
            info!("{}", message);
        }
        else {
            debug!("{}", message);
        }
    }

    /// The proxy endpoint standing in for `real`, creating the circuit (client-facing socket,
    ///  receive loop, maintenance task) on first sight. Idempotent: repeated calls for the same
    ///  simulator return the same endpoint.
    pub(crate) async fn proxy_endpoint(self: &Arc<Self>, real: SocketAddr) -> anyhow::Result<SocketAddr> {
        if let Some(local) = self.endpoints.get(&real) {
            return Ok(local);
        }

        let _guard = self.circuit_create_lock.lock().await;
        if let Some(local) = self.endpoints.get(&real) {
            return Ok(local);
        }

        let client_socket = Arc::new(UdpSocket::bind((self.config.client_facing_address, 0)).await?);
        let local = client_socket.local_addr()?;
        self.notice(format_args!("creating proxy for {:?} at {:?}", real, local));

        let session = Arc::new(SessionProxy::new(
            self.clone(),
            real,
            local,
            Arc::new(client_socket.clone()),
        ));
        session.spawn_loops(client_socket);

        self.circuits.insert(real, session);
        self.endpoints.insert(real, local);
        Ok(local)
    }

    pub(crate) fn set_active_circuit(&self, real: SocketAddr) {
        self.notice(format_args!("activating circuit {:?}", real));
        *self.active_circuit.lock().expect("active circuit lock poisoned") = Some(real);
    }

    pub(crate) fn session_for(&self, real: SocketAddr) -> Option<Arc<SessionProxy>> {
        self.circuits.get(&real)
    }

    fn active_session(&self) -> Option<Arc<SessionProxy>> {
        let active = *self.active_circuit.lock().expect("active circuit lock poisoned");
        active.and_then(|real| self.circuits.get(&real))
    }

    /// Injects via the active circuit, or queues until one exists.
    pub(crate) async fn inject(&self, packet: Packet, direction: Direction) {
        match self.active_session() {
            Some(session) => session.inject(packet, direction).await,
            None => {
                debug!("queueing {} injection until a circuit is active", direction);
                let queue = match direction {
                    Direction::Incoming => &self.queued_incoming,
                    Direction::Outgoing => &self.queued_outgoing,
                };
                queue.lock().expect("injection queue lock poisoned").push(packet);
            }
        }
    }

    /// Flushes outgoing injections queued while no circuit was active. Called after login
    ///  establishes (or fails to establish) the active circuit.
    pub(crate) async fn flush_queued_outgoing(&self) {
        let Some(session) = self.active_session() else {
            return;
        };
        let queued = std::mem::take(
            &mut *self.queued_outgoing.lock().expect("injection queue lock poisoned"),
        );
        for packet in queued {
            session.inject(packet, Direction::Outgoing).await;
        }
    }

    /// Resets the sequencing state of every circuit. A fresh login starts a fresh session on
    ///  all of them.
    pub(crate) async fn reset_all_circuits(&self) {
        for session in self.circuits.snapshot().values() {
            session.reset().await;
        }
    }
}

/// The proxy engine. Construct, register callbacks and hooks, then [start](ProxyCore::start).
///
/// Circuits live for the rest of the process once created; [stop](ProxyCore::stop) only
///  releases the login listener.
pub struct ProxyCore {
    shared: Arc<Shared>,
    remote_socket: Arc<UdpSocket>,
    login_task: Option<JoinHandle<()>>,
}

impl ProxyCore {
    /// Validates the configuration and binds the shared simulator-facing socket. Bind failure
    ///  is fatal: without this socket there is no proxy.
    pub async fn new(config: ProxyConfig) -> anyhow::Result<ProxyCore> {
        config.validate()?;

        let remote_socket = Arc::new(UdpSocket::bind((config.remote_facing_address, 0)).await?);
        debug!("simulator-facing socket bound at {:?}", remote_socket.local_addr()?);

        let shared = Arc::new(Shared::new(config, Arc::new(remote_socket.clone())));
        Ok(ProxyCore {
            shared,
            remote_socket,
            login_task: None,
        })
    }

    /// Binds the login listener and spawns the login accept loop and the simulator-facing
    ///  receive loop. Failure to bind the login port is fatal.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((
            self.shared.config.client_facing_address,
            self.shared.config.login_port,
        )).await?;
        info!("proxy ready for login at http://{:?}/", listener.local_addr()?);

        self.login_task = Some(tokio::spawn(login::accept_loop(self.shared.clone(), listener)));
        // the receive loop runs for the rest of the process, like the circuits it feeds
        tokio::spawn(remote_recv_loop(self.shared.clone(), self.remote_socket.clone()));
        Ok(())
    }

    /// Releases the login listener. Established circuits keep running.
    pub fn stop(&mut self) {
        if let Some(task) = self.login_task.take() {
            task.abort();
        }
    }

    /// The proxy endpoint standing in for the simulator at `real`, creating its circuit if
    ///  this is the first sighting.
    pub async fn proxy_endpoint(&self, real: SocketAddr) -> anyhow::Result<SocketAddr> {
        self.shared.proxy_endpoint(real).await
    }

    /// Injects a packet into the active circuit, or queues it until a circuit becomes active
    ///  (Outgoing: until login; Incoming: additionally until the client's first datagram).
    pub async fn inject_packet(&self, packet: Packet, direction: Direction) {
        self.shared.inject(packet, direction).await;
    }

    pub fn add_callback(&self, packet_type: PacketType, direction: Direction, handler: PacketHandler) {
        self.shared.callbacks.add(packet_type, direction, handler);
    }

    pub fn remove_callback(&self, packet_type: PacketType, direction: Direction) {
        self.shared.callbacks.remove(packet_type, direction);
    }

    pub fn set_login_request_hook(&self, hook: Option<LoginHook>) {
        *self.shared.login_request_hook.lock().expect("login hook lock poisoned") = hook;
    }

    pub fn set_login_response_hook(&self, hook: Option<LoginHook>) {
        *self.shared.login_response_hook.lock().expect("login hook lock poisoned") = hook;
    }

    /// The address of the simulator-facing socket, mostly useful in tests.
    pub fn remote_facing_addr(&self) -> anyhow::Result<SocketAddr> {
        self.remote_socket.local_addr().map_err(|e| anyhow!(e))
    }
}

/// Receives datagrams from all simulators on the shared socket and routes each to its circuit
///  by source address. Datagrams from unknown peers are dropped.
async fn remote_recv_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 8192];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                warn!("error receiving on simulator-facing socket: {}", e);
                continue;
            }
        };

        let Some(session) = shared.session_for(from) else {
            shared.notice(format_args!("dropping datagram from unknown peer {:?}", from));
            continue;
        };

        let packet = match Packet::deser(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("unparseable packet from {:?}: {:#}", from, e);
                continue;
            }
        };
        session.handle_remote_packet(packet).await;
    }
}
