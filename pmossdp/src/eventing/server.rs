//! Serveur de callback GENA : réception des NOTIFY des devices

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError, bounded};
use tracing::{debug, info, trace, warn};

use super::SubscriptionTable;
use super::parser::parse_property_set;
use crate::errors::Result;
use crate::ssdp::HttpRequest;

/// Traitement d'une connexion entrante
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Exécute le traitement des connexions acceptées par le serveur de callback
pub trait ConnectionExecutor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Un thread par connexion, sans limite
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPerConnection;

impl ConnectionExecutor for ThreadPerConnection {
    fn execute(&self, job: Job) {
        if let Err(e) = thread::Builder::new()
            .name("gena-notify".to_string())
            .spawn(job)
        {
            warn!(error = %e, "Cannot spawn NOTIFY thread, connection dropped");
        }
    }
}

/// Pool de threads de taille fixe avec une file d'attente bornée.
///
/// Quand la file est pleine, la connexion est fermée sans réponse.
pub struct BoundedPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl BoundedPool {
    pub fn new(workers: usize, queue: usize) -> io::Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue);
        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("gena-worker-{}", index))
                .spawn(move || {
                    for job in receiver.iter() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!("NOTIFY job panicked");
                        }
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }
}

impl ConnectionExecutor for BoundedPool {
    fn execute(&self, job: Job) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("NOTIFY queue full, connection dropped"),
            Err(TrySendError::Disconnected(_)) => warn!("NOTIFY pool stopped, connection dropped"),
        }
    }
}

impl Drop for BoundedPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Serveur TCP acceptant les NOTIFY sur `0.0.0.0:port`
pub(crate) struct CallbackServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CallbackServer {
    pub(crate) fn start(
        port: u16,
        table: Arc<SubscriptionTable>,
        executor: Arc<dyn ConnectionExecutor>,
        io_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("gena-callback".to_string())
            .spawn(move || accept_loop(listener, flag, table, executor, io_timeout))?;

        info!("✅ GENA callback server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            stop,
            thread: Some(thread),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);

        // réveille accept() bloqué
        let wake = SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_addr.port()));
        match TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            Ok(_) => {
                if thread.join().is_err() {
                    warn!("GENA callback thread panicked");
                }
                info!("GENA callback server on {} stopped", self.local_addr);
            }
            Err(e) => warn!(error = %e, "Cannot wake GENA callback server, thread left detached"),
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    table: Arc<SubscriptionTable>,
    executor: Arc<dyn ConnectionExecutor>,
    io_timeout: Duration,
) {
    for stream in listener.incoming() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                let table = Arc::clone(&table);
                executor.execute(Box::new(move || handle_connection(stream, &table, io_timeout)));
            }
            Err(e) => warn!(error = %e, "Incoming NOTIFY connection failed"),
        }
    }
    debug!("GENA callback accept loop finished");
}

fn handle_connection(stream: TcpStream, table: &SubscriptionTable, io_timeout: Duration) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            debug!(error = %e, "NOTIFY connection closed before processing");
            return;
        }
    };
    if let Err(e) = serve_notify(stream, peer, table, io_timeout) {
        warn!(from = %peer, error = %e, "NOTIFY processing failed");
    }
}

fn serve_notify(
    mut stream: TcpStream,
    peer: SocketAddr,
    table: &SubscriptionTable,
    io_timeout: Duration,
) -> Result<()> {
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;

    let raw = read_notify_request(&mut stream)?;
    // certains devices terminent la requête par un octet nul
    let packet = String::from_utf8_lossy(&raw).replace('\0', " ");
    if packet.trim().is_empty() {
        trace!(from = %peer, "Empty callback connection");
        return Ok(());
    }
    debug!(
        from = %peer,
        "📨 NOTIFY payload\n<details>\n\n```\n{}\n```\n</details>\n",
        packet
    );

    let request = match HttpRequest::parse(&packet) {
        Ok(request) => request,
        Err(e) => {
            debug!(from = %peer, error = %e, "Unparsable callback request");
            write_response(&mut stream, "400 Bad Request")?;
            return Ok(());
        }
    };
    if request.command() != Some("NOTIFY") {
        write_response(&mut stream, "405 Method Not Allowed")?;
        return Ok(());
    }

    let subscription = request.field("SID").and_then(|sid| {
        table
            .find_by_sid_and_ip(sid, peer.ip())
            .or_else(|| table.find_by_sid(sid))
    });
    let status = if subscription.is_some() {
        "200 OK"
    } else {
        "412 Precondition Failed"
    };
    write_response(&mut stream, status)?;
    let _ = stream.shutdown(Shutdown::Both);
    drop(stream);

    let Some(subscription) = subscription else {
        debug!(from = %peer, sid = ?request.field("SID"), "NOTIFY for unknown subscription");
        return Ok(());
    };

    for (name, value) in parse_property_set(request.body().unwrap_or_default())? {
        trace!(sid = %subscription.info.sid, variable = %name, "State variable changed");
        subscription
            .handler
            .handle_state_variable_event(&name, &value);
    }
    Ok(())
}

fn write_response(stream: &mut TcpStream, status: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// Lit une requête jusqu'à EOF, un octet nul final ou un corps complet
///
/// Un timeout de lecture termine la lecture avec les données déjà reçues.
fn read_notify_request(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let read = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                debug!("NOTIFY read timed out, processing {} bytes", data.len());
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        data.extend_from_slice(&buf[..read]);
        if data.last() == Some(&0) || request_complete(&data) {
            break;
        }
    }
    Ok(data)
}

fn request_complete(data: &[u8]) -> bool {
    let Some(head_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&data[..head_end]);
    let content_length = head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("Content-Length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    });
    match content_length {
        Some(length) => data.len() >= head_end + 4 + length,
        None => false,
    }
}
