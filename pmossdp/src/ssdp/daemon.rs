//! Cycle de vie des démons de réception SSDP
//!
//! Un [`Daemon`] possède au plus un thread de réception. Le thread est seul
//! propriétaire de l'état du listener (tables d'inscriptions) ; les
//! inscriptions lui parviennent par un canal et sont appliquées entre deux
//! lectures du socket. Le démon démarre à la première inscription, s'arrête
//! quand il n'en reste plus, et passe dans l'état terminal `Crashed` si un
//! handler panique.
//!
//! Un handler peut s'inscrire ou se désinscrire depuis le thread démon : la
//! commande est alors mise en file sans attendre de réponse, et c'est le
//! thread démon qui s'arrête lui-même si plus aucune inscription ne reste.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::RECEIVE_BUFFER_SIZE;
use super::transport::MulticastTransport;
use crate::errors::{Result, SsdpError};

/// État observable d'un démon de réception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Un handler a paniqué ; les inscriptions sont refusées jusqu'à `reset()`
    Crashed,
}

impl DaemonPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DaemonPhase::Starting,
            2 => DaemonPhase::Running,
            3 => DaemonPhase::Stopping,
            4 => DaemonPhase::Crashed,
            _ => DaemonPhase::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn get(&self) -> DaemonPhase {
        DaemonPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, phase: DaemonPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    fn transition(&self, from: DaemonPhase, to: DaemonPhase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// État possédé par le thread démon
pub(crate) trait DaemonState: Send + 'static {
    type Command: Send + 'static;

    fn apply(&mut self, command: Self::Command);

    /// Nombre de clés d'inscription actives ; zéro arrête le démon
    fn registrations(&self) -> usize;

    /// Traite un datagramme ; une erreur est fatale pour le démon
    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Result<()>;

    fn clear(&mut self);
}

enum Envelope<C> {
    /// Commande d'un autre thread, qui attend le nombre d'inscriptions restantes
    Apply(C, Sender<usize>),
    /// Commande émise depuis un handler, sur le thread démon
    Queue(C),
    Stop,
}

struct RunningDaemon<C> {
    commands: Sender<Envelope<C>>,
    thread: JoinHandle<()>,
}

/// Ce qu'un handler peut atteindre sans prendre le verrou `running`
struct LoopHandle<C> {
    thread: ThreadId,
    commands: Sender<Envelope<C>>,
    local_addr: SocketAddr,
}

type Running<C> = Arc<Mutex<Option<RunningDaemon<C>>>>;
type Handle<C> = Arc<Mutex<Option<LoopHandle<C>>>>;

pub(crate) struct Daemon<S: DaemonState> {
    name: &'static str,
    running: Running<S::Command>,
    // jamais tenu pendant une attente
    handle: Handle<S::Command>,
    phase: Arc<PhaseCell>,
    count: Arc<AtomicUsize>,
}

impl<S: DaemonState> Daemon<S> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(Mutex::new(None)),
            handle: Arc::new(Mutex::new(None)),
            phase: Arc::new(PhaseCell::default()),
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn phase(&self) -> DaemonPhase {
        self.phase.get()
    }

    /// Adresse locale du socket tant que le démon tourne
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        if self.phase.get() != DaemonPhase::Running {
            return None;
        }
        self.handle.lock().as_ref().map(|h| h.local_addr)
    }

    /// Applique une inscription, en démarrant le démon si besoin
    ///
    /// `start` n'est appelé qu'au démarrage, dans le thread appelant, pour
    /// que les erreurs de bind remontent à l'appelant. Depuis le thread
    /// démon, la commande est mise en file et appliquée au retour du handler.
    pub(crate) fn register<F>(&self, command: S::Command, start: F) -> Result<()>
    where
        F: FnOnce() -> Result<(MulticastTransport, S)>,
    {
        let Some(command) = self.queue_on_daemon_thread(command) else {
            return Ok(());
        };

        let mut running = self.running.lock();
        if self.phase.get() == DaemonPhase::Crashed {
            self.reap(&mut running);
            return Err(SsdpError::DaemonCrashed(self.name));
        }
        if running.is_none() {
            *running = Some(self.start(start)?);
        }

        match Self::send(running.as_ref(), command) {
            Some(_) => Ok(()),
            None => {
                self.reap(&mut running);
                Err(SsdpError::DaemonCrashed(self.name))
            }
        }
    }

    /// Retire une inscription et arrête le démon s'il n'en reste aucune
    pub(crate) fn unregister(&self, command: S::Command) {
        let Some(command) = self.queue_on_daemon_thread(command) else {
            return;
        };

        let mut running = self.running.lock();
        if running.is_none() {
            return;
        }
        match Self::send(running.as_ref(), command) {
            Some(0) => self.stop(&mut running),
            Some(_) => {}
            None => self.reap(&mut running),
        }
    }

    /// Nombre d'inscriptions, tel qu'observé après la dernière commande appliquée
    pub(crate) fn registrations(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Sort de l'état `Crashed` ; `false` si le démon n'avait pas planté
    pub(crate) fn reset(&self) -> bool {
        let mut running = self.running.lock();
        if self.phase.get() != DaemonPhase::Crashed {
            return false;
        }
        self.reap(&mut running);
        self.phase.set(DaemonPhase::Stopped);
        info!("{} daemon reset after crash", self.name);
        true
    }

    /// Met la commande en file si l'appel vient d'un handler du démon
    ///
    /// Rend la commande quand l'appelant est un autre thread.
    fn queue_on_daemon_thread(&self, command: S::Command) -> Option<S::Command> {
        let handle = self.handle.lock();
        match handle.as_ref() {
            Some(h) if h.thread == thread::current().id() => {
                if h.commands.send(Envelope::Queue(command)).is_err() {
                    debug!("{} daemon already gone, command dropped", self.name);
                }
                None
            }
            _ => Some(command),
        }
    }

    fn send(running: Option<&RunningDaemon<S::Command>>, command: S::Command) -> Option<usize> {
        let running = running?;
        let (reply_tx, reply_rx) = bounded(1);
        running.commands.send(Envelope::Apply(command, reply_tx)).ok()?;
        reply_rx.recv().ok()
    }

    fn start<F>(&self, start: F) -> Result<RunningDaemon<S::Command>>
    where
        F: FnOnce() -> Result<(MulticastTransport, S)>,
    {
        self.phase.set(DaemonPhase::Starting);
        match self.spawn(start) {
            Ok((running, local_addr)) => {
                info!("✅ {} daemon running on {}", self.name, local_addr);
                Ok(running)
            }
            Err(e) => {
                self.phase.set(DaemonPhase::Stopped);
                Err(e)
            }
        }
    }

    fn spawn<F>(&self, start: F) -> Result<(RunningDaemon<S::Command>, SocketAddr)>
    where
        F: FnOnce() -> Result<(MulticastTransport, S)>,
    {
        let (transport, state) = start()?;
        let local_addr = transport.local_addr()?;

        let (commands_tx, commands_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let context = LoopContext {
            name: self.name,
            commands: commands_rx,
            running: Arc::clone(&self.running),
            handle: Arc::clone(&self.handle),
            phase: Arc::clone(&self.phase),
            count: Arc::clone(&self.count),
        };

        let thread = thread::Builder::new()
            .name(format!("ssdp-{}", self.name))
            .spawn(move || run(context, transport, state, ready_tx))?;

        *self.handle.lock() = Some(LoopHandle {
            thread: thread.thread().id(),
            commands: commands_tx.clone(),
            local_addr,
        });

        if ready_rx.recv().is_err() {
            self.handle.lock().take();
            let _ = thread.join();
            return Err(SsdpError::DaemonCrashed(self.name));
        }

        Ok((
            RunningDaemon {
                commands: commands_tx,
                thread,
            },
            local_addr,
        ))
    }

    fn stop(&self, running: &mut Option<RunningDaemon<S::Command>>) {
        let Some(daemon) = running.take() else {
            return;
        };
        self.phase
            .transition(DaemonPhase::Running, DaemonPhase::Stopping);
        let _ = daemon.commands.send(Envelope::Stop);
        if daemon.thread.thread().id() == thread::current().id() {
            // dernier handle lâché par un handler : le thread sortira seul
            self.handle.lock().take();
            return;
        }
        // le handle reste en place pendant le join : un handler en cours
        // doit pouvoir encore mettre ses commandes en file
        if daemon.thread.join().is_err() {
            warn!("{} daemon thread panicked while stopping", self.name);
        }
        self.handle.lock().take();
        self.phase
            .transition(DaemonPhase::Stopping, DaemonPhase::Stopped);
        info!("{} daemon stopped", self.name);
    }

    /// Récupère le thread d'un démon qui a déjà quitté sa boucle
    fn reap(&self, running: &mut Option<RunningDaemon<S::Command>>) {
        self.handle.lock().take();
        if let Some(daemon) = running.take() {
            if daemon.thread.join().is_err() {
                warn!("{} daemon thread panicked", self.name);
            }
        }
    }
}

impl<S: DaemonState> Drop for Daemon<S> {
    fn drop(&mut self) {
        let mut running = self.running.lock();
        self.stop(&mut running);
    }
}

/// Partagé entre le [`Daemon`] et son thread
struct LoopContext<C> {
    name: &'static str,
    commands: Receiver<Envelope<C>>,
    running: Running<C>,
    handle: Handle<C>,
    phase: Arc<PhaseCell>,
    count: Arc<AtomicUsize>,
}

enum Drained {
    Continue,
    Exit,
}

impl<C> LoopContext<C> {
    /// Applique les commandes en attente ; `queued` passe à vrai si une
    /// commande venue d'un handler a été appliquée
    fn drain<S>(&self, state: &mut S, queued: &mut bool) -> Drained
    where
        S: DaemonState<Command = C>,
    {
        loop {
            match self.commands.try_recv() {
                Ok(Envelope::Apply(command, reply)) => {
                    state.apply(command);
                    self.publish(state);
                    let _ = reply.send(state.registrations());
                }
                Ok(Envelope::Queue(command)) => {
                    state.apply(command);
                    self.publish(state);
                    *queued = true;
                }
                Ok(Envelope::Stop) | Err(TryRecvError::Disconnected) => {
                    debug!("{} daemon leaving receive loop", self.name);
                    return Drained::Exit;
                }
                Err(TryRecvError::Empty) => return Drained::Continue,
            }
        }
    }

    fn publish<S: DaemonState<Command = C>>(&self, state: &S) {
        self.count.store(state.registrations(), Ordering::Release);
    }

    /// Arrêt décidé par le thread démon après une désinscription depuis un handler
    ///
    /// N'aboutit que si aucun autre thread ne détient le verrou `running` :
    /// sous ce verrou plus aucune commande `Apply` ne peut arriver.
    fn try_stop_idle<S: DaemonState<Command = C>>(&self, state: &mut S) -> bool {
        let Some(mut running) = self.running.try_lock() else {
            return false;
        };
        let mut queued = false;
        if let Drained::Exit = self.drain(state, &mut queued) {
            return true;
        }
        if state.registrations() != 0 {
            return false;
        }
        self.handle.lock().take();
        // le JoinHandle de ce thread est lâché : le thread se détache
        running.take();
        self.phase.set(DaemonPhase::Stopped);
        info!("{} daemon stopped", self.name);
        true
    }
}

fn run<S: DaemonState>(
    context: LoopContext<S::Command>,
    transport: MulticastTransport,
    mut state: S,
    ready: Sender<()>,
) {
    let name = context.name;
    context.phase.set(DaemonPhase::Running);
    let _ = ready.send(());
    drop(ready);

    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut queued = false;
    loop {
        if let Drained::Exit = context.drain(&mut state, &mut queued) {
            break;
        }
        if queued && state.registrations() == 0 {
            if context.try_stop_idle(&mut state) {
                break;
            }
        } else {
            queued = false;
        }

        match transport.recv(&mut buf) {
            Ok(Some((len, from))) => {
                if let Err(e) = state.handle_datagram(&buf[..len], from) {
                    error!(daemon = name, error = %e, "Fatal error, daemon thread exits");
                    state.clear();
                    context.count.store(0, Ordering::Release);
                    context.phase.set(DaemonPhase::Crashed);
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(daemon = name, error = %e, "IO error while receiving datagram"),
        }
    }
}

/// Appelle un handler ; une panique devient [`SsdpError::HandlerPanicked`]
pub(crate) fn invoke_handler<F: FnOnce()>(call: F) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(call))
        .map_err(|payload| SsdpError::HandlerPanicked(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
