//! Máquina de estados de la conversación.
//!
//! Cada hilo pasa por Idle → Processing (pregunta añadida con respuesta vacía)
//! → Streaming (fragmentos añadidos en orden) → Idle. Sólo la tarea que posee
//! el `Ticket` vigente puede escribir en la respuesta abierta; cancelar o
//! borrar el hilo invalida el ticket y los fragmentos tardíos se descartan.
//!
//! Cada mutación publica una `SessionSnapshot` completa por un canal `watch`.

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::ConversationError;
use crate::llm::ChatTurn;
use crate::models::{ConversationThread, QaPair};

/// Hilo que existe siempre que no quede ningún otro.
pub const DEFAULT_THREAD: &str = "Intros";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Idle,
    Processing,
    Streaming,
}

/// Vista inmutable de la sesión para los observadores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub threads: Vec<ConversationThread>,
    pub current: String,
    /// El hilo actual tiene una pregunta en curso.
    pub processing: bool,
    pub busy_threads: Vec<String>,
}

#[cfg(test)]
impl SessionSnapshot {
    pub fn titles(&self) -> Vec<&str> {
        self.threads.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn current_thread(&self) -> Option<&ConversationThread> {
        self.threads.iter().find(|t| t.name == self.current)
    }
}

/// Derecho exclusivo a escribir la respuesta abierta de un hilo.
#[derive(Debug)]
pub struct Ticket {
    pub thread: String,
    pub question: String,
    /// Turnos previos aplanados (usuario, asistente), del más antiguo al más reciente.
    pub history: Vec<ChatTurn>,
    generation: u64,
    cancelled: Option<oneshot::Receiver<()>>,
}

impl Ticket {
    /// Receptor que se completa cuando alguien cancela esta pregunta.
    /// Sólo puede tomarse una vez.
    pub fn take_cancel_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.cancelled.take()
    }
}

struct ThreadEntry {
    thread: ConversationThread,
    state: ThreadState,
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
}

impl ThreadEntry {
    fn new(name: &str) -> Self {
        Self {
            thread: ConversationThread::new(name),
            state: ThreadState::Idle,
            generation: 0,
            cancel: None,
        }
    }

    fn reset(&mut self) {
        self.state = ThreadState::Idle;
        self.cancel = None;
        self.generation = 0;
    }
}

/// Aplana los pares previos en turnos usuario/asistente.
pub fn history_turns(pairs: &[QaPair]) -> Vec<ChatTurn> {
    pairs
        .iter()
        .flat_map(|pair| [ChatTurn::user(pair.question()), ChatTurn::assistant(pair.answer.clone())])
        .collect()
}

pub struct Session {
    entries: Vec<ThreadEntry>,
    current: String,
    next_generation: u64,
    notifier: watch::Sender<SessionSnapshot>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let entries = vec![ThreadEntry::new(DEFAULT_THREAD)];
        let current = DEFAULT_THREAD.to_string();
        let (notifier, _) = watch::channel(SessionSnapshot {
            threads: entries.iter().map(|e| e.thread.clone()).collect(),
            current: current.clone(),
            processing: false,
            busy_threads: Vec::new(),
        });
        Self {
            entries,
            current,
            next_generation: 1,
            notifier,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.notifier.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            threads: self.entries.iter().map(|e| e.thread.clone()).collect(),
            current: self.current.clone(),
            processing: self.is_processing(),
            busy_threads: self
                .entries
                .iter()
                .filter(|e| e.state != ThreadState::Idle)
                .map(|e| e.thread.name.clone())
                .collect(),
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn is_processing(&self) -> bool {
        matches!(self.state_of(&self.current), Some(state) if state != ThreadState::Idle)
    }

    pub fn state_of(&self, name: &str) -> Option<ThreadState> {
        self.entry(name).map(|e| e.state)
    }

    fn entry(&self, name: &str) -> Option<&ThreadEntry> {
        self.entries.iter().find(|e| e.thread.name == name)
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut ThreadEntry> {
        self.entries.iter_mut().find(|e| e.thread.name == name)
    }

    fn publish(&self) {
        self.notifier.send_replace(self.snapshot());
    }

    /// Abre una pregunta en el hilo actual. Pregunta vacía: no-op (`Ok(None)`).
    pub fn submit(&mut self, question: &str) -> Result<Option<Ticket>, ConversationError> {
        if question.is_empty() {
            return Ok(None);
        }

        let generation = self.next_generation;
        let current = self.current.clone();
        let entry = self
            .entry_mut(&current)
            .ok_or_else(|| ConversationError::UnknownThread(current.clone()))?;
        if entry.state != ThreadState::Idle {
            return Err(ConversationError::Busy(current));
        }

        let history = history_turns(&entry.thread.pairs);
        entry.thread.pairs.push(QaPair::new(question));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        entry.state = ThreadState::Processing;
        entry.generation = generation;
        entry.cancel = Some(cancel_tx);
        self.next_generation += 1;

        debug!("Pregunta abierta en el hilo '{current}'");
        self.publish();

        Ok(Some(Ticket {
            thread: current,
            question: question.to_string(),
            history,
            generation,
            cancelled: Some(cancel_rx),
        }))
    }

    fn live_entry_mut(&mut self, ticket: &Ticket) -> Option<&mut ThreadEntry> {
        self.entry_mut(&ticket.thread)
            .filter(|e| e.generation == ticket.generation && e.state != ThreadState::Idle)
    }

    /// Añade un fragmento a la respuesta abierta. `false` si el ticket ya no es válido.
    pub fn append_fragment(&mut self, ticket: &Ticket, fragment: &str) -> bool {
        let Some(entry) = self.live_entry_mut(ticket) else {
            return false;
        };
        if let Some(pair) = entry.thread.pairs.last_mut() {
            pair.answer.push_str(fragment);
        }
        entry.state = ThreadState::Streaming;
        self.publish();
        true
    }

    /// Cierra la pregunta (éxito o error) y vuelve a Idle.
    pub fn finish(&mut self, ticket: &Ticket) -> bool {
        let Some(entry) = self.live_entry_mut(ticket) else {
            return false;
        };
        entry.reset();
        self.publish();
        true
    }

    /// Fuerza Idle en un hilo con pregunta en curso; conserva la respuesta parcial.
    pub fn cancel(&mut self, name: &str) -> bool {
        let Some(entry) = self.entry_mut(name) else {
            return false;
        };
        if entry.state == ThreadState::Idle {
            return false;
        }
        if let Some(cancel) = entry.cancel.take() {
            let _ = cancel.send(());
        }
        entry.reset();
        info!("Pregunta en curso cancelada en el hilo '{name}'");
        self.publish();
        true
    }

    /// Crea un hilo vacío y lo selecciona.
    pub fn create_thread(&mut self, name: &str) -> Result<(), ConversationError> {
        if name.trim().is_empty() {
            return Err(ConversationError::EmptyThreadName);
        }
        if self.entry(name).is_some() {
            return Err(ConversationError::DuplicateThread(name.to_string()));
        }
        self.entries.push(ThreadEntry::new(name));
        self.current = name.to_string();
        self.publish();
        Ok(())
    }

    /// Borra un hilo. Si no queda ninguno se recrea el hilo por defecto.
    pub fn delete_thread(&mut self, name: &str) -> Result<(), ConversationError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.thread.name == name)
            .ok_or_else(|| ConversationError::UnknownThread(name.to_string()))?;
        let mut removed = self.entries.remove(index);
        if let Some(cancel) = removed.cancel.take() {
            warn!("Se borra el hilo '{name}' con una pregunta en curso");
            let _ = cancel.send(());
        }

        if self.entries.is_empty() {
            self.entries.push(ThreadEntry::new(DEFAULT_THREAD));
        }
        if self.entry(&self.current).is_none() {
            self.current = self.entries[0].thread.name.clone();
        }
        self.publish();
        Ok(())
    }

    /// Sólo mueve el puntero; no valida que el hilo exista.
    pub fn select_thread(&mut self, name: &str) {
        self.current = name.to_string();
        self.publish();
    }
}
