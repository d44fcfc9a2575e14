//! Flujo de pregunta/respuesta: abre la pregunta en la sesión, recupera
//! contexto (grafo + vector), genera en streaming y vuelca cada fragmento en
//! la respuesta abierta hasta que el stream termina, falla o se cancela.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::context::{build_system_prompt, compose_context};
use crate::conversation::{Session, Ticket};
use crate::error::ConversationError;
use crate::llm::{ChatRequest, LanguageModel};
use crate::retrieval::Retriever;
use crate::settings::ConfigProvider;

/// Eventos que ve quien hizo la pregunta, en orden.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    Started { thread: String },
    Fragment { text: String },
    Finished,
    Failed { error: String },
    Cancelled,
}

pub type AnswerReceiver = mpsc::UnboundedReceiver<AnswerEvent>;

#[derive(Clone)]
pub struct ChatService {
    session: Arc<Mutex<Session>>,
    settings: Arc<ConfigProvider>,
    retriever: Retriever,
    llm: Arc<dyn LanguageModel>,
}

impl ChatService {
    pub fn new(
        session: Arc<Mutex<Session>>,
        settings: Arc<ConfigProvider>,
        retriever: Retriever,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        Self { session, settings, retriever, llm }
    }

    pub fn session(&self) -> &Arc<Mutex<Session>> {
        &self.session
    }

    /// Abre la pregunta de forma síncrona (Idle → Processing) y lanza el
    /// trabajo en una tarea. `Ok(None)` si la pregunta está vacía.
    pub fn ask(&self, question: &str) -> Result<Option<AnswerReceiver>, ConversationError> {
        let Some(ticket) = self.session.lock().unwrap().submit(question)? else {
            return Ok(None);
        };

        let (events, receiver) = mpsc::unbounded_channel();
        let _ = events.send(AnswerEvent::Started {
            thread: ticket.thread.clone(),
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.answer(ticket, events).await;
        });

        Ok(Some(receiver))
    }

    pub fn cancel(&self, thread: &str) -> bool {
        self.session.lock().unwrap().cancel(thread)
    }

    async fn answer(&self, mut ticket: Ticket, events: mpsc::UnboundedSender<AnswerEvent>) {
        let mut cancelled = match ticket.take_cancel_signal() {
            Some(signal) => signal,
            None => {
                self.session.lock().unwrap().finish(&ticket);
                return;
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = &mut cancelled => Outcome::Cancelled,
            outcome = self.generate(&ticket, &events) => outcome,
        };

        let event = match outcome {
            Outcome::Finished => AnswerEvent::Finished,
            Outcome::Cancelled => {
                info!("Pregunta cancelada en el hilo '{}'", ticket.thread);
                AnswerEvent::Cancelled
            }
            Outcome::Failed(message) => AnswerEvent::Failed { error: message },
        };

        // Si ya se canceló o borró el hilo, el ticket no es válido y esto no hace nada.
        self.session.lock().unwrap().finish(&ticket);
        let _ = events.send(event);
    }

    async fn generate(&self, ticket: &Ticket, events: &mpsc::UnboundedSender<AnswerEvent>) -> Outcome {
        let config = self.settings.read();

        let retrieved = match self.retriever.retrieve(&ticket.question, &config).await {
            Ok(retrieved) => retrieved,
            Err(e) => {
                error!("{e}");
                return Outcome::Failed(e.to_string());
            }
        };
        let context = compose_context(&retrieved.structured, &retrieved.unstructured);

        let request = ChatRequest {
            system_prompt: build_system_prompt(&config.content, &context),
            history: ticket.history.clone(),
            question: ticket.question.clone(),
        };

        let mut stream = match self.llm.stream_chat(request, &config).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("{e}");
                return Outcome::Failed(e.to_string());
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => {
                    if !self.session.lock().unwrap().append_fragment(ticket, &fragment) {
                        return Outcome::Cancelled;
                    }
                    let _ = events.send(AnswerEvent::Fragment { text: fragment });
                }
                Err(e) => {
                    // La respuesta parcial se conserva.
                    warn!("{e}");
                    return Outcome::Failed(e.to_string());
                }
            }
        }

        Outcome::Finished
    }
}

enum Outcome {
    Finished,
    Cancelled,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreFailurePolicy;
    use crate::conversation::{ThreadState, DEFAULT_THREAD};
    use crate::llm::ChatTurn;
    use crate::testing::{FakeGraphStore, FakeLanguageModel, FakeVectorStore};
    use tempfile::TempDir;

    struct Harness {
        service: ChatService,
        llm: Arc<FakeLanguageModel>,
        vector: Arc<FakeVectorStore>,
        _dir: TempDir,
    }

    fn harness(llm: FakeLanguageModel, graph: FakeGraphStore, vector: FakeVectorStore, policy: StoreFailurePolicy) -> Harness {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(ConfigProvider::new(dir.path().join(".config.json")));
        let llm = Arc::new(llm);
        let vector = Arc::new(vector);
        let retriever = Retriever::new(llm.clone(), Arc::new(graph), vector.clone(), policy);
        let service = ChatService::new(
            Arc::new(Mutex::new(Session::new())),
            settings,
            retriever,
            llm.clone(),
        );
        Harness { service, llm, vector, _dir: dir }
    }

    async fn drain(mut receiver: AnswerReceiver) -> Vec<AnswerEvent> {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        events
    }

    fn current_answer(service: &ChatService) -> String {
        let snapshot = service.session().lock().unwrap().snapshot();
        snapshot.current_thread().unwrap().pairs.last().unwrap().answer.clone()
    }

    #[tokio::test]
    async fn submit_is_synchronous_and_precedes_retrieval() {
        let h = harness(
            FakeLanguageModel::default().with_fragments(vec!["Hola"]),
            FakeGraphStore::default(),
            FakeVectorStore::default(),
            StoreFailurePolicy::Degrade,
        );

        let receiver = h.service.ask("¿Qué tal?").unwrap().unwrap();

        // El runtime de test es de un solo hilo: la tarea aún no ha corrido.
        let snapshot = h.service.session().lock().unwrap().snapshot();
        assert!(snapshot.processing);
        assert_eq!(snapshot.current_thread().unwrap().pairs.len(), 1);
        assert_eq!(current_answer(&h.service), "");
        assert_eq!(h.vector.calls(), 0);

        let events = drain(receiver).await;
        assert_eq!(events.first(), Some(&AnswerEvent::Started { thread: DEFAULT_THREAD.into() }));
        assert_eq!(events.last(), Some(&AnswerEvent::Finished));
        assert_eq!(h.vector.calls(), 1);
    }

    #[tokio::test]
    async fn streams_fragments_into_answer_and_returns_to_idle() {
        let h = harness(
            FakeLanguageModel::default().with_fragments(vec!["Hel", "lo"]),
            FakeGraphStore::default(),
            FakeVectorStore::with_chunks(vec!["doc"]),
            StoreFailurePolicy::Degrade,
        );

        let events = drain(h.service.ask("saluda").unwrap().unwrap()).await;

        assert_eq!(
            events,
            vec![
                AnswerEvent::Started { thread: DEFAULT_THREAD.into() },
                AnswerEvent::Fragment { text: "Hel".into() },
                AnswerEvent::Fragment { text: "lo".into() },
                AnswerEvent::Finished,
            ]
        );
        assert_eq!(current_answer(&h.service), "Hello");
        let session = h.service.session().lock().unwrap();
        assert_eq!(session.state_of(DEFAULT_THREAD), Some(ThreadState::Idle));
        assert!(!session.is_processing());
    }

    #[tokio::test]
    async fn empty_question_does_nothing() {
        let h = harness(
            FakeLanguageModel::default(),
            FakeGraphStore::default(),
            FakeVectorStore::default(),
            StoreFailurePolicy::Degrade,
        );
        assert!(h.service.ask("").unwrap().is_none());
        let snapshot = h.service.session().lock().unwrap().snapshot();
        assert!(snapshot.current_thread().unwrap().pairs.is_empty());
        assert!(!snapshot.processing);
    }

    #[tokio::test]
    async fn request_carries_context_history_and_question() {
        let h = harness(
            FakeLanguageModel::default().with_fragments(vec!["R1"]),
            FakeGraphStore::default(),
            FakeVectorStore::with_chunks(vec!["uno", "dos"]),
            StoreFailurePolicy::Degrade,
        );
        drain(h.service.ask("P1").unwrap().unwrap()).await;
        drain(h.service.ask("P2").unwrap().unwrap()).await;

        let requests = h.llm.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        assert_eq!(second.question, "P2");
        assert_eq!(second.history, vec![ChatTurn::user("P1"), ChatTurn::assistant("R1")]);
        assert!(second.system_prompt.contains("Structured data:"));
        assert!(second.system_prompt.contains("uno#Document dos"));
        assert!(second
            .system_prompt
            .starts_with(crate::settings::DEFAULT_SYSTEM_CONTENT));
    }

    #[tokio::test]
    async fn transport_error_keeps_partial_answer_and_clears_flag() {
        let h = harness(
            FakeLanguageModel::default().with_interrupted_stream(vec!["Par", "cial"], "reset by peer"),
            FakeGraphStore::default(),
            FakeVectorStore::default(),
            StoreFailurePolicy::Degrade,
        );

        let events = drain(h.service.ask("q").unwrap().unwrap()).await;

        assert!(matches!(events.last(), Some(AnswerEvent::Failed { error }) if error.contains("reset by peer")));
        assert_eq!(current_answer(&h.service), "Parcial");
        assert!(!h.service.session().lock().unwrap().is_processing());
    }

    #[tokio::test]
    async fn abort_policy_fails_question_without_generation() {
        let h = harness(
            FakeLanguageModel::default().with_fragments(vec!["nunca"]),
            FakeGraphStore::default(),
            FakeVectorStore::unavailable(),
            StoreFailurePolicy::Abort,
        );

        let events = drain(h.service.ask("q").unwrap().unwrap()).await;

        assert!(matches!(events.last(), Some(AnswerEvent::Failed { .. })));
        assert!(h.llm.requests().is_empty());
        assert_eq!(current_answer(&h.service), "");
        assert!(!h.service.session().lock().unwrap().is_processing());
    }

    #[tokio::test]
    async fn cancel_before_work_starts_forces_idle() {
        let h = harness(
            FakeLanguageModel::default().with_fragments(vec!["tarde"]),
            FakeGraphStore::default(),
            FakeVectorStore::default(),
            StoreFailurePolicy::Degrade,
        );

        let receiver = h.service.ask("q").unwrap().unwrap();
        assert!(h.service.cancel(DEFAULT_THREAD));
        assert!(!h.service.session().lock().unwrap().is_processing());

        let events = drain(receiver).await;
        assert_eq!(events.last(), Some(&AnswerEvent::Cancelled));
        assert_eq!(current_answer(&h.service), "");
        assert!(h.llm.requests().is_empty());
    }

    #[tokio::test]
    async fn busy_thread_rejects_second_question() {
        let h = harness(
            FakeLanguageModel::default(),
            FakeGraphStore::default(),
            FakeVectorStore::default(),
            StoreFailurePolicy::Degrade,
        );
        let _receiver = h.service.ask("uno").unwrap().unwrap();
        assert!(matches!(h.service.ask("dos"), Err(ConversationError::Busy(_))));
    }
}
