//! Turn orchestration.
//!
//! `handle_turn` builds the outbound request: append the user message (fail
//! fast if that write fails), then gather summary, ranked examples, and
//! knowledge links. Example or link failures degrade the request instead of
//! failing the turn. The whole assembly runs under one deadline.
//!
//! `record_result` persists the outcome: the agent reply lands in the ledger
//! only when the turn succeeded, and exactly one audit record is emitted
//! either way.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use attune_core::audit::AuditRecord;
use attune_core::error::LedgerError;
use attune_core::feedback::ExampleStore;
use attune_core::inference::{AssembledRequest, InferenceOutcome};
use attune_core::knowledge::KnowledgeLinkStore;
use attune_core::ledger::{LedgerKey, LedgerRole, LedgerStore};

use crate::audit_writer::AuditWriter;

/// Errors a turn can surface to the caller.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("Turn deadline exceeded after {deadline_secs}s")]
    Timeout { deadline_secs: u64 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Assembly tunables, resolved from config at wiring time.
#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    /// Few-shot examples per request.
    pub ranked_limit: usize,

    /// Overall deadline for one turn's assembly.
    pub turn_deadline_secs: u64,
}

impl Default for AssemblerSettings {
    fn default() -> Self {
        Self {
            ranked_limit: 5,
            turn_deadline_secs: 30,
        }
    }
}

/// Builds inference requests from the three stores and records outcomes.
pub struct ContextAssembler {
    ledger: Arc<dyn LedgerStore>,
    examples: Arc<dyn ExampleStore>,
    links: Arc<dyn KnowledgeLinkStore>,
    audit: AuditWriter,
    settings: AssemblerSettings,
}

impl ContextAssembler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        examples: Arc<dyn ExampleStore>,
        links: Arc<dyn KnowledgeLinkStore>,
        audit: AuditWriter,
        settings: AssemblerSettings,
    ) -> Self {
        Self {
            ledger,
            examples,
            links,
            audit,
            settings,
        }
    }

    /// Assemble the request for one inbound message.
    ///
    /// The user message is appended to the ledger first; if that write fails
    /// the turn fails. Everything else degrades: a curator or knowledge
    /// failure leaves its slot empty and flags `reduced_context`.
    pub async fn handle_turn(
        &self,
        tenant_id: i64,
        agent_id: i64,
        contact_id: &str,
        incoming: &str,
    ) -> Result<AssembledRequest, TurnError> {
        let deadline = Duration::from_secs(self.settings.turn_deadline_secs);
        match tokio::time::timeout(
            deadline,
            self.assemble(tenant_id, agent_id, contact_id, incoming),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TurnError::Timeout {
                deadline_secs: self.settings.turn_deadline_secs,
            }),
        }
    }

    async fn assemble(
        &self,
        tenant_id: i64,
        agent_id: i64,
        contact_id: &str,
        incoming: &str,
    ) -> Result<AssembledRequest, TurnError> {
        let append = self
            .ledger
            .append(tenant_id, contact_id, LedgerRole::User, incoming)
            .await?;

        let mut reduced_context = false;

        let summary = match self.ledger.summary(tenant_id, contact_id).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Summary read failed for tenant {tenant_id}: {e}");
                None
            }
        };

        let few_shot_examples = match self
            .examples
            .ranked_examples(tenant_id, agent_id, self.settings.ranked_limit)
            .await
        {
            Ok(examples) => examples,
            Err(e) => {
                warn!("Example fetch failed for agent {agent_id}, degrading: {e}");
                reduced_context = true;
                Vec::new()
            }
        };

        let knowledge_document_ids = match self.links.links_for(tenant_id, agent_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Knowledge link fetch failed for agent {agent_id}, degrading: {e}");
                reduced_context = true;
                BTreeSet::new()
            }
        };

        debug!(
            "Assembled turn for tenant {tenant_id} agent {agent_id}: \
             {} history, {} examples, {} documents, reduced={reduced_context}",
            append.messages.len(),
            few_shot_examples.len(),
            knowledge_document_ids.len()
        );

        Ok(AssembledRequest {
            tenant_id,
            agent_id,
            contact: LedgerKey::new(tenant_id, contact_id).contact,
            recent_history: append.messages,
            summary,
            few_shot_examples,
            knowledge_document_ids,
            incoming_message: incoming.to_string(),
            reduced_context,
        })
    }

    /// Persist the outcome of a turn.
    ///
    /// On success the agent reply is appended to the ledger; a failed turn
    /// leaves the ledger as it was (the user message stays). A successful
    /// outcome with a blank reply is logged and skipped rather than fed to
    /// the ledger as an empty message. One audit record is emitted in every
    /// case, before any error is surfaced.
    pub async fn record_result(
        &self,
        request: &AssembledRequest,
        outcome: &InferenceOutcome,
    ) -> Result<(), TurnError> {
        let reply_append = if !outcome.success {
            Ok(())
        } else if outcome.response.trim().is_empty() {
            warn!(
                "Empty reply for contact {} on tenant {}; nothing appended",
                request.contact, request.tenant_id
            );
            Ok(())
        } else {
            self.ledger
                .append(
                    request.tenant_id,
                    &request.contact,
                    LedgerRole::Agent,
                    &outcome.response,
                )
                .await
                .map(|_| ())
        };

        let prompt = serde_json::to_value(request).unwrap_or_else(|e| {
            warn!("Assembled request not serializable for audit: {e}");
            serde_json::Value::Null
        });
        self.audit.submit(AuditRecord::new(
            request.tenant_id,
            request.agent_id,
            request.contact.clone(),
            request.incoming_message.clone(),
            prompt,
            outcome.response.clone(),
            outcome.success,
            outcome.latency_ms,
            outcome.error.clone(),
            request.reduced_context,
        ));

        reply_append?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_store::InMemoryAudit;
    use async_trait::async_trait;
    use attune_core::audit::AuditStore;
    use attune_core::error::{CuratorError, KnowledgeError};
    use attune_core::feedback::{FeedbackInput, FeedbackType};
    use attune_curator::InMemoryExamples;
    use attune_knowledge::InMemoryLinks;
    use attune_ledger::{InMemoryLedger, LedgerSettings, NaiveSummarizer};

    struct Fixture {
        assembler: ContextAssembler,
        ledger: Arc<InMemoryLedger>,
        audit: Arc<InMemoryAudit>,
        _writer_task: tokio::task::JoinHandle<()>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new(
            LedgerSettings::default(),
            Arc::new(NaiveSummarizer),
        ));
        let examples = Arc::new(InMemoryExamples::new());
        let links = Arc::new(InMemoryLinks::new());
        let audit = Arc::new(InMemoryAudit::new());
        let (writer, task) = AuditWriter::spawn(audit.clone(), 16, 3);
        Fixture {
            assembler: ContextAssembler::new(
                ledger.clone(),
                examples,
                links,
                writer,
                AssemblerSettings::default(),
            ),
            ledger,
            audit,
            _writer_task: task,
        }
    }

    async fn wait_for_audit(audit: &InMemoryAudit, tenant_id: i64, count: usize) {
        for _ in 0..100 {
            if audit.recent(tenant_id, None, 100).await.unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("audit records never arrived");
    }

    #[tokio::test]
    async fn assembles_history_examples_and_links() {
        let ledger = Arc::new(InMemoryLedger::new(
            LedgerSettings::default(),
            Arc::new(NaiveSummarizer),
        ));
        let examples = Arc::new(InMemoryExamples::new());
        let links = Arc::new(InMemoryLinks::new());
        let audit = Arc::new(InMemoryAudit::new());
        let (writer, _task) = AuditWriter::spawn(audit, 16, 3);

        examples
            .record(FeedbackInput {
                tenant_id: 1,
                agent_id: 7,
                team_id: None,
                user_message: "opening hours?".into(),
                agent_response: "9-5".into(),
                corrected_response: None,
                feedback_type: FeedbackType::Approved,
                rating: None,
                notes: None,
                priority: None,
                used_in_prompt: None,
                context: None,
            })
            .await
            .unwrap();
        links
            .set_links(1, 7, BTreeSet::from([3, 5]))
            .await
            .unwrap();

        let assembler = ContextAssembler::new(
            ledger.clone(),
            examples,
            links,
            writer,
            AssemblerSettings::default(),
        );
        let request = assembler
            .handle_turn(1, 7, "+55 11 98765-4321", "where is my order?")
            .await
            .unwrap();

        assert_eq!(request.contact, "5511987654321");
        assert_eq!(request.recent_history.len(), 1);
        assert_eq!(request.few_shot_examples.len(), 1);
        assert_eq!(request.knowledge_document_ids, BTreeSet::from([3, 5]));
        assert!(!request.reduced_context);

        // The user message is already in the ledger.
        let messages = ledger.recent_messages(1, "5511987654321", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, LedgerRole::User);
    }

    struct FailingExamples;

    #[async_trait]
    impl ExampleStore for FailingExamples {
        fn name(&self) -> &str {
            "failing"
        }
        async fn record(
            &self,
            _input: FeedbackInput,
        ) -> Result<attune_core::FeedbackExample, CuratorError> {
            Err(CuratorError::Storage("down".into()))
        }
        async fn update(
            &self,
            _id: &str,
            _tenant_id: i64,
            _patch: attune_core::FeedbackPatch,
        ) -> Result<attune_core::FeedbackExample, CuratorError> {
            Err(CuratorError::Storage("down".into()))
        }
        async fn ranked_examples(
            &self,
            _tenant_id: i64,
            _agent_id: i64,
            _limit: usize,
        ) -> Result<Vec<attune_core::FeedbackExample>, CuratorError> {
            Err(CuratorError::Storage("down".into()))
        }
        async fn export(
            &self,
            _tenant_id: i64,
            _agent_id: i64,
            _limit: usize,
        ) -> Result<attune_core::feedback::ExamplesExport, CuratorError> {
            Err(CuratorError::Storage("down".into()))
        }
        async fn list(
            &self,
            _tenant_id: i64,
            _filter: attune_core::FeedbackFilter,
        ) -> Result<attune_core::feedback::FeedbackPage, CuratorError> {
            Err(CuratorError::Storage("down".into()))
        }
        async fn remove(&self, _id: &str, _tenant_id: i64) -> Result<(), CuratorError> {
            Err(CuratorError::Storage("down".into()))
        }
    }

    #[tokio::test]
    async fn curator_failure_degrades_instead_of_failing() {
        let ledger = Arc::new(InMemoryLedger::new(
            LedgerSettings::default(),
            Arc::new(NaiveSummarizer),
        ));
        let audit = Arc::new(InMemoryAudit::new());
        let (writer, _task) = AuditWriter::spawn(audit, 16, 3);
        let assembler = ContextAssembler::new(
            ledger,
            Arc::new(FailingExamples),
            Arc::new(InMemoryLinks::new()),
            writer,
            AssemblerSettings::default(),
        );

        let request = assembler.handle_turn(1, 7, "551198", "hi").await.unwrap();
        assert!(request.reduced_context);
        assert!(request.few_shot_examples.is_empty());
        assert_eq!(request.recent_history.len(), 1);
    }

    #[tokio::test]
    async fn ledger_append_failure_fails_the_turn() {
        let fx = fixture();
        let err = fx.assembler.handle_turn(1, 7, "551198", "   ").await.unwrap_err();
        assert!(matches!(err, TurnError::Ledger(LedgerError::InvalidInput(_))));
    }

    struct SlowLinks;

    #[async_trait]
    impl KnowledgeLinkStore for SlowLinks {
        fn name(&self) -> &str {
            "slow"
        }
        async fn set_links(
            &self,
            _tenant_id: i64,
            _agent_id: i64,
            _document_ids: BTreeSet<i64>,
        ) -> Result<(), KnowledgeError> {
            Ok(())
        }
        async fn links_for(
            &self,
            _tenant_id: i64,
            _agent_id: i64,
        ) -> Result<BTreeSet<i64>, KnowledgeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(BTreeSet::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_a_hang_into_timeout() {
        let ledger = Arc::new(InMemoryLedger::new(
            LedgerSettings::default(),
            Arc::new(NaiveSummarizer),
        ));
        let audit = Arc::new(InMemoryAudit::new());
        let (writer, _task) = AuditWriter::spawn(audit, 16, 3);
        let assembler = ContextAssembler::new(
            ledger,
            Arc::new(InMemoryExamples::new()),
            Arc::new(SlowLinks),
            writer,
            AssemblerSettings {
                turn_deadline_secs: 2,
                ..AssemblerSettings::default()
            },
        );

        let err = assembler.handle_turn(1, 7, "551198", "hi").await.unwrap_err();
        assert!(matches!(err, TurnError::Timeout { deadline_secs: 2 }));
    }

    #[tokio::test]
    async fn successful_result_appends_reply_and_audits() {
        let fx = fixture();
        let request = fx
            .assembler
            .handle_turn(1, 7, "551198", "where is my order?")
            .await
            .unwrap();
        fx.assembler
            .record_result(&request, &InferenceOutcome::success("on its way", 230))
            .await
            .unwrap();

        let messages = fx.ledger.recent_messages(1, "551198", 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, LedgerRole::Agent);
        assert_eq!(messages[1].body, "on its way");

        wait_for_audit(&fx.audit, 1, 1).await;
        let records = fx.audit.recent(1, None, 10).await.unwrap();
        assert!(records[0].success);
        assert_eq!(records[0].latency_ms, 230);
    }

    #[tokio::test]
    async fn blank_reply_is_skipped_but_still_audited() {
        let fx = fixture();
        let request = fx
            .assembler
            .handle_turn(1, 7, "551198", "anyone there?")
            .await
            .unwrap();
        fx.assembler
            .record_result(&request, &InferenceOutcome::success("   ", 90))
            .await
            .unwrap();

        // The blank reply never reaches the ledger.
        let messages = fx.ledger.recent_messages(1, "551198", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, LedgerRole::User);

        wait_for_audit(&fx.audit, 1, 1).await;
        let records = fx.audit.recent(1, None, 10).await.unwrap();
        assert!(records[0].success);
        assert_eq!(records[0].response, "   ");
    }

    #[tokio::test]
    async fn failed_result_keeps_user_message_and_audits_the_error() {
        let fx = fixture();
        let request = fx
            .assembler
            .handle_turn(1, 7, "551198", "hello?")
            .await
            .unwrap();
        fx.assembler
            .record_result(&request, &InferenceOutcome::failure("upstream timeout", 5000))
            .await
            .unwrap();

        // Only the user message; no phantom agent reply.
        let messages = fx.ledger.recent_messages(1, "551198", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, LedgerRole::User);

        wait_for_audit(&fx.audit, 1, 1).await;
        let records = fx.audit.recent(1, None, 10).await.unwrap();
        assert!(!records[0].success);
        assert_eq!(records[0].error.as_deref(), Some("upstream timeout"));
    }
}
