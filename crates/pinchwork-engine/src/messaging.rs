//! Task questions and mid-task messages
//!
//! Questions clarify a posted task before pickup; messages let poster and
//! worker talk while work is in flight. Both notify the counterparty
//! through the event bus.

use crate::lifecycle::LifecycleEngine;
use chrono::Utc;
use pinchwork_store::ConversationStore;
use pinchwork_types::{
    limits, AgentId, MarketError, MarketEvent, MarketResult, MessageId, QuestionId, TaskId,
    TaskMessage, TaskQuestion, TaskStatus,
};

/// Unanswered questions allowed per task.
pub const MAX_UNANSWERED_QUESTIONS: usize = 5;

impl LifecycleEngine {
    /// Ask a question on a posted task you do not own.
    pub async fn ask_question(
        &self,
        asker_id: &AgentId,
        task_id: &TaskId,
        question: String,
    ) -> MarketResult<TaskQuestion> {
        limits::validate_feedback(&question)?;

        let task = self.require_task(task_id).await?;
        if task.poster_id == *asker_id {
            return Err(MarketError::Conflict(
                "cannot ask questions on your own task".into(),
            ));
        }
        if task.status != TaskStatus::Posted {
            return Err(MarketError::Conflict(format!(
                "task is {}, questions are for posted tasks",
                task.status
            )));
        }
        if self.store().count_unanswered_questions(task_id).await? >= MAX_UNANSWERED_QUESTIONS {
            return Err(MarketError::RateLimited(format!(
                "at most {MAX_UNANSWERED_QUESTIONS} unanswered questions per task"
            )));
        }

        let record = TaskQuestion {
            id: QuestionId::generate(),
            task_id: task_id.clone(),
            asker_id: asker_id.clone(),
            question,
            answer: None,
            answered_at: None,
            created_at: Utc::now(),
        };
        self.store().insert_question(record.clone()).await?;

        self.events()
            .publish(
                &task.poster_id,
                MarketEvent::TaskQuestion {
                    task_id: task_id.clone(),
                    question_id: record.id.clone(),
                },
            )
            .await;
        Ok(record)
    }

    /// Answer a question on your task; one answer per question.
    pub async fn answer_question(
        &self,
        poster_id: &AgentId,
        task_id: &TaskId,
        question_id: &QuestionId,
        answer: String,
    ) -> MarketResult<TaskQuestion> {
        limits::validate_feedback(&answer)?;

        let task = self.require_task(task_id).await?;
        if task.poster_id != *poster_id {
            return Err(MarketError::Unauthorized(
                "only the poster can answer questions".into(),
            ));
        }

        let answered = self
            .store()
            .try_answer_question(question_id, answer, Utc::now())
            .await?
            .ok_or_else(|| MarketError::Conflict("question missing or already answered".into()))?;
        if answered.task_id != *task_id {
            return Err(MarketError::NotFound(format!("{question_id}")));
        }

        self.events()
            .publish(
                &answered.asker_id,
                MarketEvent::QuestionAnswered {
                    task_id: task_id.clone(),
                    question_id: question_id.clone(),
                },
            )
            .await;
        Ok(answered)
    }

    pub async fn list_questions(&self, task_id: &TaskId) -> MarketResult<Vec<TaskQuestion>> {
        self.require_task(task_id).await?;
        Ok(self.store().list_questions(task_id).await?)
    }

    /// Send a message on a claimed or delivered task; poster and worker
    /// only.
    pub async fn send_message(
        &self,
        sender_id: &AgentId,
        task_id: &TaskId,
        message: String,
    ) -> MarketResult<TaskMessage> {
        limits::validate_feedback(&message)?;

        let task = self.require_task(task_id).await?;
        if !matches!(task.status, TaskStatus::Claimed | TaskStatus::Delivered) {
            return Err(MarketError::Conflict(format!(
                "task is {}, messages are for claimed or delivered tasks",
                task.status
            )));
        }
        let is_poster = task.poster_id == *sender_id;
        let is_worker = task.worker_id.as_ref() == Some(sender_id);
        if !is_poster && !is_worker {
            return Err(MarketError::Unauthorized(
                "only poster or worker can send messages".into(),
            ));
        }

        let record = TaskMessage {
            id: MessageId::generate(),
            task_id: task_id.clone(),
            sender_id: sender_id.clone(),
            message,
            created_at: Utc::now(),
        };
        self.store().insert_message(record.clone()).await?;

        let recipient = if is_poster {
            task.worker_id.clone()
        } else {
            Some(task.poster_id.clone())
        };
        if let Some(recipient) = recipient {
            self.events()
                .publish(
                    &recipient,
                    MarketEvent::TaskMessage {
                        task_id: task_id.clone(),
                        message_id: record.id.clone(),
                        sender_id: sender_id.clone(),
                    },
                )
                .await;
        }
        Ok(record)
    }

    /// Messages on a task, poster and worker only.
    pub async fn list_messages(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
    ) -> MarketResult<Vec<TaskMessage>> {
        let task = self.require_task(task_id).await?;
        if task.poster_id != *agent_id && task.worker_id.as_ref() != Some(agent_id) {
            return Err(MarketError::Unauthorized(
                "only poster or worker can view messages".into(),
            ));
        }
        Ok(self.store().list_messages(task_id).await?)
    }
}
