// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Persona-driven advisory worker.
//!
//! Produces a normalized advisory artifact (summary, advice, next steps,
//! policy references) plus a weighted self-evaluation. Output depends only on
//! the task and the worker's configuration, so retries are reproducible.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::domain::governance_config::{default_criteria, CriterionWeight};
use crate::domain::task::TaskPackage;
use crate::domain::worker::{Artifact, WorkerExecutor, WorkerFailure};

pub const ADVISORY_FORMAT: &str = "advisory/v1";

pub struct AdvisoryWorker {
    persona: String,
    role: String,
    criteria: Vec<CriterionWeight>,
}

impl AdvisoryWorker {
    pub fn new(persona: impl Into<String>, role: impl Into<String>) -> Self {
        Self { persona: persona.into(), role: role.into(), criteria: default_criteria() }
    }

    pub fn with_criteria(mut self, criteria: Vec<CriterionWeight>) -> Self {
        self.criteria = criteria;
        self
    }

    fn summarize(&self, task: &TaskPackage, payload: &Map<String, Value>) -> String {
        if payload.is_empty() {
            return format!("{} handling {} {} work; no payload supplied.", self.persona, task.domain, task.intent);
        }
        let key_points: Vec<String> = payload
            .iter()
            .take(3)
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{k}={}", text.chars().take(60).collect::<String>())
            })
            .collect();
        format!(
            "{} handling {} {} work; payload: {}.",
            self.persona,
            task.domain,
            task.intent,
            key_points.join(", ")
        )
    }

    fn advise(&self, payload: &Map<String, Value>) -> String {
        if payload.is_empty() {
            return format!(
                "{} ({}) recommends collecting concrete context before acting, starting with the highest-signal question.",
                self.persona, self.role
            );
        }
        match payload.get("goal").or_else(|| payload.get("topic")).and_then(Value::as_str) {
            Some(goal) => format!(
                "{} ({}) confirms the goal '{}': clarify constraints, map each action to policy, then record the outcome.",
                self.persona, self.role, goal
            ),
            None => format!(
                "{} ({}) has parsed the payload and proposes one reviewable change at a time.",
                self.persona, self.role
            ),
        }
    }

    fn next_steps(payload: &Map<String, Value>) -> Vec<Value> {
        let mut steps = vec![
            json!({"action": "Validate charter alignment", "owner": "governor", "due": "P0"}),
            json!({"action": "Record outcome in the audit digest", "owner": "prime", "due": "P1"}),
        ];
        if let Some(action) = payload.get("next_action").and_then(Value::as_str) {
            let owner = payload.get("owner").and_then(Value::as_str).unwrap_or("operator");
            steps.insert(0, json!({"action": action, "owner": owner, "due": "P0"}));
        }
        steps
    }

    fn policy_refs(task: &TaskPackage) -> Vec<String> {
        std::iter::once(format!("domain:{}", task.domain))
            .chain(task.constraints.iter().map(|c| format!("constraint:{c}")))
            .collect()
    }

    fn score(key: &str, content: &Map<String, Value>, task: &TaskPackage) -> f64 {
        let non_empty = |field: &str| match content.get(field) {
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            _ => false,
        };
        match key {
            "charter_alignment" => if non_empty("policy_refs") { 0.9 } else { 0.75 },
            "clarity" => if non_empty("summary") { 0.85 } else { 0.7 },
            "actionability" => if non_empty("next_steps") { 0.88 } else { 0.6 },
            "compliance" => {
                let cited = content.get("policy_refs").and_then(Value::as_array);
                let all_cited = task.constraints.iter().all(|c| {
                    let wanted = format!("constraint:{c}");
                    cited.is_some_and(|refs| refs.iter().any(|r| r.as_str() == Some(wanted.as_str())))
                });
                if all_cited { 0.92 } else { 0.65 }
            }
            _ => 0.5,
        }
    }

    fn evaluate(&self, content: &Map<String, Value>, task: &TaskPackage) -> Value {
        let mut criteria = Map::new();
        let mut weighted_total = 0.0;
        for criterion in &self.criteria {
            let score = Self::score(&criterion.key, content, task);
            weighted_total += score * criterion.weight;
            criteria.insert(criterion.key.clone(), json!({"score": score, "weight": criterion.weight}));
        }
        json!({"criteria": criteria, "weighted_total": weighted_total})
    }
}

#[async_trait]
impl WorkerExecutor for AdvisoryWorker {
    async fn execute(&self, task: &TaskPackage) -> Result<Artifact, WorkerFailure> {
        let payload = task
            .payload
            .as_object()
            .ok_or_else(|| WorkerFailure::systematic("payload is not a JSON object"))?;

        let mut content = Map::new();
        content.insert("persona".into(), json!(self.persona));
        content.insert("role".into(), json!(self.role));
        content.insert("summary".into(), json!(self.summarize(task, payload)));
        content.insert("advice".into(), json!(self.advise(payload)));
        content.insert("next_steps".into(), Value::Array(Self::next_steps(payload)));
        content.insert("policy_refs".into(), json!(Self::policy_refs(task)));
        let evaluation = self.evaluate(&content, task);
        content.insert("evaluation".into(), evaluation);

        debug!(task_id = %task.task_id, persona = %self.persona, "Advisory artifact produced");
        Ok(Artifact::new(task.task_id, ADVISORY_FORMAT, Value::Object(content)))
    }
}
