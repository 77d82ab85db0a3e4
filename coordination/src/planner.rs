//! Planner (§4.F): turns a goal into a `Plan`, and manages step lifecycle,
//! decomposition of complex steps, and single-attempt sub-plans for failures.

use crate::data_model::{Complexity, Plan, Step, StepStatus, SubPlan};
use crate::worker_client::{WorkerClient, WorkerClientError};

const PLANNER_SYSTEM_PROMPT: &str = "You are a planning assistant. Respond with a single JSON object \
of the shape {\"steps\": [{\"description\": string, \"complexity\": \"simple\"|\"medium\"|\"complex\", \
\"dependencies\": [number], \"verification_criteria\": [string]}]}. Do not include any other text.";

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error(transparent)]
    Worker(#[from] WorkerClientError),
    #[error("planner response did not contain a parsable plan: {0}")]
    Unparseable(String),
}

pub struct Planner<'a> {
    client: &'a mut WorkerClient,
}

impl<'a> Planner<'a> {
    pub fn new(client: &'a mut WorkerClient) -> Self {
        Self { client }
    }

    /// Asks the planner model for an ordered, dependency-annotated step list
    /// and turns it into a fresh `Plan` with 1-based, contiguous step numbers.
    pub async fn create_plan(&mut self, goal: &str) -> Result<Plan, PlannerError> {
        let prompt = format!("Goal: {goal}\n\nProduce a step-by-step plan to achieve this goal.");
        let reply = self.client.start_session(PLANNER_SYSTEM_PROMPT, &prompt).await?;
        parse_plan(&reply.text)
    }

    /// Re-prompts the planner model with the failure context and returns a
    /// decomposition step list for a single complex step.
    pub async fn decompose_complex_step(&mut self, step: &Step) -> Result<Vec<Step>, PlannerError> {
        let prompt = format!(
            "The step \"{}\" (complexity: {:?}) is too large to execute directly. \
             Break it into an ordered list of smaller sub-steps.",
            step.description, step.complexity
        );
        let reply = self.client.continue_conversation(&prompt).await?;
        let mut plan = parse_plan(&reply.text)?;
        for sub in &mut plan.steps {
            sub.is_sub_step = true;
            sub.parent_step_number = Some(step.number);
        }
        Ok(plan.steps)
    }

    /// Builds a one-shot sub-plan for a failed step, tagging it so the
    /// workflow engine can track the single allowed attempt.
    pub async fn create_sub_plan(&mut self, step: &Step, reason: &str) -> Result<SubPlan, PlannerError> {
        let prompt = format!(
            "Step \"{}\" failed: {reason}\nPropose an alternative plan to accomplish the same step differently.",
            step.description
        );
        let reply = self.client.continue_conversation(&prompt).await?;
        let plan = parse_plan(&reply.text)?;
        Ok(SubPlan {
            parent_step_number: step.number,
            reason: reason.to_string(),
            plan,
        })
    }
}

/// Whether this step's complexity and repeated-failure history justify
/// decomposition rather than a plain retry.
pub fn should_decompose_step(step: &Step) -> bool {
    step.complexity == Complexity::Complex && step.status == StepStatus::Failed && step.decomposed_into.is_none()
}

/// A sub-plan may be attempted at most once per main step.
pub fn can_attempt_sub_plan(step: &Step) -> bool {
    step.status == StepStatus::Failed && !step.sub_plan_attempted
}

pub fn get_current_step(plan: &Plan) -> Option<&Step> {
    plan.current_step()
}

pub fn advance_step(plan: &mut Plan, step_number: u32) {
    if let Some(step) = plan.step_mut(step_number) {
        step.status = StepStatus::Completed;
        step.end_time = Some(chrono::Utc::now());
    }
}

pub fn fail_current_step(plan: &mut Plan, step_number: u32, reason: impl Into<String>) {
    if let Some(step) = plan.step_mut(step_number) {
        step.status = StepStatus::Failed;
        step.end_time = Some(chrono::Utc::now());
        step.failure_reason = Some(reason.into());
    }
}

/// Replaces the parent step's entry with its decomposition result: the
/// parent is marked decomposed (so it's no longer scheduled directly) and the
/// sub-steps are appended in order immediately after it.
pub fn inject_subtasks(plan: &mut Plan, parent_step_number: u32, subtasks: Vec<Step>) {
    let numbers: Vec<u32> = subtasks.iter().map(|s| s.number).collect();
    if let Some(parent) = plan.step_mut(parent_step_number) {
        parent.decomposed_into = Some(numbers);
        parent.status = StepStatus::Skipped;
    }
    let insert_at = plan
        .steps
        .iter()
        .position(|s| s.number == parent_step_number)
        .map(|idx| idx + 1)
        .unwrap_or(plan.steps.len());
    for (offset, sub) in subtasks.into_iter().enumerate() {
        plan.steps.insert(insert_at + offset, sub);
    }
}

pub fn abort_sub_plan(step: &mut Step, reason: impl Into<String>) {
    step.sub_plan_attempted = true;
    step.status = StepStatus::Failed;
    step.failure_reason = Some(reason.into());
}

pub fn is_complete(plan: &Plan) -> bool {
    plan.is_complete()
}

/// Parses the planner model's JSON step list, assigning contiguous 1-based
/// step numbers in response order.
fn parse_plan(text: &str) -> Result<Plan, PlannerError> {
    let value: serde_json::Value =
        extract_json_object(text).ok_or_else(|| PlannerError::Unparseable(text.to_string()))?;
    let steps_value = value
        .get("steps")
        .and_then(|v| v.as_array())
        .ok_or_else(|| PlannerError::Unparseable(text.to_string()))?;

    let mut steps = Vec::with_capacity(steps_value.len());
    for (idx, raw) in steps_value.iter().enumerate() {
        let number = (idx + 1) as u32;
        let description = raw
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("untitled step")
            .to_string();
        let complexity = match raw.get("complexity").and_then(|v| v.as_str()) {
            Some("complex") => Complexity::Complex,
            Some("medium") => Complexity::Medium,
            _ => Complexity::Simple,
        };
        let mut step = Step::new(number, description, complexity);
        step.dependencies = raw
            .get("dependencies")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_u64()).map(|n| n as u32).collect())
            .unwrap_or_default();
        step.verification_criteria = raw
            .get("verification_criteria")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(String::from).collect())
            .unwrap_or_default();
        steps.push(step);
    }
    Ok(Plan::new(steps))
}

fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plan_assigns_contiguous_numbers() {
        let text = r#"{"steps": [{"description": "a", "complexity": "simple"}, {"description": "b", "complexity": "complex", "dependencies": [1]}]}"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.steps[0].number, 1);
        assert_eq!(plan.steps[1].number, 2);
        assert_eq!(plan.steps[1].dependencies, vec![1]);
        assert_eq!(plan.steps[1].complexity, Complexity::Complex);
    }

    #[test]
    fn should_decompose_requires_complex_and_failed() {
        let mut step = Step::new(1, "x", Complexity::Complex);
        assert!(!should_decompose_step(&step));
        step.status = StepStatus::Failed;
        assert!(should_decompose_step(&step));
        step.decomposed_into = Some(vec![2, 3]);
        assert!(!should_decompose_step(&step));
    }

    #[test]
    fn inject_subtasks_places_after_parent_and_marks_skipped() {
        let mut plan = Plan::new(vec![Step::new(1, "parent", Complexity::Complex), Step::new(2, "next", Complexity::Simple)]);
        let subs = vec![Step::new(3, "sub a", Complexity::Simple), Step::new(4, "sub b", Complexity::Simple)];
        inject_subtasks(&mut plan, 1, subs);
        assert_eq!(plan.steps[0].status, StepStatus::Skipped);
        assert_eq!(plan.steps[1].number, 3);
        assert_eq!(plan.steps[2].number, 4);
        assert_eq!(plan.steps[3].number, 2);
    }

    #[test]
    fn can_attempt_sub_plan_is_single_shot() {
        let mut step = Step::new(1, "x", Complexity::Medium);
        step.status = StepStatus::Failed;
        assert!(can_attempt_sub_plan(&step));
        step.sub_plan_attempted = true;
        assert!(!can_attempt_sub_plan(&step));
    }
}
