//! Prompt text handed to the agent.

/// Appended to the agent's default system prompt on every iteration.
pub const SYSTEM_APPEND: &str = "You are in autonomous mode. \
Update .orchestrator/progress.md as you work. \
When the task is fully complete, commit all changes with a descriptive message using `git add -A && git commit -m '...'`, \
then write TASK_COMPLETE to .orchestrator/task-signal. \
If stuck after 3 attempts at the same issue, write TASK_BLOCKED to .orchestrator/task-signal.";

/// Sent when resuming an existing session.
pub const CONTINUE_PROMPT: &str = "Continue working. Check .orchestrator/progress.md for current state.";

/// System prompt for review checks.
pub const REVIEWER_SYSTEM_PROMPT: &str = "You are a strict code reviewer. \
You have full access to the workspace. \
Read whatever files you need to evaluate the review criteria. \
Respond with PASS or FAIL on the first line, then explain why.";

/// First prompt of a fresh context.
pub fn fresh_prompt(task_prompt: &str) -> String {
    format!(
        "{}\n\nCheck .orchestrator/progress.md for any prior progress.",
        task_prompt
    )
}

/// Prompt for a review check.
pub fn review_prompt(task_prompt: Option<&str>, criteria: &str, files: Option<&[String]>) -> String {
    let mut prompt = String::new();
    if let Some(task) = task_prompt {
        prompt.push_str(&format!("## Original task\n{}\n\n", task));
    }
    prompt.push_str(&format!("## Review criteria\n{}\n\n", criteria));
    if let Some(files) = files.filter(|f| !f.is_empty()) {
        prompt.push_str("## Files in scope\n");
        for file in files {
            prompt.push_str(&format!("- {}\n", file));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Review the code in this workspace. Read whatever files you need to evaluate the criteria above. \
When done, respond with exactly PASS or FAIL on the FIRST line, then your reasoning.",
    );
    prompt
}
