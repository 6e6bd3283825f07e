//! Prompt assembly for milestone, remediation and review invocations.

use crate::milestone::Milestone;
use crate::review::{IssueKind, ReviewReport, ReviewScope};

/// Recommendations carried into a remediation prompt.
const MAX_RECOMMENDATIONS: usize = 5;
/// TODO markers carried into a remediation prompt.
const MAX_TODOS: usize = 10;

/// Prompt for the single agent invocation of a milestone.
pub fn milestone_prompt(milestone: &Milestone) -> String {
    let mut tasks = String::new();
    for (i, task) in milestone.ordered_tasks().iter().enumerate() {
        tasks.push_str(&format!("{}. [{}] {}\n", i + 1, task.priority, task.description));
    }
    if tasks.is_empty() {
        tasks.push_str("(no open tasks; verify the milestone is complete)\n");
    }

    format!(
        r#"You are implementing milestone {id} - {title}.

## TASKS
Work through these tasks in order. Bug fixes come first.
{tasks}
## CRITICAL RULES
1. Check existing code before making changes
2. Run the project's tests and checks to verify your work
3. Do not leave TODO, FIXME or XXX markers behind
4. Do not commit; the orchestrator commits your changes

## TASK
Complete every task above for milestone {id}. Finish with a one-line summary of what changed."#,
        id = milestone.id,
        title = milestone.title,
        tasks = tasks,
    )
}

/// Prompt asking the agent to fix what the last review reported.
pub fn remediation_prompt(report: &ReviewReport) -> String {
    let mut sections = Vec::new();

    let recommendations: Vec<String> = report
        .issues_of(IssueKind::Recommendation)
        .take(MAX_RECOMMENDATIONS)
        .map(|i| format!("- {}", i))
        .collect();
    if !recommendations.is_empty() {
        sections.push(format!(
            "## RECOMMENDATIONS TO IMPLEMENT\n{}",
            recommendations.join("\n")
        ));
    }

    let todos: Vec<String> = report
        .issues_of(IssueKind::Todo)
        .take(MAX_TODOS)
        .map(|i| format!("- {}", i))
        .collect();
    if !todos.is_empty() {
        sections.push(format!("## TODOs TO ADDRESS\n{}", todos.join("\n")));
    }

    let gates: Vec<String> = report
        .issues_of(IssueKind::FailedGate)
        .map(|i| format!("- {}", i))
        .collect();
    if !gates.is_empty() {
        sections.push(format!("## QUALITY GATES TO FIX\n{}", gates.join("\n")));
    }

    let other: Vec<String> = report
        .blocking_issues()
        .filter(|i| matches!(i.kind, IssueKind::Finding | IssueKind::Timeout))
        .map(|i| format!("- {}", i))
        .collect();
    if !other.is_empty() {
        sections.push(format!("## OTHER ISSUES\n{}", other.join("\n")));
    }

    if sections.is_empty() {
        sections.push(format!(
            "## QUALITY SCORE\nThe review scored {:.2}; raise it to at least {:.2}.",
            report.score(),
            report.threshold()
        ));
    }

    format!(
        "A code review of {scope} scored {score:.2} (threshold {threshold:.2}). Fix the issues below.\n\n{body}\n\nRun the tests again after fixing. Finish with a one-line summary.",
        scope = report.scope(),
        score = report.score(),
        threshold = report.threshold(),
        body = sections.join("\n\n"),
    )
}

/// Prompt for a review pass over a milestone workspace or a merged stage.
pub fn review_prompt(scope: ReviewScope, focus: &str) -> String {
    format!(
        r#"Review the code in the current directory for {scope}.

## FOCUS
{focus}

## OUTPUT FORMAT
Report your findings using these markers, one per line:
- `Quality Score: <0.0-1.0>` (required, exactly once)
- `FAILED: <gate>` for every failing build, test or lint gate
- `TODO: <file>:<line> <text>` for every unresolved TODO, FIXME or XXX marker
- `RECOMMENDATION: <text>` for improvements worth making

Do not modify any files."#,
        scope = scope,
        focus = focus,
    )
}
