//! Output formatting for CLI commands.
//!
//! Every formatter returns a `String`; the caller decides where it goes.
//! JSON output serializes the engine's own report types.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::engine::{DriftReport, DriftStatus};
use crate::graph::DependencyGraph;
use crate::model::ValidationReport;
use crate::planner::{ApplyReport, Operation, Plan, ResourceState};
use crate::state::ObservedState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Handle")]
    handle: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Handle")]
    handle: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        let mut output = String::new();

        for warning in &plan.warnings {
            let _ = writeln!(output, "{} {warning}", "⚠".yellow());
        }

        if !plan.has_changes() {
            let _ = writeln!(
                output,
                "{} No changes required - infrastructure is up to date.",
                "✓".green()
            );
            return output;
        }

        let _ = write!(output, "\nPlan for {}/{}\n", plan.stack, plan.environment);
        let _ = write!(output, "   Config hash: {}\n\n", short_hash(&plan.config_hash));

        let rows: Vec<ChangeRow> = plan
            .changes
            .iter()
            .filter(|c| detailed || c.operation.is_change())
            .enumerate()
            .map(|(i, c)| ChangeRow {
                index: i + 1,
                action: Self::format_operation(c.operation),
                resource: c.resource.clone(),
                kind: c.kind.to_string(),
                reason: truncate(&c.reason, 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for change in plan.changes.iter().filter(|c| !c.property_changes.is_empty()) {
                let _ = writeln!(output, "\n   {}:", change.resource.bold());
                for property in &change.property_changes {
                    let line = property.to_string();
                    if property.immutable {
                        let _ = writeln!(output, "     {}", line.red());
                    } else {
                        let _ = writeln!(output, "     {line}");
                    }
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.replace_count().to_string().magenta(),
            plan.delete_count().to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ApplyReport) -> String {
        let mut output = String::new();

        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .filter(|o| o.operation.is_change())
            .map(|o| OutcomeRow {
                resource: o.resource.clone(),
                action: Self::format_operation(o.operation),
                state: Self::format_state_label(o.state),
                attempts: o.attempts,
                handle: o.handle.as_ref().map_or_else(String::new, |h| truncate(h.as_str(), 24)),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let status = if report.success() {
            format!("{} Apply complete", "✓".green())
        } else if report.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply failed", "✗".red())
        };

        let _ = write!(
            output,
            "\n{status} ({} applied, {} failed, {} not started) in {:.1}s\n",
            report.applied_count(),
            report.failed_count(),
            report.pending_count(),
            report.duration().num_milliseconds() as f64 / 1000.0
        );

        for outcome in report.outcomes.iter().filter(|o| o.state != ResourceState::Applied) {
            if let Some(error) = &outcome.error {
                let _ = writeln!(output, "   {} {}: {error}", "✗".red(), outcome.resource);
            } else if let Some(blocker) = &outcome.blocked_by {
                let _ = writeln!(
                    output,
                    "   {} {}: waiting on '{blocker}'",
                    "-".dimmed(),
                    outcome.resource
                );
            }
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in report.entries.iter().filter(|e| e.status != DriftStatus::InSync) {
                    let status = match entry.status {
                        DriftStatus::Drifted => entry.status.to_string().yellow(),
                        DriftStatus::Missing => entry.status.to_string().red(),
                        _ => entry.status.to_string().dimmed(),
                    };
                    let _ = writeln!(output, "   - {} ({}): {status}", entry.resource, entry.kind);
                    for difference in &entry.differences {
                        let _ = writeln!(output, "       {difference}");
                    }
                    if let Some(error) = &entry.error {
                        let _ = writeln!(output, "       {error}");
                    }
                }
                for name in &report.unprovisioned {
                    let _ = writeln!(output, "   - {name}: declared but not provisioned");
                }
                for name in &report.undeclared {
                    let _ = writeln!(output, "   - {name}: recorded but no longer declared");
                }

                let _ = write!(
                    output,
                    "\n{}/{} recorded resources have drifted.\n",
                    report.drifted_resources().len(),
                    report.entries.len()
                );
                output
            }
        }
    }

    /// Formats the observed state.
    #[must_use]
    pub fn format_state(&self, state: &ObservedState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.stack, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.resources.is_empty() {
                    let mut records: Vec<_> = state.resources.values().collect();
                    records.sort_by_key(|r| r.position);

                    let rows: Vec<RecordRow> = records
                        .into_iter()
                        .map(|r| RecordRow {
                            name: r.name.clone(),
                            kind: r.kind.to_string(),
                            handle: truncate(r.handle.as_str(), 24),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {:?} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a validation report.
    #[must_use]
    pub fn format_validation(&self, report: &ValidationReport, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                for error in &report.errors {
                    let _ = writeln!(output, "{} {error}", "✗".red());
                }
                if show_warnings {
                    for warning in &report.warnings {
                        let _ = writeln!(output, "{} {warning}", "⚠".yellow());
                    }
                }

                if report.is_valid() {
                    let _ = writeln!(
                        output,
                        "{} Declaration is valid ({} warnings)",
                        "✓".green(),
                        report.warning_count()
                    );
                } else {
                    let _ = writeln!(
                        output,
                        "{} {} errors, {} warnings",
                        "✗".red(),
                        report.error_count(),
                        report.warning_count()
                    );
                }

                output
            }
        }
    }

    /// Formats the dependency graph, either as DOT or as the apply order.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph, dot: bool) -> String {
        if dot {
            return graph.to_dot();
        }

        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<GraphNodeJson<'_>> = graph
                    .topological_order()
                    .into_iter()
                    .map(|d| GraphNodeJson {
                        name: &d.name,
                        kind: d.kind.to_string(),
                        depends_on: graph.dependencies(&d.name),
                    })
                    .collect();
                serde_json::to_string_pretty(&nodes).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for (i, descriptor) in graph.topological_order().into_iter().enumerate() {
                    let _ = write!(output, "{:>3}. {} ({})", i + 1, descriptor.name.bold(), descriptor.kind);
                    let deps = graph.dependencies(&descriptor.name);
                    if !deps.is_empty() {
                        let _ = write!(output, " <- {}", deps.join(", "));
                    }
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats an operation with color.
    fn format_operation(operation: Operation) -> String {
        match operation {
            Operation::Create => "+create".green().to_string(),
            Operation::Update => "~update".yellow().to_string(),
            Operation::Replace => "±replace".magenta().to_string(),
            Operation::Delete => "-delete".red().to_string(),
            Operation::NoOp => "no-op".dimmed().to_string(),
        }
    }

    /// Formats a change state with color.
    fn format_state_label(state: ResourceState) -> String {
        match state {
            ResourceState::Applied => "applied".green().to_string(),
            ResourceState::Failed => "failed".red().to_string(),
            ResourceState::Applying => "applying".yellow().to_string(),
            ResourceState::Planned => "planned".dimmed().to_string(),
        }
    }
}

#[derive(serde::Serialize)]
struct GraphNodeJson<'a> {
    name: &'a str,
    kind: String,
    depends_on: Vec<&'a str>,
}

fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceDescriptor, ResourceKind};
    use crate::planner::{Change, ChangeSet};

    fn change(name: &str, operation: Operation) -> Change {
        Change {
            resource: name.to_string(),
            kind: ResourceKind::Bucket,
            operation,
            property_changes: Vec::new(),
            reason: "not yet provisioned".to_string(),
            position: 0,
            dependencies: Vec::new(),
            recorded_dependencies: Vec::new(),
            descriptor: Some(ResourceDescriptor::new(name, ResourceKind::Bucket)),
            fingerprint: None,
            recorded_handle: None,
            recorded_fingerprint: None,
        }
    }

    #[test]
    fn test_empty_plan_text() {
        colored::control::set_override(false);
        let plan = Plan::new("shop", "dev", "abcdef0123", ChangeSet::new(vec![change("a", Operation::NoOp)]));
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, false);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_plan_json_lists_operations() {
        let plan = Plan::new("shop", "dev", "abcdef0123", ChangeSet::new(vec![change("assets", Operation::Create)]));
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["changes"][0]["resource"], "assets");
        assert_eq!(value["changes"][0]["operation"], "create");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
