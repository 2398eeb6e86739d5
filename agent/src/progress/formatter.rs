//! Human-readable console output

use colored::Colorize;

use crate::models::precheck::{CheckSeverity, PreCheckSummary};
use crate::models::status::DeviceStatus;
use crate::upgrade::phase::UpgradePhase;

fn rule(width: usize) -> String {
    "-".repeat(width)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// Pre-check results as a table
pub fn format_check_table(summary: &PreCheckSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Passed: {} | Warnings: {} | Critical: {} | Total: {}\n",
        summary.passed().to_string().green(),
        summary.warnings().to_string().yellow(),
        summary.critical_failures().to_string().red(),
        summary.total()
    ));
    out.push_str(&rule(96));
    out.push('\n');
    out.push_str(&format!("{:<24} {:<6} {:<9} {}\n", "CHECK", "RESULT", "SEVERITY", "MESSAGE"));

    for result in &summary.results {
        let verdict = if result.passed { "PASS".green() } else { "FAIL".red() };
        let severity = match result.severity {
            CheckSeverity::Pass => "pass".green(),
            CheckSeverity::Info => "info".blue(),
            CheckSeverity::Warning => "warning".yellow(),
            CheckSeverity::Critical => "critical".red().bold(),
        };
        out.push_str(&format!(
            "{:<24} {:<6} {:<9} {}\n",
            result.check_name,
            verdict,
            severity,
            truncate(&result.message, 56)
        ));
        if !result.passed {
            if let Some(recommendation) = &result.recommendation {
                out.push_str(&format!("{:<24} hint: {}\n", "", recommendation));
            }
        }
    }
    out.push_str(&rule(96));
    out.push('\n');
    out
}

/// End-of-run summary for one device
pub fn format_device_summary(status: &DeviceStatus) -> String {
    let phase = match status.phase() {
        UpgradePhase::Completed => status.phase().to_string().green().bold(),
        UpgradePhase::RolledBack => status.phase().to_string().yellow().bold(),
        UpgradePhase::Failed => status.phase().to_string().red().bold(),
        other => other.to_string().normal(),
    };

    let mut out = String::new();
    out.push_str(&format!("{}\n", rule(80)));
    out.push_str(&format!("{} [{}]\n", status.hostname.bold(), phase));
    out.push_str(&format!(
        "  version: {} -> {} ({}, risk {})\n",
        status.current_version.as_deref().unwrap_or("unknown"),
        status
            .final_version
            .as_deref()
            .unwrap_or(status.target_version.as_str()),
        status.version_action,
        status.risk
    ));

    if let Some(result) = &status.upgrade_result {
        out.push_str(&format!("  duration: {:.1}s\n", result.duration_secs));
        if let Some(install) = &result.install_status {
            out.push_str(&format!("  install: {}\n", install));
        }
        if result.rollback_performed {
            out.push_str(&format!(
                "  rollback: {}\n",
                result.rollback_reason.as_deref().unwrap_or("performed").yellow()
            ));
        }
    }
    if let Some(summary) = &status.pre_check_summary {
        out.push_str(&format!(
            "  pre-checks: {}/{} passed, {} warnings, {} critical\n",
            summary.passed(),
            summary.total(),
            summary.warnings(),
            summary.critical_failures()
        ));
    }
    for warning in &status.warnings {
        out.push_str(&format!("  {} {}\n", "warning:".yellow(), warning));
    }
    if let Some(error) = &status.error {
        out.push_str(&format!("  {} {} ({})\n", "error:".red(), error.message, error.kind));
    }
    out
}
