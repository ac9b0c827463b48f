use anyhow::Result;
use colored::*;
use disclaude_cli::App;
use disclaude_sandbox::commands::format_duration;
use serde_json::json;

use super::new_table;

pub async fn run(app: App, json_output: bool) -> Result<()> {
    let report = app.coordinator.status_report(None).await?;
    let live = app.coordinator.registry().list_live().await?;

    if json_output {
        let sandboxes: Vec<_> = report
            .sandboxes
            .iter()
            .map(|s| json!({ "name": s.name, "phase": s.phase.as_str() }))
            .collect();
        let out = json!({
            "usage": report.usage,
            "sessions": live,
            "sandboxes": sandboxes,
            "total_sandboxes": report.total_sandboxes,
            "list_error": report.list_error,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", "📊 Sandbox status".blue().bold());
    println!();
    println!(
        "{:<12} {}/{} ({} available)",
        "Capacity:".cyan(),
        report.usage.current,
        report.usage.max,
        report.usage.remaining()
    );
    println!("{:<12} {}", "Namespace:".cyan(), app.config.namespace);
    println!();

    if live.is_empty() {
        println!("{}", "No live sessions".yellow());
    } else {
        let mut table = new_table(vec!["Session", "Thread", "User", "Status", "Sandbox", "Age"]);
        for session in &live {
            table.add_row(vec![
                session.id.clone(),
                session.thread_id.clone(),
                session.user_id.clone(),
                session.status.as_str().to_string(),
                session.sandbox_name.clone(),
                format_duration(session.duration()),
            ]);
        }
        println!("{}", table);
    }

    if let Some(err) = &report.list_error {
        println!("{} {}", "Could not list sandboxes:".yellow(), err);
    } else if !report.sandboxes.is_empty() {
        println!();
        let mut table = new_table(vec!["Sandbox", "Phase"]);
        for sandbox in &report.sandboxes {
            table.add_row(vec![sandbox.name.clone(), sandbox.phase.to_string()]);
        }
        println!("{}", table);
        if report.total_sandboxes > report.sandboxes.len() {
            println!(
                "{}",
                format!("... and {} more", report.total_sandboxes - report.sandboxes.len()).dimmed()
            );
        }
    }

    Ok(())
}
