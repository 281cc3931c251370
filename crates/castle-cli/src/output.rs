use castle_core::action::{ActionStatus, SchedulerReport};
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

/// One row per action, then a summary line with the return code.
pub fn print_report(report: &SchedulerReport) {
    let rows = report
        .records
        .iter()
        .map(|(id, record)| {
            let elapsed = record
                .elapsed
                .map(|d| format!("{:.1}s", d.as_secs_f64()))
                .unwrap_or_default();
            let detail = match &record.status {
                ActionStatus::Failed { cause } => cause.clone(),
                ActionStatus::Skipped { blocked_by } => format!("blocked by {blocked_by}"),
                _ => String::new(),
            };
            vec![id.clone(), record.status.label().to_string(), elapsed, detail]
        })
        .collect();
    print_table(&["ACTION", "STATUS", "ELAPSED", "DETAIL"], rows);
    println!();
    if report.timed_out {
        println!("Timed out before every action finished.");
    }
    println!(
        "Result: {} (exit {})",
        report.return_code,
        report.return_code.code()
    );
}
