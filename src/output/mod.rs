use anyhow::Result;
use console::style;
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::upload::FileRecord;
use crate::utils::format_file_size;
use crate::UploadError;

/// Result of one file's upload attempt
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub file: String,
    pub outcome: std::result::Result<FileRecord, UploadError>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    file: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<&'a FileRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonError>,
}

#[derive(Serialize)]
struct JsonError {
    kind: &'static str,
    message: String,
    remedy: &'static str,
}

/// Render upload results as JSON
pub fn format_as_json(reports: &[UploadReport]) -> Result<String> {
    let entries: Vec<JsonReport<'_>> = reports
        .iter()
        .map(|report| match &report.outcome {
            Ok(record) => JsonReport {
                file: &report.file,
                status: "succeeded",
                record: Some(record),
                error: None,
            },
            Err(e) => JsonReport {
                file: &report.file,
                status: "failed",
                record: None,
                error: Some(JsonError {
                    kind: e.kind(),
                    message: e.to_string(),
                    remedy: e.remedy(),
                }),
            },
        })
        .collect();

    Ok(serde_json::to_string_pretty(&entries)?)
}

/// Render upload results as human-readable text
pub fn format_as_text(reports: &[UploadReport]) -> String {
    let mut lines = Vec::new();

    for report in reports {
        match &report.outcome {
            Ok(record) => {
                lines.push(format!("{} {}", style("✔").green(), report.file));
                lines.push(format!("    Record:  {}", record.id));
                lines.push(format!("    Path:    {}", record.storage_path));
                lines.push(format!("    Size:    {}", format_file_size(record.size)));
                lines.push(format!("    Status:  {}", record.upload_status));
                lines.push(format!("    Created: {}", record.created_at.format("%Y-%m-%d %H:%M:%S UTC")));
            }
            Err(e) => {
                lines.push(format!("{} {}: {}", style("✘").red(), report.file, e));
                lines.push(format!("    {}", style(e.remedy()).dim()));
            }
        }
    }

    lines.join("\n")
}

/// Print upload results to console
pub fn print_reports(reports: &[UploadReport], format: &OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Text => format_as_text(reports),
        OutputFormat::Json => format_as_json(reports)?,
    };

    println!("{}", content);
    Ok(())
}
