use super::{PhaseCounts, PhaseState, Pipeline};
use crate::error::Result;
use crate::ui::output::format_duration;

impl Pipeline<'_> {
    pub(super) fn summarize(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let summary = &self.summary;

        ctx.output.blank();
        ctx.output.print_separator();
        if summary.plugin_configured && !summary.has_failures() {
            ctx.output.success("SUCCESS! Complete automation finished!");
        } else if summary.plugin_configured {
            ctx.output.warning("Automation finished with some failures");
        } else {
            ctx.output.step("Run finished");
        }
        ctx.output.print_separator();
        ctx.output.blank();

        let mut rows = vec![("Books Found".to_string(), summary.books_found.to_string())];
        rows.push(("Key Extraction".to_string(), counts_cell(&summary.extraction)));
        rows.push((
            "DeDRM Plugin".to_string(),
            if summary.plugin_configured { "Configured" } else { "Not changed" }.to_string(),
        ));
        if let Some(import) = &summary.import {
            rows.push(("Calibre Import".to_string(), counts_cell(import)));
        }
        if let Some(conversion) = &summary.conversion {
            rows.push(("EPUB Conversion".to_string(), counts_cell(conversion)));
        }
        rows.push(("Total Time".to_string(), format_duration(summary.elapsed)));
        ctx.output.print_table(&rows);

        if summary.plugin_configured {
            ctx.output.info("What was accomplished:");
            ctx.output.detail("Kindle keys extracted and merged into the Keys folder");
            ctx.output.detail("DeDRM plugin configured with the extracted keys");
            if !summary.imported_ids.is_empty() {
                ctx.output.detail(&format!(
                    "{} book(s) imported into Calibre",
                    summary.imported_ids.len()
                ));
            }
            if summary.conversion.map_or(0, |c| c.succeeded) > 0 {
                ctx.output.detail("Imported books converted to EPUB");
            }
            ctx.output.blank();
        }

        for phase in [PhaseState::Extract, PhaseState::Import, PhaseState::Convert] {
            let failures: Vec<_> = summary.failures.iter().filter(|f| f.phase == phase).collect();
            if failures.is_empty() {
                continue;
            }
            ctx.output.warning(&format!("{} failures ({}):", phase, failures.len()));
            for failure in failures {
                let reason = failure.reason.lines().next().unwrap_or_default();
                ctx.output.detail(&format!("{}: {}", failure.subject, reason));
            }
            ctx.output.blank();
        }

        if !summary.log_files.is_empty() {
            ctx.output.info("Log files:");
            for path in &summary.log_files {
                ctx.output.detail(&path.display().to_string());
            }
            ctx.output.blank();
        }

        let overall = summary.overall_line();
        tracing::info!(summary = %overall, "run finished");
        if summary.has_failures() {
            ctx.output.warning(&overall);
            ctx.prompter.pause("Press Enter to exit...")?;
            self.summary.paused = true;
        } else {
            ctx.output.success(&overall);
        }
        Ok(())
    }
}

fn counts_cell(counts: &PhaseCounts) -> String {
    format!(
        "{} succeeded, {} skipped, {} failed",
        counts.succeeded, counts.skipped, counts.failed
    )
}
