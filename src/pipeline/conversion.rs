use super::{succeeded, PhaseCounts, PhaseState, Pipeline, ToolFailure};
use crate::calibre::{BookId, LibraryBook, SourceKind};
use crate::config::{KfxZipMode, SourceFileManagement};
use crate::environment::CONVERSION_STAGING_PREFIX;
use crate::error::Result;
use crate::phase_log::{EntryKind, PhaseKind, PhaseLog};
use std::path::Path;

const PHASE: u8 = 4;
const PHASE_NAME: &str = "KFX to EPUB Conversion";
const INTERMEDIATE_MOBI: &str = "temp_conversion.mobi";

#[derive(Debug, Default)]
struct ConversionStats {
    converted: usize,
    merged: usize,
    failed: usize,
    drm_protected: usize,
    skipped_kfx_zip: usize,
    sources_removed: usize,
}

impl Pipeline<'_> {
    pub(super) async fn convert(&mut self) -> Result<PhaseState> {
        let ctx = self.ctx;
        self.begin_phase(PHASE, "Imported eBook to EPUB Conversion");

        let Some(library) = self.import_library.clone() else {
            return Ok(PhaseState::Summary);
        };
        let imported = self.imported.clone();
        let settings = &ctx.config.calibre_import;

        ctx.output.step(&format!("Converting {} book(s) to EPUB format...", imported.len()));
        ctx.output.step("Querying Calibre library for book information...");
        let books: Vec<LibraryBook> = match ctx.toolchain.list_books(&library).await {
            Ok(books) => books
                .into_iter()
                .filter(|book| imported.iter().any(|i| i.id == book.id))
                .collect(),
            Err(e) => {
                ctx.output.error(&format!("Failed to retrieve book information: {}", e));
                for book in &imported {
                    let subject = format!("Book {}", book.id);
                    self.fail(PhaseState::Convert, Some(&book.asin), &subject, &e.to_string());
                }
                self.summary.conversion = Some(PhaseCounts {
                    failed: imported.len(),
                    ..PhaseCounts::default()
                });
                return Ok(PhaseState::Summary);
            }
        };
        ctx.output.success(&format!("Retrieved information for {} book(s)", books.len()));
        ctx.output.blank();

        let mut log = PhaseLog::new(PhaseKind::Conversion);
        log.context("Library", library.display().to_string());
        log.context("Books", books.len().to_string());

        let mut stats = ConversionStats::default();
        for (index, book) in books.iter().enumerate() {
            ctx.shutdown.check_shutdown()?;

            let asin = imported
                .iter()
                .find(|i| i.id == book.id)
                .map(|i| i.asin.clone());
            let subject = format!("Book {} '{}' by {}", book.id, book.title, book.authors);
            ctx.output.step(&format!(
                "Processing book {}/{}: '{}' by {}",
                index + 1,
                books.len(),
                book.title,
                book.authors
            ));

            let Some(source) = book.source_file() else {
                let reason = "No source file (KFX/AZW/AZW3/KFX-ZIP) found";
                ctx.output.error(reason);
                stats.failed += 1;
                log.record(EntryKind::Failed, &subject, reason);
                self.fail(PhaseState::Convert, asin.as_deref(), &subject, reason);
                continue;
            };
            ctx.output.detail(&format!("Source: {}", file_name(&source.path)));

            if source.kind == SourceKind::KfxZip && settings.kfx_zip_mode == KfxZipMode::SkipKfxZip {
                ctx.output.detail("Skipping .kfx-zip file (DRM-protected)");
                stats.skipped_kfx_zip += 1;
                log.record(EntryKind::Skipped, &subject, "KFX-ZIP file (DRM-protected)");
                continue;
            }

            let epub = source.path.with_extension("epub");
            ctx.output.detail(&format!("Target: {}", file_name(&epub)));

            let spinner = ctx.progress.create_spinner("Converting to EPUB...");
            let converted = self.convert_source(&source.path, source.kind, &epub).await;
            spinner.finish_and_clear();

            if let Err(failure) = converted {
                ctx.output.error(failure.reason.lines().next().unwrap_or_default());
                stats.failed += 1;
                if source.kind == SourceKind::KfxZip {
                    stats.drm_protected += 1;
                }
                log.record(failure.kind, &subject, &failure.reason);
                self.fail(PhaseState::Convert, asin.as_deref(), &subject, &failure.reason);
                continue;
            }
            ctx.output.success("Conversion successful");
            stats.converted += 1;

            let merged = succeeded(ctx.toolchain.add_format(&library, book.id, &epub).await, "Merge");
            if let Err(failure) = merged {
                let reason = format!("Failed to merge format - {}", failure.reason);
                ctx.output.error(&reason);
                log.record(failure.kind, &subject, &reason);
                self.fail(PhaseState::Convert, asin.as_deref(), &subject, &reason);
                continue;
            }
            ctx.output.success("EPUB format merged successfully");
            stats.merged += 1;

            if self.remove_source_format(&library, book.id, source.kind).await {
                stats.sources_removed += 1;
            }
        }

        let failed_total = stats.failed + (stats.converted - stats.merged);
        self.summary.conversion = Some(PhaseCounts {
            succeeded: stats.merged,
            skipped: stats.skipped_kfx_zip,
            failed: failed_total,
        });

        ctx.output.print_separator();
        ctx.output.step("Conversion Summary:");
        ctx.output.success(&format!("Total books processed: {}", books.len()));
        ctx.output.success(&format!("Successfully converted: {}", stats.converted));
        ctx.output.success(&format!("Successfully merged to Calibre: {}", stats.merged));
        if stats.failed > 0 {
            ctx.output.error(&format!("Failed conversions: {}", stats.failed));
            if stats.drm_protected > 0 {
                ctx.output.error(&format!("  Failed (likely DRM-protected): {}", stats.drm_protected));
            }
        }
        if stats.skipped_kfx_zip > 0 {
            ctx.output.warning(&format!("Skipped (.kfx-zip files): {}", stats.skipped_kfx_zip));
        }
        if stats.sources_removed > 0 {
            ctx.output.success(&format!("Source files removed: {}", stats.sources_removed));
        }

        self.write_log(
            &log,
            &[
                ("Total Books".to_string(), books.len().to_string()),
                ("Converted".to_string(), stats.converted.to_string()),
                ("Merged".to_string(), stats.merged.to_string()),
                ("Failed".to_string(), stats.failed.to_string()),
                ("Likely DRM-Protected".to_string(), stats.drm_protected.to_string()),
                ("Skipped KFX-ZIP".to_string(), stats.skipped_kfx_zip.to_string()),
            ],
        );

        let mut points = vec![
            format!("Processed {} book(s) for EPUB conversion", books.len()),
            format!("Successfully converted: {} book(s)", stats.converted),
            format!("Successfully merged to Calibre: {} book(s)", stats.merged),
        ];
        if stats.failed > 0 {
            points.push(format!("Failed conversions: {} book(s)", stats.failed));
        }
        if stats.skipped_kfx_zip > 0 {
            points.push(format!("Skipped .kfx-zip files: {}", stats.skipped_kfx_zip));
        }
        if stats.sources_removed > 0 {
            points.push(format!("Source files removed: {}", stats.sources_removed));
        }
        self.end_phase(PHASE, PHASE_NAME, &points)?;

        Ok(PhaseState::Summary)
    }

    /// AZW3 goes through a MOBI intermediate; everything else converts
    /// straight to EPUB. Success needs exit 0 and the target on disk.
    async fn convert_source(
        &self,
        source: &Path,
        kind: SourceKind,
        epub: &Path,
    ) -> std::result::Result<(), ToolFailure> {
        let toolchain = self.ctx.toolchain;
        let timeout = self.ctx.config.conversion_timeout();

        if kind != SourceKind::Azw3 {
            succeeded(toolchain.convert(source, epub, timeout).await, "Conversion")?;
            return require_output(epub);
        }

        let staging = self
            .ctx
            .workspace
            .staging_dir(CONVERSION_STAGING_PREFIX)
            .map_err(|e| ToolFailure {
                kind: EntryKind::Failed,
                reason: format!("Could not create conversion folder: {}", e),
            })?;
        let mobi = staging.path().join(INTERMEDIATE_MOBI);

        succeeded(toolchain.convert(source, &mobi, timeout).await, "AZW3 to MOBI conversion")
            .and_then(|_| require_output(&mobi))
            .map_err(|f| ToolFailure {
                reason: format!("Step 1 failed: {}", f.reason),
                ..f
            })?;
        succeeded(toolchain.convert(&mobi, epub, timeout).await, "MOBI to EPUB conversion")
            .and_then(|_| require_output(epub))
            .map_err(|f| ToolFailure {
                reason: format!("Step 2 failed: {}", f.reason),
                ..f
            })
    }

    /// Applies the configured source handling after a successful merge.
    /// Returns whether a format was removed.
    async fn remove_source_format(&self, library: &Path, id: BookId, kind: SourceKind) -> bool {
        let ctx = self.ctx;
        let remove = match ctx.config.calibre_import.source_file_management {
            SourceFileManagement::KeepBoth => false,
            SourceFileManagement::DeleteSource => true,
            SourceFileManagement::DeleteKfxZipOnly => kind == SourceKind::KfxZip,
        };
        if !remove {
            return false;
        }

        let format = kind.format_name();
        ctx.output.detail(&format!("Removing {} format from Calibre...", format));
        match succeeded(ctx.toolchain.remove_format(library, id, format).await, "Format removal") {
            Ok(_) => {
                ctx.output.success(&format!("{} format removed", format));
                true
            }
            Err(failure) => {
                ctx.output.warning(&format!("Failed to remove {} format: {}", format, failure.reason));
                false
            }
        }
    }
}

fn require_output(path: &Path) -> std::result::Result<(), ToolFailure> {
    if path.exists() {
        Ok(())
    } else {
        Err(ToolFailure {
            kind: EntryKind::Failed,
            reason: format!("Conversion produced no output file: {}", file_name(path)),
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
