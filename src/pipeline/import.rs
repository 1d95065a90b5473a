use super::{completed, ImportedBook, PhaseCounts, PhaseState, Pipeline};
use crate::calibre::{self, BookId, ImportResult, LibraryBook};
use crate::error::Result;
use crate::kindle;
use crate::phase_log::{EntryKind, PhaseKind, PhaseLog};
use crate::ui::ItemStatus;
use std::path::Path;

const PHASE: u8 = 3;
const PHASE_NAME: &str = "Calibre Auto-Import";

impl Pipeline<'_> {
    pub(super) async fn import(&mut self) -> Result<PhaseState> {
        let ctx = self.ctx;
        let Some(library) = self.import_library.clone() else {
            return Ok(PhaseState::Summary);
        };
        self.begin_phase(PHASE, PHASE_NAME);

        self.wait_for_calibre().await?;

        if !self.failed_extractions.is_empty() {
            ctx.output.warning(&format!(
                "Excluding {} book(s) whose key extraction failed:",
                self.failed_extractions.len()
            ));
            for asin in self.failed_extractions.keys() {
                ctx.output.detail(asin);
            }
            ctx.output.blank();
        }

        let failed = self.failed_asins();
        let files = kindle::find_import_files(&ctx.config.kindle_content_path, |asin| {
            failed.contains(asin) || self.skip_by_history(asin)
        });
        if files.is_empty() {
            ctx.output.warning("No .azw files to import");
            self.summary.import = Some(PhaseCounts::default());
            return Ok(PhaseState::Summary);
        }

        self.allow_duplicates = self.cleanup_kfx_zip_books(&library).await?;

        let mut log = PhaseLog::new(PhaseKind::Import);
        log.context("Library", library.display().to_string());
        log.context("Books Found", files.len().to_string());
        if self.allow_duplicates {
            log.context("Mode", "duplicates allowed");
        }

        let timeout = ctx.config.per_item_timeout();
        let mut counts = PhaseCounts::default();
        let mut timed_out = 0;

        ctx.output.step(&format!("Importing {} book(s) into Calibre...", files.len()));
        for (index, (asin, file)) in files.iter().enumerate() {
            ctx.shutdown.check_shutdown()?;

            let label = display_name(file);
            let spinner = ctx.progress.create_spinner(&label);
            let result = ctx
                .toolchain
                .import_book(file, &library, self.allow_duplicates, timeout)
                .await;
            spinner.finish_and_clear();

            let (kind, reason) = match completed(result, "Import") {
                Ok(output) => match calibre::parse_add_output(&output) {
                    ImportResult::Imported { book_id } => {
                        ctx.output.item_result(index + 1, files.len(), &label, ItemStatus::Ok);
                        tracing::debug!(asin = %asin, book_id, "book imported");
                        counts.succeeded += 1;
                        self.imported.push(ImportedBook {
                            id: book_id,
                            asin: asin.clone(),
                        });
                        self.record_history(asin);
                        continue;
                    }
                    ImportResult::Duplicate { title } => {
                        ctx.output.item_result(index + 1, files.len(), &label, ItemStatus::Skipped);
                        counts.skipped += 1;
                        let detail = match title {
                            Some(title) => format!("Already in library: {}", title),
                            None => "Already in library".to_string(),
                        };
                        log.record(EntryKind::Skipped, &label, &detail);
                        // already in the library, so nothing left to do for it
                        self.record_history(asin);
                        continue;
                    }
                    ImportResult::Failed { error } => (EntryKind::Failed, error),
                },
                Err(failure) => (failure.kind, failure.reason),
            };

            let status = if kind == EntryKind::Timeout {
                timed_out += 1;
                ItemStatus::TimedOut
            } else {
                ItemStatus::Failed
            };
            ctx.output.item_result(index + 1, files.len(), &label, status);
            ctx.output.detail(reason.lines().next().unwrap_or_default());
            counts.failed += 1;
            log.record(kind, &label, &reason);
            self.fail(PhaseState::Import, Some(asin), &label, &reason);
        }

        self.summary.import = Some(counts);
        self.summary.imported_ids = self.imported.iter().map(|book| book.id).collect();

        self.write_log(
            &log,
            &[
                ("Total Books".to_string(), files.len().to_string()),
                ("Imported".to_string(), counts.succeeded.to_string()),
                ("Duplicates".to_string(), counts.skipped.to_string()),
                ("Timed Out".to_string(), timed_out.to_string()),
                ("Failed".to_string(), (counts.failed - timed_out).to_string()),
            ],
        );

        let mut points = vec![format!("Imported {} ebook(s) to Calibre library", counts.succeeded)];
        if !self.summary.imported_ids.is_empty() {
            let ids: Vec<String> = self.summary.imported_ids.iter().map(BookId::to_string).collect();
            points.push(format!("Books added with IDs: {}", ids.join(", ")));
        }
        if counts.skipped > 0 {
            points.push(format!("Skipped {} book(s) already in the library", counts.skipped));
        }
        if timed_out > 0 {
            points.push(format!("Timed out: {} book(s)", timed_out));
        }
        if counts.failed > timed_out {
            points.push(format!("Failed to import: {} book(s)", counts.failed - timed_out));
        }
        self.end_phase(PHASE, PHASE_NAME, &points)?;

        let convert = ctx.config.calibre_import.convert_to_epub && !self.imported.is_empty();
        Ok(if convert {
            PhaseState::Convert
        } else {
            PhaseState::Summary
        })
    }

    /// Offers to remove library books carrying a KFX-ZIP format, which are
    /// usually failed decryptions from an earlier import. Returns whether
    /// the import has to run in duplicates mode.
    async fn cleanup_kfx_zip_books(&self, library: &Path) -> Result<bool> {
        let ctx = self.ctx;

        let books = match ctx.toolchain.list_books(library).await {
            Ok(books) => books,
            Err(e) => {
                tracing::warn!(error = %e, "could not list library books");
                ctx.output.error(&format!("Failed to query Calibre library: {}", e));
                return Ok(true);
            }
        };
        let kfx_zip: Vec<&LibraryBook> = books.iter().filter(|book| book.has_kfx_zip()).collect();
        if kfx_zip.is_empty() {
            return Ok(false);
        }

        ctx.output.warning(&format!(
            "Found {} book(s) with KFX-ZIP format in the library",
            kfx_zip.len()
        ));
        ctx.output.detail("These are usually DRM-protected copies that failed to decrypt.");
        ctx.output.detail("Removing them allows a clean import of the newly decrypted versions.");
        ctx.output.warning("These KFX-ZIP books may NOT be related to the current import!");
        ctx.output.info("Books to remove:");
        for book in &kfx_zip {
            ctx.output.detail(&format!("[{}] {}", book.id, book.title));
        }
        ctx.output.info("[C] Continue - Remove these KFX-ZIP books and import (recommended)");
        ctx.output.info("[S] Skip - Keep existing books, import with duplicates");

        if ctx.prompter.choose_or("Your choice (C/S) [C]: ", &['C', 'S'], 'C')? == 'S' {
            ctx.output.warning("Skipping KFX-ZIP cleanup - will use duplicates mode");
            return Ok(true);
        }

        let ids: Vec<BookId> = kfx_zip.iter().map(|book| book.id).collect();
        ctx.output.step(&format!("Removing {} KFX-ZIP book(s)...", ids.len()));
        match super::succeeded(ctx.toolchain.remove_books(library, &ids).await, "Removal") {
            Ok(_) => {
                ctx.output.success(&format!("Successfully removed {} book(s)", ids.len()));
                Ok(false)
            }
            Err(failure) => {
                ctx.output.error(&format!("Failed to remove books: {}", failure.reason));
                ctx.output.warning("Continuing in duplicates mode");
                Ok(true)
            }
        }
    }
}

fn display_name(file: &Path) -> String {
    file.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}
