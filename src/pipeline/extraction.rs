use super::{completed, PhaseCounts, PhaseState, Pipeline};
use crate::environment::STAGING_PREFIX;
use crate::error::Result;
use crate::fsops::copy_tree;
use crate::keys::{self, KeyFilePair};
use crate::kindle::{self, BookFolder, KindleSession};
use crate::phase_log::{EntryKind, PhaseKind, PhaseLog};
use crate::ui::ItemStatus;

const PHASE: u8 = 1;
const PHASE_NAME: &str = "Key Extraction";

enum Extraction {
    Extracted,
    Failed(EntryKind, String),
}

impl Pipeline<'_> {
    pub(super) async fn extract(&mut self) -> Result<PhaseState> {
        let ctx = self.ctx;
        self.begin_phase(PHASE, "Key Extraction (Plugin-Compatible)");

        let content = &ctx.config.kindle_content_path;
        ctx.output.step(&format!("Scanning {} for books...", content.display()));
        let books = kindle::scan_content_dir(content)?;
        self.summary.books_found = books.len();

        if books.is_empty() {
            ctx.output.warning("No books found in the Kindle content folder");
            return Ok(PhaseState::Summary);
        }

        let (skipped, pending): (Vec<BookFolder>, Vec<BookFolder>) =
            books.into_iter().partition(|book| self.skip_by_history(&book.asin));
        self.summary.skipped_by_history = skipped.len();
        ctx.output.success(&format!("Found {} book folder(s)", self.summary.books_found));
        if !skipped.is_empty() {
            ctx.output.info(&format!(
                "Skipping {} book(s) already recorded in processing history",
                skipped.len()
            ));
        }
        if pending.is_empty() {
            ctx.output.success("Every book has already been processed - nothing to do");
            self.summary.extraction.skipped = skipped.len();
            return Ok(PhaseState::Summary);
        }

        let session = kindle::prepare_session(ctx.paths, ctx.extractor, ctx.prompter, ctx.output)?;
        let main_keys = KeyFilePair::new(ctx.workspace.voucher_key_file(), ctx.workspace.account_key_file());
        let temp_keys = main_keys.temp_sibling();

        let mut log = PhaseLog::new(PhaseKind::Extraction);
        log.context("Content Directory", content.display().to_string());
        log.context("Books Pending", pending.len().to_string());

        let mut counts = PhaseCounts {
            skipped: skipped.len(),
            ..PhaseCounts::default()
        };

        ctx.output.blank();
        ctx.output.step(&format!("Extracting keys from {} book(s)...", pending.len()));
        for (index, book) in pending.iter().enumerate() {
            ctx.shutdown.check_shutdown()?;

            let title = if ctx.config.fetch_book_titles {
                ctx.toolchain.fetch_title(&book.asin).await
            } else {
                None
            };
            let label = match &title {
                Some(title) => format!("{} - {}", book.folder_name, title),
                None => book.folder_name.clone(),
            };
            if let Some(title) = title {
                self.titles.insert(book.asin.clone(), title);
            }

            let spinner = ctx.progress.create_spinner(&label);
            let outcome = self.extract_one(&session, book, &main_keys, &temp_keys).await;
            spinner.finish_and_clear();

            match outcome {
                Extraction::Extracted => {
                    ctx.output.item_result(index + 1, pending.len(), &label, ItemStatus::Ok);
                    counts.succeeded += 1;
                    self.extracted.push(book.asin.clone());
                    if self.import_library.is_none() {
                        self.record_history(&book.asin);
                    }
                }
                Extraction::Failed(kind, reason) => {
                    let status = if kind == EntryKind::Timeout {
                        ItemStatus::TimedOut
                    } else {
                        ItemStatus::Failed
                    };
                    ctx.output.item_result(index + 1, pending.len(), &label, status);
                    ctx.output.detail(reason.lines().next().unwrap_or_default());
                    counts.failed += 1;
                    log.record(kind, &label, &reason);
                    self.fail(PhaseState::Extract, Some(&book.asin), &label, &reason);
                    self.failed_extractions.insert(book.asin.clone(), reason);
                }
            }
        }

        session.finish(ctx.output);
        self.summary.extraction = counts;

        let auto_update = match kindle::prevent_auto_update(ctx.paths) {
            Ok(Some(path)) => {
                tracing::info!(path = %path.display(), "auto-update prevention written");
                true
            }
            Ok(None) => false,
            Err(e) => {
                ctx.output.warning(&format!("Could not configure Kindle auto-update prevention: {}", e));
                false
            }
        };

        self.write_log(
            &log,
            &[
                ("Total Books".to_string(), pending.len().to_string()),
                ("Succeeded".to_string(), counts.succeeded.to_string()),
                ("Failed".to_string(), counts.failed.to_string()),
            ],
        );

        let mut points = vec![
            format!("Processed {} book(s)", pending.len()),
            format!("Successfully extracted keys from {} book(s)", counts.succeeded),
        ];
        if counts.failed > 0 {
            points.push(format!("Failed to extract keys from {} book(s)", counts.failed));
        }
        if counts.succeeded > 0 {
            points.push(format!("Generated: {}", main_keys.voucher.display()));
            points.push(format!("Generated: {}", main_keys.account.display()));
        }
        if auto_update {
            points.push("Kindle auto-update prevention configured".to_string());
        }
        self.end_phase(PHASE, PHASE_NAME, &points)?;

        if counts.succeeded == 0 {
            ctx.output.error("No keys were extracted - skipping the remaining phases");
            return Ok(PhaseState::Summary);
        }
        Ok(PhaseState::ConfigurePlugin)
    }

    /// Runs the extractor over a private copy of one book folder and merges
    /// the result into the accumulated key files.
    async fn extract_one(
        &mut self,
        session: &KindleSession,
        book: &BookFolder,
        main_keys: &KeyFilePair,
        temp_keys: &KeyFilePair,
    ) -> Extraction {
        let ctx = self.ctx;
        temp_keys.remove();

        let staging = match ctx.workspace.staging_dir(STAGING_PREFIX) {
            Ok(staging) => staging,
            Err(e) => return Extraction::Failed(EntryKind::Failed, format!("Could not create staging folder: {}", e)),
        };
        if let Err(e) = copy_tree(&book.path, &staging.path().join(&book.folder_name)) {
            return Extraction::Failed(EntryKind::Failed, format!("Could not copy book folder: {}", e));
        }

        let result = ctx
            .toolchain
            .extract_keys(session.extractor(), staging.path(), temp_keys, ctx.config.per_item_timeout())
            .await;
        let output = match completed(result, "Key extraction") {
            Ok(output) => output,
            Err(failure) => return Extraction::Failed(failure.kind, failure.reason),
        };

        let hide = ctx.config.hide_sensitive_info;
        if !output.success() {
            let reason = keys::summarize_extractor_failure(&output);
            temp_keys.remove();
            return Extraction::Failed(EntryKind::Failed, keys::filter_sensitive_output(&reason, hide));
        }
        if !temp_keys.exists() {
            return Extraction::Failed(
                EntryKind::Failed,
                "Extractor finished but wrote no key files".to_string(),
            );
        }

        let merged = keys::merge_key_files(main_keys, temp_keys);
        temp_keys.remove();
        match merged {
            Ok(outcome) => {
                tracing::debug!(
                    asin = %book.asin,
                    voucher_lines = outcome.voucher_lines_added,
                    secrets = outcome.secrets_added,
                    "keys merged"
                );
                self.report.absorb(keys::parse_extractor_output(&output.stdout));
                Extraction::Extracted
            }
            Err(e) => Extraction::Failed(EntryKind::Failed, format!("Could not merge key files: {}", e)),
        }
    }
}
