use super::{PhaseState, Pipeline};
use crate::error::Result;
use crate::keys::{self, DSN_FIELD, TOKENS_FIELD};
use crate::plugin::{PluginConfigurator, PluginSummary};
use serde_json::Value;

const PHASE: u8 = 2;
const PHASE_NAME: &str = "DeDRM Plugin Configuration";

impl Pipeline<'_> {
    pub(super) async fn configure_plugin(&mut self) -> Result<PhaseState> {
        let ctx = self.ctx;
        self.begin_phase(PHASE, "DeDRM Plugin Auto-Configuration");

        self.wait_for_calibre().await?;

        let configurator = PluginConfigurator::new(ctx.paths.dedrm_config(), ctx.workspace.backups_dir());
        ctx.output.step("Configuring DeDRM plugin...");

        let backup = configurator.backup()?;
        if let Some(path) = &backup {
            ctx.output.success(&format!("Backed up existing configuration to {}", path.display()));
        }

        ctx.output.step("Processing kindlekey.k4i...");
        let kindle_key = keys::build_kindle_key(&ctx.workspace.account_key_file(), &self.report)?;

        let voucher_file = ctx.workspace.voucher_key_file();
        let summary = configurator.apply(kindle_key, &voucher_file, backup.as_deref())?;
        ctx.output.success(&format!("Updated {}", configurator.config_path().display()));
        ctx.output.success("Configuration verified successfully");
        self.summary.plugin_configured = true;

        ctx.output.blank();
        ctx.output.print_table(&self.key_table(&summary));

        let mut points = vec![
            "Processed kindlekey.k4i and created Kindle key data".to_string(),
            "Updated DeDRM plugin configuration (dedrm.json)".to_string(),
            format!("Set extra key file path: {}", summary.extra_key_file),
        ];
        if let Some(path) = &backup {
            points.push(format!("Created configuration backup: {}", path.display()));
        }
        points.push("Configuration verified successfully".to_string());
        self.end_phase(PHASE, PHASE_NAME, &points)?;

        Ok(if self.import_library.is_some() {
            PhaseState::Import
        } else {
            PhaseState::Summary
        })
    }

    fn key_table(&self, summary: &PluginSummary) -> Vec<(String, String)> {
        let hide = self.ctx.config.hide_sensitive_info;
        let shown = |value: &str| if hide { keys::obfuscate(value) } else { value.to_string() };
        let key = summary.kindle_key.as_ref();
        let text = |field: &str| {
            key.and_then(|k| k.get(field))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let count = |field: &str| {
            key.and_then(|k| k.get(field))
                .and_then(Value::as_array)
                .map_or(0, Vec::len)
                .to_string()
        };

        vec![
            ("Total Kindle Keys".to_string(), summary.kindle_key_count.to_string()),
            ("Extra Key File Path".to_string(), summary.extra_key_file.clone()),
            ("DSN".to_string(), shown(&text(DSN_FIELD))),
            ("Tokens".to_string(), shown(&text(TOKENS_FIELD))),
            ("Old Secrets".to_string(), count("kindle.account.secrets")),
            ("New Secrets".to_string(), count("kindle.account.new_secrets")),
            (
                "Voucher Keys Count".to_string(),
                keys::count_voucher_keys(&self.ctx.workspace.voucher_key_file()).to_string(),
            ),
        ]
    }
}
