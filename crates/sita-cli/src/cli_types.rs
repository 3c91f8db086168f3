use clap::ValueEnum;

use sita_session::{SessionExportFormat, SessionStorageBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliSessionBackend {
    Jsonl,
    Sqlite,
}

impl From<CliSessionBackend> for SessionStorageBackend {
    fn from(value: CliSessionBackend) -> Self {
        match value {
            CliSessionBackend::Jsonl => SessionStorageBackend::Jsonl,
            CliSessionBackend::Sqlite => SessionStorageBackend::Sqlite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliExportFormat {
    Markdown,
    Text,
    Jsonl,
}

impl From<CliExportFormat> for SessionExportFormat {
    fn from(value: CliExportFormat) -> Self {
        match value {
            CliExportFormat::Markdown => SessionExportFormat::Markdown,
            CliExportFormat::Text => SessionExportFormat::Text,
            CliExportFormat::Jsonl => SessionExportFormat::Jsonl,
        }
    }
}
