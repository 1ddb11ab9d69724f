// Output formatting for CLI

use anyhow::Result;
use benchflow_core::ResourceStatus;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        if let OutputFormat::Json = self {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }

    /// Print the final status of a create or start run
    pub fn print_status(&self, status: &ResourceStatus) -> Result<()> {
        if self.is_text() {
            print_field("Name", &status.name);
            print_field("Status", &status.status);
            print_field("URL", &status.url);
            Ok(())
        } else {
            self.print_value(status)
        }
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<8} {}", format!("{}:", label), value);
}
