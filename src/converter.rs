//! Conversion backends.
//!
//! A backend implements [`Converter`] to turn a [`ConversionSource`] into an
//! artifact. Backends that keep their results somewhere also hold a
//! [`Persist`] implementation and expose it through
//! [`Converter::persistence`]; the queue uploads through it after a
//! successful conversion.

use crate::error::ConversionError;
use crate::executor::ProcessExecutor;
use crate::source::{ConversionSource, Format};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Turns a conversion request into artifact bytes.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Converts `source`, returning [`ConversionError::Cancelled`] promptly
    /// once `cancel` fires. No process or resource may outlive the call.
    async fn convert(
        &self,
        source: &ConversionSource,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, ConversionError>;

    /// Storage for converted artifacts, if this backend has any.
    fn persistence(&self) -> Option<&dyn Persist> {
        None
    }
}

/// Stores converted artifacts outside the service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Persist: Send + Sync {
    /// Stores `payload` under `key`. `Ok(false)` means the store declined it.
    async fn upload(&self, key: &str, payload: &[u8]) -> Result<bool, ConversionError>;
}

/// Builds the argument vector for the command-line converter.
///
/// The external tool expects exactly this order: base tokens, the source
/// path, `-A`, the format flag, then `--wait-for-status`.
pub fn construct_command(
    base: &str,
    path: &str,
    format: Format,
    aggressive: bool,
    wait_for_status: bool,
) -> Vec<String> {
    let mut args: Vec<String> = base.split_whitespace().map(str::to_string).collect();
    args.push(path.to_string());
    if aggressive {
        args.push("-A".to_string());
    }

    match format {
        Format::Pdf => args.push("--pdf".to_string()),
        Format::Png => args.push("--png".to_string()),
    }

    if wait_for_status {
        args.push("--wait-for-status".to_string());
    }
    args
}

/// Backend that shells out to an HTML converter CLI, e.g.
/// `htmlconverter -S -T 120`, and reads the artifact from its stdout.
pub struct CliConverter {
    command: String,
    executor: ProcessExecutor,
    store: Option<Arc<dyn Persist>>,
}

impl CliConverter {
    /// Creates a converter around the given base command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            executor: ProcessExecutor::new(),
            store: None,
        }
    }

    pub fn with_executor(mut self, executor: ProcessExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Uploads every successful conversion to `store`.
    pub fn with_store(mut self, store: Arc<dyn Persist>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Converter for CliConverter {
    async fn convert(
        &self,
        source: &ConversionSource,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, ConversionError> {
        info!(format = %source.format(), uri = %source.actual_uri(), "Converting");

        let argv = construct_command(
            &self.command,
            source.uri(),
            source.format(),
            source.aggressive(),
            source.wait_for_status(),
        );
        info!(argv = ?argv, "Executing conversion command");

        self.executor.run(&argv, cancel).await
    }

    fn persistence(&self) -> Option<&dyn Persist> {
        self.store.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_order_is_exact() {
        let args = construct_command("htmlconverter -S -T 120", "http://x", Format::Pdf, true, true);
        assert_eq!(
            args,
            vec!["htmlconverter", "-S", "-T", "120", "http://x", "-A", "--pdf", "--wait-for-status"]
        );
    }

    #[test]
    fn plain_png_command() {
        let args = construct_command("htmlconverter", "/tmp/page.html", Format::Png, false, false);
        assert_eq!(args, vec!["htmlconverter", "/tmp/page.html", "--png"]);
    }

    #[test]
    fn unrecognized_format_uses_png_flag() {
        let args = construct_command("htmlconverter  -S", "http://x", Format::from("jpeg"), false, true);
        assert_eq!(args, vec!["htmlconverter", "-S", "http://x", "--png", "--wait-for-status"]);
    }

    #[tokio::test]
    async fn cli_converter_passes_source_flags() {
        // `echo` prints the arguments it receives after the base tokens.
        let converter = CliConverter::new("echo -n");
        let source = ConversionSource::new("http://example.com", Format::Pdf).with_aggressive(true);

        let out = converter.convert(&source, CancellationToken::new()).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "http://example.com -A --pdf");
    }

    #[test]
    fn persistence_is_composed_in() {
        let plain = CliConverter::new("htmlconverter");
        assert!(plain.persistence().is_none());

        let stored = CliConverter::new("htmlconverter").with_store(Arc::new(MockPersist::new()));
        assert!(stored.persistence().is_some());
    }
}
