use std::sync::Arc;

use log::warn;

use fresco_stream::CompressorRegistry;

use crate::connection::{ConnectionDescription, TransportRegistry};
use crate::error::NodeError;
use crate::types::NodeId;

/// Wait forever.
pub const TIMEOUT_INDEFINITE: u64 = u64::MAX;

/// Tunable defaults, one record per local node; there is no process-wide
/// globals singleton.
#[derive(Clone, Debug)]
pub struct Globals {
    /// Port used by listen descriptors that don't name one.
    pub default_port: u16,
    /// A peer silent for longer than this is pinged.
    pub keepalive_ms: u64,
    /// Generic operation timeout: request waits, send-token staleness.
    pub timeout_ms: u64,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            default_port: 4242,
            keepalive_ms: 2_000,
            timeout_ms: 300_000,
        }
    }
}

impl Globals {
    /// Apply a `key=value,...` override string. Unknown keys and malformed
    /// values are reported and skipped; returns false if anything was
    /// rejected.
    pub fn apply(&mut self, overrides: &str) -> bool {
        let mut ok = true;
        for pair in overrides.split(',').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                warn!("ignoring malformed global '{pair}'");
                ok = false;
                continue;
            };
            let applied = match key.trim() {
                "port" => value.trim().parse().map(|v| self.default_port = v).is_ok(),
                "keepalive" => value.trim().parse().map(|v| self.keepalive_ms = v).is_ok(),
                "timeout" => value.trim().parse().map(|v| self.timeout_ms = v).is_ok(),
                other => {
                    warn!("unknown global '{other}'");
                    false
                }
            };
            if !applied {
                warn!("ignoring global override '{pair}'");
                ok = false;
            }
        }
        ok
    }
}

/// Everything a [`crate::LocalNode`] needs at construction time.
pub struct LocalNodeConfig {
    pub id: NodeId,
    pub globals: Globals,
    pub listen: Vec<ConnectionDescription>,
    pub transports: Arc<TransportRegistry>,
    pub compressors: Arc<CompressorRegistry>,
}

impl Default for LocalNodeConfig {
    fn default() -> Self {
        Self {
            id: NodeId::random(),
            globals: Globals::default(),
            listen: Vec::new(),
            transports: Arc::new(TransportRegistry::with_defaults()),
            compressors: Arc::new(CompressorRegistry::with_defaults()),
        }
    }
}

impl LocalNodeConfig {
    /// Consume the `--eq-listen` / `--co-globals` options from `args`.
    ///
    /// Unparseable listen descriptors and globals strings are warned about
    /// and skipped, matching the tolerant intake of the original runtime.
    pub fn apply_args<I>(&mut self, args: I) -> Result<(), NodeError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter().peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--eq-listen" => match args.peek() {
                    Some(value) if !value.starts_with('-') => {
                        let value = args.next().unwrap_or_default();
                        match ConnectionDescription::from_str_with_port(
                            &value,
                            self.globals.default_port,
                        ) {
                            Some(description) => self.listen.push(description),
                            None => warn!("ignoring listen option: {value}"),
                        }
                    }
                    _ => warn!("no argument given to --eq-listen"),
                },
                "--co-globals" => match args.peek() {
                    Some(value) if !value.starts_with('-') => {
                        let value = args.next().unwrap_or_default();
                        if !self.globals.apply(&value) {
                            warn!("invalid globals string '{value}', using defaults");
                        }
                    }
                    _ => warn!("no argument given to --co-globals"),
                },
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportKind;

    #[test]
    fn globals_overrides() {
        let mut globals = Globals::default();
        assert!(globals.apply("port=9999,keepalive=500,timeout=1000"));
        assert_eq!(globals.default_port, 9999);
        assert_eq!(globals.keepalive_ms, 500);
        assert_eq!(globals.timeout_ms, 1000);
    }

    #[test]
    fn globals_rejects_junk_but_keeps_going() {
        let mut globals = Globals::default();
        assert!(!globals.apply("bogus=1,port=1234"));
        assert_eq!(globals.default_port, 1234);
    }

    #[test]
    fn args_intake() {
        let mut config = LocalNodeConfig::default();
        config
            .apply_args(
                [
                    "--co-globals",
                    "port=7000",
                    "--eq-listen",
                    "tcp:render1:7777",
                    "--eq-listen",
                    "pipe:local",
                    "--unrelated",
                ]
                .map(String::from),
            )
            .unwrap();
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].kind, TransportKind::Tcp);
        assert_eq!(config.listen[0].port, 7777);
        // picks up the default port set just before
        assert_eq!(config.listen[1].port, 7000);
    }

    #[test]
    fn missing_option_argument() {
        let mut config = LocalNodeConfig::default();
        config
            .apply_args(["--eq-listen", "--co-globals"].map(String::from))
            .unwrap();
        assert!(config.listen.is_empty());
    }
}
