// -----------------------------------------------------------------------------
// ----- LogLevel --------------------------------------------------------------

/// Verbosity of the operator binary. Applies to this crate's own events;
/// dependencies stay at `warn` unless the level is stricter than that.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// `EnvFilter` directive for this level.
    pub fn filter_directive(self) -> String {
        match self {
            LogLevel::Warn | LogLevel::Error => self.as_str().to_string(),
            _ => format!("warn,{}={}", env!("CARGO_CRATE_NAME"), self.as_str()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_levels_only_apply_to_this_crate() {
        assert_eq!(LogLevel::Debug.filter_directive(), "warn,gatelink=debug");
        assert_eq!(LogLevel::Info.filter_directive(), "warn,gatelink=info");
        assert_eq!(LogLevel::Error.filter_directive(), "error");
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
