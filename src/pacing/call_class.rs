// -----------------------------------------------------------------------------
// ----- CallClass -------------------------------------------------------------

/// How a gateway call is counted against the pacing limits.
///
/// Light calls only count towards global throughput. Heavy calls are also
/// spaced, weighted in the rolling window and, when they carry a resource
/// key, limited per key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallClass {
    pub heavy: bool,
    pub resource_key: Option<String>,
    pub double_weight: bool,
}

impl CallClass {
    pub fn light() -> Self {
        Self::default()
    }

    pub fn heavy(resource_key: impl Into<String>) -> Self {
        Self {
            heavy: true,
            resource_key: Some(resource_key.into()),
            double_weight: false,
        }
    }

    /// Heavy call that doesn't target a specific resource.
    pub fn heavy_unkeyed() -> Self {
        Self {
            heavy: true,
            resource_key: None,
            double_weight: false,
        }
    }

    /// Counts twice in the rolling window (e.g. bid/ask requests).
    pub fn double_weight(mut self) -> Self {
        self.double_weight = true;
        self
    }

    pub fn weight(&self) -> u32 {
        if self.double_weight { 2 } else { 1 }
    }

    pub(crate) fn heavy_key(&self) -> Option<&str> {
        if !self.heavy {
            return None;
        }
        self.resource_key.as_deref()
    }
}

/// Builds a resource key from the parts that identify one data request,
/// e.g. `resource_key(["AAPL", "1 min", "TRADES"])`.
pub fn resource_key<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().collect::<Vec<_>>().join("|")
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
