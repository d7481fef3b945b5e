use std::collections::HashSet;
use std::fmt;

// -----------------------------------------------------------------------------
// ----- ConnectionIdentity ----------------------------------------------------

/// Client id a session announces to the gateway. The gateway rejects a
/// second session with an id that is already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionIdentity(u32);

impl ConnectionIdentity {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// -----------------------------------------------------------------------------
// ----- IdentityAllocator -----------------------------------------------------

/// Hands out identities from `[base, base + span)` in increasing order,
/// wrapping around and skipping ids that are still reserved. An id becomes
/// available again only once it is released.
#[derive(Debug, Clone)]
pub struct IdentityAllocator {
    base: u32,
    span: u32,
    cursor: u32,
    reserved: HashSet<ConnectionIdentity>,
}

impl IdentityAllocator {
    pub fn new(base: u32, span: u32) -> Self {
        Self {
            base,
            span: span.max(1),
            cursor: 0,
            reserved: HashSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<ConnectionIdentity> {
        for step in 0..self.span {
            let offset = (self.cursor + step) % self.span;
            let identity = ConnectionIdentity(self.base.saturating_add(offset));

            if self.reserved.insert(identity) {
                self.cursor = (offset + 1) % self.span;
                return Some(identity);
            }
        }

        None
    }

    pub fn release(&mut self, identity: ConnectionIdentity) {
        self.reserved.remove(&identity);
    }

    pub fn reserved(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_reserved(&self, identity: ConnectionIdentity) -> bool {
        self.reserved.contains(&identity)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
