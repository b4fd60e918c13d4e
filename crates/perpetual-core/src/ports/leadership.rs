//! Leadership port: is this process the primary replica?

use std::sync::atomic::{AtomicBool, Ordering};

pub trait Leadership: Send + Sync {
    fn is_primary(&self) -> bool;
}

/// Single-replica deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPrimary;

impl Leadership for AlwaysPrimary {
    fn is_primary(&self) -> bool {
        true
    }
}

/// Flag flipped by whatever runs the election.
#[derive(Debug, Default)]
pub struct LeadershipFlag {
    primary: AtomicBool,
}

impl LeadershipFlag {
    pub fn new(primary: bool) -> Self {
        Self {
            primary: AtomicBool::new(primary),
        }
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }
}

impl Leadership for LeadershipFlag {
    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }
}
