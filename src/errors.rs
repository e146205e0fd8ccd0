use thiserror::Error;

// The errors that callers are expected to branch on. Everything else in this
// crate just travels as anyhow context.
#[derive(Error, Debug)]
pub enum TraversalError {
    // The restriction (or an intersection of restrictions) selects nothing.
    // This is a user configuration error and maps to exit code 2.
    #[error("empty Cartesian product for restriction:\n{restriction}")]
    EmptyProduct { restriction: String },

    // A composite object join came up empty on a pre-selected component.
    // Recoverable per-worker unless the node requires existence.
    #[error("no valid variants composing {suffix} under restriction {restriction:?}")]
    IncompatibleRestriction { suffix: String, restriction: String },

    // Reached the install-from-scratch node of a permanent object without
    // create_permanent_vm=yes. Clobbering user state is not an option.
    #[error("reached a permanent object root for {suffix} due to incorrect setup")]
    PermanentRootMisconfigured { suffix: String },

    // The traverse path contains two nodes with no edge between them. This is
    // a bug in the scheduler, not in anyone's configuration.
    #[error("discontinuous path in the test dependency graph detected at {at}")]
    DiscontinuousPath { at: String },

    // A worker spent longer than the maximum test duration bouncing off nodes
    // occupied by other workers.
    #[error("worker {worker} spent {waited:.2}s waiting for occupied nodes of maximum test duration {timeout:.2}s: {nodes}")]
    StuckOnOccupied {
        worker: String,
        waited: f64,
        timeout: f64,
        nodes: String,
    },
}

impl TraversalError {
    // Exit code this error should produce at the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::EmptyProduct { .. } | Self::IncompatibleRestriction { .. } => 2,
            _ => 1,
        }
    }
}
