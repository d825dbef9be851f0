//! hoare provides a Hoare/Brinch Hansen style monitor with an explicit `accept` primitive.
//!
//! A [Monitor] owns some state and a statically declared set of guarded operations.  Every call
//! through [Monitor::call] runs under an entry/exit protocol that guarantees at most one guarded
//! body executes at a time.  From inside a body, [Guarded::accept] restricts which operations may
//! run next and parks the caller until one of them completes.  Accepts nest; the innermost one is
//! always resolved first.
//!
//! ```
//! use hoare::Monitor;
//!
//! let monitor = Monitor::new(0u64, &["increment", "read"]).unwrap();
//! monitor.call("increment", |count| **count += 1).unwrap();
//! assert_eq!(1, monitor.call("read", |count| **count).unwrap());
//! ```

pub mod condition_stack;
pub mod monitor;
pub mod wait_queue;

pub use monitor::{Guarded, Monitor};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Register the biometrics for every module of this crate.
pub fn register_biometrics(collector: &biometrics::Collector) {
    condition_stack::register_biometrics(collector);
    wait_queue::register_biometrics(collector);
    monitor::register_biometrics(collector);
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// Usage errors.  Every error is detected before the monitor's bookkeeping is touched.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The named operation was not declared when the monitor was constructed.
    UndeclaredOperation { name: String },
    /// The same operation was declared twice.
    DuplicateOperation { name: String },
    /// `accept` was called with no operations, which no call could ever satisfy.
    EmptyAccept,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UndeclaredOperation { name } => {
                write!(f, "operation {name:?} is not a guarded operation of this monitor")
            }
            Error::DuplicateOperation { name } => {
                write!(f, "operation {name:?} declared more than once")
            }
            Error::EmptyAccept => write!(f, "accept requires at least one operation"),
        }
    }
}

impl std::error::Error for Error {}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "operation \"pop\" is not a guarded operation of this monitor",
            Error::UndeclaredOperation {
                name: "pop".to_string()
            }
            .to_string()
        );
        assert_eq!(
            "operation \"push\" declared more than once",
            Error::DuplicateOperation {
                name: "push".to_string()
            }
            .to_string()
        );
        assert_eq!(
            "accept requires at least one operation",
            Error::EmptyAccept.to_string()
        );
    }

    #[test]
    fn register_everything() {
        let collector = biometrics::Collector::new();
        register_biometrics(&collector);
    }
}
