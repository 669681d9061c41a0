//! Status - entity ごとの indexing status state machine

mod machine;

pub use self::machine::{EntityStatusMachine, RetryOutcome};
