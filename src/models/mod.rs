//! Domain models shared by the aggregator, poller, calendar projector and
//! the read-only views.

pub mod calendar;
pub mod snapshot;

pub use self::calendar::*;
pub use self::snapshot::*;
