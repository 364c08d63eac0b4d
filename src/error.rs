//! Dispatcher error types.
//!
//! Only construction-time problems surface to the caller; everything that
//! happens on the data path is handled locally and logged (a flow sees a TCP
//! RST or a silent drop instead of an error value).

use thiserror::Error;

use crate::stack::StackError;

#[derive(Debug, Error)]
pub enum Error {
    /// The embedded TCP/IP stack rejected part of its initial configuration
    /// (SACK, NIC creation, routes). Fatal: the dispatcher cannot run on a
    /// half-configured stack.
    #[error("stack configuration failed: {0}")]
    StackSetup(#[from] StackError),

    /// `start` was called twice; the stack's outbound channel has already
    /// been claimed by the first outbound pump.
    #[error("dispatcher already started")]
    AlreadyStarted,
}
