//! Cross-module tests: router round-trips over real sockets and
//! end-to-end scenarios on an in-process network.

mod router;
mod scenarios;
