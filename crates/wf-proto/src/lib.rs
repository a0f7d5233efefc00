//! Wire types and typed clients for the daemon's `watchfire` gRPC package,
//! generated from `proto/watchfire/*.proto`. Only the services this shell
//! talks to are declared there.

pub mod watchfire;
