//! Command-line interface of the `rp` binary

mod args;

pub use args::Args;
