// Shared pieces of the courier edge binaries.
pub mod cli;
pub mod observability;
