pub mod bpf;
pub mod capture;
pub mod cli;
pub mod error;
pub mod filter;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod signal;
