pub mod blocks;
pub mod champ;
pub mod commit;
pub mod compare;
pub mod config;
pub mod driver;
pub mod manifest;
pub mod pipeline;
pub mod queue;
pub mod resume;
pub mod scan;
pub mod stats;
pub mod store;
pub mod termination;
pub mod transport;

pub use driver::Phase2Session;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
