pub mod backoff;
pub mod batch;
pub mod disk;
pub mod ledger;
pub mod orchestrator;
pub mod paths;
pub mod relay;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;
