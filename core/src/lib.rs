//! stockpost-core: postprocessing for commercial-building stock
//! simulations. Apportions simulated buildings onto a truth inventory,
//! derives analysis columns, and exports weighted, partitioned results.

pub mod error;
pub mod types;
pub mod rng;
pub mod units;
pub mod naming;
pub mod columns;
pub mod lookups;
pub mod column_registry;
pub mod kernel;
pub mod segments;
pub mod config;
pub mod ingest_stage;
pub mod derivation_stage;
pub mod apportionment_stage;
pub mod rescale_stage;
pub mod geo_stage;
pub mod utility_bill_stage;
pub mod export_stage;
pub mod dictionary;
pub mod event;
pub mod store;
pub mod engine;
