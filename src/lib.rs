pub mod config;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod merge;
pub mod output;
pub mod parser;
pub mod sink;
pub mod snapshot;
pub mod stats;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
