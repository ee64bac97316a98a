//! Building blocks for [`clap`]-driven configuration of partitioned queries.

pub mod partitioned_query;
