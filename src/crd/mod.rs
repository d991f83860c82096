mod mongo_cluster;
mod records;

pub use mongo_cluster::*;
pub use records::*;
