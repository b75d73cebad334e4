//! Space partitioning used to train quantizers.

pub mod kmeans;

pub use kmeans::KMeans;
