/// Contains the namespace-bound client driving the helm binary.
pub(crate) mod client;

/// Contains the release projection types and helm output schemas.
pub(crate) mod types;
