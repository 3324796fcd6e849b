/// Load-time constants of the pipeline.
///
/// These are fixed for the lifetime of a [`crate::Usm`] instance, the same
/// way constants patched into a program at load time are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Emit batch pages on the shared ring buffer instead of the per-CPU
    /// perf buffer.
    pub use_ring_buffer: bool,
    /// Master switch for HTTP/2 decoding and its batch flusher.
    pub http2_monitoring_enabled: bool,
    /// Highest Kafka API key the classifier accepts.
    pub kafka_max_api_key: u16,
    /// Highest Kafka API version the classifier accepts.
    pub kafka_max_api_version: u16,
    /// First port of the ephemeral range, used to orient tuples.
    pub ephemeral_port_start: u16,
    pub maps: MapCapacities,
}

/// Maximum entries of each shared map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCapacities {
    pub classification: usize,
    pub tcp_seq: usize,
    pub http2_dynamic_table: usize,
    pub http2_dynamic_counters: usize,
    pub http2_in_flight: usize,
    pub http2_remainders: usize,
}

impl Default for MapCapacities {
    fn default() -> Self {
        MapCapacities {
            classification: 65536,
            tcp_seq: 65536,
            http2_dynamic_table: 32768,
            http2_dynamic_counters: 8192,
            http2_in_flight: 8192,
            http2_remainders: 8192,
        }
    }
}

pub const KAFKA_MAX_SUPPORTED_API_KEY: u16 = 68;
pub const KAFKA_MAX_SUPPORTED_API_VERSION: u16 = 13;
pub const EPHEMERAL_PORT_START: u16 = 32768;

impl Default for Config {
    fn default() -> Self {
        Config {
            use_ring_buffer: true,
            http2_monitoring_enabled: true,
            kafka_max_api_key: KAFKA_MAX_SUPPORTED_API_KEY,
            kafka_max_api_version: KAFKA_MAX_SUPPORTED_API_VERSION,
            ephemeral_port_start: EPHEMERAL_PORT_START,
            maps: MapCapacities::default(),
        }
    }
}
