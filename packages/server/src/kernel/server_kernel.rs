// ServerKernel - infrastructure shared across domain adapters.
//
// Holds the handles each capability adapter needs to talk to concrete
// infrastructure. Constructed once at startup and passed around as an
// `Arc`, never reached for through a global.

use sqlx::PgPool;

use super::stream_hub::StreamHub;

pub struct ServerKernel {
    pub db_pool: PgPool,
    pub stream_hub: StreamHub,
}

impl ServerKernel {
    pub fn new(db_pool: PgPool, stream_hub: StreamHub) -> Self {
        Self {
            db_pool,
            stream_hub,
        }
    }
}
