//! Chat command ingestion: classification (§4.4) and cross-replica,
//! per-room-ordered dispatch (§4.5).

pub mod router;
pub mod serializer;

pub use router::CommandRouter;
pub use serializer::RoomSerializer;
