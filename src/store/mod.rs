pub mod durable;
pub mod keyed;

pub use durable::DurableStore;
pub use keyed::KeyedStore;
