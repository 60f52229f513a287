pub mod arbiter;
pub mod bound;
pub mod cache;
pub mod callback;
pub mod constraint;
pub mod create;
pub mod filter;
pub mod hash;
pub mod lock;
pub mod map;
pub mod router;
pub mod spawner;
pub mod worker;
