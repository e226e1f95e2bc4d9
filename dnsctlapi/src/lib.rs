pub mod rpc;
mod schema;

pub use schema::*;
