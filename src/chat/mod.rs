pub mod clock;
pub mod codec;
pub mod dispatcher;
pub mod election;
pub mod message;
pub mod registry;
pub mod replication;
pub mod server;
