pub mod connection;
pub mod engine;
pub mod payload;
pub mod reassembly;
pub mod registry;
pub mod stats;
pub mod undelivered;

/// User identifier carried in the `?id=` query parameter and the message
/// envelope. `0` is reserved and means "no user / bot sink".
pub type UserId = u64;

/// Process-wide unique connection identifier allocated by the transport.
pub type ConnectionId = u64;

/// Application close codes, private 4xxx range.
pub const CLOSE_UNAUTHORIZED: u16 = 4000;
pub const CLOSE_INVALID_QUERY_PARAMS: u16 = 4001;
pub const CLOSE_INVALID_MESSAGE_PAYLOAD: u16 = 4002;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 4003;
pub const CLOSE_INACTIVE_CONNECTION: u16 = 4004;
