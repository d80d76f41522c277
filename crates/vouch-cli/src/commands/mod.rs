//! CLI subcommands.

#[expect(
    unreachable_pub,
    reason = "binary crate: pub inside private module is fine"
)]
pub mod run;
#[expect(
    unreachable_pub,
    reason = "binary crate: pub inside private module is fine"
)]
pub mod sign;
#[expect(
    unreachable_pub,
    reason = "binary crate: pub inside private module is fine"
)]
pub mod verify;
