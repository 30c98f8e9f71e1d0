use async_trait::async_trait;

/// Payload published on a key's channel when the work guarding that key
/// completes. Waiters ignore messages carrying anything else.
pub const DONE: &str = "ok";

/// A live subscription to one channel.
///
/// Dropping the subscription closes it; backends release any resources
/// (forwarding tasks, server-side subscriber state) tied to it.
#[async_trait]
pub trait Subscription: Send {
    /// Next message on the channel, or `None` once the subscription is
    /// closed. Slow subscribers may observe gaps; pub/sub is an
    /// acceleration, never a correctness requirement.
    async fn recv(&mut self) -> Option<String>;
}
