// Kernel - core infrastructure with dependency injection
//
// The ServerKernel holds the server's concrete infrastructure (database pool,
// notification bus) and is passed to domain adapters through a dependency record.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domain layers.

pub mod server_kernel;
pub mod stream_hub;

pub use server_kernel::ServerKernel;
pub use stream_hub::StreamHub;
