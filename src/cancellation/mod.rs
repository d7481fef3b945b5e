pub mod coordinator;
pub mod token;

pub use coordinator::CancellationCoordinator;
pub use token::CancellationToken;
