pub mod cancel;
pub mod chat;
pub mod health;
pub mod order;
pub mod session;

pub use cancel::cancel;
pub use chat::process;
pub use health::health;
pub use order::{confirm, submit_otp};
pub use session::get_session;
